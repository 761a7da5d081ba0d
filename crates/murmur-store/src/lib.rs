//! Persistence for the pipeline.
//!
//! The relational side (sqlx/SQLite) owns sessions, participants,
//! utterances, messages, speaker aliases, and the enrichment queue. The
//! vector side owns ideas and exchanges. The two are linked only by opaque
//! ids; no foreign keys cross the boundary.

pub mod aliases;
pub mod db;
pub mod exchanges;
pub mod ideas;
pub mod messages;
pub mod queue;
pub mod sessions;
pub mod utterance_index;
pub mod utterances;
pub mod vector;
