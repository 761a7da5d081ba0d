//! The real-time pipeline: audio frames in, utterances persisted, ideas and
//! exchanges derived and queued for enrichment.

pub mod boundary;
pub mod exchange;
pub mod session_manager;
pub mod transcription;
