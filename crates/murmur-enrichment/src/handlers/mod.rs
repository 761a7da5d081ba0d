//! Built-in enrichment handlers.
//!
//! Three rule-based (alias detection, prosody interpretation, response
//! mapping) and one LLM-backed (intent/keywords). Each handler writes its
//! enrichment fields and flips the matching `enrichment_status` entry in
//! the same point upsert.

pub mod alias_detection;
pub mod intent_keywords;
pub mod prosody;
pub mod response_mapping;

pub use alias_detection::AliasDetectionHandler;
pub use intent_keywords::IntentKeywordsHandler;
pub use prosody::ProsodyInterpretationHandler;
pub use response_mapping::ResponseMappingHandler;
