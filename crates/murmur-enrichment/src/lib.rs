//! Background enrichment: a worker that drains the durable task queue and
//! the handlers that attach semantic attributes to ideas and exchanges.

pub mod handler;
pub mod handlers;
pub mod model_manager;
pub mod worker;
