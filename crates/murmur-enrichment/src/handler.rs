//! Handler contract for enrichment tasks.

use async_trait::async_trait;
use uuid::Uuid;

use murmur_core::error::Result;
use murmur_core::types::TargetType;

/// One claimed task handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskItem {
    pub task_id: Uuid,
    pub target_type: TargetType,
    pub target_id: String,
}

/// Per-item outcome. `results[i]` corresponds to `items[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    Complete,
    Failed(String),
}

/// An enrichment handler. Handlers must be idempotent (re-running on the
/// same target yields the same enrichment) and order-independent within a
/// batch.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type this handler consumes (e.g. `"alias_detection"`).
    fn task_type(&self) -> &'static str;

    /// Target kinds the handler accepts.
    fn target_types(&self) -> &'static [TargetType];

    /// Model the handler needs warm, if LLM-backed.
    fn model_id(&self) -> Option<&str> {
        None
    }

    /// Preferred batch size.
    fn batch_size(&self) -> usize {
        10
    }

    /// Process a batch. An `Err` fails the whole batch; per-item problems
    /// belong in the returned vector.
    async fn process(&self, items: &[TaskItem]) -> Result<Vec<ItemResult>>;
}
