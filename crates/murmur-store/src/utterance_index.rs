//! Coarse semantic index over raw utterances.
//!
//! Optional: when an embedding provider is configured, every persisted
//! utterance is embedded and upserted here so transcripts are searchable
//! before boundary detection has grouped them into ideas.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use murmur_core::error::Result;
use murmur_core::types::Utterance;
use murmur_providers::EmbeddingProvider;

use crate::vector::{PayloadFilter, PointRecord, ScoredPoint, VectorStore};

pub struct UtteranceIndex {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
}

impl UtteranceIndex {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            embedder,
            collection: collection.into(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.store
            .ensure_collection(&self.collection, self.embedder.dimension())
            .await
    }

    /// Embed and index one utterance. The relational utterance id lives in
    /// the payload; the point gets its own UUID.
    pub async fn index_utterance(&self, utterance: &Utterance) -> Result<()> {
        let vector = self.embedder.embed(&utterance.text).await?;
        let payload = json!({
            "utterance_id": utterance.id,
            "session_id": utterance.session_id,
            "user_id": utterance.user_id,
            "username": utterance.username,
            "text": utterance.text,
            "started_at": utterance.started_at,
            "confidence": utterance.confidence,
        });

        self.store
            .upsert(
                &self.collection,
                PointRecord {
                    id: Uuid::new_v4().to_string(),
                    vector,
                    payload,
                },
            )
            .await?;
        debug!(utterance_id = utterance.id, "Indexed utterance embedding");
        Ok(())
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        session_id: Option<&str>,
    ) -> Result<Vec<ScoredPoint>> {
        let vector = self.embedder.embed(query).await?;
        let filter = session_id.map(|sid| PayloadFilter::matching("session_id", sid));
        self.store
            .search(&self.collection, &vector, limit, filter.as_ref())
            .await
    }
}
