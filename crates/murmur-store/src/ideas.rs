//! Idea repository over the vector store.
//!
//! Core fields are written once at creation; enrichment updates are
//! read-modify-write at this layer (vector stores lack field-level
//! upserts) and always land as a single point upsert, so concurrent
//! handlers writing disjoint fields stay last-writer-wins per field.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_core::error::{MurmurError, Result};
use murmur_core::types::{EnrichmentState, Idea, IdeaPayload};
use murmur_providers::EmbeddingProvider;

use crate::vector::{PayloadFilter, PointRecord, VectorStore};

pub struct IdeaRepository {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
}

impl IdeaRepository {
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

    /// Embed and store a new idea, returning its id.
    pub async fn create(&self, payload: IdeaPayload) -> Result<String> {
        let vector = self.embedder.embed(&payload.text).await?;
        let id = Uuid::new_v4().to_string();

        self.store
            .upsert(
                &self.collection,
                PointRecord {
                    id: id.clone(),
                    vector,
                    payload: serde_json::to_value(&payload)?,
                },
            )
            .await?;

        info!(
            idea_id = %id,
            utterances = payload.utterance_ids.len(),
            session_id = %payload.session_id,
            user_id = payload.user_id,
            "Created idea"
        );
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Idea>> {
        let points = self
            .store
            .retrieve(&self.collection, &[id.to_string()])
            .await?;
        points.into_iter().next().map(idea_from_point).transpose()
    }

    /// Read-modify-write an idea's enrichment fields. The mutation is
    /// applied to the typed payload and written back with the original
    /// vector in one upsert. Returns `false` when the idea is missing.
    pub async fn update_enrichments<F>(&self, id: &str, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut IdeaPayload) + Send,
    {
        let Some(idea) = self.get(id).await? else {
            return Ok(false);
        };

        let mut payload = idea.payload;
        mutate(&mut payload);

        self.store
            .upsert(
                &self.collection,
                PointRecord {
                    id: id.to_string(),
                    vector: idea.vector,
                    payload: serde_json::to_value(&payload)?,
                },
            )
            .await?;
        debug!(idea_id = %id, "Updated idea enrichments");
        Ok(true)
    }

    pub async fn by_session(&self, session_id: &str, limit: usize) -> Result<Vec<Idea>> {
        let filter = PayloadFilter::matching("session_id", session_id);
        let points = self
            .store
            .scroll(&self.collection, Some(&filter), limit)
            .await?;
        points.into_iter().map(idea_from_point).collect()
    }

    /// Ideas whose `enrichment_status[task_type]` is still pending, for
    /// reconciliation sweeps.
    pub async fn needing_enrichment(&self, task_type: &str, limit: usize) -> Result<Vec<Idea>> {
        let filter = PayloadFilter::matching(
            format!("enrichment_status.{task_type}"),
            EnrichmentState::Pending.as_value(),
        );
        let points = self
            .store
            .scroll(&self.collection, Some(&filter), limit)
            .await?;
        points.into_iter().map(idea_from_point).collect()
    }

    /// Semantic search over ideas.
    pub async fn search_similar(
        &self,
        query_text: &str,
        limit: usize,
        session_id: Option<&str>,
        user_id: Option<u64>,
    ) -> Result<Vec<(Idea, f32)>> {
        let vector = self.embedder.embed(query_text).await?;

        let mut filter = PayloadFilter::default();
        if let Some(sid) = session_id {
            filter = filter.and("session_id", sid);
        }
        if let Some(uid) = user_id {
            filter = filter.and("user_id", uid);
        }
        let filter = if filter.must.is_empty() {
            None
        } else {
            Some(filter)
        };

        let hits = self
            .store
            .search(&self.collection, &vector, limit, filter.as_ref())
            .await?;
        hits.into_iter()
            .map(|hit| idea_from_point(hit.point).map(|idea| (idea, hit.score)))
            .collect()
    }

    /// Most recent idea in the session that ended before `before`,
    /// optionally excluding one speaker. Timestamp comparison happens here
    /// because payload filters only match exact values.
    pub async fn previous_idea(
        &self,
        session_id: &str,
        before: DateTime<Utc>,
        exclude_user: Option<u64>,
    ) -> Result<Option<Idea>> {
        let ideas = self.by_session(session_id, 1000).await?;

        let mut candidates: Vec<Idea> = ideas
            .into_iter()
            .filter(|idea| idea.payload.ended_at < before)
            .filter(|idea| exclude_user != Some(idea.payload.user_id))
            .collect();

        candidates.sort_by_key(|idea| idea.payload.ended_at);
        Ok(candidates.pop())
    }
}

trait AsFilterValue {
    fn as_value(&self) -> serde_json::Value;
}

impl AsFilterValue for EnrichmentState {
    fn as_value(&self) -> serde_json::Value {
        json!(match self {
            EnrichmentState::Pending => "pending",
            EnrichmentState::Complete => "complete",
            EnrichmentState::Failed => "failed",
        })
    }
}

fn idea_from_point(point: PointRecord) -> Result<Idea> {
    let payload: IdeaPayload = serde_json::from_value(point.payload)
        .map_err(|e| MurmurError::VectorStore(format!("bad idea payload {}: {e}", point.id)))?;
    Ok(Idea {
        id: point.id,
        vector: point.vector,
        payload,
    })
}
