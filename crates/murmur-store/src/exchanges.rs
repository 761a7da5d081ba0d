//! Exchange repository over the vector store.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_core::error::{MurmurError, Result};
use murmur_core::types::{Exchange, ExchangePayload};
use murmur_providers::EmbeddingProvider;

use crate::vector::{PayloadFilter, PointRecord, VectorStore};

pub struct ExchangeRepository {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
}

impl ExchangeRepository {
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

    /// Embed the joined text and store a new exchange, returning its id.
    pub async fn create(&self, payload: ExchangePayload) -> Result<String> {
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
            exchange_id = %id,
            ideas = payload.idea_ids.len(),
            participants = payload.participant_user_ids.len(),
            kind = ?payload.kind,
            "Created exchange"
        );
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Exchange>> {
        let points = self
            .store
            .retrieve(&self.collection, &[id.to_string()])
            .await?;
        points
            .into_iter()
            .next()
            .map(exchange_from_point)
            .transpose()
    }

    /// Read-modify-write enrichment fields as a single point upsert.
    pub async fn update_enrichments<F>(&self, id: &str, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut ExchangePayload) + Send,
    {
        let Some(exchange) = self.get(id).await? else {
            return Ok(false);
        };

        let mut payload = exchange.payload;
        mutate(&mut payload);

        self.store
            .upsert(
                &self.collection,
                PointRecord {
                    id: id.to_string(),
                    vector: exchange.vector,
                    payload: serde_json::to_value(&payload)?,
                },
            )
            .await?;
        debug!(exchange_id = %id, "Updated exchange enrichments");
        Ok(true)
    }

    pub async fn by_session(&self, session_id: &str, limit: usize) -> Result<Vec<Exchange>> {
        let filter = PayloadFilter::matching("session_id", json!(session_id));
        let points = self
            .store
            .scroll(&self.collection, Some(&filter), limit)
            .await?;
        points.into_iter().map(exchange_from_point).collect()
    }

    /// Semantic search over exchanges.
    pub async fn search_similar(
        &self,
        query_text: &str,
        limit: usize,
        session_id: Option<&str>,
    ) -> Result<Vec<(Exchange, f32)>> {
        let vector = self.embedder.embed(query_text).await?;
        let filter = session_id.map(|sid| PayloadFilter::matching("session_id", sid));

        let hits = self
            .store
            .search(&self.collection, &vector, limit, filter.as_ref())
            .await?;
        hits.into_iter()
            .map(|hit| exchange_from_point(hit.point).map(|x| (x, hit.score)))
            .collect()
    }
}

fn exchange_from_point(point: PointRecord) -> Result<Exchange> {
    let payload: ExchangePayload = serde_json::from_value(point.payload)
        .map_err(|e| MurmurError::VectorStore(format!("bad exchange payload {}: {e}", point.id)))?;
    Ok(Exchange {
        id: point.id,
        vector: point.vector,
        payload,
    })
}
