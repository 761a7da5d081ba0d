//! Vector store seam: a small fixed capability set with a Qdrant REST
//! implementation and an in-memory store for tests.
//!
//! Qdrant is driven over its HTTP API with typed request/response structs,
//! the same way every other external service is reached. Transient
//! failures are retried with bounded backoff before surfacing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use murmur_core::config::QdrantConfig;
use murmur_core::error::{MurmurError, Result};

/// A stored point: id, embedding, JSON payload.
#[derive(Debug, Clone)]
pub struct PointRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub point: PointRecord,
    pub score: f32,
}

/// Exact-match payload filter. Keys may be dotted paths into nested
/// payload objects (e.g. `enrichment_status.alias_detection`).
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub must: Vec<(String, Value)>,
}

impl PayloadFilter {
    pub fn matching(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            must: vec![(key.into(), value.into())],
        }
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if absent; cosine distance.
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()>;

    async fn upsert(&self, collection: &str, point: PointRecord) -> Result<()>;

    async fn retrieve(&self, collection: &str, ids: &[String]) -> Result<Vec<PointRecord>>;

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>>;

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<PointRecord>>;
}

// --- Qdrant over HTTP ---

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct QdrantEnvelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct QdrantPoint {
    id: Value,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    #[serde(default)]
    points: Vec<QdrantPoint>,
}

pub struct QdrantHttp {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl QdrantHttp {
    pub fn new(config: &QdrantConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.resolve_api_key(),
            timeout: Duration::from_secs(config.request_timeout_sec),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    /// Send with bounded retry on transport errors and 5xx responses.
    async fn send_retrying(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut delay = RETRY_BASE_DELAY;
        let mut last_err: Option<MurmurError> = None;

        for attempt in 1..=RETRY_ATTEMPTS {
            match build().send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    let status = resp.status();
                    warn!(%status, attempt, "Qdrant server error, retrying");
                    last_err = Some(MurmurError::VectorStore(format!("server error {status}")));
                }
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < RETRY_ATTEMPTS => {
                    warn!(error = %e, attempt, "Qdrant request failed, retrying");
                    last_err = Some(e.into());
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        Err(last_err.unwrap_or_else(|| MurmurError::VectorStore("retries exhausted".into())))
    }

    async fn check(resp: reqwest::Response, context: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(MurmurError::VectorStore(format!(
                "{context}: {status}: {body}"
            )))
        }
    }

    fn filter_json(filter: Option<&PayloadFilter>) -> Option<Value> {
        let filter = filter?;
        if filter.must.is_empty() {
            return None;
        }
        let conditions: Vec<Value> = filter
            .must
            .iter()
            .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
            .collect();
        Some(json!({ "must": conditions }))
    }
}

fn point_id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_record(p: QdrantPoint) -> PointRecord {
    PointRecord {
        id: point_id_string(&p.id),
        vector: p.vector.unwrap_or_default(),
        payload: p.payload,
    }
}

#[async_trait]
impl VectorStore for QdrantHttp {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let exists = self
            .send_retrying(|| self.request(reqwest::Method::GET, &format!("/collections/{name}")))
            .await?;
        if exists.status().is_success() {
            debug!(collection = name, "Collection already exists");
            return Ok(());
        }

        let body = json!({
            "vectors": { "size": dimension, "distance": "Cosine" }
        });
        let resp = self
            .send_retrying(|| {
                self.request(reqwest::Method::PUT, &format!("/collections/{name}"))
                    .json(&body)
            })
            .await?;
        Self::check(resp, "create collection").await?;
        info!(collection = name, dimension, "Created vector collection");
        Ok(())
    }

    async fn upsert(&self, collection: &str, point: PointRecord) -> Result<()> {
        let body = json!({
            "points": [{
                "id": point.id,
                "vector": point.vector,
                "payload": point.payload,
            }]
        });
        let resp = self
            .send_retrying(|| {
                self.request(
                    reqwest::Method::PUT,
                    &format!("/collections/{collection}/points?wait=true"),
                )
                .json(&body)
            })
            .await?;
        Self::check(resp, "upsert point").await?;
        Ok(())
    }

    async fn retrieve(&self, collection: &str, ids: &[String]) -> Result<Vec<PointRecord>> {
        let body = json!({
            "ids": ids,
            "with_payload": true,
            "with_vector": true,
        });
        let resp = self
            .send_retrying(|| {
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection}/points"),
                )
                .json(&body)
            })
            .await?;
        let resp = Self::check(resp, "retrieve points").await?;
        let envelope: QdrantEnvelope<Vec<QdrantPoint>> = resp.json().await?;
        Ok(envelope.result.into_iter().map(to_record).collect())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
            "with_vector": true,
        });
        if let Some(f) = Self::filter_json(filter) {
            body["filter"] = f;
        }

        let resp = self
            .send_retrying(|| {
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection}/points/search"),
                )
                .json(&body)
            })
            .await?;
        let resp = Self::check(resp, "search points").await?;
        let envelope: QdrantEnvelope<Vec<QdrantPoint>> = resp.json().await?;
        Ok(envelope
            .result
            .into_iter()
            .map(|p| {
                let score = p.score.unwrap_or(0.0);
                ScoredPoint {
                    point: to_record(p),
                    score,
                }
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<PointRecord>> {
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
            "with_vector": true,
        });
        if let Some(f) = Self::filter_json(filter) {
            body["filter"] = f;
        }

        let resp = self
            .send_retrying(|| {
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection}/points/scroll"),
                )
                .json(&body)
            })
            .await?;
        let resp = Self::check(resp, "scroll points").await?;
        let envelope: QdrantEnvelope<ScrollResult> = resp.json().await?;
        Ok(envelope.result.points.into_iter().map(to_record).collect())
    }
}

// --- In-memory store for tests and offline runs ---

#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, HashMap<String, PointRecord>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = payload;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn matches(payload: &Value, filter: Option<&PayloadFilter>) -> bool {
        let Some(filter) = filter else { return true };
        filter
            .must
            .iter()
            .all(|(key, value)| Self::lookup_path(payload, key) == Some(value))
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        if a.is_empty() || a.len() != b.len() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, _dimension: usize) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert(&self, collection: &str, point: PointRecord) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(point.id.clone(), point);
        Ok(())
    }

    async fn retrieve(&self, collection: &str, ids: &[String]) -> Result<Vec<PointRecord>> {
        let collections = self.collections.read().await;
        let Some(points) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| points.get(id).cloned()).collect())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().await;
        let Some(points) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<ScoredPoint> = points
            .values()
            .filter(|p| Self::matches(&p.payload, filter))
            .map(|p| ScoredPoint {
                score: Self::cosine(vector, &p.vector),
                point: p.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<PointRecord>> {
        let collections = self.collections.read().await;
        let Some(points) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<PointRecord> = points
            .values()
            .filter(|p| Self::matches(&p.payload, filter))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, vector: Vec<f32>, payload: Value) -> PointRecord {
        PointRecord {
            id: id.into(),
            vector,
            payload,
        }
    }

    #[tokio::test]
    async fn test_memory_upsert_and_retrieve() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("ideas", 3).await.unwrap();
        store
            .upsert("ideas", point("a", vec![1.0, 0.0, 0.0], json!({"x": 1})))
            .await
            .unwrap();

        let got = store.retrieve("ideas", &["a".into()]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload["x"], 1);

        // overwrite
        store
            .upsert("ideas", point("a", vec![0.0, 1.0, 0.0], json!({"x": 2})))
            .await
            .unwrap();
        let got = store.retrieve("ideas", &["a".into()]).await.unwrap();
        assert_eq!(got[0].payload["x"], 2);
    }

    #[tokio::test]
    async fn test_memory_search_orders_by_cosine() {
        let store = MemoryVectorStore::new();
        store
            .upsert("c", point("near", vec![1.0, 0.1], json!({})))
            .await
            .unwrap();
        store
            .upsert("c", point("far", vec![-1.0, 0.0], json!({})))
            .await
            .unwrap();

        let hits = store.search("c", &[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits[0].point.id, "near");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_memory_filter_with_dotted_path() {
        let store = MemoryVectorStore::new();
        store
            .upsert(
                "c",
                point(
                    "a",
                    vec![1.0],
                    json!({"enrichment_status": {"alias_detection": "pending"}, "session_id": "s1"}),
                ),
            )
            .await
            .unwrap();
        store
            .upsert(
                "c",
                point(
                    "b",
                    vec![1.0],
                    json!({"enrichment_status": {"alias_detection": "complete"}, "session_id": "s1"}),
                ),
            )
            .await
            .unwrap();

        let filter = PayloadFilter::matching("enrichment_status.alias_detection", "pending")
            .and("session_id", "s1");
        let hits = store.scroll("c", Some(&filter), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn test_qdrant_filter_json_shape() {
        let filter = PayloadFilter::matching("session_id", "s1");
        let json = QdrantHttp::filter_json(Some(&filter)).unwrap();
        assert_eq!(json["must"][0]["key"], "session_id");
        assert_eq!(json["must"][0]["match"]["value"], "s1");
        assert!(QdrantHttp::filter_json(None).is_none());
    }

    #[test]
    fn test_point_id_string_accepts_numeric_ids() {
        assert_eq!(point_id_string(&json!("abc")), "abc");
        assert_eq!(point_id_string(&json!(42)), "42");
    }
}
