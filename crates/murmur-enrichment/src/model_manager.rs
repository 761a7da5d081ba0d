//! Model availability bookkeeping for LLM-backed handlers.
//!
//! The LLM adapter keeps resident models hot, so "ensure warm" reduces to
//! verifying the model exists and tracking which one the worker last used.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use murmur_core::error::Result;
use murmur_providers::LlmClient;

pub struct ModelManager {
    llm: Arc<dyn LlmClient>,
    current: Mutex<Option<String>>,
}

impl ModelManager {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            current: Mutex::new(None),
        }
    }

    /// Verify `model_id` is available, tracking it as current. Returns
    /// `false` when the adapter does not list the model.
    pub async fn ensure_loaded(&self, model_id: &str) -> Result<bool> {
        let mut current = self.current.lock().await;
        if current.as_deref() == Some(model_id) {
            return Ok(true);
        }

        info!(model_id, "Switching enrichment model");
        let models = self.llm.list_models().await?;
        if !models.iter().any(|m| m == model_id) {
            error!(model_id, available = ?models, "Model not available");
            return Ok(false);
        }

        *current = Some(model_id.to_string());
        Ok(true)
    }

    pub async fn unload(&self) {
        let mut current = self.current.lock().await;
        if let Some(model) = current.take() {
            info!(model, "Released enrichment model tracking");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use murmur_providers::GenerateOptions;

    struct FixedModels(Vec<String>);

    #[async_trait]
    impl LlmClient for FixedModels {
        async fn generate(
            &self,
            _model: &str,
            _prompt: &str,
            _options: GenerateOptions,
        ) -> Result<String> {
            Ok(String::new())
        }

        async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![])
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }

        async fn health(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_ensure_loaded_checks_listing() {
        let manager = ModelManager::new(Arc::new(FixedModels(vec!["phi3:mini".into()])));
        assert!(manager.ensure_loaded("phi3:mini").await.unwrap());
        // second call short-circuits on the tracked model
        assert!(manager.ensure_loaded("phi3:mini").await.unwrap());
        assert!(!manager.ensure_loaded("missing:model").await.unwrap());
    }

    #[tokio::test]
    async fn test_unload_resets_tracking() {
        let manager = ModelManager::new(Arc::new(FixedModels(vec!["phi3:mini".into()])));
        assert!(manager.ensure_loaded("phi3:mini").await.unwrap());
        manager.unload().await;
        assert!(manager.ensure_loaded("phi3:mini").await.unwrap());
    }
}
