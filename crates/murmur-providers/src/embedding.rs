//! Embedding provider backed by an Ollama embedding model.

use std::sync::Arc;

use async_trait::async_trait;

use murmur_core::error::{MurmurError, Result};

use crate::{EmbeddingProvider, LlmClient};

/// Embeds text through the configured Ollama embedding model. The declared
/// dimension must match the model (e.g. 768 for nomic-embed-text); a
/// mismatched vector is rejected rather than silently stored.
pub struct OllamaEmbeddings {
    client: Arc<dyn LlmClient>,
    model: String,
    dimension: usize,
}

impl OllamaEmbeddings {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client,
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.client.embed(&self.model, text).await?;
        if vector.len() != self.dimension {
            return Err(MurmurError::Provider(format!(
                "embedding dimension mismatch: model {} returned {}, expected {}",
                self.model,
                vector.len(),
                self.dimension
            )));
        }
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GenerateOptions;

    struct FixedEmbedder(usize);

    #[async_trait]
    impl LlmClient for FixedEmbedder {
        async fn generate(
            &self,
            _model: &str,
            _prompt: &str,
            _options: GenerateOptions,
        ) -> Result<String> {
            Ok(String::new())
        }

        async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32; self.0])
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn health(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_embed_checks_dimension() {
        let ok = OllamaEmbeddings::new(Arc::new(FixedEmbedder(4)), "m", 4);
        assert_eq!(ok.embed("abc").await.unwrap(), vec![3.0; 4]);

        let bad = OllamaEmbeddings::new(Arc::new(FixedEmbedder(4)), "m", 8);
        assert!(bad.embed("abc").await.is_err());
    }

    #[tokio::test]
    async fn test_embed_batch_order() {
        let provider = OllamaEmbeddings::new(Arc::new(FixedEmbedder(2)), "m", 2);
        let out = provider
            .embed_batch(&["a".into(), "abcd".into()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0; 2], vec![4.0; 2]]);
    }
}
