//! Ollama HTTP API client — generation and embeddings for enrichment.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use murmur_core::config::OllamaConfig;
use murmur_core::error::Result;

use crate::{provider_error, GenerateOptions, LlmClient};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: ModelOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Serialize)]
struct ModelOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    generate_timeout: Duration,
    embed_timeout: Duration,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            generate_timeout: Duration::from_secs(config.generate_timeout_sec),
            embed_timeout: Duration::from_secs(config.embed_timeout_sec),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<String> {
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: ModelOptions {
                temperature: options.temperature,
            },
            format: options.format,
            system: options.system,
        };

        debug!(model, prompt_len = prompt.len(), "Ollama generate");
        let resp = self
            .client
            .post(self.url("/api/generate"))
            .timeout(self.generate_timeout)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(provider_error("ollama generate", format!("{status}: {text}")));
        }

        let parsed: GenerateResponse = resp.json().await?;
        Ok(parsed.response)
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingsRequest {
            model,
            prompt: text,
        };

        let resp = self
            .client
            .post(self.url("/api/embeddings"))
            .timeout(self.embed_timeout)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(provider_error("ollama embed", format!("{status}: {text}")));
        }

        let parsed: EmbeddingsResponse = resp.json().await?;
        Ok(parsed.embedding)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(provider_error("ollama list models", resp.status()));
        }

        let parsed: TagsResponse = resp.json().await?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    async fn health(&self) -> bool {
        match self
            .client
            .get(self.url("/api/tags"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Ollama health check failed");
                false
            }
        }
    }
}
