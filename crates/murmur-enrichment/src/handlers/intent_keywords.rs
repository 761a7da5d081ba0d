//! Intent and keyword extraction through the LLM adapter.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use murmur_core::error::Result;
use murmur_core::types::{task_types, EnrichmentState, TargetType};
use murmur_providers::{GenerateOptions, LlmClient};
use murmur_store::ideas::IdeaRepository;

use crate::handler::{ItemResult, TaskHandler, TaskItem};

const MAX_KEYWORDS: usize = 5;
const TEMPERATURE: f64 = 0.3;

pub struct IntentKeywordsHandler {
    ideas: Arc<IdeaRepository>,
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl IntentKeywordsHandler {
    pub fn new(ideas: Arc<IdeaRepository>, llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            ideas,
            llm,
            model: model.into(),
        }
    }

    fn prompt(text: &str) -> String {
        format!(
            r#"Analyze this conversation snippet and extract:
1. The primary INTENT (what the speaker is trying to do - e.g., "asking question", "making statement", "giving instruction", "expressing emotion")
2. Key KEYWORDS (important nouns, verbs, topics - max 5)

Text: "{text}"

Respond in this exact format:
INTENT: <one short phrase>
KEYWORDS: <comma-separated list>"#
        )
    }

    /// Parse by line prefix. Malformed output degrades to
    /// `("unknown", [])` rather than failing the task.
    fn parse_response(response: &str) -> (String, Vec<String>) {
        let mut intent = "unknown".to_string();
        let mut keywords = Vec::new();

        for line in response.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("INTENT:") {
                let rest = rest.trim();
                if !rest.is_empty() {
                    intent = rest.to_string();
                }
            } else if let Some(rest) = line.strip_prefix("KEYWORDS:") {
                keywords = rest
                    .split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .take(MAX_KEYWORDS)
                    .collect();
            }
        }
        (intent, keywords)
    }
}

#[async_trait]
impl TaskHandler for IntentKeywordsHandler {
    fn task_type(&self) -> &'static str {
        task_types::INTENT_KEYWORDS
    }

    fn target_types(&self) -> &'static [TargetType] {
        &[TargetType::Idea]
    }

    fn model_id(&self) -> Option<&str> {
        Some(&self.model)
    }

    async fn process(&self, items: &[TaskItem]) -> Result<Vec<ItemResult>> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let idea = match self.ideas.get(&item.target_id).await {
                Ok(Some(idea)) => idea,
                Ok(None) => {
                    results.push(ItemResult::Failed("Idea not found".into()));
                    continue;
                }
                Err(e) => {
                    results.push(ItemResult::Failed(e.to_string()));
                    continue;
                }
            };

            let response = match self
                .llm
                .generate(
                    &self.model,
                    &Self::prompt(&idea.payload.text),
                    GenerateOptions {
                        temperature: TEMPERATURE,
                        ..GenerateOptions::default()
                    },
                )
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(idea_id = %item.target_id, error = %e, "LLM generate failed");
                    results.push(ItemResult::Failed(e.to_string()));
                    continue;
                }
            };

            let (intent, keywords) = Self::parse_response(&response);
            info!(
                idea_id = %item.target_id,
                intent = %intent,
                keywords = keywords.len(),
                "Extracted intent and keywords"
            );

            let updated = self
                .ideas
                .update_enrichments(&item.target_id, |payload| {
                    payload.intent = Some(intent);
                    payload.keywords = Some(keywords);
                    payload.enrichment_status.insert(
                        task_types::INTENT_KEYWORDS.into(),
                        EnrichmentState::Complete,
                    );
                })
                .await;

            results.push(match updated {
                Ok(true) => ItemResult::Complete,
                Ok(false) => ItemResult::Failed("Failed to update idea".into()),
                Err(e) => ItemResult::Failed(e.to_string()),
            });
        }
        Ok(results)
    }
}
