//! Rule-based mention detection against the speaker alias map.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use murmur_core::error::Result;
use murmur_core::types::{task_types, EnrichmentState, Mention, TargetType};
use murmur_store::aliases::SpeakerAliasRepository;
use murmur_store::ideas::IdeaRepository;

use crate::handler::{ItemResult, TaskHandler, TaskItem};

pub struct AliasDetectionHandler {
    aliases: SpeakerAliasRepository,
    ideas: Arc<IdeaRepository>,
    word_pattern: Regex,
}

impl AliasDetectionHandler {
    pub fn new(aliases: SpeakerAliasRepository, ideas: Arc<IdeaRepository>) -> Self {
        Self {
            aliases,
            ideas,
            word_pattern: Regex::new(r"\b\w+\b").expect("static pattern"),
        }
    }

    /// Tokenise on word boundaries; each token resolving to a user other
    /// than the speaker becomes one mention, deduplicated by user.
    fn detect_mentions(
        &self,
        text: &str,
        alias_map: &HashMap<String, u64>,
        speaker_user_id: u64,
    ) -> Vec<Mention> {
        let mut mentions = Vec::new();
        let mut seen_users = HashSet::new();

        for word in self.word_pattern.find_iter(&text.to_lowercase()) {
            let word = word.as_str();
            let Some(&user_id) = alias_map.get(word) else {
                continue;
            };
            if user_id == speaker_user_id || !seen_users.insert(user_id) {
                continue;
            }
            mentions.push(Mention {
                alias: word.to_string(),
                resolved_user_id: user_id,
                confidence: 1.0,
            });
        }
        mentions
    }
}

#[async_trait]
impl TaskHandler for AliasDetectionHandler {
    fn task_type(&self) -> &'static str {
        task_types::ALIAS_DETECTION
    }

    fn target_types(&self) -> &'static [TargetType] {
        &[TargetType::Idea]
    }

    async fn process(&self, items: &[TaskItem]) -> Result<Vec<ItemResult>> {
        // One alias-map fetch covers the whole batch.
        let alias_map = self.aliases.alias_map().await?;

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

            let mentions =
                self.detect_mentions(&idea.payload.text, &alias_map, idea.payload.user_id);
            if mentions.is_empty() {
                debug!(idea_id = %item.target_id, "No mentions found");
            } else {
                info!(
                    idea_id = %item.target_id,
                    count = mentions.len(),
                    "Detected mentions"
                );
            }

            let updated = self
                .ideas
                .update_enrichments(&item.target_id, |payload| {
                    payload.mentions = Some(mentions);
                    payload.enrichment_status.insert(
                        task_types::ALIAS_DETECTION.into(),
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
