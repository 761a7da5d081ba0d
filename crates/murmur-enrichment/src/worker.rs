//! The enrichment worker loop.
//!
//! Each tick pulls a batch of pending tasks in priority-then-FIFO order,
//! buckets them by task type, claims each task with the queue's conditional
//! update, and hands the claimed items to the matching handler. Claimed
//! rows left behind by a crash come back through the periodic stale
//! reclaim.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use murmur_core::config::EnrichmentConfig;
use murmur_core::error::Result;
use murmur_core::types::EnrichmentTask;
use murmur_store::queue::EnrichmentQueueRepository;

use crate::handler::{ItemResult, TaskHandler, TaskItem};
use crate::model_manager::ModelManager;

pub struct EnrichmentWorker {
    queue: EnrichmentQueueRepository,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
    model_manager: Arc<ModelManager>,
    config: EnrichmentConfig,
}

impl EnrichmentWorker {
    pub fn new(
        queue: EnrichmentQueueRepository,
        handlers: Vec<Arc<dyn TaskHandler>>,
        model_manager: Arc<ModelManager>,
        config: EnrichmentConfig,
    ) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|h| (h.task_type(), h))
            .collect();
        Self {
            queue,
            handlers,
            model_manager,
            config,
        }
    }

    /// Run until cancelled. Reclaims stale tasks at startup and then every
    /// `stale_reset_interval_sec`.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            info!("Enrichment worker started");

            let stale_age = ChronoDuration::seconds(self.config.stale_task_max_age_sec);
            if let Err(e) = self.queue.reset_stale(stale_age).await {
                error!(error = %e, "Startup stale reclaim failed");
            }

            let poll = Duration::from_secs(self.config.poll_interval_sec);
            let reset_every = Duration::from_secs(self.config.stale_reset_interval_sec);
            let mut last_reset = tokio::time::Instant::now();

            // The tick itself is never raced against cancellation: a batch
            // in flight runs to completion, and shutdown is observed
            // between ticks.
            while !cancel.is_cancelled() {
                if last_reset.elapsed() >= reset_every {
                    if let Err(e) = self.queue.reset_stale(stale_age).await {
                        error!(error = %e, "Stale reclaim failed");
                    }
                    last_reset = tokio::time::Instant::now();
                }

                let idle = match self.tick().await {
                    Ok(0) => true,
                    Ok(n) => {
                        debug!(processed = n, "Worker tick complete");
                        false
                    }
                    Err(e) => {
                        error!(error = %e, "Worker tick failed");
                        true
                    }
                };

                if idle {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
            info!("Enrichment worker stopped");
        });
    }

    /// One poll iteration. Returns how many tasks were handled (completed
    /// or failed).
    pub async fn tick(&self) -> Result<usize> {
        let tasks = self
            .queue
            .pending(self.config.batch_size as i64, None)
            .await?;
        if tasks.is_empty() {
            return Ok(0);
        }
        debug!(count = tasks.len(), "Fetched pending tasks");

        // Bucket by task type, preserving queue order inside each bucket.
        let mut grouped: Vec<(String, Vec<EnrichmentTask>)> = Vec::new();
        for task in tasks {
            match grouped.iter_mut().find(|(t, _)| *t == task.task_type) {
                Some((_, bucket)) => bucket.push(task),
                None => grouped.push((task.task_type.clone(), vec![task])),
            }
        }

        let mut handled = 0;
        for (task_type, batch) in grouped {
            match self.handlers.get(task_type.as_str()) {
                Some(handler) => {
                    handled += self.process_batch(handler.clone(), batch).await?;
                }
                None => {
                    warn!(task_type = %task_type, "No handler for task type");
                    for task in batch {
                        self.queue
                            .fail(task.id, &format!("No handler available for {task_type}"))
                            .await?;
                        handled += 1;
                    }
                }
            }
        }
        Ok(handled)
    }

    async fn process_batch(
        &self,
        handler: Arc<dyn TaskHandler>,
        batch: Vec<EnrichmentTask>,
    ) -> Result<usize> {
        // Warm the model before claiming anything, so a missing model
        // fails fast without eating attempts.
        if let Some(model_id) = handler.model_id() {
            let warm = match self.model_manager.ensure_loaded(model_id).await {
                Ok(warm) => warm,
                Err(e) => {
                    warn!(model_id, error = %e, "Model check failed");
                    false
                }
            };
            if !warm {
                let mut handled = 0;
                for task in &batch {
                    self.queue
                        .fail(task.id, &format!("Model {model_id} not available"))
                        .await?;
                    handled += 1;
                }
                return Ok(handled);
            }
        }

        // Claim atomically; a lost race just skips the task.
        let mut claimed = Vec::new();
        let mut handled = 0;
        for task in batch {
            if !self.queue.claim(task.id).await? {
                continue;
            }
            // The claim bumped attempts; enforce the retry cap here.
            if task.attempts + 1 > self.config.max_attempts {
                self.queue
                    .fail(task.id, "Retry limit exceeded")
                    .await?;
                handled += 1;
                continue;
            }
            claimed.push(task);
        }
        if claimed.is_empty() {
            return Ok(handled);
        }

        info!(
            task_type = handler.task_type(),
            count = claimed.len(),
            "Processing enrichment batch"
        );

        let items: Vec<TaskItem> = claimed
            .iter()
            .map(|t| TaskItem {
                task_id: t.id,
                target_type: t.target_type,
                target_id: t.target_id.clone(),
            })
            .collect();

        match handler.process(&items).await {
            Ok(results) => {
                for (task, result) in claimed.iter().zip(results.iter()) {
                    match result {
                        ItemResult::Complete => self.queue.complete(task.id).await?,
                        ItemResult::Failed(error) => self.queue.fail(task.id, error).await?,
                    }
                    handled += 1;
                }
                // A short result vector leaves tasks unaccounted; fail them
                // rather than leaving rows in processing.
                for task in claimed.iter().skip(results.len()) {
                    self.queue
                        .fail(task.id, "Handler returned no result for item")
                        .await?;
                    handled += 1;
                }
            }
            Err(e) => {
                error!(task_type = handler.task_type(), error = %e, "Batch processing failed");
                for task in &claimed {
                    self.queue.fail(task.id, &e.to_string()).await?;
                    handled += 1;
                }
            }
        }
        Ok(handled)
    }
}
