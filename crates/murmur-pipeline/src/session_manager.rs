//! Session lifecycle per voice channel.
//!
//! Tracks the active session for each channel in memory, mirrors lifecycle
//! changes to the relational store, and abandons sessions whose channel has
//! gone quiet for longer than the configured timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use murmur_core::error::Result;
use murmur_core::types::SessionStatus;
use murmur_store::sessions::SessionRepository;

/// Notified after a session reaches a terminal state, before its in-memory
/// tracking is gone. Used to flush pending boundary/exchange state.
#[async_trait]
pub trait SessionEndListener: Send + Sync {
    async fn on_session_end(&self, session_id: &str);
}

#[derive(Default)]
struct ManagerState {
    /// channel id -> active session id
    active: HashMap<u64, String>,
    /// channel id -> last activity timestamp
    last_activity: HashMap<u64, DateTime<Utc>>,
    /// session id -> present participants
    participants: HashMap<String, HashSet<u64>>,
}

pub struct SessionManager {
    repo: SessionRepository,
    timeout: Duration,
    state: Mutex<ManagerState>,
    listeners: Mutex<Vec<Arc<dyn SessionEndListener>>>,
}

impl SessionManager {
    pub fn new(repo: SessionRepository, timeout_sec: i64) -> Self {
        Self {
            repo,
            timeout: Duration::seconds(timeout_sec),
            state: Mutex::new(ManagerState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub async fn add_end_listener(&self, listener: Arc<dyn SessionEndListener>) {
        self.listeners.lock().await.push(listener);
    }

    /// Start a session for a channel. Returns the existing session id when
    /// one is already active.
    pub async fn start(
        &self,
        channel_id: u64,
        channel_name: &str,
        guild_id: u64,
    ) -> Result<String> {
        {
            let state = self.state.lock().await;
            if let Some(existing) = state.active.get(&channel_id) {
                warn!(channel_id, session_id = %existing, "Session already active");
                return Ok(existing.clone());
            }
        }

        let session_id = self.repo.create(channel_id, channel_name, guild_id).await?;

        let mut state = self.state.lock().await;
        state.active.insert(channel_id, session_id.clone());
        state.last_activity.insert(channel_id, Utc::now());
        state.participants.insert(session_id.clone(), HashSet::new());

        info!(session_id = %session_id, channel_name, channel_id, "Started session");
        Ok(session_id)
    }

    /// Add a participant to the channel's session, if one is active.
    pub async fn add_participant(
        &self,
        channel_id: u64,
        user_id: u64,
        username: &str,
        display_name: &str,
    ) -> Result<Option<String>> {
        let session_id = {
            let state = self.state.lock().await;
            state.active.get(&channel_id).cloned()
        };
        let Some(session_id) = session_id else {
            warn!(channel_id, user_id, "No active session when adding participant");
            return Ok(None);
        };

        let is_new = {
            let mut state = self.state.lock().await;
            state.last_activity.insert(channel_id, Utc::now());
            state
                .participants
                .get_mut(&session_id)
                .map(|set| set.insert(user_id))
                .unwrap_or(false)
        };

        if is_new {
            self.repo
                .add_participant(&session_id, user_id, username, display_name)
                .await?;
            info!(session_id = %session_id, user_id, username, "Participant joined");
        }
        Ok(Some(session_id))
    }

    /// Remove a participant; ends the session when the channel empties.
    pub async fn remove_participant(
        &self,
        channel_id: u64,
        user_id: u64,
    ) -> Result<Option<String>> {
        let (session_id, now_empty) = {
            let mut state = self.state.lock().await;
            let Some(session_id) = state.active.get(&channel_id).cloned() else {
                return Ok(None);
            };
            state.last_activity.insert(channel_id, Utc::now());
            let set = state.participants.entry(session_id.clone()).or_default();
            set.remove(&user_id);
            (session_id, set.is_empty())
        };

        self.repo.remove_participant(&session_id, user_id).await?;
        info!(session_id = %session_id, user_id, "Participant left");

        if now_empty {
            self.end_channel_session(channel_id, SessionStatus::Ended)
                .await?;
        }
        Ok(Some(session_id))
    }

    /// Bump the channel's activity clock (called on every audio frame).
    pub async fn record_activity(&self, channel_id: u64) {
        let mut state = self.state.lock().await;
        if state.active.contains_key(&channel_id) {
            state.last_activity.insert(channel_id, Utc::now());
        }
    }

    pub async fn active_session(&self, channel_id: u64) -> Option<String> {
        self.state.lock().await.active.get(&channel_id).cloned()
    }

    pub async fn session_participants(&self, session_id: &str) -> HashSet<u64> {
        self.state
            .lock()
            .await
            .participants
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Manually end a channel's session.
    pub async fn end_session(&self, channel_id: u64) -> Result<()> {
        self.end_channel_session(channel_id, SessionStatus::Ended)
            .await
    }

    /// Abandon every session idle past the timeout, measured at `now`.
    /// Returns the abandoned session ids.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let idle_channels: Vec<u64> = {
            let state = self.state.lock().await;
            state
                .last_activity
                .iter()
                .filter(|(_, last)| now - **last > self.timeout)
                .map(|(channel, _)| *channel)
                .collect()
        };

        let mut abandoned = Vec::new();
        for channel_id in idle_channels {
            info!(channel_id, "Session idle past timeout, abandoning");
            if let Some(session_id) = self.active_session(channel_id).await {
                abandoned.push(session_id);
            }
            self.end_channel_session(channel_id, SessionStatus::Abandoned)
                .await?;
        }
        Ok(abandoned)
    }

    /// Background loop scanning for idle sessions once a minute.
    pub fn start_timeout_monitor(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            info!("Session timeout monitor started");
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            interval.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.check_timeouts(Utc::now()).await {
                            error!(error = %e, "Timeout scan failed");
                        }
                    }
                }
            }
            info!("Session timeout monitor stopped");
        });
    }

    async fn end_channel_session(&self, channel_id: u64, status: SessionStatus) -> Result<()> {
        let session_id = {
            let mut state = self.state.lock().await;
            let Some(session_id) = state.active.remove(&channel_id) else {
                return Ok(());
            };
            state.last_activity.remove(&channel_id);
            state.participants.remove(&session_id);
            session_id
        };

        self.repo.end(&session_id, status).await?;
        info!(session_id = %session_id, status = status.as_str(), "Ended session");

        let listeners = self.listeners.lock().await.clone();
        for listener in listeners {
            listener.on_session_end(&session_id).await;
        }
        Ok(())
    }
}
