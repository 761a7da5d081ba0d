//! Handoff from the platform's audio callback thread into the pipeline.
//!
//! The voice receive callback fires on a thread the scheduler does not own,
//! so frames cross into tokio through a bounded channel. The sending side
//! never blocks: when the pipeline falls behind, frames are dropped and
//! counted rather than stalling the audio thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use murmur_core::types::AudioFrame;

/// Consumer of dispatched audio frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn deliver(&self, frame: AudioFrame);
}

/// Sending handle given to the voice receive adapter.
pub struct AudioIngress {
    tx: mpsc::Sender<AudioFrame>,
    dropped: AtomicU64,
}

impl AudioIngress {
    /// Start the dispatch loop. Frames pushed on the returned handle are
    /// delivered to `sink` on the tokio side until the token is cancelled.
    pub fn start(
        capacity: usize,
        sink: Arc<dyn FrameSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<AudioFrame>(capacity);
        let ingress = Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
        });

        tokio::spawn(async move {
            info!(capacity, "Audio ingress dispatch started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = rx.recv() => {
                        match frame {
                            Some(frame) => sink.deliver(frame).await,
                            None => break,
                        }
                    }
                }
            }
            info!("Audio ingress dispatch stopped");
        });

        ingress
    }

    /// Enqueue a frame from the audio thread. Never blocks; returns `false`
    /// when the queue is full and the frame was dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total % 100 == 1 {
                    warn!(dropped_total = total, "Ingress queue full, dropping audio frame");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Frames dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
