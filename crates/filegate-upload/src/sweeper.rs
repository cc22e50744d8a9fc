//! Background expiry of abandoned upload sessions. A tab closed mid-upload
//! leaves a session behind forever; the sweeper aborts anything older than
//! the configured age so its backing upload is released.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use filegate_common::error::FilegateError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::coordinator::UploadCoordinator;

pub struct UploadSweeper {
    coordinator: Arc<UploadCoordinator>,
    max_age: Duration,
}

pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl UploadSweeper {
    pub fn new(coordinator: Arc<UploadCoordinator>, max_age: Duration) -> Self {
        Self {
            coordinator,
            max_age,
        }
    }

    /// Aborts every session older than `max_age`. Returns how many were
    /// swept.
    pub async fn sweep_once(&self) -> usize {
        let cutoff = chrono::Duration::from_std(self.max_age)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let now = Utc::now();
        let mut swept = 0;

        for (session_id, created_at) in self.coordinator.session_ages().await {
            if now.signed_duration_since(created_at) <= cutoff {
                continue;
            }
            match self.coordinator.abort(&session_id).await {
                Ok(()) => {
                    info!(session_id, %created_at, "swept expired upload session");
                    swept += 1;
                }
                // completed or aborted between the snapshot and here
                Err(FilegateError::SessionNotFound(_)) => {}
                Err(err) => {
                    warn!(session_id, error = %err, "failed to sweep session");
                }
            }
        }
        swept
    }

    pub fn spawn(self, every: Duration) -> SweeperHandle {
        let (shutdown, mut watcher) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick fires immediately, skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = self.sweep_once().await;
                        if swept > 0 {
                            info!(swept, "expiry sweep finished");
                        }
                    }
                    _ = watcher.changed() => break,
                }
            }
        });
        SweeperHandle { shutdown, task }
    }
}
