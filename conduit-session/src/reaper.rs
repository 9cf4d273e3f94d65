//! Background reaper for idle sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::manager::SessionManager;

/// Periodically removes idle sessions through [`SessionManager::cleanup_expired`].
pub struct SessionReaper {
    manager: Arc<SessionManager>,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(manager: Arc<SessionManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Spawn the reaper loop. Must be called from within a Tokio runtime.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let Self { manager, interval } = self;

        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Session reaper started");

            loop {
                if stop_requested(&mut shutdown_rx) {
                    break;
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if stop_requested(&mut shutdown_rx) {
                    break;
                }

                // A failed sweep is logged and retried next cycle.
                match manager.cleanup_expired() {
                    Ok(0) => tracing::debug!("Reaper sweep found no idle sessions"),
                    Ok(removed) => tracing::info!(removed, "Reaper removed idle sessions"),
                    Err(e) => tracing::error!(error = %e, "Reaper sweep failed"),
                }
            }

            tracing::info!("Session reaper stopped");
        });

        ReaperHandle { shutdown_tx, handle }
    }
}

fn stop_requested(rx: &mut mpsc::Receiver<()>) -> bool {
    matches!(rx.try_recv(), Ok(()) | Err(TryRecvError::Disconnected))
}

/// Handle to a running reaper. Dropping it also stops the loop at its next check.
pub struct ReaperHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the reaper and wait for it to exit. A sweep in progress is
    /// allowed to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Session reaper task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
