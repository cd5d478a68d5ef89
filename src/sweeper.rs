//! Periodic idle sweep.
//!
//! Every `IDLE_CHECK_INTERVAL_MINUTES` the sweeper asks the session store to
//! move stale `ACTIVE` sessions to `IDLE`. No customer-facing message is
//! ever emitted from here. The loop exits cleanly on the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::session::SessionStore;

pub struct IdleSweeper {
    sessions: Arc<SessionStore>,
    interval: Duration,
}

impl IdleSweeper {
    pub fn new(sessions: Arc<SessionStore>, interval: Duration) -> Self {
        IdleSweeper { sessions, interval }
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so a restart doesn't
        // sweep before workers are up.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sessions.check_idle_sessions().await {
                        Ok(0) => tracing::debug!("idle sweep: nothing to do"),
                        Ok(count) => tracing::info!(count, "idle sweep complete"),
                        Err(e) => tracing::error!(error = %e, "idle sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("idle sweeper stopped");
                        return;
                    }
                }
            }
        }
    }
}
