// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Periodic release check that keeps the cache warm

use crate::orchestrator::Orchestrator;
use crate::shutdown::CancelToken;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run until `cancel` fires. The first tick happens immediately.
    pub async fn run(self, cancel: CancelToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Reconciler started, checking every {}s",
            self.interval.as_secs()
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Reconciler stopped");
                    break;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    pub fn spawn(self, cancel: CancelToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn tick(&self) {
        if self.orchestrator.install_in_progress() {
            tracing::debug!("Install in progress, skipping scheduled check");
            return;
        }

        match self.orchestrator.prewarm().await {
            Ok(status) => tracing::debug!("Scheduled check done: {status}"),
            Err(e) => tracing::error!("Scheduled check failed: {e}"),
        }
    }
}
