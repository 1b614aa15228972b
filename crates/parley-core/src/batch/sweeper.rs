//! Periodic closer for batches whose window elapsed with no new arrivals.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aggregator::Aggregator;
use crate::clock::Clock;
use crate::dispatch::DispatchQueue;
use crate::repository::{BatchStore, SettingsRepository};

pub struct StaleBatchSweeper<B, S, Q, C> {
    aggregator: Arc<Aggregator<B, S, Q, C>>,
    interval: Duration,
    cancel: CancellationToken,
}

impl<B, S, Q, C> StaleBatchSweeper<B, S, Q, C>
where
    B: BatchStore,
    S: SettingsRepository,
    Q: DispatchQueue,
    C: Clock,
{
    /// A zero `interval` disables the sweeper.
    pub fn new(
        aggregator: Arc<Aggregator<B, S, Q, C>>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            aggregator,
            interval,
            cancel,
        }
    }

    pub async fn run(self) {
        if self.interval.is_zero() {
            debug!("stale batch sweeper disabled");
            return;
        }

        info!(interval_secs = self.interval.as_secs(), "stale batch sweeper starting");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.aggregator.sweep_stale().await {
                        Ok(closed) if !closed.is_empty() => {
                            info!(closed = closed.len(), "swept stale batches");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "stale batch sweep failed"),
                    }
                }
            }
        }

        debug!("stale batch sweeper stopped");
    }
}
