//! Background drain loop.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{DrainScope, SyncCoordinator};
use crate::settings::SyncMode;

/// Shortest sleep between drains while work is waiting.
const MIN_WAKEUP: Duration = Duration::from_millis(50);

impl SyncCoordinator {
    /// Run the queue drain loop until `shutdown` fires.
    ///
    /// In automatic mode the worker drains whenever woken (bill change,
    /// settings change, manual retry) and whenever a backoff elapses.
    /// Reconciliation runs once per sync cadence in either mode.
    pub fn spawn_worker(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run_worker(shutdown).await })
    }

    async fn run_worker(self, shutdown: CancellationToken) {
        tracing::info!("Sync worker started");
        let mut last_reconcile = Instant::now();

        loop {
            let (mode, cadence) = {
                let settings = self.inner.settings.read();
                (settings.mode, settings.sync_interval())
            };

            if mode == SyncMode::Automatic {
                let results = self.drain(DrainScope::background(), &shutdown).await;
                if !results.is_empty() {
                    let failed = results.iter().filter(|r| !r.is_success()).count();
                    tracing::debug!(
                        dispatched = results.len(),
                        failed,
                        "Background drain finished"
                    );
                }
            }
            if shutdown.is_cancelled() {
                break;
            }

            let until_reconcile = cadence.saturating_sub(last_reconcile.elapsed());
            let sleep_for = match (mode, self.next_wakeup()) {
                (SyncMode::Automatic, Some(wait)) => wait.min(until_reconcile),
                _ => until_reconcile,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }

            if last_reconcile.elapsed() >= cadence {
                last_reconcile = Instant::now();
                if let Err(e) = self.reconcile() {
                    tracing::error!(error = %e, "Periodic reconciliation failed");
                }
            }
        }

        tracing::info!("Sync worker stopped");
    }

    /// Time until the earliest pending operation may be dispatched.
    fn next_wakeup(&self) -> Option<Duration> {
        let now = Utc::now();
        let settings = self.inner.settings.read().clone();
        let st = self.inner.state.lock();

        st.queue
            .pending()
            .filter(|op| {
                settings.is_provider_enabled(&op.provider)
                    && self.inner.adapters.get(&op.provider).is_some()
                    && !st.disconnected.contains(&op.provider)
            })
            .map(|op| {
                let ready = op.next_attempt_at.unwrap_or(now);
                match st.rate_limited_until.get(&op.provider) {
                    Some(gate) => ready.max(*gate),
                    None => ready,
                }
            })
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO).max(MIN_WAKEUP))
    }
}
