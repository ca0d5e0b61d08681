//! Reconciliation cycle: mirror, probe, reconcile.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::mirror::{ProviderMirror, SyncReport};
use crate::probe::Prober;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::{ServerStore, StoreError};

/// Outcome of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Provider sync results.
    pub sync: SyncReport,
    /// Reachability merge counts.
    pub reconcile: ReconcileReport,
}

/// One full pass over the fleet.
#[derive(Clone)]
pub struct ReconciliationCycle {
    store: Arc<dyn ServerStore>,
    mirror: ProviderMirror,
    prober: Prober,
    reconciler: Reconciler,
}

impl std::fmt::Debug for ReconciliationCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationCycle")
            .field("mirror", &self.mirror)
            .field("prober", &self.prober)
            .finish_non_exhaustive()
    }
}

impl ReconciliationCycle {
    /// Cycle over `store` using the given mirror and prober.
    #[must_use]
    pub fn new(store: Arc<dyn ServerStore>, mirror: ProviderMirror, prober: Prober) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&store));
        Self {
            store,
            mirror,
            prober,
            reconciler,
        }
    }

    /// Run one cycle. Probing only starts after the sync finished, and the
    /// merge only after every probe returned.
    ///
    /// # Errors
    /// Returns a store error from the sync or the merge.
    pub async fn run_once(&self) -> Result<CycleReport, StoreError> {
        let sync = self.mirror.sync().await?;
        let servers = self.store.list_servers().await?;
        let results = self.prober.probe_all(&servers).await;
        let reconcile = self.reconciler.apply(results).await?;
        Ok(CycleReport { sync, reconcile })
    }

    /// Run cycles every `interval` until `shutdown` resolves.
    ///
    /// A failed cycle is logged and the next tick runs normally. Ticks missed
    /// while a cycle is still running are skipped. Returns the number of
    /// cycles started.
    pub async fn run_until<F>(&self, interval: Duration, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut cycles = 0;
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(cycles, "Stopping reconciliation");
                    return cycles;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    match self.run_once().await {
                        Ok(report) => info!(
                            cycle = cycles,
                            reachable = report.reconcile.reachable,
                            unreachable = report.reconcile.unreachable,
                            failed_providers = report.sync.failures().len(),
                            "Reconciliation cycle complete"
                        ),
                        Err(e) => error!(cycle = cycles, error = %e, "Reconciliation cycle failed"),
                    }
                }
            }
        }
    }
}
