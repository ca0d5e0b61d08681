//! Merges probe results into the store.

use std::sync::Arc;

use tracing::info;

use crate::model::{ReachableUpdate, ServerId};
use crate::probe::{ProbeOutcome, ProbeResult};
use crate::store::{ServerStore, StoreError};

/// Counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Servers marked reachable with fresh metadata.
    pub reachable: usize,
    /// Servers marked unreachable.
    pub unreachable: usize,
}

/// Split results into the reachable batch and the unreachable ids.
#[must_use]
pub fn partition(results: Vec<ProbeResult>) -> (Vec<ReachableUpdate>, Vec<ServerId>) {
    let mut reachable = Vec::new();
    let mut unreachable = Vec::new();
    for result in results {
        match result.outcome {
            ProbeOutcome::Reachable(metadata) => reachable.push(ReachableUpdate {
                server_id: result.server_id,
                metadata,
            }),
            ProbeOutcome::Unreachable(_) => unreachable.push(result.server_id),
        }
    }
    (reachable, unreachable)
}

/// Applies a cycle's probe results.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ServerStore>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Reconciler writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ServerStore>) -> Self {
        Self { store }
    }

    /// Write the reachable set as one atomic batch, then mark the rest unreachable.
    ///
    /// # Errors
    /// Returns a store error. When the reachable batch fails nothing from it
    /// is visible and the unreachable set is not written either.
    pub async fn apply(&self, results: Vec<ProbeResult>) -> Result<ReconcileReport, StoreError> {
        let (reachable, unreachable) = partition(results);

        self.store.apply_reachable(&reachable).await?;
        self.store.mark_unreachable(&unreachable).await?;

        let report = ReconcileReport {
            reachable: reachable.len(),
            unreachable: unreachable.len(),
        };
        info!(
            reachable = report.reachable,
            unreachable = report.unreachable,
            "Reconciled probe results"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockDeviceListing, BootstrapMetadata, ProviderKind, Server};
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn metadata(n: u128) -> BootstrapMetadata {
        BootstrapMetadata {
            uuid: Uuid::from_u128(n),
            lsblk: BlockDeviceListing::default(),
        }
    }

    async fn seeded(store: &MemoryStore, count: usize) -> Vec<ServerId> {
        let mut ids = Vec::new();
        for i in 0..count {
            let s = store
                .insert_server(Server::new(0, ProviderKind::HetznerCloud, format!("node-{i}")))
                .await;
            ids.push(s.id);
        }
        ids
    }

    #[tokio::test]
    async fn test_apply_partitions_results() {
        let store = Arc::new(MemoryStore::new());
        let ids = seeded(&store, 3).await;
        store
            .apply_reachable(&[ReachableUpdate {
                server_id: ids[2],
                metadata: metadata(9),
            }])
            .await
            .unwrap();

        let report = Reconciler::new(store.clone())
            .apply(vec![
                ProbeResult {
                    server_id: ids[0],
                    outcome: ProbeOutcome::Reachable(metadata(1)),
                },
                ProbeResult {
                    server_id: ids[1],
                    outcome: ProbeOutcome::Reachable(metadata(2)),
                },
                ProbeResult {
                    server_id: ids[2],
                    outcome: ProbeOutcome::Unreachable("timed out".into()),
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                reachable: 2,
                unreachable: 1
            }
        );
        let s0 = store.get_server(ids[0]).await.unwrap();
        assert!(s0.reachable);
        assert_eq!(s0.uuid, Some(Uuid::from_u128(1)));
        assert!(!store.get_server(ids[2]).await.unwrap().reachable);
    }

    #[tokio::test]
    async fn test_missing_server_rolls_back_whole_batch() {
        let store = Arc::new(MemoryStore::new());
        let ids = seeded(&store, 2).await;

        let err = Reconciler::new(store.clone())
            .apply(vec![
                ProbeResult {
                    server_id: ids[0],
                    outcome: ProbeOutcome::Reachable(metadata(1)),
                },
                ProbeResult {
                    server_id: 999,
                    outcome: ProbeOutcome::Reachable(metadata(2)),
                },
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ServerNotFound(999)));
        let s0 = store.get_server(ids[0]).await.unwrap();
        assert!(!s0.reachable);
        assert!(s0.uuid.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_partial_batch() {
        let store = Arc::new(MemoryStore::new());
        let ids = seeded(&store, 200).await;

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut observed = Vec::new();
                for _ in 0..200 {
                    let servers = store.list_servers().await.unwrap();
                    observed.push(servers.iter().filter(|s| s.reachable).count());
                    tokio::task::yield_now().await;
                }
                observed
            })
        };

        let results = ids
            .iter()
            .map(|&id| ProbeResult {
                server_id: id,
                outcome: ProbeOutcome::Reachable(metadata(u128::from(id.unsigned_abs()))),
            })
            .collect();
        Reconciler::new(store.clone()).apply(results).await.unwrap();

        for count in reader.await.unwrap() {
            assert!(count == 0 || count == 200, "saw partial batch of {count}");
        }
        for server in store.list_servers().await.unwrap() {
            assert!(server.reachable);
            assert!(server.uuid.is_some() && server.lsblk.is_some());
        }
    }
}
