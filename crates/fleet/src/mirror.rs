//! Mirrors provider inventories into the store.

use std::sync::Arc;

use tracing::{info, warn};

use crate::model::ProviderKind;
use crate::providers::ProviderRegistry;
use crate::store::{ServerStore, StoreError, UpsertSummary};

/// Result of syncing one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSync {
    /// Inventory fetched and upserted.
    Synced(UpsertSummary),
    /// Inventory could not be fetched; local records were left as they were.
    Failed(String),
}

/// Per-provider outcomes of one sync, in sync order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// One entry per registered provider.
    pub providers: Vec<(ProviderKind, ProviderSync)>,
}

impl SyncReport {
    /// Providers whose fetch failed.
    #[must_use]
    pub fn failures(&self) -> Vec<(ProviderKind, &str)> {
        self.providers
            .iter()
            .filter_map(|(kind, sync)| match sync {
                ProviderSync::Failed(reason) => Some((*kind, reason.as_str())),
                ProviderSync::Synced(_) => None,
            })
            .collect()
    }

    /// Totals across all providers.
    #[must_use]
    pub fn totals(&self) -> UpsertSummary {
        self.providers
            .iter()
            .fold(UpsertSummary::default(), |acc, (_, sync)| match sync {
                ProviderSync::Synced(s) => UpsertSummary {
                    created: acc.created + s.created,
                    updated: acc.updated + s.updated,
                },
                ProviderSync::Failed(_) => acc,
            })
    }
}

/// Pulls inventories from every registered provider.
#[derive(Clone)]
pub struct ProviderMirror {
    store: Arc<dyn ServerStore>,
    providers: ProviderRegistry,
}

impl std::fmt::Debug for ProviderMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderMirror")
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl ProviderMirror {
    /// Mirror `providers` into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ServerStore>, providers: ProviderRegistry) -> Self {
        Self { store, providers }
    }

    /// Sync every provider, dedicated servers first.
    ///
    /// A provider whose listing fails is reported and skipped. Running sync
    /// twice against unchanged inventories leaves the store unchanged.
    ///
    /// # Errors
    /// Returns an error if the store rejects an upsert.
    pub async fn sync(&self) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();

        for provider in self.providers.all() {
            let kind = provider.kind();
            let servers = match provider.list_servers().await {
                Ok(servers) => servers,
                Err(e) => {
                    warn!(
                        provider = %kind,
                        error = %e,
                        "Provider sync failed, keeping local records"
                    );
                    report.providers.push((kind, ProviderSync::Failed(e.to_string())));
                    continue;
                }
            };

            let summary = self.store.upsert_provider_servers(kind, &servers).await?;
            info!(
                provider = %kind,
                created = summary.created,
                updated = summary.updated,
                "Synced provider inventory"
            );
            report.providers.push((kind, ProviderSync::Synced(summary)));
        }

        Ok(report)
    }
}
