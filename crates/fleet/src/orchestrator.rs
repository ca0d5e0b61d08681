//! Bootstrap state machine and operator actions on single servers.
//!
//! Bootstrap, rescue, reset and lifecycle updates on the same server are
//! serialized through a per-server async mutex. Every precondition is
//! checked before the first write, so a rejected request leaves the server
//! untouched and enqueues nothing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::jobs::{JobError, JobQueue, ProvisioningJob};
use crate::model::{
    BootstrapPhase, BootstrapStart, DiskSelection, LifecycleEvent, ProviderKind, Server, ServerId,
};
use crate::providers::{ProviderError, ProviderRegistry};
use crate::store::{ServerAssignment, ServerStore, StoreError};
use crate::talos::{self, TalosCommand, TalosControl};

/// Operator input for a bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRequest {
    /// Talos version the provisioning job installs.
    pub talos_version: String,
    /// Image Factory schematic to record on the server.
    pub schematic_id: Option<String>,
    /// WWN of the install disk, required for dedicated servers.
    pub disk_wwn: Option<String>,
}

/// Why a bootstrap was refused.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Manual servers have no automated bootstrap path.
    #[error("Bootstrap is only available for Hetzner-managed servers.")]
    NotProviderBacked,

    /// A dedicated server needs an explicit disk.
    #[error("A bootstrap disk must be selected for dedicated servers.")]
    DiskNotSelected,

    /// The server has never been probed successfully.
    #[error("No block device listing recorded for server {0}; sync it while it is reachable.")]
    NoListing(ServerId),

    /// The selected WWN is not in the listing.
    #[error("No disk with WWN {0} found on the server.")]
    DiskNotFound(String),

    /// The listing contains no disk at all.
    #[error("No disk found on the server.")]
    NoDisk,

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The provisioning job could not be enqueued.
    #[error("Failed to enqueue provisioning job: {0}")]
    Job(#[from] JobError),
}

/// Why a rescue was refused or failed.
#[derive(Error, Debug)]
pub enum RescueError {
    /// Manual servers cannot be rebooted into rescue.
    #[error("Rescue mode is only available for Hetzner-managed servers.")]
    NotProviderBacked,

    /// No client configured for this provider.
    #[error("No provider client configured for {0}")]
    ProviderUnavailable(ProviderKind),

    /// The record has no provider id.
    #[error("Server {0} has no provider id")]
    MissingProviderId(ServerId),

    /// Provider API failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from operations that go through the cluster control plane.
#[derive(Error, Debug)]
pub enum ResetError {
    /// The server's cluster has no control plane member.
    #[error("Can't reset server without a cluster control plane server configured!")]
    NoControlPlane,

    /// Neither the node nor the control plane has a usable address.
    #[error("Server {0} has no address talosctl can reach")]
    NoAddress(ServerId),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a lifecycle update was refused.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The event does not follow from the current phase.
    #[error("Server {server_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Server.
        server_id: ServerId,
        /// Current phase.
        from: BootstrapPhase,
        /// Phase the event leads to.
        to: BootstrapPhase,
    },

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pick the install disk for `server`.
///
/// Dedicated servers need `disk_wwn` and it must match a listing entry.
/// Cloud servers use the first entry of type `disk`. Deterministic for a
/// given listing and input.
///
/// # Errors
/// Returns the reason no disk could be chosen.
pub fn resolve_install_disk(
    server: &Server,
    disk_wwn: Option<&str>,
) -> Result<(Option<String>, String), BootstrapError> {
    let selection = server.kind.disk_selection();
    if selection == DiskSelection::Unsupported {
        return Err(BootstrapError::NotProviderBacked);
    }
    if selection == DiskSelection::Explicit && disk_wwn.is_none() {
        return Err(BootstrapError::DiskNotSelected);
    }

    let listing = server
        .lsblk
        .as_ref()
        .ok_or(BootstrapError::NoListing(server.id))?;

    match (selection, disk_wwn) {
        (DiskSelection::Explicit, Some(wwn)) => {
            let disk = listing
                .find_by_wwn(wwn)
                .ok_or_else(|| BootstrapError::DiskNotFound(wwn.to_string()))?;
            Ok((Some(wwn.to_string()), disk.path()))
        }
        _ => {
            let disk = listing.first_disk().ok_or(BootstrapError::NoDisk)?;
            Ok((disk.wwn.clone(), disk.path()))
        }
    }
}

type LockMap = Arc<std::sync::Mutex<HashMap<ServerId, Arc<Mutex<()>>>>>;

/// Exclusive hold on one server; forgets the server's lock on release
/// unless another action is already waiting for it.
struct ServerGuard {
    id: ServerId,
    locks: LockMap,
    _held: OwnedMutexGuard<()>,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one in `_held`; more means waiters.
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            locks.remove(&self.id);
        }
    }
}

/// Drives servers through bootstrap and runs operator actions.
#[derive(Clone)]
pub struct BootstrapOrchestrator {
    store: Arc<dyn ServerStore>,
    jobs: Arc<dyn JobQueue>,
    providers: ProviderRegistry,
    talos: Arc<dyn TalosControl>,
    locks: LockMap,
}

impl std::fmt::Debug for BootstrapOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapOrchestrator")
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl BootstrapOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(
        store: Arc<dyn ServerStore>,
        jobs: Arc<dyn JobQueue>,
        providers: ProviderRegistry,
        talos: Arc<dyn TalosControl>,
    ) -> Self {
        Self {
            store,
            jobs,
            providers,
            talos,
            locks: Arc::default(),
        }
    }

    async fn lock_server(&self, id: ServerId) -> ServerGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id).or_default())
        };
        ServerGuard {
            id,
            locks: Arc::clone(&self.locks),
            _held: lock.lock_owned().await,
        }
    }

    /// Set a server's cluster membership and machine config binding.
    ///
    /// # Errors
    /// Returns [`StoreError::ClusterNotFound`] or
    /// [`StoreError::TemplateNotFound`] for dangling references; nothing is
    /// written in that case.
    pub async fn assign(
        &self,
        id: ServerId,
        assignment: &ServerAssignment,
    ) -> Result<Server, StoreError> {
        let _guard = self.lock_server(id).await;
        if let Some(binding) = &assignment.machine_config {
            self.store.get_template(&binding.template).await?;
        }
        self.store.assign_server(id, assignment).await?;

        let server = self.store.get_server(id).await?;
        info!(
            server_id = id,
            cluster_id = ?server.cluster_id,
            role = server.machine_config.as_ref().map(|b| b.role.as_str()),
            "Server assigned"
        );
        Ok(server)
    }

    /// Start bootstrapping a server.
    ///
    /// Selects the install disk, clears reachability and lifecycle
    /// timestamps in one update, then enqueues the provisioning job without
    /// waiting for it.
    ///
    /// # Errors
    /// Returns [`BootstrapError`] for manual servers, unresolved disks, store
    /// or queue failures.
    pub async fn bootstrap(
        &self,
        id: ServerId,
        request: &BootstrapRequest,
    ) -> Result<Server, BootstrapError> {
        let _guard = self.lock_server(id).await;
        let server = self.store.get_server(id).await?;

        if !server.provider_backed() {
            return Err(BootstrapError::NotProviderBacked);
        }
        let (disk_wwid, disk_path) = resolve_install_disk(&server, request.disk_wwn.as_deref())?;

        let start = BootstrapStart {
            disk_wwid,
            disk_path,
            schematic_id: request.schematic_id.clone(),
        };
        self.store.start_bootstrap(id, &start).await?;
        info!(
            server_id = id,
            disk = %start.disk_path,
            talos_version = %request.talos_version,
            "Bootstrap requested"
        );

        self.jobs
            .enqueue(ProvisioningJob {
                server_id: id,
                talos_version: request.talos_version.clone(),
            })
            .await?;

        Ok(self.store.get_server(id).await?)
    }

    /// Reboot a provider-backed server into the provider's rescue system.
    ///
    /// # Errors
    /// Returns [`RescueError`] for manual servers or provider failures.
    pub async fn rescue(&self, id: ServerId) -> Result<(), RescueError> {
        let _guard = self.lock_server(id).await;
        let server = self.store.get_server(id).await?;

        if !server.provider_backed() {
            return Err(RescueError::NotProviderBacked);
        }
        let provider = self
            .providers
            .get(server.kind)
            .ok_or(RescueError::ProviderUnavailable(server.kind))?;
        let provider_id = server
            .provider_id
            .as_deref()
            .ok_or(RescueError::MissingProviderId(id))?;

        provider.rescue(provider_id).await?;
        info!(server_id = id, provider_id = %provider_id, "Server rebooting into rescue");
        Ok(())
    }

    /// Control plane endpoint and node address for `server`.
    async fn talos_target(&self, server: &Server) -> Result<(String, String), ResetError> {
        let cluster_id = server.cluster_id.ok_or(ResetError::NoControlPlane)?;
        let members = self.store.cluster_servers(cluster_id).await?;

        let mut control_planes: Vec<&Server> =
            members.iter().filter(|s| s.is_control_plane()).collect();
        if control_planes.is_empty() {
            return Err(ResetError::NoControlPlane);
        }
        // Prefer another control plane node over the target itself.
        control_planes.sort_by_key(|s| s.id == server.id);

        let endpoint = control_planes
            .iter()
            .find_map(|s| talos::node_address(s))
            .ok_or(ResetError::NoAddress(control_planes[0].id))?;
        let node = talos::node_address(server).ok_or(ResetError::NoAddress(server.id))?;
        Ok((endpoint.to_string(), node.to_string()))
    }

    /// Wipe a Talos node through its cluster's control plane.
    ///
    /// Returns `Ok(false)` when `talosctl` ran but failed.
    ///
    /// # Errors
    /// Returns [`ResetError::NoControlPlane`] when the cluster has no control
    /// plane member; nothing is executed in that case.
    pub async fn reset(&self, id: ServerId) -> Result<bool, ResetError> {
        let _guard = self.lock_server(id).await;
        let server = self.store.get_server(id).await?;
        let (endpoint, node) = self.talos_target(&server).await?;

        match self.talos.reset(&endpoint, &node).await {
            Ok(()) => {
                info!(server_id = id, node = %node, "Server reset");
                Ok(true)
            }
            Err(e) => {
                warn!(server_id = id, node = %node, error = %e, "talosctl reset failed");
                Ok(false)
            }
        }
    }

    /// `talosctl` command that reboots the server.
    ///
    /// # Errors
    /// Returns [`ResetError`] if no control plane endpoint can be found.
    pub async fn reboot_command(&self, id: ServerId) -> Result<TalosCommand, ResetError> {
        let server = self.store.get_server(id).await?;
        let (endpoint, _) = self.talos_target(&server).await?;
        talos::reboot_command(&server, &endpoint).ok_or(ResetError::NoAddress(id))
    }

    /// `talosctl` command that upgrades the server to `version`.
    ///
    /// # Errors
    /// Returns [`ResetError`] if no control plane endpoint can be found.
    pub async fn upgrade_command(
        &self,
        id: ServerId,
        version: &str,
    ) -> Result<TalosCommand, ResetError> {
        let server = self.store.get_server(id).await?;
        let (endpoint, _) = self.talos_target(&server).await?;
        talos::upgrade_command(&server, &endpoint, version).ok_or(ResetError::NoAddress(id))
    }

    async fn advance(&self, id: ServerId, event: LifecycleEvent) -> Result<Server, LifecycleError> {
        let _guard = self.lock_server(id).await;
        let server = self.store.get_server(id).await?;

        let from = server.bootstrap_phase();
        if !event.allowed_from(from) {
            return Err(LifecycleError::InvalidTransition {
                server_id: id,
                from,
                to: event.target_phase(),
            });
        }

        self.store.record_lifecycle(id, event, Utc::now()).await?;
        let server = self.store.get_server(id).await?;
        info!(
            server_id = id,
            from = %from,
            to = %server.bootstrap_phase(),
            "Lifecycle event recorded"
        );
        Ok(server)
    }

    /// The machine fetched its rendered config.
    ///
    /// Later lifecycle timestamps are kept, so a reboot of a finished node
    /// leaves it `Ready`.
    ///
    /// # Errors
    /// Returns [`LifecycleError::InvalidTransition`] if the server was never
    /// bootstrapped.
    pub async fn record_configuration_request(
        &self,
        id: ServerId,
    ) -> Result<Server, LifecycleError> {
        self.advance(id, LifecycleEvent::ConfigurationRequested).await
    }

    /// The machine applied its config.
    ///
    /// # Errors
    /// Returns [`LifecycleError::InvalidTransition`] out of order.
    pub async fn record_configured(&self, id: ServerId) -> Result<Server, LifecycleError> {
        self.advance(id, LifecycleEvent::Configured).await
    }

    /// The label and taint job finished.
    ///
    /// # Errors
    /// Returns [`LifecycleError::InvalidTransition`] out of order.
    pub async fn record_label_and_taint_completed(
        &self,
        id: ServerId,
    ) -> Result<Server, LifecycleError> {
        self.advance(id, LifecycleEvent::LabelAndTaintCompleted).await
    }
}
