//! Persistence contract for servers, clusters and machine config templates.
//!
//! Two backends implement [`ServerStore`]: [`MemoryStore`] keeps everything
//! behind one lock, [`PgStore`] talks to PostgreSQL through `sqlx`. Both
//! guarantee that [`ServerStore::apply_reachable`] is all-or-nothing and
//! becomes visible to readers in a single step.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::machine_config::MachineConfigTemplate;
use crate::model::{
    BootstrapStart, Cluster, ClusterId, LifecycleEvent, MachineConfigBinding, ProviderKind,
    ProviderServer, ReachableUpdate, Server, ServerId,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors returned by store backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No server with this id.
    #[error("Server {0} not found")]
    ServerNotFound(ServerId),

    /// No cluster with this id.
    #[error("Cluster {0} not found")]
    ClusterNotFound(ClusterId),

    /// No template with this name.
    #[error("Machine config template '{0}' not found")]
    TemplateNotFound(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Database failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outcome of mirroring one provider's inventory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Records created.
    pub created: usize,
    /// Existing records refreshed.
    pub updated: usize,
}

/// Operator-controlled assignment of a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerAssignment {
    /// Cluster membership.
    pub cluster_id: Option<ClusterId>,
    /// Machine config binding.
    pub machine_config: Option<MachineConfigBinding>,
}

/// Storage for fleet state.
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// All servers ordered by cluster then name.
    async fn list_servers(&self) -> Result<Vec<Server>, StoreError>;

    /// One server by id.
    async fn get_server(&self, id: ServerId) -> Result<Server, StoreError>;

    /// Register a server that no provider manages.
    async fn create_manual_server(
        &self,
        name: &str,
        ipv4: Option<&str>,
    ) -> Result<Server, StoreError>;

    /// Insert or refresh a provider's inventory in one atomic step.
    ///
    /// Only provider-owned fields are written; records missing from
    /// `servers` are left alone.
    async fn upsert_provider_servers(
        &self,
        kind: ProviderKind,
        servers: &[ProviderServer],
    ) -> Result<UpsertSummary, StoreError>;

    /// Mark every server in the batch reachable together with its metadata.
    ///
    /// Either every row is written or none is, and readers never observe a
    /// partially applied batch.
    async fn apply_reachable(&self, updates: &[ReachableUpdate]) -> Result<(), StoreError>;

    /// Mark servers unreachable.
    async fn mark_unreachable(&self, ids: &[ServerId]) -> Result<(), StoreError>;

    /// Write the bootstrap start fields in one update: clears reachability
    /// and all lifecycle timestamps.
    async fn start_bootstrap(&self, id: ServerId, start: &BootstrapStart)
        -> Result<(), StoreError>;

    /// Stamp a lifecycle timestamp.
    async fn record_lifecycle(
        &self,
        id: ServerId,
        event: LifecycleEvent,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Set cluster membership and machine config binding.
    async fn assign_server(
        &self,
        id: ServerId,
        assignment: &ServerAssignment,
    ) -> Result<(), StoreError>;

    /// Create a cluster.
    async fn create_cluster(&self, name: &str) -> Result<Cluster, StoreError>;

    /// One cluster by id.
    async fn get_cluster(&self, id: ClusterId) -> Result<Cluster, StoreError>;

    /// Servers belonging to a cluster.
    async fn cluster_servers(&self, id: ClusterId) -> Result<Vec<Server>, StoreError>;

    /// Persist a template, bumping its version when the name already exists.
    async fn save_template(
        &self,
        template: &MachineConfigTemplate,
    ) -> Result<MachineConfigTemplate, StoreError>;

    /// One template by name.
    async fn get_template(&self, name: &str) -> Result<MachineConfigTemplate, StoreError>;
}
