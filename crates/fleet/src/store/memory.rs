//! In-memory store.
//!
//! All state sits behind a single `RwLock`, so every trait method is one
//! critical section and batch writes are visible all at once.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ServerAssignment, ServerStore, StoreError, UpsertSummary};
use crate::machine_config::MachineConfigTemplate;
use crate::model::{
    BootstrapStart, Cluster, ClusterId, LifecycleEvent, ProviderKind, ProviderServer,
    ReachableUpdate, Server, ServerId,
};

#[derive(Debug, Default)]
struct State {
    servers: BTreeMap<ServerId, Server>,
    clusters: BTreeMap<ClusterId, Cluster>,
    templates: HashMap<String, MachineConfigTemplate>,
    next_server_id: ServerId,
    next_cluster_id: ClusterId,
}

impl State {
    fn server_mut(&mut self, id: ServerId) -> Result<&mut Server, StoreError> {
        self.servers
            .get_mut(&id)
            .ok_or(StoreError::ServerNotFound(id))
    }

    fn allocate_server_id(&mut self) -> ServerId {
        self.next_server_id += 1;
        self.next_server_id
    }
}

/// Store keeping fleet state in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully specified server, assigning it a fresh id.
    pub async fn insert_server(&self, mut server: Server) -> Server {
        let mut state = self.state.write().await;
        server.id = state.allocate_server_id();
        state.servers.insert(server.id, server.clone());
        server
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let state = self.state.read().await;
        let mut servers: Vec<Server> = state.servers.values().cloned().collect();
        servers.sort_by(|a, b| (a.cluster_id, &a.name).cmp(&(b.cluster_id, &b.name)));
        Ok(servers)
    }

    async fn get_server(&self, id: ServerId) -> Result<Server, StoreError> {
        self.state
            .read()
            .await
            .servers
            .get(&id)
            .cloned()
            .ok_or(StoreError::ServerNotFound(id))
    }

    async fn create_manual_server(
        &self,
        name: &str,
        ipv4: Option<&str>,
    ) -> Result<Server, StoreError> {
        let mut server = Server::new(0, ProviderKind::Manual, name);
        server.product = "manual".to_string();
        server.data_center = "manual".to_string();
        server.ipv4 = ipv4.map(str::to_string);
        Ok(self.insert_server(server).await)
    }

    async fn upsert_provider_servers(
        &self,
        kind: ProviderKind,
        servers: &[ProviderServer],
    ) -> Result<UpsertSummary, StoreError> {
        let mut state = self.state.write().await;
        let mut summary = UpsertSummary::default();

        for remote in servers {
            let existing = state
                .servers
                .values()
                .find(|s| {
                    s.kind == kind && s.provider_id.as_deref() == Some(remote.provider_id.as_str())
                })
                .map(|s| s.id);

            let id = if let Some(id) = existing {
                summary.updated += 1;
                id
            } else {
                let id = state.allocate_server_id();
                let mut server = Server::new(id, kind, &remote.name);
                server.provider_id = Some(remote.provider_id.clone());
                state.servers.insert(id, server);
                summary.created += 1;
                id
            };

            let server = state.server_mut(id)?;
            server.name.clone_from(&remote.name);
            server.product.clone_from(&remote.product);
            server.data_center.clone_from(&remote.data_center);
            server.ipv4.clone_from(&remote.ipv4);
            server.ipv6.clone_from(&remote.ipv6);
            server.network_segment.clone_from(&remote.network_segment);
        }

        Ok(summary)
    }

    async fn apply_reachable(&self, updates: &[ReachableUpdate]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        // Check the whole batch before touching anything.
        if let Some(missing) = updates
            .iter()
            .find(|u| !state.servers.contains_key(&u.server_id))
        {
            return Err(StoreError::ServerNotFound(missing.server_id));
        }

        for update in updates {
            let server = state.server_mut(update.server_id)?;
            server.reachable = true;
            server.uuid = Some(update.metadata.uuid);
            server.lsblk = Some(update.metadata.lsblk.clone());
        }
        Ok(())
    }

    async fn mark_unreachable(&self, ids: &[ServerId]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for id in ids {
            if let Some(server) = state.servers.get_mut(id) {
                server.reachable = false;
            }
        }
        Ok(())
    }

    async fn start_bootstrap(
        &self,
        id: ServerId,
        start: &BootstrapStart,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let server = state.server_mut(id)?;
        server.reachable = false;
        server.bootstrap_disk_wwid.clone_from(&start.disk_wwid);
        server.bootstrap_disk = Some(start.disk_path.clone());
        server.talos_schematic_id.clone_from(&start.schematic_id);
        server.last_request_for_configuration_at = None;
        server.last_configured_at = None;
        server.label_and_taint_job_completed_at = None;
        Ok(())
    }

    async fn record_lifecycle(
        &self,
        id: ServerId,
        event: LifecycleEvent,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let server = state.server_mut(id)?;
        match event {
            LifecycleEvent::ConfigurationRequested => {
                server.last_request_for_configuration_at = Some(at);
            }
            LifecycleEvent::Configured => server.last_configured_at = Some(at),
            LifecycleEvent::LabelAndTaintCompleted => {
                server.label_and_taint_job_completed_at = Some(at);
            }
        }
        Ok(())
    }

    async fn assign_server(
        &self,
        id: ServerId,
        assignment: &ServerAssignment,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(cluster_id) = assignment.cluster_id {
            if !state.clusters.contains_key(&cluster_id) {
                return Err(StoreError::ClusterNotFound(cluster_id));
            }
        }
        let server = state.server_mut(id)?;
        server.cluster_id = assignment.cluster_id;
        server.machine_config.clone_from(&assignment.machine_config);
        Ok(())
    }

    async fn create_cluster(&self, name: &str) -> Result<Cluster, StoreError> {
        let mut state = self.state.write().await;
        state.next_cluster_id += 1;
        let cluster = Cluster {
            id: state.next_cluster_id,
            name: name.to_string(),
        };
        state.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    async fn get_cluster(&self, id: ClusterId) -> Result<Cluster, StoreError> {
        self.state
            .read()
            .await
            .clusters
            .get(&id)
            .cloned()
            .ok_or(StoreError::ClusterNotFound(id))
    }

    async fn cluster_servers(&self, id: ClusterId) -> Result<Vec<Server>, StoreError> {
        let state = self.state.read().await;
        if !state.clusters.contains_key(&id) {
            return Err(StoreError::ClusterNotFound(id));
        }
        Ok(state
            .servers
            .values()
            .filter(|s| s.cluster_id == Some(id))
            .cloned()
            .collect())
    }

    async fn save_template(
        &self,
        template: &MachineConfigTemplate,
    ) -> Result<MachineConfigTemplate, StoreError> {
        let mut state = self.state.write().await;
        let version = state
            .templates
            .get(&template.name)
            .map_or(1, |existing| existing.version + 1);
        let saved = MachineConfigTemplate {
            version,
            ..template.clone()
        };
        state.templates.insert(saved.name.clone(), saved.clone());
        Ok(saved)
    }

    async fn get_template(&self, name: &str) -> Result<MachineConfigTemplate, StoreError> {
        self.state
            .read()
            .await
            .templates
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::TemplateNotFound(name.to_string()))
    }
}
