//! PostgreSQL store.
//!
//! The reachable-set update runs as one `UPDATE ... FROM UNNEST(...)`
//! statement inside a transaction that first locks every target row. If the
//! server rejects the bulk statement, the same batch is retried as per-row
//! updates inside a single `SERIALIZABLE` transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{FromRow, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ServerAssignment, ServerStore, StoreError, UpsertSummary};
use crate::jobs::{JobError, JobQueue, ProvisioningJob};
use crate::machine_config::MachineConfigTemplate;
use crate::model::{
    BlockDeviceListing, BootstrapStart, Cluster, ClusterId, LifecycleEvent,
    MachineConfigBinding, ProviderKind, ProviderServer, ReachableUpdate, Server, ServerId,
};

/// Tables used by the store.
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS clusters (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS servers (
        id BIGSERIAL PRIMARY KEY,
        provider_id TEXT,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        product TEXT NOT NULL DEFAULT '',
        data_center TEXT NOT NULL DEFAULT '',
        ipv4 TEXT,
        ipv6 TEXT,
        network_segment TEXT,
        reachable BOOLEAN NOT NULL DEFAULT false,
        uuid UUID,
        lsblk JSONB,
        bootstrap_disk_wwid TEXT,
        bootstrap_disk TEXT,
        talos_schematic_id TEXT,
        cluster_id BIGINT REFERENCES clusters (id),
        machine_config JSONB,
        last_request_for_configuration_at TIMESTAMPTZ,
        last_configured_at TIMESTAMPTZ,
        label_and_taint_job_completed_at TIMESTAMPTZ,
        UNIQUE (kind, provider_id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS machine_config_templates (
        name TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        body TEXT NOT NULL,
        install_disk TEXT NOT NULL,
        install_image TEXT NOT NULL,
        kubernetes_version TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS provisioning_jobs (
        id BIGSERIAL PRIMARY KEY,
        server_id BIGINT NOT NULL REFERENCES servers (id),
        talos_version TEXT NOT NULL,
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
];

const SERVER_COLUMNS: &str = "id, provider_id, kind, name, product, data_center, ipv4, ipv6, \
    network_segment, reachable, uuid, lsblk, bootstrap_disk_wwid, bootstrap_disk, \
    talos_schematic_id, cluster_id, machine_config, last_request_for_configuration_at, \
    last_configured_at, label_and_taint_job_completed_at";

/// Store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

struct ServerRow(Server);

fn decode_error(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

impl<'r> FromRow<'r, PgRow> for ServerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let kind = kind
            .parse::<ProviderKind>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let lsblk: Option<serde_json::Value> = row.try_get("lsblk")?;
        let lsblk = lsblk
            .map(serde_json::from_value::<BlockDeviceListing>)
            .transpose()
            .map_err(decode_error)?;
        let machine_config: Option<serde_json::Value> = row.try_get("machine_config")?;
        let machine_config = machine_config
            .map(serde_json::from_value::<MachineConfigBinding>)
            .transpose()
            .map_err(decode_error)?;

        Ok(Self(Server {
            id: row.try_get("id")?,
            provider_id: row.try_get("provider_id")?,
            kind,
            name: row.try_get("name")?,
            product: row.try_get("product")?,
            data_center: row.try_get("data_center")?,
            ipv4: row.try_get("ipv4")?,
            ipv6: row.try_get("ipv6")?,
            network_segment: row.try_get("network_segment")?,
            reachable: row.try_get("reachable")?,
            uuid: row.try_get("uuid")?,
            lsblk,
            bootstrap_disk_wwid: row.try_get("bootstrap_disk_wwid")?,
            bootstrap_disk: row.try_get("bootstrap_disk")?,
            talos_schematic_id: row.try_get("talos_schematic_id")?,
            cluster_id: row.try_get("cluster_id")?,
            machine_config,
            last_request_for_configuration_at: row.try_get("last_request_for_configuration_at")?,
            last_configured_at: row.try_get("last_configured_at")?,
            label_and_taint_job_completed_at: row.try_get("label_and_taint_job_completed_at")?,
        }))
    }
}

impl<'r> FromRow<'r, PgRow> for MachineConfigTemplate {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            body: row.try_get("body")?,
            install_disk: row.try_get("install_disk")?,
            install_image: row.try_get("install_image")?,
            kubernetes_version: row.try_get("kubernetes_version")?,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

impl PgStore {
    /// Connect to `database_url`.
    ///
    /// # Errors
    /// Returns an error if the pool cannot connect.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist yet.
    ///
    /// # Errors
    /// Returns an error if a statement fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }

    fn reachable_columns(
        updates: &[ReachableUpdate],
    ) -> Result<(Vec<i64>, Vec<Uuid>, Vec<String>), StoreError> {
        let mut ids = Vec::with_capacity(updates.len());
        let mut uuids = Vec::with_capacity(updates.len());
        let mut listings = Vec::with_capacity(updates.len());
        for update in updates {
            ids.push(update.server_id);
            uuids.push(update.metadata.uuid);
            listings.push(
                serde_json::to_string(&update.metadata.lsblk)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            );
        }
        Ok((ids, uuids, listings))
    }

    /// One statement binding every row of the batch.
    async fn apply_reachable_bulk(&self, updates: &[ReachableUpdate]) -> Result<(), StoreError> {
        let (ids, uuids, listings) = Self::reachable_columns(updates)?;
        let mut tx = self.pool.begin().await?;

        let locked: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM servers WHERE id = ANY($1) FOR UPDATE")
                .bind(&ids)
                .fetch_all(&mut *tx)
                .await?;
        if let Some(missing) = ids.iter().find(|id| !locked.contains(id)) {
            return Err(StoreError::ServerNotFound(*missing));
        }

        sqlx::query(
            r"
            UPDATE servers SET
                reachable = true,
                uuid = v.uuid,
                lsblk = v.lsblk::jsonb
            FROM UNNEST($1::bigint[], $2::uuid[], $3::text[]) AS v(id, uuid, lsblk)
            WHERE servers.id = v.id
            ",
        )
        .bind(&ids)
        .bind(&uuids)
        .bind(&listings)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Per-row updates confined to one serializable transaction.
    async fn apply_reachable_per_row(&self, updates: &[ReachableUpdate]) -> Result<(), StoreError> {
        let (ids, uuids, listings) = Self::reachable_columns(updates)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        for ((id, uuid), lsblk) in ids.iter().zip(&uuids).zip(&listings) {
            let result = sqlx::query(
                "UPDATE servers SET reachable = true, uuid = $2, lsblk = $3::jsonb WHERE id = $1",
            )
            .bind(id)
            .bind(uuid)
            .bind(lsblk)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                return Err(StoreError::ServerNotFound(*id));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_servers(
        &self,
        filter: &str,
        cluster: Option<ClusterId>,
    ) -> Result<Vec<Server>, StoreError> {
        let sql = format!(
            "SELECT {SERVER_COLUMNS} FROM servers {filter} ORDER BY cluster_id NULLS FIRST, name"
        );
        let mut query = sqlx::query_as::<_, ServerRow>(&sql);
        if let Some(cluster_id) = cluster {
            query = query.bind(cluster_id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

#[async_trait]
impl ServerStore for PgStore {
    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        self.fetch_servers("", None).await
    }

    async fn get_server(&self, id: ServerId) -> Result<Server, StoreError> {
        let sql = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1");
        sqlx::query_as::<_, ServerRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.0)
            .ok_or(StoreError::ServerNotFound(id))
    }

    async fn create_manual_server(
        &self,
        name: &str,
        ipv4: Option<&str>,
    ) -> Result<Server, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO servers (kind, name, product, data_center, ipv4)
            VALUES ($1, $2, 'manual', 'manual', $3)
            RETURNING id
            ",
        )
        .bind(ProviderKind::Manual.as_str())
        .bind(name)
        .bind(ipv4)
        .fetch_one(&self.pool)
        .await?;

        self.get_server(id).await
    }

    async fn upsert_provider_servers(
        &self,
        kind: ProviderKind,
        servers: &[ProviderServer],
    ) -> Result<UpsertSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = UpsertSummary::default();

        for remote in servers {
            let inserted: bool = sqlx::query_scalar(
                r"
                INSERT INTO servers
                    (kind, provider_id, name, product, data_center, ipv4, ipv6, network_segment)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (kind, provider_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    product = EXCLUDED.product,
                    data_center = EXCLUDED.data_center,
                    ipv4 = EXCLUDED.ipv4,
                    ipv6 = EXCLUDED.ipv6,
                    network_segment = EXCLUDED.network_segment
                RETURNING (xmax = 0)
                ",
            )
            .bind(kind.as_str())
            .bind(&remote.provider_id)
            .bind(&remote.name)
            .bind(&remote.product)
            .bind(&remote.data_center)
            .bind(&remote.ipv4)
            .bind(&remote.ipv6)
            .bind(&remote.network_segment)
            .fetch_one(&mut *tx)
            .await?;

            if inserted {
                summary.created += 1;
            } else {
                summary.updated += 1;
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn apply_reachable(&self, updates: &[ReachableUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }

        match self.apply_reachable_bulk(updates).await {
            Err(StoreError::Database(sqlx::Error::Database(e))) => {
                warn!(error = %e, "Bulk reachable update rejected, retrying per row");
                self.apply_reachable_per_row(updates).await
            }
            Ok(()) => {
                debug!(count = updates.len(), "Applied reachable batch");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_unreachable(&self, ids: &[ServerId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE servers SET reachable = false WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn start_bootstrap(
        &self,
        id: ServerId,
        start: &BootstrapStart,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE servers SET
                reachable = false,
                bootstrap_disk_wwid = $2,
                bootstrap_disk = $3,
                talos_schematic_id = $4,
                last_request_for_configuration_at = NULL,
                last_configured_at = NULL,
                label_and_taint_job_completed_at = NULL
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(&start.disk_wwid)
        .bind(&start.disk_path)
        .bind(&start.schematic_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ServerNotFound(id));
        }
        Ok(())
    }

    async fn record_lifecycle(
        &self,
        id: ServerId,
        event: LifecycleEvent,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let column = match event {
            LifecycleEvent::ConfigurationRequested => "last_request_for_configuration_at",
            LifecycleEvent::Configured => "last_configured_at",
            LifecycleEvent::LabelAndTaintCompleted => "label_and_taint_job_completed_at",
        };
        let sql = format!("UPDATE servers SET {column} = $2 WHERE id = $1");
        let result = sqlx::query(&sql).bind(id).bind(at).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ServerNotFound(id));
        }
        Ok(())
    }

    async fn assign_server(
        &self,
        id: ServerId,
        assignment: &ServerAssignment,
    ) -> Result<(), StoreError> {
        if let Some(cluster_id) = assignment.cluster_id {
            self.get_cluster(cluster_id).await?;
        }
        let binding = assignment
            .machine_config
            .as_ref()
            .map(to_json)
            .transpose()?;

        let sql = "UPDATE servers SET cluster_id = $2, machine_config = $3 WHERE id = $1";
        let result = sqlx::query(sql)
            .bind(id)
            .bind(assignment.cluster_id)
            .bind(binding)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ServerNotFound(id));
        }
        Ok(())
    }

    async fn create_cluster(&self, name: &str) -> Result<Cluster, StoreError> {
        let id: i64 = sqlx::query_scalar("INSERT INTO clusters (name) VALUES ($1) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(Cluster {
            id,
            name: name.to_string(),
        })
    }

    async fn get_cluster(&self, id: ClusterId) -> Result<Cluster, StoreError> {
        let row = sqlx::query("SELECT id, name FROM clusters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ClusterNotFound(id))?;
        Ok(Cluster {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    async fn cluster_servers(&self, id: ClusterId) -> Result<Vec<Server>, StoreError> {
        self.get_cluster(id).await?;
        self.fetch_servers("WHERE cluster_id = $1", Some(id)).await
    }

    async fn save_template(
        &self,
        template: &MachineConfigTemplate,
    ) -> Result<MachineConfigTemplate, StoreError> {
        let saved = sqlx::query_as::<_, MachineConfigTemplate>(
            r"
            INSERT INTO machine_config_templates
                (name, version, body, install_disk, install_image, kubernetes_version)
            VALUES ($1, 1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE SET
                version = machine_config_templates.version + 1,
                body = EXCLUDED.body,
                install_disk = EXCLUDED.install_disk,
                install_image = EXCLUDED.install_image,
                kubernetes_version = EXCLUDED.kubernetes_version,
                updated_at = now()
            RETURNING name, version, body, install_disk, install_image, kubernetes_version
            ",
        )
        .bind(&template.name)
        .bind(&template.body)
        .bind(&template.install_disk)
        .bind(&template.install_image)
        .bind(&template.kubernetes_version)
        .fetch_one(&self.pool)
        .await?;
        Ok(saved)
    }

    async fn get_template(&self, name: &str) -> Result<MachineConfigTemplate, StoreError> {
        sqlx::query_as::<_, MachineConfigTemplate>(
            r"
            SELECT name, version, body, install_disk, install_image, kubernetes_version
            FROM machine_config_templates
            WHERE name = $1
            ",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::TemplateNotFound(name.to_string()))
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn enqueue(&self, job: ProvisioningJob) -> Result<(), JobError> {
        sqlx::query("INSERT INTO provisioning_jobs (server_id, talos_version) VALUES ($1, $2)")
            .bind(job.server_id)
            .bind(&job.talos_version)
            .execute(&self.pool)
            .await?;
        debug!(server_id = job.server_id, "Enqueued provisioning job");
        Ok(())
    }
}
