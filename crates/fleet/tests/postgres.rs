//! PostgreSQL store against a live database.
//!
//! Run with `DATABASE_URL` pointing at a disposable database:
//! `cargo test -p fleet --test postgres -- --ignored`. Every test works in
//! its own schema.

use chrono::Utc;
use fleet::machine_config::MachineConfigTemplate;
use fleet::model::{
    BootstrapMetadata, BootstrapStart, LifecycleEvent, ProviderServer, ReachableUpdate,
};
use fleet::store::{ServerAssignment, StoreError, UpsertSummary};
use fleet::{BootstrapPhase, PgStore, ProviderKind, ServerStore};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

async fn store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for these tests");
    let schema = format!("fleet_test_{}", Uuid::new_v4().simple());

    let admin = PgPool::connect(&url).await.unwrap();
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await
        .unwrap();
    admin.close().await;

    let search_path = format!("SET search_path TO {schema}");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .after_connect(move |conn, _meta| {
            let search_path = search_path.clone();
            Box::pin(async move {
                sqlx::query(&search_path).execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .unwrap();

    let store = PgStore::from_pool(pool);
    store.ensure_schema().await.unwrap();
    store
}

fn remote(id: &str, name: &str) -> ProviderServer {
    ProviderServer {
        provider_id: id.into(),
        name: name.into(),
        product: "AX52".into(),
        data_center: "FSN1-DC14".into(),
        ipv4: Some(format!("203.0.113.{id}")),
        ipv6: None,
        network_segment: Some("4711".into()),
    }
}

fn metadata(n: u128) -> BootstrapMetadata {
    BootstrapMetadata {
        uuid: Uuid::from_u128(n),
        lsblk: serde_json::from_str(
            r#"{"blockdevices": [{"name": "nvme0n1", "type": "disk", "wwn": "eui.00253881"}]}"#,
        )
        .unwrap(),
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
async fn test_upsert_is_idempotent() {
    let store = store().await;
    let kind = ProviderKind::HetznerDedicated;

    let first = store
        .upsert_provider_servers(kind, &[remote("1", "node-a"), remote("2", "node-b")])
        .await
        .unwrap();
    assert_eq!(
        first,
        UpsertSummary {
            created: 2,
            updated: 0
        }
    );

    let before = store.list_servers().await.unwrap();
    let second = store
        .upsert_provider_servers(kind, &[remote("1", "node-a"), remote("2", "node-b")])
        .await
        .unwrap();
    assert_eq!(
        second,
        UpsertSummary {
            created: 0,
            updated: 2
        }
    );
    assert_eq!(store.list_servers().await.unwrap(), before);

    // Same provider id under another kind is a different server.
    store
        .upsert_provider_servers(ProviderKind::HetznerCloud, &[remote("1", "web-1")])
        .await
        .unwrap();
    assert_eq!(store.list_servers().await.unwrap().len(), 3);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
async fn test_upsert_keeps_reachability_fields() {
    let store = store().await;
    let kind = ProviderKind::HetznerCloud;
    store
        .upsert_provider_servers(kind, &[remote("9", "web-9")])
        .await
        .unwrap();
    let id = store.list_servers().await.unwrap()[0].id;

    store
        .apply_reachable(&[ReachableUpdate {
            server_id: id,
            metadata: metadata(9),
        }])
        .await
        .unwrap();
    store
        .upsert_provider_servers(kind, &[remote("9", "web-9-renamed")])
        .await
        .unwrap();

    let server = store.get_server(id).await.unwrap();
    assert_eq!(server.name, "web-9-renamed");
    assert!(server.reachable);
    assert_eq!(server.uuid, Some(Uuid::from_u128(9)));
    assert_eq!(server.lsblk, Some(metadata(9).lsblk));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
async fn test_reachable_batch_is_all_or_nothing() {
    let store = store().await;
    let a = store.create_manual_server("a", Some("192.0.2.1")).await.unwrap();
    let b = store.create_manual_server("b", Some("192.0.2.2")).await.unwrap();
    let missing = b.id + 1000;

    let err = store
        .apply_reachable(&[
            ReachableUpdate {
                server_id: a.id,
                metadata: metadata(1),
            },
            ReachableUpdate {
                server_id: missing,
                metadata: metadata(2),
            },
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ServerNotFound(id) if id == missing));
    assert_eq!(store.get_server(a.id).await.unwrap(), a);

    store
        .apply_reachable(&[
            ReachableUpdate {
                server_id: a.id,
                metadata: metadata(1),
            },
            ReachableUpdate {
                server_id: b.id,
                metadata: metadata(2),
            },
        ])
        .await
        .unwrap();
    for (id, n) in [(a.id, 1), (b.id, 2)] {
        let server = store.get_server(id).await.unwrap();
        assert!(server.reachable);
        assert_eq!(server.uuid, Some(Uuid::from_u128(n)));
    }

    store.mark_unreachable(&[a.id]).await.unwrap();
    let a = store.get_server(a.id).await.unwrap();
    assert!(!a.reachable);
    assert_eq!(a.uuid, Some(Uuid::from_u128(1)));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
async fn test_bootstrap_start_and_lifecycle_columns() {
    let store = store().await;
    let server = store.create_manual_server("n", None).await.unwrap();
    store
        .record_lifecycle(server.id, LifecycleEvent::Configured, Utc::now())
        .await
        .unwrap();

    store
        .start_bootstrap(
            server.id,
            &BootstrapStart {
                disk_wwid: Some("eui.00253881".into()),
                disk_path: "/dev/nvme0n1".into(),
                schematic_id: Some("abc".into()),
            },
        )
        .await
        .unwrap();
    let started = store.get_server(server.id).await.unwrap();
    assert_eq!(started.bootstrap_phase(), BootstrapPhase::Requested);
    assert!(started.last_configured_at.is_none());
    assert_eq!(started.talos_schematic_id.as_deref(), Some("abc"));

    store
        .record_lifecycle(server.id, LifecycleEvent::ConfigurationRequested, Utc::now())
        .await
        .unwrap();
    assert_eq!(
        store.get_server(server.id).await.unwrap().bootstrap_phase(),
        BootstrapPhase::ConfigurationRequested
    );

    assert!(matches!(
        store
            .record_lifecycle(server.id + 1000, LifecycleEvent::Configured, Utc::now())
            .await,
        Err(StoreError::ServerNotFound(_))
    ));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
async fn test_template_versions_increment() {
    let store = store().await;
    let template = MachineConfigTemplate::new(
        "workers",
        "machine:\n  network:\n    hostname: ${hostname} # ${private_ip}\n",
        "/dev/sda",
        "factory.talos.dev/installer/abc:v1.9.0",
        "1.32.0",
    );

    assert_eq!(store.save_template(&template).await.unwrap().version, 1);
    assert_eq!(store.save_template(&template).await.unwrap().version, 2);

    let stored = store.get_template("workers").await.unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.body, template.body);
    assert!(matches!(
        store.get_template("absent").await,
        Err(StoreError::TemplateNotFound(_))
    ));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
async fn test_assignment_requires_existing_cluster() {
    let store = store().await;
    let server = store.create_manual_server("n", None).await.unwrap();

    let err = store
        .assign_server(
            server.id,
            &ServerAssignment {
                cluster_id: Some(4242),
                machine_config: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ClusterNotFound(4242)));

    let cluster = store.create_cluster("prod").await.unwrap();
    store
        .assign_server(
            server.id,
            &ServerAssignment {
                cluster_id: Some(cluster.id),
                machine_config: None,
            },
        )
        .await
        .unwrap();
    let members = store.cluster_servers(cluster.id).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].id, server.id);
}
