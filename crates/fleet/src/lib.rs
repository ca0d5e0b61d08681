//! Server fleet reconciliation and Talos bootstrap orchestration.
//!
//! Keeps a local view of Hetzner Robot and Hetzner Cloud servers in sync
//! with the providers, probes every server over SSH to record which ones are
//! reachable (with their hardware UUID and disks), and drives servers through
//! the Talos bootstrap lifecycle.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use fleet::cycle::ReconciliationCycle;
//! use fleet::mirror::ProviderMirror;
//! use fleet::probe::{Prober, SshExecutor};
//! use fleet::providers::{hetzner::Hetzner, ProviderRegistry};
//! use fleet::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let providers = ProviderRegistry::new().with(Arc::new(Hetzner::new("user", "pass")?));
//!     let cycle = ReconciliationCycle::new(
//!         store.clone(),
//!         ProviderMirror::new(store.clone(), providers),
//!         Prober::new(Arc::new(SshExecutor::default())),
//!     );
//!
//!     let report = cycle.run_once().await?;
//!     println!("{} reachable", report.reconcile.reachable);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod cycle;
pub mod jobs;
pub mod machine_config;
pub mod mirror;
pub mod model;
pub mod orchestrator;
pub mod probe;
pub mod providers;
pub mod reconcile;
pub mod store;
pub mod talos;

pub use model::{BootstrapPhase, ProviderKind, Server, ServerId};
pub use orchestrator::{BootstrapOrchestrator, BootstrapRequest};
pub use providers::{Provider, ProviderError, ProviderRegistry};
pub use store::{MemoryStore, PgStore, ServerStore};
