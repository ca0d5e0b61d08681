//! Fleet CLI - reconcile Hetzner servers and bootstrap them with Talos.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleet::config::{self, ConfigOverrides, FleetConfig};
use fleet::cycle::ReconciliationCycle;
use fleet::jobs::{ChannelJobQueue, JobQueue};
use fleet::machine_config::{
    validate_template, MachineConfigTemplate, TalosctlValidator, TemplateService,
};
use fleet::mirror::{ProviderMirror, ProviderSync};
use fleet::model::{ClusterId, MachineConfigBinding, MachineRole};
use fleet::probe::{Prober, SshExecutor};
use fleet::providers::hetzner::Hetzner;
use fleet::providers::hetzner_cloud::HetznerCloud;
use fleet::talos::Talosctl;
use fleet::store::ServerAssignment;
use fleet::{
    BootstrapOrchestrator, BootstrapRequest, MemoryStore, PgStore, ProviderRegistry, ServerId,
    ServerStore,
};

/// Fleet CLI - server reconciliation and Talos bootstrap.
#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Reconcile Hetzner servers and bootstrap them with Talos")]
struct Cli {
    /// Config file (default `~/.fleet/config.yaml`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// PostgreSQL URL (or set `DATABASE_URL` env var).
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Hetzner Robot user (or set `HETZNER_ROBOT_USER` env var).
    #[arg(long, env = "HETZNER_ROBOT_USER")]
    robot_user: Option<String>,

    /// Hetzner Robot password (or set `HETZNER_ROBOT_PASSWORD` env var).
    #[arg(long, env = "HETZNER_ROBOT_PASSWORD", hide_env_values = true)]
    robot_password: Option<String>,

    /// Hetzner Cloud API token (or set `HCLOUD_TOKEN` env var).
    #[arg(long, env = "HCLOUD_TOKEN", hide_env_values = true)]
    hcloud_token: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all servers with reachability and bootstrap phase.
    List,

    /// Run one reconciliation cycle (provider sync, probe, merge).
    Sync,

    /// Run reconciliation cycles periodically until interrupted.
    Watch {
        /// Seconds between cycles (defaults to `sync.interval_secs`).
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Manage clusters.
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },

    /// Set a server's cluster and machine config binding.
    Assign {
        /// Server ID.
        #[arg(long)]
        id: ServerId,

        /// Cluster ID (omit to leave the cluster).
        #[arg(long)]
        cluster: Option<ClusterId>,

        /// Machine config template name.
        #[arg(long)]
        template: Option<String>,

        /// Hostname rendered into the machine config.
        #[arg(long, requires = "template")]
        hostname: Option<String>,

        /// Private network address rendered into the machine config.
        #[arg(long, requires = "template")]
        private_ip: Option<String>,

        /// Role within the cluster (`controlplane` or `worker`).
        #[arg(long, requires = "template")]
        role: Option<MachineRole>,
    },

    /// Print the rendered machine config of a server.
    RenderConfig {
        /// Server ID.
        #[arg(long)]
        id: ServerId,
    },

    /// Register a server that no provider manages.
    AddManual {
        /// Server name.
        #[arg(long)]
        name: String,

        /// Public IPv4 address.
        #[arg(long)]
        ipv4: Option<String>,
    },

    /// Bootstrap a server with Talos.
    Bootstrap {
        /// Server ID.
        #[arg(long)]
        id: ServerId,

        /// Talos version (defaults to `talos.default_version`).
        #[arg(long)]
        talos_version: Option<String>,

        /// Talos Image Factory schematic ID.
        #[arg(long)]
        schematic_id: Option<String>,

        /// WWN of the install disk (required for dedicated servers).
        #[arg(long)]
        disk_wwn: Option<String>,
    },

    /// Reboot a server into the provider's rescue system.
    Rescue {
        /// Server ID.
        #[arg(long)]
        id: ServerId,
    },

    /// Reset a Talos node through its cluster control plane.
    Reset {
        /// Server ID.
        #[arg(long)]
        id: ServerId,
    },

    /// Validate a machine config template, optionally saving it.
    ValidateTemplate {
        /// Template file.
        #[arg(long)]
        file: PathBuf,

        /// Template name.
        #[arg(long)]
        name: String,

        /// Default install disk.
        #[arg(long, default_value = "/dev/sda")]
        install_disk: String,

        /// Installer image reference.
        #[arg(long)]
        install_image: String,

        /// Kubernetes version.
        #[arg(long)]
        kubernetes_version: String,

        /// Persist the template when valid.
        #[arg(long, default_value = "false")]
        save: bool,
    },

    /// Print the talosctl command that reboots a server.
    RebootCommand {
        /// Server ID.
        #[arg(long)]
        id: ServerId,
    },

    /// Print the talosctl command that upgrades a server.
    UpgradeCommand {
        /// Server ID.
        #[arg(long)]
        id: ServerId,

        /// Target Talos version.
        #[arg(long)]
        talos_version: String,
    },
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Create a cluster.
    Create {
        /// Cluster name.
        #[arg(long)]
        name: String,
    },

    /// List the servers of a cluster.
    Members {
        /// Cluster ID.
        #[arg(long)]
        id: ClusterId,
    },
}

/// Store and job queue selected from the configuration.
async fn open_backend(
    config: &FleetConfig,
) -> Result<(Arc<dyn ServerStore>, Arc<dyn JobQueue>)> {
    if let Some(url) = &config.database_url {
        let store = Arc::new(
            PgStore::connect(url)
                .await
                .context("Failed to connect to database")?,
        );
        store.ensure_schema().await.context("Failed to prepare schema")?;
        let jobs: Arc<dyn JobQueue> = store.clone();
        let store: Arc<dyn ServerStore> = store;
        return Ok((store, jobs));
    }

    warn!("No database configured, using an in-memory store");
    let (queue, mut jobs) = ChannelJobQueue::channel();
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            warn!(
                server_id = job.server_id,
                talos_version = %job.talos_version,
                "No provisioning worker attached, dropping job"
            );
        }
    });
    let store: Arc<dyn ServerStore> = Arc::new(MemoryStore::new());
    Ok((store, Arc::new(queue)))
}

fn build_providers(config: &FleetConfig) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    let hetzner = &config.hetzner;

    if let (Some(user), Some(password)) = (&hetzner.robot_user, &hetzner.robot_password) {
        let mut robot = Hetzner::new(user, password)
            .context("Failed to create Robot client")?
            .with_authorized_keys(hetzner.robot_authorized_keys.clone());
        if hetzner.robot_authorized_keys.is_empty() {
            warn!("No Robot key fingerprints configured, rescued servers will refuse probes");
        }
        if let Some(url) = &hetzner.robot_base_url {
            robot = robot.with_base_url(url);
        }
        registry = registry.with(Arc::new(robot));
    }
    if let Some(token) = &hetzner.cloud_token {
        let mut cloud = HetznerCloud::new(token)
            .context("Failed to create Cloud client")?
            .with_rescue_ssh_keys(hetzner.cloud_ssh_keys.clone());
        if hetzner.cloud_ssh_keys.is_empty() {
            warn!("No Cloud SSH key ids configured, rescued servers will refuse probes");
        }
        if let Some(url) = &hetzner.cloud_base_url {
            cloud = cloud.with_base_url(url);
        }
        registry = registry.with(Arc::new(cloud));
    }

    if registry.is_empty() {
        warn!("No provider credentials configured");
    }
    Ok(registry)
}

fn build_cycle(
    config: &FleetConfig,
    store: Arc<dyn ServerStore>,
    providers: ProviderRegistry,
) -> ReconciliationCycle {
    let mut ssh = SshExecutor::new(&config.probe.ssh_user)
        .with_connect_timeout(config.probe.timeout_secs);
    if let Some(key) = &config.probe.identity_file {
        ssh = ssh.with_identity_file(key);
    }
    let prober = Prober::new(Arc::new(ssh))
        .with_concurrency(config.probe.concurrency)
        .with_timeout(config.probe.timeout());

    ReconciliationCycle::new(
        Arc::clone(&store),
        ProviderMirror::new(store, providers),
        prober,
    )
}

fn template_validator(config: &FleetConfig) -> Arc<TalosctlValidator> {
    Arc::new(
        TalosctlValidator::new(
            config.validator.talosctl.clone(),
            Duration::from_secs(config.validator.timeout_secs),
        )
        .with_mode(config.validator.mode.clone()),
    )
}

/// Resolves when Ctrl-C is received; never, if the handler cannot be installed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, stop the process to exit");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = cli.config.clone().or_else(config::default_path);
    let config = match &config_path {
        Some(path) => FleetConfig::load(path).await?,
        None => FleetConfig::default(),
    }
    .with_overrides(ConfigOverrides {
        database_url: cli.database_url,
        robot_user: cli.robot_user,
        robot_password: cli.robot_password,
        cloud_token: cli.hcloud_token,
    });

    let (store, jobs) = open_backend(&config).await?;
    let providers = build_providers(&config)?;
    let talosctl = Talosctl::new(
        config.validator.talosctl.clone(),
        config.talos.talosconfig.clone(),
    )
    .with_timeout(Duration::from_secs(config.talos.timeout_secs));
    let orchestrator = BootstrapOrchestrator::new(
        Arc::clone(&store),
        jobs,
        providers.clone(),
        Arc::new(talosctl),
    );

    match cli.command {
        Commands::List => {
            let servers = store.list_servers().await?;
            println!(
                "\n{:<6} {:<24} {:<18} {:<16} {:<10} {:<24}",
                "ID", "NAME", "KIND", "IPv4", "REACHABLE", "PHASE"
            );
            println!("{}", "-".repeat(102));
            for s in &servers {
                println!(
                    "{:<6} {:<24} {:<18} {:<16} {:<10} {:<24}",
                    s.id,
                    s.name,
                    s.kind,
                    s.ipv4.as_deref().unwrap_or("-"),
                    s.reachable,
                    s.bootstrap_phase()
                );
            }
            println!("\nTotal: {} servers", servers.len());
        }

        Commands::Sync => {
            let cycle = build_cycle(&config, Arc::clone(&store), providers);
            let report = cycle.run_once().await?;
            for (kind, outcome) in &report.sync.providers {
                match outcome {
                    ProviderSync::Synced(s) => {
                        println!("{kind}: {} created, {} updated", s.created, s.updated);
                    }
                    ProviderSync::Failed(reason) => println!("{kind}: sync failed: {reason}"),
                }
            }
            println!(
                "Reachable: {}, unreachable: {}",
                report.reconcile.reachable, report.reconcile.unreachable
            );
        }

        Commands::Watch { interval_secs } => {
            let interval =
                Duration::from_secs(interval_secs.unwrap_or(config.sync.interval_secs));
            let cycle = build_cycle(&config, Arc::clone(&store), providers);
            info!(interval_secs = interval.as_secs(), "Starting periodic reconciliation");
            let cycles = cycle.run_until(interval, shutdown_signal()).await;
            info!(cycles, "Stopped periodic reconciliation");
        }

        Commands::Cluster { command } => match command {
            ClusterCommands::Create { name } => {
                let cluster = store.create_cluster(&name).await?;
                println!("Created cluster {} with id {}", cluster.name, cluster.id);
            }
            ClusterCommands::Members { id } => {
                let cluster = store.get_cluster(id).await?;
                println!("Cluster {} ({})", cluster.name, cluster.id);
                for s in store.cluster_servers(id).await? {
                    let role = s.machine_config.as_ref().map_or("-", |b| b.role.as_str());
                    println!("{:<6} {:<24} {:<14} {}", s.id, s.name, role, s.bootstrap_phase());
                }
            }
        },

        Commands::Assign {
            id,
            cluster,
            template,
            hostname,
            private_ip,
            role,
        } => {
            let machine_config = match (template, hostname, private_ip, role) {
                (Some(template), Some(hostname), Some(private_ip), Some(role)) => {
                    Some(MachineConfigBinding {
                        template,
                        hostname,
                        private_ip,
                        role,
                    })
                }
                (None, ..) => None,
                _ => bail!("--template needs --hostname, --private-ip and --role"),
            };
            let server = orchestrator
                .assign(
                    id,
                    &ServerAssignment {
                        cluster_id: cluster,
                        machine_config,
                    },
                )
                .await?;
            println!("Assigned {} to cluster {:?}", server.name, server.cluster_id);
        }

        Commands::RenderConfig { id } => {
            let service = TemplateService::new(Arc::clone(&store), template_validator(&config));
            print!("{}", service.render_for_server(id).await?);
        }

        Commands::AddManual { name, ipv4 } => {
            let server = store.create_manual_server(&name, ipv4.as_deref()).await?;
            println!("Registered {} with id {}", server.name, server.id);
        }

        Commands::Bootstrap {
            id,
            talos_version,
            schematic_id,
            disk_wwn,
        } => {
            let request = BootstrapRequest {
                talos_version: talos_version
                    .unwrap_or_else(|| config.talos.default_version.clone()),
                schematic_id,
                disk_wwn,
            };
            let server = orchestrator.bootstrap(id, &request).await?;
            println!(
                "Server {} is being bootstrapped onto {}",
                server.name,
                server.bootstrap_disk.as_deref().unwrap_or("-")
            );
        }

        Commands::Rescue { id } => {
            orchestrator.rescue(id).await?;
            let server = store.get_server(id).await?;
            println!("Server {} is rebooting in rescue mode", server.name);
        }

        Commands::Reset { id } => {
            let server = store.get_server(id).await?;
            if orchestrator.reset(id).await? {
                println!("Server {} is being reset", server.name);
            } else {
                bail!("Failed to execute talosctl reset for {}", server.name);
            }
        }

        Commands::ValidateTemplate {
            file,
            name,
            install_disk,
            install_image,
            kubernetes_version,
            save,
        } => {
            let body = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let template = MachineConfigTemplate::new(
                name,
                body,
                install_disk,
                install_image,
                kubernetes_version,
            );
            let validator = template_validator(&config);

            if save {
                let saved = TemplateService::new(Arc::clone(&store), validator)
                    .save(&template)
                    .await?;
                println!("Saved {} (version {})", saved.name, saved.version);
            } else {
                validate_template(&template, validator.as_ref()).await?;
                println!("Template {} is valid", template.name);
            }
        }

        Commands::RebootCommand { id } => {
            println!("{}", orchestrator.reboot_command(id).await?);
        }

        Commands::UpgradeCommand { id, talos_version } => {
            println!("{}", orchestrator.upgrade_command(id, &talos_version).await?);
        }
    }

    Ok(())
}
