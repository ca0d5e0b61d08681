//! Fleet domain types: servers, clusters, block devices and bootstrap phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Internal server identifier.
pub type ServerId = i64;

/// Internal cluster identifier.
pub type ClusterId = i64;

/// Which system owns a server's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Registered by hand, no provider API behind it.
    Manual,
    /// Hetzner Cloud virtual server.
    HetznerCloud,
    /// Hetzner Robot dedicated server.
    HetznerDedicated,
}

/// How the install disk is chosen for a provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskSelection {
    /// Multi-disk machines: the operator picks a disk by WWN.
    Explicit,
    /// Single-disk machines: the only `disk` entry is used.
    SoleDisk,
    /// No automatable bootstrap path.
    Unsupported,
}

impl ProviderKind {
    /// Whether the server is managed through a provider API.
    #[must_use]
    pub fn is_provider_backed(self) -> bool {
        !matches!(self, Self::Manual)
    }

    /// Install disk strategy for this kind.
    #[must_use]
    pub fn disk_selection(self) -> DiskSelection {
        match self {
            Self::HetznerDedicated => DiskSelection::Explicit,
            Self::HetznerCloud => DiskSelection::SoleDisk,
            Self::Manual => DiskSelection::Unsupported,
        }
    }

    /// Whether bootstrap requires the caller to name a disk.
    #[must_use]
    pub fn supports_explicit_disk_selection(self) -> bool {
        self.disk_selection() == DiskSelection::Explicit
    }

    /// Stable string form, also used as the database column value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::HetznerCloud => "hetzner_cloud",
            Self::HetznerDedicated => "hetzner_dedicated",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "hetzner_cloud" => Ok(Self::HetznerCloud),
            "hetzner_dedicated" => Ok(Self::HetznerDedicated),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

/// One entry of an `lsblk --json` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Kernel device name, e.g. `sda` or `nvme0n1`.
    pub name: String,
    /// Device type as reported by lsblk (`disk`, `part`, `rom`, ...).
    #[serde(rename = "type")]
    pub device_type: String,
    /// World wide name, absent on most virtual disks.
    #[serde(default)]
    pub wwn: Option<String>,
    /// Nested partitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// Whether this entry is a whole disk.
    #[must_use]
    pub fn is_disk(&self) -> bool {
        self.device_type == "disk"
    }

    /// Device path under `/dev`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

/// Top-level `lsblk --json` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceListing {
    /// Top-level block devices.
    #[serde(default)]
    pub blockdevices: Vec<BlockDevice>,
}

impl BlockDeviceListing {
    /// Find a top-level device by WWN.
    #[must_use]
    pub fn find_by_wwn(&self, wwn: &str) -> Option<&BlockDevice> {
        self.blockdevices
            .iter()
            .find(|d| d.wwn.as_deref() == Some(wwn))
    }

    /// First top-level device of type `disk`.
    #[must_use]
    pub fn first_disk(&self) -> Option<&BlockDevice> {
        self.blockdevices.iter().find(|d| d.is_disk())
    }
}

/// Hardware facts gathered by a successful probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapMetadata {
    /// SMBIOS system UUID.
    pub uuid: Uuid,
    /// Block devices seen on the machine.
    pub lsblk: BlockDeviceListing,
}

/// Role a server plays once it joins its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineRole {
    /// Runs etcd and the Kubernetes control plane.
    Controlplane,
    /// Runs workloads only.
    Worker,
}

impl MachineRole {
    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controlplane => "controlplane",
            Self::Worker => "worker",
        }
    }
}

impl std::str::FromStr for MachineRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controlplane" => Ok(Self::Controlplane),
            "worker" => Ok(Self::Worker),
            other => Err(format!("unknown machine role: {other}")),
        }
    }
}

/// Ties a server to the template and values used to render its machine config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfigBinding {
    /// Name of the machine config template.
    pub template: String,
    /// Hostname substituted into the template.
    pub hostname: String,
    /// Private network address substituted into the template.
    pub private_ip: String,
    /// Role within the cluster.
    pub role: MachineRole,
}

/// A physical or virtual machine under management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Internal id.
    pub id: ServerId,
    /// Provider-assigned id (Robot server number or Cloud server id).
    pub provider_id: Option<String>,
    /// Provider kind.
    pub kind: ProviderKind,
    /// Display name.
    pub name: String,
    /// Product or server type (e.g. `AX52`, `cx22`).
    pub product: String,
    /// Data center or location.
    pub data_center: String,
    /// Public IPv4 address used for management.
    pub ipv4: Option<String>,
    /// Public IPv6 network.
    pub ipv6: Option<String>,
    /// Robot vSwitch id or Cloud private network id.
    pub network_segment: Option<String>,
    /// Accepts management connections and metadata is fresh.
    pub reachable: bool,
    /// SMBIOS UUID, known once reachable.
    pub uuid: Option<Uuid>,
    /// Last block device listing.
    pub lsblk: Option<BlockDeviceListing>,
    /// WWN of the selected install disk.
    pub bootstrap_disk_wwid: Option<String>,
    /// Device path of the selected install disk.
    pub bootstrap_disk: Option<String>,
    /// Talos image factory schematic.
    pub talos_schematic_id: Option<String>,
    /// Cluster membership.
    pub cluster_id: Option<ClusterId>,
    /// Machine config binding.
    pub machine_config: Option<MachineConfigBinding>,
    /// Last time the machine fetched its config.
    pub last_request_for_configuration_at: Option<DateTime<Utc>>,
    /// Last time the config was applied.
    pub last_configured_at: Option<DateTime<Utc>>,
    /// When the label and taint job finished.
    pub label_and_taint_job_completed_at: Option<DateTime<Utc>>,
}

impl Server {
    /// A blank server record of the given kind.
    #[must_use]
    pub fn new(id: ServerId, kind: ProviderKind, name: impl Into<String>) -> Self {
        Self {
            id,
            provider_id: None,
            kind,
            name: name.into(),
            product: String::new(),
            data_center: String::new(),
            ipv4: None,
            ipv6: None,
            network_segment: None,
            reachable: false,
            uuid: None,
            lsblk: None,
            bootstrap_disk_wwid: None,
            bootstrap_disk: None,
            talos_schematic_id: None,
            cluster_id: None,
            machine_config: None,
            last_request_for_configuration_at: None,
            last_configured_at: None,
            label_and_taint_job_completed_at: None,
        }
    }

    /// Whether the server is managed through a provider API.
    #[must_use]
    pub fn provider_backed(&self) -> bool {
        self.kind.is_provider_backed()
    }

    /// Whether this server is a control plane node.
    #[must_use]
    pub fn is_control_plane(&self) -> bool {
        self.machine_config
            .as_ref()
            .is_some_and(|b| b.role == MachineRole::Controlplane)
    }

    /// Bootstrap phase derived from the disk selection and lifecycle timestamps.
    #[must_use]
    pub fn bootstrap_phase(&self) -> BootstrapPhase {
        if self.bootstrap_disk.is_none() {
            return BootstrapPhase::Idle;
        }
        match (
            self.last_request_for_configuration_at,
            self.last_configured_at,
            self.label_and_taint_job_completed_at,
        ) {
            (_, _, Some(_)) => BootstrapPhase::Ready,
            (_, Some(_), None) => BootstrapPhase::Configured,
            (Some(_), None, None) => BootstrapPhase::ConfigurationRequested,
            (None, None, None) => BootstrapPhase::Requested,
        }
    }
}

/// Where a server is in its bootstrap lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    /// Never bootstrapped.
    Idle,
    /// Bootstrap job enqueued, machine has not asked for its config yet.
    Requested,
    /// Machine fetched its config.
    ConfigurationRequested,
    /// Config applied.
    Configured,
    /// Labels and taints applied, node is fully set up.
    Ready,
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Requested => write!(f, "requested"),
            Self::ConfigurationRequested => write!(f, "configuration_requested"),
            Self::Configured => write!(f, "configured"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Lifecycle events reported back by the provisioning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Machine fetched its rendered config.
    ConfigurationRequested,
    /// Config was applied.
    Configured,
    /// Label and taint job completed.
    LabelAndTaintCompleted,
}

impl LifecycleEvent {
    /// Phase the server is in after this event.
    #[must_use]
    pub fn target_phase(self) -> BootstrapPhase {
        match self {
            Self::ConfigurationRequested => BootstrapPhase::ConfigurationRequested,
            Self::Configured => BootstrapPhase::Configured,
            Self::LabelAndTaintCompleted => BootstrapPhase::Ready,
        }
    }

    /// Phase the server must be in (or already past into the target) for the event.
    #[must_use]
    pub fn required_phase(self) -> BootstrapPhase {
        match self {
            Self::ConfigurationRequested => BootstrapPhase::Requested,
            Self::Configured => BootstrapPhase::ConfigurationRequested,
            Self::LabelAndTaintCompleted => BootstrapPhase::Configured,
        }
    }

    /// Whether the event may be recorded while the server is in `phase`.
    ///
    /// A node fetches its config again on every reboot, so a configuration
    /// request is accepted in any phase after the bootstrap started and
    /// only refreshes its own timestamp.
    #[must_use]
    pub fn allowed_from(self, phase: BootstrapPhase) -> bool {
        match self {
            Self::ConfigurationRequested => phase >= BootstrapPhase::Requested,
            Self::Configured | Self::LabelAndTaintCompleted => {
                phase == self.required_phase() || phase == self.target_phase()
            }
        }
    }
}

/// Logical grouping of servers sharing a control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Internal id.
    pub id: ClusterId,
    /// Cluster name.
    pub name: String,
}

/// Inventory entry as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderServer {
    /// Provider-assigned id.
    pub provider_id: String,
    /// Name at the provider.
    pub name: String,
    /// Product or server type.
    pub product: String,
    /// Data center or location.
    pub data_center: String,
    /// Public IPv4.
    pub ipv4: Option<String>,
    /// Public IPv6 network.
    pub ipv6: Option<String>,
    /// vSwitch or private network id.
    pub network_segment: Option<String>,
}

/// Values written for one server in the reachable-set update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachableUpdate {
    /// Server to update.
    pub server_id: ServerId,
    /// Fresh metadata.
    pub metadata: BootstrapMetadata,
}

/// Fields written when a bootstrap starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStart {
    /// WWN of the chosen disk, if selected explicitly.
    pub disk_wwid: Option<String>,
    /// Device path of the chosen disk.
    pub disk_path: String,
    /// Talos image factory schematic.
    pub schematic_id: Option<String>,
}
