//! Hetzner Cloud API request and response models.

use serde::{Deserialize, Serialize};

/// Response of `GET /v1/servers`.
#[derive(Debug, Deserialize)]
pub struct ServerListResponse {
    /// Servers on this page.
    #[serde(default)]
    pub servers: Vec<CloudServer>,
    /// Pagination metadata.
    #[serde(default)]
    pub meta: Option<Meta>,
}

/// Response metadata.
#[derive(Debug, Deserialize)]
pub struct Meta {
    /// Pagination details.
    pub pagination: Pagination,
}

/// Pagination details.
#[derive(Debug, Deserialize)]
pub struct Pagination {
    /// Current page.
    pub page: u32,
    /// Next page, absent on the last page.
    pub next_page: Option<u32>,
}

/// A Hetzner Cloud server.
#[derive(Debug, Deserialize)]
pub struct CloudServer {
    /// Server id.
    pub id: i64,
    /// Server name.
    pub name: String,
    /// Server status (`running`, `off`, ...).
    pub status: String,
    /// Server type.
    pub server_type: ServerType,
    /// Data center.
    pub datacenter: Datacenter,
    /// Public networking.
    pub public_net: PublicNet,
    /// Attached private networks.
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
}

/// Server type reference.
#[derive(Debug, Deserialize)]
pub struct ServerType {
    /// Type name (e.g. `cx22`).
    pub name: String,
}

/// Data center reference.
#[derive(Debug, Deserialize)]
pub struct Datacenter {
    /// Data center name (e.g. `fsn1-dc14`).
    pub name: String,
}

/// Public networking.
#[derive(Debug, Deserialize)]
pub struct PublicNet {
    /// Primary IPv4.
    pub ipv4: Option<IpAddress>,
    /// Primary IPv6 network.
    pub ipv6: Option<IpAddress>,
}

/// An address entry.
#[derive(Debug, Deserialize)]
pub struct IpAddress {
    /// Address or network in CIDR notation.
    pub ip: String,
}

/// Private network attachment.
#[derive(Debug, Deserialize)]
pub struct PrivateNet {
    /// Network id.
    pub network: i64,
    /// Address inside the network.
    pub ip: String,
}

/// Body of `POST /v1/servers/{id}/actions/enable_rescue`.
#[derive(Debug, Serialize)]
pub struct EnableRescueRequest {
    /// Rescue image type.
    #[serde(rename = "type")]
    pub rescue_type: String,
    /// SSH key ids to inject.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<i64>,
}

/// Response carrying an action.
#[derive(Debug, Deserialize)]
pub struct ActionResponse {
    /// The action that was started.
    pub action: Action,
}

/// A server action.
#[derive(Debug, Deserialize)]
pub struct Action {
    /// Action id.
    pub id: i64,
    /// Command name.
    pub command: String,
    /// `running`, `success` or `error`.
    pub status: String,
}
