//! Robot web service payloads used by the mirror and the rescue flow.

use serde::{Deserialize, Serialize};

/// Entry of `GET /server`; Robot wraps every record in a `server` key.
#[derive(Debug, Deserialize)]
pub struct HetznerServer {
    /// The record.
    pub server: ServerDetails,
}

/// Dedicated server as reported by Robot.
#[derive(Debug, Deserialize)]
pub struct ServerDetails {
    /// Robot server number, mirrored as the provider id.
    pub server_number: i64,
    /// Label set in the Robot console.
    pub server_name: String,
    /// Main public IPv4.
    #[serde(default)]
    pub server_ip: Option<String>,
    /// Routed IPv6 /64.
    #[serde(default)]
    pub server_ipv6_net: Option<String>,
    /// Product line, e.g. `AX52`.
    pub product: String,
    /// Data center, e.g. `FSN1-DC14`.
    pub dc: String,
    /// `ready` or `in process`.
    pub status: String,
    /// Cancelled servers are not mirrored.
    #[serde(default)]
    pub cancelled: bool,
}

/// Entry of `GET /vswitch`.
#[derive(Debug, Deserialize)]
pub struct VSwitch {
    /// Id used for `GET /vswitch/{id}`.
    pub id: i64,
    /// Label.
    pub name: String,
    /// VLAN tag (4000-4091).
    pub vlan: i32,
    /// Cancelled vSwitches are skipped.
    pub cancelled: bool,
}

/// Body of `GET /vswitch/{id}`.
#[derive(Debug, Deserialize)]
pub struct VSwitchDetails {
    /// Id, mirrored as the network segment.
    pub id: i64,
    /// Attached servers.
    #[serde(default)]
    pub server: Vec<VSwitchServer>,
}

/// A server attached to a vSwitch.
#[derive(Debug, Deserialize)]
pub struct VSwitchServer {
    /// Robot server number.
    pub server_number: i64,
    /// `ready`, `in process` or `failed`.
    #[serde(default)]
    pub status: Option<String>,
}

/// Form body of `POST /boot/{server_number}/rescue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueRequest {
    /// Rescue image, `linux` for the Debian based rescue system.
    pub os: String,
    /// Key fingerprints installed into the rescue system.
    pub authorized_key: Vec<String>,
}

impl RescueRequest {
    /// Form pairs; every fingerprint is sent as its own `authorized_key[]`.
    #[must_use]
    pub fn form_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![("os", self.os.as_str())];
        pairs.extend(
            self.authorized_key
                .iter()
                .map(|key| ("authorized_key[]", key.as_str())),
        );
        pairs
    }
}

/// Answer to a rescue activation.
#[derive(Debug, Deserialize)]
pub struct RescueResponse {
    /// Activation state.
    pub rescue: RescueDetails,
}

/// Rescue activation state.
#[derive(Debug, Deserialize)]
pub struct RescueDetails {
    /// Robot server number.
    pub server_number: i64,
    /// Whether the next boot enters rescue.
    pub active: bool,
    /// Generated root password, only present right after activation.
    pub password: Option<String>,
}

/// Form body of `POST /reset/{server_number}`.
#[derive(Debug, Serialize)]
pub struct ResetRequest {
    /// `hw`, `sw` or `power`.
    #[serde(rename = "type")]
    pub reset_type: String,
}
