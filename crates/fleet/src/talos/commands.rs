//! `talosctl` command lines for fleet nodes.

use super::InstallerImage;
use crate::model::Server;

/// Arguments of one `talosctl` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalosCommand {
    /// Arguments after the binary name.
    pub args: Vec<String>,
}

impl std::fmt::Display for TalosCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "talosctl {}", self.args.join(" "))
    }
}

/// Address `talosctl` uses to reach a node: its public IPv4, else its
/// private IP from the machine config binding.
#[must_use]
pub fn node_address(server: &Server) -> Option<&str> {
    server.ipv4.as_deref().or_else(|| {
        server
            .machine_config
            .as_ref()
            .map(|b| b.private_ip.as_str())
    })
}

fn targeted(endpoint: &str, node: &str, rest: &[&str]) -> Vec<String> {
    let mut args = vec![
        "--endpoints".to_string(),
        endpoint.to_string(),
        "--nodes".to_string(),
        node.to_string(),
    ];
    args.extend(rest.iter().map(|a| (*a).to_string()));
    args
}

/// Wipe a node and reboot it into maintenance mode.
#[must_use]
pub fn reset_args(endpoint: &str, node: &str) -> Vec<String> {
    targeted(endpoint, node, &["reset", "--graceful=false", "--reboot"])
}

/// Command an operator runs to reboot `server`.
#[must_use]
pub fn reboot_command(server: &Server, endpoint: &str) -> Option<TalosCommand> {
    let node = node_address(server)?;
    Some(TalosCommand {
        args: targeted(endpoint, node, &["reboot"]),
    })
}

/// Command an operator runs to upgrade `server` to `version`, keeping its schematic.
#[must_use]
pub fn upgrade_command(server: &Server, endpoint: &str, version: &str) -> Option<TalosCommand> {
    let node = node_address(server)?;
    let image = InstallerImage::for_server(server, version).reference();
    Some(TalosCommand {
        args: targeted(endpoint, node, &["upgrade", "--image", &image]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MachineConfigBinding, MachineRole, ProviderKind};

    fn server() -> Server {
        let mut s = Server::new(3, ProviderKind::HetznerDedicated, "worker-3");
        s.ipv4 = Some("203.0.113.30".into());
        s.talos_schematic_id = Some("abc123".into());
        s
    }

    #[test]
    fn test_reboot_command() {
        let cmd = reboot_command(&server(), "203.0.113.10").unwrap();
        assert_eq!(
            cmd.to_string(),
            "talosctl --endpoints 203.0.113.10 --nodes 203.0.113.30 reboot"
        );
    }

    #[test]
    fn test_upgrade_command_uses_server_schematic() {
        let cmd = upgrade_command(&server(), "203.0.113.10", "v1.9.2").unwrap();
        assert_eq!(
            cmd.to_string(),
            "talosctl --endpoints 203.0.113.10 --nodes 203.0.113.30 upgrade --image factory.talos.dev/installer/abc123:v1.9.2"
        );
    }

    #[test]
    fn test_private_ip_is_used_without_public_address() {
        let mut s = server();
        s.ipv4 = None;
        s.machine_config = Some(MachineConfigBinding {
            template: "workers".into(),
            hostname: "worker-3".into(),
            private_ip: "10.0.1.3".into(),
            role: MachineRole::Worker,
        });
        assert_eq!(node_address(&s), Some("10.0.1.3"));

        s.machine_config = None;
        assert!(reboot_command(&s, "10.0.1.1").is_none());
    }

    #[test]
    fn test_reset_is_not_graceful() {
        let args = reset_args("10.0.0.1", "10.0.0.2");
        assert_eq!(&args[4..], ["reset", "--graceful=false", "--reboot"]);
    }
}
