//! Talos Linux helpers.
//!
//! Installer image references from the Talos Image Factory, the `talosctl`
//! command lines operators run against fleet nodes, and the `talosctl reset`
//! invocation used by the orchestrator.

mod commands;
mod ctl;
mod image;

pub use commands::{node_address, reboot_command, reset_args, upgrade_command, TalosCommand};
pub use ctl::{TalosControl, Talosctl, TalosctlError, DEFAULT_TALOSCTL_TIMEOUT};
pub use image::{InstallerImage, DEFAULT_SCHEMATIC_ID, DEFAULT_TALOS_VERSION};
