//! Installer image references.

use serde::{Deserialize, Serialize};

use crate::model::Server;

/// Default Talos version.
pub const DEFAULT_TALOS_VERSION: &str = "v1.9.0";

/// Default schematic ID (vanilla, no extensions).
pub const DEFAULT_SCHEMATIC_ID: &str =
    "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba";

/// Talos Image Factory registry host.
const IMAGE_FACTORY_REGISTRY: &str = "factory.talos.dev";

/// A Talos installer image built by the Image Factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerImage {
    /// Schematic ID from Talos Image Factory.
    pub schematic_id: String,
    /// Talos version (e.g., "v1.9.0").
    pub version: String,
}

impl Default for InstallerImage {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEMATIC_ID, DEFAULT_TALOS_VERSION)
    }
}

impl InstallerImage {
    /// Installer for a schematic and version.
    #[must_use]
    pub fn new(schematic_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            schematic_id: schematic_id.into(),
            version: version.into(),
        }
    }

    /// Installer for `server`'s recorded schematic, falling back to the vanilla one.
    #[must_use]
    pub fn for_server(server: &Server, version: impl Into<String>) -> Self {
        Self::new(
            server
                .talos_schematic_id
                .as_deref()
                .unwrap_or(DEFAULT_SCHEMATIC_ID),
            version,
        )
    }

    /// Container image reference, e.g. `factory.talos.dev/installer/<schematic>:v1.9.0`.
    #[must_use]
    pub fn reference(&self) -> String {
        format!(
            "{IMAGE_FACTORY_REGISTRY}/installer/{}:{}",
            self.schematic_id, self.version
        )
    }
}

impl std::fmt::Display for InstallerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reference())
    }
}
