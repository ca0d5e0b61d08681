//! Fleet configuration file.
//!
//! Loaded from YAML (default `~/.fleet/config.yaml`). A missing file yields
//! the defaults; every section and field may be omitted. Credentials are
//! usually supplied through the environment instead, see [`ConfigOverrides`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Errors loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid configuration YAML.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_yaml::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// PostgreSQL URL; the in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Provider credentials and endpoints.
    pub hetzner: HetznerConfig,
    /// Reachability probing.
    pub probe: ProbeConfig,
    /// Machine config validation.
    pub validator: ValidatorConfig,
    /// `talosctl` settings.
    pub talos: TalosSettings,
    /// Periodic reconciliation.
    pub sync: SyncConfig,
}

/// Hetzner Robot and Cloud access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HetznerConfig {
    /// Robot web service user.
    pub robot_user: Option<String>,
    /// Robot web service password.
    pub robot_password: Option<String>,
    /// Override of the Robot API base URL.
    pub robot_base_url: Option<String>,
    /// Cloud API token.
    pub cloud_token: Option<String>,
    /// Override of the Cloud API base URL.
    pub cloud_base_url: Option<String>,
    /// Robot key fingerprints installed into the rescue system.
    pub robot_authorized_keys: Vec<String>,
    /// Cloud SSH key ids injected into the rescue system.
    pub cloud_ssh_keys: Vec<i64>,
}

/// Probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probes in flight at once.
    pub concurrency: usize,
    /// Per-server timeout.
    pub timeout_secs: u64,
    /// SSH login user.
    pub ssh_user: String,
    /// SSH private key.
    pub identity_file: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::probe::DEFAULT_CONCURRENCY,
            timeout_secs: crate::probe::DEFAULT_TIMEOUT.as_secs(),
            ssh_user: "root".to_string(),
            identity_file: None,
        }
    }
}

impl ProbeConfig {
    /// Per-server timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Validator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// `talosctl` binary.
    pub talosctl: PathBuf,
    /// Validation timeout.
    pub timeout_secs: u64,
    /// `talosctl validate` mode.
    pub mode: String,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            talosctl: PathBuf::from("talosctl"),
            timeout_secs: 60,
            mode: "metal".to_string(),
        }
    }
}

/// `talosctl` settings for reset and generated commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TalosSettings {
    /// Path to the talosconfig with cluster credentials.
    pub talosconfig: Option<PathBuf>,
    /// Version used when none is given on the command line.
    pub default_version: String,
    /// Limit for a single `talosctl` invocation.
    pub timeout_secs: u64,
}

impl Default for TalosSettings {
    fn default() -> Self {
        Self {
            talosconfig: None,
            default_version: crate::talos::DEFAULT_TALOS_VERSION.to_string(),
            timeout_secs: crate::talos::DEFAULT_TALOSCTL_TIMEOUT.as_secs(),
        }
    }
}

/// Periodic reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between cycles.
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

/// Values taken from the command line or environment, applied over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// `DATABASE_URL`.
    pub database_url: Option<String>,
    /// `HETZNER_ROBOT_USER`.
    pub robot_user: Option<String>,
    /// `HETZNER_ROBOT_PASSWORD`.
    pub robot_password: Option<String>,
    /// `HCLOUD_TOKEN`.
    pub cloud_token: Option<String>,
}

/// `~/.fleet/config.yaml`, or `None` without a home directory.
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".fleet").join("config.yaml"))
}

impl FleetConfig {
    /// Load from `path`, falling back to defaults when it does not exist.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file exists but is unreadable or invalid.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse YAML text. An empty document yields the defaults.
    ///
    /// # Errors
    /// Returns the YAML error.
    pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Apply overrides; only set values replace file values.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if overrides.database_url.is_some() {
            self.database_url = overrides.database_url;
        }
        if overrides.robot_user.is_some() {
            self.hetzner.robot_user = overrides.robot_user;
        }
        if overrides.robot_password.is_some() {
            self.hetzner.robot_password = overrides.robot_password;
        }
        if overrides.cloud_token.is_some() {
            self.hetzner.cloud_token = overrides.cloud_token;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FleetConfig::load(&dir.path().join("absent.yaml")).await.unwrap();

        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.probe.concurrency, 32);
        assert_eq!(config.probe.timeout(), Duration::from_secs(10));
        assert_eq!(config.validator.timeout_secs, 60);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "probe:\n  concurrency: 8\nhetzner:\n  robot_user: '#ws+abc'\n",
        )
        .unwrap();

        let config = FleetConfig::load(&path).await.unwrap();
        assert_eq!(config.probe.concurrency, 8);
        assert_eq!(config.probe.timeout_secs, 10);
        assert_eq!(config.hetzner.robot_user.as_deref(), Some("#ws+abc"));
        assert_eq!(config.sync.interval_secs, 300);
    }

    #[tokio::test]
    async fn test_invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "probe: [1, 2").unwrap();

        let err = FleetConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_overrides_only_replace_set_values() {
        let yaml = "database_url: postgres://file\nhetzner:\n  cloud_token: file-token\n";
        let config = FleetConfig::parse(yaml)
            .unwrap()
            .with_overrides(ConfigOverrides {
                cloud_token: Some("env-token".into()),
                ..ConfigOverrides::default()
            });

        assert_eq!(config.database_url.as_deref(), Some("postgres://file"));
        assert_eq!(config.hetzner.cloud_token.as_deref(), Some("env-token"));
    }

    #[test]
    fn test_rescue_keys_and_talos_settings() {
        let yaml = "\
hetzner:
  robot_authorized_keys: ['d7:2b:8c:1f:aa:00:4e:91:5c:33:70:be:12:9a:e4:06']
  cloud_ssh_keys: [1401, 1402]
talos:
  timeout_secs: 30
";
        let config = FleetConfig::parse(yaml).unwrap();

        assert_eq!(config.hetzner.robot_authorized_keys.len(), 1);
        assert_eq!(config.hetzner.cloud_ssh_keys, vec![1401, 1402]);
        assert_eq!(config.talos.timeout_secs, 30);
        assert_eq!(config.talos.default_version, "v1.9.0");
        assert_eq!(config.validator.mode, "metal");
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(FleetConfig::parse("\n").unwrap(), FleetConfig::default());
    }
}
