//! Running `talosctl` against live nodes.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use super::reset_args;

/// Default limit for one `talosctl` invocation.
pub const DEFAULT_TALOSCTL_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from `talosctl` invocations.
#[derive(Error, Debug)]
pub enum TalosctlError {
    /// The binary could not be started.
    #[error("failed to run talosctl: {0}")]
    Io(#[from] std::io::Error),

    /// The command exited non-zero.
    #[error("talosctl exited with {code:?}: {output}")]
    Failed {
        /// Exit code, if any.
        code: Option<i32>,
        /// Combined stdout and stderr.
        output: String,
    },

    /// The command did not finish in time.
    #[error("talosctl timed out after {0:?}")]
    Timeout(Duration),
}

/// Remote Talos actions the orchestrator needs.
#[async_trait]
pub trait TalosControl: Send + Sync {
    /// Reset `node` through the control plane `endpoint`.
    async fn reset(&self, endpoint: &str, node: &str) -> Result<(), TalosctlError>;
}

/// [`TalosControl`] backed by the `talosctl` binary.
#[derive(Debug, Clone)]
pub struct Talosctl {
    binary: PathBuf,
    talosconfig: Option<PathBuf>,
    timeout: Duration,
}

impl Default for Talosctl {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("talosctl"),
            talosconfig: None,
            timeout: DEFAULT_TALOSCTL_TIMEOUT,
        }
    }
}

impl Talosctl {
    /// Use `binary` with the given talosconfig.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, talosconfig: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            talosconfig,
            ..Self::default()
        }
    }

    /// Limit each invocation to `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: Vec<String>) -> Result<String, TalosctlError> {
        let mut cmd = Command::new(&self.binary);
        if let Some(config) = &self.talosconfig {
            cmd.arg("--talosconfig").arg(config);
        }
        cmd.args(&args).kill_on_drop(true);
        debug!(args = ?args, "Running talosctl");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| TalosctlError::Timeout(self.timeout))??;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(TalosctlError::Failed {
                code: output.status.code(),
                output: combined,
            });
        }
        Ok(combined)
    }
}

#[async_trait]
impl TalosControl for Talosctl {
    async fn reset(&self, endpoint: &str, node: &str) -> Result<(), TalosctlError> {
        self.run(reset_args(endpoint, node)).await?;
        info!(node = %node, endpoint = %endpoint, "Node reset issued");
        Ok(())
    }
}
