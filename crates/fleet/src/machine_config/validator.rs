//! Installer-side validation of rendered machine configs.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Output marker `talosctl validate` prints for an accepted config, e.g.
/// `/tmp/talos-config.yaml is valid for metal mode`.
pub const SUCCESS_MARKER: &str = "is valid";

/// Raw validator output explaining why a document was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics(pub String);

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checks a rendered machine config against the installer's own rules.
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    /// Accept the document or return the validator's diagnostics verbatim.
    async fn validate(&self, document: &str) -> Result<(), Diagnostics>;
}

/// Runs `talosctl validate` on a temporary copy of the document.
#[derive(Debug, Clone)]
pub struct TalosctlValidator {
    /// Path or name of the talosctl binary.
    binary: PathBuf,
    /// Validation mode (`metal`, `cloud`, `container`).
    mode: String,
    /// Upper bound on a single run.
    timeout: Duration,
}

impl Default for TalosctlValidator {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("talosctl"),
            mode: "metal".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl TalosctlValidator {
    /// Validator using `binary` with the given timeout in metal mode.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            ..Self::default()
        }
    }

    /// Change the validation mode.
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }
}

#[async_trait]
impl ConfigValidator for TalosctlValidator {
    async fn validate(&self, document: &str) -> Result<(), Diagnostics> {
        let mut file = tempfile::Builder::new()
            .prefix("talos-config")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| Diagnostics(format!("failed to create temp file: {e}")))?;
        file.write_all(document.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| Diagnostics(format!("failed to write temp file: {e}")))?;

        debug!(path = %file.path().display(), mode = %self.mode, "Running talosctl validate");

        let run = Command::new(&self.binary)
            .args(["validate", "-m", &self.mode, "--strict", "-c"])
            .arg(file.path())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to run talosctl validate");
                return Err(Diagnostics(format!("failed to run talosctl: {e}")));
            }
            Err(_) => {
                return Err(Diagnostics(format!(
                    "talosctl validate timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        // talosctl reports problems on stderr, success on stdout.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if text.contains(SUCCESS_MARKER) {
            Ok(())
        } else {
            Err(Diagnostics(text))
        }
    }
}
