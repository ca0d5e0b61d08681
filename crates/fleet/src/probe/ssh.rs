//! Remote command execution over the `ssh` binary.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::ProbeError;

/// Runs a command on a remote host and returns its stdout.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Execute `command` on `host`.
    ///
    /// # Errors
    /// Returns an error if the connection fails or the command exits non-zero.
    async fn run(&self, host: &str, command: &str) -> Result<String, ProbeError>;
}

/// Non-interactive `ssh` invocations against the rescue system.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    binary: PathBuf,
    user: String,
    connect_timeout_secs: u64,
    identity_file: Option<PathBuf>,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ssh"),
            user: "root".to_string(),
            connect_timeout_secs: 5,
            identity_file: None,
        }
    }
}

impl SshExecutor {
    /// Executor logging in as `user`.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    /// Set the `ConnectTimeout` passed to ssh.
    #[must_use]
    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Authenticate with this private key.
    #[must_use]
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Use a different ssh binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{host}", self.user));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteExec for SshExecutor {
    async fn run(&self, host: &str, command: &str) -> Result<String, ProbeError> {
        debug!(host = %host, "Running remote command");

        let output = Command::new(&self.binary)
            .args(self.args(host, command))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ProbeError::CommandFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
