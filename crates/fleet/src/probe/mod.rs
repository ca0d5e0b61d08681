//! Concurrent reachability probing.
//!
//! Every server gets its own task on a [`JoinSet`]; a semaphore caps how many
//! run at once and each probe has its own timeout. A failure of any kind,
//! including a panic, only marks that server unreachable. [`Prober::probe_all`]
//! returns once every task has finished.

mod ssh;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{BlockDeviceListing, BootstrapMetadata, Server, ServerId};

pub use ssh::{RemoteExec, SshExecutor};

/// Read-only command printing the SMBIOS UUID followed by the block device listing.
pub const PROBE_COMMAND: &str =
    "cat /sys/class/dmi/id/product_uuid && lsblk --json -o NAME,TYPE,WWN";

/// Default number of probes in flight.
pub const DEFAULT_CONCURRENCY: usize = 32;

/// Default per-server probe timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reasons a single probe fails.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The server has no management address.
    #[error("no IPv4 address")]
    NoAddress,

    /// The probe did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The remote command exited unsuccessfully.
    #[error("remote command failed (exit {code:?}): {stderr}")]
    CommandFailed {
        /// Exit code, if any.
        code: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },

    /// Output could not be parsed.
    #[error("malformed probe output: {0}")]
    Malformed(String),

    /// The probe task panicked.
    #[error("probe panicked")]
    Panicked,

    /// Local process failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Connected and read fresh metadata.
    Reachable(BootstrapMetadata),
    /// Could not connect or read metadata.
    Unreachable(String),
}

/// Probe result for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Probed server.
    pub server_id: ServerId,
    /// Outcome.
    pub outcome: ProbeOutcome,
}

impl ProbeResult {
    /// Whether the server answered.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Reachable(_))
    }
}

/// Parse the output of [`PROBE_COMMAND`].
///
/// The first non-empty line is the UUID, the remainder is `lsblk` JSON.
///
/// # Errors
/// Returns [`ProbeError::Malformed`] if either part does not parse.
pub fn parse_probe_output(output: &str) -> Result<BootstrapMetadata, ProbeError> {
    let trimmed = output.trim_start();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));

    let uuid = Uuid::parse_str(first.trim())
        .map_err(|e| ProbeError::Malformed(format!("uuid {:?}: {e}", first.trim())))?;
    let lsblk: BlockDeviceListing = serde_json::from_str(rest)
        .map_err(|e| ProbeError::Malformed(format!("lsblk: {e}")))?;

    Ok(BootstrapMetadata { uuid, lsblk })
}

/// Fans probes out over all servers.
#[derive(Clone)]
pub struct Prober {
    exec: Arc<dyn RemoteExec>,
    concurrency: usize,
    timeout: Duration,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Prober {
    /// Prober with default concurrency and timeout.
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExec>) -> Self {
        Self {
            exec,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Maximum probes in flight (at least one).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Per-server timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe one host.
    async fn probe_one(
        exec: Arc<dyn RemoteExec>,
        host: String,
        timeout: Duration,
    ) -> Result<BootstrapMetadata, ProbeError> {
        let output = tokio::time::timeout(timeout, exec.run(&host, PROBE_COMMAND))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))??;
        parse_probe_output(&output)
    }

    /// Probe every server and return one result per input, in input order.
    pub async fn probe_all(&self, servers: &[Server]) -> Vec<ProbeResult> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let mut results: Vec<Option<ProbeResult>> = vec![None; servers.len()];

        for (index, server) in servers.iter().enumerate() {
            let server_id = server.id;
            let Some(host) = server.ipv4.clone() else {
                results[index] = Some(ProbeResult {
                    server_id,
                    outcome: ProbeOutcome::Unreachable(ProbeError::NoAddress.to_string()),
                });
                continue;
            };

            let exec = Arc::clone(&self.exec);
            let semaphore = Arc::clone(&semaphore);
            let timeout = self.timeout;
            set.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                let result = AssertUnwindSafe(Self::probe_one(exec, host, timeout))
                    .catch_unwind()
                    .await
                    .unwrap_or(Err(ProbeError::Panicked));
                (index, server_id, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (index, server_id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // Only reachable on runtime shutdown; the task's slot stays empty.
                    warn!(error = %e, "Probe task aborted");
                    continue;
                }
            };

            let outcome = match result {
                Ok(metadata) => {
                    debug!(server_id, uuid = %metadata.uuid, "Server reachable");
                    ProbeOutcome::Reachable(metadata)
                }
                Err(e) => {
                    debug!(server_id, error = %e, "Server unreachable");
                    ProbeOutcome::Unreachable(e.to_string())
                }
            };
            results[index] = Some(ProbeResult { server_id, outcome });
        }

        let results: Vec<ProbeResult> = results
            .into_iter()
            .zip(servers)
            .map(|(result, server)| {
                result.unwrap_or_else(|| ProbeResult {
                    server_id: server.id,
                    outcome: ProbeOutcome::Unreachable("probe aborted".to_string()),
                })
            })
            .collect();

        let reachable = results.iter().filter(|r| r.is_reachable()).count();
        info!(
            total = results.len(),
            reachable,
            unreachable = results.len() - reachable,
            "Probed servers"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::model::ProviderKind;

    const UUID: &str = "4c4c4544-0035-4b10-8051-b3c04f4e4d32";

    fn output() -> String {
        format!(
            "{UUID}\n{{\"blockdevices\": [{{\"name\": \"sda\", \"type\": \"disk\", \"wwn\": \"0x5000c500a1b2c3d4\"}}]}}\n"
        )
    }

    enum Behavior {
        Answer(Duration),
        Fail,
        Hang,
        Panic,
        Garbage,
    }

    struct FakeExec {
        hosts: HashMap<String, Behavior>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeExec {
        fn new(hosts: Vec<(&str, Behavior)>) -> Self {
            Self {
                hosts: hosts.into_iter().map(|(h, b)| (h.to_string(), b)).collect(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteExec for FakeExec {
        async fn run(&self, host: &str, _command: &str) -> Result<String, ProbeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = match &self.hosts[host] {
                Behavior::Answer(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(output())
                }
                Behavior::Fail => Err(ProbeError::CommandFailed {
                    code: Some(255),
                    stderr: "Connection refused".into(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(output())
                }
                Behavior::Panic => panic!("exec blew up"),
                Behavior::Garbage => Ok("not-a-uuid\n[]".into()),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn server(id: ServerId, ip: Option<&str>) -> Server {
        let mut s = Server::new(id, ProviderKind::HetznerDedicated, format!("s{id}"));
        s.ipv4 = ip.map(str::to_string);
        s
    }

    #[test]
    fn test_parse_probe_output() {
        let meta = parse_probe_output(&output()).unwrap();
        assert_eq!(meta.uuid.to_string(), UUID);
        assert_eq!(meta.lsblk.blockdevices[0].name, "sda");
    }

    #[test]
    fn test_parse_rejects_bad_uuid() {
        let err = parse_probe_output("nope\n{\"blockdevices\": []}").unwrap_err();
        assert!(matches!(err, ProbeError::Malformed(_)));
    }

    #[test]
    fn test_parse_rejects_missing_listing() {
        let err = parse_probe_output(UUID).unwrap_err();
        assert!(matches!(err, ProbeError::Malformed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_only_affect_their_server() {
        let exec = FakeExec::new(vec![
            ("10.0.0.1", Behavior::Answer(Duration::from_millis(10))),
            ("10.0.0.2", Behavior::Fail),
            ("10.0.0.3", Behavior::Hang),
            ("10.0.0.4", Behavior::Panic),
            ("10.0.0.5", Behavior::Garbage),
            ("10.0.0.6", Behavior::Answer(Duration::from_millis(20))),
        ]);
        let prober = Prober::new(Arc::new(exec)).with_timeout(Duration::from_secs(2));
        let servers = vec![
            server(1, Some("10.0.0.1")),
            server(2, Some("10.0.0.2")),
            server(3, Some("10.0.0.3")),
            server(4, Some("10.0.0.4")),
            server(5, Some("10.0.0.5")),
            server(6, Some("10.0.0.6")),
            server(7, None),
        ];

        let results = prober.probe_all(&servers).await;

        assert_eq!(results.len(), 7);
        let ids: Vec<_> = results.iter().map(|r| r.server_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
        let reachable: Vec<_> = results
            .iter()
            .filter(|r| r.is_reachable())
            .map(|r| r.server_id)
            .collect();
        assert_eq!(reachable, vec![1, 6]);
        assert_eq!(
            results[6].outcome,
            ProbeOutcome::Unreachable("no IPv4 address".into())
        );
        assert!(
            matches!(&results[2].outcome, ProbeOutcome::Unreachable(r) if r.contains("timed out"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_is_max_not_sum() {
        let delays = [300, 700, 1000, 200];
        let hosts: Vec<String> = (1..=delays.len()).map(|i| format!("10.0.1.{i}")).collect();
        let exec = FakeExec::new(
            hosts
                .iter()
                .zip(delays)
                .map(|(h, d)| (h.as_str(), Behavior::Answer(Duration::from_millis(d))))
                .collect(),
        );
        let prober = Prober::new(Arc::new(exec));
        let servers: Vec<Server> = hosts
            .iter()
            .enumerate()
            .map(|(i, h)| server(i as ServerId + 1, Some(h)))
            .collect();

        let start = Instant::now();
        let results = prober.probe_all(&servers).await;
        let elapsed = start.elapsed();

        assert!(results.iter().all(ProbeResult::is_reachable));
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_millis(2200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_is_respected() {
        let hosts: Vec<String> = (1..=10).map(|i| format!("10.0.2.{i}")).collect();
        let exec = Arc::new(FakeExec::new(
            hosts
                .iter()
                .map(|h| (h.as_str(), Behavior::Answer(Duration::from_millis(50))))
                .collect(),
        ));
        let prober = Prober::new(exec.clone()).with_concurrency(3);
        let servers: Vec<Server> = hosts
            .iter()
            .enumerate()
            .map(|(i, h)| server(i as ServerId + 1, Some(h)))
            .collect();

        let results = prober.probe_all(&servers).await;

        assert!(results.iter().all(ProbeResult::is_reachable));
        assert!(exec.peak.load(Ordering::SeqCst) <= 3);
    }
}
