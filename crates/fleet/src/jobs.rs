//! Provisioning job hand-off.
//!
//! The installation itself runs outside this crate. Callers only enqueue
//! a job and never wait for it; delivery is at-least-once and enqueues are
//! not deduplicated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::ServerId;

/// Request to install Talos on a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningJob {
    /// Server to provision.
    pub server_id: ServerId,
    /// Talos version to install (e.g. `v1.9.0`).
    pub talos_version: String,
}

/// Errors raised while enqueueing.
#[derive(Error, Debug)]
pub enum JobError {
    /// The consumer side is gone.
    #[error("Job queue closed")]
    Closed,

    /// Database failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fire-and-forget queue for provisioning jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job without waiting for it to run.
    async fn enqueue(&self, job: ProvisioningJob) -> Result<(), JobError>;
}

/// In-process queue backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelJobQueue {
    sender: mpsc::UnboundedSender<ProvisioningJob>,
}

impl ChannelJobQueue {
    /// Create a queue and the receiver a worker consumes from.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProvisioningJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: ProvisioningJob) -> Result<(), JobError> {
        self.sender.send(job).map_err(|_| JobError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_queue_delivers_in_order() {
        let (queue, mut rx) = ChannelJobQueue::channel();
        for id in [1, 2] {
            queue
                .enqueue(ProvisioningJob {
                    server_id: id,
                    talos_version: "v1.9.0".into(),
                })
                .await
                .unwrap();
        }
        assert_eq!(rx.recv().await.unwrap().server_id, 1);
        assert_eq!(rx.recv().await.unwrap().server_id, 2);
    }

    #[tokio::test]
    async fn test_closed_queue_reports_error() {
        let (queue, rx) = ChannelJobQueue::channel();
        drop(rx);
        let err = queue
            .enqueue(ProvisioningJob {
                server_id: 1,
                talos_version: "v1.9.0".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Closed));
    }
}
