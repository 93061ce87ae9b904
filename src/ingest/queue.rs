//! Upstream artifact queue contract.
//!
//! A message names the blob holding one artifact. Receiving hides a message
//! from other consumers until it is acknowledged (removed for good) or
//! released (made visible again for redelivery).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const MESSAGE_EXT: &str = "json";
const INFLIGHT_EXT: &str = "inflight";
const REJECTED_EXT: &str = "rejected";

/// One artifact notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub service_id: u64,
    pub service_name: String,
    pub blob_key: String,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Perf event names recorded as side-blob metadata.
    #[serde(default)]
    pub perf_events: Option<Vec<String>>,
}

/// Opaque handle for acknowledging or releasing one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: Receipt,
    pub message: QueueMessage,
}

pub trait ArtifactQueue: Send + Sync {
    /// Takes up to `max` visible messages. An empty result means the queue
    /// is currently drained.
    fn receive(&self, max: usize) -> impl Future<Output = Result<Vec<Delivery>>> + Send;

    /// Removes a delivered message permanently.
    fn ack(&self, receipt: &Receipt) -> impl Future<Output = Result<()>> + Send;

    /// Makes a delivered message visible again.
    fn release(&self, receipt: &Receipt) -> impl Future<Output = Result<()>> + Send;
}

/// Queue backed by a spool directory of `*.json` message files.
///
/// Receiving renames `name.json` to `name.json.inflight`; the rename is the
/// claim. Ack deletes the in-flight file and release renames it back. Files
/// that cannot be read or parsed are renamed to `.rejected` and never
/// delivered; they do not fail the rest of the batch.
#[derive(Debug)]
pub struct SpoolQueue {
    dir: PathBuf,
    rejected: AtomicU64,
}

impl SpoolQueue {
    /// Opens the spool directory, creating it if needed, and returns any
    /// messages left in flight by a previous process to the visible set.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating spool directory {}", dir.display()))?;

        let queue = Self {
            dir,
            rejected: AtomicU64::new(0),
        };
        let recovered = queue.recover().await?;
        if recovered > 0 {
            info!(dir = %queue.dir.display(), recovered, "released in-flight spool messages");
        }

        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Messages rejected since open.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Moves a claimed message aside for good. A failed rename leaves it
    /// in flight until the next open.
    async fn reject(&self, path: &Path, inflight: &Path, reason: &str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(path = %path.display(), reason, "rejecting queue message");

        let rejected = path.with_extension(REJECTED_EXT);
        if let Err(e) = tokio::fs::rename(inflight, &rejected).await {
            warn!(path = %inflight.display(), error = %e, "failed to move rejected message");
        }
    }

    async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for path in self.list(INFLIGHT_EXT).await? {
            let visible = path.with_extension("");
            tokio::fs::rename(&path, &visible)
                .await
                .with_context(|| format!("recovering {}", path.display()))?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Files with the given final extension, sorted by name.
    async fn list(&self, ext: &str) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading spool directory {}", self.dir.display()))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("reading spool directory entry")?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ext) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn inflight_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(INFLIGHT_EXT);
        PathBuf::from(name)
    }
}

impl ArtifactQueue for SpoolQueue {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::new();

        for path in self.list(MESSAGE_EXT).await? {
            if deliveries.len() >= max {
                break;
            }

            let inflight = Self::inflight_path(&path);
            match tokio::fs::rename(&path, &inflight).await {
                Ok(()) => {}
                // Claimed by another consumer between listing and rename.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to claim queue message");
                    continue;
                }
            }

            let raw = match tokio::fs::read(&inflight).await {
                Ok(raw) => raw,
                Err(e) => {
                    self.reject(&path, &inflight, &format!("unreadable: {e}")).await;
                    continue;
                }
            };

            match serde_json::from_slice::<QueueMessage>(&raw) {
                Ok(message) => deliveries.push(Delivery {
                    receipt: Receipt(inflight.to_string_lossy().into_owned()),
                    message,
                }),
                Err(e) => {
                    self.reject(&path, &inflight, &format!("unparseable: {e}")).await;
                }
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<()> {
        tokio::fs::remove_file(receipt.as_str())
            .await
            .with_context(|| format!("acknowledging {}", receipt.as_str()))?;
        debug!(receipt = receipt.as_str(), "message acknowledged");
        Ok(())
    }

    async fn release(&self, receipt: &Receipt) -> Result<()> {
        let inflight = Path::new(receipt.as_str());
        tokio::fs::rename(inflight, inflight.with_extension(""))
            .await
            .with_context(|| format!("releasing {}", receipt.as_str()))?;
        debug!(receipt = receipt.as_str(), "message released");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    next_id: u64,
    visible: VecDeque<(u64, QueueMessage)>,
    inflight: HashMap<u64, QueueMessage>,
    acked: Vec<QueueMessage>,
    releases: u64,
}

/// In-process queue for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: QueueMessage) {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.visible.push_back((id, message));
    }

    pub fn visible_len(&self) -> usize {
        self.state.lock().visible.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// Messages acknowledged so far, in ack order.
    pub fn acked(&self) -> Vec<QueueMessage> {
        self.state.lock().acked.clone()
    }

    pub fn release_count(&self) -> u64 {
        self.state.lock().releases
    }
}

fn parse_receipt(receipt: &Receipt) -> Result<u64> {
    receipt
        .as_str()
        .parse()
        .with_context(|| format!("invalid receipt {:?}", receipt.as_str()))
}

impl ArtifactQueue for MemoryQueue {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut state = self.state.lock();
        let take = max.min(state.visible.len());

        let taken: Vec<_> = state.visible.drain(..take).collect();
        let mut deliveries = Vec::with_capacity(take);
        for (id, message) in taken {
            state.inflight.insert(id, message.clone());
            deliveries.push(Delivery {
                receipt: Receipt(id.to_string()),
                message,
            });
        }

        Ok(deliveries)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<()> {
        let id = parse_receipt(receipt)?;
        let mut state = self.state.lock();
        let message = state
            .inflight
            .remove(&id)
            .with_context(|| format!("receipt {id} is not in flight"))?;
        state.acked.push(message);
        Ok(())
    }

    async fn release(&self, receipt: &Receipt) -> Result<()> {
        let id = parse_receipt(receipt)?;
        let mut state = self.state.lock();
        let message = state
            .inflight
            .remove(&id)
            .with_context(|| format!("receipt {id} is not in flight"))?;
        state.visible.push_front((id, message));
        state.releases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> QueueMessage {
        QueueMessage {
            service_id: 7,
            service_name: "checkout".to_string(),
            blob_key: key.to_string(),
            enqueued_at: None,
            perf_events: None,
        }
    }

    #[test]
    fn test_message_optional_fields() {
        let msg: QueueMessage =
            serde_json::from_str(r#"{"service_id":1,"service_name":"svc","blob_key":"a/b.gz"}"#)
                .expect("parses");
        assert_eq!(msg.service_id, 1);
        assert!(msg.enqueued_at.is_none());
        assert!(msg.perf_events.is_none());

        let msg: QueueMessage = serde_json::from_str(
            r#"{"service_id":1,"service_name":"svc","blob_key":"k",
                "enqueued_at":"2024-03-01T10:15:00Z","perf_events":["cycles"]}"#,
        )
        .expect("parses");
        assert_eq!(
            msg.enqueued_at.expect("timestamp").to_rfc3339(),
            "2024-03-01T10:15:00+00:00"
        );
        assert_eq!(msg.perf_events, Some(vec!["cycles".to_string()]));
    }

    #[tokio::test]
    async fn test_memory_queue_ack_and_release() {
        let queue = MemoryQueue::new();
        queue.push(message("a"));
        queue.push(message("b"));
        queue.push(message("c"));

        let batch = queue.receive(2).await.expect("receive");
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.visible_len(), 1);
        assert_eq!(queue.inflight_len(), 2);

        queue.ack(&batch[0].receipt).await.expect("ack");
        queue.release(&batch[1].receipt).await.expect("release");
        assert!(queue.ack(&batch[0].receipt).await.is_err());

        let again = queue.receive(10).await.expect("receive");
        let keys: Vec<_> = again.iter().map(|d| d.message.blob_key.as_str()).collect();
        assert_eq!(keys, ["b", "c"]);
        assert_eq!(queue.acked(), vec![message("a")]);
        assert_eq!(queue.release_count(), 1);
    }

    async fn spool_message(dir: &Path, name: &str, msg: &QueueMessage) {
        let body = serde_json::to_vec(msg).expect("serialize");
        tokio::fs::write(dir.join(name), body)
            .await
            .expect("write message");
    }

    #[tokio::test]
    async fn test_spool_queue_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = SpoolQueue::open(dir.path()).await.expect("open");

        spool_message(dir.path(), "001.json", &message("a")).await;
        spool_message(dir.path(), "002.json", &message("b")).await;

        let batch = queue.receive(1).await.expect("receive");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message.blob_key, "a");
        assert!(dir.path().join("001.json.inflight").exists());
        assert!(!dir.path().join("001.json").exists());

        queue.release(&batch[0].receipt).await.expect("release");
        assert!(dir.path().join("001.json").exists());

        let batch = queue.receive(10).await.expect("receive");
        assert_eq!(batch.len(), 2);
        for delivery in &batch {
            queue.ack(&delivery.receipt).await.expect("ack");
        }

        assert!(queue.receive(10).await.expect("receive").is_empty());
        let mut remaining = tokio::fs::read_dir(dir.path()).await.expect("read_dir");
        assert!(remaining.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn test_spool_queue_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = SpoolQueue::open(dir.path()).await.expect("open");

        tokio::fs::write(dir.path().join("bad.json"), b"{not json")
            .await
            .expect("write");
        spool_message(dir.path(), "good.json", &message("ok")).await;

        let batch = queue.receive(10).await.expect("receive");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message.blob_key, "ok");
        assert!(dir.path().join("bad.rejected").exists());
        assert_eq!(queue.rejected_count(), 1);
    }

    #[tokio::test]
    async fn test_spool_queue_unreadable_file_does_not_strand_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = SpoolQueue::open(dir.path()).await.expect("open");

        spool_message(dir.path(), "a.json", &message("a")).await;
        // A directory named like a message cannot be read as one.
        tokio::fs::create_dir(dir.path().join("b.json"))
            .await
            .expect("mkdir");
        spool_message(dir.path(), "c.json", &message("c")).await;

        let batch = queue.receive(10).await.expect("receive");
        let keys: Vec<_> = batch.iter().map(|d| d.message.blob_key.as_str()).collect();
        assert_eq!(keys, ["a", "c"]);
        assert!(dir.path().join("b.rejected").is_dir());
        assert!(!dir.path().join("b.json.inflight").exists());
        assert_eq!(queue.rejected_count(), 1);

        for delivery in &batch {
            queue.ack(&delivery.receipt).await.expect("ack");
        }
        assert!(queue.receive(10).await.expect("receive").is_empty());
    }

    #[tokio::test]
    async fn test_spool_queue_recovers_inflight_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        spool_message(dir.path(), "001.json.inflight", &message("a")).await;

        let queue = SpoolQueue::open(dir.path()).await.expect("open");
        assert!(dir.path().join("001.json").exists());

        let batch = queue.receive(10).await.expect("receive");
        assert_eq!(batch.len(), 1);
        assert_eq!(queue.dir(), dir.path());
    }
}
