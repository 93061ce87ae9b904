//! Artifact ingestion: queue polling, blob fetch, decode and write.

pub mod blob;
pub mod queue;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::blob::{BlobError, BlobMetadata, BlobStore};
use self::queue::{ArtifactQueue, Delivery, QueueMessage};
use crate::clock::SharedClock;
use crate::config::IngestConfig;
use crate::export::health::HealthMetrics;
use crate::stack::decode::{DecodeError, DecodedArtifact, LineError, StackDecoder};
use crate::store::{MetricRow, StackRow};
use crate::writer::{WriterError, WriterHandle};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Per-artifact failures.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("transient fetch failure: {0}")]
    TransientFetch(#[source] BlobError),

    #[error("artifact blob unavailable: {0}")]
    MissingBlob(#[source] BlobError),

    #[error("corrupt artifact body {key}: {source}")]
    CorruptBody {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed artifact {key}: {source}")]
    MalformedArtifact {
        key: String,
        #[source]
        source: DecodeError,
    },

    #[error("skipped sample line {line}: {source}")]
    PartialRow {
        line: usize,
        #[source]
        source: LineError,
    },

    #[error("side-blob upload {key}: {source}")]
    SideBlobUpload {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("store flush: {0}")]
    StoreFlush(#[from] WriterError),

    #[error("decode task: {0}")]
    DecodeTask(#[from] JoinError),
}

/// What to do with the queue message after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message; redelivery cannot help.
    Ack,
    /// Make the message visible again.
    Release,
}

impl IngestError {
    /// Metric label for `artifacts_failed_total`.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TransientFetch(_) => "transient_fetch",
            Self::MissingBlob(_) => "missing_blob",
            Self::CorruptBody { .. } => "corrupt_body",
            Self::MalformedArtifact { .. } => "malformed_artifact",
            Self::PartialRow { .. } => "partial_row",
            Self::SideBlobUpload { .. } => "side_blob_upload",
            Self::StoreFlush(_) => "store_flush",
            Self::DecodeTask(_) => "decode_task",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Self::TransientFetch(_) | Self::StoreFlush(_) => Disposition::Release,
            _ => Disposition::Ack,
        }
    }
}

impl From<BlobError> for IngestError {
    fn from(e: BlobError) -> Self {
        if e.is_transient() {
            Self::TransientFetch(e)
        } else {
            Self::MissingBlob(e)
        }
    }
}

/// Counters for one successfully processed artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub rows: usize,
    pub samples: u64,
    pub skipped: u64,
    pub idle: u64,
    pub side_blobs: usize,
}

/// Runs one artifact from blob to store.
pub struct ArtifactProcessor<B> {
    blobs: Arc<B>,
    decoder: Arc<StackDecoder>,
    writer: WriterHandle,
    clock: SharedClock,
    health: Arc<HealthMetrics>,
}

impl<B: BlobStore> ArtifactProcessor<B> {
    pub fn new(
        blobs: Arc<B>,
        decoder: Arc<StackDecoder>,
        writer: WriterHandle,
        clock: SharedClock,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            blobs,
            decoder,
            writer,
            clock,
            health,
        }
    }

    /// Fetches, decodes and writes one artifact.
    ///
    /// Stack rows reach every tier before side-blobs are uploaded, and the
    /// metric row (which references the session blob) is written last.
    /// Side-blob failures are logged and counted but do not fail the
    /// artifact.
    pub async fn process(&self, msg: &QueueMessage) -> Result<ProcessReport, IngestError> {
        let raw = self.blobs.fetch(&msg.blob_key).await?;

        let decoder = Arc::clone(&self.decoder);
        let key = msg.blob_key.clone();
        let mut artifact =
            tokio::task::spawn_blocking(move || decode_body(&decoder, &key, &raw)).await??;

        self.health
            .partial_rows_skipped
            .inc_by(artifact.stats.skipped as f64);
        self.health
            .idle_lines_skipped
            .inc_by(artifact.stats.idle as f64);
        if let Some((line, source)) = artifact.first_line_error.take() {
            let err = IngestError::PartialRow { line, source };
            warn!(
                blob_key = %msg.blob_key,
                skipped = artifact.stats.skipped,
                error = %err,
                "artifact has malformed sample lines"
            );
        }

        let timestamp = msg
            .enqueued_at
            .or(artifact.header.timestamp)
            .unwrap_or_else(|| self.clock.now());

        let rows = stack_rows(&artifact, msg.service_id, timestamp);
        let row_count = rows.len();
        self.writer.enqueue_stacks(rows).await?;

        let artifact_id = artifact_id(&msg.blob_key);
        let (uploaded, session_path) = self
            .upload_side_blobs(msg, artifact_id, &mut artifact)
            .await;

        if let Some(summary) = artifact.metrics {
            self.writer
                .enqueue_metrics(vec![MetricRow {
                    service_id: msg.service_id,
                    timestamp,
                    hostname: artifact.header.hostname.clone(),
                    cpu_avg: summary.cpu_avg,
                    mem_avg: summary.mem_avg,
                    html_path: session_path,
                }])
                .await?;
        }

        Ok(ProcessReport {
            rows: row_count,
            samples: artifact.stats.samples,
            skipped: artifact.stats.skipped,
            idle: artifact.stats.idle,
            side_blobs: uploaded,
        })
    }

    /// Uploads the session and flamegraph HTML blobs. Returns how many were
    /// stored and the session blob key when it was stored.
    async fn upload_side_blobs(
        &self,
        msg: &QueueMessage,
        artifact_id: &str,
        artifact: &mut DecodedArtifact,
    ) -> (usize, Option<String>) {
        let service = msg.service_name.as_str();
        let mode = if artifact.header.continuous {
            "continuous"
        } else {
            "adhoc"
        };

        let mut uploaded = 0;
        let mut session_path = None;

        if let Some(html) = artifact.side_blobs.session_html.take() {
            let key = session_blob_key(service, artifact_id);
            if self.upload(msg, &key, html).await {
                uploaded += 1;
                session_path = Some(key);
            }
        }

        if let Some(html) = artifact.side_blobs.flamegraph_html.take() {
            let key = flamegraph_blob_key(service, artifact_id, mode);
            if self.upload(msg, &key, html).await {
                uploaded += 1;
            }
        }

        (uploaded, session_path)
    }

    /// Stores one side-blob and then its metadata.
    async fn upload(&self, msg: &QueueMessage, key: &str, html: String) -> bool {
        if let Err(e) = self
            .blobs
            .put(key, html.into_bytes(), "text/html")
            .await
        {
            let err = IngestError::SideBlobUpload {
                key: key.to_string(),
                source: e.into(),
            };
            warn!(service_id = msg.service_id, error = %err, "side-blob upload failed");
            self.health
                .side_blob_errors
                .with_label_values(&["upload"])
                .inc();
            return false;
        }

        if let Some(perf_events) = &msg.perf_events {
            let metadata = BlobMetadata {
                service_id: msg.service_id,
                perf_events: perf_events.clone(),
            };
            if let Err(e) = self.blobs.upsert_metadata(key, &metadata).await {
                warn!(key, error = %e, "side-blob metadata upsert failed");
                self.health
                    .side_blob_errors
                    .with_label_values(&["metadata"])
                    .inc();
            }
        }

        debug!(key, "side-blob uploaded");
        true
    }
}

/// Gunzips (when gzip-framed) and decodes an artifact body.
pub fn decode_body(
    decoder: &StackDecoder,
    key: &str,
    raw: &[u8],
) -> Result<DecodedArtifact, IngestError> {
    let corrupt = |source| IngestError::CorruptBody {
        key: key.to_string(),
        source,
    };

    let body = if raw.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        GzDecoder::new(raw)
            .read_to_string(&mut text)
            .map_err(corrupt)?;
        text
    } else {
        String::from_utf8(raw.to_vec())
            .map_err(|e| corrupt(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?
    };

    decoder
        .decode(&body)
        .map_err(|source| IngestError::MalformedArtifact {
            key: key.to_string(),
            source,
        })
}

/// One row per (container, frame) with the frame's inclusive weight.
pub fn stack_rows(
    artifact: &DecodedArtifact,
    service_id: u64,
    timestamp: DateTime<Utc>,
) -> Vec<StackRow> {
    let hostname: Arc<str> = Arc::from(artifact.header.hostname.as_str());
    let mut rows = Vec::with_capacity(artifact.entry_count());

    for (container, table) in &artifact.weights {
        let container: Arc<str> = Arc::from(container.as_str());
        for (hash, weight) in table {
            let Some(frame) = artifact.frames.get(hash) else {
                continue;
            };
            rows.push(StackRow {
                service_id,
                timestamp,
                hash: *hash,
                parent_hash: frame.parent_hash,
                name: Arc::clone(&frame.name),
                hostname: Arc::clone(&hostname),
                container: Arc::clone(&container),
                num_samples: *weight,
            });
        }
    }

    rows
}

/// Artifact id is the blob key's file name without extensions.
pub fn artifact_id(blob_key: &str) -> &str {
    let file = blob_key.rsplit('/').next().unwrap_or(blob_key);
    file.split('.').next().unwrap_or(file)
}

pub fn session_blob_key(service: &str, artifact_id: &str) -> String {
    format!("products/{service}/stacks/{artifact_id}.html")
}

pub fn flamegraph_blob_key(service: &str, artifact_id: &str, mode: &str) -> String {
    format!("products/{service}/stacks/flamegraph/{artifact_id}_{mode}_flamegraph.html")
}

/// Poll loop sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub max_messages: usize,
    pub poll_interval: Duration,
}

impl From<&IngestConfig> for PoolConfig {
    fn from(cfg: &IngestConfig) -> Self {
        Self {
            workers: cfg.workers.max(1),
            max_messages: cfg.max_messages.max(1),
            poll_interval: cfg.poll_interval,
        }
    }
}

/// Fixed-size pool of artifact workers fed by one poll loop.
pub struct WorkerPool<Q, B> {
    queue: Arc<Q>,
    processor: Arc<ArtifactProcessor<B>>,
    cfg: PoolConfig,
}

impl<Q, B> WorkerPool<Q, B>
where
    Q: ArtifactQueue + 'static,
    B: BlobStore + 'static,
{
    pub fn new(queue: Arc<Q>, processor: ArtifactProcessor<B>, cfg: PoolConfig) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            cfg,
        }
    }

    pub fn spawn(self, ctx: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(ctx))
    }

    /// Polls until `ctx` is cancelled, then waits for in-flight artifacts.
    pub async fn run(self, ctx: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.cfg.workers));
        let mut in_flight = JoinSet::new();

        info!(
            workers = self.cfg.workers,
            max_messages = self.cfg.max_messages,
            "worker pool started"
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            let first = tokio::select! {
                _ = ctx.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let mut permits = vec![first];
            while permits.len() < self.cfg.max_messages {
                match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let deliveries = match self.queue.receive(permits.len()).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    warn!(error = %e, "receiving queue messages");
                    drop(permits);
                    if !sleep_or_cancel(&ctx, self.cfg.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            if deliveries.is_empty() {
                drop(permits);
                if !sleep_or_cancel(&ctx, self.cfg.poll_interval).await {
                    break;
                }
                continue;
            }

            debug!(count = deliveries.len(), "received artifacts");

            for (delivery, permit) in deliveries.into_iter().zip(permits) {
                let queue = Arc::clone(&self.queue);
                let processor = Arc::clone(&self.processor);
                in_flight.spawn(async move {
                    let _permit = permit;
                    handle_delivery(queue.as_ref(), processor.as_ref(), delivery).await;
                });
            }
        }

        info!(in_flight = in_flight.len(), "worker pool draining");
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        info!("worker pool stopped");
    }
}

/// Processes one delivery and settles it with the queue.
pub async fn handle_delivery<Q: ArtifactQueue, B: BlobStore>(
    queue: &Q,
    processor: &ArtifactProcessor<B>,
    delivery: Delivery,
) {
    let health = &processor.health;
    let msg = &delivery.message;

    health.artifacts_received.inc();
    health.workers_busy.inc();
    let result = processor.process(msg).await;
    health.workers_busy.dec();

    let disposition = match result {
        Ok(report) => {
            health.artifacts_processed.inc();
            debug!(
                service_id = msg.service_id,
                blob_key = %msg.blob_key,
                rows = report.rows,
                samples = report.samples,
                side_blobs = report.side_blobs,
                "artifact ingested"
            );
            Disposition::Ack
        }
        Err(e) => {
            health
                .artifacts_failed
                .with_label_values(&[e.reason()])
                .inc();
            warn!(
                service_id = msg.service_id,
                blob_key = %msg.blob_key,
                reason = e.reason(),
                error = %e,
                "artifact processing failed"
            );
            e.disposition()
        }
    };

    let settled = match disposition {
        Disposition::Ack => queue.ack(&delivery.receipt).await,
        Disposition::Release => queue.release(&delivery.receipt).await,
    };
    if let Err(e) = settled {
        error!(
            blob_key = %msg.blob_key,
            disposition = ?disposition,
            error = %e,
            "settling queue message"
        );
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "artifact worker panicked");
    }
}

/// Returns false when `ctx` was cancelled first.
async fn sleep_or_cancel(ctx: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = ctx.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
