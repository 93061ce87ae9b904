//! Batched, backpressured writes into the tiered store.
//!
//! Producers push rows into one bounded channel per record kind and then a
//! barrier. A flush loop per kind buffers rows, flushes on size or on the
//! interval tick, and answers each barrier once every row sent before it has
//! reached every tier. Callers can therefore acknowledge upstream work as
//! soon as their enqueue future resolves.
//!
//! Tier fan-out within one flush is not transactional. Each step (raw, then
//! every roll-up sink) is retried on its own, so a retry never re-adds rows
//! to a tier that already accepted them.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WriterConfig;
use crate::export::health::HealthMetrics;
use crate::store::sink::WriteSink;
use crate::store::{MetricRow, StackRow, Store, Tier, TieredStore};

/// Errors surfaced to producers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriterError {
    #[error("writer is closed")]
    Closed,

    #[error("{kind} flush failed: {message}")]
    FlushFailed { kind: &'static str, message: String },
}

type BarrierTx = oneshot::Sender<Result<(), WriterError>>;

/// Items carried by a writer channel.
enum Record<T> {
    Row(T),
    Barrier(BarrierTx),
}

/// Retry policy for individual flush steps.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

/// Runs `op` until it succeeds or `max_retries` retries have failed.
async fn with_retry<F, Fut>(
    policy: RetryPolicy,
    kind: &'static str,
    step: &str,
    health: &HealthMetrics,
    mut op: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt = 0u32;
    let mut backoff = policy.backoff;

    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                health.flush_errors.with_label_values(&[kind]).inc();
                attempt += 1;

                if attempt > policy.max_retries {
                    return Err(e.context(format!(
                        "{kind} flush step {step} failed after {attempt} attempts"
                    )));
                }

                warn!(
                    kind,
                    step,
                    attempt,
                    backoff = ?backoff,
                    error = %e,
                    "flush step failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }
}

/// Writes one batch of a record kind to the store.
trait Flush<T>: Send + Sync + 'static {
    const KIND: &'static str;

    fn flush(&self, batch: &[T]) -> impl Future<Output = Result<()>> + Send;
}

struct StackFlusher {
    store: Arc<Store>,
    sinks: Vec<Box<dyn WriteSink>>,
    retry: RetryPolicy,
    health: Arc<HealthMetrics>,
}

impl Flush<StackRow> for StackFlusher {
    const KIND: &'static str = "stacks";

    async fn flush(&self, batch: &[StackRow]) -> Result<()> {
        let health = &self.health;

        with_retry(self.retry, Self::KIND, Tier::Raw.as_str(), health, || {
            self.store.append_raw(batch)
        })
        .await?;
        health
            .rows_written
            .with_label_values(&[Tier::Raw.as_str()])
            .inc_by(batch.len() as f64);

        for sink in &self.sinks {
            let tier = sink.tier();
            let projected = sink.project_batch(batch);
            if projected.is_empty() {
                continue;
            }

            with_retry(self.retry, Self::KIND, tier.as_str(), health, || {
                self.store.rollup(tier, &projected)
            })
            .await?;
            health
                .rows_written
                .with_label_values(&[tier.as_str()])
                .inc_by(projected.len() as f64);
        }

        Ok(())
    }
}

struct MetricFlusher {
    store: Arc<Store>,
    retry: RetryPolicy,
    health: Arc<HealthMetrics>,
}

impl Flush<MetricRow> for MetricFlusher {
    const KIND: &'static str = "metrics";

    async fn flush(&self, batch: &[MetricRow]) -> Result<()> {
        with_retry(self.retry, Self::KIND, "metrics", &self.health, || {
            self.store.append_metrics(batch)
        })
        .await?;
        self.health
            .rows_written
            .with_label_values(&["metrics"])
            .inc_by(batch.len() as f64);
        Ok(())
    }
}

/// Cloneable producer side of the writer.
#[derive(Clone)]
pub struct WriterHandle {
    stacks: mpsc::Sender<Record<StackRow>>,
    metrics: mpsc::Sender<Record<MetricRow>>,
    health: Arc<HealthMetrics>,
}

impl WriterHandle {
    /// Queues stack rows and waits until all of them are in every tier.
    ///
    /// Blocks while the queue is full.
    pub async fn enqueue_stacks(&self, rows: Vec<StackRow>) -> Result<(), WriterError> {
        let result = send_with_barrier(&self.stacks, rows).await;
        self.record_queue_length("stacks", &self.stacks);
        result
    }

    /// Queues metric rows and waits until they are stored.
    pub async fn enqueue_metrics(&self, rows: Vec<MetricRow>) -> Result<(), WriterError> {
        let result = send_with_barrier(&self.metrics, rows).await;
        self.record_queue_length("metrics", &self.metrics);
        result
    }

    fn record_queue_length<T>(&self, kind: &str, tx: &mpsc::Sender<T>) {
        let queued = tx.max_capacity().saturating_sub(tx.capacity());
        self.health
            .writer_queue_length
            .with_label_values(&[kind])
            .set(queued as f64);
    }
}

async fn send_with_barrier<T>(
    tx: &mpsc::Sender<Record<T>>,
    rows: Vec<T>,
) -> Result<(), WriterError> {
    for row in rows {
        tx.send(Record::Row(row))
            .await
            .map_err(|_| WriterError::Closed)?;
    }

    let (done_tx, done_rx) = oneshot::channel();
    tx.send(Record::Barrier(done_tx))
        .await
        .map_err(|_| WriterError::Closed)?;

    done_rx.await.map_err(|_| WriterError::Closed)?
}

/// Owns the flush loops.
pub struct BatchedWriter {
    handle: WriterHandle,
    stop: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<Result<(), WriterError>>)>,
}

impl BatchedWriter {
    /// Spawns one flush loop per record kind.
    ///
    /// `fatal` is cancelled when a flush exhausts its retries.
    pub fn start(
        store: Arc<Store>,
        sinks: Vec<Box<dyn WriteSink>>,
        cfg: &WriterConfig,
        health: Arc<HealthMetrics>,
        fatal: CancellationToken,
    ) -> Self {
        let retry = RetryPolicy {
            max_retries: cfg.max_retries,
            backoff: cfg.retry_backoff,
        };
        let loop_cfg = LoopConfig {
            batch_size: cfg.batch_size.max(1),
            flush_interval: cfg.flush_interval,
        };
        let capacity = cfg.queue_capacity.max(1);
        let stop = CancellationToken::new();

        let (stacks_tx, stacks_rx) = mpsc::channel(capacity);
        let (metrics_tx, metrics_rx) = mpsc::channel(capacity);

        for kind in ["stacks", "metrics"] {
            health
                .writer_queue_capacity
                .with_label_values(&[kind])
                .set(capacity as f64);
        }

        let stack_flusher = StackFlusher {
            store: Arc::clone(&store),
            sinks,
            retry,
            health: Arc::clone(&health),
        };
        let metric_flusher = MetricFlusher {
            store,
            retry,
            health: Arc::clone(&health),
        };

        let tasks = vec![
            (
                StackFlusher::KIND,
                tokio::spawn(run_flush_loop(
                    stack_flusher,
                    stacks_rx,
                    loop_cfg,
                    Arc::clone(&health),
                    stop.clone(),
                    fatal.clone(),
                )),
            ),
            (
                MetricFlusher::KIND,
                tokio::spawn(run_flush_loop(
                    metric_flusher,
                    metrics_rx,
                    loop_cfg,
                    Arc::clone(&health),
                    stop.clone(),
                    fatal,
                )),
            ),
        ];

        info!(
            capacity,
            batch_size = loop_cfg.batch_size,
            flush_interval = ?loop_cfg.flush_interval,
            "batched writer started"
        );

        Self {
            handle: WriterHandle {
                stacks: stacks_tx,
                metrics: metrics_tx,
                health,
            },
            stop,
            tasks,
        }
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Flushes everything queued and waits for the loops to exit.
    ///
    /// Loops exit once every [`WriterHandle`] clone has been dropped; until
    /// then each barrier is flushed immediately.
    pub async fn close(self) -> Result<(), WriterError> {
        self.stop.cancel();
        drop(self.handle);

        let mut result = Ok(());
        for (kind, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => debug!(kind, "flush loop exited"),
                Ok(Err(e)) => {
                    error!(kind, error = %e, "flush loop exited with error");
                    result = Err(e);
                }
                Err(e) => {
                    error!(kind, error = %e, "flush loop panicked");
                    result = Err(WriterError::FlushFailed {
                        kind,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!("batched writer closed");
        result
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopConfig {
    batch_size: usize,
    flush_interval: Duration,
}

/// Pending rows plus the barriers waiting on them.
struct Pending<T> {
    rows: Vec<T>,
    waiters: Vec<BarrierTx>,
    failure: Option<WriterError>,
}

impl<T> Pending<T> {
    async fn flush<F: Flush<T>>(
        &mut self,
        flusher: &F,
        health: &HealthMetrics,
        fatal: &CancellationToken,
    ) {
        if self.failure.is_none() && !self.rows.is_empty() {
            let started = Instant::now();
            let result = flusher.flush(&self.rows).await;

            health
                .flush_duration
                .with_label_values(&[F::KIND])
                .observe(started.elapsed().as_secs_f64());
            health
                .flush_batch_size
                .with_label_values(&[F::KIND])
                .observe(self.rows.len() as f64);

            match result {
                Ok(()) => {
                    debug!(kind = F::KIND, rows = self.rows.len(), "batch flushed");
                }
                Err(e) => {
                    error!(
                        kind = F::KIND,
                        rows = self.rows.len(),
                        error = %format!("{e:#}"),
                        "flush retries exhausted, stopping"
                    );
                    self.failure = Some(WriterError::FlushFailed {
                        kind: F::KIND,
                        message: format!("{e:#}"),
                    });
                    fatal.cancel();
                }
            }
        }

        self.rows.clear();
        let outcome = match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}

async fn run_flush_loop<T, F>(
    flusher: F,
    mut rx: mpsc::Receiver<Record<T>>,
    cfg: LoopConfig,
    health: Arc<HealthMetrics>,
    stop: CancellationToken,
    fatal: CancellationToken,
) -> Result<(), WriterError>
where
    T: Send + Sync + 'static,
    F: Flush<T>,
{
    let mut pending = Pending {
        rows: Vec::with_capacity(cfg.batch_size),
        waiters: Vec::new(),
        failure: None,
    };
    let mut draining = false;

    let mut ticker = tokio::time::interval(cfg.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(Record::Row(row)) => {
                    if pending.failure.is_some() {
                        continue;
                    }
                    pending.rows.push(row);
                    if pending.rows.len() >= cfg.batch_size {
                        pending.flush(&flusher, &health, &fatal).await;
                    }
                }
                Some(Record::Barrier(tx)) => {
                    pending.waiters.push(tx);
                    if pending.rows.is_empty() || draining {
                        pending.flush(&flusher, &health, &fatal).await;
                    }
                }
                None => {
                    pending.flush(&flusher, &health, &fatal).await;
                    return match pending.failure {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            },

            _ = ticker.tick() => {
                if !pending.rows.is_empty() || !pending.waiters.is_empty() {
                    pending.flush(&flusher, &health, &fatal).await;
                }
            }

            _ = stop.cancelled(), if !draining => {
                draining = true;
                pending.flush(&flusher, &health, &fatal).await;
                debug!(kind = F::KIND, "flush loop draining");
            }
        }
    }
}
