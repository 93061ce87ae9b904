use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::{Config, StoreBackendKind};
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseConnection;
use crate::ingest::blob::BlobBackend;
use crate::ingest::queue::SpoolQueue;
use crate::ingest::{ArtifactProcessor, PoolConfig, WorkerPool};
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::query::http::QueryServer;
use crate::query::QueryService;
use crate::stack::decode::{IdleFilter, StackDecoder};
use crate::stack::normalize::ReloadableRules;
use crate::store::retention::{spawn_evictor, RetentionPolicy};
use crate::store::sink::default_sinks;
use crate::store::{ClickHouseStore, MemoryStore, Store};
use crate::writer::BatchedWriter;

/// Engine owns every component: store, writer, worker pool, retention,
/// rule reloading and the HTTP servers.
pub struct Engine {
    cfg: Config,
    health: Arc<HealthMetrics>,
    clock: SharedClock,
    /// Cancelled when a component fails in a way that needs a restart.
    fatal: CancellationToken,
    /// Stops the worker pool's intake.
    intake: CancellationToken,
    /// Stops background maintenance tasks.
    cancel: CancellationToken,
    connection: Option<ClickHouseConnection>,
    store: Option<Arc<Store>>,
    writer: Option<BatchedWriter>,
    pool: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    query: Option<QueryServer>,
    query_addr: Option<SocketAddr>,
    health_addr: Option<SocketAddr>,
}

impl Engine {
    /// Creates a new Engine, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: Config, clock: SharedClock) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            clock,
            fatal: CancellationToken::new(),
            intake: CancellationToken::new(),
            cancel: CancellationToken::new(),
            connection: None,
            store: None,
            writer: None,
            pool: None,
            background: Vec::new(),
            query: None,
            query_addr: None,
            health_addr: None,
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Token cancelled when the engine can no longer make progress.
    pub fn fatal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    pub fn store(&self) -> Option<&Arc<Store>> {
        self.store.as_ref()
    }

    pub fn query_addr(&self) -> Option<SocketAddr> {
        self.query_addr
    }

    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    /// Start all components and begin ingesting.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during migrations.
        let health_addr = self
            .health
            .start()
            .await
            .context("starting health metrics server")?;
        self.health_addr = Some(health_addr);

        // 1. Store backend.
        let store = Arc::new(self.open_store().await?);
        info!(backend = store.name(), "store ready");
        self.store = Some(Arc::clone(&store));

        // 2. Normalization rules and their file watcher.
        let rules = Arc::new(
            ReloadableRules::new(&self.cfg.ingest.normalization)
                .context("loading normalization rules")?,
        );
        if let Some(watcher) = rules.spawn_watcher(
            self.cfg.ingest.normalization.reload_interval,
            self.cancel.child_token(),
        ) {
            self.background.push(watcher);
        }

        // 3. Batched writer.
        let writer = BatchedWriter::start(
            Arc::clone(&store),
            default_sinks(),
            &self.cfg.writer,
            Arc::clone(&self.health),
            self.fatal.clone(),
        );

        // 4. Retention.
        let policy = RetentionPolicy::from(&self.cfg.store.retention);
        self.background.push(spawn_evictor(
            Arc::clone(&store),
            policy,
            Arc::clone(&self.clock),
            self.cfg.store.eviction_interval,
            Arc::clone(&self.health),
            self.cancel.child_token(),
        ));

        // 5. Worker pool.
        let queue = Arc::new(
            SpoolQueue::open(&self.cfg.ingest.queue.spool_dir)
                .await
                .context("opening spool queue")?,
        );
        let blobs = Arc::new(
            BlobBackend::from_config(&self.cfg.ingest.blobs).context("creating blob backend")?,
        );
        info!(
            spool_dir = %queue.dir().display(),
            blobs = blobs.name(),
            "ingest sources ready"
        );

        let decoder = Arc::new(StackDecoder::new(
            rules,
            IdleFilter::new(self.cfg.ingest.idle_frames.clone()),
        ));
        let processor = ArtifactProcessor::new(
            blobs,
            decoder,
            writer.handle(),
            Arc::clone(&self.clock),
            Arc::clone(&self.health),
        );
        let pool = WorkerPool::new(queue, processor, PoolConfig::from(&self.cfg.ingest));
        self.pool = Some(pool.spawn(self.intake.clone()));
        self.writer = Some(writer);

        // 6. Read API.
        let service = Arc::new(QueryService::new(
            store,
            policy,
            Arc::clone(&self.clock),
            Arc::clone(&self.health),
        ));
        let server = QueryServer::new(&self.cfg.query.addr, service);
        self.query_addr = Some(server.start().await.context("starting query server")?);
        self.query = Some(server);

        info!("engine fully started");

        Ok(())
    }

    async fn open_store(&mut self) -> Result<Store> {
        match self.cfg.store.backend {
            StoreBackendKind::Memory => Ok(Store::Memory(MemoryStore::new())),
            StoreBackendKind::Clickhouse => {
                let ch_cfg = self.cfg.store.clickhouse.clone();
                let mut connection = ClickHouseConnection::new(ch_cfg.clone());
                let pool = connection
                    .connect()
                    .await
                    .context("connecting to ClickHouse")?;

                if ch_cfg.migrations.enabled {
                    info!("running ClickHouse migrations...");
                    ClickHouseMigrator::new(pool.clone(), ch_cfg.database.clone())
                        .up()
                        .await
                        .context("running migrations")?;
                }

                self.connection = Some(connection);
                Ok(Store::ClickHouse(ClickHouseStore::new(
                    pool,
                    ch_cfg.database,
                    Some(Arc::clone(&self.health)),
                )))
            }
        }
    }

    /// Gracefully stop all components.
    ///
    /// Order: stop intake and drain in-flight artifacts, close the writer
    /// (final flush), stop maintenance tasks, then the servers.
    pub async fn stop(&mut self) -> Result<()> {
        self.intake.cancel();
        if let Some(pool) = self.pool.take() {
            if let Err(e) = pool.await {
                error!(error = %e, "worker pool task failed");
            }
        }

        let mut result = Ok(());
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.close().await {
                error!(error = %e, "error closing writer");
                result = Err(e).context("closing writer");
            }
        }

        self.cancel.cancel();
        for task in self.background.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }

        if let Some(query) = self.query.take() {
            query.stop().await?;
        }

        if let Some(connection) = &mut self.connection {
            connection.close();
        }

        self.health.stop().await?;

        info!("engine stopped");

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.store.backend = StoreBackendKind::Memory;
        cfg.ingest.queue.spool_dir = dir.join("spool");
        cfg.ingest.blobs.root = dir.join("blobs");
        cfg.query.addr = "127.0.0.1:0".to_string();
        cfg.health.addr = "127.0.0.1:0".to_string();
        cfg
    }

    #[tokio::test]
    async fn test_start_and_stop_with_memory_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = Engine::new(test_config(dir.path())).expect("engine");

        engine.start().await.expect("start");
        assert!(engine.query_addr().is_some());
        assert!(engine.health_addr().is_some());
        assert_eq!(engine.store().map(|s| s.name()), Some("memory"));
        assert!(dir.path().join("spool").is_dir());

        engine.stop().await.expect("stop");
        assert!(!engine.fatal().is_cancelled());
    }

    #[tokio::test]
    async fn test_invalid_rules_fail_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = test_config(dir.path());
        cfg.ingest.normalization.rules = vec![crate::config::RuleConfig {
            pattern: "(".to_string(),
            replacement: String::new(),
        }];

        let mut engine = Engine::new(cfg).expect("engine");
        assert!(engine.start().await.is_err());
        engine.stop().await.expect("stop");
    }
}
