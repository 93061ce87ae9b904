pub mod health;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;

/// Owns the ClickHouse native TCP pool shared by the store and migrator.
pub struct ClickHouseConnection {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
}

impl ClickHouseConnection {
    pub fn new(cfg: ClickHouseConfig) -> Self {
        Self { cfg, pool: None }
    }

    /// Opens the pool and pings the server before handing it out.
    pub async fn connect(&mut self) -> Result<Pool> {
        let pool = Pool::new(dsn(&self.cfg));

        let mut handle = pool
            .get_handle()
            .await
            .with_context(|| format!("opening ClickHouse connection to {}", self.cfg.endpoint))?;
        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            pool_max = self.cfg.pool_max,
            "ClickHouse connected"
        );

        self.pool = Some(pool.clone());

        Ok(pool)
    }

    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.cfg
    }

    /// Drops this handle's reference to the pool. Clones held by the store
    /// keep their connections until they are dropped.
    pub fn close(&mut self) {
        if self.pool.take().is_some() {
            tracing::debug!(endpoint = %self.cfg.endpoint, "ClickHouse pool released");
        }
    }
}

/// `tcp://[user[:pass]@]host:port/database?options` for clickhouse-rs.
fn dsn(cfg: &ClickHouseConfig) -> String {
    let credentials = match (cfg.username.is_empty(), cfg.password.is_empty()) {
        (true, _) => String::new(),
        (false, true) => format!("{}@", cfg.username),
        (false, false) => format!("{}:{}@", cfg.username, cfg.password),
    };
    let pool_min = cfg.pool_max.min(2);

    format!(
        "tcp://{credentials}{}/{}?compression=lz4&pool_min={pool_min}&pool_max={}",
        cfg.endpoint, cfg.database, cfg.pool_max
    )
}
