//! Embedded ClickHouse schema for the tier tables.
//!
//! Schema state is an append-only log in `{database}.flamestore_schema`; the
//! row with the highest `seq` is current. A migration is logged dirty before
//! its statements run and clean after, so an interrupted run is visible and
//! blocks further `up` calls until resolved by hand.

use std::fmt;

use anyhow::{bail, Context, Result};
use clickhouse_rs::{ClientHandle, Pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

struct Migration {
    version: u32,
    up: &'static str,
    down: &'static str,
}

impl Migration {
    /// Statements for `direction` with `{database}` substituted.
    fn statements(&self, direction: Direction, database: &str) -> Vec<String> {
        let sql = match direction {
            Direction::Up => self.up,
            Direction::Down => self.down,
        };
        statements(sql)
            .map(|stmt| stmt.replace("{database}", database))
            .collect()
    }
}

/// Ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up: include_str!("sql/001_init.up.sql"),
    down: include_str!("sql/001_init.down.sql"),
}];

/// Current schema version. Version 0 means nothing is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaState {
    pub version: u32,
    pub dirty: bool,
}

impl fmt::Display for SchemaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version {}", self.version)?;
        if self.dirty {
            f.write_str(" (dirty)")?;
        }
        Ok(())
    }
}

/// Schema version control for the tier tables.
pub trait Migrator: Send {
    /// Applies every migration newer than the current version.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Reverts the current version.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    fn status(&self) -> impl std::future::Future<Output = Result<SchemaState>> + Send;
}

pub struct ClickHouseMigrator {
    pool: Pool,
    database: String,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool, database: String) -> Self {
        Self { pool, database }
    }

    fn log_table(&self) -> String {
        format!("{}.flamestore_schema", self.database)
    }

    async fn handle(&self, purpose: &'static str) -> Result<ClientHandle> {
        self.pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {purpose}"))
    }

    /// Creates the log table if needed and returns the latest state with
    /// its sequence number.
    async fn load_state(&self) -> Result<(SchemaState, u64)> {
        let mut handle = self.handle("schema state").await?;
        let table = self.log_table();

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                seq UInt64, \
                version UInt32, \
                dirty UInt8, \
                logged_at DateTime('UTC') DEFAULT now()\
            ) ENGINE = MergeTree ORDER BY seq"
        );
        handle
            .execute(ddl.as_str())
            .await
            .with_context(|| format!("creating {table}"))?;

        let query = format!("SELECT seq, version, dirty FROM {table} ORDER BY seq DESC LIMIT 1");
        let block = handle
            .query(query.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("reading {table}"))?;

        let Some(row) = block.rows().next() else {
            return Ok((SchemaState::default(), 0));
        };
        let seq: u64 = row.get("seq").context("reading seq")?;
        let version: u32 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty")?;

        Ok((
            SchemaState {
                version,
                dirty: dirty != 0,
            },
            seq,
        ))
    }

    async fn log_state(&self, seq: u64, state: SchemaState) -> Result<()> {
        let mut handle = self.handle("schema log").await?;
        let sql = format!(
            "INSERT INTO {} (seq, version, dirty) VALUES ({seq}, {}, {})",
            self.log_table(),
            state.version,
            u8::from(state.dirty)
        );
        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("logging schema {state}"))
    }

    /// Runs one migration bracketed by dirty and clean log entries.
    /// `after` is the version recorded once the statements succeed.
    async fn run(
        &self,
        migration: &Migration,
        direction: Direction,
        seq: u64,
        after: u32,
    ) -> Result<u64> {
        self.log_state(
            seq + 1,
            SchemaState {
                version: migration.version,
                dirty: true,
            },
        )
        .await?;

        let mut handle = self.handle("migration").await?;
        for stmt in migration.statements(direction, &self.database) {
            if let Err(e) = handle.execute(stmt.as_str()).await {
                let head: String = stmt.chars().take(80).collect();
                return Err(e).with_context(|| {
                    format!(
                        "migration {} {direction:?} failed at: {head}",
                        migration.version
                    )
                });
            }
        }

        self.log_state(
            seq + 2,
            SchemaState {
                version: after,
                dirty: false,
            },
        )
        .await?;

        Ok(seq + 2)
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        let (state, mut seq) = self.load_state().await?;
        if state.dirty {
            bail!("schema {state} needs manual repair before migrating");
        }

        let mut applied = 0usize;
        for migration in MIGRATIONS.iter().filter(|m| m.version > state.version) {
            tracing::info!(version = migration.version, "applying migration");
            seq = self
                .run(migration, Direction::Up, seq, migration.version)
                .await?;
            applied += 1;
        }

        tracing::info!(from = state.version, applied, "schema up to date");

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        let (state, seq) = self.load_state().await?;
        if state.version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let Some(migration) = MIGRATIONS.iter().find(|m| m.version == state.version) else {
            bail!("schema {state} is not a known migration");
        };
        let previous = previous_version(state.version);

        tracing::info!(version = state.version, "rolling back migration");
        self.run(migration, Direction::Down, seq, previous).await?;
        tracing::info!(version = previous, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<SchemaState> {
        Ok(self.load_state().await?.0)
    }
}

fn previous_version(version: u32) -> u32 {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < version)
        .max()
        .unwrap_or(0)
}

/// Non-empty `;`-separated statements.
fn statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|s| !s.is_empty())
}
