use std::fmt::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use crate::export::health::HealthMetrics;

use super::{MetricRow, ReadRequest, StackRow, Tier, TieredStore};

/// ClickHouse-backed tiered store.
///
/// Every stack tier is a `SummingMergeTree` with the same columns, so
/// same-key inserts collapse natively. Reads still `GROUP BY` the key because
/// merges are asynchronous.
pub struct ClickHouseStore {
    pool: Pool,
    database: String,
    health: Option<Arc<HealthMetrics>>,
}

const STACK_COLUMNS: &str =
    "service_id, timestamp, hash, parent_hash, name, hostname, container, num_samples";

const METRIC_COLUMNS: &str = "service_id, timestamp, hostname, cpu_avg, mem_avg, html_path";

impl ClickHouseStore {
    pub fn new(pool: Pool, database: String, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            pool,
            database,
            health,
        }
    }

    fn table(&self, tier: Tier) -> String {
        format!("{}.{}", self.database, table_name(tier))
    }

    fn metrics_table(&self) -> String {
        format!("{}.artifact_metrics", self.database)
    }

    async fn insert_stacks(&self, tier: Tier, rows: &[StackRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let table = self.table(tier);
        let sql = build_stack_insert(&table, rows);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {table} insert"))?;

        if let Err(e) = handle.execute(sql.as_str()).await {
            self.record_batch_error(tier.as_str());
            return Err(e).with_context(|| format!("sending {table} batch"));
        }

        Ok(())
    }

    fn record_batch_error(&self, table: &str) {
        if let Some(health) = &self.health {
            health
                .store_batch_errors
                .with_label_values(&["clickhouse", table])
                .inc();
        }
    }
}

impl TieredStore for ClickHouseStore {
    async fn append_raw(&self, rows: &[StackRow]) -> Result<()> {
        self.insert_stacks(Tier::Raw, rows).await
    }

    async fn rollup(&self, tier: Tier, rows: &[StackRow]) -> Result<()> {
        if tier == Tier::Raw {
            bail!("raw rows must be written with append_raw");
        }
        self.insert_stacks(tier, rows).await
    }

    async fn append_metrics(&self, rows: &[MetricRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let table = self.metrics_table();
        let mut sql = String::with_capacity(64 + table.len() + rows.len() * 96);
        let _ = write!(sql, "INSERT INTO {table} ({METRIC_COLUMNS}) VALUES ");

        for (idx, m) in rows.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            let _ = write!(
                sql,
                "({}, {}, '{}', {}, {}, '{}')",
                m.service_id,
                format_datetime(m.timestamp),
                escape_sql(&m.hostname),
                m.cpu_avg,
                m.mem_avg,
                escape_sql(m.html_path.as_deref().unwrap_or("")),
            );
        }

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for metrics insert")?;

        if let Err(e) = handle.execute(sql.as_str()).await {
            self.record_batch_error("artifact_metrics");
            return Err(e).context("sending artifact_metrics batch");
        }

        Ok(())
    }

    async fn read(&self, tier: Tier, req: &ReadRequest) -> Result<Vec<StackRow>> {
        let sql = build_stack_select(&self.table(tier), tier, req);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {tier} read"))?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("reading tier {tier}"))?;

        let mut rows = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let ts: u32 = row.get("ts").context("reading ts")?;
            let name: String = row.get("name").context("reading name")?;
            let hostname: String = row.get("hostname").context("reading hostname")?;
            let container: String = row.get("container").context("reading container")?;

            rows.push(StackRow {
                service_id: req.service_id,
                timestamp: from_unix(ts)?,
                hash: row.get("hash").context("reading hash")?,
                parent_hash: row.get("parent_hash").context("reading parent_hash")?,
                name: Arc::from(name),
                hostname: Arc::from(hostname),
                container: Arc::from(container),
                num_samples: row.get("num_samples").context("reading num_samples")?,
            });
        }

        Ok(rows)
    }

    async fn read_metrics(&self, req: &ReadRequest) -> Result<Vec<MetricRow>> {
        let mut sql = format!(
            "SELECT toUnixTimestamp(timestamp) AS ts, hostname, cpu_avg, mem_avg, html_path \
             FROM {} WHERE service_id = {} AND timestamp >= {} AND timestamp < {}",
            self.metrics_table(),
            req.service_id,
            format_datetime(req.start),
            format_datetime(req.end),
        );
        if let Some(host) = &req.hostname {
            let _ = write!(sql, " AND hostname = '{}'", escape_sql(host));
        }
        sql.push_str(" ORDER BY ts");

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for metrics read")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("reading artifact metrics")?;

        let mut rows = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let ts: u32 = row.get("ts").context("reading ts")?;
            let html_path: String = row.get("html_path").context("reading html_path")?;
            rows.push(MetricRow {
                service_id: req.service_id,
                timestamp: from_unix(ts)?,
                hostname: row.get("hostname").context("reading hostname")?,
                cpu_avg: row.get("cpu_avg").context("reading cpu_avg")?,
                mem_avg: row.get("mem_avg").context("reading mem_avg")?,
                html_path: (!html_path.is_empty()).then_some(html_path),
            });
        }

        Ok(rows)
    }

    async fn evict(&self, tier: Tier, before: DateTime<Utc>) -> Result<u64> {
        let table = self.table(tier);
        self.delete_before(&table, before).await
    }

    async fn evict_metrics(&self, before: DateTime<Utc>) -> Result<u64> {
        let table = self.metrics_table();
        self.delete_before(&table, before).await
    }
}

impl ClickHouseStore {
    async fn delete_before(&self, table: &str, before: DateTime<Utc>) -> Result<u64> {
        let cutoff = format_datetime(before);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {table} eviction"))?;

        let block = handle
            .query(format!("SELECT count() AS n FROM {table} WHERE timestamp < {cutoff}").as_str())
            .fetch_all()
            .await
            .with_context(|| format!("counting expired rows in {table}"))?;
        let expired: u64 = match block.rows().next() {
            Some(row) => row.get("n").context("reading count")?,
            None => 0,
        };

        if expired == 0 {
            return Ok(0);
        }

        handle
            .execute(format!("ALTER TABLE {table} DELETE WHERE timestamp < {cutoff}").as_str())
            .await
            .with_context(|| format!("deleting expired rows from {table}"))?;

        Ok(expired)
    }
}

/// Table backing each tier.
pub fn table_name(tier: Tier) -> &'static str {
    match tier {
        Tier::Raw => "stacks_raw",
        Tier::Minute => "stacks_minute_root",
        Tier::HourByHost => "stacks_hour_by_host",
        Tier::Hour => "stacks_hour",
        Tier::DayByHost => "stacks_day_by_host",
        Tier::Day => "stacks_day",
    }
}

fn build_stack_insert(table: &str, rows: &[StackRow]) -> String {
    let mut sql = String::with_capacity(64 + table.len() + rows.len() * 128);
    let _ = write!(sql, "INSERT INTO {table} ({STACK_COLUMNS}) VALUES ");

    for (idx, r) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(
            sql,
            "({}, {}, {}, {}, '{}', '{}', '{}', {})",
            r.service_id,
            format_datetime(r.timestamp),
            r.hash,
            r.parent_hash,
            escape_sql(&r.name),
            escape_sql(&r.hostname),
            escape_sql(&r.container),
            r.num_samples,
        );
    }

    sql
}

fn build_stack_select(table: &str, tier: Tier, req: &ReadRequest) -> String {
    let mut sql = format!(
        "SELECT toUnixTimestamp(timestamp) AS ts, hash, parent_hash, any(name) AS name, \
         hostname, container, sum(num_samples) AS num_samples \
         FROM {table} WHERE service_id = {} AND timestamp >= {} AND timestamp < {}",
        req.service_id,
        format_datetime(req.start),
        format_datetime(req.end),
    );

    if tier.keeps_breakdown() {
        if let Some(host) = &req.hostname {
            let _ = write!(sql, " AND hostname = '{}'", escape_sql(host));
        }
        if let Some(container) = &req.container {
            let _ = write!(sql, " AND container = '{}'", escape_sql(container));
        }
    }

    sql.push_str(" GROUP BY ts, hash, parent_hash, hostname, container");
    sql
}

fn from_unix(ts: u32) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(i64::from(ts), 0)
        .with_context(|| format!("timestamp {ts} out of range"))
}

/// Formats a timestamp as a quoted ClickHouse DateTime literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn test_escape_sql() {
        assert_eq!(escape_sql("plain"), "plain");
        assert_eq!(escape_sql("it's"), "it\\'s");
        assert_eq!(escape_sql("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_format_datetime() {
        assert_eq!(format_datetime(at(7)), "'2024-05-01 07:00:00'");
    }

    #[test]
    fn test_build_stack_insert() {
        let rows = vec![StackRow {
            service_id: 3,
            timestamp: at(1),
            hash: 42,
            parent_hash: 0,
            name: Arc::from("java.lang.Thread's run"),
            hostname: Arc::from("h1"),
            container: Arc::from(""),
            num_samples: 9,
        }];
        let sql = build_stack_insert("db.stacks_raw", &rows);
        assert_eq!(
            sql,
            "INSERT INTO db.stacks_raw (service_id, timestamp, hash, parent_hash, name, hostname, container, num_samples) \
             VALUES (3, '2024-05-01 01:00:00', 42, 0, 'java.lang.Thread\\'s run', 'h1', '', 9)"
        );
    }

    #[test]
    fn test_build_stack_select_applies_filters_on_breakdown_tiers() {
        let mut req = ReadRequest::new(3, at(1), at(2));
        req.hostname = Some("h1".to_string());

        let sql = build_stack_select("db.stacks_hour_by_host", Tier::HourByHost, &req);
        assert!(sql.contains("hostname = 'h1'"));
        assert!(sql.contains("timestamp >= '2024-05-01 01:00:00'"));
        assert!(sql.contains("timestamp < '2024-05-01 02:00:00'"));
        assert!(sql.ends_with("GROUP BY ts, hash, parent_hash, hostname, container"));

        let sql = build_stack_select("db.stacks_hour", Tier::Hour, &req);
        assert!(!sql.contains("hostname = "));
    }

    #[test]
    fn test_table_names_unique() {
        let mut names: Vec<_> = Tier::ALL.iter().map(|t| table_name(*t)).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Tier::ALL.len());
    }
}
