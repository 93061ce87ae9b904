//! Time-tiered stack storage.
//!
//! Raw rows are appended once per artifact. Every coarser tier is a
//! projection of raw rows into a wider time bucket (and optionally a
//! narrower grouping key), summed on conflict. No tier is ever derived from
//! another tier's aggregated state.

pub mod clickhouse;
pub mod memory;
pub mod retention;
pub mod sink;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{floor_day, floor_hour, floor_minute};

pub use self::clickhouse::ClickHouseStore;
pub use self::memory::MemoryStore;

/// Aggregation tier. Ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Raw,
    /// Root frames only, per minute. Feeds sample-rate timelines.
    Minute,
    HourByHost,
    Hour,
    DayByHost,
    Day,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Raw,
        Tier::Minute,
        Tier::HourByHost,
        Tier::Hour,
        Tier::DayByHost,
        Tier::Day,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Minute => "minute",
            Self::HourByHost => "hour_by_host",
            Self::Hour => "hour",
            Self::DayByHost => "day_by_host",
            Self::Day => "day",
        }
    }

    /// Dense index for per-tier arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Raw => ts,
            Self::Minute => floor_minute(ts),
            Self::HourByHost | Self::Hour => floor_hour(ts),
            Self::DayByHost | Self::Day => floor_day(ts),
        }
    }

    /// Whether rows keep their hostname and container.
    pub fn keeps_breakdown(self) -> bool {
        matches!(self, Self::Raw | Self::HourByHost | Self::DayByHost)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame's weight in one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackRow {
    pub service_id: u64,
    pub timestamp: DateTime<Utc>,
    pub hash: u64,
    pub parent_hash: u64,
    pub name: Arc<str>,
    pub hostname: Arc<str>,
    pub container: Arc<str>,
    pub num_samples: u64,
}

impl StackRow {
    pub(crate) fn key(&self) -> RowKey {
        RowKey {
            service_id: self.service_id,
            timestamp: self.timestamp,
            hash: self.hash,
            parent_hash: self.parent_hash,
            hostname: Arc::clone(&self.hostname),
            container: Arc::clone(&self.container),
        }
    }
}

/// Grouping key rows are summed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RowKey {
    pub service_id: u64,
    pub timestamp: DateTime<Utc>,
    pub hash: u64,
    pub parent_hash: u64,
    pub hostname: Arc<str>,
    pub container: Arc<str>,
}

impl RowKey {
    pub(crate) fn into_row(self, name: Arc<str>, num_samples: u64) -> StackRow {
        StackRow {
            service_id: self.service_id,
            timestamp: self.timestamp,
            hash: self.hash,
            parent_hash: self.parent_hash,
            name,
            hostname: self.hostname,
            container: self.container,
            num_samples,
        }
    }
}

/// Per-artifact resource summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub service_id: u64,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub cpu_avg: f64,
    pub mem_avg: f64,
    /// Key of the uploaded session HTML, when there was one.
    pub html_path: Option<String>,
}

/// Half-open window `[start, end)` with optional breakdown filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub service_id: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub hostname: Option<String>,
    pub container: Option<String>,
}

impl ReadRequest {
    pub fn new(service_id: u64, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            service_id,
            start,
            end,
            hostname: None,
            container: None,
        }
    }

    pub fn has_filter(&self) -> bool {
        self.hostname.is_some() || self.container.is_some()
    }

    /// Whether `row` falls in the window and matches the filters. Filters
    /// only apply to tiers that keep the breakdown.
    pub(crate) fn matches(&self, tier: Tier, row: &RowKey) -> bool {
        if row.service_id != self.service_id
            || row.timestamp < self.start
            || row.timestamp >= self.end
        {
            return false;
        }
        if !tier.keeps_breakdown() {
            return true;
        }
        let host_ok = self
            .hostname
            .as_deref()
            .map_or(true, |h| &*row.hostname == h);
        let container_ok = self
            .container
            .as_deref()
            .map_or(true, |c| &*row.container == c);
        host_ok && container_ok
    }
}

/// Storage contract shared by every backend.
///
/// Writes are additive: rows with an identical key are summed. Reads return
/// one row per key.
pub trait TieredStore: Send + Sync {
    /// Appends rows to the raw tier.
    fn append_raw(&self, rows: &[StackRow]) -> impl Future<Output = Result<()>> + Send;

    /// Adds already-bucketed rows to a roll-up tier.
    fn rollup(&self, tier: Tier, rows: &[StackRow]) -> impl Future<Output = Result<()>> + Send;

    fn append_metrics(&self, rows: &[MetricRow]) -> impl Future<Output = Result<()>> + Send;

    fn read(
        &self,
        tier: Tier,
        req: &ReadRequest,
    ) -> impl Future<Output = Result<Vec<StackRow>>> + Send;

    fn read_metrics(&self, req: &ReadRequest)
        -> impl Future<Output = Result<Vec<MetricRow>>> + Send;

    /// Removes rows whose bucket starts before `before`. Returns the number
    /// of rows removed.
    fn evict(&self, tier: Tier, before: DateTime<Utc>)
        -> impl Future<Output = Result<u64>> + Send;

    fn evict_metrics(&self, before: DateTime<Utc>) -> impl Future<Output = Result<u64>> + Send;
}

/// Backend selected at startup.
pub enum Store {
    Memory(MemoryStore),
    ClickHouse(ClickHouseStore),
}

impl Store {
    /// Returns the backend name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::ClickHouse(_) => "clickhouse",
        }
    }
}

impl TieredStore for Store {
    async fn append_raw(&self, rows: &[StackRow]) -> Result<()> {
        match self {
            Self::Memory(s) => s.append_raw(rows).await,
            Self::ClickHouse(s) => s.append_raw(rows).await,
        }
    }

    async fn rollup(&self, tier: Tier, rows: &[StackRow]) -> Result<()> {
        match self {
            Self::Memory(s) => s.rollup(tier, rows).await,
            Self::ClickHouse(s) => s.rollup(tier, rows).await,
        }
    }

    async fn append_metrics(&self, rows: &[MetricRow]) -> Result<()> {
        match self {
            Self::Memory(s) => s.append_metrics(rows).await,
            Self::ClickHouse(s) => s.append_metrics(rows).await,
        }
    }

    async fn read(&self, tier: Tier, req: &ReadRequest) -> Result<Vec<StackRow>> {
        match self {
            Self::Memory(s) => s.read(tier, req).await,
            Self::ClickHouse(s) => s.read(tier, req).await,
        }
    }

    async fn read_metrics(&self, req: &ReadRequest) -> Result<Vec<MetricRow>> {
        match self {
            Self::Memory(s) => s.read_metrics(req).await,
            Self::ClickHouse(s) => s.read_metrics(req).await,
        }
    }

    async fn evict(&self, tier: Tier, before: DateTime<Utc>) -> Result<u64> {
        match self {
            Self::Memory(s) => s.evict(tier, before).await,
            Self::ClickHouse(s) => s.evict(tier, before).await,
        }
    }

    async fn evict_metrics(&self, before: DateTime<Utc>) -> Result<u64> {
        match self {
            Self::Memory(s) => s.evict_metrics(before).await,
            Self::ClickHouse(s) => s.evict_metrics(before).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 17)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn test_tier_buckets() {
        let t = ts(10, 42);
        assert_eq!(Tier::Raw.bucket(t), t);
        assert_eq!(
            Tier::Minute.bucket(t),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 42, 0).unwrap()
        );
        assert_eq!(
            Tier::Hour.bucket(t),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            Tier::DayByHost.bucket(t),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_tier_index_is_dense() {
        for (i, tier) in Tier::ALL.iter().enumerate() {
            assert_eq!(tier.index(), i);
        }
    }

    #[test]
    fn test_read_request_filters_ignored_without_breakdown() {
        let mut req = ReadRequest::new(1, ts(0, 0), ts(23, 0));
        req.hostname = Some("h1".to_string());

        let key = RowKey {
            service_id: 1,
            timestamp: ts(5, 0),
            hash: 7,
            parent_hash: 0,
            hostname: Arc::from(""),
            container: Arc::from(""),
        };
        assert!(req.matches(Tier::Hour, &key));
        assert!(!req.matches(Tier::HourByHost, &key));
    }

    #[test]
    fn test_read_request_window_is_half_open() {
        let req = ReadRequest::new(1, ts(1, 0), ts(2, 0));
        let mut key = RowKey {
            service_id: 1,
            timestamp: ts(1, 0),
            hash: 7,
            parent_hash: 0,
            hostname: Arc::from("h"),
            container: Arc::from(""),
        };
        assert!(req.matches(Tier::Raw, &key));
        key.timestamp = ts(2, 0);
        assert!(!req.matches(Tier::Raw, &key));
        key.timestamp = ts(1, 30);
        key.service_id = 2;
        assert!(!req.matches(Tier::Raw, &key));
    }
}
