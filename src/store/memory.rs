use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::{MetricRow, ReadRequest, RowKey, StackRow, Tier, TieredStore};

/// Summed value stored under a [`RowKey`].
#[derive(Debug, Clone)]
struct Cell {
    name: Arc<str>,
    num_samples: u64,
}

/// In-process tiered store.
///
/// Each tier is a concurrent map keyed on the full grouping key, so writes
/// from concurrent flushes sum without a global lock.
pub struct MemoryStore {
    tiers: Vec<DashMap<RowKey, Cell>>,
    metrics: Mutex<Vec<MetricRow>>,
    unavailable: RwLock<HashSet<Tier>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tiers: Tier::ALL.iter().map(|_| DashMap::new()).collect(),
            metrics: Mutex::new(Vec::new()),
            unavailable: RwLock::new(HashSet::new()),
        }
    }

    /// Makes every read and write against `tier` fail until restored.
    pub fn set_unavailable(&self, tier: Tier, unavailable: bool) {
        let mut set = self.unavailable.write();
        if unavailable {
            set.insert(tier);
        } else {
            set.remove(&tier);
        }
    }

    /// Number of distinct keys currently held by `tier`.
    pub fn len(&self, tier: Tier) -> usize {
        self.tiers[tier.index()].len()
    }

    pub fn is_empty(&self, tier: Tier) -> bool {
        self.tiers[tier.index()].is_empty()
    }

    /// Sum of all sample counts held by `tier` for one service.
    pub fn total_samples(&self, tier: Tier, service_id: u64) -> u64 {
        self.tiers[tier.index()]
            .iter()
            .filter(|e| e.key().service_id == service_id)
            .map(|e| e.value().num_samples)
            .sum()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.lock().len()
    }

    fn check(&self, tier: Tier) -> Result<()> {
        if self.unavailable.read().contains(&tier) {
            bail!("tier {tier} is unavailable");
        }
        Ok(())
    }

    fn insert(&self, tier: Tier, rows: &[StackRow]) -> Result<()> {
        self.check(tier)?;
        let table = &self.tiers[tier.index()];
        for row in rows {
            let mut cell = table.entry(row.key()).or_insert_with(|| Cell {
                name: Arc::clone(&row.name),
                num_samples: 0,
            });
            cell.num_samples = cell.num_samples.saturating_add(row.num_samples);
        }
        Ok(())
    }
}

impl TieredStore for MemoryStore {
    async fn append_raw(&self, rows: &[StackRow]) -> Result<()> {
        self.insert(Tier::Raw, rows)
    }

    async fn rollup(&self, tier: Tier, rows: &[StackRow]) -> Result<()> {
        if tier == Tier::Raw {
            bail!("raw rows must be written with append_raw");
        }
        self.insert(tier, rows)
    }

    async fn append_metrics(&self, rows: &[MetricRow]) -> Result<()> {
        self.metrics.lock().extend_from_slice(rows);
        Ok(())
    }

    async fn read(&self, tier: Tier, req: &ReadRequest) -> Result<Vec<StackRow>> {
        self.check(tier)?;
        let rows = self.tiers[tier.index()]
            .iter()
            .filter(|e| req.matches(tier, e.key()))
            .map(|e| {
                e.key()
                    .clone()
                    .into_row(Arc::clone(&e.value().name), e.value().num_samples)
            })
            .collect();
        Ok(rows)
    }

    async fn read_metrics(&self, req: &ReadRequest) -> Result<Vec<MetricRow>> {
        let rows = self
            .metrics
            .lock()
            .iter()
            .filter(|m| {
                m.service_id == req.service_id
                    && m.timestamp >= req.start
                    && m.timestamp < req.end
                    && req.hostname.as_deref().map_or(true, |h| m.hostname == h)
            })
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn evict(&self, tier: Tier, before: DateTime<Utc>) -> Result<u64> {
        self.check(tier)?;
        let table = &self.tiers[tier.index()];
        let start = table.len();
        table.retain(|key, _| key.timestamp >= before);
        Ok(start.saturating_sub(table.len()) as u64)
    }

    async fn evict_metrics(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut metrics = self.metrics.lock();
        let start = metrics.len();
        metrics.retain(|m| m.timestamp >= before);
        Ok((start - metrics.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn row(hash: u64, host: &str, at: DateTime<Utc>, n: u64) -> StackRow {
        StackRow {
            service_id: 1,
            timestamp: at,
            hash,
            parent_hash: 0,
            name: Arc::from("main"),
            hostname: Arc::from(host),
            container: Arc::from(""),
            num_samples: n,
        }
    }

    #[tokio::test]
    async fn test_same_key_rows_are_summed() {
        let store = MemoryStore::new();
        store
            .append_raw(&[row(1, "h1", base(), 3), row(1, "h1", base(), 4)])
            .await
            .expect("append");
        store
            .append_raw(&[row(1, "h1", base(), 5)])
            .await
            .expect("append");

        let rows = store
            .read(
                Tier::Raw,
                &ReadRequest::new(1, base(), base() + TimeDelta::hours(1)),
            )
            .await
            .expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].num_samples, 12);
    }

    #[tokio::test]
    async fn test_read_filters_by_host() {
        let store = MemoryStore::new();
        store
            .append_raw(&[row(1, "h1", base(), 3), row(1, "h2", base(), 4)])
            .await
            .expect("append");

        let mut req = ReadRequest::new(1, base(), base() + TimeDelta::hours(1));
        req.hostname = Some("h2".to_string());
        let rows = store.read(Tier::Raw, &req).await.expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].num_samples, 4);
    }

    #[tokio::test]
    async fn test_unavailable_tier_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(Tier::Hour, true);

        let req = ReadRequest::new(1, base(), base() + TimeDelta::hours(1));
        assert!(store.read(Tier::Hour, &req).await.is_err());
        assert!(store.rollup(Tier::Hour, &[]).await.is_err());
        assert!(store.read(Tier::Raw, &req).await.is_ok());

        store.set_unavailable(Tier::Hour, false);
        assert!(store.read(Tier::Hour, &req).await.is_ok());
    }

    #[tokio::test]
    async fn test_rollup_rejects_raw() {
        let store = MemoryStore::new();
        assert!(store.rollup(Tier::Raw, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_evict_removes_old_buckets_only() {
        let store = MemoryStore::new();
        let old = base() - TimeDelta::days(2);
        store
            .append_raw(&[row(1, "h1", old, 3), row(2, "h1", base(), 4)])
            .await
            .expect("append");
        store
            .rollup(Tier::Hour, &[row(1, "", Tier::Hour.bucket(old), 3)])
            .await
            .expect("rollup");

        let removed = store
            .evict(Tier::Raw, base() - TimeDelta::days(1))
            .await
            .expect("evict");
        assert_eq!(removed, 1);
        assert_eq!(store.len(Tier::Raw), 1);
        // Coarser tiers are untouched by raw eviction.
        assert_eq!(store.total_samples(Tier::Hour, 1), 3);
    }

    #[tokio::test]
    async fn test_metrics_roundtrip_and_eviction() {
        let store = MemoryStore::new();
        let metric = |at: DateTime<Utc>| MetricRow {
            service_id: 1,
            timestamp: at,
            hostname: "h1".to_string(),
            cpu_avg: 10.0,
            mem_avg: 20.0,
            html_path: None,
        };
        store
            .append_metrics(&[metric(base() - TimeDelta::days(30)), metric(base())])
            .await
            .expect("append");

        let req = ReadRequest::new(1, base() - TimeDelta::hours(1), base() + TimeDelta::hours(1));
        assert_eq!(store.read_metrics(&req).await.expect("read").len(), 1);

        let removed = store
            .evict_metrics(base() - TimeDelta::days(1))
            .await
            .expect("evict");
        assert_eq!(removed, 1);
        assert_eq!(store.metric_count(), 1);
    }
}
