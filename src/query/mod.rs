//! Read path: plan a window across tiers, merge, and rebuild call trees.

pub mod flamegraph;
pub mod http;
pub mod planner;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use self::flamegraph::FlameGraph;
use self::planner::{plan, PlannedRead};
use crate::clock::SharedClock;
use crate::export::health::HealthMetrics;
use crate::store::retention::RetentionPolicy;
use crate::store::{ReadRequest, StackRow, Store, Tier, TieredStore};

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid window: start {start} is not before end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("{source_name} unavailable: {message}")]
    TierUnavailable {
        source_name: &'static str,
        message: String,
    },
}

impl QueryError {
    fn unavailable(source_name: &'static str, e: anyhow::Error) -> Self {
        Self::TierUnavailable {
            source_name,
            message: format!("{e:#}"),
        }
    }
}

/// Samples in one minute bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimelinePoint {
    pub timestamp: DateTime<Utc>,
    pub samples: u64,
}

/// Resource usage aggregated over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub samples: usize,
    pub cpu_avg: f64,
    pub cpu_max: f64,
    pub mem_avg: f64,
    pub mem_max: f64,
}

/// Rows merged across the planned tier reads.
#[derive(Debug, Clone)]
pub struct MergedRows {
    pub reads: Vec<PlannedRead>,
    pub rows: Vec<StackRow>,
}

pub struct QueryService {
    store: Arc<Store>,
    retention: RetentionPolicy,
    clock: SharedClock,
    health: Arc<HealthMetrics>,
}

impl QueryService {
    pub fn new(
        store: Arc<Store>,
        retention: RetentionPolicy,
        clock: SharedClock,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            store,
            retention,
            clock,
            health,
        }
    }

    /// Current time as seen by the planner.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Reads every planned sub-range and sums rows sharing
    /// `(hash, parent_hash)`. Breakdown columns collapse to the request's
    /// filters.
    pub async fn rows(&self, req: &ReadRequest) -> Result<MergedRows, QueryError> {
        let _timer = self
            .health
            .query_duration
            .with_label_values(&["rows"])
            .start_timer();
        self.merged(req).await
    }

    pub async fn flamegraph(&self, req: &ReadRequest) -> Result<FlameGraph, QueryError> {
        let _timer = self
            .health
            .query_duration
            .with_label_values(&["flamegraph"])
            .start_timer();
        let merged = self.merged(req).await?;
        Ok(self.build(req, &merged.rows))
    }

    pub async fn collapsed(&self, req: &ReadRequest) -> Result<Vec<String>, QueryError> {
        let _timer = self
            .health
            .query_duration
            .with_label_values(&["collapsed"])
            .start_timer();
        let merged = self.merged(req).await?;
        Ok(self.build(req, &merged.rows).collapsed())
    }

    /// Samples per minute from the root-only minute tier.
    pub async fn timeline(&self, req: &ReadRequest) -> Result<Vec<TimelinePoint>, QueryError> {
        let _timer = self
            .health
            .query_duration
            .with_label_values(&["timeline"])
            .start_timer();
        check_window(req)?;

        let rows = self
            .store
            .read(Tier::Minute, req)
            .await
            .map_err(|e| QueryError::unavailable(Tier::Minute.as_str(), e))?;

        let mut buckets: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
        for row in rows {
            let samples = buckets.entry(row.timestamp).or_insert(0);
            *samples = samples.saturating_add(row.num_samples);
        }

        Ok(buckets
            .into_iter()
            .map(|(timestamp, samples)| TimelinePoint { timestamp, samples })
            .collect())
    }

    pub async fn metrics_summary(&self, req: &ReadRequest) -> Result<MetricsSummary, QueryError> {
        let _timer = self
            .health
            .query_duration
            .with_label_values(&["metrics"])
            .start_timer();
        check_window(req)?;

        let rows = self
            .store
            .read_metrics(req)
            .await
            .map_err(|e| QueryError::unavailable("metrics", e))?;

        if rows.is_empty() {
            return Ok(MetricsSummary::default());
        }

        let n = rows.len() as f64;
        let mut summary = MetricsSummary {
            samples: rows.len(),
            ..Default::default()
        };
        for row in &rows {
            summary.cpu_avg += row.cpu_avg / n;
            summary.mem_avg += row.mem_avg / n;
            summary.cpu_max = summary.cpu_max.max(row.cpu_avg);
            summary.mem_max = summary.mem_max.max(row.mem_avg);
        }
        Ok(summary)
    }

    fn build(&self, req: &ReadRequest, rows: &[StackRow]) -> FlameGraph {
        let graph = FlameGraph::build(rows);
        if graph.violations() > 0 {
            warn!(
                service_id = req.service_id,
                violations = graph.violations(),
                "frames lighter than their children"
            );
            self.health
                .parent_weight_violations
                .inc_by(graph.violations() as f64);
        }
        graph
    }

    async fn merged(&self, req: &ReadRequest) -> Result<MergedRows, QueryError> {
        let reads = plan(
            self.clock.now(),
            &self.retention,
            req.start,
            req.end,
            req.has_filter(),
        )?;

        let mut merged: HashMap<(u64, u64), StackRow> = HashMap::new();
        for read in &reads {
            let sub = ReadRequest {
                start: read.start,
                end: read.end,
                ..req.clone()
            };
            let rows = self
                .store
                .read(read.tier, &sub)
                .await
                .map_err(|e| QueryError::unavailable(read.tier.as_str(), e))?;
            debug!(tier = %read.tier, rows = rows.len(), "tier read");

            for row in rows {
                let n = row.num_samples;
                merged
                    .entry((row.hash, row.parent_hash))
                    .and_modify(|m| m.num_samples = m.num_samples.saturating_add(n))
                    .or_insert_with(|| StackRow {
                        timestamp: req.start,
                        hostname: Arc::from(req.hostname.as_deref().unwrap_or("")),
                        container: Arc::from(req.container.as_deref().unwrap_or("")),
                        ..row
                    });
            }
        }

        let mut rows: Vec<StackRow> = merged.into_values().collect();
        rows.sort_by(|a, b| (a.hash, a.parent_hash).cmp(&(b.hash, b.parent_hash)));

        Ok(MergedRows { reads, rows })
    }
}

fn check_window(req: &ReadRequest) -> Result<(), QueryError> {
    if req.start >= req.end {
        return Err(QueryError::InvalidWindow {
            start: req.start,
            end: req.end,
        });
    }
    Ok(())
}
