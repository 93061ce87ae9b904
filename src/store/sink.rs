//! Raw-row projections feeding the roll-up tiers.

use std::collections::HashMap;
use std::sync::Arc;

use super::{RowKey, StackRow, Tier};
use crate::stack::hash::ROOT_PARENT;

/// Maps raw rows into one roll-up tier's bucket and grouping key.
///
/// Projection is pure; the writer hands the projected batch to the store.
pub trait WriteSink: Send + Sync {
    fn tier(&self) -> Tier;

    /// Projects one raw row, or `None` if this tier does not keep it.
    fn project(&self, row: &StackRow) -> Option<StackRow>;

    /// Projects a batch and sums rows that land on the same key.
    fn project_batch(&self, rows: &[StackRow]) -> Vec<StackRow> {
        let mut summed: HashMap<RowKey, (Arc<str>, u64)> = HashMap::new();
        for row in rows {
            let Some(projected) = self.project(row) else {
                continue;
            };
            let entry = summed
                .entry(projected.key())
                .or_insert_with(|| (Arc::clone(&projected.name), 0));
            entry.1 = entry.1.saturating_add(projected.num_samples);
        }
        summed
            .into_iter()
            .map(|(key, (name, n))| key.into_row(name, n))
            .collect()
    }
}

fn rebucket(row: &StackRow, tier: Tier, keep_breakdown: bool) -> StackRow {
    let mut out = row.clone();
    out.timestamp = tier.bucket(row.timestamp);
    if !keep_breakdown {
        out.hostname = Arc::from("");
        out.container = Arc::from("");
    }
    out
}

/// Per-minute totals of root frames only.
#[derive(Debug, Default)]
pub struct MinuteRootSink;

impl WriteSink for MinuteRootSink {
    fn tier(&self) -> Tier {
        Tier::Minute
    }

    fn project(&self, row: &StackRow) -> Option<StackRow> {
        (row.parent_hash == ROOT_PARENT).then(|| rebucket(row, Tier::Minute, false))
    }
}

/// Hourly buckets, optionally keeping hostname and container.
#[derive(Debug)]
pub struct HourSink {
    pub by_host: bool,
}

impl WriteSink for HourSink {
    fn tier(&self) -> Tier {
        if self.by_host {
            Tier::HourByHost
        } else {
            Tier::Hour
        }
    }

    fn project(&self, row: &StackRow) -> Option<StackRow> {
        Some(rebucket(row, self.tier(), self.by_host))
    }
}

/// Daily buckets, optionally keeping hostname and container.
#[derive(Debug)]
pub struct DaySink {
    pub by_host: bool,
}

impl WriteSink for DaySink {
    fn tier(&self) -> Tier {
        if self.by_host {
            Tier::DayByHost
        } else {
            Tier::Day
        }
    }

    fn project(&self, row: &StackRow) -> Option<StackRow> {
        Some(rebucket(row, self.tier(), self.by_host))
    }
}

/// Every roll-up sink, in tier order.
pub fn default_sinks() -> Vec<Box<dyn WriteSink>> {
    vec![
        Box::new(MinuteRootSink),
        Box::new(HourSink { by_host: true }),
        Box::new(HourSink { by_host: false }),
        Box::new(DaySink { by_host: true }),
        Box::new(DaySink { by_host: false }),
    ]
}
