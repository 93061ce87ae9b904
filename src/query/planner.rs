//! Tier selection for a query window.
//!
//! Data younger than the raw retention is read from the raw tier, data
//! younger than the hourly retention from an hourly tier with the caller's
//! exact bounds, and anything older from a daily tier. Split points between
//! regimes are aligned up to the coarser tier's bucket so no bucket is read
//! from two tiers.

use chrono::{DateTime, TimeDelta, Utc};

use super::QueryError;
use crate::clock::{earlier_by, floor_day, floor_hour};
use crate::store::retention::RetentionPolicy;
use crate::store::Tier;

/// One tier read covering `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRead {
    pub tier: Tier,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

fn ceil_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floor = floor_hour(ts);
    if floor == ts {
        ts
    } else {
        floor + TimeDelta::hours(1)
    }
}

fn ceil_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floor = floor_day(ts);
    if floor == ts {
        ts
    } else {
        floor + TimeDelta::days(1)
    }
}

/// Plans the reads for `[start, end)`, oldest first.
///
/// `filtered` selects the by-host variants of the hourly and daily tiers.
pub fn plan(
    now: DateTime<Utc>,
    retention: &RetentionPolicy,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    filtered: bool,
) -> Result<Vec<PlannedRead>, QueryError> {
    if start >= end {
        return Err(QueryError::InvalidWindow { start, end });
    }

    let hour_split = ceil_hour(earlier_by(now, retention.raw));
    let day_split = ceil_day(earlier_by(now, retention.hourly)).min(hour_split);

    let (hourly, daily) = if filtered {
        (Tier::HourByHost, Tier::DayByHost)
    } else {
        (Tier::Hour, Tier::Day)
    };

    let mut reads = Vec::with_capacity(3);

    if start < day_split {
        reads.push(PlannedRead {
            tier: daily,
            start: floor_day(start),
            end: end.min(day_split),
        });
    }

    let hourly_start = start.max(day_split);
    let hourly_end = end.min(hour_split);
    if hourly_start < hourly_end {
        reads.push(PlannedRead {
            tier: hourly,
            start: hourly_start,
            end: hourly_end,
        });
    }

    let raw_start = start.max(hour_split);
    if raw_start < end {
        reads.push(PlannedRead {
            tier: Tier::Raw,
            start: raw_start,
            end,
        });
    }

    Ok(reads)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    fn ts(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            raw: Duration::from_secs(24 * 3600),
            minute: Duration::from_secs(7 * 24 * 3600),
            hourly: Duration::from_secs(7 * 24 * 3600),
            daily: Duration::from_secs(365 * 24 * 3600),
            metrics: Duration::from_secs(7 * 24 * 3600),
        }
    }

    #[test]
    fn test_recent_window_uses_raw_exactly() {
        let now = ts(20, 12, 30);
        let reads = plan(now, &policy(), ts(20, 10, 7), ts(20, 11, 3), false).expect("plan");
        assert_eq!(
            reads,
            vec![PlannedRead {
                tier: Tier::Raw,
                start: ts(20, 10, 7),
                end: ts(20, 11, 3),
            }]
        );
    }

    #[test]
    fn test_hourly_window_keeps_exact_bounds() {
        let now = ts(20, 12, 30);
        let reads = plan(now, &policy(), ts(17, 9, 0), ts(17, 10, 0), false).expect("plan");
        assert_eq!(
            reads,
            vec![PlannedRead {
                tier: Tier::Hour,
                start: ts(17, 9, 0),
                end: ts(17, 10, 0),
            }]
        );
    }

    #[test]
    fn test_adjacent_hours_route_to_distinct_reads() {
        let now = ts(20, 12, 30);
        let first = plan(now, &policy(), ts(17, 9, 0), ts(17, 10, 0), false).expect("plan");
        let second = plan(now, &policy(), ts(17, 10, 0), ts(17, 11, 0), false).expect("plan");
        assert_ne!(first, second);
        assert_eq!(first[0].end, second[0].start);
    }

    #[test]
    fn test_filter_selects_by_host_tiers() {
        let now = ts(20, 12, 30);
        let reads = plan(now, &policy(), ts(1, 0, 0), ts(17, 10, 0), true).expect("plan");
        let tiers: Vec<_> = reads.iter().map(|r| r.tier).collect();
        assert_eq!(tiers, vec![Tier::DayByHost, Tier::HourByHost]);
    }

    #[test]
    fn test_old_window_rounds_start_to_day() {
        let now = ts(20, 12, 30);
        let reads = plan(now, &policy(), ts(2, 15, 45), ts(3, 6, 0), false).expect("plan");
        assert_eq!(
            reads,
            vec![PlannedRead {
                tier: Tier::Day,
                start: ts(2, 0, 0),
                end: ts(3, 6, 0),
            }]
        );
    }

    #[test]
    fn test_spanning_window_split_contiguously() {
        let now = ts(20, 12, 30);
        let start = ts(10, 5, 0);
        let end = ts(20, 12, 0);
        let reads = plan(now, &policy(), start, end, false).expect("plan");

        // hourly regime begins at the day after now - 7d, raw at the hour
        // after now - 24h.
        assert_eq!(
            reads,
            vec![
                PlannedRead {
                    tier: Tier::Day,
                    start: ts(10, 0, 0),
                    end: ts(14, 0, 0),
                },
                PlannedRead {
                    tier: Tier::Hour,
                    start: ts(14, 0, 0),
                    end: ts(19, 13, 0),
                },
                PlannedRead {
                    tier: Tier::Raw,
                    start: ts(19, 13, 0),
                    end,
                },
            ]
        );
        for pair in reads.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_invalid_windows_rejected() {
        let now = ts(20, 12, 30);
        for (start, end) in [(ts(20, 10, 0), ts(20, 10, 0)), (ts(20, 11, 0), ts(20, 10, 0))] {
            let err = plan(now, &policy(), start, end, false).expect_err("invalid");
            assert!(matches!(err, QueryError::InvalidWindow { .. }));
        }
    }

    #[test]
    fn test_huge_retention_routes_everything_to_raw() {
        let now = ts(20, 12, 30);
        let mut retention = policy();
        retention.raw = Duration::from_secs(300_000 * 365 * 24 * 3600);
        retention.hourly = Duration::MAX;

        let reads = plan(now, &retention, ts(1, 0, 0), ts(20, 12, 0), true).expect("plan");
        assert_eq!(
            reads,
            vec![PlannedRead {
                tier: Tier::Raw,
                start: ts(1, 0, 0),
                end: ts(20, 12, 0),
            }]
        );
    }

    #[test]
    fn test_split_clamped_when_hourly_retention_short() {
        let now = ts(20, 12, 30);
        let mut retention = policy();
        retention.hourly = Duration::from_secs(30 * 3600);

        let reads = plan(now, &retention, ts(18, 0, 0), ts(20, 12, 0), false).expect("plan");
        for pair in reads.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(reads.last().map(|r| r.tier), Some(Tier::Raw));
    }
}
