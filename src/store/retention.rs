use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Store, Tier, TieredStore};
use crate::clock::{earlier_by, SharedClock};
use crate::config::RetentionConfig;
use crate::export::health::HealthMetrics;

/// Retention window per tier.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub raw: Duration,
    pub minute: Duration,
    pub hourly: Duration,
    pub daily: Duration,
    pub metrics: Duration,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(cfg: &RetentionConfig) -> Self {
        Self {
            raw: cfg.raw,
            minute: cfg.minute,
            hourly: cfg.hourly,
            daily: cfg.daily,
            metrics: cfg.metrics,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&RetentionConfig::default())
    }
}

impl RetentionPolicy {
    pub fn window(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Raw => self.raw,
            Tier::Minute => self.minute,
            Tier::HourByHost | Tier::Hour => self.hourly,
            Tier::DayByHost | Tier::Day => self.daily,
        }
    }

    /// Oldest bucket start still retained in `tier`. Buckets are evicted
    /// whole, so the cutoff is aligned to the tier's bucket.
    pub fn cutoff(&self, tier: Tier, now: DateTime<Utc>) -> DateTime<Utc> {
        tier.bucket(earlier_by(now, self.window(tier)))
    }
}

/// Evicts expired buckets from every tier and the metric stream.
///
/// A failing tier is logged and skipped; the other tiers are still swept.
/// Returns the total number of rows removed.
pub async fn evict_expired(
    store: &Store,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    health: &HealthMetrics,
) -> Result<u64> {
    let mut total = 0u64;

    for tier in Tier::ALL {
        let cutoff = policy.cutoff(tier, now);
        match store.evict(tier, cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    debug!(tier = %tier, removed, cutoff = %cutoff, "evicted expired rows");
                }
                health
                    .rows_evicted
                    .with_label_values(&[tier.as_str()])
                    .inc_by(removed as f64);
                total += removed;
            }
            Err(e) => {
                warn!(tier = %tier, error = %e, "eviction failed");
            }
        }
    }

    let cutoff = earlier_by(now, policy.metrics);
    match store.evict_metrics(cutoff).await {
        Ok(removed) => {
            health
                .rows_evicted
                .with_label_values(&["metrics"])
                .inc_by(removed as f64);
            total += removed;
        }
        Err(e) => warn!(error = %e, "metric eviction failed"),
    }

    Ok(total)
}

/// Runs [`evict_expired`] every `interval` until `ctx` is cancelled.
pub fn spawn_evictor(
    store: Arc<Store>,
    policy: RetentionPolicy,
    clock: SharedClock,
    interval: Duration,
    health: Arc<HealthMetrics>,
    ctx: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval = ?interval, "retention evictor started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("retention evictor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match evict_expired(&store, &policy, clock.now(), &health).await {
                        Ok(removed) if removed > 0 => info!(removed, "retention sweep completed"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    }
                }
            }
        }
    })
}
