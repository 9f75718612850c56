//! Usage metering: in-memory hourly buckets with a durable rollup.
//!
//! Buckets accumulate under `(consumer, server, tool, period)` where the
//! period is the UTC hour. When the hour rolls over (or a flush runs) the
//! buckets are upserted into the store's meter table and cleared. Reading a
//! summary flushes first, so callers always see in-memory increments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::MeteringConfig;
use crate::storage::{GatewayStore, MeterRow, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    consumer_id: String,
    server_id: String,
    tool: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    calls: u64,
    errors: u64,
    total_latency_ms: u64,
}

struct MeterInner {
    current_period: String,
    buckets: HashMap<BucketKey, Bucket>,
}

/// Aggregated usage over all persisted periods plus the live buckets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    /// Total calls.
    pub total_calls: u64,
    /// Total errored calls.
    pub total_errors: u64,
    /// Average latency, truncating integer division (0 with no calls).
    pub avg_latency_ms: u64,
    /// Calls per server.
    pub by_server: HashMap<String, u64>,
    /// Calls per tool.
    pub by_tool: HashMap<String, u64>,
}

/// Per-caller usage meter.
pub struct Meter {
    enabled: bool,
    store: Arc<dyn GatewayStore>,
    inner: Mutex<MeterInner>,
    flush_interval: Duration,
}

/// Current UTC hour as `YYYY-MM-DDTHH`.
pub fn current_period_key() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H").to_string()
}

impl Meter {
    /// Create a meter over a store.
    pub fn new(store: Arc<dyn GatewayStore>, config: &MeteringConfig) -> Self {
        Self {
            enabled: config.enabled,
            store,
            inner: Mutex::new(MeterInner {
                current_period: current_period_key(),
                buckets: HashMap::new(),
            }),
            flush_interval: Duration::from_secs(config.flush_interval_secs),
        }
    }

    /// Record one call. A no-op when metering is disabled.
    pub fn record(&self, consumer_id: &str, server_id: &str, tool: &str, latency_ms: u64, is_error: bool) {
        self.record_in_period(&current_period_key(), consumer_id, server_id, tool, latency_ms, is_error);
    }

    fn record_in_period(
        &self,
        period: &str,
        consumer_id: &str,
        server_id: &str,
        tool: &str,
        latency_ms: u64,
        is_error: bool,
    ) {
        if !self.enabled {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.current_period != period {
            Self::flush_locked(&self.store, &mut inner);
            inner.current_period = period.to_string();
        }
        let bucket = inner
            .buckets
            .entry(BucketKey {
                consumer_id: consumer_id.to_string(),
                server_id: server_id.to_string(),
                tool: tool.to_string(),
            })
            .or_default();
        bucket.calls += 1;
        if is_error {
            bucket.errors += 1;
        }
        bucket.total_latency_ms += latency_ms;
    }

    /// Flush live buckets into the durable rollup and clear them.
    pub fn flush(&self) {
        if !self.enabled {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        Self::flush_locked(&self.store, &mut inner);
    }

    fn flush_locked(store: &Arc<dyn GatewayStore>, inner: &mut MeterInner) {
        if inner.buckets.is_empty() {
            return;
        }
        let period = inner.current_period.clone();
        for (key, bucket) in inner.buckets.drain() {
            let row = MeterRow {
                consumer_id: key.consumer_id,
                server_id: key.server_id,
                tool: key.tool,
                period_key: period.clone(),
                calls: bucket.calls,
                errors: bucket.errors,
                total_latency_ms: bucket.total_latency_ms,
            };
            if let Err(e) = store.upsert_meter(&row) {
                warn!(error = %e, "meter rollup upsert failed");
            }
        }
        debug!(period, "meter buckets flushed");
    }

    /// Summarize usage, optionally restricted to one consumer.
    ///
    /// Flushes first so in-memory increments are visible.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the rollup cannot be read.
    pub fn summary(&self, consumer_id: Option<&str>) -> Result<UsageSummary, StoreError> {
        if !self.enabled {
            return Ok(UsageSummary::default());
        }
        self.flush();

        let rows = self.store.query_meter(consumer_id)?;
        let mut summary = UsageSummary::default();
        let mut total_latency: u64 = 0;
        for row in rows {
            summary.total_calls += row.calls;
            summary.total_errors += row.errors;
            total_latency += row.total_latency_ms;
            *summary.by_server.entry(row.server_id).or_insert(0) += row.calls;
            *summary.by_tool.entry(row.tool).or_insert(0) += row.calls;
        }
        if summary.total_calls > 0 {
            summary.avg_latency_ms = total_latency / summary.total_calls;
        }
        Ok(summary)
    }

    /// Spawn the periodic flush, stopped by the cancellation token.
    pub fn spawn_flush_task(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        if !self.enabled {
            return;
        }
        let meter = Arc::clone(self);
        let interval = meter.flush_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => meter.flush(),
                    _ = shutdown.cancelled() => {
                        meter.flush();
                        debug!("meter flush task shutting down");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::storage::SqliteStore;

    fn meter(enabled: bool) -> Meter {
        let store = Arc::new(SqliteStore::open(Path::new(":memory:")).unwrap());
        Meter::new(
            store,
            &MeteringConfig {
                enabled,
                flush_interval_secs: 60,
            },
        )
    }

    #[test]
    fn test_summary_reflects_unflushed_records() {
        let m = meter(true);
        m.record("acme", "s1", "get_x", 10, false);
        m.record("acme", "s1", "get_x", 30, true);
        m.record("acme", "s2", "put_y", 20, false);

        let summary = m.summary(None).unwrap();
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.avg_latency_ms, 20);
        assert_eq!(summary.by_server.get("s1"), Some(&2));
        assert_eq!(summary.by_server.get("s2"), Some(&1));
        assert_eq!(summary.by_tool.get("get_x"), Some(&2));
    }

    #[test]
    fn test_average_truncates_integer_division() {
        let m = meter(true);
        m.record("acme", "s1", "t", 10, false);
        m.record("acme", "s1", "t", 15, false);
        // (10 + 15) / 2 = 12.5, truncated.
        assert_eq!(m.summary(None).unwrap().avg_latency_ms, 12);
    }

    #[test]
    fn test_summary_filters_by_consumer() {
        let m = meter(true);
        m.record("acme", "s1", "t", 10, false);
        m.record("globex", "s1", "t", 10, false);
        m.record("globex", "s1", "t", 10, false);

        assert_eq!(m.summary(Some("acme")).unwrap().total_calls, 1);
        assert_eq!(m.summary(Some("globex")).unwrap().total_calls, 2);
        assert_eq!(m.summary(None).unwrap().total_calls, 3);
    }

    #[test]
    fn test_period_rollover_flushes_previous_buckets() {
        let m = meter(true);
        m.record_in_period("2026-08-02T09", "acme", "s1", "t", 10, false);
        // A record in the next hour flushes the 09 bucket to the rollup.
        m.record_in_period("2026-08-02T10", "acme", "s1", "t", 20, false);

        let rows = m.store.query_meter(Some("acme")).unwrap();
        assert!(rows.iter().any(|r| r.period_key == "2026-08-02T09" && r.calls == 1));

        // Both periods are visible in the summary.
        assert_eq!(m.summary(None).unwrap().total_calls, 2);
    }

    #[test]
    fn test_interleaving_sums_match_sequential_baseline() {
        // Associativity: any interleaving of records produces the same
        // per-bucket sums as the sequential baseline.
        let m = meter(true);
        let calls = [
            ("acme", "s1", "t1", 5, false),
            ("acme", "s2", "t1", 7, true),
            ("acme", "s1", "t1", 9, false),
            ("acme", "s1", "t2", 11, false),
        ];
        for (c, s, t, l, e) in calls {
            m.record(c, s, t, l, e);
        }
        let forward = m.summary(None).unwrap();

        let m2 = meter(true);
        for (c, s, t, l, e) in calls.iter().rev() {
            m2.record(c, s, t, *l, *e);
        }
        let backward = m2.summary(None).unwrap();

        assert_eq!(forward.total_calls, backward.total_calls);
        assert_eq!(forward.total_errors, backward.total_errors);
        assert_eq!(forward.avg_latency_ms, backward.avg_latency_ms);
        assert_eq!(forward.by_server, backward.by_server);
        assert_eq!(forward.by_tool, backward.by_tool);
    }

    #[test]
    fn test_disabled_meter_noops() {
        let m = meter(false);
        m.record("acme", "s1", "t", 10, false);
        let summary = m.summary(None).unwrap();
        assert_eq!(summary.total_calls, 0);
        assert_eq!(summary.avg_latency_ms, 0);
        assert!(summary.by_server.is_empty());
    }

    #[test]
    fn test_flush_is_idempotent_on_empty_buckets() {
        let m = meter(true);
        m.flush();
        m.record("acme", "s1", "t", 10, false);
        m.flush();
        m.flush();
        assert_eq!(m.summary(None).unwrap().total_calls, 1);
    }

    #[test]
    fn test_period_key_shape() {
        let key = current_period_key();
        // YYYY-MM-DDTHH
        assert_eq!(key.len(), 13);
        assert_eq!(&key[10..11], "T");
    }
}
