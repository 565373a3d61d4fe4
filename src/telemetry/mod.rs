//! Telemetry aggregation: on-demand bucketed metrics over the sample stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tdigest::TDigest;

use crate::db::{DbError, Node, NodeStatus, Sample, Store};

/// Fleet dashboard reports are served from cache for this long.
pub const DASHBOARD_CACHE_TTL: Duration = Duration::from_secs(30);

/// Dashboard window and bucket width.
pub const DASHBOARD_WINDOW_SECONDS: i64 = 300;
pub const DASHBOARD_BUCKET_SECONDS: i64 = 30;

/// Buckets at or above this size use a streaming digest for p99; smaller
/// buckets use exact nearest-rank.
const DIGEST_MIN_SAMPLES: usize = 100;

/// One fixed-width time bucket of fleet telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryBucket {
    /// Bucket start, aligned to the Unix epoch.
    pub timestamp: DateTime<Utc>,
    pub total_checks: i64,
    pub failed_checks: i64,
    pub avg_response_ms: f64,
    pub p99_response_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleCounts {
    pub success_count: i64,
    pub failure_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub at: DateTime<Utc>,
    pub response_time_ms: i64,
}

/// Per-node metrics over a sample window.
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetrics {
    pub uptime_percent: f64,
    pub average_response_time_ms: f64,
    /// Full-history counts, not limited to the window.
    pub counts: SampleCounts,
    /// Successful samples in the window, oldest first.
    pub response_time_history: Vec<HistoryPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Gauge {
    pub current: f64,
}

/// Per-user status histogram.
#[derive(Debug, Clone, Serialize)]
pub struct StatusOverview {
    pub total: i64,
    pub active: i64,
    pub down: i64,
    pub warning: i64,
    pub paused: i64,
    pub system_status: String,
}

/// The fleet dashboard report.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardReport {
    pub status: StatusOverview,
    pub buckets: Vec<TelemetryBucket>,
    pub response_time: Gauge,
    pub request_rate: Gauge,
    pub error_rate: Gauge,
    pub latency_p99: Gauge,
    pub window_seconds: i64,
    pub bucket_seconds: i64,
    pub generated_at: DateTime<Utc>,
}

/// A node joined with its window uptime, for list views.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    #[serde(flatten)]
    pub node: Node,
    pub uptime_percent: f64,
}

struct CachedReport {
    stored_at: Instant,
    report: DashboardReport,
}

/// Read-side aggregation over the node and sample stores.
pub struct Telemetry {
    store: Arc<Store>,
    dashboard_cache: Mutex<HashMap<String, CachedReport>>,
}

impl Telemetry {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            dashboard_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Metrics for one node over the window starting at `since`.
    pub fn metrics(&self, node_id: &str, since: DateTime<Utc>) -> Result<NodeMetrics, DbError> {
        let (total, successes) = self.store.aggregate_uptime(node_id, since)?;
        let (success_count, failure_count) = self.store.aggregate_counts(node_id)?;
        let average = self.store.aggregate_average(node_id, since)?;
        let history = self
            .store
            .success_history(node_id, since)?
            .into_iter()
            .map(|(at, response_time_ms)| HistoryPoint {
                at,
                response_time_ms,
            })
            .collect();

        Ok(NodeMetrics {
            uptime_percent: uptime_percent(total, successes),
            average_response_time_ms: average,
            counts: SampleCounts {
                success_count,
                failure_count,
            },
            response_time_history: history,
        })
    }

    pub fn recent_samples(&self, node_id: &str, limit: i64) -> Result<Vec<Sample>, DbError> {
        self.store.list_by_node(node_id, limit)
    }

    pub fn recent_errors(&self, node_id: &str, limit: i64) -> Result<Vec<Sample>, DbError> {
        self.store.list_errors_by_node(node_id, limit)
    }

    /// Fixed-width bucket summaries over a node set, ascending by bucket
    /// start. Empty buckets are omitted.
    pub fn buckets(
        &self,
        node_ids: &[String],
        since: DateTime<Utc>,
        bucket_seconds: i64,
    ) -> Result<Vec<TelemetryBucket>, DbError> {
        let width_ms = bucket_seconds * 1000;
        let grouped = self
            .store
            .aggregate_buckets(node_ids, since, Utc::now(), width_ms)?;

        Ok(grouped
            .into_iter()
            .map(|bucket| {
                let total = bucket.response_times_ms.len() as i64;
                let avg = bucket.response_times_ms.iter().sum::<f64>() / total as f64;
                TelemetryBucket {
                    timestamp: DateTime::from_timestamp_millis(bucket.bucket_start_ms)
                        .unwrap_or_else(Utc::now),
                    total_checks: total,
                    failed_checks: bucket.failed,
                    avg_response_ms: round1(avg),
                    p99_response_ms: round1(p99(&bucket.response_times_ms)),
                }
            })
            .collect())
    }

    /// Status histogram over the user's nodes.
    pub fn status_overview(&self, user_id: &str) -> Result<StatusOverview, DbError> {
        let nodes = self.store.list_by_user(user_id, None, None)?;
        Ok(overview_of(&nodes))
    }

    /// The fleet dashboard: 5-minute window, 30-second buckets, derived
    /// current gauges. Cached per user for 30 seconds; writes do not
    /// invalidate it.
    pub fn dashboard_overview(&self, user_id: &str) -> Result<DashboardReport, DbError> {
        {
            let cache = self.dashboard_cache.lock().unwrap();
            if let Some(cached) = cache.get(user_id) {
                if cached.stored_at.elapsed() < DASHBOARD_CACHE_TTL {
                    return Ok(cached.report.clone());
                }
            }
        }

        let nodes = self.store.list_by_user(user_id, None, None)?;
        let node_ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let since = Utc::now() - chrono::Duration::seconds(DASHBOARD_WINDOW_SECONDS);
        let buckets = self.buckets(&node_ids, since, DASHBOARD_BUCKET_SECONDS)?;

        let newest = buckets.last();
        let report = DashboardReport {
            status: overview_of(&nodes),
            response_time: Gauge {
                current: newest.map(|b| b.avg_response_ms).unwrap_or(0.0),
            },
            request_rate: Gauge {
                current: newest
                    .map(|b| b.total_checks as f64 * (60.0 / DASHBOARD_BUCKET_SECONDS as f64))
                    .unwrap_or(0.0),
            },
            error_rate: Gauge {
                current: newest
                    .map(|b| {
                        round2(b.failed_checks as f64 / b.total_checks as f64 * 100.0)
                    })
                    .unwrap_or(0.0),
            },
            latency_p99: Gauge {
                current: newest.map(|b| b.p99_response_ms).unwrap_or(0.0),
            },
            buckets,
            window_seconds: DASHBOARD_WINDOW_SECONDS,
            bucket_seconds: DASHBOARD_BUCKET_SECONDS,
            generated_at: Utc::now(),
        };

        let mut cache = self.dashboard_cache.lock().unwrap();
        cache.insert(
            user_id.to_string(),
            CachedReport {
                stored_at: Instant::now(),
                report: report.clone(),
            },
        );
        Ok(report)
    }

    /// Nodes of one user joined with their 24-hour uptime, in one pass.
    pub fn enriched_nodes(
        &self,
        user_id: &str,
        search: Option<&str>,
        status: Option<NodeStatus>,
    ) -> Result<Vec<NodeSummary>, DbError> {
        let nodes = self.store.list_by_user(user_id, search, status)?;
        let node_ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let since = Utc::now() - chrono::Duration::hours(24);
        let uptimes: HashMap<String, (i64, i64)> = self
            .store
            .aggregate_uptime_by_node(&node_ids, since)?
            .into_iter()
            .map(|(id, total, successes)| (id, (total, successes)))
            .collect();

        Ok(nodes
            .into_iter()
            .map(|node| {
                let (total, successes) = uptimes.get(&node.id).copied().unwrap_or((0, 0));
                NodeSummary {
                    uptime_percent: uptime_percent(total, successes),
                    node,
                }
            })
            .collect())
    }
}

/// `100 × successes / total` rounded to two decimals; vacuously 100.
fn uptime_percent(total: i64, successes: i64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    round2(successes as f64 / total as f64 * 100.0)
}

fn overview_of(nodes: &[Node]) -> StatusOverview {
    let mut overview = StatusOverview {
        total: nodes.len() as i64,
        active: 0,
        down: 0,
        warning: 0,
        paused: 0,
        system_status: String::new(),
    };
    for node in nodes {
        match node.status {
            NodeStatus::Active => overview.active += 1,
            NodeStatus::Down => overview.down += 1,
            NodeStatus::Warning => overview.warning += 1,
            NodeStatus::Paused => overview.paused += 1,
        }
    }
    overview.system_status = if overview.down > 0 {
        "degraded".to_string()
    } else {
        "operational".to_string()
    };
    overview
}

/// Approximate 99th percentile. Nearest-rank on small buckets, streaming
/// digest once a bucket is large enough for the approximation to hold.
fn p99(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.len() >= DIGEST_MIN_SAMPLES {
        let digest = TDigest::new_with_size(100).merge_unsorted(values.to_vec());
        return sanitize(digest.estimate_quantile(0.99));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((0.99 * sorted.len() as f64).ceil() as usize).max(1);
    sorted[rank - 1]
}

fn sanitize(f: f64) -> f64 {
    if f.is_nan() || f.is_infinite() {
        0.0
    } else {
        f
    }
}

fn round1(f: f64) -> f64 {
    (f * 10.0).round() / 10.0
}

fn round2(f: f64) -> f64 {
    (f * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_node, test_sample};
    use chrono::Duration as ChronoDuration;

    fn fixture() -> (Arc<Store>, Telemetry) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let telemetry = Telemetry::new(store.clone());
        (store, telemetry)
    }

    #[test]
    fn empty_window_reports_full_uptime() {
        let (store, telemetry) = fixture();
        let node = test_node("u1", "API");
        store.create_node(&node).unwrap();

        let metrics = telemetry
            .metrics(&node.id, Utc::now() - ChronoDuration::hours(24))
            .unwrap();
        assert_eq!(metrics.uptime_percent, 100.0);
        assert_eq!(metrics.average_response_time_ms, 0.0);
        assert!(metrics.response_time_history.is_empty());
    }

    #[test]
    fn metrics_cover_window_and_history() {
        let (store, telemetry) = fixture();
        let node = test_node("u1", "API");
        store.create_node(&node).unwrap();

        let now = Utc::now();
        for (offset, rt, success) in [(30, 10, true), (20, 20, true), (10, 90, false)] {
            let mut s = test_sample(&node.id, now - ChronoDuration::seconds(offset));
            s.response_time_ms = rt;
            s.success = success;
            store.append_sample(&s).unwrap();
        }

        let metrics = telemetry
            .metrics(&node.id, now - ChronoDuration::hours(1))
            .unwrap();
        assert_eq!(metrics.uptime_percent, 66.67);
        assert_eq!(metrics.average_response_time_ms, 15.0);
        assert_eq!(metrics.counts.success_count, 2);
        assert_eq!(metrics.counts.failure_count, 1);
        // Successes only, oldest first.
        assert_eq!(metrics.response_time_history.len(), 2);
        assert_eq!(metrics.response_time_history[0].response_time_ms, 10);
        assert_eq!(metrics.response_time_history[1].response_time_ms, 20);
    }

    /// Ten samples over one 30-second bucket, response times 10..=100,
    /// alternating success: nearest-rank p99 over 10 values is the maximum.
    #[test]
    fn bucket_fixture_matches_expected_aggregates() {
        let (store, telemetry) = fixture();
        let node = test_node("u1", "API");
        store.create_node(&node).unwrap();

        let width_ms = 30_000;
        let bucket_start = (Utc::now().timestamp_millis() / width_ms) * width_ms - width_ms;
        let base = DateTime::from_timestamp_millis(bucket_start).unwrap();
        for i in 0..10 {
            let mut s = test_sample(&node.id, base + ChronoDuration::seconds(3 * i));
            s.response_time_ms = 10 * (i + 1);
            s.success = i % 2 == 0;
            store.append_sample(&s).unwrap();
        }

        let buckets = telemetry
            .buckets(&[node.id.clone()], base, 30)
            .unwrap();
        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert_eq!(bucket.timestamp.timestamp_millis(), bucket_start);
        assert_eq!(bucket.total_checks, 10);
        assert_eq!(bucket.failed_checks, 5);
        assert_eq!(bucket.avg_response_ms, 55.0);
        assert_eq!(bucket.p99_response_ms, 100.0);
    }

    #[test]
    fn buckets_are_ascending_and_skip_empty_intervals() {
        let (store, telemetry) = fixture();
        let node = test_node("u1", "API");
        store.create_node(&node).unwrap();

        let width_ms = 30_000;
        let start = (Utc::now().timestamp_millis() / width_ms) * width_ms - 4 * width_ms;
        let base = DateTime::from_timestamp_millis(start).unwrap();
        // Two samples in the first bucket, none in the middle two, one in
        // the last.
        for offset in [0, 5, 95] {
            store
                .append_sample(&test_sample(&node.id, base + ChronoDuration::seconds(offset)))
                .unwrap();
        }

        let buckets = telemetry.buckets(&[node.id.clone()], base, 30).unwrap();
        assert_eq!(buckets.len(), 2);
        assert!(buckets[0].timestamp < buckets[1].timestamp);
        assert_eq!(buckets[0].total_checks, 2);
        assert_eq!(buckets[1].total_checks, 1);
    }

    #[test]
    fn status_overview_counts_and_degraded_flag() {
        let (store, telemetry) = fixture();
        let a = test_node("u1", "a");
        let b = test_node("u1", "b");
        let c = test_node("u1", "c");
        for n in [&a, &b, &c] {
            store.create_node(n).unwrap();
        }
        store.update_status(&b.id, NodeStatus::Paused).unwrap();

        let overview = telemetry.status_overview("u1").unwrap();
        assert_eq!(overview.total, 3);
        assert_eq!(overview.active, 2);
        assert_eq!(overview.paused, 1);
        assert_eq!(overview.system_status, "operational");

        store.update_status(&c.id, NodeStatus::Down).unwrap();
        let overview = telemetry.status_overview("u1").unwrap();
        assert_eq!(overview.down, 1);
        assert_eq!(overview.system_status, "degraded");
    }

    #[test]
    fn dashboard_derives_current_gauges_from_newest_bucket() {
        let (store, telemetry) = fixture();
        let node = test_node("u1", "API");
        store.create_node(&node).unwrap();

        let now = Utc::now();
        for i in 0..4 {
            let mut s = test_sample(&node.id, now - ChronoDuration::seconds(2 + i));
            s.response_time_ms = 40;
            s.success = i != 0;
            store.append_sample(&s).unwrap();
        }

        let report = telemetry.dashboard_overview("u1").unwrap();
        assert!(!report.buckets.is_empty());
        let newest = report.buckets.last().unwrap();
        assert_eq!(report.response_time.current, newest.avg_response_ms);
        assert_eq!(
            report.request_rate.current,
            newest.total_checks as f64 * 2.0
        );
        assert_eq!(report.latency_p99.current, newest.p99_response_ms);
        assert!(report.error_rate.current > 0.0);
    }

    #[test]
    fn dashboard_cache_serves_stale_reports_within_ttl() {
        let (store, telemetry) = fixture();
        let node = test_node("u1", "API");
        store.create_node(&node).unwrap();

        let first = telemetry.dashboard_overview("u1").unwrap();
        assert_eq!(first.status.total, 1);

        // A write after the report was cached is not reflected yet.
        store.create_node(&test_node("u1", "second")).unwrap();
        let second = telemetry.dashboard_overview("u1").unwrap();
        assert_eq!(second.status.total, 1);
        assert_eq!(second.generated_at, first.generated_at);
    }

    #[test]
    fn nearest_rank_p99_small_sets() {
        assert_eq!(p99(&[]), 0.0);
        assert_eq!(p99(&[42.0]), 42.0);
        let values: Vec<f64> = (1..=10).map(|i| i as f64 * 10.0).collect();
        assert_eq!(p99(&values), 100.0);
    }

    #[test]
    fn digest_p99_large_sets_is_near_the_tail() {
        let values: Vec<f64> = (1..=1000).map(|i| i as f64).collect();
        let estimate = p99(&values);
        assert!(estimate > 950.0 && estimate <= 1000.0, "p99 = {}", estimate);
    }

    #[test]
    fn enriched_nodes_attach_window_uptime() {
        let (store, telemetry) = fixture();
        let healthy = test_node("u1", "healthy");
        let flaky = test_node("u1", "flaky");
        store.create_node(&healthy).unwrap();
        store.create_node(&flaky).unwrap();

        let now = Utc::now();
        store
            .append_sample(&test_sample(&healthy.id, now - ChronoDuration::minutes(1)))
            .unwrap();
        for i in 0..4 {
            let mut s = test_sample(&flaky.id, now - ChronoDuration::minutes(i + 1));
            s.success = i % 2 == 0;
            store.append_sample(&s).unwrap();
        }

        let summaries = telemetry.enriched_nodes("u1", None, None).unwrap();
        assert_eq!(summaries.len(), 2);
        let by_name = |name: &str| {
            summaries
                .iter()
                .find(|s| s.node.name == name)
                .unwrap()
                .uptime_percent
        };
        assert_eq!(by_name("healthy"), 100.0);
        assert_eq!(by_name("flaky"), 50.0);
    }
}
