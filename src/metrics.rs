//! Per-endpoint request metrics.
//!
//! Two views of the same stream of completed requests: cumulative
//! per-endpoint aggregates since startup (or the last reset), and a rolling
//! ledger of recent samples for windowed throughput and error-rate numbers.
//! The ledger is pruned on every touch and hard-capped, so it cannot grow
//! without bound under a traffic spike.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Thresholds and retention for the aggregator.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// How far back the rolling ledger reaches.
    pub ledger_window: Duration,
    /// Requests slower than this are logged the moment they complete.
    pub slow_request_threshold: Duration,
    /// Hard cap on ledger entries; crossing it is logged as a memory spike.
    pub ledger_cap: usize,
    /// Error rate above which health reports degraded / critical.
    pub degraded_error_rate: f64,
    pub critical_error_rate: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ledger_window: Duration::from_secs(300),
            slow_request_threshold: Duration::from_secs(3),
            ledger_cap: 100_000,
            degraded_error_rate: 0.05,
            critical_error_rate: 0.25,
        }
    }
}

/// Cumulative statistics for one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub count: u64,
    pub total_time_ms: u64,
    pub max_time_ms: u64,
    pub min_time_ms: u64,
    pub error_count: u64,
    pub status_histogram: BTreeMap<u16, u64>,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            count: 0,
            total_time_ms: 0,
            max_time_ms: 0,
            min_time_ms: u64::MAX,
            error_count: 0,
            status_histogram: BTreeMap::new(),
        }
    }

    fn observe(&mut self, status: u16, duration_ms: u64) {
        self.count += 1;
        self.total_time_ms += duration_ms;
        self.max_time_ms = self.max_time_ms.max(duration_ms);
        self.min_time_ms = self.min_time_ms.min(duration_ms);
        if status >= 400 {
            self.error_count += 1;
        }
        *self.status_histogram.entry(status).or_insert(0) += 1;
    }

    pub fn avg_time_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.count as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    completed_at_ms: i64,
    duration_ms: u64,
    status: u16,
}

/// Aggregate report across all endpoints.
#[derive(Debug, Serialize)]
pub struct MetricsReport {
    pub total_requests: u64,
    pub total_errors: u64,
    pub overall_error_rate: f64,
    pub endpoints: BTreeMap<String, EndpointReport>,
}

#[derive(Debug, Serialize)]
pub struct EndpointReport {
    pub count: u64,
    pub avg_time_ms: f64,
    pub max_time_ms: u64,
    pub min_time_ms: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub status_histogram: BTreeMap<u16, u64>,
}

/// Trailing-window numbers for the dashboard.
#[derive(Debug, Serialize)]
pub struct RealTimeMetrics {
    pub window_secs: u64,
    pub requests: u64,
    pub requests_per_second: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Degraded,
    Critical,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub requests_in_window: u64,
}

struct Inner {
    endpoints: HashMap<String, EndpointStats>,
    ledger: VecDeque<LedgerEntry>,
}

/// Collects completed-request samples and answers report queries.
pub struct MetricsAggregator {
    config: MetricsConfig,
    inner: Mutex<Inner>,
}

impl MetricsAggregator {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                endpoints: HashMap::new(),
                ledger: VecDeque::new(),
            }),
        }
    }

    /// Record one completed request.
    ///
    /// Threshold breaches are logged here, synchronously, with no sampling:
    /// an operator should see the first slow request, not one in a hundred.
    pub fn record(
        &self,
        method: &str,
        endpoint: &str,
        status: u16,
        duration: Duration,
        now_ms: i64,
    ) {
        let duration_ms = duration.as_millis() as u64;

        if duration >= self.config.slow_request_threshold {
            warn!(
                method = method,
                endpoint = endpoint,
                duration_ms = duration_ms,
                "slow request"
            );
        }

        let key = format!("{} {}", method, endpoint);
        let mut inner = self.inner.lock();
        inner
            .endpoints
            .entry(key)
            .or_insert_with(EndpointStats::new)
            .observe(status, duration_ms);

        inner.ledger.push_back(LedgerEntry {
            completed_at_ms: now_ms,
            duration_ms,
            status,
        });
        self.prune_locked(&mut inner, now_ms);

        if inner.ledger.len() >= self.config.ledger_cap {
            warn!(
                entries = inner.ledger.len(),
                cap = self.config.ledger_cap,
                "metrics ledger at capacity, dropping oldest samples"
            );
            while inner.ledger.len() >= self.config.ledger_cap {
                inner.ledger.pop_front();
            }
        }
    }

    /// Cumulative aggregates since startup or the last reset.
    pub fn report(&self) -> MetricsReport {
        let inner = self.inner.lock();
        let mut total_requests = 0;
        let mut total_errors = 0;
        let mut endpoints = BTreeMap::new();

        for (key, stats) in &inner.endpoints {
            total_requests += stats.count;
            total_errors += stats.error_count;
            endpoints.insert(
                key.clone(),
                EndpointReport {
                    count: stats.count,
                    avg_time_ms: stats.avg_time_ms(),
                    max_time_ms: stats.max_time_ms,
                    min_time_ms: if stats.count == 0 { 0 } else { stats.min_time_ms },
                    error_count: stats.error_count,
                    error_rate: stats.error_rate(),
                    status_histogram: stats.status_histogram.clone(),
                },
            );
        }

        MetricsReport {
            total_requests,
            total_errors,
            overall_error_rate: if total_requests == 0 {
                0.0
            } else {
                total_errors as f64 / total_requests as f64
            },
            endpoints,
        }
    }

    /// Throughput, error rate, and latency over the trailing `window`.
    pub fn real_time(&self, window: Duration, now_ms: i64) -> RealTimeMetrics {
        let window = window.min(self.config.ledger_window);
        let cutoff = now_ms - window.as_millis() as i64;

        let mut inner = self.inner.lock();
        self.prune_locked(&mut inner, now_ms);

        let mut requests = 0u64;
        let mut errors = 0u64;
        let mut total_latency = 0u64;
        for entry in inner.ledger.iter().filter(|e| e.completed_at_ms > cutoff) {
            requests += 1;
            total_latency += entry.duration_ms;
            if entry.status >= 400 {
                errors += 1;
            }
        }

        RealTimeMetrics {
            window_secs: window.as_secs(),
            requests,
            requests_per_second: requests as f64 / window.as_secs_f64(),
            error_rate: if requests == 0 {
                0.0
            } else {
                errors as f64 / requests as f64
            },
            avg_latency_ms: if requests == 0 {
                0.0
            } else {
                total_latency as f64 / requests as f64
            },
        }
    }

    /// Health classification from the trailing-window error rate.
    pub fn health(&self, now_ms: i64) -> HealthStatus {
        let real_time = self.real_time(self.config.ledger_window, now_ms);
        let status = if real_time.error_rate >= self.config.critical_error_rate {
            HealthState::Critical
        } else if real_time.error_rate >= self.config.degraded_error_rate {
            HealthState::Degraded
        } else {
            HealthState::Ok
        };
        HealthStatus {
            status,
            error_rate: real_time.error_rate,
            avg_latency_ms: real_time.avg_latency_ms,
            requests_in_window: real_time.requests,
        }
    }

    /// Discard all aggregates and ledger entries.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.endpoints.clear();
        inner.ledger.clear();
    }

    /// Drop ledger entries older than the retention window. Also driven by
    /// the periodic janitor so an idle process does not pin stale samples.
    pub fn prune(&self, now_ms: i64) {
        let mut inner = self.inner.lock();
        self.prune_locked(&mut inner, now_ms);
    }

    fn prune_locked(&self, inner: &mut Inner, now_ms: i64) {
        let cutoff = now_ms - self.config.ledger_window.as_millis() as i64;
        while inner
            .ledger
            .front()
            .map(|e| e.completed_at_ms <= cutoff)
            .unwrap_or(false)
        {
            inner.ledger.pop_front();
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> MetricsAggregator {
        MetricsAggregator::default()
    }

    #[test]
    fn test_avg_max_min_are_exact() {
        let metrics = aggregator();
        for (i, ms) in [120u64, 80, 250, 30].iter().enumerate() {
            metrics.record(
                "GET",
                "/api/jobs",
                200,
                Duration::from_millis(*ms),
                1_000 + i as i64,
            );
        }

        let report = metrics.report();
        let ep = &report.endpoints["GET /api/jobs"];
        assert_eq!(ep.count, 4);
        assert_eq!(ep.avg_time_ms, 120.0);
        assert_eq!(ep.max_time_ms, 250);
        assert_eq!(ep.min_time_ms, 30);
    }

    #[test]
    fn test_error_rate_counts_4xx_and_5xx() {
        let metrics = aggregator();
        for status in [200, 201, 404, 500] {
            metrics.record("POST", "/api/auth/login", status, Duration::from_millis(10), 1_000);
        }

        let report = metrics.report();
        let ep = &report.endpoints["POST /api/auth/login"];
        assert_eq!(ep.error_count, 2);
        assert_eq!(ep.error_rate, 0.5);
        assert_eq!(ep.status_histogram[&200], 1);
        assert_eq!(ep.status_histogram[&500], 1);
    }

    #[test]
    fn test_real_time_window_excludes_old_samples() {
        let metrics = aggregator();
        metrics.record("GET", "/api/x", 200, Duration::from_millis(10), 0);
        metrics.record("GET", "/api/x", 500, Duration::from_millis(20), 290_000);
        metrics.record("GET", "/api/x", 200, Duration::from_millis(30), 295_000);

        // A 10s trailing window at t=300s sees only the last two samples.
        let rt = metrics.real_time(Duration::from_secs(10), 300_000);
        assert_eq!(rt.requests, 2);
        assert_eq!(rt.error_rate, 0.5);
        assert_eq!(rt.avg_latency_ms, 25.0);
        assert_eq!(rt.requests_per_second, 0.2);
    }

    #[test]
    fn test_ledger_pruned_past_retention() {
        let metrics = aggregator();
        metrics.record("GET", "/api/x", 200, Duration::from_millis(10), 0);
        // Five minutes later the first sample has aged out of the ledger
        // but still shows in the cumulative report.
        metrics.record("GET", "/api/x", 200, Duration::from_millis(10), 301_000);

        let rt = metrics.real_time(Duration::from_secs(300), 301_000);
        assert_eq!(rt.requests, 1);
        assert_eq!(metrics.report().total_requests, 2);
    }

    #[test]
    fn test_health_thresholds() {
        let metrics = aggregator();
        assert_eq!(metrics.health(1_000).status, HealthState::Ok);

        for _ in 0..3 {
            metrics.record("GET", "/api/x", 200, Duration::from_millis(10), 1_000);
        }
        metrics.record("GET", "/api/x", 500, Duration::from_millis(10), 1_000);
        // 25% errors crosses the critical threshold.
        assert_eq!(metrics.health(2_000).status, HealthState::Critical);

        metrics.reset();
        assert_eq!(metrics.health(3_000).status, HealthState::Ok);
    }

    #[test]
    fn test_reset_clears_everything() {
        let metrics = aggregator();
        metrics.record("GET", "/api/x", 200, Duration::from_millis(10), 1_000);
        metrics.reset();

        let report = metrics.report();
        assert_eq!(report.total_requests, 0);
        assert!(report.endpoints.is_empty());
    }

    #[test]
    fn test_ledger_cap_bounds_memory() {
        let metrics = MetricsAggregator::new(MetricsConfig {
            ledger_cap: 10,
            ..MetricsConfig::default()
        });
        for i in 0..50 {
            metrics.record("GET", "/api/x", 200, Duration::from_millis(1), i);
        }
        let rt = metrics.real_time(Duration::from_secs(300), 50);
        assert!(rt.requests < 10);
    }
}
