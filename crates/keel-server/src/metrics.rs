// Copyright 2025 Keel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-worker call metrics, served by the `_metrics` and `_info` methods.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub use keel_common::config::WorkerRole;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Upper bounds of the latency buckets, in microseconds. The last bucket is
/// open-ended.
const BUCKET_BOUNDS_US: [u64; 12] = [
    100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 500_000, 1_000_000,
];
const NUM_BUCKETS: usize = BUCKET_BOUNDS_US.len() + 1;

/// Most distinct method names tracked. Calls beyond it still count in the
/// totals.
const MAX_METHODS: usize = 1000;

/// Reply of `_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub role: WorkerRole,
    pub slot: usize,
    pub pid: u32,
    pub version: String,
    pub uptime_ms: u64,
}

/// Statistics for one method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Reply of `_metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub active_connections: u64,
    pub uptime_ms: u64,
    pub methods: HashMap<String, MethodMetrics>,
}

/// Bucketed latency counts.
#[derive(Debug)]
struct LatencyHistogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    total_latency: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        let bucket = BUCKET_BOUNDS_US
            .iter()
            .position(|bound| latency_us <= *bound)
            .unwrap_or(NUM_BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Upper bound of the bucket holding the given percentile.
    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let target = (total * percentile).div_ceil(100).max(1);
        let mut seen = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return BUCKET_BOUNDS_US
                    .get(index)
                    .copied()
                    .unwrap_or(BUCKET_BOUNDS_US[BUCKET_BOUNDS_US.len() - 1]);
            }
        }
        BUCKET_BOUNDS_US[BUCKET_BOUNDS_US.len() - 1]
    }

    fn average(&self) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        self.total_latency.load(Ordering::Relaxed) / total
    }
}

#[derive(Debug)]
struct MethodStats {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    latency: LatencyHistogram,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    fn snapshot(&self) -> MethodMetrics {
        MethodMetrics {
            call_count: self.calls.load(Ordering::Relaxed),
            success_count: self.successes.load(Ordering::Relaxed),
            failure_count: self.failures.load(Ordering::Relaxed),
            avg_latency_us: self.latency.average(),
            p50_latency_us: self.latency.percentile(50),
            p95_latency_us: self.latency.percentile(95),
            p99_latency_us: self.latency.percentile(99),
        }
    }
}

/// Collects call statistics for one worker.
///
/// Counters are relaxed atomics; a snapshot is a consistent-enough view for
/// monitoring, not an exact point in time.
///
/// # Example
///
/// ```rust
/// use keel_server::metrics::{MetricsCollector, WorkerRole};
/// use std::time::Instant;
///
/// let collector = MetricsCollector::new(WorkerRole::Server, 0);
/// let start = Instant::now();
/// collector.record_call("status", start, true);
/// assert_eq!(collector.snapshot().total_requests, 1);
/// ```
pub struct MetricsCollector {
    role: WorkerRole,
    slot: usize,
    started: Instant,
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
    connections: AtomicU64,
    methods: RwLock<HashMap<String, Arc<MethodStats>>>,
}

impl MetricsCollector {
    pub fn new(role: WorkerRole, slot: usize) -> Self {
        Self {
            role,
            slot,
            started: Instant::now(),
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            methods: RwLock::new(HashMap::new()),
        }
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Records one finished call.
    pub fn record_call(&self, method: &str, start: Instant, success: bool) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let Some(stats) = self.stats(method) else {
            return;
        };
        stats.calls.fetch_add(1, Ordering::Relaxed);
        if success {
            stats.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        stats.latency.record(latency_us);
    }

    /// Records a call refused before it reached a method.
    pub fn record_rejected(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturate so a stray close never wraps the gauge
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn stats(&self, method: &str) -> Option<Arc<MethodStats>> {
        if let Some(stats) = self.methods.read().get(method) {
            return Some(stats.clone());
        }
        let mut methods = self.methods.write();
        if methods.len() >= MAX_METHODS && !methods.contains_key(method) {
            return None;
        }
        Some(
            methods
                .entry(method.to_string())
                .or_insert_with(|| Arc::new(MethodStats::new()))
                .clone(),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let methods = self
            .methods
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        MetricsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.successes.load(Ordering::Relaxed),
            failed_requests: self.failures.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            active_connections: self.connections.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            methods,
        }
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            role: self.role,
            slot: self.slot,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms: self.uptime_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_counters() {
        let collector = MetricsCollector::new(WorkerRole::Server, 1);
        let start = Instant::now();
        collector.record_call("signIn", start, true);
        collector.record_call("signIn", start, false);
        collector.record_call("status", start, true);
        collector.record_rejected();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 2);
        assert_eq!(snapshot.rejected_requests, 1);
        assert_eq!(snapshot.methods["signIn"].call_count, 2);
        assert_eq!(snapshot.methods["signIn"].failure_count, 1);
        assert_eq!(snapshot.methods["status"].success_count, 1);
    }

    #[test]
    fn test_connection_gauge_saturates() {
        let collector = MetricsCollector::new(WorkerRole::Server, 0);
        collector.connection_opened();
        collector.connection_closed();
        collector.connection_closed();
        assert_eq!(collector.snapshot().active_connections, 0);
    }

    #[test]
    fn test_percentiles() {
        let histogram = LatencyHistogram::new();
        for _ in 0..90 {
            histogram.record(80);
        }
        for _ in 0..10 {
            histogram.record(40_000);
        }
        assert_eq!(histogram.percentile(50), 100);
        assert_eq!(histogram.percentile(95), 50_000);
        assert_eq!(histogram.percentile(99), 50_000);
        assert_eq!(histogram.average(), (90 * 80 + 10 * 40_000) / 100);
    }

    #[test]
    fn test_empty_histogram() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.percentile(99), 0);
        assert_eq!(histogram.average(), 0);
    }

    #[test]
    fn test_method_cap() {
        let collector = MetricsCollector::new(WorkerRole::Background, 0);
        let start = Instant::now() - Duration::from_millis(1);
        for i in 0..MAX_METHODS + 5 {
            collector.record_call(&format!("m{}", i), start, true);
        }
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.methods.len(), MAX_METHODS);
        assert_eq!(snapshot.total_requests, (MAX_METHODS + 5) as u64);
    }
}
