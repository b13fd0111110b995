// Copyright 2025 msgrpc Authors
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

use crate::snapshot::{MethodMetrics, MetricsSnapshot, TransportMetrics};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const NUM_HISTOGRAM_BINS: usize = 64;

/// Method name under which calls beyond `max_methods` are aggregated.
pub const OVERFLOW_METHOD: &str = "<other>";

/// Size limits for the per-method table.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum number of distinct method names tracked individually.
    pub max_methods: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { max_methods: 1000 }
    }
}

/// Which budget a timeout exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Receive,
    Send,
    Execute,
}

/// Logarithmic latency histogram.
///
/// Each power of two of microseconds gets one bin, which keeps recording
/// O(1) and lock-free. Percentiles are reported as the upper bound of the
/// bin that contains them.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn bin(latency_us: u64) -> usize {
        if latency_us == 0 {
            0
        } else {
            (latency_us.ilog2() as usize + 1).min(NUM_HISTOGRAM_BINS - 1)
        }
    }

    fn bin_upper_bound(bin: usize) -> u64 {
        if bin == 0 {
            0
        } else {
            1u64.checked_shl(bin as u32).map_or(u64::MAX, |v| v - 1)
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::bin(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(&self, total: u64, percentile: u64) -> u64 {
        let target = (total * percentile).div_ceil(100).max(1);
        let mut cumulative = 0;
        for (bin, count) in self.bins.iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target {
                return Self::bin_upper_bound(bin);
            }
        }
        Self::bin_upper_bound(NUM_HISTOGRAM_BINS - 1)
    }

    /// Returns `(avg, p50, p95, p99)` in microseconds.
    fn summary(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (
            avg,
            self.percentile(total, 50),
            self.percentile(total, 95),
            self.percentile(total, 99),
        )
    }
}

#[derive(Debug)]
struct MethodStats {
    call_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    latencies: LatencyHistogram,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
        }
    }

    fn snapshot(&self) -> MethodMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.summary();
        MethodMetrics {
            call_count: self.call_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

#[derive(Debug, Default)]
struct TransportCounters {
    accepted_sessions: AtomicU64,
    active_sessions: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    notifications: AtomicU64,
    protocol_errors: AtomicU64,
    quota_errors: AtomicU64,
    receive_timeouts: AtomicU64,
    send_timeouts: AtomicU64,
    execution_timeouts: AtomicU64,
    connection_resets: AtomicU64,
}

/// Thread-safe metrics registry.
///
/// Counters are relaxed atomics; snapshots are eventually consistent. The
/// per-method table sits behind an `RwLock` that is only written when a new
/// method name is first seen.
///
/// # Example
///
/// ```rust
/// use msgrpc_metrics::MetricsRegistry;
/// use std::time::Instant;
///
/// let registry = MetricsRegistry::new();
/// registry.record_call("echo", Instant::now(), true);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_requests, 1);
/// assert_eq!(snapshot.methods["echo"].success_count, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    config: MetricsConfig,
    started: Instant,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    transport: TransportCounters,
    methods: RwLock<HashMap<String, Arc<MethodStats>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            transport: TransportCounters::default(),
            methods: RwLock::new(HashMap::new()),
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn method_stats(&self, method: &str) -> Arc<MethodStats> {
        if let Some(stats) = self.methods.read().get(method) {
            return stats.clone();
        }
        let mut methods = self.methods.write();
        if let Some(stats) = methods.get(method) {
            return stats.clone();
        }
        let key = if methods.len() >= self.config.max_methods {
            tracing::debug!(method, "method table full, aggregating under {}", OVERFLOW_METHOD);
            OVERFLOW_METHOD
        } else {
            method
        };
        methods
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(MethodStats::new()))
            .clone()
    }

    /// Records a completed request dispatch.
    pub fn record_call(&self, method: &str, start_time: Instant, success: bool) {
        let latency_us = start_time.elapsed().as_micros() as u64;
        let stats = self.method_stats(method);

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        stats.call_count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
            stats.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            stats.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        stats.latencies.record(latency_us);
    }

    pub fn record_session_opened(&self) {
        self.transport.accepted_sessions.fetch_add(1, Ordering::Relaxed);
        self.transport.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        // saturate so an unmatched close cannot wrap the gauge
        let _ = self.transport.active_sessions.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| n.checked_sub(1),
        );
    }

    pub fn record_bytes_received(&self, bytes: usize) {
        self.transport.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self) {
        self.transport.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self, bytes: usize) {
        self.transport.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.transport.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_notification(&self) {
        self.transport.notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a framing failure; `quota` marks quota violations.
    pub fn record_protocol_error(&self, quota: bool) {
        if quota {
            self.transport.quota_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transport.protocol_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self, kind: TimeoutKind) {
        let counter = match kind {
            TimeoutKind::Receive => &self.transport.receive_timeouts,
            TimeoutKind::Send => &self.transport.send_timeouts,
            TimeoutKind::Execute => &self.transport.execution_timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.transport.connection_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.transport.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let t = &self.transport;
        let transport = TransportMetrics {
            accepted_sessions: t.accepted_sessions.load(Ordering::Relaxed),
            active_sessions: t.active_sessions.load(Ordering::Relaxed),
            frames_received: t.frames_received.load(Ordering::Relaxed),
            frames_sent: t.frames_sent.load(Ordering::Relaxed),
            bytes_received: t.bytes_received.load(Ordering::Relaxed),
            bytes_sent: t.bytes_sent.load(Ordering::Relaxed),
            notifications: t.notifications.load(Ordering::Relaxed),
            protocol_errors: t.protocol_errors.load(Ordering::Relaxed),
            quota_errors: t.quota_errors.load(Ordering::Relaxed),
            receive_timeouts: t.receive_timeouts.load(Ordering::Relaxed),
            send_timeouts: t.send_timeouts.load(Ordering::Relaxed),
            execution_timeouts: t.execution_timeouts.load(Ordering::Relaxed),
            connection_resets: t.connection_resets.load(Ordering::Relaxed),
        };
        let methods = self
            .methods
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            transport,
            methods,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_call_counts() {
        let registry = MetricsRegistry::new();
        let start = Instant::now();
        registry.record_call("add", start, true);
        registry.record_call("add", start, false);
        registry.record_call("sub", start, true);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.methods["add"].call_count, 2);
        assert_eq!(snapshot.methods["add"].failure_count, 1);
        assert_eq!(snapshot.methods["sub"].success_count, 1);
    }

    #[test]
    fn test_method_table_is_capped() {
        let registry = MetricsRegistry::with_config(MetricsConfig { max_methods: 2 });
        for name in ["a", "b", "c", "d"] {
            registry.record_call(name, Instant::now(), true);
        }
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.methods.len(), 3);
        assert_eq!(snapshot.methods[OVERFLOW_METHOD].call_count, 2);
    }

    #[test]
    fn test_session_gauge_saturates() {
        let registry = MetricsRegistry::new();
        registry.record_session_opened();
        registry.record_session_closed();
        registry.record_session_closed();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.transport.active_sessions, 0);
        assert_eq!(snapshot.transport.accepted_sessions, 1);
    }

    #[test]
    fn test_transport_counters() {
        let registry = MetricsRegistry::new();
        registry.record_bytes_received(10);
        registry.record_frame_received();
        registry.record_frame_sent(7);
        registry.record_protocol_error(true);
        registry.record_protocol_error(false);
        registry.record_timeout(TimeoutKind::Execute);
        registry.record_reset();

        let t = registry.snapshot().transport;
        assert_eq!((t.bytes_received, t.frames_received), (10, 1));
        assert_eq!((t.frames_sent, t.bytes_sent), (1, 7));
        assert_eq!((t.quota_errors, t.protocol_errors), (1, 1));
        assert_eq!(t.execution_timeouts, 1);
        assert_eq!(t.connection_resets, 1);
    }

    #[test]
    fn test_histogram_percentiles() {
        let histogram = LatencyHistogram::new();
        for _ in 0..90 {
            histogram.record(100);
        }
        for _ in 0..10 {
            histogram.record(10_000);
        }
        let (avg, p50, p95, p99) = histogram.summary();
        assert_eq!(avg, (90 * 100 + 10 * 10_000) / 100);
        assert!(p50 >= 100 && p50 < 256);
        assert!(p95 >= 10_000 && p99 >= 10_000);
        assert!(p99 < 16_384);
    }

    #[test]
    fn test_latency_is_recorded() {
        let registry = MetricsRegistry::new();
        let start = Instant::now() - Duration::from_millis(5);
        registry.record_call("slow", start, true);
        assert!(registry.snapshot().methods["slow"].avg_latency_us >= 5_000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = MetricsRegistry::new();
        registry.record_call("echo", Instant::now(), true);
        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json["methods"]["echo"]["call_count"], 1);
        assert_eq!(json["transport"]["active_sessions"], 0);
    }
}
