//! Per-test metrics engine.
//!
//! Ingests `TaskResult`s from many concurrent producers and serves immutable
//! point-in-time snapshots. Latency percentiles come from an HDR histogram
//! spanning 1 ns to 60 s at 3 significant digits; throughput comes from a
//! lazily-rotated ring of per-second counts. Memory is bounded regardless of
//! test duration: the histogram is fixed-size, and the error histogram is
//! capped at a top-K with surplus collapsed into an `other` bucket.
//!
//! `record` never panics: any internal failure degrades to incrementing the
//! `metrics_dropped` counter surfaced in snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::task::TaskResult;

/// Histogram bounds: 1 ns to 60 s, 3 significant digits.
const LATENCY_MAX_NANOS: u64 = 60_000_000_000;

/// Sliding window for throughput calculation.
const TPS_WINDOW_SECONDS: usize = 5;

/// Error-message prefixes tracked before collapsing into `other`.
const ERROR_HISTOGRAM_CAP: usize = 256;

/// Error messages are keyed by their first 100 chars.
const ERROR_PREFIX_CHARS: usize = 100;

// ── Task gauges ───────────────────────────────────────────────────────────────

/// Instantaneous in-flight/pending gauges shared between the executor (which
/// writes them) and the engine (which reads them into snapshots). Cheap to
/// clone.
#[derive(Clone, Default)]
pub struct TaskGauges {
    inner: Arc<GaugeInner>,
}

#[derive(Default)]
struct GaugeInner {
    active: AtomicU64,
    pending: AtomicU64,
}

impl TaskGauges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, value: u64) {
        self.inner.active.store(value, Ordering::Relaxed);
    }

    pub fn set_pending(&self, value: u64) {
        self.inner.pending.store(value, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> u64 {
        self.inner.pending.load(Ordering::Relaxed)
    }
}

// ── Snapshot types ────────────────────────────────────────────────────────────

/// Latency percentiles in milliseconds. Monotone by construction: all values
/// are quantiles of a single histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    #[serde(rename = "p99.9")]
    pub p99_9: f64,
}

/// Immutable point-in-time view of a test's metrics.
///
/// Fields are mutually coherent modulo in-flight increments; the snapshot
/// path takes no locks that block producers beyond the brief histogram read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Unix epoch millis of engine creation (or last reset).
    pub start_time_ms: u64,
    pub elapsed_seconds: f64,
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub current_tps: f64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub percentiles: Percentiles,
    pub error_histogram: HashMap<String, u64>,
    pub active_tasks: u64,
    pub pending_tasks: u64,
    pub metrics_dropped: u64,
}

// ── TPS ring ──────────────────────────────────────────────────────────────────

/// Ring of per-second counts, rotated lazily on each record. Stale seconds
/// are discarded as the ring advances; the window is only as fresh as the
/// last write or read.
struct TpsRing {
    counts: [u64; TPS_WINDOW_SECONDS],
    last_sec: u64,
}

impl TpsRing {
    fn new() -> Self {
        Self {
            counts: [0; TPS_WINDOW_SECONDS],
            last_sec: 0,
        }
    }

    fn rotate(&mut self, now_sec: u64) {
        if now_sec <= self.last_sec {
            return;
        }
        let advanced = (now_sec - self.last_sec).min(TPS_WINDOW_SECONDS as u64);
        for i in 1..=advanced {
            let idx = ((self.last_sec + i) % TPS_WINDOW_SECONDS as u64) as usize;
            self.counts[idx] = 0;
        }
        self.last_sec = now_sec;
    }

    fn increment(&mut self, now_sec: u64) {
        self.rotate(now_sec);
        self.counts[(now_sec % TPS_WINDOW_SECONDS as u64) as usize] += 1;
    }

    fn rate(&mut self, now_sec: u64) -> f64 {
        self.rotate(now_sec);
        let sum: u64 = self.counts.iter().sum();
        sum as f64 / TPS_WINDOW_SECONDS as f64
    }

    fn clear(&mut self) {
        self.counts = [0; TPS_WINDOW_SECONDS];
    }
}

// ── Error histogram ───────────────────────────────────────────────────────────

/// Error-message prefix → count, bounded to a top-K with an `other` bucket.
struct ErrorHistogram {
    counts: HashMap<String, u64>,
}

impl ErrorHistogram {
    fn new() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }

    fn record(&mut self, message: &str) {
        if message.is_empty() {
            return;
        }
        let key = Self::prefix_key(message);
        if let Some(count) = self.counts.get_mut(&key) {
            *count += 1;
        } else if self.counts.len() < ERROR_HISTOGRAM_CAP {
            self.counts.insert(key, 1);
        } else {
            *self.counts.entry("other".to_string()).or_insert(0) += 1;
        }
    }

    fn prefix_key(message: &str) -> String {
        let mut chars = message.char_indices();
        match chars.nth(ERROR_PREFIX_CHARS) {
            Some((byte_idx, _)) => format!("{}…", &message[..byte_idx]),
            None => message.to_string(),
        }
    }

    fn snapshot(&self) -> HashMap<String, u64> {
        self.counts.clone()
    }

    fn clear(&mut self) {
        self.counts.clear();
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Thread-safe metrics ingestion for one test. Cheap to clone; all clones
/// share state.
#[derive(Clone)]
pub struct MetricsEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    start: Instant,
    start_time_ms: AtomicU64,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    latency_sum_nanos: AtomicU64,
    dropped: AtomicU64,
    histogram: Mutex<Histogram<u64>>,
    tps: Mutex<TpsRing>,
    errors: Mutex<ErrorHistogram>,
    gauges: TaskGauges,
}

impl MetricsEngine {
    pub fn new() -> Self {
        Self::with_gauges(TaskGauges::new())
    }

    /// Engine wired to externally-updated in-flight gauges (the executor's).
    pub fn with_gauges(gauges: TaskGauges) -> Self {
        let histogram = Histogram::new_with_bounds(1, LATENCY_MAX_NANOS, 3)
            .unwrap_or_else(|_| Histogram::new(3).unwrap());

        Self {
            inner: Arc::new(EngineInner {
                start: Instant::now(),
                start_time_ms: AtomicU64::new(epoch_millis()),
                total: AtomicU64::new(0),
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                latency_sum_nanos: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                histogram: Mutex::new(histogram),
                tps: Mutex::new(TpsRing::new()),
                errors: Mutex::new(ErrorHistogram::new()),
                gauges,
            }),
        }
    }

    /// The gauge handle shared with the executor.
    pub fn gauges(&self) -> TaskGauges {
        self.inner.gauges.clone()
    }

    /// Ingest one result. O(1) amortized, safe under many concurrent
    /// producers, never panics.
    pub fn record(&self, result: &TaskResult) {
        let inner = &self.inner;
        inner.total.fetch_add(1, Ordering::Relaxed);
        if result.success {
            inner.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.failed.fetch_add(1, Ordering::Relaxed);
        }

        let nanos = result.latency.as_nanos().min(u64::MAX as u128) as u64;
        inner.latency_sum_nanos.fetch_add(nanos, Ordering::Relaxed);

        let clamped = nanos.clamp(1, LATENCY_MAX_NANOS);
        match inner.histogram.lock() {
            Ok(mut hist) => {
                if hist.record(clamped).is_err() {
                    inner.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let now_sec = inner.start.elapsed().as_secs();
        match inner.tps.lock() {
            Ok(mut ring) => ring.increment(now_sec),
            Err(_) => {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        if !result.success {
            if let Some(message) = result.error_message.as_deref() {
                if let Ok(mut errors) = inner.errors.lock() {
                    errors.record(message);
                }
            }
        }
    }

    /// Current throughput over the sliding window.
    pub fn current_tps(&self) -> f64 {
        let now_sec = self.inner.start.elapsed().as_secs();
        match self.inner.tps.lock() {
            Ok(mut ring) => ring.rate(now_sec),
            Err(_) => 0.0,
        }
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> u64 {
        self.inner.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Build an immutable snapshot of the current state.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;

        let total = inner.total.load(Ordering::Relaxed);
        let successful = inner.successful.load(Ordering::Relaxed);
        let failed = inner.failed.load(Ordering::Relaxed);
        let latency_sum = inner.latency_sum_nanos.load(Ordering::Relaxed);

        let percentiles = match inner.histogram.lock() {
            Ok(hist) => {
                if hist.is_empty() {
                    Percentiles::default()
                } else {
                    Percentiles {
                        p50: hist.value_at_quantile(0.50) as f64 / 1e6,
                        p75: hist.value_at_quantile(0.75) as f64 / 1e6,
                        p90: hist.value_at_quantile(0.90) as f64 / 1e6,
                        p95: hist.value_at_quantile(0.95) as f64 / 1e6,
                        p99: hist.value_at_quantile(0.99) as f64 / 1e6,
                        p99_9: hist.value_at_quantile(0.999) as f64 / 1e6,
                    }
                }
            }
            Err(_) => Percentiles::default(),
        };

        let error_histogram = match inner.errors.lock() {
            Ok(errors) => errors.snapshot(),
            Err(_) => HashMap::new(),
        };

        let avg_latency_ms = if total > 0 {
            latency_sum as f64 / total as f64 / 1e6
        } else {
            0.0
        };
        let success_rate = if total > 0 {
            successful as f64 / total as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            start_time_ms: inner.start_time_ms.load(Ordering::Relaxed),
            elapsed_seconds: inner.start.elapsed().as_secs_f64(),
            total,
            successful,
            failed,
            current_tps: self.current_tps(),
            avg_latency_ms,
            success_rate,
            percentiles,
            error_histogram,
            active_tasks: inner.gauges.active(),
            pending_tasks: inner.gauges.pending(),
            metrics_dropped: inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Clear counters, histogram, ring and error buckets. Used at the
    /// warmup → measured-phase boundary.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.total.store(0, Ordering::Relaxed);
        inner.successful.store(0, Ordering::Relaxed);
        inner.failed.store(0, Ordering::Relaxed);
        inner.latency_sum_nanos.store(0, Ordering::Relaxed);
        inner.dropped.store(0, Ordering::Relaxed);
        inner.start_time_ms.store(epoch_millis(), Ordering::Relaxed);

        if let Ok(mut hist) = inner.histogram.lock() {
            hist.clear();
        }
        if let Ok(mut ring) = inner.tps.lock() {
            ring.clear();
        }
        if let Ok(mut errors) = inner.errors.lock() {
            errors.clear();
        }
    }
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
