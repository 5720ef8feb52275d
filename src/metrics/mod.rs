//! Ingestion metrics
//!
//! Lock-free counters and a latency histogram owned by each
//! [`MediaIngestor`](crate::media::MediaIngestor). Read them through
//! [`IngestMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::media::IngestStage;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that moves up and down
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Default latency bucket bounds in milliseconds
pub const DEFAULT_LATENCY_BUCKETS_MS: &[u64] = &[5, 25, 100, 250, 500, 1000, 2500, 5000, 10_000, 30_000];

/// Latency histogram; each observation lands in exactly one bucket
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<u64>,
    counts: Vec<AtomicU64>,
    overflow: AtomicU64,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_buckets(bounds: &[u64]) -> Self {
        let mut bounds = bounds.to_vec();
        bounds.sort_unstable();
        bounds.dedup();
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, millis: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(millis, Ordering::Relaxed);
        match self.bounds.iter().position(|&bound| millis <= bound) {
            Some(idx) => self.counts[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() as f64 / n as f64,
        }
    }

    /// `(upper_bound_ms, count)` pairs; the overflow bucket has bound `None`
    pub fn buckets(&self) -> Vec<(Option<u64>, u64)> {
        self.bounds
            .iter()
            .zip(&self.counts)
            .map(|(bound, count)| (Some(*bound), count.load(Ordering::Relaxed)))
            .chain(std::iter::once((None, self.overflow.load(Ordering::Relaxed))))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::with_buckets(DEFAULT_LATENCY_BUCKETS_MS)
    }
}

/// Counters for one ingestion pipeline
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub requests: Counter,
    pub succeeded: Counter,
    pub deduplicated: Counter,
    pub uploads: Counter,
    pub bytes_uploaded: Counter,
    pub images_resized: Counter,
    pub validation_failures: Counter,
    pub download_failures: Counter,
    pub normalization_failures: Counter,
    pub storage_failures: Counter,
    pub in_flight: Gauge,
    pub latency: Histogram,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, stage: IngestStage) {
        match stage {
            IngestStage::Validation => self.validation_failures.inc(),
            IngestStage::Download => self.download_failures.inc(),
            IngestStage::Normalization => self.normalization_failures.inc(),
            IngestStage::Storage => self.storage_failures.inc(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.get(),
            succeeded: self.succeeded.get(),
            deduplicated: self.deduplicated.get(),
            uploads: self.uploads.get(),
            bytes_uploaded: self.bytes_uploaded.get(),
            images_resized: self.images_resized.get(),
            failures: FailureCounts {
                validation: self.validation_failures.get(),
                download: self.download_failures.get(),
                normalization: self.normalization_failures.get(),
                storage: self.storage_failures.get(),
            },
            in_flight: self.in_flight.get(),
            latency_count: self.latency.count(),
            latency_mean_ms: self.latency.mean(),
        }
    }
}

/// Failure counts by pipeline stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounts {
    pub validation: u64,
    pub download: u64,
    pub normalization: u64,
    pub storage: u64,
}

impl FailureCounts {
    pub fn total(&self) -> u64 {
        self.validation + self.download + self.normalization + self.storage
    }
}

/// Point-in-time copy of [`IngestMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub succeeded: u64,
    pub deduplicated: u64,
    pub uploads: u64,
    pub bytes_uploaded: u64,
    pub images_resized: u64,
    pub failures: FailureCounts,
    pub in_flight: u64,
    pub latency_count: u64,
    pub latency_mean_ms: f64,
}
