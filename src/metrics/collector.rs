//! Atomic metric primitives.
//!
//! Counter, Gauge and a latency Histogram, all updated with relaxed atomics
//! so they can be bumped from inside cache critical sections.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter initialized to 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Add a value to the counter.
    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge initialized to 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gauge to a specific value.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Add a (possibly negative) delta.
    pub fn add(&self, v: i64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Number of latency buckets, the last one unbounded.
const BUCKETS: usize = 8;

/// Upper bounds (exclusive, microseconds) of the bounded buckets.
const BUCKET_BOUNDS_US: [u64; BUCKETS - 1] = [
    10,         // <10us
    100,        // <100us
    1_000,      // <1ms
    10_000,     // <10ms
    100_000,    // <100ms
    1_000_000,  // <1s
    10_000_000, // <10s
];

/// Latency distribution in microseconds.
///
/// Tracks count, sum, max and a fixed set of decade buckets.
#[derive(Debug, Default)]
pub struct Histogram {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
    buckets: [AtomicU64; BUCKETS],
}

impl Histogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the time elapsed since `start`.
    pub fn observe_since(&self, start: Instant) {
        self.observe_duration(start.elapsed());
    }

    /// Record a duration.
    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    /// Record a value in microseconds.
    pub fn observe(&self, micros: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.max.fetch_max(micros, Ordering::Relaxed);

        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| micros < bound)
            .unwrap_or(BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observations.
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Largest observation, None if empty.
    pub fn max(&self) -> Option<u64> {
        match self.count() {
            0 => None,
            _ => Some(self.max.load(Ordering::Relaxed)),
        }
    }

    /// Mean observation.
    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Per-bucket (non-cumulative) counts.
    pub fn bucket_counts(&self) -> [u64; BUCKETS] {
        let mut counts = [0u64; BUCKETS];
        for (slot, bucket) in counts.iter_mut().zip(&self.buckets) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        counts
    }

    /// Render in Prometheus histogram format, bounds in seconds.
    pub fn to_prometheus(&self, name: &str) -> String {
        let mut output = String::new();
        let counts = self.bucket_counts();
        let mut cumulative = 0u64;

        for (count, bound) in counts.iter().zip(BUCKET_BOUNDS_US) {
            cumulative += count;
            let le = bound as f64 / 1_000_000.0;
            let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", name, le, cumulative);
        }
        cumulative += counts[BUCKETS - 1];
        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, cumulative);
        let _ = writeln!(
            output,
            "{}_sum {}",
            name,
            self.sum() as f64 / 1_000_000.0
        );
        let _ = writeln!(output, "{}_count {}", name, self.count());
        output
    }
}
