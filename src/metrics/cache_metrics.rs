//! Table cache metrics.

use std::fmt;
use std::fmt::Write as _;

use super::collector::{Counter, Gauge, Histogram};

/// Counters maintained by a [`TableCache`](crate::TableCache).
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Descriptors
    /// Descriptor lookups served from the store.
    pub descriptor_hits: Counter,
    /// Descriptor lookups that decoded a definition.
    pub descriptor_misses: Counter,
    /// Definition loads that failed.
    pub decode_failures: Counter,
    /// Descriptors removed from the store.
    pub descriptors_deleted: Counter,

    // Handles
    /// Idle handles reused.
    pub handle_hits: Counter,
    /// Acquisitions that found no idle handle.
    pub handle_misses: Counter,
    /// Handles registered after an engine open.
    pub handles_registered: Counter,
    /// Handles closed for any reason.
    pub handles_closed: Counter,
    /// Idle handles evicted to make room for a new one.
    pub handle_overflows: Counter,

    // Sharding
    /// Accounting instances currently active.
    pub active_instances: Gauge,
    /// Instance activations triggered by contention.
    pub instance_activations: Counter,

    // Waits
    /// Flush waits that ended as deadlock victim.
    pub deadlocks: Counter,
    /// Flush waits that timed out.
    pub lock_wait_timeouts: Counter,
    /// Time spent waiting for other users to release handles (microseconds).
    pub flush_wait_latency: Histogram,
}

impl CacheMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor hit rate (0.0 to 1.0).
    pub fn descriptor_hit_rate(&self) -> f64 {
        hit_rate(self.descriptor_hits.get(), self.descriptor_misses.get())
    }

    /// Handle hit rate (0.0 to 1.0).
    pub fn handle_hit_rate(&self) -> f64 {
        hit_rate(self.handle_hits.get(), self.handle_misses.get())
    }

    /// Render counters in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, &Counter); 12] = [
            ("descriptor_hits_total", "Descriptor lookups served from cache", &self.descriptor_hits),
            ("descriptor_misses_total", "Descriptor lookups that decoded a definition", &self.descriptor_misses),
            ("decode_failures_total", "Failed definition loads", &self.decode_failures),
            ("descriptors_deleted_total", "Descriptors removed from the cache", &self.descriptors_deleted),
            ("handle_hits_total", "Idle handles reused", &self.handle_hits),
            ("handle_misses_total", "Handle acquisitions without an idle handle", &self.handle_misses),
            ("handles_registered_total", "Handles registered", &self.handles_registered),
            ("handles_closed_total", "Handles closed", &self.handles_closed),
            ("handle_overflows_total", "Idle handles evicted at capacity", &self.handle_overflows),
            ("instance_activations_total", "Accounting instances activated", &self.instance_activations),
            ("deadlocks_total", "Flush waits aborted as deadlock victim", &self.deadlocks),
            ("lock_wait_timeouts_total", "Flush waits that timed out", &self.lock_wait_timeouts),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(output, "# HELP tablecache_{} {}", name, help);
            let _ = writeln!(output, "# TYPE tablecache_{} counter", name);
            let _ = writeln!(output, "tablecache_{} {}\n", name, counter.get());
        }

        output.push_str("# HELP tablecache_active_instances Active accounting instances\n");
        output.push_str("# TYPE tablecache_active_instances gauge\n");
        let _ = writeln!(
            output,
            "tablecache_active_instances {}\n",
            self.active_instances.get()
        );

        output.push_str("# HELP tablecache_flush_wait_seconds Time spent waiting for flushes\n");
        output.push_str("# TYPE tablecache_flush_wait_seconds histogram\n");
        output.push_str(
            &self
                .flush_wait_latency
                .to_prometheus("tablecache_flush_wait_seconds"),
        );

        output
    }
}

/// Point-in-time view of a cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub descriptors: usize,
    pub unused_descriptors: usize,
    pub handles: usize,
    pub active_instances: usize,
    pub max_instances: usize,
    pub refresh_version: u64,
    pub descriptor_hit_rate: f64,
    pub handle_hit_rate: f64,
    pub handle_overflows: u64,
    pub handles_closed: u64,
    pub deadlocks: u64,
    pub lock_wait_timeouts: u64,
    pub flush_wait_mean_us: f64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Table Cache ===")?;
        writeln!(f)?;
        writeln!(f, "Descriptors:")?;
        writeln!(f, "  Cached:   {}", self.descriptors)?;
        writeln!(f, "  Unused:   {}", self.unused_descriptors)?;
        writeln!(f, "  Hit rate: {:.1}%", self.descriptor_hit_rate * 100.0)?;
        writeln!(f, "  Version:  {}", self.refresh_version)?;
        writeln!(f)?;
        writeln!(f, "Handles:")?;
        writeln!(f, "  Accounted: {}", self.handles)?;
        writeln!(f, "  Hit rate:  {:.1}%", self.handle_hit_rate * 100.0)?;
        writeln!(f, "  Overflows: {}", self.handle_overflows)?;
        writeln!(f, "  Closed:    {}", self.handles_closed)?;
        writeln!(
            f,
            "  Instances: {}/{}",
            self.active_instances, self.max_instances
        )?;
        writeln!(f)?;
        writeln!(f, "Waits:")?;
        writeln!(f, "  Deadlocks: {}", self.deadlocks)?;
        writeln!(f, "  Timeouts:  {}", self.lock_wait_timeouts)?;
        writeln!(f, "  Flush wait (mean): {:.2} µs", self.flush_wait_mean_us)?;
        Ok(())
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
