//! Metrics and observability for the table cache.
//!
//! - **Primitives**: atomic counters, gauges and a latency histogram
//! - **Cache metrics**: hit rates, evictions, shard activations, waits
//! - **Prometheus export**: text exposition format

mod cache_metrics;
mod collector;

pub use cache_metrics::{CacheMetrics, CacheStats};
pub use collector::{Counter, Gauge, Histogram};
