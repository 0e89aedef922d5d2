//! # tablecache
//!
//! A two-level cache for open tables in a database server.
//!
//! ## Features
//!
//! - **Shared Definitions**: Each table's metadata is decoded once and
//!   shared by every session that uses the table
//! - **Handle Pooling**: Open engine handles are returned to a pool and
//!   reused instead of reopened
//! - **Adaptive Sharding**: Handle accounting spreads over more instances
//!   when lock contention is detected
//! - **Flush Protocol**: Tables can be invalidated while in use, and
//!   waiters on an old definition take part in deadlock detection
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tablecache::{CacheOptions, ExecContext, MemoryEngine, TableCache, TableDefinition, TableIdentity};
//!
//! let engine = Arc::new(MemoryEngine::new());
//! let t1 = TableIdentity::new("shop", "orders");
//! engine.create_table(t1.clone(), TableDefinition::new(["id", "total"]));
//!
//! let cache = TableCache::new(engine, CacheOptions::default())?;
//! let session = ExecContext::new(1);
//!
//! // Statement start
//! let descriptor = cache.acquire_descriptor(&t1)?;
//! let handle = cache.open_handle(&descriptor, &session)?;
//!
//! // Statement end
//! cache.release_handle(handle);
//! cache.release_descriptor(descriptor);
//! ```

// Public modules
pub mod deadlock;
pub mod engine;
pub mod error;
pub mod options;
pub mod types;

// Internal modules
mod cache;
mod metrics;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{CacheOptions, CacheOptionsBuilder};
pub use types::TableIdentity;

// Engine
pub use engine::{Engine, MemoryEngine, MemoryHandle, TableDefinition};

// Deadlock detection
pub use deadlock::{ExecContext, WaitStatus};

// Cache
pub use cache::{Descriptor, DescriptorInfo, ReleaseOutcome, RemoveMode, TableCache, TableHandle};

// Metrics
pub use metrics::{CacheMetrics, CacheStats, Counter, Gauge, Histogram};
