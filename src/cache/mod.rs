//! Table definition and table handle caching.
//!
//! - **Descriptors**: one decoded definition per table, shared by all users,
//!   with unused descriptors kept on an LRU list
//! - **Handles**: open engine instances pooled per descriptor and accounted
//!   to contention-activated instances with a per-instance capacity
//! - **Flush**: invalidation of a table with waits that take part in
//!   deadlock detection

mod descriptor;
mod handle;
mod instance;
mod lru;
mod sharding;
mod store;
mod table_cache;

pub use descriptor::{Descriptor, DescriptorInfo};
pub use handle::{ReleaseOutcome, TableHandle};
pub use table_cache::{RemoveMode, TableCache};
