// Example API Usage
// This file shows how a server embeds the table cache

use std::sync::Arc;
use std::time::Duration;

use tablecache::{
    CacheOptionsBuilder, Engine, Error, ExecContext, MemoryEngine, RemoveMode, TableCache,
    TableDefinition, TableIdentity,
};

fn main() -> Result<(), Error> {
    // ===========================================
    // Setup
    // ===========================================

    let engine = Arc::new(MemoryEngine::new());
    let orders = TableIdentity::new("shop", "orders");
    engine.create_table(orders.clone(), TableDefinition::new(["id", "customer", "total"]));

    let cache = TableCache::new(
        Arc::clone(&engine),
        CacheOptionsBuilder::new()
            .descriptor_cache_size(2000)
            .handle_cache_size(400)
            .max_instances(8)
            .build()?,
    )?;

    // One context per connection
    let session = ExecContext::new(1);

    // ===========================================
    // Statement Lifecycle
    // ===========================================

    // Open: shared definition first, then a handle on it
    let descriptor = cache.acquire_descriptor(&orders)?;
    let handle = cache.open_handle(&descriptor, &session)?;

    println!("{} has {} columns",
        descriptor.identity(),
        descriptor.definition().map_or(0, |d| d.columns.len()));

    // Close: the handle goes back to the pool, the descriptor to the LRU
    cache.release_handle(handle);
    cache.release_descriptor(descriptor);

    // Second statement reuses both without touching the engine
    let descriptor = cache.acquire_descriptor(&orders)?;
    let handle = cache.open_handle(&descriptor, &session)?;
    assert_eq!(engine.open_count(), 1);
    cache.release_handle(handle);
    cache.release_descriptor(descriptor);

    // ===========================================
    // Opening Handles Yourself
    // ===========================================

    // acquire_handle only reuses; on a miss open through the engine and
    // register the result so that it is accounted and pooled later
    let descriptor = cache.acquire_descriptor(&orders)?;
    let handle = match cache.acquire_handle(&descriptor, &session) {
        Some(handle) => handle,
        None => {
            let definition = descriptor.definition().ok_or_else(|| Error::internal("deleted"))?;
            let opened = engine.open_handle(&definition, descriptor.identity())?;
            cache.register_handle(&descriptor, opened, &session)
        }
    };
    cache.release_handle(handle);
    cache.release_descriptor(descriptor);

    // ===========================================
    // ALTER TABLE
    // ===========================================

    // Invalidate the cached definition, wait for other sessions to let go
    let ddl = ExecContext::new(2);
    cache.remove_descriptor(&ddl, &orders);
    engine.alter_table(&orders);

    // The next statement decodes the new definition
    let descriptor = cache.acquire_descriptor(&orders)?;
    assert_eq!(descriptor.definition().map(|d| d.schema_version), Some(2));
    cache.release_descriptor(descriptor);

    // ===========================================
    // FLUSH TABLES
    // ===========================================

    // Mark every definition old and close all idle handles
    cache.purge_all_handles(true);

    // A statement that found an old definition waits for it to go away
    match cache.wait_for_old_version(&session, &orders, Duration::from_secs(50), 0) {
        Ok(()) => println!("old version gone, reopening"),
        Err(e) if e.is_lock_wait_failure() => {
            println!("aborting statement: {}", e);
        }
        Err(e) => return Err(e),
    }

    // Invalidate only the idle handles of one table, keep its definition
    cache.remove_descriptor_with(&ddl, &orders, RemoveMode::NotOwnKeepShare);

    // ===========================================
    // Runtime Configuration
    // ===========================================

    cache.update_options(|o| {
        o.descriptor_cache_size = 500;
        o.handle_cache_size = 100;
    })?;

    // ===========================================
    // Monitoring
    // ===========================================

    println!("{}", cache.stats());
    for info in cache.list_descriptors() {
        println!("{} v{} refs={} handles={} idle={}",
            info.identity, info.version, info.ref_count, info.handles, info.idle_handles);
    }
    print!("{}", cache.to_prometheus());

    // ===========================================
    // Shutdown
    // ===========================================

    cache.start_shutdown();
    drop(cache);
    assert_eq!(engine.live_handles(), 0);

    Ok(())
}

// ===========================================
// Plugging In a Storage Engine
// ===========================================

struct CsvEngine {
    root: std::path::PathBuf,
}

struct CsvHandle {
    path: std::path::PathBuf,
}

impl Engine for CsvEngine {
    type Definition = Vec<String>;
    type Handle = CsvHandle;

    fn decode_definition(&self, identity: &TableIdentity) -> tablecache::Result<Vec<String>> {
        let path = self.root.join(identity.db()).join(format!("{}.header", identity.table()));
        let header = std::fs::read_to_string(&path)
            .map_err(|e| Error::decode(identity, e.to_string()))?;
        Ok(header.trim().split(',').map(str::to_string).collect())
    }

    fn open_handle(
        &self,
        _definition: &Vec<String>,
        identity: &TableIdentity,
    ) -> tablecache::Result<CsvHandle> {
        let path = self.root.join(identity.db()).join(format!("{}.csv", identity.table()));
        if !path.exists() {
            return Err(Error::open(identity, "data file missing"));
        }
        Ok(CsvHandle { path })
    }

    fn close_handle(&self, handle: CsvHandle) {
        println!("closing {}", handle.path.display());
    }
}
