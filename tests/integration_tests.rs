//! Integration tests for complete table cache workflows.

use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tablecache::{
    CacheOptions, CacheOptionsBuilder, Descriptor, Engine, Error, ExecContext, MemoryEngine,
    ReleaseOutcome, RemoveMode, TableCache, TableDefinition, TableHandle, TableIdentity,
};

fn id(table: &str) -> TableIdentity {
    TableIdentity::new("shop", table)
}

fn setup(tables: &[&str], options: CacheOptions) -> (Arc<MemoryEngine>, Arc<TableCache<MemoryEngine>>) {
    let engine = Arc::new(MemoryEngine::new());
    for table in tables {
        engine.create_table(id(table), TableDefinition::new(["id", "payload"]));
    }
    let cache = Arc::new(TableCache::new(Arc::clone(&engine), options).unwrap());
    (engine, cache)
}

fn small(descriptors: usize, handles: usize) -> CacheOptions {
    CacheOptionsBuilder::new()
        .descriptor_cache_size(descriptors)
        .handle_cache_size(handles)
        .build()
        .unwrap()
}

/// Open an engine handle outside the cache and register it.
fn register(
    cache: &TableCache<MemoryEngine>,
    descriptor: &Arc<Descriptor<MemoryEngine>>,
    ctx: &Arc<ExecContext>,
) -> TableHandle<MemoryEngine> {
    let definition = descriptor.definition().unwrap();
    let engine_handle = cache
        .engine()
        .open_handle(&definition, descriptor.identity())
        .unwrap();
    cache.register_handle(descriptor, engine_handle, ctx)
}

/// Statement-style workflow: acquire, open, release, reuse.
#[test]
fn integration_statement_workflow() {
    let (engine, cache) = setup(&["orders", "customers"], CacheOptions::default());
    let session = ExecContext::new(1);

    for _ in 0..10 {
        for table in ["orders", "customers"] {
            let descriptor = cache.acquire_descriptor(&id(table)).unwrap();
            let handle = cache.open_handle(&descriptor, &session).unwrap();
            assert_eq!(handle.engine_handle().identity(), &id(table));
            assert_eq!(cache.release_handle(handle), ReleaseOutcome::Pooled);
            cache.release_descriptor(descriptor);
        }
    }

    assert_eq!(engine.decode_count(), 2);
    assert_eq!(engine.open_count(), 2);
    assert_eq!(cache.descriptor_count(), 2);
    assert_eq!(cache.unused_count(), 2);
    assert_eq!(cache.handle_count(), 2);

    let stats = cache.stats();
    assert!(stats.descriptor_hit_rate > 0.8);
    assert!(stats.handle_hit_rate > 0.8);
    cache.verify_invariants().unwrap();
}

/// Idle handle eviction keeps the count at capacity and evicts oldest first.
#[test]
fn integration_scenario_eviction_at_capacity() {
    let (engine, cache) = setup(&["orders"], small(10, 2));
    let ctx = ExecContext::new(1);
    let d = cache.acquire_descriptor(&id("orders")).unwrap();

    let h1 = register(&cache, &d, &ctx);
    let h2 = register(&cache, &d, &ctx);
    let (e1, id2) = (h1.engine_handle().id(), h2.id());
    cache.release_handle(h1);
    cache.release_handle(h2);
    assert_eq!(cache.instance_handle_count(0), 2);

    let h3 = register(&cache, &d, &ctx);
    let id3 = h3.id();
    assert_eq!(engine.closed_handles(), vec![e1]);
    assert_eq!(cache.instance_handle_count(0), 2);
    assert_eq!(cache.idle_handles(0), vec![id2]);

    assert_eq!(cache.release_handle(h3), ReleaseOutcome::Pooled);
    assert_eq!(cache.idle_handles(0), vec![id2, id3]);
    assert_eq!(cache.metrics().handle_overflows.get(), 1);

    cache.release_descriptor(d);
    cache.verify_invariants().unwrap();
}

/// The last of several releases parks the descriptor on the unused list.
#[test]
fn integration_scenario_last_release_parks() {
    let (_, cache) = setup(&["orders"], CacheOptions::default());

    let refs: Vec<_> = (0..3)
        .map(|_| cache.acquire_descriptor(&id("orders")).unwrap())
        .collect();
    assert_eq!(refs[0].ref_count(), 3);

    let mut refs = refs.into_iter();
    cache.release_descriptor(refs.next().unwrap());
    assert_eq!(cache.unused_count(), 0);
    cache.release_descriptor(refs.next().unwrap());
    assert_eq!(cache.unused_count(), 0);
    cache.release_descriptor(refs.next().unwrap());
    assert_eq!(cache.unused_count(), 1);

    let info = cache.list_descriptors();
    assert_eq!(info.len(), 1);
    assert!(info[0].unused);
    assert_eq!(info[0].ref_count, 0);
}

/// Flush blocks until the in-use handle comes back, which is then closed.
#[test]
fn integration_scenario_flush_waits_for_user() {
    let (engine, cache) = setup(&["orders"], CacheOptions::default());
    let user = ExecContext::new(1);
    let flusher = ExecContext::new(2);

    let d = cache.acquire_descriptor(&id("orders")).unwrap();
    let h = cache.open_handle(&d, &user).unwrap();

    let flush = {
        let cache = Arc::clone(&cache);
        let flusher = Arc::clone(&flusher);
        thread::spawn(move || {
            let d = cache.acquire_descriptor(&id("orders")).unwrap();
            cache.flush(&flusher, &d, true);
            cache.release_descriptor(d);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!flush.is_finished());

    assert_eq!(cache.release_handle(h), ReleaseOutcome::Closed);
    flush.join().unwrap();
    assert_eq!(engine.live_handles(), 0);

    cache.release_descriptor(d);
    assert_eq!(cache.descriptor_count(), 0);
}

/// Handles of a flushed descriptor are closed even with capacity to spare.
#[test]
fn integration_release_after_flush_closes() {
    let (engine, cache) = setup(&["orders"], small(10, 100));
    let ctx = ExecContext::new(1);
    let other = ExecContext::new(2);
    let d = cache.acquire_descriptor(&id("orders")).unwrap();

    let handles: Vec<_> = (0..3).map(|_| register(&cache, &d, &ctx)).collect();
    assert!(cache.remove_descriptor_with(&other, &id("orders"), RemoveMode::Unused));
    assert!(d.is_flushed());

    for h in handles {
        assert_eq!(cache.release_handle(h), ReleaseOutcome::Closed);
    }
    assert_eq!(engine.live_handles(), 0);
    assert_eq!(cache.handle_count(), 0);

    cache.release_descriptor(d);
    assert_eq!(cache.descriptor_count(), 0);
}

/// A removed table is decoded again on the next acquire.
#[test]
fn integration_removed_descriptor_not_returned() {
    let (engine, cache) = setup(&["orders"], CacheOptions::default());
    let ctx = ExecContext::new(1);

    let old = cache.acquire_descriptor(&id("orders")).unwrap();
    let keep = Arc::clone(&old);
    cache.release_descriptor(old);
    assert!(cache.remove_descriptor(&ctx, &id("orders")));

    engine.alter_table(&id("orders"));
    let new = cache.acquire_descriptor(&id("orders")).unwrap();
    assert!(!Arc::ptr_eq(&keep, &new));
    assert_eq!(engine.decode_count(), 2);
    assert_eq!(new.definition().unwrap().schema_version, 2);
    assert!(keep.definition().is_none());
    cache.release_descriptor(new);
}

/// remove_descriptor waits for other users to give the table back.
#[test]
fn integration_remove_waits_for_users() {
    let (engine, cache) = setup(&["orders"], CacheOptions::default());
    let user = ExecContext::new(1);
    let dropper = ExecContext::new(2);

    let d = cache.acquire_descriptor(&id("orders")).unwrap();
    let h = cache.open_handle(&d, &user).unwrap();

    let remover = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.remove_descriptor(&dropper, &id("orders")))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!remover.is_finished());

    cache.release_handle(h);
    cache.release_descriptor(d);
    assert!(remover.join().unwrap());
    assert_eq!(cache.descriptor_count(), 0);
    assert_eq!(engine.live_handles(), 0);
}

/// Decode errors reach every caller and leave nothing cached.
#[test]
fn integration_decode_failure() {
    let (_, cache) = setup(&[], CacheOptions::default());

    let err = cache.acquire_descriptor(&id("ghost")).unwrap_err();
    assert!(matches!(err, Error::Decode { .. }));
    assert!(err.to_string().contains("`shop`.`ghost`"));
    assert_eq!(cache.descriptor_count(), 0);
    cache.verify_invariants().unwrap();
}

/// Waiting on a flushed table times out while a user keeps it open.
#[test]
fn integration_wait_for_old_version_timeout() {
    let (_, cache) = setup(&["orders"], CacheOptions::default());
    let user = ExecContext::new(1);
    let waiter = ExecContext::new(2);

    let d = cache.acquire_descriptor(&id("orders")).unwrap();
    let h = cache.open_handle(&d, &user).unwrap();
    cache.remove_descriptor_with(&waiter, &id("orders"), RemoveMode::Unused);

    let err = cache
        .wait_for_old_version(&waiter, &id("orders"), Duration::from_millis(50), 0)
        .unwrap_err();
    assert!(matches!(err, Error::LockWaitTimeout(_)));
    assert!(err.is_lock_wait_failure());
    assert_eq!(cache.metrics().lock_wait_timeouts.get(), 1);

    cache.release_handle(h);
    cache.release_descriptor(d);
}

/// Waiting on a flushed table succeeds once the last user leaves.
#[test]
fn integration_wait_for_old_version_granted() {
    let (_, cache) = setup(&["orders"], CacheOptions::default());
    let user = ExecContext::new(1);
    let waiter = ExecContext::new(2);

    let d = cache.acquire_descriptor(&id("orders")).unwrap();
    let h = cache.open_handle(&d, &user).unwrap();
    cache.remove_descriptor_with(&waiter, &id("orders"), RemoveMode::Unused);

    let wait = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            cache.wait_for_old_version(&waiter, &id("orders"), Duration::from_secs(10), 0)
        })
    };

    thread::sleep(Duration::from_millis(50));
    cache.release_handle(h);
    cache.release_descriptor(d);

    wait.join().unwrap().unwrap();
    assert_eq!(cache.descriptor_count(), 0);
}

/// Two sessions each wait for a table the other keeps open.
#[test]
fn integration_flush_wait_deadlock() {
    let (_, cache) = setup(&["orders", "customers"], CacheOptions::default());
    let a = ExecContext::new(1);
    let b = ExecContext::new(2);

    let orders = cache.acquire_descriptor(&id("orders")).unwrap();
    let ha = cache.open_handle(&orders, &a).unwrap();
    let customers = cache.acquire_descriptor(&id("customers")).unwrap();
    let hb = cache.open_handle(&customers, &b).unwrap();

    cache.remove_descriptor_with(&a, &id("customers"), RemoveMode::Unused);
    cache.remove_descriptor_with(&b, &id("orders"), RemoveMode::Unused);

    // A waits for customers (used by B) and is the heavier session.
    let wait_a = {
        let cache = Arc::clone(&cache);
        let a = Arc::clone(&a);
        thread::spawn(move || {
            cache.wait_for_old_version(&a, &id("customers"), Duration::from_secs(10), 10)
        })
    };
    thread::sleep(Duration::from_millis(50));

    // B waits for orders (used by A): cycle, B is the lighter victim.
    let err = cache
        .wait_for_old_version(&b, &id("orders"), Duration::from_secs(10), 1)
        .unwrap_err();
    assert!(matches!(err, Error::Deadlock(_)));
    assert_eq!(cache.metrics().deadlocks.get(), 1);

    // The victim backs off and frees the table A waits for.
    assert_eq!(cache.release_handle(hb), ReleaseOutcome::Closed);
    cache.release_descriptor(customers);
    wait_a.join().unwrap().unwrap();

    cache.release_handle(ha);
    cache.release_descriptor(orders);
    assert_eq!(cache.descriptor_count(), 0);
}

/// Keep-share removal closes idle handles but leaves the table usable.
#[test]
fn integration_remove_keep_share() {
    let (engine, cache) = setup(&["orders"], CacheOptions::default());
    let ctx = ExecContext::new(1);
    let d = cache.acquire_descriptor(&id("orders")).unwrap();

    let h1 = cache.open_handle(&d, &ctx).unwrap();
    let h2 = register(&cache, &d, &ctx);
    cache.release_handle(h2);

    assert!(cache.remove_descriptor_with(&ctx, &id("orders"), RemoveMode::NotOwnKeepShare));
    assert_eq!(engine.live_handles(), 1);
    assert!(!d.is_flushed());

    cache.release_handle(h1);
    cache.release_descriptor(d);
    let again = cache.acquire_descriptor(&id("orders")).unwrap();
    assert_eq!(engine.decode_count(), 1);
    cache.release_descriptor(again);
}

/// Refresh bumps the version seen by new descriptors.
#[test]
fn integration_refresh_all() {
    let (engine, cache) = setup(&["orders", "customers"], CacheOptions::default());
    let ctx = ExecContext::new(1);

    for table in ["orders", "customers"] {
        let d = cache.acquire_descriptor(&id(table)).unwrap();
        let h = cache.open_handle(&d, &ctx).unwrap();
        cache.release_handle(h);
        cache.release_descriptor(d);
    }

    assert_eq!(cache.purge_all_handles(true), 2);
    assert_eq!(cache.descriptor_count(), 0);
    assert_eq!(engine.live_handles(), 0);

    let d = cache.acquire_descriptor(&id("orders")).unwrap();
    assert_eq!(d.version(), cache.refresh_version());
    assert_eq!(cache.refresh_version(), 2);
    cache.release_descriptor(d);
}

/// Prometheus export carries the cache counters.
#[test]
fn integration_prometheus_export() {
    let (_, cache) = setup(&["orders"], CacheOptions::default());
    let ctx = ExecContext::new(1);
    let d = cache.acquire_descriptor(&id("orders")).unwrap();
    let h = cache.open_handle(&d, &ctx).unwrap();
    cache.release_handle(h);
    cache.release_descriptor(d);

    let text = cache.to_prometheus();
    assert!(text.contains("tablecache_descriptor_misses_total 1"));
    assert!(text.contains("tablecache_handles_registered_total 1"));
    assert!(text.contains("tablecache_active_instances 1"));
    assert!(cache.stats().to_string().contains("Descriptors:"));
}

// =============================================================================
// Model-based properties
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Release(usize),
    Open(usize),
    ReleaseHandle(usize, bool),
    Remove(usize),
    PurgeIdle,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..4usize).prop_map(Op::Acquire),
        3 => any::<usize>().prop_map(Op::Release),
        4 => any::<usize>().prop_map(Op::Open),
        4 => (any::<usize>(), any::<bool>()).prop_map(|(i, r)| Op::ReleaseHandle(i, r)),
        1 => (0..4usize).prop_map(Op::Remove),
        1 => Just(Op::PurgeIdle),
    ]
}

const TABLES: [&str; 4] = ["t0", "t1", "t2", "t3"];

/// One acquired descriptor reference and the handles opened under it.
struct Held {
    descriptor: Arc<Descriptor<MemoryEngine>>,
    handles: Vec<TableHandle<MemoryEngine>>,
}

fn release_held(cache: &TableCache<MemoryEngine>, held: Held) {
    for handle in held.handles {
        cache.release_handle(handle);
    }
    cache.release_descriptor(held.descriptor);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_cache_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let (engine, cache) = setup(&TABLES, small(2, 3));
        let ctx = ExecContext::new(1);
        let capacity = 3;
        let mut held: Vec<Held> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire(t) => {
                    let descriptor = cache.acquire_descriptor(&id(TABLES[t])).unwrap();
                    held.push(Held { descriptor, handles: Vec::new() });
                }
                Op::Release(i) if !held.is_empty() => {
                    let entry = held.remove(i % held.len());
                    release_held(&cache, entry);
                }
                Op::Open(i) if !held.is_empty() => {
                    let index = i % held.len();
                    let entry = &mut held[index];
                    let handle = cache.open_handle(&entry.descriptor, &ctx).unwrap();
                    entry.handles.push(handle);
                }
                Op::ReleaseHandle(i, reopen) => {
                    if let Some(entry) = held.iter_mut().find(|e| !e.handles.is_empty()) {
                        let index = i % entry.handles.len();
                        let mut handle = entry.handles.remove(index);
                        if reopen {
                            handle.mark_needs_reopen();
                        }
                        cache.release_handle(handle);
                    }
                }
                Op::Remove(t) => {
                    cache.remove_descriptor_with(&ctx, &id(TABLES[t]), RemoveMode::Unused);
                }
                Op::PurgeIdle => {
                    cache.purge_all_handles(false);
                }
                _ => {}
            }

            prop_assert!(cache.verify_invariants().is_ok(), "{:?}", cache.verify_invariants());

            let in_use: usize = held.iter().map(|e| e.handles.len()).sum();
            prop_assert!(cache.instance_handle_count(0) <= capacity.max(in_use));
            prop_assert_eq!(engine.live_handles(), cache.handle_count());
        }

        for entry in held.drain(..) {
            release_held(&cache, entry);
        }
        cache.verify_invariants().unwrap();
        cache.start_shutdown();
        prop_assert_eq!(engine.live_handles(), 0);
        prop_assert_eq!(cache.descriptor_count(), 0);
    }

    #[test]
    fn prop_eviction_follows_release_order(order in Just((0..4usize).collect::<Vec<_>>()).prop_shuffle()) {
        let (engine, cache) = setup(&["orders"], small(10, 4));
        let ctx = ExecContext::new(1);
        let d = cache.acquire_descriptor(&id("orders")).unwrap();

        let mut handles: Vec<Option<TableHandle<MemoryEngine>>> =
            (0..4).map(|_| Some(register(&cache, &d, &ctx))).collect();
        let mut released = Vec::new();
        for &i in &order {
            if let Some(handle) = handles[i].take() {
                released.push(handle.engine_handle().id());
                cache.release_handle(handle);
            }
        }

        let fresh: Vec<_> = (0..4).map(|_| register(&cache, &d, &ctx)).collect();
        prop_assert_eq!(engine.closed_handles(), released);
        prop_assert_eq!(cache.instance_handle_count(0), 4);

        for handle in fresh {
            cache.release_handle(handle);
        }
        cache.release_descriptor(d);
    }
}
