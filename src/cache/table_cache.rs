//! Two-level table cache.
//!
//! Level one caches decoded table definitions ([`Descriptor`]), shared by
//! every user of a table. Level two caches open engine handles
//! ([`TableHandle`]) so that a table does not have to be reopened for every
//! statement.
//!
//! # Locking
//!
//! Three kinds of locks, always taken in this order:
//!
//! ```text
//! unused-descriptor list  ->  descriptor element lock  ->  accounting instance
//! ```
//!
//! Engine calls never run under an instance lock. Definition decoding runs
//! under the new descriptor's element lock only, so a slow load blocks
//! nobody but other acquirers of the same table.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};

use crate::deadlock::{ExecContext, WaitStatus};
use crate::engine::Engine;
use crate::metrics::{CacheMetrics, CacheStats};
use crate::options::CacheOptions;
use crate::types::TableIdentity;
use crate::{Error, Result};

use super::descriptor::{Descriptor, DescriptorInfo, DescriptorState, FlushTicket, Phase};
use super::handle::{HandleMeta, ReleaseOutcome, TableHandle};
use super::instance::CacheInstance;
use super::lru::LruList;
use super::sharding::ShardController;
use super::store::DescriptorStore;

/// How [`TableCache::remove_descriptor_with`] treats current users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// Mark flushed and wait until every other reference and handle is gone.
    All,
    /// Mark flushed and wait until only the caller's handles remain.
    NotOwn,
    /// Mark flushed and close idle handles, without waiting.
    Unused,
    /// Like `NotOwn`, but leave the descriptor valid for later users.
    NotOwnKeepShare,
}

/// Cache of table descriptors and open table handles.
pub struct TableCache<E: Engine> {
    engine: Arc<E>,
    options: ArcSwap<CacheOptions>,
    store: DescriptorStore<E>,
    /// Descriptors without users, least recently released first.
    unused: Mutex<LruList<Arc<Descriptor<E>>>>,
    instances: Vec<CacheInstance<E>>,
    sharding: ShardController,
    refresh_version: AtomicU64,
    next_descriptor_id: AtomicU64,
    next_handle_id: AtomicU64,
    metrics: CacheMetrics,
}

impl<E: Engine> TableCache<E> {
    /// Create a cache on top of `engine`.
    pub fn new(engine: Arc<E>, options: CacheOptions) -> Result<Self> {
        options.validate()?;

        let instances = (0..options.max_instances)
            .map(|_| CacheInstance::new())
            .collect();
        let sharding = ShardController::new(
            options.max_instances,
            options.contention_stall_threshold,
            options.contention_sample_window,
        );
        let metrics = CacheMetrics::new();
        metrics.active_instances.set(1);

        tracing::debug!(
            descriptor_cache_size = options.descriptor_cache_size,
            handle_cache_size = options.handle_cache_size,
            max_instances = options.max_instances,
            "table cache created"
        );

        Ok(Self {
            engine,
            options: ArcSwap::from_pointee(options),
            store: DescriptorStore::new(),
            unused: Mutex::new(LruList::new()),
            instances,
            sharding,
            refresh_version: AtomicU64::new(1),
            next_descriptor_id: AtomicU64::new(0),
            next_handle_id: AtomicU64::new(0),
            metrics,
        })
    }

    /// The storage engine.
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Current options.
    pub fn options(&self) -> Arc<CacheOptions> {
        self.options.load_full()
    }

    /// Live metrics.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    // =========================================================================
    // Descriptors
    // =========================================================================

    /// Get the descriptor of a table, loading it on a miss.
    ///
    /// Every successful call must be paired with one
    /// [`release_descriptor`](Self::release_descriptor).
    pub fn acquire_descriptor(&self, identity: &TableIdentity) -> Result<Arc<Descriptor<E>>> {
        loop {
            let existing = match self.store.get(identity) {
                Some(descriptor) => descriptor,
                None => {
                    let id = self.next_descriptor_id.fetch_add(1, Ordering::Relaxed) + 1;
                    let fresh = Arc::new(Descriptor::new(
                        id,
                        identity.clone(),
                        self.refresh_version(),
                    ));
                    // Locked before it becomes visible: concurrent acquirers
                    // block until the definition is loaded.
                    let state = fresh.state.lock();
                    let (current, inserted) = self.store.get_or_insert(&fresh);
                    if inserted {
                        self.load_descriptor(&fresh, state)?;
                        return Ok(fresh);
                    }
                    drop(state);
                    current
                }
            };

            if self.try_acquire_existing(&existing)? {
                self.metrics.descriptor_hits.inc();
                return Ok(existing);
            }

            // Being deleted; wait for the slot to leave the store.
            thread::yield_now();
        }
    }

    fn load_descriptor(
        &self,
        descriptor: &Arc<Descriptor<E>>,
        mut state: MutexGuard<'_, DescriptorState>,
    ) -> Result<()> {
        self.metrics.descriptor_misses.inc();

        match self.engine.decode_definition(descriptor.identity()) {
            Ok(definition) => {
                descriptor.set_definition(Some(Arc::new(definition)));
                state.phase = Phase::Ready;
                state.ref_count = 1;
                drop(state);

                tracing::debug!(
                    table = %descriptor.identity(),
                    version = descriptor.version(),
                    "loaded table definition"
                );

                let limit = self.options.load().descriptor_cache_size;
                self.purge_descriptors(limit);
                Ok(())
            }
            Err(err) => {
                state.phase = Phase::Failed(err.clone());
                self.store.remove(descriptor);
                drop(state);
                descriptor.released.notify_all();

                self.metrics.decode_failures.inc();
                tracing::debug!(
                    table = %descriptor.identity(),
                    error = %err,
                    "failed to load table definition"
                );
                Err(err)
            }
        }
    }

    /// Take a reference on a descriptor found in the store.
    ///
    /// Returns false if the descriptor is being deleted.
    fn try_acquire_existing(&self, descriptor: &Arc<Descriptor<E>>) -> Result<bool> {
        {
            let mut state = descriptor.state.lock();
            match &state.phase {
                Phase::Ready => {}
                Phase::Failed(err) => return Err(err.clone()),
                Phase::Loading | Phase::Deleted => return Ok(false),
            }
            if state.ref_count > 0 {
                state.ref_count += 1;
                return Ok(true);
            }
        }

        let mut unused = self.unused.lock();
        let mut state = descriptor.state.lock();
        match &state.phase {
            Phase::Ready => {}
            Phase::Failed(err) => return Err(err.clone()),
            Phase::Loading | Phase::Deleted => return Ok(false),
        }
        if state.ref_count == 0 {
            if let Some(link) = state.unused_link.take() {
                unused.remove(link);
            }
        }
        state.ref_count += 1;
        Ok(true)
    }

    /// Give back a reference taken by [`acquire_descriptor`](Self::acquire_descriptor).
    ///
    /// The last release either parks the descriptor on the unused list or,
    /// if it was flushed or the cache holds too many descriptors, deletes it.
    pub fn release_descriptor(&self, descriptor: Arc<Descriptor<E>>) {
        {
            let mut state = descriptor.state.lock();
            assert!(
                state.ref_count > 0,
                "release of unreferenced descriptor {}",
                descriptor.identity()
            );
            if state.ref_count > 1 {
                state.ref_count -= 1;
                drop(state);
                descriptor.released.notify_all();
                return;
            }
        }

        let mut unused = self.unused.lock();
        let mut state = descriptor.state.lock();
        assert!(
            state.ref_count > 0,
            "release of unreferenced descriptor {}",
            descriptor.identity()
        );
        state.ref_count -= 1;
        descriptor.released.notify_all();
        if state.ref_count > 0 {
            return;
        }

        let limit = self.options.load().descriptor_cache_size;
        if descriptor.is_flushed() || self.store.len() > limit {
            drop(unused);
            self.delete_descriptor(&descriptor, state);
        } else {
            state.unused_link = Some(unused.push_back(Arc::clone(&descriptor)));
        }
    }

    /// Remove an unreferenced descriptor from the cache.
    ///
    /// Called with the element lock held and the descriptor already unlinked
    /// from the unused list.
    fn delete_descriptor(
        &self,
        descriptor: &Arc<Descriptor<E>>,
        mut state: MutexGuard<'_, DescriptorState>,
    ) {
        state.phase = Phase::Deleted;
        descriptor.mark_flushed();

        let purged = self.take_idle_handles(descriptor, &mut state);
        descriptor.wait_until(&mut state, |s| s.all_handles.is_empty());

        for waiter in &state.flush_waiters {
            waiter.set_wait_status(WaitStatus::Granted);
        }
        descriptor.wait_until(&mut state, |s| s.flush_waiters.is_empty() && s.pins == 0);

        self.store.remove(descriptor);
        descriptor.set_definition(None);
        drop(state);
        descriptor.released.notify_all();

        self.metrics.descriptors_deleted.inc();
        tracing::debug!(table = %descriptor.identity(), "deleted table descriptor");

        self.close_engine_handles(purged);
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Reuse an idle handle of `descriptor`.
    ///
    /// Returns None on a miss; the caller then opens a handle through the
    /// engine and hands it to [`register_handle`](Self::register_handle).
    pub fn acquire_handle(
        &self,
        descriptor: &Arc<Descriptor<E>>,
        ctx: &Arc<ExecContext>,
    ) -> Option<TableHandle<E>> {
        let (index, active) = self.sharding.instance_for(ctx);
        let (mut instance, activated) =
            self.instances[index].lock_and_check_contention(&self.sharding, index, active);
        if let Some(active) = activated {
            self.metrics.instance_activations.inc();
            self.metrics.active_instances.set(active as i64);
        }

        let handle = instance.pop_idle(descriptor.id());
        if let Some(handle) = &handle {
            handle.meta.set_in_use_by(Some(Arc::clone(ctx)));
        }
        drop(instance);

        match handle {
            Some(handle) => {
                self.metrics.handle_hits.inc();
                Some(handle)
            }
            None => {
                self.metrics.handle_misses.inc();
                None
            }
        }
    }

    /// Account a handle freshly opened by the caller.
    ///
    /// If the caller's instance is full, its least recently released idle
    /// handle (of any table) is closed to make room.
    pub fn register_handle(
        &self,
        descriptor: &Arc<Descriptor<E>>,
        engine_handle: E::Handle,
        ctx: &Arc<ExecContext>,
    ) -> TableHandle<E> {
        let (index, _) = self.sharding.instance_for(ctx);
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed) + 1;
        let meta = Arc::new(HandleMeta::new(id, index, Some(Arc::clone(ctx))));

        {
            let mut state = descriptor.state.lock();
            descriptor.wait_for_pins(&mut state);
            state.all_handles.insert(id, Arc::clone(&meta));
        }

        let capacity = self.options.load().handle_cache_size;
        let victim = {
            let mut instance = self.instances[index].state.lock();
            let victim = if instance.count >= capacity {
                instance.pop_lru()
            } else {
                None
            };
            match &victim {
                Some(victim) => victim.meta.set_in_use_by(Some(Arc::clone(ctx))),
                None => instance.count += 1,
            }
            victim
        };

        if let Some(victim) = victim {
            self.metrics.handle_overflows.inc();
            tracing::trace!(
                table = %victim.descriptor().identity(),
                handle = victim.id(),
                instance = index,
                "evicting idle handle"
            );
            self.close_handle(victim);
        }

        self.metrics.handles_registered.inc();
        TableHandle::new(Arc::clone(descriptor), engine_handle, meta)
    }

    /// Reuse an idle handle or open and register a new one.
    pub fn open_handle(
        &self,
        descriptor: &Arc<Descriptor<E>>,
        ctx: &Arc<ExecContext>,
    ) -> Result<TableHandle<E>> {
        if let Some(handle) = self.acquire_handle(descriptor, ctx) {
            return Ok(handle);
        }

        let definition = descriptor.definition().ok_or_else(|| {
            Error::internal(format!("{} has no definition", descriptor.identity()))
        })?;
        let engine_handle = self
            .engine
            .open_handle(&definition, descriptor.identity())?;
        Ok(self.register_handle(descriptor, engine_handle, ctx))
    }

    /// Return a handle to the cache.
    ///
    /// The handle is closed instead of pooled if it needs a reopen, its
    /// descriptor is flushed or being flushed, or its instance is over
    /// capacity.
    pub fn release_handle(&self, handle: TableHandle<E>) -> ReleaseOutcome {
        let index = handle.instance();
        let capacity = self.options.load().handle_cache_size;
        let mut instance = self.instances[index].state.lock();

        let descriptor = handle.descriptor();
        if handle.needs_reopen()
            || descriptor.is_flushed()
            || descriptor.is_draining()
            || instance.count > capacity
        {
            assert!(instance.count > 0, "handle count underflow in instance {}", index);
            instance.count -= 1;
            drop(instance);
            self.close_handle(handle);
            return ReleaseOutcome::Closed;
        }

        handle.meta.set_in_use_by(None);
        instance.push_idle(handle);
        ReleaseOutcome::Pooled
    }

    /// Close a handle that is no longer accounted and unregister it.
    fn close_handle(&self, handle: TableHandle<E>) {
        let (descriptor, engine_handle, meta) = handle.into_parts();
        self.engine.close_handle(engine_handle);
        self.metrics.handles_closed.inc();

        {
            let mut state = descriptor.state.lock();
            descriptor.wait_for_pins(&mut state);
            state.all_handles.remove(&meta.id());
        }
        descriptor.released.notify_all();
    }

    /// Close handles already unregistered from their descriptor.
    fn close_engine_handles(&self, handles: Vec<TableHandle<E>>) {
        for handle in handles {
            let (_, engine_handle, _) = handle.into_parts();
            self.engine.close_handle(engine_handle);
            self.metrics.handles_closed.inc();
        }
    }

    /// Pull every idle handle of `descriptor` out of the instances and
    /// unregister it. The caller closes them once the element lock is gone.
    fn take_idle_handles(
        &self,
        descriptor: &Descriptor<E>,
        state: &mut MutexGuard<'_, DescriptorState>,
    ) -> Vec<TableHandle<E>> {
        descriptor.wait_for_pins(state);

        let mut purged = Vec::new();
        for (index, instance) in self
            .instances
            .iter()
            .enumerate()
            .take(self.sharding.active())
        {
            let mut instance = instance.state.lock();
            let taken = instance.take_descriptor(descriptor.id());
            assert!(
                instance.count >= taken.len(),
                "handle count underflow in instance {}",
                index
            );
            instance.count -= taken.len();
            purged.extend(taken);
        }

        for handle in &purged {
            state.all_handles.remove(&handle.id());
        }
        purged
    }

    // =========================================================================
    // Flush and removal
    // =========================================================================

    /// Close every idle handle of `descriptor` and wait until no context
    /// other than `ctx` uses one.
    ///
    /// The caller must keep other contexts from acquiring new handles of
    /// the table meanwhile; the wait has no timeout.
    pub fn flush(&self, ctx: &Arc<ExecContext>, descriptor: &Arc<Descriptor<E>>, mark_flushed: bool) {
        if mark_flushed {
            descriptor.mark_flushed();
        }
        descriptor.begin_drain();
        self.purge_descriptor_handles(descriptor);

        let start = Instant::now();
        {
            let mut state = descriptor.state.lock();
            descriptor.wait_until(&mut state, |s| s.only_used_by(ctx));
        }
        descriptor.end_drain();
        self.metrics.flush_wait_latency.observe_since(start);

        tracing::debug!(
            table = %descriptor.identity(),
            mark_flushed,
            "flushed table"
        );
    }

    /// Drop a table from the cache, waiting for all other users.
    pub fn remove_descriptor(&self, ctx: &Arc<ExecContext>, identity: &TableIdentity) -> bool {
        self.remove_descriptor_with(ctx, identity, RemoveMode::All)
    }

    /// Drop or invalidate a table. Returns false if it was not cached.
    ///
    /// A descriptor without users is deleted right away whatever the mode.
    pub fn remove_descriptor_with(
        &self,
        ctx: &Arc<ExecContext>,
        identity: &TableIdentity,
        mode: RemoveMode,
    ) -> bool {
        let descriptor = match self.store.get(identity) {
            Some(descriptor) => descriptor,
            None => return false,
        };

        // Wait out a load in progress before touching the unused list.
        if descriptor.state.lock().phase != Phase::Ready {
            return false;
        }

        let mut unused = self.unused.lock();
        let mut state = descriptor.state.lock();
        if state.phase != Phase::Ready {
            return false;
        }

        if state.ref_count == 0 {
            if let Some(link) = state.unused_link.take() {
                unused.remove(link);
            }
            drop(unused);
            self.delete_descriptor(&descriptor, state);
            return true;
        }
        drop(unused);

        state.ref_count += 1;
        match mode {
            RemoveMode::NotOwnKeepShare => descriptor.begin_drain(),
            _ => descriptor.mark_flushed(),
        }
        let purged = self.take_idle_handles(&descriptor, &mut state);
        drop(state);
        self.close_engine_handles(purged);

        let start = Instant::now();
        match mode {
            RemoveMode::All => {
                let mut state = descriptor.state.lock();
                descriptor.wait_until(&mut state, |s| {
                    s.ref_count == 1 && s.all_handles.is_empty()
                });
            }
            RemoveMode::NotOwn | RemoveMode::NotOwnKeepShare => {
                let mut state = descriptor.state.lock();
                descriptor.wait_until(&mut state, |s| s.only_used_by(ctx));
            }
            RemoveMode::Unused => {}
        }
        if mode != RemoveMode::Unused {
            self.metrics.flush_wait_latency.observe_since(start);
        }
        if mode == RemoveMode::NotOwnKeepShare {
            descriptor.end_drain();
        }

        tracing::debug!(table = %identity, ?mode, "removed table from cache");
        self.release_descriptor(descriptor);
        true
    }

    /// Wait until a flushed descriptor of `identity` is gone.
    ///
    /// Returns immediately if the table is not cached or not flushed.
    /// The wait takes part in deadlock detection: the waiter waits for every
    /// context using a handle of the table. Fails with
    /// [`Error::Deadlock`] if `ctx` is chosen as victim and
    /// [`Error::LockWaitTimeout`] after `timeout`.
    pub fn wait_for_old_version(
        &self,
        ctx: &Arc<ExecContext>,
        identity: &TableIdentity,
        timeout: Duration,
        deadlock_weight: u32,
    ) -> Result<()> {
        let descriptor = match self.store.get(identity) {
            Some(descriptor) => descriptor,
            None => return Ok(()),
        };
        let deadline = Instant::now() + timeout;

        {
            let mut state = descriptor.state.lock();
            if state.phase != Phase::Ready || !descriptor.is_flushed() {
                return Ok(());
            }
            ctx.reset_wait_status();
            state.flush_waiters.push(Arc::clone(ctx));
        }

        ctx.will_wait_for(Arc::new(FlushTicket {
            ctx: Arc::clone(ctx),
            descriptor: Arc::clone(&descriptor),
            weight: deadlock_weight,
        }));
        ctx.find_deadlock();
        let status = ctx.timed_wait(deadline);
        ctx.done_waiting_for();

        descriptor
            .state
            .lock()
            .flush_waiters
            .retain(|waiter| !Arc::ptr_eq(waiter, ctx));
        descriptor.released.notify_all();

        match status {
            WaitStatus::Granted => Ok(()),
            WaitStatus::Victim => {
                self.metrics.deadlocks.inc();
                tracing::debug!(table = %identity, ctx = ctx.id(), "deadlock waiting for flush");
                Err(Error::Deadlock(identity.to_string()))
            }
            WaitStatus::Timeout => {
                self.metrics.lock_wait_timeouts.inc();
                Err(Error::LockWaitTimeout(identity.to_string()))
            }
            WaitStatus::Idle | WaitStatus::Waiting => Err(Error::internal(format!(
                "wait for flush of {} ended in state {:?}",
                identity, status
            ))),
        }
    }

    // =========================================================================
    // Purging
    // =========================================================================

    /// Delete least recently used unused descriptors until at most `target`
    /// descriptors are cached or none is unused. Returns the number deleted.
    pub fn purge_descriptors(&self, target: usize) -> usize {
        let mut deleted = 0;
        while self.store.len() > target {
            let mut unused = self.unused.lock();
            let descriptor = match unused.pop_front() {
                Some(descriptor) => descriptor,
                None => break,
            };
            let mut state = descriptor.state.lock();
            state.unused_link = None;
            if state.ref_count > 0 {
                continue;
            }
            drop(unused);
            self.delete_descriptor(&descriptor, state);
            deleted += 1;
        }
        deleted
    }

    /// Close least recently released idle handles until every instance
    /// accounts at most `target` handles. Returns the number closed.
    pub fn purge_handles(&self, target: usize) -> usize {
        let mut evicted = Vec::new();
        for instance in &self.instances {
            let mut instance = instance.state.lock();
            while instance.count > target {
                match instance.pop_lru() {
                    Some(handle) => {
                        instance.count -= 1;
                        evicted.push(handle);
                    }
                    None => break,
                }
            }
        }

        let closed = evicted.len();
        for handle in evicted {
            self.close_handle(handle);
        }
        closed
    }

    /// Shrink both levels to the given sizes.
    pub fn purge(&self, target_descriptors: usize, target_handles: usize) {
        let handles = self.purge_handles(target_handles);
        let descriptors = self.purge_descriptors(target_descriptors);
        if handles > 0 || descriptors > 0 {
            tracing::debug!(handles, descriptors, "purged table cache");
        }
    }

    /// Close every idle handle of one descriptor. Returns the number closed.
    pub fn purge_descriptor_handles(&self, descriptor: &Arc<Descriptor<E>>) -> usize {
        let purged = {
            let mut state = descriptor.state.lock();
            self.take_idle_handles(descriptor, &mut state)
        };
        let closed = purged.len();
        self.close_engine_handles(purged);
        closed
    }

    /// Close every idle handle.
    ///
    /// With `mark_flushed`, every cached descriptor is also invalidated,
    /// the refresh version is bumped and unused descriptors are deleted.
    pub fn purge_all_handles(&self, mark_flushed: bool) -> usize {
        if mark_flushed {
            for descriptor in self.store.snapshot() {
                descriptor.mark_flushed();
            }
            self.increment_refresh_version();
        }

        let mut purged = Vec::new();
        for instance in &self.instances {
            let mut instance = instance.state.lock();
            let taken = instance.take_all();
            instance.count -= taken.len();
            purged.extend(taken);
        }

        let closed = purged.len();
        for handle in purged {
            self.close_handle(handle);
        }
        if mark_flushed {
            self.purge_descriptors(0);
        }

        tracing::info!(closed, mark_flushed, "closed idle table handles");
        closed
    }

    /// Drop both cache sizes to zero and drain idle entries.
    ///
    /// Handles still in use are closed as they are released.
    pub fn start_shutdown(&self) {
        let mut next = (*self.options.load_full()).clone();
        next.descriptor_cache_size = 0;
        next.handle_cache_size = 0;
        self.options.store(Arc::new(next));

        tracing::info!("table cache shutting down");
        self.purge(0, 0);
    }

    /// Change live settings. Sizes may change; the instance count and the
    /// contention constants may not.
    pub fn update_options<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CacheOptions),
    {
        let current = self.options.load_full();
        let mut next = (*current).clone();
        f(&mut next);
        current.check_live_update(&next)?;

        let (descriptors, handles) = (next.descriptor_cache_size, next.handle_cache_size);
        self.options.store(Arc::new(next));
        tracing::info!(
            descriptor_cache_size = descriptors,
            handle_cache_size = handles,
            "table cache resized"
        );
        self.purge(descriptors, handles);
        Ok(())
    }

    // =========================================================================
    // Versions and diagnostics
    // =========================================================================

    /// Current refresh version.
    pub fn refresh_version(&self) -> u64 {
        self.refresh_version.load(Ordering::SeqCst)
    }

    /// Bump the refresh version. Returns the new value.
    pub fn increment_refresh_version(&self) -> u64 {
        let version = self.refresh_version.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(version, "incremented refresh version");
        version
    }

    /// Number of cached descriptors.
    pub fn descriptor_count(&self) -> usize {
        self.store.len()
    }

    /// Number of descriptors on the unused list.
    pub fn unused_count(&self) -> usize {
        self.unused.lock().len()
    }

    /// Handles accounted by all instances, idle and in use.
    pub fn handle_count(&self) -> usize {
        self.instances.iter().map(|i| i.state.lock().count).sum()
    }

    /// Handles accounted by one instance.
    pub fn instance_handle_count(&self, index: usize) -> usize {
        self.instances
            .get(index)
            .map_or(0, |instance| instance.state.lock().count)
    }

    /// Idle handle ids of one instance, next eviction victim first.
    pub fn idle_handles(&self, index: usize) -> Vec<u64> {
        self.instances
            .get(index)
            .map_or_else(Vec::new, |instance| instance.state.lock().idle_ids())
    }

    /// Number of active accounting instances.
    pub fn active_instances(&self) -> usize {
        self.sharding.active()
    }

    /// Maximum number of accounting instances.
    pub fn max_instances(&self) -> usize {
        self.sharding.max()
    }

    /// Snapshot of every loaded descriptor, in identity order.
    pub fn list_descriptors(&self) -> Vec<DescriptorInfo> {
        self.store
            .snapshot()
            .into_iter()
            .filter_map(|descriptor| {
                let _pin = descriptor.pin();
                let state = descriptor.state.lock();
                if state.phase != Phase::Ready {
                    return None;
                }
                Some(DescriptorInfo {
                    identity: descriptor.identity().clone(),
                    version: descriptor.version(),
                    ref_count: state.ref_count,
                    handles: state.all_handles.len(),
                    idle_handles: state
                        .all_handles
                        .values()
                        .filter(|meta| meta.in_use_by().is_none())
                        .count(),
                    flushed: descriptor.is_flushed(),
                    unused: state.unused_link.is_some(),
                })
            })
            .collect()
    }

    /// Check the cache's structural invariants.
    ///
    /// Only meaningful while no operation is in flight.
    pub fn verify_invariants(&self) -> Result<()> {
        let descriptors = self.store.snapshot();

        {
            let unused = self.unused.lock();
            let mut linked = 0;
            for descriptor in &descriptors {
                let state = descriptor.state.lock();
                if state.phase != Phase::Ready {
                    continue;
                }
                let listed = state
                    .unused_link
                    .and_then(|link| unused.get(link))
                    .map_or(false, |entry| Arc::ptr_eq(entry, descriptor));
                if (state.ref_count == 0) != listed {
                    return Err(Error::internal(format!(
                        "{} has ref_count {} but unused-list membership is {}",
                        descriptor.identity(),
                        state.ref_count,
                        listed
                    )));
                }
                if listed {
                    linked += 1;
                }
            }
            if linked != unused.len() {
                return Err(Error::internal(format!(
                    "unused list holds {} descriptors, {} are linked",
                    unused.len(),
                    linked
                )));
            }
        }

        let mut idle = HashSet::new();
        for (index, instance) in self.instances.iter().enumerate() {
            let instance = instance.state.lock();
            instance
                .check()
                .map_err(|reason| Error::internal(format!("instance {}: {}", index, reason)))?;
            idle.extend(instance.idle_ids());
        }

        for descriptor in &descriptors {
            let state = descriptor.state.lock();
            for meta in state.all_handles.values() {
                let pooled = idle.contains(&meta.id());
                let owned = meta.in_use_by().is_some();
                if pooled == owned {
                    return Err(Error::internal(format!(
                        "handle {} of {}: pooled={} in_use={}",
                        meta.id(),
                        descriptor.identity(),
                        pooled,
                        owned
                    )));
                }
            }
        }

        Ok(())
    }

    /// Snapshot of sizes and counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            descriptors: self.descriptor_count(),
            unused_descriptors: self.unused_count(),
            handles: self.handle_count(),
            active_instances: self.active_instances(),
            max_instances: self.max_instances(),
            refresh_version: self.refresh_version(),
            descriptor_hit_rate: self.metrics.descriptor_hit_rate(),
            handle_hit_rate: self.metrics.handle_hit_rate(),
            handle_overflows: self.metrics.handle_overflows.get(),
            handles_closed: self.metrics.handles_closed.get(),
            deadlocks: self.metrics.deadlocks.get(),
            lock_wait_timeouts: self.metrics.lock_wait_timeouts.get(),
            flush_wait_mean_us: self.metrics.flush_wait_latency.mean(),
        }
    }

    /// Metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        self.metrics.to_prometheus()
    }
}

impl<E: Engine> Drop for TableCache<E> {
    fn drop(&mut self) {
        for instance in &mut self.instances {
            for handle in instance.state.get_mut().take_all() {
                let (_, engine_handle, _) = handle.into_parts();
                self.engine.close_handle(engine_handle);
            }
        }
    }
}
