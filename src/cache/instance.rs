//! Handle accounting instances.
//!
//! Each instance owns a handle capacity and the idle handles sharded to it.
//! Idle handles are kept twice:
//!
//! - per descriptor, in a pool popped from the back (most recently
//!   released handle is reused first)
//! - in one instance-wide list ordered by release time, popped from the
//!   front to pick eviction victims across all descriptors
//!
//! Both lists live under the same mutex, so a handle is always in both or
//! in neither.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};

use crate::engine::Engine;

use super::handle::TableHandle;
use super::lru::{Link, LruList};
use super::sharding::{ContentionSample, ShardController};

/// Entry of the instance-wide release order.
#[derive(Debug, Clone, Copy)]
struct IdleKey {
    descriptor: u64,
    slot: Link,
}

/// Handle parked in a descriptor pool.
struct PooledHandle<E: Engine> {
    handle: TableHandle<E>,
    order: Option<Link>,
}

/// State protected by the instance lock.
pub(crate) struct InstanceState<E: Engine> {
    idle_order: LruList<IdleKey>,
    pools: HashMap<u64, LruList<PooledHandle<E>>>,
    /// Handles accounted to this instance, idle and in use.
    pub(crate) count: usize,
    pub(crate) contention: ContentionSample,
}

impl<E: Engine> InstanceState<E> {
    fn new() -> Self {
        Self {
            idle_order: LruList::new(),
            pools: HashMap::new(),
            count: 0,
            contention: ContentionSample::default(),
        }
    }

    /// Park an idle handle.
    pub(crate) fn push_idle(&mut self, handle: TableHandle<E>) {
        let descriptor = handle.descriptor.id();
        let pool = self.pools.entry(descriptor).or_default();
        let slot = pool.push_back(PooledHandle {
            handle,
            order: None,
        });
        let order = self.idle_order.push_back(IdleKey { descriptor, slot });
        if let Some(pooled) = pool.get_mut(slot) {
            pooled.order = Some(order);
        }
    }

    /// Take the most recently released idle handle of a descriptor.
    pub(crate) fn pop_idle(&mut self, descriptor: u64) -> Option<TableHandle<E>> {
        let pool = self.pools.get_mut(&descriptor)?;
        let pooled = pool.pop_back()?;
        if pool.is_empty() {
            self.pools.remove(&descriptor);
        }
        if let Some(order) = pooled.order {
            self.idle_order.remove(order);
        }
        Some(pooled.handle)
    }

    /// Take the least recently released idle handle of any descriptor.
    pub(crate) fn pop_lru(&mut self) -> Option<TableHandle<E>> {
        while let Some(key) = self.idle_order.pop_front() {
            let pool = match self.pools.get_mut(&key.descriptor) {
                Some(pool) => pool,
                None => continue,
            };
            let pooled = pool.remove(key.slot);
            if pool.is_empty() {
                self.pools.remove(&key.descriptor);
            }
            if let Some(pooled) = pooled {
                return Some(pooled.handle);
            }
        }
        None
    }

    /// Take every idle handle of a descriptor.
    pub(crate) fn take_descriptor(&mut self, descriptor: u64) -> Vec<TableHandle<E>> {
        let mut pool = match self.pools.remove(&descriptor) {
            Some(pool) => pool,
            None => return Vec::new(),
        };
        pool.drain()
            .into_iter()
            .map(|pooled| {
                if let Some(order) = pooled.order {
                    self.idle_order.remove(order);
                }
                pooled.handle
            })
            .collect()
    }

    /// Take every idle handle.
    pub(crate) fn take_all(&mut self) -> Vec<TableHandle<E>> {
        self.idle_order.drain();
        self.pools
            .drain()
            .flat_map(|(_, mut pool)| pool.drain())
            .map(|pooled| pooled.handle)
            .collect()
    }

    /// Number of idle handles.
    pub(crate) fn idle_len(&self) -> usize {
        self.idle_order.len()
    }

    /// Idle handle ids, least recently released first.
    pub(crate) fn idle_ids(&self) -> Vec<u64> {
        self.idle_order
            .iter()
            .filter_map(|key| {
                self.pools
                    .get(&key.descriptor)
                    .and_then(|pool| pool.get(key.slot))
                    .map(|pooled| pooled.handle.id())
            })
            .collect()
    }

    /// Idle handles that break the pool/order bookkeeping.
    pub(crate) fn check(&self) -> Result<(), String> {
        let pooled: usize = self.pools.values().map(LruList::len).sum();
        if pooled != self.idle_len() {
            return Err(format!(
                "{} pooled handles but {} in release order",
                pooled,
                self.idle_len()
            ));
        }
        if self.idle_ids().len() != pooled {
            return Err("release order points at missing pool entries".into());
        }
        if pooled > self.count {
            return Err(format!("{} idle handles but count is {}", pooled, self.count));
        }
        for pool in self.pools.values() {
            for entry in pool.iter() {
                if entry.handle.in_use_by().is_some() {
                    return Err(format!("idle handle {} has an owner", entry.handle.id()));
                }
            }
        }
        Ok(())
    }
}

/// One accounting instance.
pub(crate) struct CacheInstance<E: Engine> {
    pub(crate) state: Mutex<InstanceState<E>>,
}

impl<E: Engine> CacheInstance<E> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(InstanceState::new()),
        }
    }

    /// Lock the instance, recording whether the acquisition had to block.
    ///
    /// Returns the new active count if this acquisition activated an
    /// instance.
    pub(crate) fn lock_and_check_contention(
        &self,
        sharding: &ShardController,
        index: usize,
        observed_active: usize,
    ) -> (MutexGuard<'_, InstanceState<E>>, Option<usize>) {
        let (mut guard, stalled) = match self.state.try_lock() {
            Some(guard) => (guard, false),
            None => (self.state.lock(), true),
        };
        let contention = &mut guard.contention;
        let activated = sharding.record(contention, index, observed_active, stalled);
        (guard, activated)
    }
}
