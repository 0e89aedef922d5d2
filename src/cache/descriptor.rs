//! Shared table descriptors.
//!
//! A descriptor holds the decoded definition of one table and is shared by
//! every user of that table. Its mutable state lives behind one mutex (the
//! "element lock"); every change that somebody may be waiting for is
//! followed by a broadcast on `released`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::deadlock::{ExecContext, WaitForGraphVisitor, WaitForSubgraph};
use crate::engine::Engine;
use crate::types::TableIdentity;
use crate::Error;

use super::handle::HandleMeta;
use super::lru::Link;

/// Load state of a descriptor slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Inserted, definition being decoded by the creator.
    Loading,
    /// Definition available.
    Ready,
    /// Decode failed; handed to everyone that waited on the slot.
    Failed(Error),
    /// Removed (or being removed) from the store.
    Deleted,
}

/// State protected by the element lock.
#[derive(Debug)]
pub(crate) struct DescriptorState {
    pub(crate) phase: Phase,
    pub(crate) ref_count: u32,
    /// Every registered handle, idle or in use.
    pub(crate) all_handles: HashMap<u64, Arc<HandleMeta>>,
    /// Traversals in progress. `all_handles` must not change while non-zero.
    pub(crate) pins: u32,
    /// Contexts blocked in `wait_for_old_version`.
    pub(crate) flush_waiters: Vec<Arc<ExecContext>>,
    /// Position in the unused-descriptor list. Changed only while holding
    /// both the unused-list lock and this lock.
    pub(crate) unused_link: Option<Link>,
}

impl DescriptorState {
    /// Check that every remaining handle is in use by `ctx`.
    pub(crate) fn only_used_by(&self, ctx: &Arc<ExecContext>) -> bool {
        self.all_handles.values().all(|meta| meta.is_used_by(ctx))
    }
}

/// Cached definition of one table.
pub struct Descriptor<E: Engine> {
    id: u64,
    identity: TableIdentity,
    version: u64,
    definition: ArcSwapOption<E::Definition>,
    flushed: AtomicBool,
    /// Flushes in progress that do not mark the descriptor flushed. While
    /// non-zero, released handles are closed instead of pooled.
    draining: AtomicUsize,
    pub(crate) state: Mutex<DescriptorState>,
    pub(crate) released: Condvar,
}

impl<E: Engine> Descriptor<E> {
    pub(crate) fn new(id: u64, identity: TableIdentity, version: u64) -> Self {
        Self {
            id,
            identity,
            version,
            definition: ArcSwapOption::empty(),
            flushed: AtomicBool::new(false),
            draining: AtomicUsize::new(0),
            state: Mutex::new(DescriptorState {
                phase: Phase::Loading,
                ref_count: 0,
                all_handles: HashMap::new(),
                pins: 0,
                flush_waiters: Vec::new(),
                unused_link: None,
            }),
            released: Condvar::new(),
        }
    }

    /// Cache-assigned descriptor number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Table this descriptor describes.
    pub fn identity(&self) -> &TableIdentity {
        &self.identity
    }

    /// Refresh version current when the definition was loaded.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The decoded definition. None once the descriptor has been deleted.
    pub fn definition(&self) -> Option<Arc<E::Definition>> {
        self.definition.load_full()
    }

    /// Check if the descriptor was invalidated by a flush.
    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    /// Current number of acquirers.
    pub fn ref_count(&self) -> u32 {
        self.state.lock().ref_count
    }

    /// Number of registered handles, idle or in use.
    pub fn handle_count(&self) -> usize {
        self.state.lock().all_handles.len()
    }

    pub(crate) fn set_definition(&self, definition: Option<Arc<E::Definition>>) {
        self.definition.store(definition);
    }

    pub(crate) fn mark_flushed(&self) {
        self.flushed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn begin_drain(&self) {
        self.draining.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_drain(&self) {
        let prev = self.draining.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "drain count underflow on {}", self.identity);
    }

    /// Block until no traversal holds a pin.
    pub(crate) fn wait_for_pins(&self, state: &mut MutexGuard<'_, DescriptorState>) {
        while state.pins > 0 {
            self.released.wait(state);
        }
    }

    /// Block until `done` holds for the state.
    pub(crate) fn wait_until<F>(&self, state: &mut MutexGuard<'_, DescriptorState>, mut done: F)
    where
        F: FnMut(&DescriptorState) -> bool,
    {
        while !done(&**state) {
            self.released.wait(state);
        }
    }

    /// Keep `all_handles` stable until the guard is dropped.
    pub(crate) fn pin(&self) -> PinGuard<'_, E> {
        self.state.lock().pins += 1;
        PinGuard { descriptor: self }
    }

    /// Walk the wait-for graph from `waiter`, which waits for this
    /// descriptor to go away, through every context using one of its handles.
    pub(crate) fn visit_subgraph(
        &self,
        waiter: &Arc<ExecContext>,
        visitor: &mut dyn WaitForGraphVisitor,
    ) -> bool {
        let _pin = self.pin();
        let owners: Vec<Arc<ExecContext>> = self
            .state
            .lock()
            .all_handles
            .values()
            .filter_map(|meta| meta.in_use_by())
            .collect();

        if visitor.enter_node(waiter) {
            return true;
        }

        let found = owners.iter().any(|owner| visitor.inspect_edge(owner))
            || owners.iter().any(|owner| owner.visit_subgraph(visitor));

        visitor.leave_node(waiter);
        found
    }
}

impl<E: Engine> fmt::Debug for Descriptor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("version", &self.version)
            .field("flushed", &self.is_flushed())
            .finish()
    }
}

/// Pin on a descriptor's handle set.
pub(crate) struct PinGuard<'a, E: Engine> {
    descriptor: &'a Descriptor<E>,
}

impl<E: Engine> Drop for PinGuard<'_, E> {
    fn drop(&mut self) {
        let mut state = self.descriptor.state.lock();
        state.pins -= 1;
        if state.pins == 0 {
            self.descriptor.released.notify_all();
        }
    }
}

/// Edge "ctx waits for `descriptor` to be deleted".
pub(crate) struct FlushTicket<E: Engine> {
    pub(crate) ctx: Arc<ExecContext>,
    pub(crate) descriptor: Arc<Descriptor<E>>,
    pub(crate) weight: u32,
}

impl<E: Engine> WaitForSubgraph for FlushTicket<E> {
    fn accept_visitor(&self, visitor: &mut dyn WaitForGraphVisitor) -> bool {
        self.descriptor.visit_subgraph(&self.ctx, visitor)
    }

    fn deadlock_weight(&self) -> u32 {
        self.weight
    }
}

/// Snapshot of one cached descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub identity: TableIdentity,
    pub version: u64,
    pub ref_count: u32,
    pub handles: usize,
    pub idle_handles: usize,
    pub flushed: bool,
    pub unused: bool,
}
