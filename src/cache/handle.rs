//! Table handles.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::deadlock::ExecContext;
use crate::engine::Engine;

use super::descriptor::Descriptor;

/// Bookkeeping shared between a handle and its descriptor's handle set.
pub(crate) struct HandleMeta {
    id: u64,
    instance: usize,
    /// None iff the handle sits in an idle pool.
    in_use_by: ArcSwapOption<ExecContext>,
}

impl HandleMeta {
    pub(crate) fn new(id: u64, instance: usize, owner: Option<Arc<ExecContext>>) -> Self {
        Self {
            id,
            instance,
            in_use_by: ArcSwapOption::new(owner),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn instance(&self) -> usize {
        self.instance
    }

    pub(crate) fn in_use_by(&self) -> Option<Arc<ExecContext>> {
        self.in_use_by.load_full()
    }

    pub(crate) fn set_in_use_by(&self, owner: Option<Arc<ExecContext>>) {
        self.in_use_by.store(owner);
    }

    pub(crate) fn is_used_by(&self, ctx: &Arc<ExecContext>) -> bool {
        let owner = self.in_use_by.load();
        match &*owner {
            Some(owner) => Arc::ptr_eq(owner, ctx),
            None => false,
        }
    }
}

impl fmt::Debug for HandleMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleMeta")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("in_use_by", &self.in_use_by().map(|ctx| ctx.id()))
            .finish()
    }
}

/// An open table instance.
///
/// Obtained from [`TableCache::acquire_handle`](crate::TableCache::acquire_handle),
/// [`TableCache::register_handle`](crate::TableCache::register_handle) or
/// [`TableCache::open_handle`](crate::TableCache::open_handle) and given back
/// with [`TableCache::release_handle`](crate::TableCache::release_handle).
/// A handle that is dropped instead of released stays registered with its
/// descriptor and blocks flushes of that table.
pub struct TableHandle<E: Engine> {
    pub(crate) descriptor: Arc<Descriptor<E>>,
    pub(crate) engine_handle: E::Handle,
    pub(crate) meta: Arc<HandleMeta>,
    needs_reopen: bool,
}

impl<E: Engine> TableHandle<E> {
    pub(crate) fn new(
        descriptor: Arc<Descriptor<E>>,
        engine_handle: E::Handle,
        meta: Arc<HandleMeta>,
    ) -> Self {
        Self {
            descriptor,
            engine_handle,
            meta,
            needs_reopen: false,
        }
    }

    pub(crate) fn into_parts(self) -> (Arc<Descriptor<E>>, E::Handle, Arc<HandleMeta>) {
        (self.descriptor, self.engine_handle, self.meta)
    }

    /// Cache-assigned handle number.
    pub fn id(&self) -> u64 {
        self.meta.id()
    }

    /// Accounting instance that owns this handle's capacity slot.
    pub fn instance(&self) -> usize {
        self.meta.instance()
    }

    /// The descriptor this handle was opened on.
    pub fn descriptor(&self) -> &Arc<Descriptor<E>> {
        &self.descriptor
    }

    /// The engine instance.
    pub fn engine_handle(&self) -> &E::Handle {
        &self.engine_handle
    }

    /// The engine instance, mutably.
    pub fn engine_handle_mut(&mut self) -> &mut E::Handle {
        &mut self.engine_handle
    }

    /// Context currently using the handle.
    pub fn in_use_by(&self) -> Option<Arc<ExecContext>> {
        self.meta.in_use_by()
    }

    /// Close instead of pooling on the next release.
    pub fn mark_needs_reopen(&mut self) {
        self.needs_reopen = true;
    }

    /// Check if the handle will be closed on release.
    pub fn needs_reopen(&self) -> bool {
        self.needs_reopen
    }
}

impl<E: Engine> fmt::Debug for TableHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableHandle")
            .field("id", &self.id())
            .field("table", self.descriptor.identity())
            .field("instance", &self.instance())
            .field("needs_reopen", &self.needs_reopen)
            .finish()
    }
}

/// What `release_handle` did with a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Returned to the idle pool.
    Pooled,
    /// Closed through the engine.
    Closed,
}
