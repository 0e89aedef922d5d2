//! Lock-free descriptor store.

use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::engine::Engine;
use crate::types::TableIdentity;

use super::descriptor::Descriptor;

/// Concurrent map from table identity to descriptor.
///
/// Lookups never block. Concurrent creators of the same identity collapse
/// onto whichever slot was inserted first; everybody else gets that slot
/// back and waits on its element lock.
pub(crate) struct DescriptorStore<E: Engine> {
    map: SkipMap<TableIdentity, Arc<Descriptor<E>>>,
}

impl<E: Engine> DescriptorStore<E> {
    pub(crate) fn new() -> Self {
        Self {
            map: SkipMap::new(),
        }
    }

    /// Look up a descriptor.
    pub(crate) fn get(&self, identity: &TableIdentity) -> Option<Arc<Descriptor<E>>> {
        self.map.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert `fresh` unless the identity is already present.
    ///
    /// Returns the descriptor now in the store and whether it is `fresh`.
    pub(crate) fn get_or_insert(
        &self,
        fresh: &Arc<Descriptor<E>>,
    ) -> (Arc<Descriptor<E>>, bool) {
        let entry = self
            .map
            .get_or_insert(fresh.identity().clone(), Arc::clone(fresh));
        let current = Arc::clone(entry.value());
        let inserted = Arc::ptr_eq(&current, fresh);
        (current, inserted)
    }

    /// Remove `descriptor` if it is still the entry for its identity.
    pub(crate) fn remove(&self, descriptor: &Arc<Descriptor<E>>) -> bool {
        match self.map.get(descriptor.identity()) {
            Some(entry) if Arc::ptr_eq(entry.value(), descriptor) => entry.remove(),
            _ => false,
        }
    }

    /// Number of descriptors.
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Snapshot of every descriptor, in identity order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Descriptor<E>>> {
        self.map
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
