//! Storage engine collaborator interface.
//!
//! The cache never parses metadata or touches rows itself. It asks an
//! [`Engine`] to decode a table definition, to open a handle on it and
//! to close handles it evicts.
//!
//! [`MemoryEngine`] is a complete in-memory engine backed by a catalog of
//! definitions. It keeps exact open/close accounting, which makes it the
//! engine of choice for tests, benches and demos.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::types::TableIdentity;
use crate::{Error, Result};

/// Storage engine operations consumed by the cache.
pub trait Engine: Send + Sync + 'static {
    /// Parsed, engine-independent table definition.
    type Definition: Send + Sync + 'static;

    /// Open storage-engine instance.
    type Handle: Send + 'static;

    /// Load and parse the table metadata. Called once per cache miss.
    fn decode_definition(&self, identity: &TableIdentity) -> Result<Self::Definition>;

    /// Open a new handle for a table.
    fn open_handle(
        &self,
        definition: &Self::Definition,
        identity: &TableIdentity,
    ) -> Result<Self::Handle>;

    /// Release engine resources. Must not fail for a successfully opened handle.
    fn close_handle(&self, handle: Self::Handle);
}

/// Table definition held by the [`MemoryEngine`] catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    /// Column names in order.
    pub columns: Vec<String>,
    /// Schema version, bumped by [`MemoryEngine::alter_table`].
    pub schema_version: u64,
}

impl TableDefinition {
    /// Create a definition with the given columns.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            schema_version: 1,
        }
    }
}

/// Handle returned by [`MemoryEngine::open_handle`].
#[derive(Debug)]
pub struct MemoryHandle {
    id: u64,
    identity: TableIdentity,
    schema_version: u64,
}

impl MemoryHandle {
    /// Engine-assigned handle number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Table this handle was opened on.
    pub fn identity(&self) -> &TableIdentity {
        &self.identity
    }

    /// Schema version of the definition the handle was opened with.
    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }
}

/// In-memory engine with a mutable catalog.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    catalog: RwLock<HashMap<TableIdentity, TableDefinition>>,
    failing_opens: RwLock<HashSet<TableIdentity>>,
    open_handles: Mutex<HashSet<u64>>,
    close_log: Mutex<Vec<u64>>,
    next_handle: AtomicU64,
    decodes: AtomicU64,
    opens: AtomicU64,
}

impl MemoryEngine {
    /// Create an engine with an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table in the catalog.
    pub fn create_table(&self, identity: TableIdentity, definition: TableDefinition) {
        self.catalog.write().insert(identity, definition);
    }

    /// Bump the schema version of a table. Returns false if it does not exist.
    pub fn alter_table(&self, identity: &TableIdentity) -> bool {
        match self.catalog.write().get_mut(identity) {
            Some(def) => {
                def.schema_version += 1;
                true
            }
            None => false,
        }
    }

    /// Remove a table from the catalog.
    pub fn drop_table(&self, identity: &TableIdentity) -> bool {
        self.catalog.write().remove(identity).is_some()
    }

    /// Make every subsequent open of `identity` fail (or succeed again).
    pub fn set_open_failure(&self, identity: &TableIdentity, fail: bool) {
        let mut failing = self.failing_opens.write();
        if fail {
            failing.insert(identity.clone());
        } else {
            failing.remove(identity);
        }
    }

    /// Number of definitions decoded so far.
    pub fn decode_count(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    /// Number of handles opened so far.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Number of handles currently open.
    pub fn live_handles(&self) -> usize {
        self.open_handles.lock().len()
    }

    /// Handle ids in the order they were closed.
    pub fn closed_handles(&self) -> Vec<u64> {
        self.close_log.lock().clone()
    }
}

impl Engine for MemoryEngine {
    type Definition = TableDefinition;
    type Handle = MemoryHandle;

    fn decode_definition(&self, identity: &TableIdentity) -> Result<TableDefinition> {
        self.decodes.fetch_add(1, Ordering::Relaxed);
        self.catalog
            .read()
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::decode(identity, "table does not exist"))
    }

    fn open_handle(
        &self,
        definition: &TableDefinition,
        identity: &TableIdentity,
    ) -> Result<MemoryHandle> {
        if self.failing_opens.read().contains(identity) {
            return Err(Error::open(identity, "engine refused to open table"));
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.opens.fetch_add(1, Ordering::Relaxed);
        self.open_handles.lock().insert(id);

        Ok(MemoryHandle {
            id,
            identity: identity.clone(),
            schema_version: definition.schema_version,
        })
    }

    fn close_handle(&self, handle: MemoryHandle) {
        let was_open = self.open_handles.lock().remove(&handle.id);
        assert!(was_open, "handle {} closed twice", handle.id);
        self.close_log.lock().push(handle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_engine_decode() {
        let engine = MemoryEngine::new();
        let id = TableIdentity::new("db", "t1");

        assert!(matches!(
            engine.decode_definition(&id),
            Err(Error::Decode { .. })
        ));

        engine.create_table(id.clone(), TableDefinition::new(["a", "b"]));
        let def = engine.decode_definition(&id).unwrap();
        assert_eq!(def.columns, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(engine.decode_count(), 2);
    }

    #[test]
    fn test_memory_engine_open_close() {
        let engine = MemoryEngine::new();
        let id = TableIdentity::new("db", "t1");
        let def = TableDefinition::new(["a"]);

        let h1 = engine.open_handle(&def, &id).unwrap();
        let h2 = engine.open_handle(&def, &id).unwrap();
        assert_eq!(engine.live_handles(), 2);
        assert_eq!(h1.identity(), &id);

        let (id1, id2) = (h1.id(), h2.id());
        engine.close_handle(h2);
        engine.close_handle(h1);
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(engine.closed_handles(), vec![id2, id1]);
    }

    #[test]
    fn test_memory_engine_open_failure() {
        let engine = MemoryEngine::new();
        let id = TableIdentity::new("db", "t1");
        let def = TableDefinition::new(["a"]);

        engine.set_open_failure(&id, true);
        assert!(matches!(engine.open_handle(&def, &id), Err(Error::Open { .. })));

        engine.set_open_failure(&id, false);
        assert!(engine.open_handle(&def, &id).is_ok());
    }

    #[test]
    fn test_memory_engine_alter() {
        let engine = MemoryEngine::new();
        let id = TableIdentity::new("db", "t1");
        engine.create_table(id.clone(), TableDefinition::new(["a"]));

        assert!(engine.alter_table(&id));
        assert_eq!(engine.decode_definition(&id).unwrap().schema_version, 2);
        assert!(engine.drop_table(&id));
        assert!(!engine.alter_table(&id));
    }
}
