//! Core types for tablecache.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Identity of a table: database name plus table name.
///
/// Encoded key format (used as the store key and for equality):
/// ```text
/// [db][0x00][table][0x00]
/// ```
///
/// Two identities are equal iff their encoded bytes are equal. Names must
/// not contain NUL bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableIdentity {
    /// Encoded key.
    key: Bytes,
    /// Length of the database name within the key.
    db_len: usize,
}

impl TableIdentity {
    /// Create an identity from database and table names.
    pub fn new(db: &str, table: &str) -> Self {
        debug_assert!(!db.as_bytes().contains(&0) && !table.as_bytes().contains(&0));
        let mut buf = BytesMut::with_capacity(db.len() + table.len() + 2);
        buf.put_slice(db.as_bytes());
        buf.put_u8(0);
        buf.put_slice(table.as_bytes());
        buf.put_u8(0);
        Self {
            key: buf.freeze(),
            db_len: db.len(),
        }
    }

    /// Get the database name.
    pub fn db(&self) -> &str {
        // Built from &str slices, so both halves are valid UTF-8.
        std::str::from_utf8(&self.key[..self.db_len]).unwrap_or_default()
    }

    /// Get the table name.
    pub fn table(&self) -> &str {
        let end = self.key.len() - 1;
        std::str::from_utf8(&self.key[self.db_len + 1..end]).unwrap_or_default()
    }

    /// Get the encoded key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`.`{}`", self.db(), self.table())
    }
}

impl fmt::Debug for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableIdentity({}.{})", self.db(), self.table())
    }
}
