//! Window buffer
//!
//! Rows of the chunk currently being snapshotted, keyed by primary key and
//! kept in the order the range query returned them. Live changes for a
//! buffered key remove the row; whatever is left when the window closes is
//! emitted as snapshot reads.

use crate::common::{RowKey, SnapshotRow};
use indexmap::IndexMap;
use tracing::debug;

/// Insertion-ordered buffer of snapshot rows.
#[derive(Debug, Default)]
pub struct WindowBuffer {
    rows: IndexMap<RowKey, SnapshotRow>,
}

impl WindowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a row read by the current chunk.
    pub fn insert(&mut self, row: SnapshotRow) {
        self.rows.insert(row.key.clone(), row);
    }

    /// Drop the buffered row for `key`, if any.
    ///
    /// Returns true if a row was removed.
    pub fn deduplicate(&mut self, key: &RowKey) -> bool {
        if self.rows.shift_remove(key).is_some() {
            debug!(key = %key, "Removed superseded row from window");
            true
        } else {
            false
        }
    }

    /// Key of the last buffered row.
    pub fn last_key(&self) -> Option<&RowKey> {
        self.rows.last().map(|(k, _)| k)
    }

    /// Remove and return every row, in buffer order.
    pub fn drain(&mut self) -> Vec<SnapshotRow> {
        self.rows.drain(..).map(|(_, row)| row).collect()
    }

    /// Discard every row (chunk re-read or stopped table).
    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
