//! Assertions over recorded sink output.

use super::Emitted;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use watermark_snapshot::{ChangeOp, RowKey, TableId};

pub trait EmittedExt {
    /// Replay the records for `table` into the row set a consumer would hold.
    fn materialize(&self, table: &TableId) -> BTreeMap<RowKey, Value>;

    /// Keys emitted as snapshot reads for `table`, in order.
    fn snapshot_reads(&self, table: &TableId) -> Vec<RowKey>;

    /// Assert no key was emitted as a snapshot read twice.
    fn assert_no_duplicate_reads(&self, table: &TableId);

    /// Assert the replayed output equals `expected`.
    fn assert_matches(&self, table: &TableId, expected: &BTreeMap<RowKey, Value>);
}

impl EmittedExt for [Emitted] {
    fn materialize(&self, table: &TableId) -> BTreeMap<RowKey, Value> {
        let mut rows = BTreeMap::new();
        for e in self.iter().filter(|e| &e.table == table) {
            match (e.record.op, &e.record.data) {
                (ChangeOp::Delete, _) | (_, None) => {
                    rows.remove(&e.record.key);
                }
                (_, Some(data)) => {
                    rows.insert(e.record.key.clone(), data.clone());
                }
            }
        }
        rows
    }

    fn snapshot_reads(&self, table: &TableId) -> Vec<RowKey> {
        self.iter()
            .filter(|e| &e.table == table && e.record.op == ChangeOp::Read)
            .map(|e| e.record.key.clone())
            .collect()
    }

    fn assert_no_duplicate_reads(&self, table: &TableId) {
        let reads = self.snapshot_reads(table);
        let unique: HashSet<_> = reads.iter().collect();
        assert_eq!(
            unique.len(),
            reads.len(),
            "duplicate snapshot reads for {}: {:?}",
            table,
            reads
        );
    }

    fn assert_matches(&self, table: &TableId, expected: &BTreeMap<RowKey, Value>) {
        assert_eq!(&self.materialize(table), expected);
    }
}
