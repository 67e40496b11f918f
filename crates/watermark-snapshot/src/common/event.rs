//! Stream event representation
//!
//! Units delivered by the change stream, in source commit order, plus the
//! row and record types shared with the store and the sink.
//!
//! Every unit carries an [`OffsetContext`] with the position of the
//! transaction it belongs to. Only [`EventKind::DataChange`] units are
//! emitted; the others exist to move the snapshot window forward.

use crate::common::{Gtid, Result, SnapshotError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fully qualified table identifier (`database.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    /// Database (catalog) name
    pub database: String,
    /// Table name
    pub table: String,
}

impl TableId {
    /// Create a new table identifier.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

impl FromStr for TableId {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() => {
                Ok(Self::new(db, table))
            }
            _ => Err(SnapshotError::signal(format!(
                "table identifier '{}' is not of the form database.table",
                s
            ))),
        }
    }
}

/// One component of a primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValue {
    Null,
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(i64::from(v))
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

/// Primary key of a row, compared component by component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(pub Vec<KeyValue>);

impl RowKey {
    /// Single-column key.
    pub fn single(value: impl Into<KeyValue>) -> Self {
        RowKey(vec![value.into()])
    }

    /// Key columns.
    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match v {
                KeyValue::Null => write!(f, "NULL")?,
                KeyValue::Int(n) => write!(f, "{}", n)?,
                KeyValue::Text(s) => write!(f, "'{}'", s)?,
                KeyValue::Bytes(b) => write!(f, "0x{}", hex(b))?,
            }
        }
        write!(f, ")")
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A row returned by a chunk query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Primary key
    pub key: RowKey,
    /// Column values
    pub data: serde_json::Value,
}

impl SnapshotRow {
    /// Create a new row.
    pub fn new(key: RowKey, data: serde_json::Value) -> Self {
        Self { key, data }
    }
}

/// Stream partition the event was read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// Logical server name
    pub server_name: String,
}

impl Partition {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }
}

/// Stream position attached to every unit and every emitted record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetContext {
    /// Position of the transaction in progress (None before the first GTID)
    pub gtid: Option<Gtid>,
    /// Record produced by the incremental snapshot rather than the stream
    #[serde(default)]
    pub incremental_snapshot: bool,
}

impl OffsetContext {
    /// Offset at a known position.
    pub fn at(gtid: Gtid) -> Self {
        Self {
            gtid: Some(gtid),
            incremental_snapshot: false,
        }
    }

    /// Same position, flagged as carrying snapshot records.
    pub fn for_snapshot_records(&self) -> Self {
        Self {
            gtid: self.gtid.clone(),
            incremental_snapshot: true,
        }
    }
}

/// Operation type of an emitted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Row read by the incremental snapshot
    Read,
}

/// A live row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table the row belongs to
    pub table: TableId,
    /// Operation
    pub op: ChangeOp,
    /// Primary key of the changed row
    pub key: RowKey,
    /// Row state after the change (None for deletes)
    pub after: Option<serde_json::Value>,
}

/// Kind of stream unit.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Row change for a captured table
    DataChange(ChangeEvent),
    /// Row change for a table excluded by the capture filter
    Filtered { table: TableId },
    /// Position-only keepalive, never emitted
    Heartbeat,
    /// Transaction begin marker
    TransactionStarted,
    /// Transaction commit marker
    TransactionCommitted,
}

/// A unit of the change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub partition: Partition,
    pub offset: OffsetContext,
    pub kind: EventKind,
}

impl StreamEvent {
    /// Row change event.
    pub fn change(partition: Partition, offset: OffsetContext, change: ChangeEvent) -> Self {
        Self {
            partition,
            offset,
            kind: EventKind::DataChange(change),
        }
    }

    /// Heartbeat at a position.
    pub fn heartbeat(partition: Partition, offset: OffsetContext) -> Self {
        Self {
            partition,
            offset,
            kind: EventKind::Heartbeat,
        }
    }

    /// Position carried by the unit.
    pub fn gtid(&self) -> Option<&Gtid> {
        self.offset.gtid.as_ref()
    }

    /// Short label for logging.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::DataChange(_) => "data_change",
            EventKind::Filtered { .. } => "filtered",
            EventKind::Heartbeat => "heartbeat",
            EventKind::TransactionStarted => "transaction_started",
            EventKind::TransactionCommitted => "transaction_committed",
        }
    }
}

/// Record handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub op: ChangeOp,
    pub key: RowKey,
    pub data: Option<serde_json::Value>,
}

impl SinkRecord {
    /// Snapshot read of a buffered row.
    pub fn read(row: SnapshotRow) -> Self {
        Self {
            op: ChangeOp::Read,
            key: row.key,
            data: Some(row.data),
        }
    }

    /// Pass-through of a live change.
    pub fn change(change: &ChangeEvent) -> Self {
        Self {
            op: change.op,
            key: change.key.clone(),
            data: change.after.clone(),
        }
    }
}
