//! Traits for the snapshot's collaborators
//!
//! The coordinator never talks to a database or a transport directly. It
//! reads through a [`SnapshotStore`] and writes through an [`EventSink`].

use crate::common::{
    OffsetContext, Partition, PositionSet, Result, RowKey, SinkRecord, SnapshotRow, TableId,
};
use async_trait::async_trait;

/// Ordered range query for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkQuery {
    /// Table to read
    pub table: TableId,
    /// Exclusive lower bound (None for the first chunk)
    pub after: Option<RowKey>,
    /// Inclusive upper bound: the table's maximum key when its snapshot started
    pub up_to: Option<RowKey>,
    /// Maximum number of rows
    pub limit: usize,
    /// Additional filter requested with the snapshot command
    pub condition: Option<String>,
}

/// Read-only access to the source data store.
///
/// Implementations must order `range_query` results by primary key. Any
/// failure is fatal to the current snapshot run and should be reported as
/// [`SnapshotError::DataAccess`](crate::common::SnapshotError::DataAccess).
#[async_trait]
pub trait SnapshotStore: Send {
    /// Server version string as reported by the store (`SELECT VERSION()`).
    async fn server_version(&mut self) -> Result<String>;

    /// Transactions executed so far (`SHOW MASTER STATUS` on MySQL).
    ///
    /// Stores that cannot report executed sets fail with
    /// [`SnapshotError::UnsupportedVersion`](crate::common::SnapshotError::UnsupportedVersion).
    async fn executed_positions(&mut self) -> Result<PositionSet>;

    /// Start the read transaction chunk queries run in.
    async fn begin_read(&mut self) -> Result<()>;

    /// Commit the read transaction so the next query sees every write
    /// already reflected in the last captured position set.
    async fn commit(&mut self) -> Result<()>;

    /// Largest primary key currently in the table (None when empty).
    async fn maximum_key(&mut self, table: &TableId) -> Result<Option<RowKey>>;

    /// Rows of one chunk, ascending by key.
    async fn range_query(&mut self, query: &ChunkQuery) -> Result<Vec<SnapshotRow>>;
}

/// Destination for snapshot rows and passed-through changes.
///
/// Calls arrive in output order and must be delivered in that order.
#[async_trait]
pub trait EventSink: Send {
    async fn emit(
        &mut self,
        partition: &Partition,
        table: &TableId,
        record: SinkRecord,
        offset: &OffsetContext,
    ) -> Result<()>;
}
