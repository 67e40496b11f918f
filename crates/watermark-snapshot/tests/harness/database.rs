//! In-memory source database with a GTID-style executed set.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use watermark_snapshot::{
    ChangeEvent, ChangeOp, ChunkQuery, EventKind, Gtid, OffsetContext, Partition, PositionSet,
    Result, RowKey, SnapshotError, SnapshotRow, SnapshotStore, StreamEvent, TableId,
};

/// Server UUID of the primary.
pub const SOURCE: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

/// One single-row transaction.
#[derive(Debug, Clone)]
pub struct Write {
    pub source: String,
    pub table: TableId,
    pub key: i64,
    /// None deletes the row
    pub value: Option<String>,
}

impl Write {
    pub fn upsert(table: &TableId, key: i64, value: &str) -> Self {
        Self {
            source: SOURCE.to_string(),
            table: table.clone(),
            key,
            value: Some(value.to_string()),
        }
    }

    pub fn delete(table: &TableId, key: i64) -> Self {
        Self {
            source: SOURCE.to_string(),
            table: table.clone(),
            key,
            value: None,
        }
    }

    pub fn from_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }
}

#[derive(Default)]
struct DatabaseState {
    tables: BTreeMap<TableId, BTreeMap<RowKey, Value>>,
    executed: PositionSet,
    next_txn: HashMap<String, u64>,
    last: Option<Gtid>,
    stream: VecDeque<StreamEvent>,
    during_chunk: VecDeque<Vec<Write>>,
    queries: Vec<ChunkQuery>,
    fail_queries: bool,
    commits: usize,
    version: Option<String>,
}

impl DatabaseState {
    fn next_gtid(&mut self, source: &str) -> Gtid {
        let txn = self.next_txn.entry(source.to_string()).or_insert(1);
        let gtid = Gtid::new(source, *txn);
        *txn += 1;
        self.executed = self.executed.with(&gtid);
        self.last = Some(gtid.clone());
        gtid
    }

    fn apply(&mut self, write: Write) {
        let gtid = self.next_gtid(&write.source);
        let key = RowKey::single(write.key);
        let rows = self.tables.entry(write.table.clone()).or_default();

        let (op, after) = match write.value {
            Some(v) => {
                let row = json!({"id": write.key, "value": v});
                let op = if rows.insert(key.clone(), row.clone()).is_some() {
                    ChangeOp::Update
                } else {
                    ChangeOp::Insert
                };
                (op, Some(row))
            }
            None => {
                if rows.remove(&key).is_none() {
                    return;
                }
                (ChangeOp::Delete, None)
            }
        };

        let offset = OffsetContext::at(gtid);
        self.stream.push_back(StreamEvent {
            partition: partition(),
            offset: offset.clone(),
            kind: EventKind::TransactionStarted,
        });
        self.stream.push_back(StreamEvent::change(
            partition(),
            offset.clone(),
            ChangeEvent {
                table: write.table,
                op,
                key,
                after,
            },
        ));
        self.stream.push_back(StreamEvent {
            partition: partition(),
            offset,
            kind: EventKind::TransactionCommitted,
        });
    }
}

fn partition() -> Partition {
    Partition::new("mysql-server-1")
}

/// Shared handle to the in-memory database.
#[derive(Clone, Default)]
pub struct TestDatabase {
    inner: Arc<Mutex<DatabaseState>>,
}

impl TestDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with rows `value-<key>` in one transaction that is
    /// already behind the stream.
    pub fn seed(&self, table: &TableId, keys: impl IntoIterator<Item = i64>) {
        let mut state = self.inner.lock().unwrap();
        state.next_gtid(SOURCE);
        let rows = state.tables.entry(table.clone()).or_default();
        for k in keys {
            rows.insert(
                RowKey::single(k),
                json!({"id": k, "value": format!("value-{}", k)}),
            );
        }
    }

    /// Commit a write; its events are queued on the stream.
    pub fn write(&self, write: Write) {
        self.inner.lock().unwrap().apply(write);
    }

    /// Writes committed while the next chunk query runs, after it has read.
    pub fn during_next_chunk(&self, writes: Vec<Write>) {
        self.inner.lock().unwrap().during_chunk.push_back(writes);
    }

    pub fn take_stream(&self) -> Vec<StreamEvent> {
        self.inner.lock().unwrap().stream.drain(..).collect()
    }

    pub fn stream_len(&self) -> usize {
        self.inner.lock().unwrap().stream.len()
    }

    /// Heartbeat at the latest executed position.
    pub fn heartbeat(&self) -> StreamEvent {
        let state = self.inner.lock().unwrap();
        let offset = state.last.clone().map(OffsetContext::at).unwrap_or_default();
        StreamEvent::heartbeat(partition(), offset)
    }

    pub fn rows(&self, table: &TableId) -> BTreeMap<RowKey, Value> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn executed(&self) -> PositionSet {
        self.inner.lock().unwrap().executed.clone()
    }

    pub fn queries(&self) -> Vec<ChunkQuery> {
        self.inner.lock().unwrap().queries.clone()
    }

    pub fn commits(&self) -> usize {
        self.inner.lock().unwrap().commits
    }

    pub fn fail_queries(&self, fail: bool) {
        self.inner.lock().unwrap().fail_queries = fail;
    }

    /// Override the reported server version (default `8.0.34-log`).
    pub fn set_server_version(&self, version: &str) {
        self.inner.lock().unwrap().version = Some(version.to_string());
    }

    pub fn store(&self) -> TestStore {
        TestStore { db: self.clone() }
    }
}

/// [`SnapshotStore`] over a [`TestDatabase`].
pub struct TestStore {
    db: TestDatabase,
}

#[async_trait]
impl SnapshotStore for TestStore {
    async fn server_version(&mut self) -> Result<String> {
        let state = self.db.inner.lock().unwrap();
        Ok(state
            .version
            .clone()
            .unwrap_or_else(|| "8.0.34-log".to_string()))
    }

    async fn executed_positions(&mut self) -> Result<PositionSet> {
        Ok(self.db.executed())
    }

    async fn begin_read(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.db.inner.lock().unwrap().commits += 1;
        Ok(())
    }

    async fn maximum_key(&mut self, table: &TableId) -> Result<Option<RowKey>> {
        let state = self.db.inner.lock().unwrap();
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.keys().next_back().cloned()))
    }

    async fn range_query(&mut self, query: &ChunkQuery) -> Result<Vec<SnapshotRow>> {
        let mut state = self.db.inner.lock().unwrap();
        if state.fail_queries {
            return Err(SnapshotError::data_access("lost connection to MySQL server"));
        }
        state.queries.push(query.clone());

        let rows: Vec<SnapshotRow> = state
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|(k, _)| query.after.as_ref().map_or(true, |a| *k > a))
                    .filter(|(k, _)| query.up_to.as_ref().map_or(true, |u| *k <= u))
                    .take(query.limit)
                    .map(|(k, v)| SnapshotRow::new(k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let concurrent = state.during_chunk.pop_front();
        if let Some(writes) = concurrent {
            for write in writes {
                state.apply(write);
            }
        }
        Ok(rows)
    }
}
