//! # Snapshot Context
//!
//! State of one incremental snapshot run: the tables still to snapshot, the
//! chunk being read, the low/high watermark pair and the window mode.
//!
//! ## Window state machine
//!
//! ```text
//!            low captured          chunk read, high captured
//!  CLOSED ─────────────────▶ (reading) ─────────────────────▶ CLOSED, watermarks set
//!     ▲                                                            │
//!     │ event ∉ high  /  heartbeat ≥ max(high)                     │ event ∉ low
//!     │ (flush buffer, read next chunk)                            ▼
//!     └──────────────────────────────────────────────────────── OPEN (deduplicating)
//! ```
//!
//! Chunk reads run inline on the coordinator, so the "reading" phase is never
//! observed by a stream event. Classification is a pure function of the
//! watermarks ([`Watermarks::transition`]); the context applies its result.
//!
//! Several events can share one transaction id, so a window only closes on an
//! event *outside* the high watermark, never on reaching its last id. Heartbeats
//! are the exception: a heartbeat repeats the id of the latest transaction, so
//! reaching the high watermark's maximum is enough
//! ([`Watermarks::reached_high_watermark`]).
//!
//! The context is serialisable for resume. The window buffer is not part of
//! it; on resume the in-flight chunk is reverted and read again.

use crate::common::{Gtid, PositionSet, Result, RowKey, TableId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};
use uuid::Uuid;

/// Deduplication mode of the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// No active window; events pass straight through
    #[default]
    Closed,
    /// Past the low watermark; live changes remove buffered rows
    Open,
}

/// Effect of classifying one stream position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    /// The position is past the low watermark
    OpenWindow,
    /// Check the event's key against the buffer
    Deduplicate,
    /// The position is past the high watermark: flush the buffer, read the next chunk
    CloseWindow,
}

/// Next mode plus the actions to run, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub mode: WindowMode,
    pub actions: Vec<WindowAction>,
}

impl Transition {
    pub fn closes_window(&self) -> bool {
        self.actions.contains(&WindowAction::CloseWindow)
    }

    pub fn opens_window(&self) -> bool {
        self.actions.contains(&WindowAction::OpenWindow)
    }

    pub fn deduplicates(&self) -> bool {
        self.actions.contains(&WindowAction::Deduplicate)
    }
}

/// Low/high watermark pair of the current chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Executed positions captured before the chunk query
    pub low: Option<PositionSet>,
    /// Positions executed while the chunk query ran
    pub high: Option<PositionSet>,
}

impl Watermarks {
    /// Classify a position against the watermarks.
    ///
    /// A window opens on the first position outside `low` and closes on the
    /// first position outside `high`; both can happen for the same event when
    /// `high` is empty. Units without a position leave the mode unchanged.
    pub fn transition(&self, mode: WindowMode, gtid: Option<&Gtid>) -> Transition {
        let mut next = mode;
        let mut actions = Vec::new();

        if let Some(gtid) = gtid {
            if next == WindowMode::Closed {
                if let Some(low) = &self.low {
                    if !low.contains(gtid) {
                        next = WindowMode::Open;
                        actions.push(WindowAction::OpenWindow);
                    }
                }
            }
            if next == WindowMode::Open {
                if let Some(high) = &self.high {
                    if !high.contains(gtid) {
                        next = WindowMode::Closed;
                        actions.push(WindowAction::CloseWindow);
                    }
                }
            }
        }

        if next == WindowMode::Open {
            actions.push(WindowAction::Deduplicate);
        }

        Transition {
            mode: next,
            actions,
        }
    }

    /// Check if a heartbeat or commit position has reached the end of `high`.
    ///
    /// When `high` is empty nothing was written during the chunk read and the
    /// low watermark's maximum for the position's source is used instead. A
    /// unit without a position counts as reached; one from a source the
    /// relevant set does not know does not.
    pub fn reached_high_watermark(&self, gtid: Option<&Gtid>) -> bool {
        let Some(high) = &self.high else {
            return false;
        };
        let Some(gtid) = gtid else {
            return true;
        };

        let max = if high.is_empty() {
            self.low
                .as_ref()
                .and_then(|low| low.max_transaction_id(&gtid.source))
        } else {
            high.max_transaction_id(&gtid.source)
        };

        match max {
            Some(max) if gtid.transaction_id >= max => {
                debug!(gtid = %gtid, high = %high, "Reached high watermark");
                true
            }
            _ => false,
        }
    }

    /// Check if the high watermark spans more than one source.
    ///
    /// Such a chunk cannot be ordered against a single source's stream and
    /// must be read again.
    pub fn is_ambiguous(&self) -> bool {
        self.high
            .as_ref()
            .is_some_and(|h| h.distinct_source_count() > 1)
    }
}

/// Resume point of the table being snapshotted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Chunks started for the current table
    pub sequence: u64,
    /// Key the current chunk was read after
    pub chunk_start: Option<RowKey>,
    /// Last key read; the next chunk starts after it
    pub chunk_end: Option<RowKey>,
    /// Largest key when the table's snapshot started
    pub maximum_key: Option<RowKey>,
    /// Last key emitted to the sink
    pub last_sent: Option<RowKey>,
}

/// State of one incremental snapshot run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotContext {
    /// Run identifier
    pub snapshot_id: String,
    /// Tables still to snapshot; the front one is current
    tables: VecDeque<TableId>,
    /// Additional filter per table, keyed by `database.table`
    #[serde(default)]
    conditions: BTreeMap<String, String>,
    /// Resume point within the current table
    chunk: ChunkDescriptor,
    #[serde(default)]
    mode: WindowMode,
    #[serde(default)]
    watermarks: Watermarks,
    /// Offset of the last applied control command
    signal_offset: Option<u64>,
    #[serde(default)]
    paused: bool,
    pub started_at: i64,
    pub last_activity: i64,
}

impl Default for SnapshotContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotContext {
    /// Create an idle context.
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            snapshot_id: format!("incr-snap-{}", Uuid::new_v4()),
            tables: VecDeque::new(),
            conditions: BTreeMap::new(),
            chunk: ChunkDescriptor::default(),
            mode: WindowMode::Closed,
            watermarks: Watermarks::default(),
            signal_offset: None,
            paused: false,
            started_at: now,
            last_activity: now,
        }
    }

    /// Check if tables remain to be snapshotted.
    pub fn snapshot_running(&self) -> bool {
        !self.tables.is_empty()
    }

    /// Check if the run is done and no window is pending.
    pub fn is_finished(&self) -> bool {
        !self.snapshot_running()
            && self.mode == WindowMode::Closed
            && self.watermarks.high.is_none()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Table being snapshotted.
    pub fn current_table(&self) -> Option<&TableId> {
        self.tables.front()
    }

    /// Tables still queued, current first.
    pub fn tables(&self) -> impl Iterator<Item = &TableId> {
        self.tables.iter()
    }

    /// Filter condition for the current table.
    pub fn current_condition(&self) -> Option<&str> {
        let table = self.current_table()?;
        self.conditions.get(&table.to_string()).map(String::as_str)
    }

    /// Queue tables; ones already queued are skipped.
    ///
    /// Returns the tables actually added.
    pub fn add_tables(
        &mut self,
        tables: impl IntoIterator<Item = TableId>,
        conditions: &BTreeMap<String, String>,
    ) -> Vec<TableId> {
        let mut added = Vec::new();
        for table in tables {
            if self.tables.contains(&table) {
                debug!(table = %table, "Table already queued for snapshot");
                continue;
            }
            if let Some(cond) = conditions.get(&table.to_string()) {
                self.conditions.insert(table.to_string(), cond.clone());
            }
            self.tables.push_back(table.clone());
            added.push(table);
        }
        self.touch();
        added
    }

    /// Remove tables from the queue.
    ///
    /// Returns true if the current table was among them; the caller then owns
    /// discarding its buffer.
    pub fn remove_tables(&mut self, tables: &[TableId]) -> bool {
        let current = self.current_table().cloned();
        self.tables.retain(|t| !tables.contains(t));
        for t in tables {
            self.conditions.remove(&t.to_string());
        }
        let removed_current = current.is_some_and(|c| tables.contains(&c));
        if removed_current {
            self.chunk = ChunkDescriptor::default();
        }
        self.touch();
        removed_current
    }

    /// Drop every queued table.
    pub fn clear_tables(&mut self) {
        self.tables.clear();
        self.conditions.clear();
        self.chunk = ChunkDescriptor::default();
        self.touch();
    }

    /// Finish the current table and make the next one current.
    pub fn next_table(&mut self) -> Option<TableId> {
        let finished = self.tables.pop_front();
        if let Some(t) = &finished {
            self.conditions.remove(&t.to_string());
        }
        self.chunk = ChunkDescriptor::default();
        self.touch();
        finished
    }

    /// Chunk resume state.
    pub fn chunk(&self) -> &ChunkDescriptor {
        &self.chunk
    }

    /// Mark the start of a chunk read from the current resume key.
    pub fn start_new_chunk(&mut self) {
        self.chunk.chunk_start = self.chunk.chunk_end.clone();
        self.chunk.sequence += 1;
        self.touch();
    }

    /// Record the last key read by a chunk.
    pub fn next_chunk_position(&mut self, key: RowKey) {
        self.chunk.chunk_end = Some(key);
    }

    /// Rewind the resume key to the start of the current chunk.
    pub fn revert_chunk(&mut self) {
        self.chunk.chunk_end = self.chunk.chunk_start.clone();
        self.mode = WindowMode::Closed;
    }

    pub fn maximum_key(&self) -> Option<&RowKey> {
        self.chunk.maximum_key.as_ref()
    }

    pub fn set_maximum_key(&mut self, key: RowKey) {
        self.chunk.maximum_key = Some(key);
    }

    /// Record a key emitted to the sink.
    pub fn record_sent(&mut self, key: RowKey) {
        self.chunk.last_sent = Some(key);
    }

    pub fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }

    pub fn window_mode(&self) -> WindowMode {
        self.mode
    }

    pub fn set_low_watermark(&mut self, low: PositionSet) {
        debug!(low = %low, "Low watermark captured");
        self.watermarks.low = Some(low);
        self.watermarks.high = None;
    }

    /// Set the high watermark to what executed since the low watermark.
    pub fn set_high_watermark(&mut self, executed: PositionSet) {
        let high = match &self.watermarks.low {
            Some(low) => executed.subtract(low),
            None => executed,
        };
        debug!(high = %high, "High watermark captured");
        self.watermarks.high = Some(high);
    }

    /// Classify a stream position and apply the resulting mode.
    pub fn update_window_state(&mut self, gtid: Option<&Gtid>) -> Transition {
        let transition = self.watermarks.transition(self.mode, gtid);
        if transition.opens_window() {
            trace!(gtid = ?gtid, "Passed low watermark, window opened");
        }
        if transition.closes_window() {
            trace!(gtid = ?gtid, "Passed high watermark, window closed");
            self.close_window();
        } else {
            self.mode = transition.mode;
        }
        transition
    }

    /// See [`Watermarks::reached_high_watermark`].
    pub fn reached_high_watermark(&self, gtid: Option<&Gtid>) -> bool {
        self.watermarks.reached_high_watermark(gtid)
    }

    /// Check if live changes must be checked against the buffer.
    pub fn deduplication_needed(&self) -> bool {
        self.mode == WindowMode::Open
    }

    /// End the window; the watermarks are spent.
    pub fn close_window(&mut self) {
        self.mode = WindowMode::Closed;
        self.watermarks = Watermarks::default();
        self.touch();
    }

    /// Check if the high watermark spans more than one source.
    pub fn server_uuid_changed(&self) -> bool {
        self.watermarks.is_ambiguous()
    }

    pub fn signal_offset(&self) -> Option<u64> {
        self.signal_offset
    }

    pub fn set_signal_offset(&mut self, offset: u64) {
        self.signal_offset = Some(offset);
    }

    /// Prepare a restored context: the buffer was not persisted, so the
    /// in-flight chunk is read again with fresh watermarks.
    pub fn prepare_resume(&mut self) {
        self.revert_chunk();
        self.close_window();
    }

    /// Serialize for persistence.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore from persisted JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn touch(&mut self) {
        self.last_activity = chrono::Utc::now().timestamp_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(s: &str) -> PositionSet {
        s.parse().unwrap()
    }

    fn gtid(source: &str, txn: u64) -> Gtid {
        Gtid::new(source, txn)
    }

    fn watermarks(low: &str, high: &str) -> Watermarks {
        Watermarks {
            low: Some(set(low)),
            high: Some(set(high)),
        }
    }

    #[test]
    fn test_event_inside_low_keeps_window_closed() {
        let wm = watermarks("src:1-5", "src:6-7");
        let t = wm.transition(WindowMode::Closed, Some(&gtid("src", 5)));
        assert_eq!(t.mode, WindowMode::Closed);
        assert!(t.actions.is_empty());
    }

    #[test]
    fn test_event_past_low_opens_window() {
        let wm = watermarks("src:1-5", "src:6-7");
        let t = wm.transition(WindowMode::Closed, Some(&gtid("src", 6)));
        assert_eq!(t.mode, WindowMode::Open);
        assert_eq!(
            t.actions,
            vec![WindowAction::OpenWindow, WindowAction::Deduplicate]
        );
    }

    #[test]
    fn test_event_at_last_high_id_does_not_close() {
        let wm = watermarks("src:1-5", "src:6-7");
        let t = wm.transition(WindowMode::Open, Some(&gtid("src", 7)));
        assert_eq!(t.mode, WindowMode::Open);
        assert!(t.deduplicates());
        assert!(!t.closes_window());
    }

    #[test]
    fn test_event_past_high_closes_window() {
        let wm = watermarks("src:1-5", "src:6-7");
        let t = wm.transition(WindowMode::Open, Some(&gtid("src", 8)));
        assert_eq!(t.mode, WindowMode::Closed);
        assert_eq!(t.actions, vec![WindowAction::CloseWindow]);
    }

    #[test]
    fn test_empty_high_opens_and_closes_on_same_event() {
        let wm = watermarks("src:1-5", "");
        let t = wm.transition(WindowMode::Closed, Some(&gtid("src", 6)));
        assert_eq!(t.mode, WindowMode::Closed);
        assert_eq!(
            t.actions,
            vec![WindowAction::OpenWindow, WindowAction::CloseWindow]
        );
    }

    #[test]
    fn test_no_position_keeps_mode() {
        let wm = watermarks("src:1-5", "src:6-7");
        let t = wm.transition(WindowMode::Closed, None);
        assert_eq!(t.mode, WindowMode::Closed);
        let t = wm.transition(WindowMode::Open, None);
        assert_eq!(t.mode, WindowMode::Open);
        assert!(t.deduplicates());
    }

    #[test]
    fn test_without_watermarks_nothing_happens() {
        let wm = Watermarks::default();
        let t = wm.transition(WindowMode::Closed, Some(&gtid("src", 100)));
        assert_eq!(t.mode, WindowMode::Closed);
        assert!(t.actions.is_empty());
        assert!(!wm.reached_high_watermark(Some(&gtid("src", 100))));
    }

    #[test]
    fn test_reached_high_watermark() {
        let wm = watermarks("src:1-5", "src:6-7");
        assert!(!wm.reached_high_watermark(Some(&gtid("src", 6))));
        assert!(wm.reached_high_watermark(Some(&gtid("src", 7))));
        assert!(wm.reached_high_watermark(Some(&gtid("src", 9))));
        assert!(!wm.reached_high_watermark(Some(&gtid("other", 100))));
        assert!(wm.reached_high_watermark(None));
    }

    #[test]
    fn test_reached_high_watermark_uses_low_when_high_empty() {
        let wm = watermarks("src:1-5", "");
        assert!(!wm.reached_high_watermark(Some(&gtid("src", 4))));
        assert!(wm.reached_high_watermark(Some(&gtid("src", 5))));
        assert!(!wm.reached_high_watermark(Some(&gtid("other", 5))));
    }

    #[test]
    fn test_ambiguous_high_watermark() {
        assert!(watermarks("a:1-5", "a:6,b:1").is_ambiguous());
        assert!(!watermarks("a:1-5", "a:6-9").is_ambiguous());
        assert!(!watermarks("a:1-5", "").is_ambiguous());
    }

    #[test]
    fn test_high_watermark_is_difference_with_low() {
        let mut ctx = SnapshotContext::new();
        ctx.set_low_watermark(set("src1:1-5"));
        ctx.set_high_watermark(set("src1:1-7"));
        assert_eq!(ctx.watermarks().high, Some(set("src1:6-7")));
        assert!(!ctx.server_uuid_changed());

        ctx.set_high_watermark(set("src1:1-7,src2:1"));
        assert!(ctx.server_uuid_changed());
    }

    #[test]
    fn test_update_window_state_applies_transition() {
        let mut ctx = SnapshotContext::new();
        ctx.set_low_watermark(set("src:1-5"));
        ctx.set_high_watermark(set("src:1-7"));

        ctx.update_window_state(Some(&gtid("src", 6)));
        assert_eq!(ctx.window_mode(), WindowMode::Open);
        assert!(ctx.deduplication_needed());

        let t = ctx.update_window_state(Some(&gtid("src", 8)));
        assert!(t.closes_window());
        assert_eq!(ctx.window_mode(), WindowMode::Closed);
        assert_eq!(ctx.watermarks(), &Watermarks::default());
    }

    #[test]
    fn test_table_queue() {
        let mut ctx = SnapshotContext::new();
        assert!(!ctx.snapshot_running());

        let mut conditions = BTreeMap::new();
        conditions.insert("db.orders".to_string(), "status = 'open'".to_string());
        let added = ctx.add_tables(
            vec![TableId::new("db", "orders"), TableId::new("db", "customers")],
            &conditions,
        );
        assert_eq!(added.len(), 2);
        assert!(ctx.snapshot_running());
        assert_eq!(ctx.current_table(), Some(&TableId::new("db", "orders")));
        assert_eq!(ctx.current_condition(), Some("status = 'open'"));

        let again = ctx.add_tables(vec![TableId::new("db", "orders")], &BTreeMap::new());
        assert!(again.is_empty());

        ctx.next_table();
        assert_eq!(ctx.current_table(), Some(&TableId::new("db", "customers")));
        assert_eq!(ctx.current_condition(), None);
        ctx.next_table();
        assert!(!ctx.snapshot_running());
    }

    #[test]
    fn test_remove_tables() {
        let mut ctx = SnapshotContext::new();
        ctx.add_tables(
            vec![
                TableId::new("db", "a"),
                TableId::new("db", "b"),
                TableId::new("db", "c"),
            ],
            &BTreeMap::new(),
        );
        ctx.next_chunk_position(RowKey::single(10));

        assert!(!ctx.remove_tables(&[TableId::new("db", "b")]));
        assert_eq!(ctx.chunk().chunk_end, Some(RowKey::single(10)));

        assert!(ctx.remove_tables(&[TableId::new("db", "a")]));
        assert_eq!(ctx.current_table(), Some(&TableId::new("db", "c")));
        assert_eq!(ctx.chunk(), &ChunkDescriptor::default());
    }

    #[test]
    fn test_revert_chunk_returns_to_chunk_start() {
        let mut ctx = SnapshotContext::new();
        ctx.add_tables(vec![TableId::new("db", "t")], &BTreeMap::new());

        ctx.start_new_chunk();
        ctx.next_chunk_position(RowKey::single(100));
        ctx.start_new_chunk();
        assert_eq!(ctx.chunk().chunk_start, Some(RowKey::single(100)));
        ctx.next_chunk_position(RowKey::single(200));

        ctx.revert_chunk();
        assert_eq!(ctx.chunk().chunk_end, Some(RowKey::single(100)));
        assert_eq!(ctx.window_mode(), WindowMode::Closed);
    }

    #[test]
    fn test_next_table_resets_chunk() {
        let mut ctx = SnapshotContext::new();
        ctx.add_tables(
            vec![TableId::new("db", "a"), TableId::new("db", "b")],
            &BTreeMap::new(),
        );
        ctx.start_new_chunk();
        ctx.set_maximum_key(RowKey::single(50));
        ctx.next_chunk_position(RowKey::single(20));
        ctx.record_sent(RowKey::single(20));

        ctx.next_table();
        assert_eq!(ctx.chunk(), &ChunkDescriptor::default());
        assert!(ctx.maximum_key().is_none());
    }

    #[test]
    fn test_json_round_trip_and_resume() {
        let mut ctx = SnapshotContext::new();
        ctx.add_tables(vec![TableId::new("db", "orders")], &BTreeMap::new());
        ctx.start_new_chunk();
        ctx.next_chunk_position(RowKey::single(10));
        ctx.start_new_chunk();
        ctx.next_chunk_position(RowKey::single(20));
        ctx.set_low_watermark(set("src:1-5"));
        ctx.set_high_watermark(set("src:1-6"));
        ctx.set_signal_offset(42);

        let json = ctx.to_json().unwrap();
        let mut restored = SnapshotContext::from_json(&json).unwrap();
        assert_eq!(restored.snapshot_id, ctx.snapshot_id);
        assert_eq!(restored.signal_offset(), Some(42));
        assert_eq!(restored.watermarks().high, Some(set("src:6")));

        restored.prepare_resume();
        assert_eq!(restored.chunk().chunk_end, Some(RowKey::single(10)));
        assert_eq!(restored.watermarks(), &Watermarks::default());
        assert!(restored.snapshot_running());
    }

    #[test]
    fn test_is_finished() {
        let mut ctx = SnapshotContext::new();
        assert!(ctx.is_finished());
        ctx.add_tables(vec![TableId::new("db", "t")], &BTreeMap::new());
        assert!(!ctx.is_finished());
        ctx.next_table();
        ctx.set_low_watermark(set("src:1"));
        ctx.set_high_watermark(set("src:1"));
        assert!(!ctx.is_finished());
        ctx.close_window();
        assert!(ctx.is_finished());
    }
}
