//! # Incremental Snapshot Coordinator
//!
//! Interleaves chunked table reads with the live change stream, without
//! locks and without writing to the source.
//!
//! ## Protocol
//!
//! 1. Capture the executed position set as the **low watermark** and commit
//!    the read transaction, so the chunk query sees everything in it.
//! 2. Read one chunk of the current table into the [`WindowBuffer`].
//! 3. Capture the executed set again; what is new since `low` is the
//!    **high watermark**.
//! 4. Feed stream events through [`SnapshotCoordinator::process`]. Once an
//!    event is past `low`, changes to buffered keys remove those rows. The
//!    first event past `high` flushes the remaining rows and reads the next
//!    chunk, before the event itself is emitted.
//!
//! A high watermark spanning several sources cannot be ordered against the
//! stream, so such a chunk is discarded and read again from its start key.
//!
//! Heartbeats and commits also move the snapshot forward: while a run is in
//! progress and their position has reached the high watermark, the window is
//! flushed and the next chunk read. Idle tables still make progress this way.
//!
//! Chunk reads run inline. The only other line of execution is the
//! [`SignalListener`](crate::common::SignalListener), which feeds commands
//! through a queue drained at the start of every event.

use crate::common::{
    ChangeEvent, ChunkQuery, EventKind, EventSink, OffsetContext, Partition,
    ReadOnlySnapshotConfig, Result, RowKey, SignalAction, SignalReceiver, SinkRecord,
    SnapshotContext, SnapshotError, SnapshotSignal, SnapshotStats, SnapshotStatsSnapshot,
    SnapshotStore, StreamEvent, TableId, Transition, WindowBuffer, WindowMode,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Drives the incremental snapshot for one change stream.
pub struct SnapshotCoordinator<S, K> {
    config: ReadOnlySnapshotConfig,
    store: S,
    sink: K,
    /// None until [`init`](Self::init)
    context: Option<SnapshotContext>,
    window: WindowBuffer,
    /// Table the buffered rows were read from
    window_table: Option<TableId>,
    signals: Option<SignalReceiver>,
    stats: Arc<SnapshotStats>,
    interrupted: Arc<AtomicBool>,
}

impl<S, K> SnapshotCoordinator<S, K>
where
    S: SnapshotStore,
    K: EventSink,
{
    pub fn new(config: ReadOnlySnapshotConfig, store: S, sink: K) -> Self {
        Self {
            config,
            store,
            sink,
            context: None,
            window: WindowBuffer::new(),
            window_table: None,
            signals: None,
            stats: Arc::new(SnapshotStats::default()),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach the receiving side of the signal queue.
    pub fn with_signals(mut self, signals: SignalReceiver) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Current context, for persistence.
    pub fn snapshot_state(&self) -> Option<&SnapshotContext> {
        self.context.as_ref()
    }

    pub fn stats(&self) -> SnapshotStatsSnapshot {
        self.stats.snapshot()
    }

    /// Set the returned flag to abort at the next flush or chunk read.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Rows waiting in the window buffer.
    pub fn buffered_rows(&self) -> usize {
        self.window.len()
    }

    /// Prepare the coordinator, optionally from a persisted context.
    ///
    /// Fails with [`SnapshotError::UnsupportedVersion`] when the server is
    /// older than the configured minimum or cannot report executed position
    /// sets. A restored run in progress re-reads its
    /// in-flight chunk right away. Returns the offset of the last applied
    /// signal, for positioning the signal listener.
    pub async fn init(&mut self, restored: Option<SnapshotContext>) -> Result<Option<u64>> {
        let version = self.store.server_version().await?;
        self.config.check_server_version(&version)?;
        debug!(version = %version, "Server version supported");

        let executed = self.store.executed_positions().await?;
        debug!(executed = %executed, "Executed positions available");

        let resumed = restored.is_some();
        let context = match restored {
            Some(mut ctx) => {
                ctx.prepare_resume();
                info!(
                    snapshot_id = %ctx.snapshot_id,
                    table = ?ctx.current_table(),
                    chunk_start = ?ctx.chunk().chunk_end,
                    "Resuming incremental snapshot"
                );
                ctx
            }
            None => SnapshotContext::new(),
        };

        let signal_offset = context.signal_offset();
        let read_now = resumed && context.snapshot_running() && !context.is_paused();
        self.context = Some(context);
        self.window.clear();
        self.window_table = None;

        if read_now {
            self.read_chunk().await?;
        }
        Ok(signal_offset)
    }

    /// Process one unit of the change stream.
    ///
    /// Data changes are emitted to the sink after the window has been
    /// updated, so snapshot rows flushed by a closing window come first.
    pub async fn process(&mut self, event: &StreamEvent) -> Result<()> {
        if self.context.is_none() {
            warn!(
                kind = event.kind_name(),
                "Snapshot context not initialized, skipping window processing"
            );
            if let EventKind::DataChange(change) = &event.kind {
                self.emit_change(event, change).await?;
            }
            return Ok(());
        }

        self.check_enqueued_signals().await?;

        match &event.kind {
            EventKind::DataChange(change) => {
                self.process_message(event, change).await?;
                self.emit_change(event, change).await
            }
            EventKind::Filtered { table } => {
                trace!(table = %table, "Filtered event");
                self.update_window(event).await.map(|_| ())
            }
            EventKind::TransactionStarted => self.update_window(event).await.map(|_| ()),
            EventKind::Heartbeat | EventKind::TransactionCommitted => {
                self.update_window(event).await?;
                self.advance_to_high_watermark(event).await
            }
        }
    }

    /// Add tables to the snapshot; starts a run when none is in progress.
    pub async fn add_data_collections_to_snapshot(
        &mut self,
        tables: Vec<TableId>,
        conditions: &BTreeMap<String, String>,
    ) -> Result<()> {
        let Some(ctx) = self.context.as_mut() else {
            return Err(SnapshotError::invalid_state("snapshot context not initialized"));
        };

        let start_run = !ctx.snapshot_running();
        let added = ctx.add_tables(tables, conditions);
        if added.is_empty() {
            return Ok(());
        }
        info!(tables = ?added, "Tables added to incremental snapshot");

        if start_run {
            info!(snapshot_id = %ctx.snapshot_id, "Incremental snapshot started");
            self.read_chunk().await?;
        }
        Ok(())
    }

    /// Remove tables from the snapshot, or end the run when `tables` is empty.
    pub fn stop_snapshot(&mut self, tables: &[TableId]) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        if !ctx.snapshot_running() {
            return;
        }

        if tables.is_empty() {
            info!(snapshot_id = %ctx.snapshot_id, "Stopping incremental snapshot");
            ctx.clear_tables();
            ctx.close_window();
            self.window.clear();
            self.window_table = None;
            return;
        }

        if ctx.remove_tables(tables) {
            // the pending window closes on its own and moves to the next table
            self.window.clear();
            self.window_table = None;
        }
        info!(tables = ?tables, "Removed tables from incremental snapshot");
    }

    /// Stop reading new chunks.
    pub fn pause(&mut self) {
        if let Some(ctx) = self.context.as_mut() {
            ctx.set_paused(true);
            info!(snapshot_id = %ctx.snapshot_id, "Incremental snapshot paused");
        }
    }

    /// Continue a paused run; reads a chunk unless a window is still pending.
    pub async fn resume(&mut self) -> Result<()> {
        let Some(ctx) = self.context.as_mut() else {
            return Ok(());
        };
        if !ctx.is_paused() {
            return Ok(());
        }
        ctx.set_paused(false);
        info!(snapshot_id = %ctx.snapshot_id, "Incremental snapshot resumed");

        if ctx.watermarks().high.is_none() {
            self.read_chunk().await?;
        }
        Ok(())
    }

    /// Apply one control command.
    pub async fn apply_signal(&mut self, signal: SnapshotSignal) -> Result<()> {
        debug!(
            offset = signal.offset,
            action = signal.action.as_str(),
            "Applying snapshot signal"
        );
        match signal.action {
            SignalAction::ExecuteSnapshot => {
                self.add_data_collections_to_snapshot(signal.data_collections, &signal.conditions)
                    .await?
            }
            SignalAction::StopSnapshot => self.stop_snapshot(&signal.data_collections),
            SignalAction::PauseSnapshot => self.pause(),
            SignalAction::ResumeSnapshot => self.resume().await?,
        }

        if let Some(ctx) = self.context.as_mut() {
            ctx.set_signal_offset(signal.offset);
        }
        self.stats.record_signal();
        Ok(())
    }

    async fn check_enqueued_signals(&mut self) -> Result<()> {
        let pending = match self.signals.as_mut() {
            Some(receiver) => receiver.drain(),
            None => return Ok(()),
        };
        for signal in pending {
            self.apply_signal(signal).await?;
        }
        Ok(())
    }

    async fn process_message(&mut self, event: &StreamEvent, change: &ChangeEvent) -> Result<()> {
        trace!(
            table = %change.table,
            key = %change.key,
            buffered = self.window.len(),
            "Checking window"
        );
        let transition = self.update_window(event).await?;
        if !transition.closes_window() && transition.deduplicates() && !self.window.is_empty() {
            self.deduplicate_window(&change.table, &change.key);
        }
        Ok(())
    }

    /// Classify the event's position; a closing window is flushed and the
    /// next chunk read before returning.
    async fn update_window(&mut self, event: &StreamEvent) -> Result<Transition> {
        let transition = match self.context.as_mut() {
            Some(ctx) => ctx.update_window_state(event.gtid()),
            None => {
                return Ok(Transition {
                    mode: WindowMode::Closed,
                    actions: Vec::new(),
                })
            }
        };

        if transition.closes_window() {
            self.stats.record_window_closed();
            self.flush_and_advance(&event.partition, &event.offset).await?;
        }
        Ok(transition)
    }

    async fn advance_to_high_watermark(&mut self, event: &StreamEvent) -> Result<()> {
        while self
            .context
            .as_ref()
            .is_some_and(|c| c.snapshot_running() && c.reached_high_watermark(event.gtid()))
        {
            if let Some(ctx) = self.context.as_mut() {
                ctx.close_window();
            }
            self.stats.record_window_closed();
            self.flush_and_advance(&event.partition, &event.offset).await?;
        }
        Ok(())
    }

    fn deduplicate_window(&mut self, table: &TableId, key: &RowKey) {
        let current = self.context.as_ref().and_then(|c| c.current_table());
        if current != Some(table) {
            return;
        }
        if self.window.deduplicate(key) {
            self.stats.record_deduplicated();
        }
    }

    /// Emit the buffered rows, then read the next chunk.
    pub async fn flush_and_advance(
        &mut self,
        partition: &Partition,
        offset: &OffsetContext,
    ) -> Result<()> {
        self.send_window_events(partition, offset).await?;
        self.read_chunk().await
    }

    async fn send_window_events(
        &mut self,
        partition: &Partition,
        offset: &OffsetContext,
    ) -> Result<()> {
        self.check_interrupted()?;
        if self.window.is_empty() {
            return Ok(());
        }

        let table = match self
            .window_table
            .clone()
            .or_else(|| self.context.as_ref().and_then(|c| c.current_table().cloned()))
        {
            Some(t) => t,
            None => {
                warn!(rows = self.window.len(), "Buffered rows without a table, discarding");
                self.window.clear();
                return Ok(());
            }
        };

        let rows = self.window.drain();
        let count = rows.len() as u64;
        debug!(table = %table, rows = count, "Sending window events");

        let snapshot_offset = offset.for_snapshot_records();
        for row in rows {
            let key = row.key.clone();
            self.sink
                .emit(partition, &table, SinkRecord::read(row), &snapshot_offset)
                .await?;
            if let Some(ctx) = self.context.as_mut() {
                ctx.record_sent(key);
            }
        }
        self.stats.record_emitted(count);
        Ok(())
    }

    /// Read the next chunk of the current table into the window.
    ///
    /// Tables that are empty or exhausted are finished on the way. The chunk
    /// is read again while its high watermark is ambiguous.
    pub async fn read_chunk(&mut self) -> Result<()> {
        loop {
            self.check_interrupted()?;

            let Some(ctx) = self.context.as_mut() else {
                return Ok(());
            };
            if !ctx.snapshot_running() {
                debug!("Skipping chunk read, no snapshot running");
                return Ok(());
            }
            if ctx.is_paused() {
                info!(
                    snapshot_id = %ctx.snapshot_id,
                    "Incremental snapshot paused, not reading chunk"
                );
                return Ok(());
            }

            self.store.commit().await?;
            ctx.start_new_chunk();
            self.open_window().await?;
            self.read_table_chunk().await?;

            if !self.close_window().await? {
                return Ok(());
            }
        }
    }

    /// Capture the low watermark and start a fresh read transaction.
    async fn open_window(&mut self) -> Result<()> {
        let low = self.store.executed_positions().await?;
        self.store.commit().await?;
        self.store.begin_read().await?;

        if let Some(ctx) = self.context.as_mut() {
            ctx.set_low_watermark(low);
        }
        self.stats.record_window_opened();
        Ok(())
    }

    /// Fill the window from the first table that still has rows.
    async fn read_table_chunk(&mut self) -> Result<()> {
        loop {
            self.check_interrupted()?;

            let Some(ctx) = self.context.as_mut() else {
                return Ok(());
            };
            let Some(table) = ctx.current_table().cloned() else {
                return Ok(());
            };

            if ctx.maximum_key().is_none() {
                match self.store.maximum_key(&table).await? {
                    Some(max) => {
                        info!(table = %table, maximum_key = %max, "Snapshotting table");
                        ctx.set_maximum_key(max);
                    }
                    None => {
                        info!(
                            table = %table,
                            "Table is empty, incremental snapshot of table finished"
                        );
                        ctx.next_table();
                        self.stats.record_table_completed();
                        continue;
                    }
                }
            }

            let query = ChunkQuery {
                table: table.clone(),
                after: ctx.chunk().chunk_end.clone(),
                up_to: ctx.maximum_key().cloned(),
                limit: self.config.chunk_size,
                condition: ctx.current_condition().map(str::to_string),
            };
            let rows = self.store.range_query(&query).await?;

            if rows.is_empty() {
                info!(table = %table, "No more rows, incremental snapshot of table finished");
                ctx.next_table();
                self.stats.record_table_completed();
                continue;
            }

            debug!(
                table = %table,
                after = ?query.after,
                rows = rows.len(),
                "Read chunk"
            );
            self.stats.record_chunk(rows.len() as u64);
            for row in rows {
                self.window.insert(row);
            }
            if let Some(last) = self.window.last_key() {
                ctx.next_chunk_position(last.clone());
            }
            self.window_table = Some(table);
            return Ok(());
        }
    }

    /// Capture the high watermark.
    ///
    /// Returns true when the chunk has been discarded and must be read again.
    async fn close_window(&mut self) -> Result<bool> {
        let running = self
            .context
            .as_ref()
            .is_some_and(SnapshotContext::snapshot_running);
        if !running {
            if let Some(ctx) = self.context.as_mut() {
                ctx.close_window();
                info!(snapshot_id = %ctx.snapshot_id, "Incremental snapshot completed");
            }
            return Ok(false);
        }

        let executed = self.store.executed_positions().await?;
        let Some(ctx) = self.context.as_mut() else {
            return Ok(false);
        };
        ctx.set_high_watermark(executed);

        if ctx.server_uuid_changed() && !self.window.is_empty() {
            warn!(
                table = ?ctx.current_table(),
                high = ?ctx.watermarks().high,
                "High watermark spans several sources, re-reading chunk"
            );
            self.window.clear();
            ctx.revert_chunk();
            self.stats.record_reread();
            return Ok(true);
        }
        Ok(false)
    }

    async fn emit_change(&mut self, event: &StreamEvent, change: &ChangeEvent) -> Result<()> {
        self.sink
            .emit(
                &event.partition,
                &change.table,
                SinkRecord::change(change),
                &event.offset,
            )
            .await
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(SnapshotError::Interrupted);
        }
        Ok(())
    }
}
