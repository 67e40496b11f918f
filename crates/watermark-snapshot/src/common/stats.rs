//! Lock-free counters for the incremental snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Incremental snapshot statistics.
#[derive(Debug, Default)]
pub struct SnapshotStats {
    windows_opened: AtomicU64,
    windows_closed: AtomicU64,
    chunks_read: AtomicU64,
    /// Chunks discarded because the high watermark spanned several sources
    chunk_rereads: AtomicU64,
    rows_buffered: AtomicU64,
    rows_deduplicated: AtomicU64,
    rows_emitted: AtomicU64,
    tables_completed: AtomicU64,
    signals_applied: AtomicU64,
}

impl SnapshotStats {
    pub fn record_window_opened(&self) {
        self.windows_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_closed(&self) {
        self.windows_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed chunk query and the rows it buffered.
    pub fn record_chunk(&self, rows: u64) {
        self.chunks_read.fetch_add(1, Ordering::Relaxed);
        self.rows_buffered.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_reread(&self) {
        self.chunk_rereads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.rows_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, rows: u64) {
        self.rows_emitted.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_table_completed(&self) {
        self.tables_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal(&self) {
        self.signals_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot statistics.
    pub fn snapshot(&self) -> SnapshotStatsSnapshot {
        SnapshotStatsSnapshot {
            windows_opened: self.windows_opened.load(Ordering::Relaxed),
            windows_closed: self.windows_closed.load(Ordering::Relaxed),
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            chunk_rereads: self.chunk_rereads.load(Ordering::Relaxed),
            rows_buffered: self.rows_buffered.load(Ordering::Relaxed),
            rows_deduplicated: self.rows_deduplicated.load(Ordering::Relaxed),
            rows_emitted: self.rows_emitted.load(Ordering::Relaxed),
            tables_completed: self.tables_completed.load(Ordering::Relaxed),
            signals_applied: self.signals_applied.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SnapshotStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStatsSnapshot {
    pub windows_opened: u64,
    pub windows_closed: u64,
    pub chunks_read: u64,
    pub chunk_rereads: u64,
    pub rows_buffered: u64,
    pub rows_deduplicated: u64,
    pub rows_emitted: u64,
    pub tables_completed: u64,
    pub signals_applied: u64,
}
