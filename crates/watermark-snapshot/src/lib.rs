//! # watermark-snapshot - Read-only incremental snapshots
//!
//! Interleaves chunked reads of existing table contents with a live change
//! stream, producing one deduplicated output sequence. Nothing is written to
//! the source: chunk windows are delimited by the executed position sets
//! (MySQL GTID sets) the server reports before and after each chunk query.
//!
//! ## Architecture
//!
//! ```text
//!  low watermark          chunk query            high watermark
//!  SHOW MASTER STATUS ──▶ SELECT .. LIMIT n ──▶ SHOW MASTER STATUS
//!        │                      │                      │
//!        ▼                      ▼                      ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ SnapshotCoordinator                                          │
//! │   event ∉ low  → window open, live changes evict buffered rows│
//! │   event ∉ high → flush remaining rows, read next chunk        │
//! └──────────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//!    EventSink  (snapshot reads + live changes, in order)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use watermark_snapshot::{ReadOnlySnapshotConfig, SnapshotCoordinator, TableId};
//!
//! let config = ReadOnlySnapshotConfig::builder()
//!     .connector_name("inventory")
//!     .chunk_size(1024)
//!     .build()?;
//!
//! let mut coordinator = SnapshotCoordinator::new(config, store, sink);
//! coordinator.init(None).await?;
//! coordinator
//!     .add_data_collections_to_snapshot(vec![TableId::new("shop", "orders")], &Default::default())
//!     .await?;
//!
//! while let Some(event) = stream.next().await {
//!     coordinator.process(&event).await?;
//! }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! The coordinator, its configuration, the collaborator traits and the
//! stream model.
//!
//! ### Tier 2: Advanced Types (`common` module)
//! Position-set algebra, the window state machine, signaling internals and
//! context persistence - accessed via `common::*`.

pub mod common;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{
    // Error handling
    ErrorCategory,
    Result,
    SnapshotError,
    // Configuration
    ReadOnlySnapshotConfig,
    ReadOnlySnapshotConfigBuilder,
    // Coordinator
    SnapshotCoordinator,
    SnapshotStatsSnapshot,
    // Collaborators
    ChunkQuery,
    EventSink,
    SnapshotStore,
    // Stream model
    ChangeEvent,
    ChangeOp,
    EventKind,
    OffsetContext,
    Partition,
    RowKey,
    SinkRecord,
    SnapshotRow,
    StreamEvent,
    TableId,
    // Positions
    Gtid,
    PositionSet,
};

// =============================================================================
// TIER 2: Signaling and persistence
// =============================================================================

pub use common::{
    ContextBackend, ContextStore, MemoryContextStore, SignalChannel, SignalListener,
    SignalRecord, SignalSource, SnapshotContext, SnapshotSignal,
};
