//! # Common Snapshot Types and Traits
//!
//! Building blocks of the read-only incremental snapshot:
//!
//! - [`PositionSet`] - Executed transactions per source (GTID sets)
//! - [`WindowBuffer`] - Ordered chunk rows awaiting deduplication
//! - [`SnapshotContext`] - Watermarks, table queue and window state machine
//! - [`SnapshotCoordinator`] - Interleaves chunk reads with the change stream
//! - [`SignalListener`] - Out-of-band snapshot commands
//! - [`SnapshotStore`] / [`EventSink`] - Collaborator traits
//! - [`ContextStore`] - Persistent snapshot context for resume
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  signals   ┌─────────────────────┐  rows   ┌───────────┐
//! │SignalListener│ ─────────▶ │ SnapshotCoordinator │ ──────▶ │ EventSink │
//! └──────────────┘  (mpsc)    │  SnapshotContext    │         └───────────┘
//!                             │  WindowBuffer       │
//! change stream ────────────▶ │                     │ ◀────── SnapshotStore
//!                             └─────────────────────┘  chunks, positions
//! ```

mod checkpoint;
mod config;
mod context;
mod coordinator;
mod error;
mod event;
mod position;
mod signal;
mod stats;
mod traits;
mod window;

pub use checkpoint::*;
pub use config::*;
pub use context::*;
pub use coordinator::*;
pub use error::*;
pub use event::*;
pub use position::*;
pub use signal::*;
pub use stats::*;
pub use traits::*;
pub use window::*;
