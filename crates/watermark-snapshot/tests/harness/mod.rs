//! Test harness for incremental snapshot integration tests
//!
//! Everything runs in memory:
//! - [`TestDatabase`] holds tables, the executed position set and the change
//!   stream, and can inject writes while a chunk query runs
//! - [`RecordingSink`] keeps every emitted record for inspection
//! - [`ScriptedSignalSource`] serves signal records to the listener

#![allow(dead_code)]

pub mod assertions;
pub mod database;
pub mod signals;
pub mod sink;

pub use assertions::EmittedExt;
pub use database::{TestDatabase, TestStore, Write, SOURCE};
pub use signals::ScriptedSignalSource;
pub use sink::{Emitted, RecordingSink};

use std::sync::Once;
use watermark_snapshot::{ReadOnlySnapshotConfig, SnapshotCoordinator, StreamEvent};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("watermark_snapshot=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const CONNECTOR: &str = "test-connector";

pub fn config(chunk_size: usize) -> ReadOnlySnapshotConfig {
    ReadOnlySnapshotConfig::builder()
        .connector_name(CONNECTOR)
        .chunk_size(chunk_size)
        .signal_poll_interval_ms(5)
        .build()
        .unwrap()
}

pub type TestCoordinator = SnapshotCoordinator<TestStore, RecordingSink>;

/// Feed queued stream events, then a heartbeat at the latest position,
/// until the run is finished or `max_rounds` is reached.
pub async fn run_to_completion(
    coordinator: &mut TestCoordinator,
    db: &TestDatabase,
    max_rounds: usize,
) -> anyhow::Result<()> {
    for _ in 0..max_rounds {
        feed(coordinator, db.take_stream()).await?;
        coordinator.process(&db.heartbeat()).await?;

        let finished = coordinator
            .snapshot_state()
            .map_or(true, |c| c.is_finished());
        if finished && db.stream_len() == 0 {
            return Ok(());
        }
    }
    anyhow::bail!("snapshot did not finish within {} rounds", max_rounds)
}

pub async fn feed(
    coordinator: &mut TestCoordinator,
    events: Vec<StreamEvent>,
) -> anyhow::Result<()> {
    for event in events {
        coordinator.process(&event).await?;
    }
    Ok(())
}
