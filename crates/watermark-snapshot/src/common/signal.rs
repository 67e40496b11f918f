//! # Snapshot Signaling
//!
//! Out-of-band control commands for the incremental snapshot, read from a
//! signal topic/table and handed to the coordinator through a bounded queue.
//!
//! ## Record format
//!
//! ```json
//! {
//!   "type": "execute-snapshot",
//!   "data": {
//!     "data-collections": ["inventory.orders"],
//!     "type": "incremental",
//!     "additional-conditions": [
//!       {"data-collection": "inventory.orders", "filter": "status = 'open'"}
//!     ]
//!   }
//! }
//! ```
//!
//! Records keyed with another connector's name, unknown signal types and
//! non-incremental snapshot requests are skipped.
//!
//! ## Threading
//!
//! The [`SignalListener`] runs as its own tokio task and only ever sends into
//! the channel. The coordinator owns the [`SignalReceiver`] and drains it
//! without blocking at the start of every event cycle.

use crate::common::{ReadOnlySnapshotConfig, Result, SnapshotError, TableId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Signal action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalAction {
    /// Add tables to the snapshot
    ExecuteSnapshot,
    /// Remove tables from the snapshot (all when none are listed)
    StopSnapshot,
    /// Stop reading new chunks
    PauseSnapshot,
    /// Continue reading chunks
    ResumeSnapshot,
}

impl SignalAction {
    /// Get the action name as string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::ExecuteSnapshot => "execute-snapshot",
            SignalAction::StopSnapshot => "stop-snapshot",
            SignalAction::PauseSnapshot => "pause-snapshot",
            SignalAction::ResumeSnapshot => "resume-snapshot",
        }
    }

    /// Parse action from string; unknown names yield None.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execute-snapshot" => Some(SignalAction::ExecuteSnapshot),
            "stop-snapshot" => Some(SignalAction::StopSnapshot),
            "pause-snapshot" => Some(SignalAction::PauseSnapshot),
            "resume-snapshot" => Some(SignalAction::ResumeSnapshot),
            _ => None,
        }
    }
}

/// Filter applied to one table's range queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalCondition {
    #[serde(rename = "data-collection")]
    pub data_collection: String,
    pub filter: String,
}

/// Payload of a signal record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalData {
    #[serde(default, rename = "data-collections")]
    pub data_collections: Vec<String>,
    /// Snapshot type; only `incremental` is served here
    #[serde(default, rename = "type")]
    pub snapshot_type: Option<String>,
    #[serde(default, rename = "additional-conditions")]
    pub additional_conditions: Vec<AdditionalCondition>,
}

#[derive(Debug, Deserialize)]
struct SignalPayload {
    #[serde(rename = "type")]
    signal_type: String,
    #[serde(default)]
    data: Option<SignalData>,
}

/// A parsed control command, tagged with the offset it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSignal {
    pub offset: u64,
    pub action: SignalAction,
    pub data_collections: Vec<TableId>,
    /// Filter per table, keyed by `database.table`
    pub conditions: BTreeMap<String, String>,
}

impl SnapshotSignal {
    /// Add tables to the snapshot.
    pub fn execute(offset: u64, tables: Vec<TableId>) -> Self {
        Self {
            offset,
            action: SignalAction::ExecuteSnapshot,
            data_collections: tables,
            conditions: BTreeMap::new(),
        }
    }

    /// Remove tables (all when empty).
    pub fn stop(offset: u64, tables: Vec<TableId>) -> Self {
        Self {
            offset,
            action: SignalAction::StopSnapshot,
            data_collections: tables,
            conditions: BTreeMap::new(),
        }
    }

    pub fn pause(offset: u64) -> Self {
        Self {
            offset,
            action: SignalAction::PauseSnapshot,
            data_collections: Vec::new(),
            conditions: BTreeMap::new(),
        }
    }

    pub fn resume(offset: u64) -> Self {
        Self {
            offset,
            action: SignalAction::ResumeSnapshot,
            data_collections: Vec::new(),
            conditions: BTreeMap::new(),
        }
    }

    /// Attach a filter for one table.
    pub fn with_condition(mut self, table: &TableId, filter: impl Into<String>) -> Self {
        self.conditions.insert(table.to_string(), filter.into());
        self
    }
}

/// Raw record read from the signal topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub offset: u64,
    /// Connector the record is addressed to
    pub key: Option<String>,
    /// JSON payload
    pub value: String,
}

impl SignalRecord {
    pub fn new(offset: u64, key: Option<&str>, value: impl Into<String>) -> Self {
        Self {
            offset,
            key: key.map(str::to_string),
            value: value.into(),
        }
    }

    /// Parse the record into a command for `connector_name`.
    ///
    /// Returns `Ok(None)` for records that are not meant for this snapshot.
    /// Malformed payloads fail with [`SnapshotError::Signal`].
    pub fn parse(&self, connector_name: &str) -> Result<Option<SnapshotSignal>> {
        if self.key.as_deref() != Some(connector_name) {
            debug!(
                offset = self.offset,
                key = ?self.key,
                "Signal addressed to another connector, skipping"
            );
            return Ok(None);
        }

        let payload: SignalPayload = serde_json::from_str(&self.value).map_err(|e| {
            SnapshotError::signal(format!("invalid signal at offset {}: {}", self.offset, e))
        })?;

        let Some(action) = SignalAction::parse(&payload.signal_type) else {
            warn!(
                offset = self.offset,
                signal_type = %payload.signal_type,
                "Unknown signal type, skipping"
            );
            return Ok(None);
        };

        let data = payload.data.unwrap_or_default();
        if action == SignalAction::ExecuteSnapshot {
            if let Some(kind) = data.snapshot_type.as_deref() {
                if !kind.eq_ignore_ascii_case("incremental") {
                    warn!(
                        offset = self.offset,
                        snapshot_type = kind,
                        "Only incremental snapshots are supported, skipping"
                    );
                    return Ok(None);
                }
            }
        }

        let data_collections = data
            .data_collections
            .iter()
            .map(|s| s.parse::<TableId>())
            .collect::<Result<Vec<_>>>()?;

        let mut conditions = BTreeMap::new();
        for cond in data.additional_conditions {
            let table: TableId = cond.data_collection.parse()?;
            conditions.insert(table.to_string(), cond.filter);
        }

        Ok(Some(SnapshotSignal {
            offset: self.offset,
            action,
            data_collections,
            conditions,
        }))
    }
}

/// Source of raw signal records (a Kafka topic, a signal table, ...).
#[async_trait]
pub trait SignalSource: Send {
    /// Position the source so the next poll returns records from `offset` on.
    async fn seek(&mut self, offset: u64) -> Result<()>;

    /// Fetch the next batch of records; empty when none are available.
    async fn poll(&mut self) -> Result<Vec<SignalRecord>>;
}

/// Create a bounded signal queue.
pub struct SignalChannel;

impl SignalChannel {
    pub fn new(capacity: usize) -> (SignalSender, SignalReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (SignalSender { sender }, SignalReceiver { receiver })
    }
}

/// Producer side of the signal queue.
#[derive(Clone)]
pub struct SignalSender {
    sender: mpsc::Sender<SnapshotSignal>,
}

impl SignalSender {
    /// Send a signal, waiting for queue space.
    pub async fn send(&self, signal: SnapshotSignal) -> Result<()> {
        self.sender
            .send(signal)
            .await
            .map_err(|e| SnapshotError::signal(format!("signal queue closed: {}", e)))
    }

    /// Try to send a signal without blocking.
    pub fn try_send(&self, signal: SnapshotSignal) -> Result<()> {
        self.sender
            .try_send(signal)
            .map_err(|e| SnapshotError::signal(format!("failed to enqueue signal: {}", e)))
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consumer side of the signal queue.
pub struct SignalReceiver {
    receiver: mpsc::Receiver<SnapshotSignal>,
}

impl SignalReceiver {
    /// Take every signal queued so far without waiting.
    pub fn drain(&mut self) -> Vec<SnapshotSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = self.receiver.try_recv() {
            signals.push(signal);
        }
        signals
    }
}

/// Background task moving signal records into the queue.
pub struct SignalListener {
    connector_name: String,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl SignalListener {
    pub fn new(config: &ReadOnlySnapshotConfig) -> Self {
        Self {
            connector_name: config.connector_name.clone(),
            poll_interval: config.signal_poll_interval(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag that keeps the listener polling; clear it to stop the task.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Spawn the listener, starting after the last applied offset.
    pub fn spawn<S>(
        self,
        source: S,
        sender: SignalSender,
        last_applied: Option<u64>,
    ) -> JoinHandle<Result<()>>
    where
        S: SignalSource + 'static,
    {
        tokio::spawn(async move { self.run(source, sender, last_applied).await })
    }

    /// Poll until stopped or until the receiving side is dropped.
    pub async fn run<S>(
        self,
        mut source: S,
        sender: SignalSender,
        last_applied: Option<u64>,
    ) -> Result<()>
    where
        S: SignalSource,
    {
        let start = last_applied.map_or(0, |o| o + 1);
        source.seek(start).await?;
        info!(
            connector = %self.connector_name,
            offset = start,
            "Signal listener started"
        );

        while self.running.load(Ordering::SeqCst) {
            if sender.is_closed() {
                info!("Signal queue closed, stopping listener");
                return Ok(());
            }

            let records = match source.poll().await {
                Ok(records) => records,
                Err(e) => {
                    error!(error = %e, "Failed to poll signal source");
                    return Err(e);
                }
            };

            for record in records {
                match record.parse(&self.connector_name) {
                    Ok(Some(signal)) => {
                        debug!(
                            offset = signal.offset,
                            action = signal.action.as_str(),
                            "Enqueueing snapshot signal"
                        );
                        if sender.send(signal).await.is_err() {
                            info!("Signal queue closed, stopping listener");
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(offset = record.offset, error = %e, "Skipping malformed signal")
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        info!(connector = %self.connector_name, "Signal listener stopped");
        Ok(())
    }
}
