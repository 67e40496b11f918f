//! Signal source backed by a shared vector, standing in for a signal topic.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use watermark_snapshot::{Result, SignalRecord, SignalSource};

#[derive(Clone, Default)]
pub struct ScriptedSignalSource {
    records: Arc<Mutex<Vec<SignalRecord>>>,
    position: Arc<Mutex<usize>>,
    seeks: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record keyed with `key`; returns its offset.
    pub fn publish(&self, key: &str, value: &str) -> u64 {
        let mut records = self.records.lock().unwrap();
        let offset = records.len() as u64;
        records.push(SignalRecord::new(offset, Some(key), value));
        offset
    }

    pub fn execute_snapshot(&self, key: &str, tables: &[&str]) -> u64 {
        let value = serde_json::json!({
            "type": "execute-snapshot",
            "data": {"data-collections": tables, "type": "incremental"}
        });
        self.publish(key, &value.to_string())
    }

    pub fn seeks(&self) -> Vec<u64> {
        self.seeks.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalSource for ScriptedSignalSource {
    async fn seek(&mut self, offset: u64) -> Result<()> {
        self.seeks.lock().unwrap().push(offset);
        *self.position.lock().unwrap() = offset as usize;
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<SignalRecord>> {
        let records = self.records.lock().unwrap();
        let mut position = self.position.lock().unwrap();
        let batch: Vec<_> = records.iter().skip(*position).cloned().collect();
        *position = records.len().max(*position);
        Ok(batch)
    }
}
