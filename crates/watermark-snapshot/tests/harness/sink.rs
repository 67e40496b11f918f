//! Sink that records everything it is given.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use watermark_snapshot::{EventSink, OffsetContext, Partition, Result, SinkRecord, TableId};

#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub table: TableId,
    pub record: SinkRecord,
    pub offset: OffsetContext,
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<Emitted>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Emitted> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(
        &mut self,
        _partition: &Partition,
        table: &TableId,
        record: SinkRecord,
        offset: &OffsetContext,
    ) -> Result<()> {
        self.records.lock().unwrap().push(Emitted {
            table: table.clone(),
            record,
            offset: offset.clone(),
        });
        Ok(())
    }
}
