//! Record serialization (spec §4.3). The writer itself is opaque to the
//! state machine; only the provider selected at startup knows the concrete
//! on-disk format.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RecordWriterError;
use crate::storage::Storage;

/// A single record handed to the sink, in log order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub offset: u64,
    pub timestamp_millis: i64,
    pub payload: Value,
}

/// Serializes records to an open temp artifact (spec §4.3).
pub trait RecordWriter: Send {
    /// Serialize a single record. `timestamp_millis` is passed separately
    /// from the record, matching the source signature `write(timestamp,
    /// record)`, for writer implementations that bucket by write-time
    /// rather than the record's own timestamp.
    fn write(&mut self, timestamp_millis: i64, record: &Record) -> Result<(), RecordWriterError>;

    /// Flush and close the underlying file. Idempotent.
    fn close(&mut self) -> Result<(), RecordWriterError>;
}

/// Selected once at startup; produces a fresh [`RecordWriter`] per
/// partition per rotation.
pub trait RecordWriterProvider: Send + Sync {
    fn new_writer(
        &self,
        storage: &dyn Storage,
        temp_path: &Path,
        first_record: &Record,
    ) -> Result<Box<dyn RecordWriter>, RecordWriterError>;

    /// File extension used for committed artifacts produced by this
    /// provider (spec §4.4, `<topic>+<partitionId>+<start>+<end>.<ext>`).
    fn extension(&self) -> &str;
}

/// Newline-delimited JSON, matching the JSON-for-metadata convention
/// already used elsewhere in this crate's storage layer.
#[derive(Debug, Default)]
pub struct JsonLinesWriterProvider;

impl RecordWriterProvider for JsonLinesWriterProvider {
    fn new_writer(
        &self,
        storage: &dyn Storage,
        temp_path: &Path,
        _first_record: &Record,
    ) -> Result<Box<dyn RecordWriter>, RecordWriterError> {
        let sink = storage.create(temp_path).map_err(|e| {
            RecordWriterError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        Ok(Box::new(JsonLinesWriter { sink }))
    }

    fn extension(&self) -> &str {
        "jsonl"
    }
}

struct JsonLinesWriter {
    sink: Box<dyn Write + Send>,
}

impl RecordWriter for JsonLinesWriter {
    fn write(&mut self, timestamp_millis: i64, record: &Record) -> Result<(), RecordWriterError> {
        #[derive(Serialize)]
        struct Line<'a> {
            offset: u64,
            timestamp_millis: i64,
            payload: &'a Value,
        }
        let line = Line {
            offset: record.offset,
            timestamp_millis,
            payload: &record.payload,
        };
        serde_json::to_writer(&mut self.sink, &line)?;
        self.sink.write_all(b"\n")?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), RecordWriterError> {
        self.sink.flush()?;
        Ok(())
    }
}
