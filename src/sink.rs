//! Append-only output sink, one JSON record per line.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;

pub trait Sink: Send + Sync {
    /// Append one record. A record that fails to emit is dropped and logged
    /// by the caller, never retried.
    fn push(&self, record: &serde_json::Value) -> Result<()>;
}

pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonlSink { file: Mutex::new(file) })
    }
}

impl Sink for JsonlSink {
    fn push(&self, record: &serde_json::Value) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        serde_json::to_writer(&mut *file, record)?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

/// In-memory sink for orchestrator tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<serde_json::Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<serde_json::Value> {
        self.records.lock().unwrap().clone()
    }
}

impl Sink for MemorySink {
    fn push(&self, record: &serde_json::Value) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
