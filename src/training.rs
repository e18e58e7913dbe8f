use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// One classified message, collected for training an external model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub body: String,
    pub sender_name: String,
    pub sender_address: String,
    pub is_spam: bool,
}

pub trait TrainingSink: Send + Sync {
    fn record(&self, record: &TrainingRecord) -> Result<()>;
}

/// Appends one JSON document per line.
pub struct JsonLinesSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonLinesSink {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl TrainingSink for JsonLinesSink {
    fn record(&self, record: &TrainingRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| crate::error::FilterError::Parse(e.to_string()))?;

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
