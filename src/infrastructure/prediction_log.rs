use crate::domain::ports::PredictionLog;
use crate::domain::types::PredictionRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

/// Append-only plain-text log, one formatted prediction per line. The file
/// is created on first append.
pub struct FilePredictionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FilePredictionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl PredictionLog for FilePredictionLog {
    async fn append(&self, record: &PredictionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open prediction log {:?}", self.path))?;
        writeln!(file, "{}", record.to_line())
            .with_context(|| format!("Failed to append to prediction log {:?}", self.path))?;

        debug!(
            "FilePredictionLog: Recorded {} prediction for bar {}",
            record.symbol, record.timestamp
        );
        Ok(())
    }
}
