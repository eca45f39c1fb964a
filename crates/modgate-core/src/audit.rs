//! Append-only JSON-lines audit log.
//!
//! One object per line with at least `timestamp`, `action`, `module_id` and
//! `outcome`. Appends from one process are serialized by a mutex and each
//! line is flushed to disk before the call returns.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit io: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit encoding: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit log lock poisoned")]
    Poisoned,
}

pub type AuditResult<T> = std::result::Result<T, AuditError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub module_id: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl AuditRecord {
    pub fn new(action: impl Into<String>, module_id: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            module_id: module_id.into(),
            outcome: outcome.into(),
            run_id: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_blocking(&self, line: &[u8]) -> AuditResult<()> {
        let mut guard = self.file.lock().map_err(|_| AuditError::Poisoned)?;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(line)?;
            file.sync_data()?;
        }
        Ok(())
    }

    pub async fn append(&self, record: AuditRecord) -> AuditResult<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.append_blocking(&line))
            .await
            .map_err(std::io::Error::other)?
    }

    /// The last `n` records, oldest first. Unparseable lines are skipped.
    pub fn tail(&self, n: usize) -> AuditResult<Vec<AuditRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Ok(record) = serde_json::from_str::<AuditRecord>(&line) {
                records.push(record);
            }
        }
        let skip = records.len().saturating_sub(n);
        Ok(records.split_off(skip))
    }
}
