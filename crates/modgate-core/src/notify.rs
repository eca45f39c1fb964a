//! Human notification collaborator.
//!
//! [`FileNotifier`] writes one durable request record per notification under
//! `notifications/<correlation_id>.json`; an operator or a webhook relay
//! picks them up from there.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::snapshot::blobs::write_atomic;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification io: {0}")]
    Io(#[from] std::io::Error),

    #[error("notification encoding: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type NotifyResult<T> = std::result::Result<T, NotifyError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    /// `pending` until an operator acts on it.
    pub status: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Record `payload` for a human and return its correlation id.
    async fn notify(&self, payload: serde_json::Value) -> NotifyResult<String>;
}

#[derive(Debug, Clone)]
pub struct FileNotifier {
    dir: PathBuf,
}

impl FileNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn read(&self, correlation_id: &str) -> NotifyResult<Option<Notification>> {
        match std::fs::read(self.dir.join(format!("{correlation_id}.json"))) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every recorded notification, oldest first.
    pub fn list(&self) -> NotifyResult<Vec<Notification>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                out.push(serde_json::from_slice(&std::fs::read(&path)?)?);
            }
        }
        out.sort_by(|a: &Notification, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    async fn notify(&self, payload: serde_json::Value) -> NotifyResult<String> {
        let record = Notification {
            correlation_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            status: "pending".to_string(),
            payload,
        };
        let path = self.dir.join(format!("{}.json", record.correlation_id));
        let bytes = serde_json::to_vec_pretty(&record)?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(std::io::Error::other)??;
        info!(correlation_id = %record.correlation_id, "notification recorded");
        Ok(record.correlation_id)
    }
}
