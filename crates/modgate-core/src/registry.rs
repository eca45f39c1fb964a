//! Module registry: the `modules/` namespace of the coordination store.
//!
//! One [`RegistryEntry`] per `module_id`. Every mutation takes the
//! `promote-<module_id>` lock as proof of exclusive access; entries are never
//! deleted, only marked [`ModuleStatus::Disabled`].

use chrono::{DateTime, Utc};
use modgate_state::{CoordinationStore, HeldLock, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const REGISTRY_PREFIX: &str = "modules/";

/// Lock guarding promotions and repairs of one module.
pub fn promote_lock_key(module_id: &str) -> String {
    format!("promote-{module_id}")
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("module not registered: {0}")]
    NotFound(String),

    #[error("mutation of {module_id} requires holding {expected}")]
    LockNotHeld { module_id: String, expected: String },

    #[error("invalid {what} `{value}`: start with a letter or digit, then letters, digits, '-', '_' or '.'")]
    InvalidIdentifier { what: &'static str, value: String },
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Module ids and categories become path segments; keep them tame.
pub fn validate_identifier(what: &'static str, value: &str) -> RegistryResult<()> {
    let ok = value.len() <= 128
        && value.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(RegistryError::InvalidIdentifier {
            what,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Active,
    Disabled,
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleStatus::Active => write!(f, "active"),
            ModuleStatus::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub module_id: String,
    pub category: String,
    /// Relative paths of this version's files, sorted.
    pub file_manifest: Vec<String>,
    pub status: ModuleStatus,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Build provenance.
    #[serde(default)]
    pub manifest: serde_json::Value,
    /// Hex sha256 over the promoted files.
    #[serde(default)]
    pub signature: Option<String>,
    /// Incremented on every promotion or rollback.
    pub version: u64,
    /// Snapshot of the files this version replaced.
    #[serde(default)]
    pub previous_snapshot: Option<String>,
}

impl RegistryEntry {
    pub fn is_active(&self) -> bool {
        self.status == ModuleStatus::Active
    }
}

/// Inputs of a successful promotion.
#[derive(Debug, Clone)]
pub struct Promotion {
    pub module_id: String,
    pub category: String,
    pub file_manifest: Vec<String>,
    pub manifest: serde_json::Value,
    pub signature: String,
    pub previous_snapshot: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    store: CoordinationStore,
}

impl ModuleRegistry {
    pub fn new(store: CoordinationStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CoordinationStore {
        &self.store
    }

    fn key(module_id: &str) -> String {
        format!("{REGISTRY_PREFIX}{module_id}")
    }

    fn check_lock(lock: &HeldLock, module_id: &str) -> RegistryResult<()> {
        let expected = promote_lock_key(module_id);
        let lapsed = chrono::Duration::from_std(lock.ttl())
            .map(|ttl| Utc::now() > lock.acquired_at() + ttl)
            .unwrap_or(false);
        if lock.key() != expected || lapsed {
            return Err(RegistryError::LockNotHeld {
                module_id: module_id.to_string(),
                expected,
            });
        }
        Ok(())
    }

    pub async fn get(&self, module_id: &str) -> RegistryResult<Option<RegistryEntry>> {
        Ok(self.store.get_json(&Self::key(module_id)).await?)
    }

    pub async fn require(&self, module_id: &str) -> RegistryResult<RegistryEntry> {
        self.get(module_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(module_id.to_string()))
    }

    /// Every entry, ordered by module id.
    pub async fn list(&self) -> RegistryResult<Vec<RegistryEntry>> {
        let mut entries = Vec::new();
        for key in self.store.list_keys(REGISTRY_PREFIX).await? {
            if let Some(entry) = self.store.get_json::<RegistryEntry>(&key).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        Ok(entries)
    }

    /// Create or replace the entry for a promoted version; always `Active`.
    pub async fn record_promotion(
        &self,
        lock: &HeldLock,
        promotion: Promotion,
    ) -> RegistryResult<RegistryEntry> {
        Self::check_lock(lock, &promotion.module_id)?;
        let now = Utc::now();
        let existing = self.get(&promotion.module_id).await?;
        let entry = RegistryEntry {
            module_id: promotion.module_id,
            category: promotion.category,
            file_manifest: promotion.file_manifest,
            status: ModuleStatus::Active,
            registered_at: existing.as_ref().map(|e| e.registered_at).unwrap_or(now),
            updated_at: now,
            manifest: promotion.manifest,
            signature: Some(promotion.signature),
            version: existing.as_ref().map(|e| e.version + 1).unwrap_or(1),
            previous_snapshot: promotion.previous_snapshot,
        };
        self.store.put_json(&Self::key(&entry.module_id), &entry, None).await?;
        info!(module_id = %entry.module_id, version = entry.version, "registry entry promoted");
        Ok(entry)
    }

    pub async fn set_status(
        &self,
        lock: &HeldLock,
        module_id: &str,
        status: ModuleStatus,
    ) -> RegistryResult<RegistryEntry> {
        Self::check_lock(lock, module_id)?;
        let mut entry = self.require(module_id).await?;
        entry.status = status;
        entry.updated_at = Utc::now();
        self.store.put_json(&Self::key(module_id), &entry, None).await?;
        info!(module_id = %module_id, status = %status, "registry status changed");
        Ok(entry)
    }

    /// Write `entry` back verbatim, e.g. to undo a promotion.
    pub async fn put_entry(&self, lock: &HeldLock, entry: &RegistryEntry) -> RegistryResult<()> {
        Self::check_lock(lock, &entry.module_id)?;
        self.store.put_json(&Self::key(&entry.module_id), entry, None).await?;
        Ok(())
    }

    /// Record a rollback to `file_manifest`; bumps the version.
    ///
    /// `previous_snapshot` becomes the next default rollback target, so
    /// repeated rollbacks step back through history.
    pub async fn record_rollback(
        &self,
        lock: &HeldLock,
        module_id: &str,
        file_manifest: Vec<String>,
        snapshot_id: &str,
        previous_snapshot: Option<String>,
    ) -> RegistryResult<RegistryEntry> {
        Self::check_lock(lock, module_id)?;
        let mut entry = self.require(module_id).await?;
        entry.file_manifest = file_manifest;
        entry.previous_snapshot = previous_snapshot;
        entry.status = ModuleStatus::Active;
        entry.updated_at = Utc::now();
        entry.version += 1;
        entry.signature = None;
        match entry.manifest.as_object_mut() {
            Some(map) => {
                map.insert("restored_from".into(), snapshot_id.into());
            }
            None => entry.manifest = serde_json::json!({ "restored_from": snapshot_id }),
        }
        self.store.put_json(&Self::key(module_id), &entry, None).await?;
        Ok(entry)
    }
}
