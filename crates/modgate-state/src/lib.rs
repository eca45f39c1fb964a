//! modgate-state: coordination store for the module promotion pipeline
//!
//! This crate owns every piece of shared mutable state the pipeline relies
//! on: a flat key/value map with optional TTLs and per-key advisory locks.
//!
//! ## Backends
//!
//! - `EtcdBackend`: remote store over the etcd v3 JSON gateway
//! - `FileBackend`: one JSON document on local disk, guarded by `flock`
//! - `fakes::MemoryBackend`: in-process map for tests
//!
//! One backend is chosen by [`open_store`] when the process starts.
//! [`CoordinationStore`] layers bounded lock waiting and `with_lock` on top.

pub mod backend;
mod error;
pub mod etcd;
pub mod fakes;
pub mod file;
mod handle;
pub mod store;

pub use backend::{BackendKind, CoordinationBackend, LockRecord, StoredValue};
pub use error::{StoreError, StoreResult};
pub use etcd::{EtcdBackend, EtcdConfig};
pub use file::FileBackend;
pub use handle::{open_backend, open_store, BackendChoice, StoreConfig};
pub use store::{default_holder_id, BackoffPolicy, CoordinationStore, HeldLock};
