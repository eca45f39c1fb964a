//! Contract tests for `CoordinationBackend`.
//!
//! Every backend must pass the same behavioral contract. The memory fake and
//! the local file backend are exercised here; the etcd backend is covered by
//! its unit tests and shares the same trait.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use modgate_state::fakes::MemoryBackend;
use modgate_state::{
    CoordinationBackend, CoordinationStore, FileBackend, LockRecord, StoreError,
};
use serde_json::json;

// ===========================================================================
// Contract bodies
// ===========================================================================

async fn put_get_round_trip(b: &dyn CoordinationBackend) {
    b.put("modules/a", json!({"status": "active"}), None)
        .await
        .unwrap();
    assert_eq!(
        b.get("modules/a").await.unwrap(),
        Some(json!({"status": "active"}))
    );
}

async fn get_missing_is_none(b: &dyn CoordinationBackend) {
    assert_eq!(b.get("nope").await.unwrap(), None);
}

async fn put_overwrites(b: &dyn CoordinationBackend) {
    b.put("k", json!(1), None).await.unwrap();
    b.put("k", json!(2), None).await.unwrap();
    assert_eq!(b.get("k").await.unwrap(), Some(json!(2)));
}

async fn delete_removes_and_is_idempotent(b: &dyn CoordinationBackend) {
    b.put("k", json!("v"), None).await.unwrap();
    b.delete("k").await.unwrap();
    assert_eq!(b.get("k").await.unwrap(), None);
    b.delete("k").await.unwrap();
}

async fn list_keys_filters_by_prefix_sorted(b: &dyn CoordinationBackend) {
    for key in ["modules/b", "modules/a", "approvals/x", "modules/c"] {
        b.put(key, json!(null), None).await.unwrap();
    }
    assert_eq!(
        b.list_keys("modules/").await.unwrap(),
        vec!["modules/a", "modules/b", "modules/c"]
    );
    assert_eq!(b.list_keys("missing/").await.unwrap(), Vec::<String>::new());
}

async fn ttl_values_expire(b: &dyn CoordinationBackend) {
    b.put("ephemeral", json!(true), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(b.get("ephemeral").await.unwrap(), Some(json!(true)));
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(b.get("ephemeral").await.unwrap(), None);
    assert!(!b
        .list_keys("")
        .await
        .unwrap()
        .contains(&"ephemeral".to_string()));
}

async fn lock_is_exclusive(b: &dyn CoordinationBackend) {
    let ttl = Duration::from_secs(30);
    assert!(b.try_lock("promote-m", "a", ttl).await.unwrap());
    assert!(!b.try_lock("promote-m", "b", ttl).await.unwrap());
    assert!(!b.try_lock("promote-m", "a", ttl).await.unwrap());
    assert_eq!(
        b.lock_info("promote-m").await.unwrap().map(|r| r.holder),
        Some("a".to_string())
    );
}

async fn unlock_frees_lock(b: &dyn CoordinationBackend) {
    let ttl = Duration::from_secs(30);
    assert!(b.try_lock("k", "a", ttl).await.unwrap());
    b.unlock("k", "a").await.unwrap();
    assert!(b.lock_info("k").await.unwrap().is_none());
    assert!(b.try_lock("k", "b", ttl).await.unwrap());
}

async fn unlock_by_other_holder_rejected(b: &dyn CoordinationBackend) {
    assert!(b.try_lock("k", "a", Duration::from_secs(30)).await.unwrap());
    match b.unlock("k", "intruder").await {
        Err(StoreError::NotLockHolder { key, holder }) => {
            assert_eq!(key, "k");
            assert_eq!(holder, "intruder");
        }
        other => panic!("expected NotLockHolder, got {:?}", other),
    }
}

async fn unlock_absent_is_ok(b: &dyn CoordinationBackend) {
    b.unlock("never-locked", "a").await.unwrap();
}

async fn expired_lock_is_reacquirable(b: &dyn CoordinationBackend) {
    assert!(b.try_lock("k", "a", Duration::from_secs(1)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(b.lock_info("k").await.unwrap().is_none());
    assert!(b.try_lock("k", "b", Duration::from_secs(30)).await.unwrap());
}

async fn locks_do_not_appear_as_keys(b: &dyn CoordinationBackend) {
    assert!(b.try_lock("promote-z", "a", Duration::from_secs(30)).await.unwrap());
    assert!(b.list_keys("").await.unwrap().is_empty());
}

macro_rules! backend_contract {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn put_get_round_trip() {
                let (_guard, b) = $make;
                super::put_get_round_trip(b.as_ref()).await;
            }

            #[tokio::test]
            async fn get_missing_is_none() {
                let (_guard, b) = $make;
                super::get_missing_is_none(b.as_ref()).await;
            }

            #[tokio::test]
            async fn put_overwrites() {
                let (_guard, b) = $make;
                super::put_overwrites(b.as_ref()).await;
            }

            #[tokio::test]
            async fn delete_removes_and_is_idempotent() {
                let (_guard, b) = $make;
                super::delete_removes_and_is_idempotent(b.as_ref()).await;
            }

            #[tokio::test]
            async fn list_keys_filters_by_prefix_sorted() {
                let (_guard, b) = $make;
                super::list_keys_filters_by_prefix_sorted(b.as_ref()).await;
            }

            #[tokio::test]
            async fn ttl_values_expire() {
                let (_guard, b) = $make;
                super::ttl_values_expire(b.as_ref()).await;
            }

            #[tokio::test]
            async fn lock_is_exclusive() {
                let (_guard, b) = $make;
                super::lock_is_exclusive(b.as_ref()).await;
            }

            #[tokio::test]
            async fn unlock_frees_lock() {
                let (_guard, b) = $make;
                super::unlock_frees_lock(b.as_ref()).await;
            }

            #[tokio::test]
            async fn unlock_by_other_holder_rejected() {
                let (_guard, b) = $make;
                super::unlock_by_other_holder_rejected(b.as_ref()).await;
            }

            #[tokio::test]
            async fn unlock_absent_is_ok() {
                let (_guard, b) = $make;
                super::unlock_absent_is_ok(b.as_ref()).await;
            }

            #[tokio::test]
            async fn expired_lock_is_reacquirable() {
                let (_guard, b) = $make;
                super::expired_lock_is_reacquirable(b.as_ref()).await;
            }

            #[tokio::test]
            async fn locks_do_not_appear_as_keys() {
                let (_guard, b) = $make;
                super::locks_do_not_appear_as_keys(b.as_ref()).await;
            }
        }
    };
}

fn memory_backend() -> ((), Arc<dyn CoordinationBackend>) {
    ((), Arc::new(MemoryBackend::new()))
}

fn file_backend() -> (tempfile::TempDir, Arc<dyn CoordinationBackend>) {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileBackend::open(dir.path().join("state")).unwrap();
    (dir, Arc::new(backend))
}

backend_contract!(memory, memory_backend());
backend_contract!(file, file_backend());

// ===========================================================================
// CoordinationStore over each backend
// ===========================================================================

#[tokio::test]
async fn file_store_with_lock_serializes_critical_sections() {
    let (_dir, backend) = file_backend();
    let store = CoordinationStore::new(backend);
    let log = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));

    let mut tasks = Vec::new();
    for i in 0..4 {
        let store = store.clone();
        let log = Arc::clone(&log);
        tasks.push(tokio::spawn(async move {
            store
                .with_lock::<_, StoreError, _, _>(
                    "promote-shared",
                    Duration::from_secs(30),
                    Duration::from_secs(10),
                    |_| async move {
                        log.lock().await.push(format!("start-{i}"));
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        log.lock().await.push(format!("end-{i}"));
                        Ok(())
                    },
                )
                .await
        }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }

    let log = log.lock().await;
    assert_eq!(log.len(), 8);
    for pair in log.chunks(2) {
        let start = pair[0].strip_prefix("start-").unwrap();
        let end = pair[1].strip_prefix("end-").unwrap();
        assert_eq!(start, end, "critical sections interleaved: {:?}", *log);
    }
}

#[tokio::test]
async fn stale_lock_from_crashed_process_is_taken_over() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_lock(
        "promote-m",
        LockRecord {
            holder: "modgate_1_dead".into(),
            acquired_at: Utc::now() - chrono::Duration::seconds(600),
            ttl: 60,
        },
    );
    let store = CoordinationStore::new(backend);
    let held = store
        .lock("promote-m", Duration::from_secs(60), Duration::ZERO)
        .await
        .unwrap();
    assert!(held.holder().starts_with(store.holder()));
}

#[tokio::test]
async fn unavailable_backend_surfaces_error() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_unavailable(true);
    let store = CoordinationStore::new(backend);
    match store.put("k", json!(1), None).await {
        Err(e) => assert!(e.is_unavailable()),
        Ok(()) => panic!("expected Unavailable"),
    }
}
