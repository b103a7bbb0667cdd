//! Concurrent writers against the same state document.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cascade::domain::models::{LockBackend, LockConfig};
use cascade::domain::DomainError;
use cascade::infrastructure::locking::LockManager;
use cascade::infrastructure::state::StateStore;
use serde::{Deserialize, Serialize};

use common::fast_locks;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
    value: u64,
}

const THREADS: u64 = 8;
const INCREMENTS: u64 = 25;

fn hammer(store: &StateStore) {
    let store = Arc::new(store.clone());
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    store
                        .update_json("counter.json", |counter: &mut Counter| {
                            counter.value += 1;
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

fn store_with(backend: LockBackend) -> (tempfile::TempDir, StateStore) {
    let dir = tempfile::tempdir().unwrap();
    let config = LockConfig {
        backend,
        ..fast_locks()
    };
    let locks = LockManager::new(dir.path().join("locks"), &config);
    let store = StateStore::new(dir.path(), locks);
    (dir, store)
}

#[test]
fn test_native_lock_serializes_read_modify_write() {
    let (_dir, store) = store_with(LockBackend::Native);
    hammer(&store);
    let counter: Counter = store.read_json("counter.json").unwrap().unwrap();
    assert_eq!(counter.value, THREADS * INCREMENTS);
}

#[test]
fn test_pid_file_lock_serializes_read_modify_write() {
    let (_dir, store) = store_with(LockBackend::PidFile);
    hammer(&store);
    let counter: Counter = store.read_json("counter.json").unwrap().unwrap();
    assert_eq!(counter.value, THREADS * INCREMENTS);
    assert!(
        !store.locks().dir().join("counter.json.lock").exists(),
        "pid marker is removed on release"
    );
}

#[test]
fn test_held_lock_times_out_with_retriable_error() {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockManager::new(dir.path().join("locks"), &fast_locks());
    let _held = locks.acquire("prd.json").unwrap();

    let contender = locks.clone().with_timeout(Duration::from_millis(100));
    let err = thread::spawn(move || contender.acquire("prd.json").map(|_| ()))
        .join()
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, DomainError::LockTimeout { ref name, .. } if name == "prd.json"));
    assert!(err.is_retriable());
}

#[test]
fn test_writes_are_atomic_for_readers() {
    let (_dir, store) = store_with(LockBackend::Native);
    store
        .write_json("counter.json", &Counter { value: 1 })
        .unwrap();

    let reader = {
        let store = store.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                let counter: Counter = store.read_json("counter.json").unwrap().unwrap();
                assert!(counter.value >= 1);
            }
        })
    };
    for value in 2..100 {
        store.write_json("counter.json", &Counter { value }).unwrap();
    }
    reader.join().unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(store.root())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}
