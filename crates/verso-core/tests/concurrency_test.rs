//! Integration tests for concurrent saves on one entity.
//!
//! Separate `Database::open` calls get separate SQLite connections to the
//! same file, so the threads contend exactly like separate processes would.

use std::sync::{Arc, Barrier};
use std::thread;

use serde_json::json;
use tracing_subscriber::EnvFilter;
use verso_core::{
    ArchiveStrategy, Database, FieldType, Record, Schema, SqliteVersionedStore, StoreConfig,
    VersionDiffer, VersoError, VersionedStore,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn counters() -> Schema {
    Schema::new("counters")
        .required_field("label", FieldType::Text)
        .field("total", FieldType::Integer)
}

fn open(config: &StoreConfig) -> SqliteVersionedStore {
    Database::open(config.clone())
        .unwrap()
        .versioned(counters())
        .unwrap()
}

fn race(strategy: ArchiveStrategy) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::builder()
        .database_path(dir.path().join("race.db"))
        .busy_timeout_ms(10_000)
        .archive_strategy(strategy)
        .build();

    // Bring the entity to version 2
    let setup = open(&config);
    let mut record = Record::new("counters").with("label", "start").with("total", 0);
    setup.save(&mut record).unwrap();
    record.set("label", "second").unwrap();
    setup.save(&mut record).unwrap();
    assert_eq!(record.version(), Some(2));
    let model_id = record.model_id().cloned().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let store = open(&config);
            let barrier = Arc::clone(&barrier);
            let mut mine = record.clone();
            thread::spawn(move || {
                mine.set("label", format!("writer-{}", i)).unwrap();
                barrier.wait();
                store.save(&mut mine)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one writer produces version 3");
    for result in &results {
        match result {
            Ok(saved) => assert_eq!(saved.row.version, 3),
            Err(VersoError::ConcurrentVersionConflict {
                expected, found, ..
            }) => {
                assert_eq!(*expected, 2);
                assert_eq!(*found, Some(3));
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    let chain = setup.load_chain(&model_id).unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain.rows().iter().filter(|r| r.is_current).count(), 1);
    chain.validate("counters").unwrap();
    assert!(setup.audit().unwrap().is_clean());
}

#[test]
fn test_concurrent_major_edits_copy_on_archive() {
    race(ArchiveStrategy::CopyOnArchive);
}

#[test]
fn test_concurrent_major_edits_promote_new_row() {
    race(ArchiveStrategy::PromoteNewRow);
}

#[test]
fn test_conflicting_writer_can_retry_after_reload() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::builder()
        .database_path(dir.path().join("retry.db"))
        .build();
    let first = open(&config);
    let second = open(&config);

    let mut record = Record::new("counters").with("label", "a");
    first.save(&mut record).unwrap();
    let mut stale = record.clone();

    record.set("label", "b").unwrap();
    first.save(&mut record).unwrap();

    stale.set("label", "c").unwrap();
    let err = second.save(&mut stale).unwrap_err();
    assert!(err.is_retryable());

    let model_id = stale.model_id().cloned().unwrap();
    let mut fresh = Record::from_row(second.find_current(&model_id).unwrap().unwrap());
    fresh.set("label", "c").unwrap();
    let saved = second.save(&mut fresh).unwrap();
    assert_eq!(saved.row.version, 3);
}

fn patch_then_major_edit(strategy: ArchiveStrategy) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::builder()
        .database_path(dir.path().join("interleave.db"))
        .archive_strategy(strategy)
        .build();
    let first = open(&config);
    let second = open(&config);

    let mut record = Record::new("counters").with("label", "a").with("total", 1);
    first.save(&mut record).unwrap();

    // Another writer bumps the total in place; the version stays at 1
    let mut other = record.clone();
    other.set("total", 5).unwrap();
    second.save_minor(&mut other).unwrap();
    assert_eq!(other.version(), Some(1));

    record.set("label", "b").unwrap();
    let saved = first.save(&mut record).unwrap();
    assert_eq!(saved.row.version, 2);
    assert_eq!(saved.row.get("total"), Some(&json!(5)));

    let model_id = record.model_id().cloned().unwrap();
    let current = second.find_current(&model_id).unwrap().unwrap();
    assert_eq!(current.get_str("label"), Some("b"));
    assert_eq!(current.get("total"), Some(&json!(5)));

    let rows = second.find_all_versions(&model_id).unwrap();
    let diff = VersionDiffer::new().diff(&rows[0], &rows[1], &[]).unwrap();
    assert_eq!(diff.into_keys().collect::<Vec<_>>(), vec!["label".to_string()]);
}

#[test]
fn test_major_edit_keeps_other_writers_patch_copy_on_archive() {
    patch_then_major_edit(ArchiveStrategy::CopyOnArchive);
}

#[test]
fn test_major_edit_keeps_other_writers_patch_promote_new_row() {
    patch_then_major_edit(ArchiveStrategy::PromoteNewRow);
}

#[test]
fn test_concurrent_creates_get_distinct_model_ids() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::builder()
        .database_path(dir.path().join("creates.db"))
        .busy_timeout_ms(10_000)
        .build();
    open(&config);

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let store = open(&config);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut record = Record::new("counters").with("label", format!("c{}", i));
                barrier.wait();
                store.save(&mut record).unwrap().row.model_id
            })
        })
        .collect();

    let mut ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);

    let store = open(&config);
    assert_eq!(
        store.count(&verso_core::Query::current()).unwrap(),
        4
    );
}
