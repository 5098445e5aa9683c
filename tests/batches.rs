//! Batch Tests
//!
//! Tests for thread-scoped mutation buffering:
//! - Commit applies everything atomically, Cancel leaves no trace
//! - Reads inside a batch see its writes; other threads do not
//! - Empty commits are no-ops
//! - Operations illegal in a batch are rejected

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use docstore::{
    BatchResult, DocumentCreateInfo, DocumentStore, EphemeralBackend, SetValueKind, StorageError,
    Value, ValueDict,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn store() -> DocumentStore<EphemeralBackend> {
    DocumentStore::new(EphemeralBackend::new())
}

fn props(n: u32) -> ValueDict {
    let mut map = ValueDict::new();
    map.insert("n".into(), Value::U32(n));
    map
}

fn create(store: &DocumentStore<EphemeralBackend>, n: u32) -> String {
    store
        .document_create("thing", vec![DocumentCreateInfo::new(props(n))])
        .unwrap()[0]
        .document_id
        .clone()
}

// =============================================================================
// Cancel Purity
// =============================================================================

/// Scenario: create and update inside a cancelled batch leave nothing.
#[test]
fn test_cancel_discards_all_buffered_changes() {
    let store = store();
    // Establish the type outside the batch
    let existing = create(&store, 1);

    let mut batch_id = String::new();
    store
        .batch(|| {
            batch_id = store
                .document_create("thing", vec![DocumentCreateInfo::new(props(1))])
                .unwrap()[0]
                .document_id
                .clone();
            store
                .document_set(
                    "n",
                    Some(Value::U32(2)),
                    "thing",
                    &batch_id,
                    SetValueKind::Normal,
                )
                .unwrap();
            Ok(BatchResult::Cancel)
        })
        .unwrap();

    assert!(matches!(
        store.document_full_infos("thing", &[batch_id]),
        Err(StorageError::UnknownDocumentId(_))
    ));
    assert_eq!(store.document_count("thing").unwrap(), 1);

    // Pre-existing state is bitwise intact
    let infos = store.document_full_infos("thing", &[existing]).unwrap();
    assert_eq!(infos[0].revision, 1);
    assert_eq!(infos[0].property_map.get("n").unwrap(), &Value::U32(1));
}

/// Cancelled property writes on existing documents leave them untouched.
#[test]
fn test_cancel_restores_existing_document() {
    let store = store();
    let d1 = create(&store, 1);

    store
        .batch(|| {
            store
                .document_set("n", Some(Value::U32(9)), "thing", &d1, SetValueKind::Normal)
                .unwrap();
            store.document_remove("thing", &d1).unwrap();
            Ok(BatchResult::Cancel)
        })
        .unwrap();

    let infos = store.document_full_infos("thing", &[d1]).unwrap();
    assert!(infos[0].active);
    assert_eq!(infos[0].revision, 1);
    assert_eq!(infos[0].property_map.get("n").unwrap(), &Value::U32(1));
}

// =============================================================================
// Commit Semantics
// =============================================================================

/// Commit applies creations, updates, and removals together.
#[test]
fn test_commit_applies_buffered_changes() {
    let store = store();
    let d_update = create(&store, 1);
    let d_remove = create(&store, 2);

    let mut d_new = String::new();
    store
        .batch(|| {
            d_new = store
                .document_create("thing", vec![DocumentCreateInfo::new(props(5))])
                .unwrap()[0]
                .document_id
                .clone();
            store
                .document_set(
                    "n",
                    Some(Value::U32(10)),
                    "thing",
                    &d_update,
                    SetValueKind::Normal,
                )
                .unwrap();
            store.document_remove("thing", &d_remove).unwrap();
            Ok(BatchResult::Commit)
        })
        .unwrap();

    assert_eq!(
        store.document_value("n", "thing", &d_new).unwrap().unwrap(),
        Value::U32(5)
    );
    assert_eq!(
        store
            .document_value("n", "thing", &d_update)
            .unwrap()
            .unwrap(),
        Value::U32(10)
    );
    assert!(!store.document_full_infos("thing", &[d_remove]).unwrap()[0].active);
}

/// Committing an empty batch consumes no revisions and fires nothing.
#[test]
fn test_empty_commit_is_a_no_op() {
    let store = store();
    let d1 = create(&store, 1);

    let notifications = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&notifications);
    store.register_document_changed("thing", move |_doc, _kind| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    store.batch(|| Ok(BatchResult::Commit)).unwrap();

    assert_eq!(notifications.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.document_full_infos("thing", &[d1]).unwrap()[0].revision,
        1
    );
}

/// A document created and removed inside one batch never reaches the
/// backend.
#[test]
fn test_create_then_remove_in_batch_leaves_nothing() {
    let store = store();
    create(&store, 1);

    let mut ghost = String::new();
    store
        .batch(|| {
            ghost = store
                .document_create("thing", vec![DocumentCreateInfo::new(props(7))])
                .unwrap()[0]
                .document_id
                .clone();
            store.document_remove("thing", &ghost).unwrap();
            Ok(BatchResult::Commit)
        })
        .unwrap();

    assert!(matches!(
        store.document_full_infos("thing", &[ghost]),
        Err(StorageError::UnknownDocumentId(_))
    ));
    assert_eq!(store.document_count("thing").unwrap(), 1);
}

// =============================================================================
// Batch Visibility
// =============================================================================

/// Reads inside the batch see buffered writes; the persisted state stays
/// hidden until commit.
#[test]
fn test_batch_reads_reflect_own_writes() {
    let store = store();
    let d1 = create(&store, 1);

    store
        .batch(|| {
            store
                .document_set("n", Some(Value::U32(2)), "thing", &d1, SetValueKind::Normal)
                .unwrap();
            assert_eq!(
                store.document_value("n", "thing", &d1).unwrap().unwrap(),
                Value::U32(2)
            );
            Ok(BatchResult::Cancel)
        })
        .unwrap();

    assert_eq!(
        store.document_value("n", "thing", &d1).unwrap().unwrap(),
        Value::U32(1)
    );
}

/// Another thread does not observe a batch's uncommitted writes.
#[test]
fn test_other_threads_do_not_see_batched_writes() {
    let store = Arc::new(store());
    let d1 = create(&store, 1);

    store
        .batch(|| {
            store
                .document_set("n", Some(Value::U32(2)), "thing", &d1, SetValueKind::Normal)
                .unwrap();

            let observed = std::thread::scope(|scope| {
                let store = Arc::clone(&store);
                let d1 = d1.clone();
                scope
                    .spawn(move || store.document_value("n", "thing", &d1).unwrap().unwrap())
                    .join()
                    .unwrap()
            });
            assert_eq!(observed, Value::U32(1));
            Ok(BatchResult::Cancel)
        })
        .unwrap();
}

// =============================================================================
// Restrictions
// =============================================================================

/// Collection counts are illegal while a batch is open.
#[test]
fn test_collection_count_illegal_in_batch() {
    let store = store();
    store.register_is_included_selector("all", |_doc, _info| true);
    store
        .collection_register(
            "everything",
            "thing",
            vec![],
            1,
            false,
            ValueDict::new(),
            "all",
        )
        .unwrap();

    store
        .batch(|| {
            assert!(matches!(
                store.collection_document_count("everything"),
                Err(StorageError::IllegalInBatch(_))
            ));
            Ok(BatchResult::Cancel)
        })
        .unwrap();
}

/// Nesting a batch on the same thread is rejected.
#[test]
fn test_nested_batch_rejected() {
    let store = store();
    store
        .batch(|| {
            assert!(matches!(
                store.batch(|| Ok(BatchResult::Cancel)),
                Err(StorageError::IllegalInBatch(_))
            ));
            Ok(BatchResult::Cancel)
        })
        .unwrap();
}

/// A proc error discards the batch and propagates.
#[test]
fn test_proc_error_discards_batch() {
    let store = store();
    let d1 = create(&store, 1);

    let result = store.batch(|| {
        store
            .document_set("n", Some(Value::U32(9)), "thing", &d1, SetValueKind::Normal)
            .unwrap();
        Err(StorageError::BackendIo("caller gave up".into()))
    });
    assert!(result.is_err());

    assert_eq!(
        store.document_value("n", "thing", &d1).unwrap().unwrap(),
        Value::U32(1)
    );
    // The thread can open a fresh batch afterwards
    store.batch(|| Ok(BatchResult::Cancel)).unwrap();
}
