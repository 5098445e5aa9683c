//! Document CRUD Tests
//!
//! Tests for the core document lifecycle:
//! - Create, read, update, remove against the public façade
//! - Revision monotonicity per document type
//! - Tombstones excluded from active iteration but kept for full infos
//! - Typed value accessors fail without mutating state

use docstore::{
    DocumentCreateInfo, DocumentStore, EphemeralBackend, SetValueKind, StorageError, Value,
    ValueDict,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn store() -> DocumentStore<EphemeralBackend> {
    DocumentStore::new(EphemeralBackend::new())
}

fn thing_props(n: u32, s: &str) -> ValueDict {
    let mut props = ValueDict::new();
    props.insert("n".into(), Value::U32(n));
    props.insert("s".into(), Value::String(s.into()));
    props
}

// =============================================================================
// Create / Read / Update / Remove
// =============================================================================

/// Scenario: create, read, update, remove one document.
#[test]
fn test_create_read_update_remove() {
    let store = store();

    let results = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(3, "hi"))])
        .unwrap();
    assert_eq!(results.len(), 1);
    let d1 = results[0].document_id.clone();
    assert_eq!(results[0].revision, 1);

    assert_eq!(
        store.document_value("n", "thing", &d1).unwrap().unwrap(),
        Value::U32(3)
    );

    store
        .document_set("n", Some(Value::U32(5)), "thing", &d1, SetValueKind::Normal)
        .unwrap();
    assert_eq!(
        store.document_value("n", "thing", &d1).unwrap().unwrap(),
        Value::U32(5)
    );
    let infos = store.document_full_infos("thing", &[d1.clone()]).unwrap();
    assert_eq!(infos[0].revision, 2);

    store.document_remove("thing", &d1).unwrap();
    let mut active = Vec::new();
    store
        .document_iterate_all("thing", true, |doc| active.push(doc.document_id.clone()))
        .unwrap();
    assert!(active.is_empty());

    let infos = store.document_full_infos("thing", &[d1]).unwrap();
    assert!(!infos[0].active);
}

/// Revisions increase strictly with every content-changing write.
#[test]
fn test_revisions_are_strictly_increasing() {
    let store = store();
    let d1 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(1, "a"))])
        .unwrap()[0]
        .document_id
        .clone();
    let d2 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(2, "b"))])
        .unwrap()[0]
        .document_id
        .clone();

    let mut last = 0;
    for step in 0..4u32 {
        let target = if step % 2 == 0 { &d1 } else { &d2 };
        store
            .document_set(
                "n",
                Some(Value::U32(step + 10)),
                "thing",
                target,
                SetValueKind::Normal,
            )
            .unwrap();
        let revision = store.document_full_infos("thing", &[target.clone()]).unwrap()[0].revision;
        assert!(revision > last);
        last = revision;
    }
}

/// A write that repeats the current value still consumes a revision.
#[test]
fn test_identical_write_still_bumps_revision() {
    let store = store();
    let d1 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(1, "a"))])
        .unwrap()[0]
        .document_id
        .clone();

    store
        .document_set("n", Some(Value::U32(1)), "thing", &d1, SetValueKind::Normal)
        .unwrap();
    assert_eq!(
        store.document_full_infos("thing", &[d1]).unwrap()[0].revision,
        2
    );
}

/// Modification time never precedes creation time.
#[test]
fn test_modification_time_after_creation_time() {
    let store = store();
    let d1 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(1, "a"))])
        .unwrap()[0]
        .document_id
        .clone();

    store
        .document_set("n", Some(Value::U32(2)), "thing", &d1, SetValueKind::Normal)
        .unwrap();

    let creation = store.document_creation_time("thing", &d1).unwrap();
    let modification = store.document_modification_time("thing", &d1).unwrap();
    assert!(modification >= creation);
}

/// Caller-supplied ids are honored; duplicates are rejected.
#[test]
fn test_caller_supplied_ids() {
    let store = store();
    store
        .document_create(
            "thing",
            vec![DocumentCreateInfo::with_id("mine", thing_props(1, "a"))],
        )
        .unwrap();
    assert_eq!(
        store.document_value("n", "thing", "mine").unwrap().unwrap(),
        Value::U32(1)
    );

    // Same id again, even under another type
    assert!(store
        .document_create(
            "other",
            vec![DocumentCreateInfo::with_id("mine", ValueDict::new())],
        )
        .is_err());
}

// =============================================================================
// Tombstone Behavior
// =============================================================================

/// Removing twice is a no-op; the tombstone consumes one revision.
#[test]
fn test_remove_is_final_and_idempotent() {
    let store = store();
    let d1 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(1, "a"))])
        .unwrap()[0]
        .document_id
        .clone();

    store.document_remove("thing", &d1).unwrap();
    let revision = store.document_full_infos("thing", &[d1.clone()]).unwrap()[0].revision;
    assert_eq!(revision, 2);

    store.document_remove("thing", &d1).unwrap();
    let infos = store.document_full_infos("thing", &[d1.clone()]).unwrap();
    assert!(!infos[0].active);
    assert_eq!(infos[0].revision, revision);

    // Writes on a tombstoned document are no-ops
    store
        .document_set("n", Some(Value::U32(99)), "thing", &d1, SetValueKind::Normal)
        .unwrap();
    let infos = store.document_full_infos("thing", &[d1]).unwrap();
    assert_eq!(infos[0].property_map.get("n").unwrap(), &Value::U32(1));
}

/// Active document count excludes tombstones.
#[test]
fn test_count_tracks_active_documents() {
    let store = store();
    let d1 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(1, "a"))])
        .unwrap()[0]
        .document_id
        .clone();
    store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(2, "b"))])
        .unwrap();

    assert_eq!(store.document_count("thing").unwrap(), 2);
    store.document_remove("thing", &d1).unwrap();
    assert_eq!(store.document_count("thing").unwrap(), 1);
}

// =============================================================================
// Errors
// =============================================================================

/// Unknown names fail with the matching error kind and no side effects.
#[test]
fn test_unknown_lookups_fail() {
    let store = store();
    assert!(matches!(
        store.document_count("nope"),
        Err(StorageError::UnknownDocumentType(_))
    ));

    store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(1, "a"))])
        .unwrap();
    assert!(matches!(
        store.document_value("n", "thing", "missing"),
        Err(StorageError::UnknownDocumentId(_))
    ));
    assert!(matches!(
        store.document_full_infos("thing", &["missing".to_string()]),
        Err(StorageError::UnknownDocumentId(_))
    ));
}

/// Reading through the wrong typed accessor fails and changes nothing.
#[test]
fn test_wrong_value_type_read() {
    let store = store();
    let d1 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(3, "hi"))])
        .unwrap()[0]
        .document_id
        .clone();

    let value = store.document_value("n", "thing", &d1).unwrap().unwrap();
    assert!(matches!(
        value.as_str(),
        Err(StorageError::WrongValueType { .. })
    ));
    assert!(matches!(
        value.as_i64(),
        Err(StorageError::WrongValueType { .. })
    ));

    // The stored value is untouched
    assert_eq!(
        store.document_value("n", "thing", &d1).unwrap().unwrap(),
        Value::U32(3)
    );
}

// =============================================================================
// Property Semantics
// =============================================================================

/// Setting a property to None removes it.
#[test]
fn test_set_none_removes_property() {
    let store = store();
    let d1 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(1, "a"))])
        .unwrap()[0]
        .document_id
        .clone();

    store
        .document_set("s", None, "thing", &d1, SetValueKind::Normal)
        .unwrap();
    assert!(store.document_value("s", "thing", &d1).unwrap().is_none());
}

/// Universal-time writes re-tag the value as time.
#[test]
fn test_universal_time_set_kind() {
    let store = store();
    let d1 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(1, "a"))])
        .unwrap()[0]
        .document_id
        .clone();

    store
        .document_set(
            "at",
            Some(Value::F64(1_700_000_000.5)),
            "thing",
            &d1,
            SetValueKind::UniversalTime,
        )
        .unwrap();
    let value = store.document_value("at", "thing", &d1).unwrap().unwrap();
    assert_eq!(value.as_time().unwrap(), 1_700_000_000.5);
}

// =============================================================================
// Info Namespaces
// =============================================================================

/// Caller and engine key-value namespaces are independent.
#[test]
fn test_info_namespaces_are_separate() {
    let store = store();
    let mut info = std::collections::HashMap::new();
    info.insert("greeting".to_string(), "hello".to_string());
    store.info_set(&info).unwrap();
    store.internal_set(&info).unwrap();

    let mut replacement = std::collections::HashMap::new();
    replacement.insert("greeting".to_string(), "goodbye".to_string());
    store.internal_set(&replacement).unwrap();

    let public = store.info_get(&["greeting"]).unwrap();
    assert_eq!(public.get("greeting").map(String::as_str), Some("hello"));
    let internal = store.internal_get(&["greeting"]).unwrap();
    assert_eq!(internal.get("greeting").map(String::as_str), Some("goodbye"));

    store.info_remove(&["greeting"]).unwrap();
    assert!(store.info_get(&["greeting"]).unwrap().is_empty());
}

// =============================================================================
// Change Notifications
// =============================================================================

/// Created / Updated / Removed callbacks fire in order on the mutating
/// thread.
#[test]
fn test_change_notifications() {
    use docstore::DocumentChangedKind;
    use std::sync::{Arc, Mutex};

    let store = store();
    let seen: Arc<Mutex<Vec<DocumentChangedKind>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    store.register_document_changed("thing", move |_doc, kind| {
        sink.lock().unwrap().push(kind);
    });

    let d1 = store
        .document_create("thing", vec![DocumentCreateInfo::new(thing_props(1, "a"))])
        .unwrap()[0]
        .document_id
        .clone();
    store
        .document_set("n", Some(Value::U32(2)), "thing", &d1, SetValueKind::Normal)
        .unwrap();
    store.document_remove("thing", &d1).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            DocumentChangedKind::Created,
            DocumentChangedKind::Updated,
            DocumentChangedKind::Removed,
        ]
    );
}
