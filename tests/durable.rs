//! Durable Backend Tests
//!
//! Tests for the SQLite-backed store across process restarts:
//! - Documents, properties, and attachments survive reopen
//! - Revision counters continue where they left off
//! - Derived structures keep their contents when re-registered unchanged
//!   and rebuild on version changes
//! - The engine schema version is initialized on fresh creation

use std::path::PathBuf;

use docstore::{
    AssociationUpdate, DocumentCreateInfo, DocumentStore, SetValueKind, SqliteBackend, Value,
    ValueDict,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("store.db")
}

fn open_store(dir: &TempDir) -> DocumentStore<SqliteBackend> {
    let store = DocumentStore::new(SqliteBackend::open(db_path(dir)).unwrap());
    store.register_is_included_selector("positiveN", |doc, _info| {
        doc.property_map
            .get("n")
            .and_then(|value| value.coerce_i64().ok())
            .map(|n| n > 0)
            .unwrap_or(false)
    });
    store
}

fn create_thing(store: &DocumentStore<SqliteBackend>, n: i64) -> String {
    let mut props = ValueDict::new();
    props.insert("n".into(), Value::I64(n));
    store
        .document_create("thing", vec![DocumentCreateInfo::new(props)])
        .unwrap()[0]
        .document_id
        .clone()
}

fn register_positives(store: &DocumentStore<SqliteBackend>, version: u32) {
    store
        .collection_register(
            "positives",
            "thing",
            vec!["n".into()],
            version,
            false,
            ValueDict::new(),
            "positiveN",
        )
        .unwrap();
}

// =============================================================================
// Restart Behavior
// =============================================================================

/// Fresh stores record schema version 1.
#[test]
fn test_fresh_store_version() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let info = store.info_get(&["version"]).unwrap();
    assert_eq!(info.get("version").map(String::as_str), Some("1"));
}

/// Documents and revision counters survive a reopen.
#[test]
fn test_documents_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let d1;
    {
        let store = open_store(&dir);
        d1 = create_thing(&store, 3);
        store
            .document_set("n", Some(Value::I64(5)), "thing", &d1, SetValueKind::Normal)
            .unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.document_count("thing").unwrap(), 1);
    // JSON round trip: non-negative integers come back as u32
    assert_eq!(
        store.document_value("n", "thing", &d1).unwrap().unwrap(),
        Value::U32(5)
    );
    let infos = store.document_full_infos("thing", &[d1]).unwrap();
    assert_eq!(infos[0].revision, 2);

    // The next write continues the revision sequence
    let d2 = create_thing(&store, 1);
    let infos = store.document_full_infos("thing", &[d2]).unwrap();
    assert_eq!(infos[0].revision, 3);
}

/// Tombstones survive a reopen.
#[test]
fn test_tombstones_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let d1;
    {
        let store = open_store(&dir);
        d1 = create_thing(&store, 3);
        store.document_remove("thing", &d1).unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.document_count("thing").unwrap(), 0);
    let infos = store.document_full_infos("thing", &[d1]).unwrap();
    assert!(!infos[0].active);
}

/// Attachment info and content survive a reopen.
#[test]
fn test_attachments_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let d1;
    let attachment_id;
    {
        let store = open_store(&dir);
        d1 = create_thing(&store, 1);
        let mut info = ValueDict::new();
        info.insert("kind".into(), Value::String("text".into()));
        attachment_id = store
            .document_attachment_add("thing", &d1, info, b"hello")
            .unwrap()
            .id;
    }

    let store = open_store(&dir);
    let info_map = store.document_attachment_info_map("thing", &d1).unwrap();
    assert_eq!(info_map.get(&attachment_id).unwrap().revision, 1);
    assert_eq!(
        store
            .document_attachment_content("thing", &d1, &attachment_id)
            .unwrap(),
        b"hello".to_vec()
    );
}

// =============================================================================
// Derived Structures Across Restarts
// =============================================================================

/// Same-version re-registration keeps the persisted membership without a
/// replay from zero losing anything.
#[test]
fn test_collection_membership_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        register_positives(&store, 1);
        create_thing(&store, 2);
        create_thing(&store, -2);
        assert_eq!(store.collection_document_count("positives").unwrap(), 1);
    }

    let store = open_store(&dir);
    register_positives(&store, 1);
    assert_eq!(store.collection_document_count("positives").unwrap(), 1);
}

/// A version change rebuilds the collection from scratch.
#[test]
fn test_collection_version_change_rebuilds() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        register_positives(&store, 1);
        create_thing(&store, 2);
        create_thing(&store, 5);
    }

    let store = open_store(&dir);
    // Same name, new version: contents reset, then the replay repopulates
    register_positives(&store, 2);
    assert_eq!(store.collection_document_count("positives").unwrap(), 2);
}

/// Documents created while no collection was registered are picked up by
/// the replay at registration time.
#[test]
fn test_collection_catches_up_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        register_positives(&store, 1);
        create_thing(&store, 1);
    }
    {
        // No registration this run: write while the collection is dormant
        let store = open_store(&dir);
        create_thing(&store, 4);
    }

    let store = open_store(&dir);
    register_positives(&store, 1);
    assert_eq!(store.collection_document_count("positives").unwrap(), 2);
}

/// Tombstones written while the collection was dormant are replayed as
/// removals at the next registration.
#[test]
fn test_collection_drops_dormant_tombstones() {
    let dir = TempDir::new().unwrap();
    let d1;
    {
        let store = open_store(&dir);
        register_positives(&store, 1);
        d1 = create_thing(&store, 2);
        assert_eq!(store.collection_document_count("positives").unwrap(), 1);
    }
    {
        // Remove while the collection is not registered
        let store = open_store(&dir);
        store.document_remove("thing", &d1).unwrap();
    }

    let store = open_store(&dir);
    register_positives(&store, 1);
    assert_eq!(store.collection_document_count("positives").unwrap(), 0);
}

/// Associations persist pairs and definitions across reopens.
#[test]
fn test_associations_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let order;
    let item;
    {
        let store = open_store(&dir);
        let mut props = ValueDict::new();
        props.insert("n".into(), Value::I64(0));
        order = store
            .document_create("order", vec![DocumentCreateInfo::new(props.clone())])
            .unwrap()[0]
            .document_id
            .clone();
        item = store
            .document_create("item", vec![DocumentCreateInfo::new(props)])
            .unwrap()[0]
            .document_id
            .clone();
        store
            .association_register("orderToItem", "order", "item")
            .unwrap();
        store
            .association_update(
                "orderToItem",
                vec![AssociationUpdate::add(order.clone(), item.clone())],
            )
            .unwrap();
    }

    let store = open_store(&dir);
    // The definition is known without re-registration
    let items = store.association_get("orderToItem").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].from_document_id, order);
    assert_eq!(items[0].to_document_id, item);
}
