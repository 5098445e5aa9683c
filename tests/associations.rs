//! Association Tests
//!
//! Tests for the directed pair-set subsystem:
//! - Registration idempotence and type mismatch detection
//! - Add/remove round trips with duplicate collapse
//! - Iteration and paginated queries in both directions
//! - Cache-backed sums, including in-batch overlays

use docstore::{
    AssociationUpdate, BatchResult, CacheValueInfo, CacheValueKind, DocumentCreateInfo,
    DocumentStore, EphemeralBackend, GetIntegerValueAction, StorageError, Value, ValueDict,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn store() -> DocumentStore<EphemeralBackend> {
    let store = DocumentStore::new(EphemeralBackend::new());
    store.register_value_selector("integerFromProperty", |doc, name| {
        Value::I64(
            doc.property_map
                .get(name)
                .and_then(|value| value.coerce_i64().ok())
                .unwrap_or(0),
        )
    });
    store
}

fn create(store: &DocumentStore<EphemeralBackend>, document_type: &str, price: i64) -> String {
    let mut props = ValueDict::new();
    props.insert("price".into(), Value::I64(price));
    store
        .document_create(document_type, vec![DocumentCreateInfo::new(props)])
        .unwrap()[0]
        .document_id
        .clone()
}

fn register_order_to_item(store: &DocumentStore<EphemeralBackend>) {
    store
        .association_register("orderToItem", "order", "item")
        .unwrap();
}

fn register_price_cache(store: &DocumentStore<EphemeralBackend>) {
    store
        .cache_register(
            "itemValues",
            "item",
            vec!["price".into()],
            vec![CacheValueInfo {
                name: "price".into(),
                kind: CacheValueKind::Integer,
                selector_id: "integerFromProperty".into(),
            }],
        )
        .unwrap();
}

// =============================================================================
// Registration
// =============================================================================

/// Re-registration with the same types is idempotent; different types fail.
#[test]
fn test_registration_idempotent_and_type_checked() {
    let store = store();
    register_order_to_item(&store);
    register_order_to_item(&store);

    assert!(matches!(
        store.association_register("orderToItem", "order", "customer"),
        Err(StorageError::MismatchedAssociationTypes(_))
    ));
}

/// Operations on an unregistered association fail.
#[test]
fn test_unknown_association() {
    let store = store();
    assert!(matches!(
        store.association_get("nope"),
        Err(StorageError::UnknownAssociation(_))
    ));
}

// =============================================================================
// Add / Remove Round Trips
// =============================================================================

/// Scenario: add then remove leaves nothing; re-add restores exactly once.
#[test]
fn test_add_remove_round_trip() {
    let store = store();
    register_order_to_item(&store);
    let order = create(&store, "order", 0);
    let item = create(&store, "item", 10);

    store
        .association_update(
            "orderToItem",
            vec![AssociationUpdate::add(order.clone(), item.clone())],
        )
        .unwrap();
    store
        .association_update(
            "orderToItem",
            vec![AssociationUpdate::remove(order.clone(), item.clone())],
        )
        .unwrap();
    assert!(store.association_get("orderToItem").unwrap().is_empty());

    // Duplicate adds collapse to one pair
    store
        .association_update(
            "orderToItem",
            vec![
                AssociationUpdate::add(order.clone(), item.clone()),
                AssociationUpdate::add(order.clone(), item.clone()),
            ],
        )
        .unwrap();
    assert_eq!(store.association_get("orderToItem").unwrap().len(), 1);

    // Removing an absent pair is a no-op
    let other_item = create(&store, "item", 99);
    store
        .association_update(
            "orderToItem",
            vec![AssociationUpdate::remove(order, other_item)],
        )
        .unwrap();
    assert_eq!(store.association_get("orderToItem").unwrap().len(), 1);
}

/// Updates referencing unknown documents are rejected without side effects.
#[test]
fn test_update_validates_document_ids() {
    let store = store();
    register_order_to_item(&store);
    let order = create(&store, "order", 0);

    assert!(matches!(
        store.association_update(
            "orderToItem",
            vec![AssociationUpdate::add(order, "missing".to_string())],
        ),
        Err(StorageError::UnknownDocumentId(_))
    ));
    assert!(store.association_get("orderToItem").unwrap().is_empty());
}

// =============================================================================
// Iteration and Pagination
// =============================================================================

/// Iteration visits every counterpart in both directions.
#[test]
fn test_iterate_both_directions() {
    let store = store();
    register_order_to_item(&store);
    let order = create(&store, "order", 0);
    let item_a = create(&store, "item", 1);
    let item_b = create(&store, "item", 2);

    store
        .association_update(
            "orderToItem",
            vec![
                AssociationUpdate::add(order.clone(), item_a.clone()),
                AssociationUpdate::add(order.clone(), item_b.clone()),
            ],
        )
        .unwrap();

    let mut seen = Vec::new();
    store
        .association_iterate_from("orderToItem", &order, |doc| {
            seen.push(doc.document_id.clone())
        })
        .unwrap();
    seen.sort();
    let mut expected = vec![item_a.clone(), item_b];
    expected.sort();
    assert_eq!(seen, expected);

    let mut seen = Vec::new();
    store
        .association_iterate_to("orderToItem", &item_a, |doc| {
            seen.push(doc.document_id.clone())
        })
        .unwrap();
    assert_eq!(seen, vec![order]);
}

/// Paginated revision infos carry the persisted total; unknown anchors
/// fail.
#[test]
fn test_paginated_revision_infos() {
    let store = store();
    register_order_to_item(&store);
    let order = create(&store, "order", 0);
    let mut items = Vec::new();
    for price in 1..=5 {
        let item = create(&store, "item", price);
        store
            .association_update(
                "orderToItem",
                vec![AssociationUpdate::add(order.clone(), item.clone())],
            )
            .unwrap();
        items.push(item);
    }

    let (total, slice) = store
        .association_document_revision_infos_from("orderToItem", &order, 0, Some(2))
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(slice.len(), 2);

    let (total, rest) = store
        .association_document_revision_infos_from("orderToItem", &order, 3, None)
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(rest.len(), 2);

    assert!(matches!(
        store.association_document_revision_infos_from("orderToItem", "ghost", 0, None),
        Err(StorageError::UnknownDocumentId(_))
    ));

    let (total, slice) = store
        .association_document_full_infos_to("orderToItem", &items[0], 0, None)
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(slice[0].document_id, order);
}

// =============================================================================
// Cache-Backed Sums
// =============================================================================

/// Scenario: sums over linked items, with an in-batch link applied to the
/// reachable set and discarded on cancel.
#[test]
fn test_integer_values_sum_with_batch_overlay() {
    let store = store();
    register_order_to_item(&store);
    register_price_cache(&store);

    let order = create(&store, "order", 0);
    for price in [10, 20, 30] {
        let item = create(&store, "item", price);
        store
            .association_update(
                "orderToItem",
                vec![AssociationUpdate::add(order.clone(), item)],
            )
            .unwrap();
    }
    let extra_item = create(&store, "item", 5);

    let sums = store
        .association_integer_values(
            "orderToItem",
            GetIntegerValueAction::Sum,
            &[order.clone()],
            "itemValues",
            &["price".to_string()],
        )
        .unwrap();
    assert_eq!(sums.get("price"), Some(&60));

    store
        .batch(|| {
            store
                .association_update(
                    "orderToItem",
                    vec![AssociationUpdate::add(order.clone(), extra_item.clone())],
                )
                .unwrap();
            let sums = store
                .association_integer_values(
                    "orderToItem",
                    GetIntegerValueAction::Sum,
                    &[order.clone()],
                    "itemValues",
                    &["price".to_string()],
                )
                .unwrap();
            assert_eq!(sums.get("price"), Some(&65));
            Ok(BatchResult::Cancel)
        })
        .unwrap();

    let sums = store
        .association_integer_values(
            "orderToItem",
            GetIntegerValueAction::Sum,
            &[order],
            "itemValues",
            &["price".to_string()],
        )
        .unwrap();
    assert_eq!(sums.get("price"), Some(&60));
}

/// Committed batch association updates persist.
#[test]
fn test_batched_association_updates_commit() {
    let store = store();
    register_order_to_item(&store);
    let order = create(&store, "order", 0);
    let item = create(&store, "item", 10);

    store
        .batch(|| {
            store
                .association_update(
                    "orderToItem",
                    vec![AssociationUpdate::add(order.clone(), item.clone())],
                )
                .unwrap();
            Ok(BatchResult::Commit)
        })
        .unwrap();

    let items = store.association_get("orderToItem").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].from_document_id, order);
    assert_eq!(items[0].to_document_id, item);
}
