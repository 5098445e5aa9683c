//! Associations
//!
//! A named directed relation between two document types, storing an
//! unordered set of (from, to) document id pairs. Adding an existing pair
//! and removing an absent pair are both no-ops.

/// Association definition: name plus the two document types it relates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationDef {
    pub name: String,
    pub from_document_type: String,
    pub to_document_type: String,
}

/// One (from, to) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationItem {
    pub from_document_id: String,
    pub to_document_id: String,
}

impl AssociationItem {
    pub fn new(from_document_id: impl Into<String>, to_document_id: impl Into<String>) -> Self {
        Self {
            from_document_id: from_document_id.into(),
            to_document_id: to_document_id.into(),
        }
    }
}

/// Add or remove a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationAction {
    Add,
    Remove,
}

/// One association mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationUpdate {
    pub action: AssociationAction,
    pub item: AssociationItem,
}

impl AssociationUpdate {
    pub fn add(from_document_id: impl Into<String>, to_document_id: impl Into<String>) -> Self {
        Self {
            action: AssociationAction::Add,
            item: AssociationItem::new(from_document_id, to_document_id),
        }
    }

    pub fn remove(from_document_id: impl Into<String>, to_document_id: impl Into<String>) -> Self {
        Self {
            action: AssociationAction::Remove,
            item: AssociationItem::new(from_document_id, to_document_id),
        }
    }
}

/// Cache-valued aggregation over an association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetIntegerValueAction {
    Sum,
}

/// Apply a sequence of updates on top of a persisted item list. Duplicate
/// adds collapse; removes of absent pairs are dropped. Used to overlay a
/// batch's pending updates onto what the backend returned.
pub fn apply_updates(items: &mut Vec<AssociationItem>, updates: &[AssociationUpdate]) {
    for update in updates {
        match update.action {
            AssociationAction::Add => {
                if !items.contains(&update.item) {
                    items.push(update.item.clone());
                }
            }
            AssociationAction::Remove => {
                items.retain(|item| item != &update.item);
            }
        }
    }
}
