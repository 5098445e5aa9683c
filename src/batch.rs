//! Batches
//!
//! A batch buffers every mutation issued on its thread: document creates,
//! property writes, attachment changes, removals, and association updates.
//! Nothing touches the backend until the batch closure returns Commit; a
//! Cancel verdict discards the buffer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::association::AssociationUpdate;
use crate::backing::DocumentBacking;
use crate::document::{
    new_opaque_id, universal_time_now, AttachmentInfo, AttachmentInfoMap, UniversalTime,
};
use crate::value::{Value, ValueDict};

/// Verdict returned by a batch closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchResult {
    Commit,
    Cancel,
}

/// An attachment added inside a batch. The id is assigned immediately so
/// the caller can refer to it before commit.
#[derive(Debug, Clone)]
pub struct BatchAddAttachmentInfo {
    pub id: String,
    pub info: ValueDict,
    pub content: Vec<u8>,
}

impl BatchAddAttachmentInfo {
    pub fn attachment_info(&self) -> AttachmentInfo {
        AttachmentInfo {
            id: self.id.clone(),
            revision: 1,
            info: self.info.clone(),
        }
    }
}

/// An attachment updated inside a batch, carrying the revision the caller
/// read before entering the batch
#[derive(Debug, Clone)]
pub struct BatchUpdateAttachmentInfo {
    pub id: String,
    pub current_revision: u32,
    pub info: ValueDict,
    pub content: Vec<u8>,
}

impl BatchUpdateAttachmentInfo {
    pub fn attachment_info(&self) -> AttachmentInfo {
        AttachmentInfo {
            id: self.id.clone(),
            revision: self.current_revision,
            info: self.info.clone(),
        }
    }
}

/// Buffered state of one document inside a batch
pub struct DocumentChange {
    pub document_type: String,
    /// Present for pre-existing documents
    pub backing: Option<Arc<DocumentBacking>>,
    pub creation_time: UniversalTime,
    pub modification_time: UniversalTime,
    pub updated_properties: ValueDict,
    pub removed_properties: HashSet<String>,
    pub attachment_adds: HashMap<String, BatchAddAttachmentInfo>,
    pub attachment_updates: HashMap<String, BatchUpdateAttachmentInfo>,
    pub attachment_removes: HashSet<String>,
    pub removed: bool,
    /// Snapshot used only for documents created fresh inside the batch
    pub initial_property_map: Option<ValueDict>,
}

impl DocumentChange {
    fn new(
        document_type: String,
        backing: Option<Arc<DocumentBacking>>,
        creation_time: UniversalTime,
        modification_time: UniversalTime,
        initial_property_map: Option<ValueDict>,
    ) -> Self {
        Self {
            document_type,
            backing,
            creation_time,
            modification_time,
            updated_properties: ValueDict::new(),
            removed_properties: HashSet::new(),
            attachment_adds: HashMap::new(),
            attachment_updates: HashMap::new(),
            attachment_removes: HashSet::new(),
            removed: false,
            initial_property_map,
        }
    }

    /// Batched view of a property: buffered write, else the creation
    /// snapshot, else the live backing
    pub fn value(&self, property: &str) -> Option<Value> {
        if self.removed || self.removed_properties.contains(property) {
            return None;
        }
        if let Some(value) = self.updated_properties.get(property) {
            return Some(value.clone());
        }
        if let Some(initial) = &self.initial_property_map {
            return initial.get(property).cloned();
        }
        self.backing.as_ref().and_then(|backing| backing.value(property))
    }

    /// Buffer a property write (`None` removes the property)
    pub fn set(&mut self, property: &str, value: Option<Value>) {
        match value {
            Some(value) => {
                self.updated_properties.insert(property.to_string(), value);
                self.removed_properties.remove(property);
            }
            None => {
                self.updated_properties.remove(property);
                self.removed_properties.insert(property.to_string());
            }
        }
        self.modification_time = universal_time_now();
    }

    pub fn attachment_add(&mut self, info: ValueDict, content: Vec<u8>) -> AttachmentInfo {
        let add = BatchAddAttachmentInfo {
            id: new_opaque_id(),
            info,
            content,
        };
        let attachment_info = add.attachment_info();
        self.attachment_adds.insert(add.id.clone(), add);
        self.modification_time = universal_time_now();
        attachment_info
    }

    pub fn attachment_update(
        &mut self,
        attachment_id: &str,
        current_revision: u32,
        info: ValueDict,
        content: Vec<u8>,
    ) {
        self.attachment_updates.insert(
            attachment_id.to_string(),
            BatchUpdateAttachmentInfo {
                id: attachment_id.to_string(),
                current_revision,
                info,
                content,
            },
        );
        self.modification_time = universal_time_now();
    }

    pub fn attachment_remove(&mut self, attachment_id: &str) {
        self.attachment_removes.insert(attachment_id.to_string());
        self.modification_time = universal_time_now();
    }

    /// Batched content for an attachment id, when this batch wrote it
    pub fn attachment_content(&self, attachment_id: &str) -> Option<Vec<u8>> {
        if self.attachment_removes.contains(attachment_id) {
            return None;
        }
        if let Some(add) = self.attachment_adds.get(attachment_id) {
            return Some(add.content.clone());
        }
        self.attachment_updates
            .get(attachment_id)
            .map(|update| update.content.clone())
    }

    /// The attachment info map as it will look after commit
    pub fn updated_attachment_info_map(&self, initial: &AttachmentInfoMap) -> AttachmentInfoMap {
        let mut map = initial.clone();
        for add in self.attachment_adds.values() {
            map.insert(add.id.clone(), add.attachment_info());
        }
        for update in self.attachment_updates.values() {
            map.insert(update.id.clone(), update.attachment_info());
        }
        for removed_id in &self.attachment_removes {
            map.remove(removed_id);
        }
        map
    }

    pub fn remove(&mut self) {
        self.removed = true;
        self.modification_time = universal_time_now();
    }

    /// The set of property names this change touches
    pub fn changed_properties(&self) -> HashSet<String> {
        self.updated_properties
            .keys()
            .cloned()
            .chain(self.removed_properties.iter().cloned())
            .collect()
    }
}

/// Thread-scoped mutation buffer
#[derive(Default)]
pub struct Batch {
    changes: HashMap<String, DocumentChange>,
    association_updates: HashMap<String, Vec<AssociationUpdate>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh change for a document, or return the existing one
    pub fn add_document(
        &mut self,
        document_type: &str,
        document_id: &str,
        backing: Option<Arc<DocumentBacking>>,
        creation_time: UniversalTime,
        modification_time: UniversalTime,
        initial_property_map: Option<ValueDict>,
    ) -> &mut DocumentChange {
        self.changes
            .entry(document_id.to_string())
            .or_insert_with(|| {
                DocumentChange::new(
                    document_type.to_string(),
                    backing,
                    creation_time,
                    modification_time,
                    initial_property_map,
                )
            })
    }

    pub fn document_change(&self, document_id: &str) -> Option<&DocumentChange> {
        self.changes.get(document_id)
    }

    pub fn document_change_mut(&mut self, document_id: &str) -> Option<&mut DocumentChange> {
        self.changes.get_mut(document_id)
    }

    /// Document ids this batch knows about (used to validate association
    /// updates against documents created in-batch)
    pub fn known_document_ids(&self) -> HashSet<String> {
        self.changes.keys().cloned().collect()
    }

    pub fn note_association_updated(&mut self, name: &str, updates: Vec<AssociationUpdate>) {
        self.association_updates
            .entry(name.to_string())
            .or_default()
            .extend(updates);
    }

    pub fn association_updates(&self, name: &str) -> &[AssociationUpdate] {
        self.association_updates
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn updated_association_names(&self) -> Vec<String> {
        self.association_updates.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.association_updates.is_empty()
    }

    /// Changes grouped by document type for serial per-type application
    pub fn changes_by_document_type(&self) -> HashMap<String, Vec<(&String, &DocumentChange)>> {
        let mut by_type: HashMap<String, Vec<(&String, &DocumentChange)>> = HashMap::new();
        for (document_id, change) in &self.changes {
            by_type
                .entry(change.document_type.clone())
                .or_default()
                .push((document_id, change));
        }
        by_type
    }
}
