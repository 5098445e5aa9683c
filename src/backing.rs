//! Document backings
//!
//! A [`DocumentBacking`] is the in-core authoritative record of one
//! document. The mutable portion lives behind a read-preferring `RwLock`:
//! reads dominate this workload, so a writer may starve under pathological
//! contention, which is an accepted trade-off here.
//!
//! Mutators take a `persist` closure that runs before the in-core state is
//! touched. A persistence failure therefore leaves the in-core map and
//! revision unchanged.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::document::{
    AttachmentInfo, AttachmentInfoMap, DocumentFullInfo, UniversalTime,
};
use crate::error::{StorageError, StorageResult};
use crate::value::{Value, ValueDict};

/// One attachment held by a backing
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub info: AttachmentInfo,
    /// In-core content; the durable backend keeps content in its own
    /// table and leaves this `None`
    pub content: Option<Vec<u8>>,
}

#[derive(Debug)]
struct BackingState {
    revision: u32,
    active: bool,
    modification_time: UniversalTime,
    property_map: ValueDict,
    attachments: HashMap<String, AttachmentRecord>,
}

/// In-core authoritative record of one document
#[derive(Debug)]
pub struct DocumentBacking {
    pub internal_id: i64,
    pub document_id: String,
    pub document_type: String,
    pub creation_time: UniversalTime,
    state: RwLock<BackingState>,
}

impl DocumentBacking {
    pub fn new(
        internal_id: i64,
        document_id: String,
        document_type: String,
        revision: u32,
        creation_time: UniversalTime,
        modification_time: UniversalTime,
        property_map: ValueDict,
    ) -> Self {
        Self {
            internal_id,
            document_id,
            document_type,
            creation_time,
            state: RwLock::new(BackingState {
                revision,
                active: true,
                modification_time,
                property_map,
                attachments: HashMap::new(),
            }),
        }
    }

    /// Restore a backing from persisted state (durable backend open path)
    #[allow(clippy::too_many_arguments)]
    pub fn restored(
        internal_id: i64,
        document_id: String,
        document_type: String,
        revision: u32,
        active: bool,
        creation_time: UniversalTime,
        modification_time: UniversalTime,
        property_map: ValueDict,
        attachments: HashMap<String, AttachmentRecord>,
    ) -> Self {
        Self {
            internal_id,
            document_id,
            document_type,
            creation_time,
            state: RwLock::new(BackingState {
                revision,
                active,
                modification_time,
                property_map,
                attachments,
            }),
        }
    }

    pub fn revision(&self) -> u32 {
        self.state.read().unwrap().revision
    }

    pub fn is_active(&self) -> bool {
        self.state.read().unwrap().active
    }

    pub fn modification_time(&self) -> UniversalTime {
        self.state.read().unwrap().modification_time
    }

    pub fn value(&self, property: &str) -> Option<Value> {
        self.state.read().unwrap().property_map.get(property).cloned()
    }

    pub fn property_map(&self) -> ValueDict {
        self.state.read().unwrap().property_map.clone()
    }

    pub fn attachment_info_map(&self) -> AttachmentInfoMap {
        self.state
            .read()
            .unwrap()
            .attachments
            .iter()
            .map(|(id, record)| (id.clone(), record.info.clone()))
            .collect()
    }

    pub fn attachment_revision(&self, attachment_id: &str) -> Option<u32> {
        self.state
            .read()
            .unwrap()
            .attachments
            .get(attachment_id)
            .map(|record| record.info.revision)
    }

    /// In-core attachment content, when the backend keeps it in core
    pub fn attachment_content(&self, attachment_id: &str) -> Option<Option<Vec<u8>>> {
        self.state
            .read()
            .unwrap()
            .attachments
            .get(attachment_id)
            .map(|record| record.content.clone())
    }

    pub fn full_info(&self) -> DocumentFullInfo {
        let state = self.state.read().unwrap();
        DocumentFullInfo {
            document_id: self.document_id.clone(),
            document_type: self.document_type.clone(),
            revision: state.revision,
            active: state.active,
            creation_time: self.creation_time,
            modification_time: state.modification_time,
            property_map: state.property_map.clone(),
            attachment_info_map: state
                .attachments
                .iter()
                .map(|(id, record)| (id.clone(), record.info.clone()))
                .collect(),
        }
    }

    /// Merge a property diff into the live map. Updated keys overwrite,
    /// then removed keys are dropped. With `commit` the new revision and
    /// modification time land together with the content; `persist` sees the
    /// merged map first and its failure aborts the whole update.
    pub fn update(
        &self,
        updated: &ValueDict,
        removed: &HashSet<String>,
        commit: Option<(u32, UniversalTime)>,
        persist: impl FnOnce(&ValueDict) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();

        let mut merged = state.property_map.clone();
        for (key, value) in updated {
            merged.insert(key.clone(), value.clone());
        }
        for key in removed {
            merged.remove(key);
        }

        persist(&merged)?;

        state.property_map = merged;
        if let Some((revision, modification_time)) = commit {
            state.revision = revision;
            state.modification_time = modification_time;
        }
        Ok(())
    }

    /// Flip the active flag off. Tombstoning is final; it consumes a
    /// revision like any other content-changing write so replay can
    /// observe it.
    pub fn tombstone(
        &self,
        revision: u32,
        modification_time: UniversalTime,
        persist: impl FnOnce() -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        persist()?;
        state.active = false;
        state.revision = revision;
        state.modification_time = modification_time;
        Ok(())
    }

    pub fn attachment_add(
        &self,
        record: AttachmentRecord,
        revision: u32,
        modification_time: UniversalTime,
        persist: impl FnOnce(&AttachmentRecord) -> StorageResult<()>,
    ) -> StorageResult<AttachmentInfo> {
        let mut state = self.state.write().unwrap();
        persist(&record)?;

        let info = record.info.clone();
        state.attachments.insert(info.id.clone(), record);
        state.revision = revision;
        state.modification_time = modification_time;
        Ok(info)
    }

    /// Replace an attachment's info and content, bumping its revision.
    /// Returns the new attachment revision.
    pub fn attachment_update(
        &self,
        attachment_id: &str,
        info: ValueDict,
        content: Option<Vec<u8>>,
        revision: u32,
        modification_time: UniversalTime,
        persist: impl FnOnce(u32) -> StorageResult<()>,
    ) -> StorageResult<u32> {
        let mut state = self.state.write().unwrap();
        let record = state
            .attachments
            .get(attachment_id)
            .ok_or_else(|| StorageError::UnknownAttachmentId(attachment_id.to_string()))?;
        let next_attachment_revision = record.info.revision + 1;

        persist(next_attachment_revision)?;

        let record = state
            .attachments
            .get_mut(attachment_id)
            .expect("attachment present above");
        record.info.revision = next_attachment_revision;
        record.info.info = info;
        record.content = content;
        state.revision = revision;
        state.modification_time = modification_time;
        Ok(next_attachment_revision)
    }

    pub fn attachment_remove(
        &self,
        attachment_id: &str,
        revision: u32,
        modification_time: UniversalTime,
        persist: impl FnOnce() -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        if !state.attachments.contains_key(attachment_id) {
            return Err(StorageError::UnknownAttachmentId(attachment_id.to_string()));
        }

        persist()?;

        state.attachments.remove(attachment_id);
        state.revision = revision;
        state.modification_time = modification_time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::new_opaque_id;

    fn make_backing() -> DocumentBacking {
        let mut props = ValueDict::new();
        props.insert("n".into(), Value::U32(1));
        DocumentBacking::new(1, "d1".into(), "thing".into(), 1, 100.0, 100.0, props)
    }

    #[test]
    fn test_update_merges_then_removes() {
        let backing = make_backing();
        let mut updated = ValueDict::new();
        updated.insert("s".into(), Value::String("hi".into()));
        let mut removed = HashSet::new();
        removed.insert("n".to_string());

        backing
            .update(&updated, &removed, Some((2, 200.0)), |_| Ok(()))
            .unwrap();

        assert_eq!(backing.value("s").unwrap(), Value::String("hi".into()));
        assert!(backing.value("n").is_none());
        assert_eq!(backing.revision(), 2);
        assert_eq!(backing.modification_time(), 200.0);
    }

    #[test]
    fn test_failed_persist_leaves_state_unchanged() {
        let backing = make_backing();
        let mut updated = ValueDict::new();
        updated.insert("n".into(), Value::U32(9));

        let result = backing.update(&updated, &HashSet::new(), Some((2, 200.0)), |_| {
            Err(StorageError::BackendIo("disk full".into()))
        });

        assert!(result.is_err());
        assert_eq!(backing.value("n").unwrap(), Value::U32(1));
        assert_eq!(backing.revision(), 1);
    }

    #[test]
    fn test_tombstone_consumes_revision() {
        let backing = make_backing();
        backing.tombstone(2, 200.0, || Ok(())).unwrap();
        assert!(!backing.is_active());
        assert_eq!(backing.revision(), 2);
    }

    #[test]
    fn test_attachment_lifecycle() {
        let backing = make_backing();
        let id = new_opaque_id();
        let record = AttachmentRecord {
            info: AttachmentInfo {
                id: id.clone(),
                revision: 1,
                info: ValueDict::new(),
            },
            content: Some(b"hello".to_vec()),
        };

        backing
            .attachment_add(record, 2, 200.0, |_| Ok(()))
            .unwrap();
        assert_eq!(backing.attachment_revision(&id), Some(1));
        assert_eq!(backing.revision(), 2);

        let new_revision = backing
            .attachment_update(&id, ValueDict::new(), Some(b"hi".to_vec()), 3, 300.0, |_| Ok(()))
            .unwrap();
        assert_eq!(new_revision, 2);
        assert_eq!(
            backing.attachment_content(&id).unwrap().unwrap(),
            b"hi".to_vec()
        );

        backing.attachment_remove(&id, 4, 400.0, || Ok(())).unwrap();
        assert!(backing.attachment_info_map().is_empty());

        let err = backing
            .attachment_remove(&id, 5, 500.0, || Ok(()))
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownAttachmentId(_)));
    }
}
