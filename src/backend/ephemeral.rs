//! In-memory backend
//!
//! Everything lives in typed maps behind read-preferring locks. Nothing
//! survives the process; useful embedded in tests and as the reference
//! realization of the persistence contract.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use crate::association::{AssociationAction, AssociationDef, AssociationItem, AssociationUpdate};
use crate::backing::{AttachmentRecord, DocumentBacking};
use crate::document::{new_opaque_id, universal_time_now, AttachmentInfo, UniversalTime};
use crate::error::{StorageError, StorageResult};
use crate::index::KeysInfo;
use crate::value::ValueDict;

use super::Backend;

#[derive(Debug)]
struct AssociationState {
    def: AssociationDef,
    items: Vec<AssociationItem>,
}

#[derive(Debug)]
struct CollectionState {
    version: u32,
    last_revision: u32,
    ids: HashSet<i64>,
}

#[derive(Debug)]
struct IndexState {
    version: u32,
    last_revision: u32,
    entries: HashMap<String, i64>,
}

#[derive(Debug)]
struct CacheState {
    declaration: String,
    last_revision: u32,
    rows: HashMap<i64, ValueDict>,
}

/// In-memory realization of the persistence contract
pub struct EphemeralBackend {
    info: RwLock<HashMap<String, String>>,
    internal: RwLock<HashMap<String, String>>,
    last_revision_by_type: RwLock<HashMap<String, u32>>,
    next_internal_id: AtomicI64,
    backings_by_id: RwLock<HashMap<String, Arc<DocumentBacking>>>,
    ids_by_type: RwLock<HashMap<String, Vec<String>>>,
    associations: RwLock<HashMap<String, AssociationState>>,
    collections: RwLock<HashMap<String, CollectionState>>,
    indexes: RwLock<HashMap<String, IndexState>>,
    caches: RwLock<HashMap<String, CacheState>>,
}

impl EphemeralBackend {
    pub fn new() -> Self {
        Self {
            info: RwLock::new(HashMap::new()),
            internal: RwLock::new(HashMap::new()),
            last_revision_by_type: RwLock::new(HashMap::new()),
            next_internal_id: AtomicI64::new(1),
            backings_by_id: RwLock::new(HashMap::new()),
            ids_by_type: RwLock::new(HashMap::new()),
            associations: RwLock::new(HashMap::new()),
            collections: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for EphemeralBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn get_subset(
    map: &HashMap<String, String>,
    keys: &[&str],
) -> HashMap<String, String> {
    keys.iter()
        .filter_map(|key| map.get(*key).map(|value| (key.to_string(), value.clone())))
        .collect()
}

impl Backend for EphemeralBackend {
    fn variable_limit(&self) -> usize {
        usize::MAX
    }

    fn write_batch(&self, f: &mut dyn FnMut() -> StorageResult<()>) -> StorageResult<()> {
        f()
    }

    fn info_get(&self, keys: &[&str]) -> StorageResult<HashMap<String, String>> {
        Ok(get_subset(&self.info.read().unwrap(), keys))
    }

    fn info_set(&self, info: &HashMap<String, String>) -> StorageResult<()> {
        let mut map = self.info.write().unwrap();
        for (key, value) in info {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn info_remove(&self, keys: &[&str]) -> StorageResult<()> {
        let mut map = self.info.write().unwrap();
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }

    fn internal_get(&self, keys: &[&str]) -> StorageResult<HashMap<String, String>> {
        Ok(get_subset(&self.internal.read().unwrap(), keys))
    }

    fn internal_set(&self, info: &HashMap<String, String>) -> StorageResult<()> {
        let mut map = self.internal.write().unwrap();
        for (key, value) in info {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn next_revision(&self, document_type: &str) -> StorageResult<u32> {
        let mut map = self.last_revision_by_type.write().unwrap();
        let next = map.get(document_type).copied().unwrap_or(0) + 1;
        map.insert(document_type.to_string(), next);
        Ok(next)
    }

    fn last_revision(&self, document_type: &str) -> StorageResult<u32> {
        Ok(self
            .last_revision_by_type
            .read()
            .unwrap()
            .get(document_type)
            .copied()
            .unwrap_or(0))
    }

    fn document_types(&self) -> StorageResult<Vec<String>> {
        Ok(self.ids_by_type.read().unwrap().keys().cloned().collect())
    }

    fn document_create(
        &self,
        document_type: &str,
        document_id: &str,
        creation_time: UniversalTime,
        modification_time: UniversalTime,
        property_map: &ValueDict,
    ) -> StorageResult<Arc<DocumentBacking>> {
        let mut backings = self.backings_by_id.write().unwrap();
        if backings.contains_key(document_id) {
            return Err(StorageError::BackendIo(format!(
                "document ID already in use: {}",
                document_id
            )));
        }

        let backing = Arc::new(DocumentBacking::new(
            self.next_internal_id.fetch_add(1, Ordering::SeqCst),
            document_id.to_string(),
            document_type.to_string(),
            self.next_revision(document_type)?,
            creation_time,
            modification_time,
            property_map.clone(),
        ));
        backings.insert(document_id.to_string(), Arc::clone(&backing));
        // The id-by-type lock is never held together with the backings lock
        drop(backings);
        self.ids_by_type
            .write()
            .unwrap()
            .entry(document_type.to_string())
            .or_default()
            .push(document_id.to_string());
        Ok(backing)
    }

    fn document_backing(
        &self,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<Option<Arc<DocumentBacking>>> {
        Ok(self
            .backings_by_id
            .read()
            .unwrap()
            .get(document_id)
            .filter(|backing| backing.document_type == document_type)
            .cloned())
    }

    fn document_backings_by_ids(
        &self,
        document_type: &str,
        document_ids: &[String],
    ) -> StorageResult<Vec<Arc<DocumentBacking>>> {
        let backings = self.backings_by_id.read().unwrap();
        document_ids
            .iter()
            .map(|id| {
                backings
                    .get(id)
                    .filter(|backing| backing.document_type == document_type)
                    .cloned()
                    .ok_or_else(|| StorageError::UnknownDocumentId(id.clone()))
            })
            .collect()
    }

    fn document_backings_by_internal_ids(
        &self,
        document_type: &str,
        internal_ids: &[i64],
    ) -> StorageResult<Vec<Arc<DocumentBacking>>> {
        let wanted: HashSet<i64> = internal_ids.iter().copied().collect();
        let ids = self.ids_by_type.read().unwrap();
        let backings = self.backings_by_id.read().unwrap();
        Ok(ids
            .get(document_type)
            .map(|type_ids| {
                type_ids
                    .iter()
                    .filter_map(|id| backings.get(id))
                    .filter(|backing| wanted.contains(&backing.internal_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn document_backings(
        &self,
        document_type: &str,
        active_only: bool,
    ) -> StorageResult<Vec<Arc<DocumentBacking>>> {
        let ids = self.ids_by_type.read().unwrap();
        let backings = self.backings_by_id.read().unwrap();
        Ok(ids
            .get(document_type)
            .map(|type_ids| {
                type_ids
                    .iter()
                    .filter_map(|id| backings.get(id))
                    .filter(|backing| !active_only || backing.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn document_backings_since_revision(
        &self,
        document_type: &str,
        since_revision: u32,
        count: Option<usize>,
    ) -> StorageResult<Vec<Arc<DocumentBacking>>> {
        let mut backings = self.document_backings(document_type, false)?;
        backings.retain(|backing| backing.revision() > since_revision);
        backings.sort_by_key(|backing| backing.revision());
        if let Some(count) = count {
            backings.truncate(count);
        }
        Ok(backings)
    }

    fn document_count(&self, document_type: &str) -> StorageResult<u64> {
        Ok(self.document_backings(document_type, true)?.len() as u64)
    }

    fn document_update(
        &self,
        backing: &DocumentBacking,
        updated: &ValueDict,
        removed: &HashSet<String>,
    ) -> StorageResult<()> {
        self.document_update_at(backing, updated, removed, universal_time_now())
    }

    fn document_update_at(
        &self,
        backing: &DocumentBacking,
        updated: &ValueDict,
        removed: &HashSet<String>,
        modification_time: UniversalTime,
    ) -> StorageResult<()> {
        let revision = self.next_revision(&backing.document_type)?;
        backing.update(updated, removed, Some((revision, modification_time)), |_| Ok(()))
    }

    fn document_remove(&self, backing: &DocumentBacking) -> StorageResult<()> {
        let revision = self.next_revision(&backing.document_type)?;
        backing.tombstone(revision, universal_time_now(), || Ok(()))
    }

    fn attachment_add(
        &self,
        backing: &DocumentBacking,
        attachment_id: Option<&str>,
        info: &ValueDict,
        content: &[u8],
    ) -> StorageResult<AttachmentInfo> {
        let record = AttachmentRecord {
            info: AttachmentInfo {
                id: attachment_id
                    .map(str::to_string)
                    .unwrap_or_else(new_opaque_id),
                revision: 1,
                info: info.clone(),
            },
            content: Some(content.to_vec()),
        };
        let revision = self.next_revision(&backing.document_type)?;
        backing.attachment_add(record, revision, universal_time_now(), |_| Ok(()))
    }

    fn attachment_content(
        &self,
        backing: &DocumentBacking,
        attachment_id: &str,
    ) -> StorageResult<Vec<u8>> {
        backing
            .attachment_content(attachment_id)
            .flatten()
            .ok_or_else(|| StorageError::UnknownAttachmentId(attachment_id.to_string()))
    }

    fn attachment_update(
        &self,
        backing: &DocumentBacking,
        attachment_id: &str,
        info: &ValueDict,
        content: &[u8],
    ) -> StorageResult<u32> {
        let revision = self.next_revision(&backing.document_type)?;
        backing.attachment_update(
            attachment_id,
            info.clone(),
            Some(content.to_vec()),
            revision,
            universal_time_now(),
            |_| Ok(()),
        )
    }

    fn attachment_remove(
        &self,
        backing: &DocumentBacking,
        attachment_id: &str,
    ) -> StorageResult<()> {
        let revision = self.next_revision(&backing.document_type)?;
        backing.attachment_remove(attachment_id, revision, universal_time_now(), || Ok(()))
    }

    fn association_register(&self, def: &AssociationDef) -> StorageResult<()> {
        self.associations
            .write()
            .unwrap()
            .entry(def.name.clone())
            .or_insert_with(|| AssociationState {
                def: def.clone(),
                items: Vec::new(),
            });
        Ok(())
    }

    fn association_def(&self, name: &str) -> StorageResult<Option<AssociationDef>> {
        Ok(self
            .associations
            .read()
            .unwrap()
            .get(name)
            .map(|state| state.def.clone()))
    }

    fn association_items(&self, name: &str) -> StorageResult<Vec<AssociationItem>> {
        Ok(self
            .associations
            .read()
            .unwrap()
            .get(name)
            .map(|state| state.items.clone())
            .unwrap_or_default())
    }

    fn association_update(
        &self,
        name: &str,
        updates: &[AssociationUpdate],
    ) -> StorageResult<()> {
        let mut associations = self.associations.write().unwrap();
        let state = associations
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownAssociation(name.to_string()))?;
        for update in updates {
            match update.action {
                AssociationAction::Add => {
                    if !state.items.contains(&update.item) {
                        state.items.push(update.item.clone());
                    }
                }
                AssociationAction::Remove => {
                    state.items.retain(|item| item != &update.item);
                }
            }
        }
        Ok(())
    }

    fn collection_register(
        &self,
        name: &str,
        document_type: &str,
        version: u32,
        is_up_to_date: bool,
    ) -> StorageResult<u32> {
        let mut collections = self.collections.write().unwrap();
        match collections.get_mut(name) {
            Some(state) if state.version == version => Ok(state.last_revision),
            Some(state) => {
                // Version change: reset and replay from scratch
                state.version = version;
                state.last_revision = 0;
                state.ids.clear();
                Ok(0)
            }
            None => {
                let last_revision = if is_up_to_date {
                    self.last_revision(document_type)?
                } else {
                    0
                };
                collections.insert(
                    name.to_string(),
                    CollectionState {
                        version,
                        last_revision,
                        ids: HashSet::new(),
                    },
                );
                Ok(last_revision)
            }
        }
    }

    fn collection_update(
        &self,
        name: &str,
        included_ids: &[i64],
        not_included_ids: &[i64],
        last_revision: Option<u32>,
    ) -> StorageResult<()> {
        let mut collections = self.collections.write().unwrap();
        let state = collections
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))?;
        for id in not_included_ids {
            state.ids.remove(id);
        }
        state.ids.extend(included_ids.iter().copied());
        if let Some(last_revision) = last_revision {
            state.last_revision = state.last_revision.max(last_revision);
        }
        Ok(())
    }

    fn collection_remove_ids(&self, name: &str, internal_ids: &[i64]) -> StorageResult<()> {
        let mut collections = self.collections.write().unwrap();
        let state = collections
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))?;
        for id in internal_ids {
            state.ids.remove(id);
        }
        Ok(())
    }

    fn collection_ids(&self, name: &str) -> StorageResult<Vec<i64>> {
        let collections = self.collections.read().unwrap();
        let state = collections
            .get(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))?;
        let mut ids: Vec<i64> = state.ids.iter().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn collection_count(&self, name: &str) -> StorageResult<u64> {
        let collections = self.collections.read().unwrap();
        let state = collections
            .get(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))?;
        Ok(state.ids.len() as u64)
    }

    fn index_register(
        &self,
        name: &str,
        _document_type: &str,
        version: u32,
    ) -> StorageResult<u32> {
        let mut indexes = self.indexes.write().unwrap();
        match indexes.get_mut(name) {
            Some(state) if state.version == version => Ok(state.last_revision),
            Some(state) => {
                state.version = version;
                state.last_revision = 0;
                state.entries.clear();
                Ok(0)
            }
            None => {
                indexes.insert(
                    name.to_string(),
                    IndexState {
                        version,
                        last_revision: 0,
                        entries: HashMap::new(),
                    },
                );
                Ok(0)
            }
        }
    }

    fn index_update(
        &self,
        name: &str,
        keys_infos: &[KeysInfo],
        last_revision: Option<u32>,
    ) -> StorageResult<()> {
        let mut indexes = self.indexes.write().unwrap();
        let state = indexes
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownIndex(name.to_string()))?;

        let updated_ids: HashSet<i64> =
            keys_infos.iter().map(|info| info.internal_id).collect();
        state
            .entries
            .retain(|_, id| !updated_ids.contains(id));
        for keys_info in keys_infos {
            for key in &keys_info.keys {
                state.entries.insert(key.clone(), keys_info.internal_id);
            }
        }
        if let Some(last_revision) = last_revision {
            state.last_revision = state.last_revision.max(last_revision);
        }
        Ok(())
    }

    fn index_remove_ids(&self, name: &str, internal_ids: &[i64]) -> StorageResult<()> {
        let mut indexes = self.indexes.write().unwrap();
        let state = indexes
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownIndex(name.to_string()))?;
        let removed: HashSet<i64> = internal_ids.iter().copied().collect();
        state.entries.retain(|_, id| !removed.contains(id));
        Ok(())
    }

    fn index_get(&self, name: &str, keys: &[String]) -> StorageResult<HashMap<String, i64>> {
        let indexes = self.indexes.read().unwrap();
        let state = indexes
            .get(name)
            .ok_or_else(|| StorageError::UnknownIndex(name.to_string()))?;
        Ok(keys
            .iter()
            .filter_map(|key| state.entries.get(key).map(|id| (key.clone(), *id)))
            .collect())
    }

    fn cache_register(
        &self,
        name: &str,
        _document_type: &str,
        declaration: &str,
        _value_names: &[String],
    ) -> StorageResult<u32> {
        let mut caches = self.caches.write().unwrap();
        match caches.get_mut(name) {
            Some(state) if state.declaration == declaration => Ok(state.last_revision),
            Some(state) => {
                state.declaration = declaration.to_string();
                state.last_revision = 0;
                state.rows.clear();
                Ok(0)
            }
            None => {
                caches.insert(
                    name.to_string(),
                    CacheState {
                        declaration: declaration.to_string(),
                        last_revision: 0,
                        rows: HashMap::new(),
                    },
                );
                Ok(0)
            }
        }
    }

    fn cache_update(
        &self,
        name: &str,
        values_by_id: &[(i64, ValueDict)],
        last_revision: Option<u32>,
    ) -> StorageResult<()> {
        let mut caches = self.caches.write().unwrap();
        let state = caches
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownCache(name.to_string()))?;
        for (internal_id, values) in values_by_id {
            state.rows.insert(*internal_id, values.clone());
        }
        if let Some(last_revision) = last_revision {
            state.last_revision = state.last_revision.max(last_revision);
        }
        Ok(())
    }

    fn cache_remove_ids(&self, name: &str, internal_ids: &[i64]) -> StorageResult<()> {
        let mut caches = self.caches.write().unwrap();
        let state = caches
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownCache(name.to_string()))?;
        for id in internal_ids {
            state.rows.remove(id);
        }
        Ok(())
    }

    fn cache_rows(
        &self,
        name: &str,
        internal_ids: &[i64],
    ) -> StorageResult<HashMap<i64, ValueDict>> {
        let caches = self.caches.read().unwrap();
        let state = caches
            .get(name)
            .ok_or_else(|| StorageError::UnknownCache(name.to_string()))?;
        Ok(internal_ids
            .iter()
            .filter_map(|id| state.rows.get(id).map(|row| (*id, row.clone())))
            .collect())
    }
}
