//! Update pipeline
//!
//! Fans document writes out to every cache, collection, and index
//! registered on the document type, in registration order, and pushes the
//! computed deltas to the backend in writer chunks sized to its
//! variable-binding limit. Also brings individual structures current by
//! replaying every document written since their last revision.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::backend::Backend;
use crate::backing::DocumentBacking;
use crate::cache::Cache;
use crate::collection::Collection;
use crate::document::DocumentFullInfo;
use crate::error::StorageResult;
use crate::index::Index;

/// How many documents one replay round pulls from the backend
const REPLAY_READ_COUNT: usize = 250;

/// One document write as seen by derived structures
#[derive(Debug, Clone)]
pub struct UpdateInfo {
    pub document: DocumentFullInfo,
    pub revision: u32,
    pub internal_id: i64,
    /// Properties touched by the write; `None` means unspecified, which
    /// every structure must treat as relevant
    pub changed_properties: Option<HashSet<String>>,
}

impl UpdateInfo {
    pub fn new(
        document: DocumentFullInfo,
        revision: u32,
        internal_id: i64,
        changed_properties: Option<HashSet<String>>,
    ) -> Self {
        Self {
            document,
            revision,
            internal_id,
            changed_properties,
        }
    }

    pub fn from_backing(
        backing: &DocumentBacking,
        changed_properties: Option<HashSet<String>>,
    ) -> Self {
        let document = backing.full_info();
        Self {
            revision: document.revision,
            internal_id: backing.internal_id,
            document,
            changed_properties,
        }
    }

    pub fn is_relevant(&self, relevant_properties: &HashSet<String>) -> bool {
        match &self.changed_properties {
            None => true,
            Some(changed) => changed.iter().any(|p| relevant_properties.contains(p)),
        }
    }
}

/// A set of writes plus the removals that accompanied them
#[derive(Debug, Default)]
pub struct UpdatesInfo {
    pub updates: Vec<UpdateInfo>,
    pub removed_ids: Vec<i64>,
}

impl UpdatesInfo {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.removed_ids.is_empty()
    }
}

enum StructureRef {
    Cache(Arc<Mutex<Cache>>),
    Collection(Arc<Mutex<Collection>>),
    Index(Arc<Mutex<Index>>),
}

/// Fan-out engine owning the registered derived structures
#[derive(Default)]
pub struct UpdatePipeline {
    caches: RwLock<HashMap<String, Arc<Mutex<Cache>>>>,
    collections: RwLock<HashMap<String, Arc<Mutex<Collection>>>>,
    indexes: RwLock<HashMap<String, Arc<Mutex<Index>>>>,
    /// Structures per document type, in registration order
    by_type: RwLock<HashMap<String, Vec<StructureRef>>>,
}

impl UpdatePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_cache(&self, cache: Cache) -> Arc<Mutex<Cache>> {
        let document_type = cache.document_type.clone();
        let name = cache.name.clone();
        let cache = Arc::new(Mutex::new(cache));
        let replaced = self
            .caches
            .write()
            .unwrap()
            .insert(name, Arc::clone(&cache));
        let mut by_type = self.by_type.write().unwrap();
        let structures = by_type.entry(document_type).or_default();
        if let Some(replaced) = replaced {
            structures.retain(|structure| {
                !matches!(structure, StructureRef::Cache(existing) if Arc::ptr_eq(existing, &replaced))
            });
        }
        structures.push(StructureRef::Cache(Arc::clone(&cache)));
        cache
    }

    pub fn register_collection(&self, collection: Collection) -> Arc<Mutex<Collection>> {
        let document_type = collection.document_type.clone();
        let name = collection.name.clone();
        let collection = Arc::new(Mutex::new(collection));
        let replaced = self
            .collections
            .write()
            .unwrap()
            .insert(name, Arc::clone(&collection));
        let mut by_type = self.by_type.write().unwrap();
        let structures = by_type.entry(document_type).or_default();
        if let Some(replaced) = replaced {
            structures.retain(|structure| {
                !matches!(structure, StructureRef::Collection(existing) if Arc::ptr_eq(existing, &replaced))
            });
        }
        structures.push(StructureRef::Collection(Arc::clone(&collection)));
        collection
    }

    pub fn register_index(&self, index: Index) -> Arc<Mutex<Index>> {
        let document_type = index.document_type.clone();
        let name = index.name.clone();
        let index = Arc::new(Mutex::new(index));
        let replaced = self
            .indexes
            .write()
            .unwrap()
            .insert(name, Arc::clone(&index));
        let mut by_type = self.by_type.write().unwrap();
        let structures = by_type.entry(document_type).or_default();
        if let Some(replaced) = replaced {
            structures.retain(|structure| {
                !matches!(structure, StructureRef::Index(existing) if Arc::ptr_eq(existing, &replaced))
            });
        }
        structures.push(StructureRef::Index(Arc::clone(&index)));
        index
    }

    pub fn cache(&self, name: &str) -> Option<Arc<Mutex<Cache>>> {
        self.caches.read().unwrap().get(name).cloned()
    }

    pub fn collection(&self, name: &str) -> Option<Arc<Mutex<Collection>>> {
        self.collections.read().unwrap().get(name).cloned()
    }

    pub fn index(&self, name: &str) -> Option<Arc<Mutex<Index>>> {
        self.indexes.read().unwrap().get(name).cloned()
    }

    /// Push one set of writes through every structure registered on the
    /// document type. Removals are applied to every structure regardless
    /// of relevant-property filters.
    pub fn update(
        &self,
        backend: &dyn Backend,
        document_type: &str,
        updates_info: &UpdatesInfo,
    ) -> StorageResult<()> {
        if updates_info.is_empty() {
            return Ok(());
        }

        let by_type = self.by_type.read().unwrap();
        let Some(structures) = by_type.get(document_type) else {
            return Ok(());
        };

        for structure in structures {
            match structure {
                StructureRef::Cache(cache) => {
                    let mut cache = cache.lock().unwrap();
                    if !updates_info.removed_ids.is_empty() {
                        backend.cache_remove_ids(&cache.name, &updates_info.removed_ids)?;
                    }
                    let results = cache.update(&updates_info.updates);
                    let row_width = cache.value_names().len() + 1;
                    let chunk = (backend.variable_limit() / row_width).max(1);
                    for rows in results.values_by_id.chunks(chunk) {
                        backend.cache_update(&cache.name, rows, None)?;
                    }
                    backend.cache_update(&cache.name, &[], results.last_revision)?;
                }
                StructureRef::Collection(collection) => {
                    let mut collection = collection.lock().unwrap();
                    if !updates_info.removed_ids.is_empty() {
                        backend
                            .collection_remove_ids(&collection.name, &updates_info.removed_ids)?;
                    }
                    let results = collection.update(&updates_info.updates);
                    let chunk = backend.variable_limit().max(1);
                    for ids in results.not_included_ids.chunks(chunk) {
                        backend.collection_update(&collection.name, &[], ids, None)?;
                    }
                    for ids in results.included_ids.chunks(chunk) {
                        backend.collection_update(&collection.name, ids, &[], None)?;
                    }
                    backend.collection_update(&collection.name, &[], &[], results.last_revision)?;
                }
                StructureRef::Index(index) => {
                    let mut index = index.lock().unwrap();
                    if !updates_info.removed_ids.is_empty() {
                        backend.index_remove_ids(&index.name, &updates_info.removed_ids)?;
                    }
                    let results = index.update(&updates_info.updates);
                    // Each entry binds a key and an id
                    let chunk = (backend.variable_limit() / 2).max(1);
                    for keys_infos in results.keys_infos.chunks(chunk) {
                        backend.index_update(&index.name, keys_infos, None)?;
                    }
                    backend.index_update(&index.name, &[], results.last_revision)?;
                }
            }
        }
        Ok(())
    }

    /// Replay every document written since the collection's last revision
    pub fn bring_collection_up_to_date(
        &self,
        backend: &dyn Backend,
        collection: &Arc<Mutex<Collection>>,
    ) -> StorageResult<()> {
        loop {
            let (document_type, last_revision) = {
                let collection = collection.lock().unwrap();
                (collection.document_type.clone(), collection.last_revision)
            };
            let (updates_info, full) =
                replay_round(backend, &document_type, last_revision)?;
            if updates_info.is_empty() {
                return Ok(());
            }

            let mut collection = collection.lock().unwrap();
            if !updates_info.removed_ids.is_empty() {
                backend.collection_remove_ids(&collection.name, &updates_info.removed_ids)?;
            }
            let results = collection.update(&updates_info.updates);
            let chunk = backend.variable_limit().max(1);
            for ids in results.not_included_ids.chunks(chunk) {
                backend.collection_update(&collection.name, &[], ids, None)?;
            }
            for ids in results.included_ids.chunks(chunk) {
                backend.collection_update(&collection.name, ids, &[], None)?;
            }
            // Tombstoned documents carry no new revision; advance past the
            // round's high-water mark so the replay terminates
            let advance = results
                .last_revision
                .max(updates_info.updates.iter().map(|u| u.revision).max());
            if let Some(advance) = advance {
                collection.last_revision = collection.last_revision.max(advance);
            }
            backend.collection_update(&collection.name, &[], &[], advance)?;

            if !full {
                return Ok(());
            }
        }
    }

    /// Replay every document written since the index's last revision
    pub fn bring_index_up_to_date(
        &self,
        backend: &dyn Backend,
        index: &Arc<Mutex<Index>>,
    ) -> StorageResult<()> {
        loop {
            let (document_type, last_revision) = {
                let index = index.lock().unwrap();
                (index.document_type.clone(), index.last_revision)
            };
            let (updates_info, full) = replay_round(backend, &document_type, last_revision)?;
            if updates_info.is_empty() {
                return Ok(());
            }

            let mut index = index.lock().unwrap();
            if !updates_info.removed_ids.is_empty() {
                backend.index_remove_ids(&index.name, &updates_info.removed_ids)?;
            }
            let results = index.update(&updates_info.updates);
            let chunk = (backend.variable_limit() / 2).max(1);
            for keys_infos in results.keys_infos.chunks(chunk) {
                backend.index_update(&index.name, keys_infos, None)?;
            }
            let advance = results
                .last_revision
                .max(updates_info.updates.iter().map(|u| u.revision).max());
            if let Some(advance) = advance {
                index.last_revision = index.last_revision.max(advance);
            }
            backend.index_update(&index.name, &[], advance)?;

            if !full {
                return Ok(());
            }
        }
    }

    /// Replay every document written since the cache's last revision
    pub fn bring_cache_up_to_date(
        &self,
        backend: &dyn Backend,
        cache: &Arc<Mutex<Cache>>,
    ) -> StorageResult<()> {
        loop {
            let (document_type, last_revision) = {
                let cache = cache.lock().unwrap();
                (cache.document_type.clone(), cache.last_revision)
            };
            let (updates_info, full) = replay_round(backend, &document_type, last_revision)?;
            if updates_info.is_empty() {
                return Ok(());
            }

            let mut cache = cache.lock().unwrap();
            if !updates_info.removed_ids.is_empty() {
                backend.cache_remove_ids(&cache.name, &updates_info.removed_ids)?;
            }
            let results = cache.update(&updates_info.updates);
            let row_width = cache.value_names().len() + 1;
            let chunk = (backend.variable_limit() / row_width).max(1);
            for rows in results.values_by_id.chunks(chunk) {
                backend.cache_update(&cache.name, rows, None)?;
            }
            let advance = results
                .last_revision
                .max(updates_info.updates.iter().map(|u| u.revision).max());
            if let Some(advance) = advance {
                cache.last_revision = cache.last_revision.max(advance);
            }
            backend.cache_update(&cache.name, &[], advance)?;

            if !full {
                return Ok(());
            }
        }
    }
}

/// Pull one replay round from the backend: active documents become
/// updates with unspecified changed properties, tombstoned ones become
/// removals. The second return value says whether the round was full and
/// another may follow.
fn replay_round(
    backend: &dyn Backend,
    document_type: &str,
    since_revision: u32,
) -> StorageResult<(UpdatesInfo, bool)> {
    let backings =
        backend.document_backings_since_revision(document_type, since_revision, Some(REPLAY_READ_COUNT))?;
    let full = backings.len() == REPLAY_READ_COUNT;

    let mut updates_info = UpdatesInfo::default();
    for backing in &backings {
        if backing.is_active() {
            updates_info
                .updates
                .push(UpdateInfo::from_backing(backing, None));
        } else {
            updates_info.removed_ids.push(backing.internal_id);
            // Still advance past its revision
            updates_info.updates.push(UpdateInfo {
                document: backing.full_info(),
                revision: backing.revision(),
                internal_id: backing.internal_id,
                changed_properties: Some(HashSet::new()),
            });
        }
    }
    if !updates_info.updates.is_empty() {
        debug!(
            "replay {}: {} updates, {} removals since revision {}",
            document_type,
            updates_info.updates.len(),
            updates_info.removed_ids.len(),
            since_revision
        );
    }
    Ok((updates_info, full))
}
