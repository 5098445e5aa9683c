//! Document store façade
//!
//! The public surface of the engine. Every call validates its inputs,
//! routes to the calling thread's batch when one is open, and otherwise
//! applies the mutation through the backend, feeds the update pipeline,
//! and fires change notifications registered against the document type.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};

use log::{debug, info};

use crate::association::{
    apply_updates, AssociationDef, AssociationItem, AssociationUpdate, GetIntegerValueAction,
};
use crate::backend::Backend;
use crate::backing::DocumentBacking;
use crate::batch::{Batch, BatchResult};
use crate::cache::{Cache, CacheValueInfo};
use crate::collection::Collection;
use crate::document::{
    new_opaque_id, universal_time_now, AttachmentInfo, AttachmentInfoMap, DocumentChangedFn,
    DocumentChangedKind, DocumentCreateInfo, DocumentCreateResultInfo, DocumentFullInfo,
    DocumentRevisionInfo, SetValueKind, UniversalTime,
};
use crate::error::{StorageError, StorageResult};
use crate::index::Index;
use crate::pipeline::{UpdateInfo, UpdatePipeline, UpdatesInfo};
use crate::selector::SelectorRegistry;
use crate::value::{Value, ValueDict};

/// The document store: document CRUD, batch scoping, derived structures,
/// associations, attachments, and change notifications over one backend
pub struct DocumentStore<B: Backend> {
    id: String,
    backend: B,
    selectors: SelectorRegistry,
    pipeline: UpdatePipeline,
    associations: RwLock<HashMap<String, AssociationDef>>,
    batches: RwLock<HashMap<ThreadId, Arc<Mutex<Batch>>>>,
    changed_callbacks: RwLock<HashMap<String, Vec<Arc<DocumentChangedFn>>>>,
}

impl<B: Backend> DocumentStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            id: new_opaque_id(),
            backend,
            selectors: SelectorRegistry::new(),
            pipeline: UpdatePipeline::new(),
            associations: RwLock::new(HashMap::new()),
            batches: RwLock::new(HashMap::new()),
            changed_callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Opaque id of this store instance
    pub fn id(&self) -> &str {
        &self.id
    }

    // ---- selector registration ----

    pub fn register_is_included_selector(
        &self,
        selector_id: impl Into<String>,
        f: impl Fn(&DocumentFullInfo, &ValueDict) -> bool + Send + Sync + 'static,
    ) {
        self.selectors.register_is_included(selector_id, f);
    }

    pub fn register_keys_selector(
        &self,
        selector_id: impl Into<String>,
        f: impl Fn(&DocumentFullInfo, &ValueDict) -> Vec<String> + Send + Sync + 'static,
    ) {
        self.selectors.register_keys(selector_id, f);
    }

    pub fn register_value_selector(
        &self,
        selector_id: impl Into<String>,
        f: impl Fn(&DocumentFullInfo, &str) -> Value + Send + Sync + 'static,
    ) {
        self.selectors.register_value(selector_id, f);
    }

    /// Register a change callback for a document type
    pub fn register_document_changed(
        &self,
        document_type: impl Into<String>,
        f: impl Fn(&DocumentFullInfo, DocumentChangedKind) + Send + Sync + 'static,
    ) {
        self.changed_callbacks
            .write()
            .unwrap()
            .entry(document_type.into())
            .or_default()
            .push(Arc::new(f));
    }

    // ---- info namespaces ----

    pub fn info_get(&self, keys: &[&str]) -> StorageResult<HashMap<String, String>> {
        self.backend.info_get(keys)
    }

    pub fn info_set(&self, info: &HashMap<String, String>) -> StorageResult<()> {
        self.backend.info_set(info)
    }

    pub fn info_remove(&self, keys: &[&str]) -> StorageResult<()> {
        self.backend.info_remove(keys)
    }

    pub fn internal_get(&self, keys: &[&str]) -> StorageResult<HashMap<String, String>> {
        self.backend.internal_get(keys)
    }

    pub fn internal_set(&self, info: &HashMap<String, String>) -> StorageResult<()> {
        self.backend.internal_set(info)
    }

    // ---- associations ----

    pub fn association_register(
        &self,
        name: &str,
        from_document_type: &str,
        to_document_type: &str,
    ) -> StorageResult<()> {
        if let Some(existing) = self.lookup_association(name)? {
            if existing.from_document_type != from_document_type
                || existing.to_document_type != to_document_type
            {
                return Err(StorageError::MismatchedAssociationTypes(name.to_string()));
            }
            return Ok(());
        }

        let def = AssociationDef {
            name: name.to_string(),
            from_document_type: from_document_type.to_string(),
            to_document_type: to_document_type.to_string(),
        };
        self.backend.association_register(&def)?;
        info!(
            "registered association {} ({} -> {})",
            name, from_document_type, to_document_type
        );
        self.associations
            .write()
            .unwrap()
            .insert(name.to_string(), def);
        Ok(())
    }

    /// All items, with the calling thread's pending batch updates applied
    pub fn association_get(&self, name: &str) -> StorageResult<Vec<AssociationItem>> {
        self.association_def(name)?;
        let mut items = self.backend.association_items(name)?;
        if let Some(batch) = self.current_batch() {
            let batch = batch.lock().unwrap();
            apply_updates(&mut items, batch.association_updates(name));
        }
        Ok(items)
    }

    pub fn association_iterate_from(
        &self,
        name: &str,
        from_document_id: &str,
        mut proc: impl FnMut(&DocumentFullInfo),
    ) -> StorageResult<()> {
        let def = self.association_def(name)?;
        self.existing_backing(&def.from_document_type, from_document_id)?;

        let to_ids = self.backend.association_to_ids(name, from_document_id)?;
        for to_id in to_ids {
            if let Some(backing) = self
                .backend
                .document_backing(&def.to_document_type, &to_id)?
            {
                proc(&backing.full_info());
            }
        }
        Ok(())
    }

    pub fn association_iterate_to(
        &self,
        name: &str,
        to_document_id: &str,
        mut proc: impl FnMut(&DocumentFullInfo),
    ) -> StorageResult<()> {
        let def = self.association_def(name)?;
        self.existing_backing(&def.to_document_type, to_document_id)?;

        let from_ids = self.backend.association_from_ids(name, to_document_id)?;
        for from_id in from_ids {
            if let Some(backing) = self
                .backend
                .document_backing(&def.from_document_type, &from_id)?
            {
                proc(&backing.full_info());
            }
        }
        Ok(())
    }

    pub fn association_document_revision_infos_from(
        &self,
        name: &str,
        from_document_id: &str,
        start_index: usize,
        count: Option<usize>,
    ) -> StorageResult<(u64, Vec<DocumentRevisionInfo>)> {
        let (total, backings) = self.association_page(name, from_document_id, true, start_index, count)?;
        Ok((
            total,
            backings
                .iter()
                .map(|backing| backing.full_info().revision_info())
                .collect(),
        ))
    }

    pub fn association_document_revision_infos_to(
        &self,
        name: &str,
        to_document_id: &str,
        start_index: usize,
        count: Option<usize>,
    ) -> StorageResult<(u64, Vec<DocumentRevisionInfo>)> {
        let (total, backings) = self.association_page(name, to_document_id, false, start_index, count)?;
        Ok((
            total,
            backings
                .iter()
                .map(|backing| backing.full_info().revision_info())
                .collect(),
        ))
    }

    pub fn association_document_full_infos_from(
        &self,
        name: &str,
        from_document_id: &str,
        start_index: usize,
        count: Option<usize>,
    ) -> StorageResult<(u64, Vec<DocumentFullInfo>)> {
        let (total, backings) = self.association_page(name, from_document_id, true, start_index, count)?;
        Ok((
            total,
            backings.iter().map(|backing| backing.full_info()).collect(),
        ))
    }

    pub fn association_document_full_infos_to(
        &self,
        name: &str,
        to_document_id: &str,
        start_index: usize,
        count: Option<usize>,
    ) -> StorageResult<(u64, Vec<DocumentFullInfo>)> {
        let (total, backings) = self.association_page(name, to_document_id, false, start_index, count)?;
        Ok((
            total,
            backings.iter().map(|backing| backing.full_info()).collect(),
        ))
    }

    /// Sum cached integer values over every document reachable from the
    /// given from-ids. Pending batch updates apply to the reachable set;
    /// the cached values themselves come from persistence.
    pub fn association_integer_values(
        &self,
        name: &str,
        action: GetIntegerValueAction,
        from_document_ids: &[String],
        cache_name: &str,
        value_names: &[String],
    ) -> StorageResult<HashMap<String, i64>> {
        let GetIntegerValueAction::Sum = action;

        let def = self.association_def(name)?;
        let cache = self
            .pipeline
            .cache(cache_name)
            .ok_or_else(|| StorageError::UnknownCache(cache_name.to_string()))?;
        {
            let cache = cache.lock().unwrap();
            for value_name in value_names {
                if !cache.has_value_info(value_name) {
                    return Err(StorageError::UnknownCacheValueName(value_name.clone()));
                }
            }
        }
        self.pipeline.bring_cache_up_to_date(&self.backend, &cache)?;

        let mut items = self.backend.association_items(name)?;
        if let Some(batch) = self.current_batch() {
            let batch = batch.lock().unwrap();
            apply_updates(&mut items, batch.association_updates(name));
        }

        let from_set: HashSet<&String> = from_document_ids.iter().collect();
        let mut to_ids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for item in &items {
            if from_set.contains(&item.from_document_id) && seen.insert(item.to_document_id.clone())
            {
                to_ids.push(item.to_document_id.clone());
            }
        }

        let mut internal_ids = Vec::with_capacity(to_ids.len());
        for to_id in &to_ids {
            if let Some(backing) = self
                .backend
                .document_backing(&def.to_document_type, to_id)?
            {
                internal_ids.push(backing.internal_id);
            }
        }

        let rows = self.backend.cache_rows(cache_name, &internal_ids)?;
        let mut sums: HashMap<String, i64> =
            value_names.iter().map(|name| (name.clone(), 0)).collect();
        for row in rows.values() {
            for value_name in value_names {
                if let Some(value) = row.get(value_name) {
                    *sums.entry(value_name.clone()).or_insert(0) += value.coerce_i64()?;
                }
            }
        }
        Ok(sums)
    }

    /// Apply association updates: deferred inside a batch, immediate
    /// otherwise. Every referenced document id must be known.
    pub fn association_update(
        &self,
        name: &str,
        updates: Vec<AssociationUpdate>,
    ) -> StorageResult<()> {
        let def = self.association_def(name)?;
        if updates.is_empty() {
            return Ok(());
        }

        let batch = self.current_batch();
        let batch_ids = batch.as_ref().map(|batch| {
            let batch = batch.lock().unwrap();
            batch.known_document_ids()
        });

        for update in &updates {
            self.validate_association_document(
                &def.from_document_type,
                &update.item.from_document_id,
                batch_ids.as_ref(),
            )?;
            self.validate_association_document(
                &def.to_document_type,
                &update.item.to_document_id,
                batch_ids.as_ref(),
            )?;
        }

        match batch {
            Some(batch) => {
                batch.lock().unwrap().note_association_updated(name, updates);
                Ok(())
            }
            None => self.backend.association_update(name, &updates),
        }
    }

    // ---- caches ----

    pub fn cache_register(
        &self,
        name: &str,
        document_type: &str,
        relevant_properties: Vec<String>,
        value_infos: Vec<CacheValueInfo>,
    ) -> StorageResult<()> {
        let mut resolved = Vec::with_capacity(value_infos.len());
        let mut value_names = Vec::with_capacity(value_infos.len());
        for value_info in value_infos {
            let value_fn = self.selectors.value(&value_info.selector_id)?;
            value_names.push(value_info.name.clone());
            resolved.push((value_info, value_fn));
        }

        let declaration = cache_declaration(document_type, &relevant_properties, &resolved)?;
        let last_revision =
            self.backend
                .cache_register(name, document_type, &declaration, &value_names)?;
        debug!("registered cache {} at revision {}", name, last_revision);

        let cache = self.pipeline.register_cache(Cache::new(
            name.to_string(),
            document_type.to_string(),
            relevant_properties,
            resolved,
            last_revision,
        ));
        self.pipeline.bring_cache_up_to_date(&self.backend, &cache)
    }

    // ---- collections ----

    #[allow(clippy::too_many_arguments)]
    pub fn collection_register(
        &self,
        name: &str,
        document_type: &str,
        relevant_properties: Vec<String>,
        version: u32,
        is_up_to_date: bool,
        is_included_info: ValueDict,
        is_included_selector_id: &str,
    ) -> StorageResult<()> {
        let is_included = self.selectors.is_included(is_included_selector_id)?;
        let last_revision =
            self.backend
                .collection_register(name, document_type, version, is_up_to_date)?;
        debug!("registered collection {} at revision {}", name, last_revision);

        let collection = self.pipeline.register_collection(Collection::new(
            name.to_string(),
            document_type.to_string(),
            relevant_properties,
            is_included_info,
            is_included,
            last_revision,
        ));
        self.pipeline
            .bring_collection_up_to_date(&self.backend, &collection)
    }

    /// Current member count. Illegal inside a batch: the count would not
    /// reflect the batch's own writes.
    pub fn collection_document_count(&self, name: &str) -> StorageResult<u64> {
        if self.current_batch().is_some() {
            return Err(StorageError::IllegalInBatch("collection_document_count"));
        }
        let collection = self
            .pipeline
            .collection(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))?;
        self.pipeline
            .bring_collection_up_to_date(&self.backend, &collection)?;
        self.backend.collection_count(name)
    }

    pub fn collection_iterate(
        &self,
        name: &str,
        document_type: &str,
        mut proc: impl FnMut(&DocumentFullInfo),
    ) -> StorageResult<()> {
        for backing in self.collection_backings(name, document_type)? {
            proc(&backing.full_info());
        }
        Ok(())
    }

    pub fn collection_document_revision_infos(
        &self,
        name: &str,
        start_index: usize,
        count: Option<usize>,
    ) -> StorageResult<Vec<DocumentRevisionInfo>> {
        let collection = self
            .pipeline
            .collection(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))?;
        let document_type = collection.lock().unwrap().document_type.clone();
        let backings = self.collection_backings(name, &document_type)?;
        Ok(page(&backings, start_index, count)
            .iter()
            .map(|backing| backing.full_info().revision_info())
            .collect())
    }

    pub fn collection_document_full_infos(
        &self,
        name: &str,
        start_index: usize,
        count: Option<usize>,
    ) -> StorageResult<Vec<DocumentFullInfo>> {
        let collection = self
            .pipeline
            .collection(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))?;
        let document_type = collection.lock().unwrap().document_type.clone();
        let backings = self.collection_backings(name, &document_type)?;
        Ok(page(&backings, start_index, count)
            .iter()
            .map(|backing| backing.full_info())
            .collect())
    }

    // ---- indexes ----

    pub fn index_register(
        &self,
        name: &str,
        document_type: &str,
        relevant_properties: Vec<String>,
        version: u32,
        keys_info: ValueDict,
        keys_selector_id: &str,
    ) -> StorageResult<()> {
        let keys = self.selectors.keys(keys_selector_id)?;
        let last_revision = self.backend.index_register(name, document_type, version)?;
        debug!("registered index {} at revision {}", name, last_revision);

        let index = self.pipeline.register_index(Index::new(
            name.to_string(),
            document_type.to_string(),
            relevant_properties,
            keys_info,
            keys,
            last_revision,
        ));
        self.pipeline.bring_index_up_to_date(&self.backend, &index)
    }

    /// Visit the document behind each present key
    pub fn index_iterate(
        &self,
        name: &str,
        document_type: &str,
        keys: &[String],
        mut key_proc: impl FnMut(&str, &DocumentFullInfo),
    ) -> StorageResult<()> {
        for (key, backing) in self.index_backings(name, document_type, keys)? {
            key_proc(&key, &backing.full_info());
        }
        Ok(())
    }

    pub fn index_document_revision_infos(
        &self,
        name: &str,
        keys: &[String],
    ) -> StorageResult<HashMap<String, DocumentRevisionInfo>> {
        let index = self
            .pipeline
            .index(name)
            .ok_or_else(|| StorageError::UnknownIndex(name.to_string()))?;
        let document_type = index.lock().unwrap().document_type.clone();
        Ok(self
            .index_backings(name, &document_type, keys)?
            .into_iter()
            .map(|(key, backing)| (key, backing.full_info().revision_info()))
            .collect())
    }

    pub fn index_document_full_infos(
        &self,
        name: &str,
        keys: &[String],
    ) -> StorageResult<HashMap<String, DocumentFullInfo>> {
        let index = self
            .pipeline
            .index(name)
            .ok_or_else(|| StorageError::UnknownIndex(name.to_string()))?;
        let document_type = index.lock().unwrap().document_type.clone();
        Ok(self
            .index_backings(name, &document_type, keys)?
            .into_iter()
            .map(|(key, backing)| (key, backing.full_info()))
            .collect())
    }

    // ---- documents ----

    pub fn document_create(
        &self,
        document_type: &str,
        create_infos: Vec<DocumentCreateInfo>,
    ) -> StorageResult<Vec<DocumentCreateResultInfo>> {
        if let Some(batch) = self.current_batch() {
            let mut batch = batch.lock().unwrap();
            let mut results = Vec::with_capacity(create_infos.len());
            for create_info in create_infos {
                let document_id = create_info.document_id.unwrap_or_else(new_opaque_id);
                let now = universal_time_now();
                let creation_time = create_info.creation_time.unwrap_or(now);
                let modification_time = create_info.modification_time.unwrap_or(creation_time);
                batch.add_document(
                    document_type,
                    &document_id,
                    None,
                    creation_time,
                    modification_time,
                    Some(create_info.property_map),
                );
                // The revision is assigned at commit
                results.push(DocumentCreateResultInfo {
                    document_id,
                    revision: 0,
                    creation_time,
                    modification_time,
                });
            }
            return Ok(results);
        }

        let mut results = Vec::with_capacity(create_infos.len());
        let mut updates = Vec::with_capacity(create_infos.len());
        let mut created = Vec::with_capacity(create_infos.len());
        self.backend.write_batch(&mut || {
            for create_info in &create_infos {
                let document_id = create_info
                    .document_id
                    .clone()
                    .unwrap_or_else(new_opaque_id);
                let now = universal_time_now();
                let creation_time = create_info.creation_time.unwrap_or(now);
                let modification_time = create_info.modification_time.unwrap_or(creation_time);

                let backing = self.backend.document_create(
                    document_type,
                    &document_id,
                    creation_time,
                    modification_time,
                    &create_info.property_map,
                )?;
                results.push(DocumentCreateResultInfo {
                    document_id,
                    revision: backing.revision(),
                    creation_time,
                    modification_time,
                });
                updates.push(UpdateInfo::from_backing(&backing, None));
                created.push(backing.full_info());
            }
            Ok(())
        })?;

        self.pipeline.update(
            &self.backend,
            document_type,
            &UpdatesInfo {
                updates,
                removed_ids: Vec::new(),
            },
        )?;
        for full_info in &created {
            self.notify_changed(document_type, full_info, DocumentChangedKind::Created);
        }
        Ok(results)
    }

    /// Count of active documents of a type
    pub fn document_count(&self, document_type: &str) -> StorageResult<u64> {
        self.known_document_type(document_type)?;
        self.backend.document_count(document_type)
    }

    /// Visit the given documents; any unknown id fails
    pub fn document_iterate(
        &self,
        document_type: &str,
        document_ids: &[String],
        mut proc: impl FnMut(&DocumentFullInfo),
    ) -> StorageResult<()> {
        for document_id in document_ids {
            proc(&self.document_full_info(document_type, document_id)?);
        }
        Ok(())
    }

    /// Visit every document of a type, excluding tombstoned ones when
    /// `active_only`
    pub fn document_iterate_all(
        &self,
        document_type: &str,
        active_only: bool,
        mut proc: impl FnMut(&DocumentFullInfo),
    ) -> StorageResult<()> {
        self.known_document_type(document_type)?;
        for backing in self.backend.document_backings(document_type, active_only)? {
            proc(&self.overlay_batch(backing.full_info()));
        }
        Ok(())
    }

    pub fn document_revision_infos(
        &self,
        document_type: &str,
        document_ids: &[String],
    ) -> StorageResult<Vec<DocumentRevisionInfo>> {
        self.known_document_type(document_type)?;
        Ok(self
            .backend
            .document_backings_by_ids(document_type, document_ids)?
            .iter()
            .map(|backing| backing.full_info().revision_info())
            .collect())
    }

    pub fn document_revision_infos_since(
        &self,
        document_type: &str,
        since_revision: u32,
        count: Option<usize>,
    ) -> StorageResult<Vec<DocumentRevisionInfo>> {
        self.known_document_type(document_type)?;
        Ok(self
            .backend
            .document_backings_since_revision(document_type, since_revision, count)?
            .iter()
            .map(|backing| backing.full_info().revision_info())
            .collect())
    }

    pub fn document_full_infos(
        &self,
        document_type: &str,
        document_ids: &[String],
    ) -> StorageResult<Vec<DocumentFullInfo>> {
        self.known_document_type(document_type)?;
        Ok(self
            .backend
            .document_backings_by_ids(document_type, document_ids)?
            .iter()
            .map(|backing| backing.full_info())
            .collect())
    }

    pub fn document_full_infos_since(
        &self,
        document_type: &str,
        since_revision: u32,
        count: Option<usize>,
    ) -> StorageResult<Vec<DocumentFullInfo>> {
        self.known_document_type(document_type)?;
        Ok(self
            .backend
            .document_backings_since_revision(document_type, since_revision, count)?
            .iter()
            .map(|backing| backing.full_info())
            .collect())
    }

    pub fn document_creation_time(
        &self,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<UniversalTime> {
        if let Some(change) = self.batch_change(document_id) {
            return Ok(change.0);
        }
        Ok(self.existing_backing(document_type, document_id)?.creation_time)
    }

    pub fn document_modification_time(
        &self,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<UniversalTime> {
        if let Some(change) = self.batch_change(document_id) {
            return Ok(change.1);
        }
        Ok(self
            .existing_backing(document_type, document_id)?
            .modification_time())
    }

    /// Read one property. Inside a batch, the batch's own writes win.
    pub fn document_value(
        &self,
        property: &str,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<Option<Value>> {
        if let Some(batch) = self.current_batch() {
            let batch = batch.lock().unwrap();
            if let Some(change) = batch.document_change(document_id) {
                return Ok(change.value(property));
            }
        }
        Ok(self
            .existing_backing(document_type, document_id)?
            .value(property))
    }

    /// Integer view of a property, crossing numeric classes when lossless
    pub fn document_integer_value(
        &self,
        property: &str,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<Option<i64>> {
        Ok(self
            .document_value(property, document_type, document_id)?
            .and_then(|value| value.coerce_i64().ok()))
    }

    pub fn document_string_value(
        &self,
        property: &str,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<Option<String>> {
        Ok(self
            .document_value(property, document_type, document_id)?
            .and_then(|value| value.as_str().ok().map(str::to_string)))
    }

    /// Write one property (`None` removes it). A no-op on tombstoned
    /// documents.
    pub fn document_set(
        &self,
        property: &str,
        value: Option<Value>,
        document_type: &str,
        document_id: &str,
        kind: SetValueKind,
    ) -> StorageResult<()> {
        let value = match (kind, value) {
            (SetValueKind::UniversalTime, Some(value)) => Some(Value::Time(value.as_time()?)),
            (_, value) => value,
        };

        if let Some(batch) = self.current_batch() {
            let mut batch = batch.lock().unwrap();
            if let Some(change) = batch.document_change_mut(document_id) {
                change.set(property, value);
                return Ok(());
            }
            let backing = self.existing_backing(document_type, document_id)?;
            let now = universal_time_now();
            batch
                .add_document(
                    document_type,
                    document_id,
                    Some(Arc::clone(&backing)),
                    backing.creation_time,
                    now,
                    None,
                )
                .set(property, value);
            return Ok(());
        }

        let backing = self.existing_backing(document_type, document_id)?;
        if !backing.is_active() {
            return Ok(());
        }

        let mut updated = ValueDict::new();
        let mut removed = HashSet::new();
        match value {
            Some(value) => {
                updated.insert(property.to_string(), value);
            }
            None => {
                removed.insert(property.to_string());
            }
        }
        self.backend.document_update(&backing, &updated, &removed)?;

        let mut changed = HashSet::new();
        changed.insert(property.to_string());
        let full_info = backing.full_info();
        self.pipeline.update(
            &self.backend,
            document_type,
            &UpdatesInfo {
                updates: vec![UpdateInfo::from_backing(&backing, Some(changed))],
                removed_ids: Vec::new(),
            },
        )?;
        self.notify_changed(document_type, &full_info, DocumentChangedKind::Updated);
        Ok(())
    }

    /// Tombstone a document. Entering the tombstoned state is final; a
    /// second remove is a no-op.
    pub fn document_remove(&self, document_type: &str, document_id: &str) -> StorageResult<()> {
        if let Some(batch) = self.current_batch() {
            let mut batch = batch.lock().unwrap();
            if let Some(change) = batch.document_change_mut(document_id) {
                change.remove();
                return Ok(());
            }
            let backing = self.existing_backing(document_type, document_id)?;
            let now = universal_time_now();
            batch
                .add_document(
                    document_type,
                    document_id,
                    Some(Arc::clone(&backing)),
                    backing.creation_time,
                    now,
                    None,
                )
                .remove();
            return Ok(());
        }

        let backing = self.existing_backing(document_type, document_id)?;
        if !backing.is_active() {
            return Ok(());
        }
        self.backend.document_remove(&backing)?;

        let full_info = backing.full_info();
        self.pipeline.update(
            &self.backend,
            document_type,
            &UpdatesInfo {
                updates: Vec::new(),
                removed_ids: vec![backing.internal_id],
            },
        )?;
        self.notify_changed(document_type, &full_info, DocumentChangedKind::Removed);
        Ok(())
    }

    // ---- attachments ----

    pub fn document_attachment_add(
        &self,
        document_type: &str,
        document_id: &str,
        info: ValueDict,
        content: &[u8],
    ) -> StorageResult<AttachmentInfo> {
        if let Some(batch) = self.current_batch() {
            let mut batch = batch.lock().unwrap();
            if let Some(change) = batch.document_change_mut(document_id) {
                return Ok(change.attachment_add(info, content.to_vec()));
            }
            let backing = self.existing_backing(document_type, document_id)?;
            let now = universal_time_now();
            return Ok(batch
                .add_document(
                    document_type,
                    document_id,
                    Some(Arc::clone(&backing)),
                    backing.creation_time,
                    now,
                    None,
                )
                .attachment_add(info, content.to_vec()));
        }

        let backing = self.existing_backing(document_type, document_id)?;
        if !backing.is_active() {
            return Err(StorageError::UnknownDocumentId(document_id.to_string()));
        }
        let attachment_info = self.backend.attachment_add(&backing, None, &info, content)?;
        self.finish_attachment_write(document_type, &backing)?;
        Ok(attachment_info)
    }

    pub fn document_attachment_info_map(
        &self,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<AttachmentInfoMap> {
        if let Some(batch) = self.current_batch() {
            let batch = batch.lock().unwrap();
            if let Some(change) = batch.document_change(document_id) {
                let initial = change
                    .backing
                    .as_ref()
                    .map(|backing| backing.attachment_info_map())
                    .unwrap_or_default();
                return Ok(change.updated_attachment_info_map(&initial));
            }
        }
        Ok(self
            .existing_backing(document_type, document_id)?
            .attachment_info_map())
    }

    pub fn document_attachment_content(
        &self,
        document_type: &str,
        document_id: &str,
        attachment_id: &str,
    ) -> StorageResult<Vec<u8>> {
        if let Some(batch) = self.current_batch() {
            let batch = batch.lock().unwrap();
            if let Some(change) = batch.document_change(document_id) {
                if let Some(content) = change.attachment_content(attachment_id) {
                    return Ok(content);
                }
                if change.attachment_removes.contains(attachment_id) {
                    return Err(StorageError::UnknownAttachmentId(attachment_id.to_string()));
                }
            }
        }
        let backing = self.existing_backing(document_type, document_id)?;
        self.backend.attachment_content(&backing, attachment_id)
    }

    /// Replace an attachment's info and content. Returns the new
    /// attachment revision, or `None` when buffered in a batch or applied
    /// to a tombstoned document.
    pub fn document_attachment_update(
        &self,
        document_type: &str,
        document_id: &str,
        attachment_id: &str,
        info: ValueDict,
        content: &[u8],
    ) -> StorageResult<Option<u32>> {
        if let Some(batch) = self.current_batch() {
            let mut batch = batch.lock().unwrap();
            let current_revision = {
                let change = batch.document_change(document_id);
                change
                    .and_then(|change| {
                        change
                            .attachment_adds
                            .get(attachment_id)
                            .map(|_| 1)
                            .or_else(|| {
                                change
                                    .attachment_updates
                                    .get(attachment_id)
                                    .map(|update| update.current_revision)
                            })
                    })
                    .or_else(|| {
                        self.backend
                            .document_backing(document_type, document_id)
                            .ok()
                            .flatten()
                            .and_then(|backing| backing.attachment_revision(attachment_id))
                    })
                    .ok_or_else(|| StorageError::UnknownAttachmentId(attachment_id.to_string()))?
            };
            if let Some(change) = batch.document_change_mut(document_id) {
                change.attachment_update(attachment_id, current_revision, info, content.to_vec());
                return Ok(None);
            }
            let backing = self.existing_backing(document_type, document_id)?;
            let now = universal_time_now();
            batch
                .add_document(
                    document_type,
                    document_id,
                    Some(Arc::clone(&backing)),
                    backing.creation_time,
                    now,
                    None,
                )
                .attachment_update(attachment_id, current_revision, info, content.to_vec());
            return Ok(None);
        }

        let backing = self.existing_backing(document_type, document_id)?;
        if !backing.is_active() {
            return Ok(None);
        }
        if backing.attachment_revision(attachment_id).is_none() {
            return Err(StorageError::UnknownAttachmentId(attachment_id.to_string()));
        }
        let revision = self
            .backend
            .attachment_update(&backing, attachment_id, &info, content)?;
        self.finish_attachment_write(document_type, &backing)?;
        Ok(Some(revision))
    }

    pub fn document_attachment_remove(
        &self,
        document_type: &str,
        document_id: &str,
        attachment_id: &str,
    ) -> StorageResult<()> {
        if let Some(batch) = self.current_batch() {
            let mut batch = batch.lock().unwrap();
            if let Some(change) = batch.document_change_mut(document_id) {
                change.attachment_remove(attachment_id);
                return Ok(());
            }
            let backing = self.existing_backing(document_type, document_id)?;
            let now = universal_time_now();
            batch
                .add_document(
                    document_type,
                    document_id,
                    Some(Arc::clone(&backing)),
                    backing.creation_time,
                    now,
                    None,
                )
                .attachment_remove(attachment_id);
            return Ok(());
        }

        let backing = self.existing_backing(document_type, document_id)?;
        if !backing.is_active() {
            return Ok(());
        }
        self.backend.attachment_remove(&backing, attachment_id)?;
        self.finish_attachment_write(document_type, &backing)?;
        Ok(())
    }

    // ---- batches ----

    /// Run `proc` with a batch bound to the calling thread. Mutations made
    /// by `proc` are buffered; a Commit verdict applies them atomically,
    /// Cancel discards them.
    pub fn batch(
        &self,
        proc: impl FnOnce() -> StorageResult<BatchResult>,
    ) -> StorageResult<()> {
        let thread_id = thread::current().id();
        {
            let mut batches = self.batches.write().unwrap();
            if batches.contains_key(&thread_id) {
                return Err(StorageError::IllegalInBatch("batch"));
            }
            batches.insert(thread_id, Arc::new(Mutex::new(Batch::new())));
        }

        let verdict = proc();

        let batch = self
            .batches
            .write()
            .unwrap()
            .remove(&thread_id)
            .expect("batch bound to this thread");

        match verdict? {
            BatchResult::Commit => self.commit_batch(&batch.lock().unwrap()),
            BatchResult::Cancel => Ok(()),
        }
    }

    // ---- internals ----

    fn commit_batch(&self, batch: &Batch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        debug!("committing batch");

        let mut notifications: Vec<(String, DocumentFullInfo, DocumentChangedKind)> = Vec::new();
        let mut updates_by_type: Vec<(String, UpdatesInfo)> = Vec::new();

        let result = self.backend.write_batch(&mut || {
            for (document_type, changes) in batch.changes_by_document_type() {
                let mut updates_info = UpdatesInfo::default();

                for (document_id, change) in changes {
                    if change.removed {
                        if let Some(backing) = &change.backing {
                            if backing.is_active() {
                                self.backend.document_remove(backing)?;
                                updates_info.removed_ids.push(backing.internal_id);
                                notifications.push((
                                    document_type.clone(),
                                    backing.full_info(),
                                    DocumentChangedKind::Removed,
                                ));
                            }
                        }
                        // Created and removed inside the same batch: nothing
                        // ever reaches the backend
                        continue;
                    }

                    match &change.backing {
                        Some(backing) => {
                            let changed = change.changed_properties();
                            if !changed.is_empty() {
                                self.backend.document_update_at(
                                    backing,
                                    &change.updated_properties,
                                    &change.removed_properties,
                                    change.modification_time,
                                )?;
                            }
                            self.apply_batch_attachments(backing, change)?;
                            updates_info
                                .updates
                                .push(UpdateInfo::from_backing(backing, Some(changed)));
                            notifications.push((
                                document_type.clone(),
                                backing.full_info(),
                                DocumentChangedKind::Updated,
                            ));
                        }
                        None => {
                            let mut property_map =
                                change.initial_property_map.clone().unwrap_or_default();
                            for (key, value) in &change.updated_properties {
                                property_map.insert(key.clone(), value.clone());
                            }
                            for key in &change.removed_properties {
                                property_map.remove(key);
                            }
                            let backing = self.backend.document_create(
                                &document_type,
                                document_id,
                                change.creation_time,
                                change.modification_time,
                                &property_map,
                            )?;
                            self.apply_batch_attachments(&backing, change)?;
                            updates_info
                                .updates
                                .push(UpdateInfo::from_backing(&backing, None));
                            notifications.push((
                                document_type.clone(),
                                backing.full_info(),
                                DocumentChangedKind::Created,
                            ));
                        }
                    }
                }

                updates_by_type.push((document_type, updates_info));
            }

            // The pipeline runs exactly once per affected type
            for (document_type, updates_info) in &updates_by_type {
                self.pipeline
                    .update(&self.backend, document_type, updates_info)?;
            }

            for name in batch.updated_association_names() {
                self.backend
                    .association_update(&name, batch.association_updates(&name))?;
            }
            Ok(())
        });
        result?;

        for (document_type, full_info, kind) in &notifications {
            self.notify_changed(document_type, full_info, *kind);
        }
        Ok(())
    }

    fn apply_batch_attachments(
        &self,
        backing: &Arc<DocumentBacking>,
        change: &crate::batch::DocumentChange,
    ) -> StorageResult<()> {
        for removed_id in &change.attachment_removes {
            self.backend.attachment_remove(backing, removed_id)?;
        }
        for add in change.attachment_adds.values() {
            self.backend
                .attachment_add(backing, Some(&add.id), &add.info, &add.content)?;
        }
        for update in change.attachment_updates.values() {
            // An attachment both added and updated in this batch was just
            // created above; route the update through the regular path
            self.backend
                .attachment_update(backing, &update.id, &update.info, &update.content)?;
        }
        Ok(())
    }

    fn finish_attachment_write(
        &self,
        document_type: &str,
        backing: &Arc<DocumentBacking>,
    ) -> StorageResult<()> {
        // Attachments touch no properties; an empty changed set advances
        // the derived structures' revisions without recomputing them
        let full_info = backing.full_info();
        self.pipeline.update(
            &self.backend,
            document_type,
            &UpdatesInfo {
                updates: vec![UpdateInfo::from_backing(backing, Some(HashSet::new()))],
                removed_ids: Vec::new(),
            },
        )?;
        self.notify_changed(document_type, &full_info, DocumentChangedKind::Updated);
        Ok(())
    }

    fn notify_changed(
        &self,
        document_type: &str,
        full_info: &DocumentFullInfo,
        kind: DocumentChangedKind,
    ) {
        let callbacks: Vec<Arc<DocumentChangedFn>> = self
            .changed_callbacks
            .read()
            .unwrap()
            .get(document_type)
            .map(|callbacks| callbacks.to_vec())
            .unwrap_or_default();
        for callback in callbacks {
            callback(full_info, kind);
        }
    }

    fn current_batch(&self) -> Option<Arc<Mutex<Batch>>> {
        self.batches
            .read()
            .unwrap()
            .get(&thread::current().id())
            .cloned()
    }

    /// Creation and modification times of a batched change, if any
    fn batch_change(&self, document_id: &str) -> Option<(UniversalTime, UniversalTime)> {
        let batch = self.current_batch()?;
        let batch = batch.lock().unwrap();
        batch
            .document_change(document_id)
            .map(|change| (change.creation_time, change.modification_time))
    }

    fn lookup_association(&self, name: &str) -> StorageResult<Option<AssociationDef>> {
        if let Some(def) = self.associations.read().unwrap().get(name) {
            return Ok(Some(def.clone()));
        }
        // The durable backend may know it from an earlier run
        if let Some(def) = self.backend.association_def(name)? {
            self.associations
                .write()
                .unwrap()
                .insert(name.to_string(), def.clone());
            return Ok(Some(def));
        }
        Ok(None)
    }

    fn association_def(&self, name: &str) -> StorageResult<AssociationDef> {
        self.lookup_association(name)?
            .ok_or_else(|| StorageError::UnknownAssociation(name.to_string()))
    }

    fn validate_association_document(
        &self,
        document_type: &str,
        document_id: &str,
        batch_ids: Option<&HashSet<String>>,
    ) -> StorageResult<()> {
        if self
            .backend
            .document_backing(document_type, document_id)?
            .is_some()
        {
            return Ok(());
        }
        if let Some(batch_ids) = batch_ids {
            if batch_ids.contains(document_id) {
                return Ok(());
            }
        }
        Err(StorageError::UnknownDocumentId(document_id.to_string()))
    }

    /// Paginated counterpart backings of an association anchor, ordered by
    /// internal id. Total and slice are computed on the persisted set.
    fn association_page(
        &self,
        name: &str,
        anchor_id: &str,
        from_side: bool,
        start_index: usize,
        count: Option<usize>,
    ) -> StorageResult<(u64, Vec<Arc<DocumentBacking>>)> {
        let def = self.association_def(name)?;
        let (anchor_type, counterpart_type) = if from_side {
            (&def.from_document_type, &def.to_document_type)
        } else {
            (&def.to_document_type, &def.from_document_type)
        };
        self.existing_backing(anchor_type, anchor_id)?;

        let counterpart_ids = if from_side {
            self.backend.association_to_ids(name, anchor_id)?
        } else {
            self.backend.association_from_ids(name, anchor_id)?
        };

        let mut backings = Vec::with_capacity(counterpart_ids.len());
        for id in &counterpart_ids {
            if let Some(backing) = self.backend.document_backing(counterpart_type, id)? {
                backings.push(backing);
            }
        }
        backings.sort_by_key(|backing| backing.internal_id);

        let total = backings.len() as u64;
        Ok((total, page(&backings, start_index, count).to_vec()))
    }

    fn collection_backings(
        &self,
        name: &str,
        document_type: &str,
    ) -> StorageResult<Vec<Arc<DocumentBacking>>> {
        let collection = self
            .pipeline
            .collection(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))?;
        if collection.lock().unwrap().document_type != document_type {
            return Err(StorageError::UnknownCollection(name.to_string()));
        }
        self.pipeline
            .bring_collection_up_to_date(&self.backend, &collection)?;

        let internal_ids = self.backend.collection_ids(name)?;
        let mut backings = self
            .backend
            .document_backings_by_internal_ids(document_type, &internal_ids)?;
        backings.sort_by_key(|backing| backing.internal_id);
        Ok(backings)
    }

    fn index_backings(
        &self,
        name: &str,
        document_type: &str,
        keys: &[String],
    ) -> StorageResult<Vec<(String, Arc<DocumentBacking>)>> {
        let index = self
            .pipeline
            .index(name)
            .ok_or_else(|| StorageError::UnknownIndex(name.to_string()))?;
        if index.lock().unwrap().document_type != document_type {
            return Err(StorageError::UnknownIndex(name.to_string()));
        }
        self.pipeline.bring_index_up_to_date(&self.backend, &index)?;

        let entries = self.backend.index_get(name, keys)?;
        let internal_ids: Vec<i64> = entries.values().copied().collect();
        let backings = self
            .backend
            .document_backings_by_internal_ids(document_type, &internal_ids)?;
        let by_internal_id: HashMap<i64, Arc<DocumentBacking>> = backings
            .into_iter()
            .map(|backing| (backing.internal_id, backing))
            .collect();

        let mut result = Vec::with_capacity(entries.len());
        for key in keys {
            if let Some(internal_id) = entries.get(key) {
                if let Some(backing) = by_internal_id.get(internal_id) {
                    result.push((key.clone(), Arc::clone(backing)));
                }
            }
        }
        Ok(result)
    }

    fn known_document_type(&self, document_type: &str) -> StorageResult<()> {
        if self
            .backend
            .document_types()?
            .iter()
            .any(|known| known == document_type)
        {
            Ok(())
        } else {
            Err(StorageError::UnknownDocumentType(document_type.to_string()))
        }
    }

    fn existing_backing(
        &self,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<Arc<DocumentBacking>> {
        self.backend
            .document_backing(document_type, document_id)?
            .ok_or_else(|| StorageError::UnknownDocumentId(document_id.to_string()))
    }

    /// Batch-aware view of a document the calling thread may have pending
    /// changes for
    fn document_full_info(
        &self,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<DocumentFullInfo> {
        let backing = self.existing_backing(document_type, document_id)?;
        Ok(self.overlay_batch(backing.full_info()))
    }

    fn overlay_batch(&self, mut full_info: DocumentFullInfo) -> DocumentFullInfo {
        let Some(batch) = self.current_batch() else {
            return full_info;
        };
        let batch = batch.lock().unwrap();
        let Some(change) = batch.document_change(&full_info.document_id) else {
            return full_info;
        };

        for (key, value) in &change.updated_properties {
            full_info.property_map.insert(key.clone(), value.clone());
        }
        for key in &change.removed_properties {
            full_info.property_map.remove(key);
        }
        full_info.attachment_info_map =
            change.updated_attachment_info_map(&full_info.attachment_info_map);
        full_info.modification_time = change.modification_time;
        if change.removed {
            full_info.active = false;
        }
        full_info
    }
}

/// Slice `items[start_index ..]` bounded by `count`
fn page<T>(items: &[T], start_index: usize, count: Option<usize>) -> &[T] {
    let start = start_index.min(items.len());
    let end = match count {
        Some(count) => (start + count).min(items.len()),
        None => items.len(),
    };
    &items[start..end]
}

#[derive(serde::Serialize)]
struct CacheValueDeclaration<'a> {
    name: &'a str,
    kind: &'static str,
    selector: &'a str,
}

#[derive(serde::Serialize)]
struct CacheDeclaration<'a> {
    document_type: &'a str,
    relevant_properties: Vec<&'a str>,
    value_infos: Vec<CacheValueDeclaration<'a>>,
}

/// Canonical serialization of a cache's declaration, doubling as its
/// version for rebuild detection
fn cache_declaration(
    document_type: &str,
    relevant_properties: &[String],
    value_infos: &[(CacheValueInfo, Arc<crate::selector::ValueFn>)],
) -> StorageResult<String> {
    let mut relevant: Vec<&str> = relevant_properties.iter().map(String::as_str).collect();
    relevant.sort_unstable();
    let declaration = CacheDeclaration {
        document_type,
        relevant_properties: relevant,
        value_infos: value_infos
            .iter()
            .map(|(info, _)| CacheValueDeclaration {
                name: &info.name,
                kind: "integer",
                selector: &info.selector_id,
            })
            .collect(),
    };
    Ok(serde_json::to_string(&declaration)?)
}
