//! Persistence backends
//!
//! The [`Backend`] trait is the abstract persistence contract shared by the
//! in-memory [`EphemeralBackend`] and the durable [`SqliteBackend`]. The
//! store façade and the update pipeline drive everything through this
//! trait; backends own the physical layout, internal id assignment, and
//! per-type revision allocation.

mod ephemeral;
mod sqlite;

pub use ephemeral::EphemeralBackend;
pub use sqlite::SqliteBackend;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::association::{AssociationDef, AssociationItem, AssociationUpdate};
use crate::backing::DocumentBacking;
use crate::document::{AttachmentInfo, UniversalTime};
use crate::error::StorageResult;
use crate::index::KeysInfo;
use crate::value::ValueDict;

/// Abstract persistence contract
pub trait Backend: Send + Sync {
    /// Upper bound on values bound into one physical write; the pipeline
    /// sizes its writer chunks to this
    fn variable_limit(&self) -> usize;

    /// Bounds a physical write batch. A failure inside `f` keeps the
    /// already-applied sub-steps: the hook exists for write throughput,
    /// not for all-or-nothing semantics, which are provided one sub-step
    /// at a time.
    fn write_batch(&self, f: &mut dyn FnMut() -> StorageResult<()>) -> StorageResult<()>;

    // ---- info namespaces ----

    fn info_get(&self, keys: &[&str]) -> StorageResult<HashMap<String, String>>;
    fn info_set(&self, info: &HashMap<String, String>) -> StorageResult<()>;
    fn info_remove(&self, keys: &[&str]) -> StorageResult<()>;

    /// Engine bookkeeping namespace, separate from caller info
    fn internal_get(&self, keys: &[&str]) -> StorageResult<HashMap<String, String>>;
    fn internal_set(&self, info: &HashMap<String, String>) -> StorageResult<()>;

    // ---- revisions ----

    /// Allocate the next revision for a document type. Atomic per type.
    fn next_revision(&self, document_type: &str) -> StorageResult<u32>;

    /// Highest revision assigned so far for a document type
    fn last_revision(&self, document_type: &str) -> StorageResult<u32>;

    /// Document types the backend has seen
    fn document_types(&self) -> StorageResult<Vec<String>>;

    // ---- documents ----

    /// Insert a fresh document, assigning its internal id and first
    /// revision. Fails if the external id exists anywhere in the store.
    fn document_create(
        &self,
        document_type: &str,
        document_id: &str,
        creation_time: UniversalTime,
        modification_time: UniversalTime,
        property_map: &ValueDict,
    ) -> StorageResult<Arc<DocumentBacking>>;

    /// Look up a backing; tombstoned documents are returned too
    fn document_backing(
        &self,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<Option<Arc<DocumentBacking>>>;

    /// Backings for the given external ids; any unknown id fails
    fn document_backings_by_ids(
        &self,
        document_type: &str,
        document_ids: &[String],
    ) -> StorageResult<Vec<Arc<DocumentBacking>>>;

    /// Backings for the given internal ids; unknown ids are skipped
    fn document_backings_by_internal_ids(
        &self,
        document_type: &str,
        internal_ids: &[i64],
    ) -> StorageResult<Vec<Arc<DocumentBacking>>>;

    /// All backings of a type, optionally excluding tombstoned ones
    fn document_backings(
        &self,
        document_type: &str,
        active_only: bool,
    ) -> StorageResult<Vec<Arc<DocumentBacking>>>;

    /// Backings with revision > `since_revision`, ordered by revision
    /// ascending, up to `count` when given
    fn document_backings_since_revision(
        &self,
        document_type: &str,
        since_revision: u32,
        count: Option<usize>,
    ) -> StorageResult<Vec<Arc<DocumentBacking>>>;

    /// Count of active documents of a type
    fn document_count(&self, document_type: &str) -> StorageResult<u64>;

    /// Merge a property diff into a document, consuming the next revision
    /// and a fresh modification time
    fn document_update(
        &self,
        backing: &DocumentBacking,
        updated: &ValueDict,
        removed: &HashSet<String>,
    ) -> StorageResult<()>;

    /// Merge a property diff using caller-supplied times (batch commit)
    fn document_update_at(
        &self,
        backing: &DocumentBacking,
        updated: &ValueDict,
        removed: &HashSet<String>,
        modification_time: UniversalTime,
    ) -> StorageResult<()>;

    /// Tombstone a document. Final; does not consume a revision.
    fn document_remove(&self, backing: &DocumentBacking) -> StorageResult<()>;

    // ---- attachments ----

    /// Add an attachment. `attachment_id` is engine-generated when absent
    /// (a batch commit carries the id it already handed to the caller).
    /// Consumes the next document revision.
    fn attachment_add(
        &self,
        backing: &DocumentBacking,
        attachment_id: Option<&str>,
        info: &ValueDict,
        content: &[u8],
    ) -> StorageResult<AttachmentInfo>;

    fn attachment_content(
        &self,
        backing: &DocumentBacking,
        attachment_id: &str,
    ) -> StorageResult<Vec<u8>>;

    /// Replace info and content; returns the new attachment revision.
    /// Consumes the next document revision.
    fn attachment_update(
        &self,
        backing: &DocumentBacking,
        attachment_id: &str,
        info: &ValueDict,
        content: &[u8],
    ) -> StorageResult<u32>;

    /// Remove an attachment. Consumes the next document revision.
    fn attachment_remove(
        &self,
        backing: &DocumentBacking,
        attachment_id: &str,
    ) -> StorageResult<()>;

    // ---- associations ----

    /// Persist an association definition. Registration idempotence and
    /// type mismatch are validated by the store.
    fn association_register(&self, def: &AssociationDef) -> StorageResult<()>;

    fn association_def(&self, name: &str) -> StorageResult<Option<AssociationDef>>;

    fn association_items(&self, name: &str) -> StorageResult<Vec<AssociationItem>>;

    fn association_update(
        &self,
        name: &str,
        updates: &[AssociationUpdate],
    ) -> StorageResult<()>;

    /// To-ids paired with `from_document_id`
    fn association_to_ids(&self, name: &str, from_document_id: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .association_items(name)?
            .into_iter()
            .filter(|item| item.from_document_id == from_document_id)
            .map(|item| item.to_document_id)
            .collect())
    }

    /// From-ids paired with `to_document_id`
    fn association_from_ids(&self, name: &str, to_document_id: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .association_items(name)?
            .into_iter()
            .filter(|item| item.to_document_id == to_document_id)
            .map(|item| item.from_document_id)
            .collect())
    }

    // ---- collections ----

    /// Register a collection, returning its persisted last revision. A new
    /// name starts at 0 (or at the type's current last revision when
    /// `is_up_to_date`); a version change resets the contents to empty and
    /// the last revision to 0.
    fn collection_register(
        &self,
        name: &str,
        document_type: &str,
        version: u32,
        is_up_to_date: bool,
    ) -> StorageResult<u32>;

    fn collection_update(
        &self,
        name: &str,
        included_ids: &[i64],
        not_included_ids: &[i64],
        last_revision: Option<u32>,
    ) -> StorageResult<()>;

    fn collection_remove_ids(&self, name: &str, internal_ids: &[i64]) -> StorageResult<()>;

    fn collection_ids(&self, name: &str) -> StorageResult<Vec<i64>>;

    fn collection_count(&self, name: &str) -> StorageResult<u64>;

    // ---- indexes ----

    /// Register an index, returning its persisted last revision; a version
    /// change resets contents and last revision
    fn index_register(&self, name: &str, document_type: &str, version: u32)
        -> StorageResult<u32>;

    /// Delete every entry pointing at an updated id, then insert the new
    /// (key, id) pairs; later pairs win per key
    fn index_update(
        &self,
        name: &str,
        keys_infos: &[KeysInfo],
        last_revision: Option<u32>,
    ) -> StorageResult<()>;

    fn index_remove_ids(&self, name: &str, internal_ids: &[i64]) -> StorageResult<()>;

    /// key -> internal id for the requested keys; absent keys are omitted
    fn index_get(&self, name: &str, keys: &[String]) -> StorageResult<HashMap<String, i64>>;

    // ---- caches ----

    /// Register a cache, returning its persisted last revision. The
    /// declaration (serialized value infos) doubles as the version: a
    /// changed declaration resets the rows and the last revision.
    fn cache_register(
        &self,
        name: &str,
        document_type: &str,
        declaration: &str,
        value_names: &[String],
    ) -> StorageResult<u32>;

    fn cache_update(
        &self,
        name: &str,
        values_by_id: &[(i64, ValueDict)],
        last_revision: Option<u32>,
    ) -> StorageResult<()>;

    fn cache_remove_ids(&self, name: &str, internal_ids: &[i64]) -> StorageResult<()>;

    /// Rows for the given internal ids; absent rows are omitted
    fn cache_rows(
        &self,
        name: &str,
        internal_ids: &[i64],
    ) -> StorageResult<HashMap<i64, ValueDict>>;
}
