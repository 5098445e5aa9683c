//! docstore - an embeddable schema-less document store
//!
//! Documents carry typed properties, binary attachments, and directional
//! associations; collections, indexes, and caches are kept incrementally
//! in sync with document mutations. Two backends share one contract: an
//! in-memory store and a durable single-file store.

pub mod association;
pub mod backend;
pub mod backing;
pub mod batch;
pub mod cache;
pub mod collection;
pub mod document;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod selector;
pub mod store;
pub mod value;

pub use association::{
    AssociationAction, AssociationDef, AssociationItem, AssociationUpdate, GetIntegerValueAction,
};
pub use backend::{Backend, EphemeralBackend, SqliteBackend};
pub use batch::BatchResult;
pub use cache::{CacheValueInfo, CacheValueKind};
pub use document::{
    AttachmentInfo, AttachmentInfoMap, DocumentChangedKind, DocumentCreateInfo,
    DocumentCreateResultInfo, DocumentFullInfo, DocumentRevisionInfo, SetValueKind, UniversalTime,
};
pub use error::{StorageError, StorageResult};
pub use store::DocumentStore;
pub use value::{Value, ValueDict};
