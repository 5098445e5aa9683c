//! Document-facing types
//!
//! The shapes handed across the public API: create requests and results,
//! revision and full info snapshots, attachment info, and change
//! notification kinds. Documents themselves are addressed by
//! (document type, document id); the engine never hands out live handles.

use std::collections::HashMap;

use base64::Engine;
use uuid::Uuid;

use crate::value::ValueDict;

/// Universal time: seconds since the Unix epoch
pub type UniversalTime = f64;

/// Returns the current universal time
pub fn universal_time_now() -> UniversalTime {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Generates an opaque id: a v4 UUID rendered as unpadded url-safe base64
pub fn new_opaque_id() -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

/// How `document_set` interprets the incoming value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetValueKind {
    /// Store the value as given
    Normal,
    /// Re-tag a numeric value as universal time
    UniversalTime,
}

/// Request shape for `document_create`
#[derive(Debug, Clone, Default)]
pub struct DocumentCreateInfo {
    /// Caller-supplied id; engine-generated when absent
    pub document_id: Option<String>,
    pub creation_time: Option<UniversalTime>,
    pub modification_time: Option<UniversalTime>,
    pub property_map: ValueDict,
}

impl DocumentCreateInfo {
    pub fn new(property_map: ValueDict) -> Self {
        Self {
            document_id: None,
            creation_time: None,
            modification_time: None,
            property_map,
        }
    }

    pub fn with_id(document_id: impl Into<String>, property_map: ValueDict) -> Self {
        Self {
            document_id: Some(document_id.into()),
            creation_time: None,
            modification_time: None,
            property_map,
        }
    }
}

/// Result shape for `document_create`
#[derive(Debug, Clone)]
pub struct DocumentCreateResultInfo {
    pub document_id: String,
    pub revision: u32,
    pub creation_time: UniversalTime,
    pub modification_time: UniversalTime,
}

/// Minimal identity snapshot: id + revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRevisionInfo {
    pub document_id: String,
    pub revision: u32,
}

/// Attachment descriptor: id, revision, caller info dictionary
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentInfo {
    pub id: String,
    pub revision: u32,
    pub info: ValueDict,
}

/// Attachment id -> attachment info
pub type AttachmentInfoMap = HashMap<String, AttachmentInfo>;

/// Complete snapshot of one document, including tombstoned ones
#[derive(Debug, Clone)]
pub struct DocumentFullInfo {
    pub document_id: String,
    pub document_type: String,
    pub revision: u32,
    pub active: bool,
    pub creation_time: UniversalTime,
    pub modification_time: UniversalTime,
    pub property_map: ValueDict,
    pub attachment_info_map: AttachmentInfoMap,
}

impl DocumentFullInfo {
    pub fn revision_info(&self) -> DocumentRevisionInfo {
        DocumentRevisionInfo {
            document_id: self.document_id.clone(),
            revision: self.revision,
        }
    }
}

/// What happened to a document, delivered to change callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentChangedKind {
    Created,
    Updated,
    Removed,
}

/// Change notification callback, invoked on the mutating thread after
/// structural locks are released
pub type DocumentChangedFn = dyn Fn(&DocumentFullInfo, DocumentChangedKind) + Send + Sync;
