//! Indexes
//!
//! An index is a named keyed lookup over one document type. Each included
//! document produces an ordered list of string keys; the physical store
//! maps every key to exactly one internal id, last writer winning per key.

use std::collections::HashSet;
use std::sync::Arc;

use crate::pipeline::UpdateInfo;
use crate::selector::KeysFn;
use crate::value::ValueDict;

/// Keys produced for one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysInfo {
    pub keys: Vec<String>,
    pub internal_id: i64,
}

/// Delta produced by one update pass
#[derive(Debug, Default)]
pub struct IndexUpdateResults {
    pub keys_infos: Vec<KeysInfo>,
    pub last_revision: Option<u32>,
}

/// Named keyed materialization over one document type
pub struct Index {
    pub name: String,
    pub document_type: String,
    relevant_properties: HashSet<String>,
    keys_info: ValueDict,
    keys: Arc<KeysFn>,
    pub last_revision: u32,
}

impl Index {
    pub fn new(
        name: String,
        document_type: String,
        relevant_properties: Vec<String>,
        keys_info: ValueDict,
        keys: Arc<KeysFn>,
        last_revision: u32,
    ) -> Self {
        Self {
            name,
            document_type,
            relevant_properties: relevant_properties.into_iter().collect(),
            keys_info,
            keys,
            last_revision,
        }
    }

    pub fn update(&mut self, update_infos: &[UpdateInfo]) -> IndexUpdateResults {
        let mut results = IndexUpdateResults::default();

        for update_info in update_infos {
            if update_info.is_relevant(&self.relevant_properties) {
                results.keys_infos.push(KeysInfo {
                    keys: (self.keys)(&update_info.document, &self.keys_info),
                    internal_id: update_info.internal_id,
                });
            }

            self.last_revision = self.last_revision.max(update_info.revision);
            results.last_revision = Some(self.last_revision);
        }

        results
    }
}
