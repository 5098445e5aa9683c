//! Collections
//!
//! A collection is a named predicate over one document type: the set of
//! active documents its selector includes. Membership is recomputed
//! incrementally as relevant properties change.

use std::collections::HashSet;
use std::sync::Arc;

use crate::pipeline::UpdateInfo;
use crate::selector::IsIncludedFn;
use crate::value::ValueDict;

/// Delta produced by one update pass
#[derive(Debug, Default)]
pub struct CollectionUpdateResults {
    pub included_ids: Vec<i64>,
    pub not_included_ids: Vec<i64>,
    pub last_revision: Option<u32>,
}

/// Named predicate-based membership set over one document type
pub struct Collection {
    pub name: String,
    pub document_type: String,
    relevant_properties: HashSet<String>,
    is_included_info: ValueDict,
    is_included: Arc<IsIncludedFn>,
    pub last_revision: u32,
}

impl Collection {
    pub fn new(
        name: String,
        document_type: String,
        relevant_properties: Vec<String>,
        is_included_info: ValueDict,
        is_included: Arc<IsIncludedFn>,
        last_revision: u32,
    ) -> Self {
        Self {
            name,
            document_type,
            relevant_properties: relevant_properties.into_iter().collect(),
            is_included_info,
            is_included,
            last_revision,
        }
    }

    /// Split each update into included / not-included by running the
    /// selector. Updates whose changed-property set does not intersect the
    /// relevant properties only advance `last_revision`.
    pub fn update(&mut self, update_infos: &[UpdateInfo]) -> CollectionUpdateResults {
        let mut results = CollectionUpdateResults::default();

        for update_info in update_infos {
            if update_info.is_relevant(&self.relevant_properties) {
                if (self.is_included)(&update_info.document, &self.is_included_info) {
                    results.included_ids.push(update_info.internal_id);
                } else {
                    results.not_included_ids.push(update_info.internal_id);
                }
            }

            self.last_revision = self.last_revision.max(update_info.revision);
            results.last_revision = Some(self.last_revision);
        }

        results
    }
}
