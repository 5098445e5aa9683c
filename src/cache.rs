//! Caches
//!
//! A cache is a named per-document materialization: for each active
//! document of its type, a row of named values computed by registered
//! value selectors. Rows are keyed by internal id.

use std::collections::HashSet;
use std::sync::Arc;

use crate::selector::ValueFn;
use crate::pipeline::UpdateInfo;
use crate::value::ValueDict;

/// Value kind a cache column may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheValueKind {
    Integer,
}

/// Declaration of one cached value: name, kind, and the selector that
/// computes it
#[derive(Debug, Clone)]
pub struct CacheValueInfo {
    pub name: String,
    pub kind: CacheValueKind,
    pub selector_id: String,
}

/// Delta produced by one update pass: one full row per affected document
#[derive(Debug, Default)]
pub struct CacheUpdateResults {
    pub values_by_id: Vec<(i64, ValueDict)>,
    pub last_revision: Option<u32>,
}

/// Named per-document materialized value set over one document type
pub struct Cache {
    pub name: String,
    pub document_type: String,
    relevant_properties: HashSet<String>,
    value_infos: Vec<(CacheValueInfo, Arc<ValueFn>)>,
    pub last_revision: u32,
}

impl Cache {
    pub fn new(
        name: String,
        document_type: String,
        relevant_properties: Vec<String>,
        value_infos: Vec<(CacheValueInfo, Arc<ValueFn>)>,
        last_revision: u32,
    ) -> Self {
        Self {
            name,
            document_type,
            relevant_properties: relevant_properties.into_iter().collect(),
            value_infos,
            last_revision,
        }
    }

    pub fn has_value_info(&self, value_name: &str) -> bool {
        self.value_infos
            .iter()
            .any(|(info, _)| info.name == value_name)
    }

    pub fn value_names(&self) -> Vec<String> {
        self.value_infos
            .iter()
            .map(|(info, _)| info.name.clone())
            .collect()
    }

    /// Recompute the full row for every update whose changed-property set
    /// intersects the relevant properties (or is unspecified)
    pub fn update(&mut self, update_infos: &[UpdateInfo]) -> CacheUpdateResults {
        let mut results = CacheUpdateResults::default();

        for update_info in update_infos {
            if update_info.is_relevant(&self.relevant_properties) {
                let mut values_by_name = ValueDict::with_capacity(self.value_infos.len());
                for (value_info, value_fn) in &self.value_infos {
                    values_by_name.insert(
                        value_info.name.clone(),
                        value_fn(&update_info.document, &value_info.name),
                    );
                }
                results
                    .values_by_id
                    .push((update_info.internal_id, values_by_name));
            }

            self.last_revision = self.last_revision.max(update_info.revision);
            results.last_revision = Some(self.last_revision);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentFullInfo;
    use crate::value::Value;

    fn make_doc(id: &str, price: i64, revision: u32) -> DocumentFullInfo {
        let mut props = ValueDict::new();
        props.insert("price".into(), Value::I64(price));
        DocumentFullInfo {
            document_id: id.to_string(),
            document_type: "item".to_string(),
            revision,
            active: true,
            creation_time: 0.0,
            modification_time: 0.0,
            property_map: props,
            attachment_info_map: Default::default(),
        }
    }

    fn price_cache() -> Cache {
        let value_fn: Arc<ValueFn> = Arc::new(|doc, _name| {
            Value::I64(
                doc.property_map
                    .get("price")
                    .and_then(|v| v.coerce_i64().ok())
                    .unwrap_or(0),
            )
        });
        Cache::new(
            "itemValues".into(),
            "item".into(),
            vec!["price".into()],
            vec![(
                CacheValueInfo {
                    name: "price".into(),
                    kind: CacheValueKind::Integer,
                    selector_id: "integerValueForProperty".into(),
                },
                value_fn,
            )],
            0,
        )
    }

    #[test]
    fn test_update_materializes_rows() {
        let mut cache = price_cache();
        let updates = vec![
            UpdateInfo::new(make_doc("d1", 10, 1), 1, 1, None),
            UpdateInfo::new(make_doc("d2", 20, 2), 2, 2, None),
        ];
        let results = cache.update(&updates);

        assert_eq!(results.values_by_id.len(), 2);
        let (_, row) = &results.values_by_id[0];
        assert_eq!(row.get("price").unwrap(), &Value::I64(10));
        assert_eq!(results.last_revision, Some(2));
    }

    #[test]
    fn test_value_info_lookup() {
        let cache = price_cache();
        assert!(cache.has_value_info("price"));
        assert!(!cache.has_value_info("weight"));
    }
}
