//! Selector registries
//!
//! Selectors are named handlers the caller registers at startup; derived
//! structures reference them by string id. The engine never compiles
//! selector expressions itself. Callers must not re-enter the store from
//! inside a selector on the same thread: the calling thread may hold
//! structural locks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::document::DocumentFullInfo;
use crate::error::{StorageError, StorageResult};
use crate::value::{Value, ValueDict};

/// Collection membership predicate
pub type IsIncludedFn = dyn Fn(&DocumentFullInfo, &ValueDict) -> bool + Send + Sync;

/// Index key producer: zero or more keys per document
pub type KeysFn = dyn Fn(&DocumentFullInfo, &ValueDict) -> Vec<String> + Send + Sync;

/// Cache value producer: one value per (document, value name)
pub type ValueFn = dyn Fn(&DocumentFullInfo, &str) -> Value + Send + Sync;

/// The store's three name -> handler registries
#[derive(Default)]
pub struct SelectorRegistry {
    is_included: RwLock<HashMap<String, Arc<IsIncludedFn>>>,
    keys: RwLock<HashMap<String, Arc<KeysFn>>>,
    value: RwLock<HashMap<String, Arc<ValueFn>>>,
}

impl SelectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_is_included(
        &self,
        selector_id: impl Into<String>,
        f: impl Fn(&DocumentFullInfo, &ValueDict) -> bool + Send + Sync + 'static,
    ) {
        self.is_included
            .write()
            .unwrap()
            .insert(selector_id.into(), Arc::new(f));
    }

    pub fn register_keys(
        &self,
        selector_id: impl Into<String>,
        f: impl Fn(&DocumentFullInfo, &ValueDict) -> Vec<String> + Send + Sync + 'static,
    ) {
        self.keys
            .write()
            .unwrap()
            .insert(selector_id.into(), Arc::new(f));
    }

    pub fn register_value(
        &self,
        selector_id: impl Into<String>,
        f: impl Fn(&DocumentFullInfo, &str) -> Value + Send + Sync + 'static,
    ) {
        self.value
            .write()
            .unwrap()
            .insert(selector_id.into(), Arc::new(f));
    }

    pub fn is_included(&self, selector_id: &str) -> StorageResult<Arc<IsIncludedFn>> {
        self.is_included
            .read()
            .unwrap()
            .get(selector_id)
            .cloned()
            .ok_or_else(|| StorageError::UnknownSelector(selector_id.to_string()))
    }

    pub fn keys(&self, selector_id: &str) -> StorageResult<Arc<KeysFn>> {
        self.keys
            .read()
            .unwrap()
            .get(selector_id)
            .cloned()
            .ok_or_else(|| StorageError::UnknownSelector(selector_id.to_string()))
    }

    pub fn value(&self, selector_id: &str) -> StorageResult<Arc<ValueFn>> {
        self.value
            .read()
            .unwrap()
            .get(selector_id)
            .cloned()
            .ok_or_else(|| StorageError::UnknownSelector(selector_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_selector_fails() {
        let registry = SelectorRegistry::new();
        let result = registry.is_included("nope");
        assert!(matches!(result, Err(StorageError::UnknownSelector(_))));
    }

    #[test]
    fn test_lookup_after_register() {
        let registry = SelectorRegistry::new();
        registry.register_keys("byName", |doc, _info| {
            doc.property_map
                .get("name")
                .and_then(|v| v.as_str().ok())
                .map(|s| vec![s.to_string()])
                .unwrap_or_default()
        });
        assert!(registry.keys("byName").is_ok());
    }
}
