use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use reconverge_core::error::{ConvergeError, Result};
use reconverge_core::traits::{Router, Step};

/// Name-keyed registry of shared implementations.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    entries: BTreeMap<String, Arc<T>>,
}

/// Step-type name -> step implementation.
pub type StepRegistry = Registry<dyn Step>;
/// Routing-function name -> router.
pub type RoutingRegistry = Registry<dyn Router>;

impl<T: ?Sized> Registry<T> {
    /// Empty registry. `kind` names the entries in errors and logs.
    pub fn with_kind(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Register a shared entry. Re-registering a name replaces the old entry.
    pub fn insert(&mut self, name: impl Into<String>, entry: Arc<T>) {
        let name = name.into();
        if self.entries.insert(name.clone(), entry).is_some() {
            warn!(kind = self.kind, name = %name, "Overwriting existing registration");
        } else {
            debug!(kind = self.kind, name = %name, "Registered");
        }
    }

    /// Get an entry by name.
    pub fn get(&self, name: &str) -> Result<Arc<T>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| ConvergeError::NotFound {
                kind: self.kind,
                name: name.to_string(),
                available: self.available(),
            })
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Comma-separated sorted names, for error messages.
    pub fn available(&self) -> String {
        if self.entries.is_empty() {
            "(none)".to_string()
        } else {
            self.list().join(", ")
        }
    }
}

impl Registry<dyn Step> {
    pub fn new() -> Self {
        Self::with_kind("step type")
    }

    /// Register a step implementation under a type name.
    pub fn register(&mut self, name: impl Into<String>, step: impl Step) {
        self.insert(name, Arc::new(step));
    }
}

impl Default for Registry<dyn Step> {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry<dyn Router> {
    pub fn new() -> Self {
        Self::with_kind("routing function")
    }

    /// Register a routing function.
    pub fn register(&mut self, name: impl Into<String>, router: impl Router) {
        self.insert(name, Arc::new(router));
    }
}

impl Default for Registry<dyn Router> {
    fn default() -> Self {
        Self::new()
    }
}
