//! Call context threaded through a pipeline invocation
//!
//! A [`Context`] is an immutable key-value map. Middleware never mutate it;
//! they hand a [`ContextOverride`] to `next` and downstream stages see a new
//! context with the override shallow-merged in. Upstream stages keep the
//! context they were given.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type ContextValue = Arc<dyn Any + Send + Sync>;

/// Context wrapper providing access to call-scoped state
///
/// The context is cloned for each stage, so values are stored behind `Arc`.
#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<HashMap<String, ContextValue>>,
}

impl Context {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a context with one more entry.
    #[must_use = "This method returns a new Context and does not modify self"]
    pub fn with<T: Any + Send + Sync>(self, key: impl Into<String>, value: T) -> Self {
        self.merge(ContextOverride::new().with(key, value))
    }

    /// Get a typed value by key
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.entries.get(key)?.downcast_ref::<T>()
    }

    /// Get the shared handle for a typed value
    pub fn get_arc<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries.get(key)?.clone().downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shallow-merge an override into a new context. Keys from the override win.
    pub fn merge(&self, overrides: ContextOverride) -> Self {
        if overrides.entries.is_empty() {
            return self.clone();
        }
        let mut entries: HashMap<String, ContextValue> = (*self.entries).clone();
        entries.extend(overrides.entries);
        Self {
            entries: Arc::new(entries),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("Context").field("keys", &keys).finish()
    }
}

/// Partial context contributed by one middleware.
#[derive(Clone, Default)]
pub struct ContextOverride {
    entries: HashMap<String, ContextValue>,
}

impl ContextOverride {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "This method returns a new ContextOverride and does not modify self"]
    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Arc::new(value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ContextOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&String> = self.entries.keys().collect();
        f.debug_struct("ContextOverride").field("keys", &keys).finish()
    }
}
