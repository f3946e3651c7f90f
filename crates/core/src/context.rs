//! Immutable context variables threaded through a run.
//!
//! Every write returns a new `ContextVariables`; holders of an older snapshot never observe it.
//! Snapshots share their entries behind an `Arc`, so cloning one into a guardrail or tool task is
//! a reference-count bump.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

type Initializer = Box<dyn Fn() -> Value + Send + Sync>;

/// A value computed on first read and memoized for every snapshot holding the entry.
pub struct Deferred {
    cell: OnceLock<Value>,
    init: Initializer,
}

impl Deferred {
    fn new<F>(init: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self { cell: OnceLock::new(), init: Box::new(init) }
    }

    fn force(&self) -> &Value {
        self.cell.get_or_init(|| (self.init)())
    }

    fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[derive(Clone)]
pub enum ContextValue {
    Ready(Arc<Value>),
    Deferred(Arc<Deferred>),
}

impl ContextValue {
    pub fn resolve(&self) -> &Value {
        match self {
            Self::Ready(value) => value,
            Self::Deferred(deferred) => deferred.force(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            Self::Ready(_) => true,
            Self::Deferred(deferred) => deferred.is_resolved(),
        }
    }
}

impl fmt::Debug for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => write!(f, "{value}"),
            Self::Deferred(deferred) => match deferred.cell.get() {
                Some(value) => write!(f, "{value}"),
                None => f.write_str("<deferred>"),
            },
        }
    }
}

#[derive(Clone, Default)]
pub struct ContextVariables {
    entries: Arc<BTreeMap<String, ContextValue>>,
}

impl ContextVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_entry(key.into(), ContextValue::Ready(Arc::new(value.into())))
    }

    /// Stores `init` without running it; the first `get` of `key` computes and caches the value.
    pub fn set_lazy<F>(&self, key: impl Into<String>, init: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.with_entry(key.into(), ContextValue::Deferred(Arc::new(Deferred::new(init))))
    }

    pub fn remove(&self, key: &str) -> Self {
        if !self.entries.contains_key(key) {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.remove(key);
        Self { entries: Arc::new(entries) }
    }

    /// Entries of `other` win on key collisions.
    pub fn merge(&self, other: &ContextVariables) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        for (key, value) in other.entries.iter() {
            entries.insert(key.clone(), value.clone());
        }
        Self { entries: Arc::new(entries) }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(ContextValue::resolve)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// `None` when the key is absent; never forces a deferred value.
    pub fn is_resolved(&self, key: &str) -> Option<bool> {
        self.entries.get(key).map(ContextValue::is_resolved)
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

    /// Resolves every entry, including deferred ones, into a JSON object.
    pub fn to_json(&self) -> Value {
        let object = self
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), value.resolve().clone()))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(object)
    }

    fn with_entry(&self, key: String, value: ContextValue) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key, value);
        Self { entries: Arc::new(entries) }
    }
}

impl fmt::Debug for ContextVariables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for ContextVariables
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(key, value)| (key.into(), ContextValue::Ready(Arc::new(value.into()))))
            .collect::<BTreeMap<_, _>>();
        Self { entries: Arc::new(entries) }
    }
}
