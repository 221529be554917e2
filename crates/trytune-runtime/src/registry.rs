use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::{ModuleDescriptor, PipelineGraph, RegistrationError};

/// Process-wide keyed store. Readers get `Arc` snapshots, so clearing the
/// registry never disturbs a run that already holds its entries.
pub struct Registry<T> {
    kind: &'static str,
    entries: DashMap<String, Arc<T>>,
}

pub type ModuleRegistry = Registry<ModuleDescriptor>;
pub type PipelineRegistry = Registry<PipelineGraph>;

impl<T> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn insert(&self, name: &str, value: T) -> Result<Arc<T>, RegistrationError> {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistrationError::AlreadyExists {
                kind: self.kind,
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                let value = Arc::new(value);
                slot.insert(Arc::clone(&value));
                info!(kind = self.kind, name, "registered");
                Ok(value)
            }
        }
    }

    /// Entries sorted by name.
    pub fn list(&self) -> Vec<(String, Arc<T>)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry. Idempotent; returns how many were removed.
    pub fn clear(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        info!(kind = self.kind, removed, "registry cleared");
        removed
    }
}
