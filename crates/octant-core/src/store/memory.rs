//! In-memory state store for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{BootSummary, MembraneDescriptor, RuntimeRecord, StateStore, StoreError, VertexTable};
use crate::vertex::Chirality;

#[derive(Debug, Default)]
struct Inner {
    mode: Option<Chirality>,
    vertices: Option<VertexTable>,
    membranes: BTreeMap<String, MembraneDescriptor>,
    runtime: BTreeMap<String, RuntimeRecord>,
    boot: Option<BootSummary>,
}

/// State store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking writer cannot leave a half-written value behind: every
        // mutation is a single insert or remove.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StateStore for MemoryStateStore {
    fn mode(&self) -> Result<Chirality, StoreError> {
        Ok(self.lock().mode.unwrap_or_default())
    }

    fn set_mode(&self, mode: Chirality) -> Result<(), StoreError> {
        self.lock().mode = Some(mode);
        Ok(())
    }

    fn vertex_table(&self) -> Result<VertexTable, StoreError> {
        Ok(self.lock().vertices.clone().unwrap_or_default())
    }

    fn set_vertex_table(&self, table: &VertexTable) -> Result<(), StoreError> {
        self.lock().vertices = Some(table.clone());
        Ok(())
    }

    fn membrane(&self, name: &str) -> Result<Option<MembraneDescriptor>, StoreError> {
        Ok(self.lock().membranes.get(name).cloned())
    }

    fn put_membrane(&self, descriptor: &MembraneDescriptor) -> Result<(), StoreError> {
        self.lock()
            .membranes
            .insert(descriptor.name.clone(), descriptor.clone());
        Ok(())
    }

    fn remove_membrane(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.lock().membranes.remove(name).is_some())
    }

    fn membranes(&self) -> Result<Vec<MembraneDescriptor>, StoreError> {
        Ok(self.lock().membranes.values().cloned().collect())
    }

    fn runtime(&self, name: &str) -> Result<Option<RuntimeRecord>, StoreError> {
        Ok(self.lock().runtime.get(name).cloned())
    }

    fn put_runtime(&self, record: &RuntimeRecord) -> Result<(), StoreError> {
        self.lock()
            .runtime
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn remove_runtime(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.lock().runtime.remove(name).is_some())
    }

    fn runtimes(&self) -> Result<Vec<RuntimeRecord>, StoreError> {
        Ok(self.lock().runtime.values().cloned().collect())
    }

    fn boot_summary(&self) -> Result<Option<BootSummary>, StoreError> {
        Ok(self.lock().boot.clone())
    }

    fn put_boot_summary(&self, summary: &BootSummary) -> Result<(), StoreError> {
        self.lock().boot = Some(summary.clone());
        Ok(())
    }
}
