//! Persisted runtime state.
//!
//! Everything here lives for the life of the booted system only: the state
//! directory is a tmpfs that is reset on reboot. Components never touch the
//! files directly; they go through [`StateStore`] so tests can substitute
//! [`MemoryStateStore`].
//!
//! # Layout of [`FsStateStore`]
//!
//! ```text
//! <state_dir>/
//!   chirality              "production" | "development"
//!   vertices.json          vertex id -> active | pending | inactive
//!   membranes/<name>.json  membrane descriptors
//!   runtime/<name>.json    runtime records
//!   boot.json              boot summary
//! ```

mod fs;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fs::FsStateStore;
pub use memory::MemoryStateStore;

use crate::vertex::{Chirality, ResourceEnvelope, Vertex};

/// State store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A state file could not be read or written.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A state file holds malformed JSON.
    #[error("corrupt state file {}: {source}", path.display())]
    Corrupt {
        /// File path.
        path: PathBuf,
        /// Decode error.
        #[source]
        source: serde_json::Error,
    },

    /// A state value could not be encoded.
    #[error("failed to encode {what}: {source}")]
    Encode {
        /// What was being encoded.
        what: String,
        /// Encode error.
        #[source]
        source: serde_json::Error,
    },

    /// The persisted mode bit is neither production nor development.
    #[error("invalid persisted mode '{0}'")]
    InvalidMode(String),
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Activation state of one vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VertexState {
    /// Services on this vertex run.
    Active,
    /// Will become active later in boot.
    Pending,
    /// Services on this vertex do not run.
    #[default]
    Inactive,
}

impl VertexState {
    /// Lowercase name as persisted and printed.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for VertexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-vertex state table.
///
/// Vertices without an entry read as [`VertexState::Inactive`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VertexTable(BTreeMap<Vertex, VertexState>);

impl VertexTable {
    /// The table written at boot for `mode`.
    ///
    /// Kernel production vertices start active; user production vertices
    /// start pending; development vertices start pending in development mode
    /// and inactive otherwise.
    #[must_use]
    pub fn initial(mode: Chirality) -> Self {
        let mut table = Self::default();
        for vertex in Vertex::ALL {
            let state = match (vertex.polarity(), vertex.is_user()) {
                (Chirality::Production, false) => VertexState::Active,
                (Chirality::Production, true) => VertexState::Pending,
                (Chirality::Development, _) => match mode {
                    Chirality::Development => VertexState::Pending,
                    Chirality::Production => VertexState::Inactive,
                },
            };
            table.set(vertex, state);
        }
        table
    }

    /// State of `vertex`.
    #[must_use]
    pub fn get(&self, vertex: Vertex) -> VertexState {
        self.0.get(&vertex).copied().unwrap_or_default()
    }

    /// Sets the state of `vertex`, returning the previous state.
    pub fn set(&mut self, vertex: Vertex, state: VertexState) -> VertexState {
        self.0.insert(vertex, state).unwrap_or_default()
    }

    /// All eight rows in id order.
    pub fn rows(&self) -> impl Iterator<Item = (Vertex, VertexState)> + '_ {
        Vertex::ALL.into_iter().map(|v| (v, self.get(v)))
    }
}

/// Lifecycle state of a membrane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembraneState {
    /// Limits are the created values.
    #[default]
    Created,
    /// At least one limit is widened; a snapshot holds the original.
    Stretched,
    /// A process was launched into the membrane without full isolation.
    Ruptured,
    /// The membrane was removed.
    Destroyed,
}

impl fmt::Display for MembraneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Stretched => "stretched",
            Self::Ruptured => "ruptured",
            Self::Destroyed => "destroyed",
        })
    }
}

/// Limit values as they stood before the first unreleased stretch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StretchSnapshot {
    /// Hard memory limit before stretching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_hard: Option<u64>,
    /// CPU weight before stretching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_weight: Option<u32>,
}

impl StretchSnapshot {
    /// `true` if nothing is recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.memory_hard.is_none() && self.cpu_weight.is_none()
    }
}

/// The persisted boundary of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembraneDescriptor {
    /// Service name (unique key).
    pub name: String,
    /// Assigned vertex; always one with an isolation tier.
    pub vertex: Vertex,
    /// Isolation tier (cgroup slice) name.
    pub tier: String,
    /// Soft memory limit in bytes.
    pub memory_soft: u64,
    /// Hard memory limit in bytes.
    pub memory_hard: u64,
    /// CPU weight.
    pub cpu_weight: u32,
    /// Task limit.
    pub pids_max: u32,
    /// Granted capabilities.
    pub capabilities: Vec<String>,
    /// Lifecycle state.
    pub state: MembraneState,
    /// Pre-stretch values.
    #[serde(default)]
    pub snapshot: StretchSnapshot,
    /// When the descriptor was first created.
    pub created_at: DateTime<Utc>,
}

impl MembraneDescriptor {
    /// The current limits as one envelope.
    #[must_use]
    pub const fn envelope(&self) -> ResourceEnvelope {
        ResourceEnvelope {
            memory_soft: self.memory_soft,
            memory_hard: self.memory_hard,
            cpu_weight: self.cpu_weight,
            pids_max: self.pids_max,
        }
    }
}

/// A launched service process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    /// Service name.
    pub name: String,
    /// Vertex the service was launched under.
    pub vertex: Vertex,
    /// OS process ID.
    pub pid: u32,
    /// Kernel start time of `pid`, guarding against PID reuse.
    #[serde(default)]
    pub start_time: Option<u64>,
    /// When the process was launched.
    pub launched_at: DateTime<Utc>,
}

/// Written once boot reaches the steady state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSummary {
    /// Init version.
    pub version: String,
    /// Mode at boot.
    pub mode: Chirality,
    /// Phase 1 start.
    pub started_at: DateTime<Utc>,
    /// Phase 5 completion.
    pub completed_at: DateTime<Utc>,
    /// Boot duration.
    pub duration_ms: u64,
    /// Services launched during boot.
    pub services_launched: Vec<String>,
    /// Non-fatal problems met during boot.
    pub warnings: Vec<String>,
}

/// Access to persisted runtime state.
///
/// Implementations are shared between the boot sequencer, the supervision
/// task and the controllers, so every method takes `&self`.
pub trait StateStore: Send + Sync {
    /// Prepares backing storage. Called once the state directory's
    /// filesystem is mounted.
    fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// The persisted mode bit; production if never written.
    fn mode(&self) -> Result<Chirality, StoreError>;

    /// Persists the mode bit.
    fn set_mode(&self, mode: Chirality) -> Result<(), StoreError>;

    /// The per-vertex state table; every vertex inactive if never written.
    fn vertex_table(&self) -> Result<VertexTable, StoreError>;

    /// Replaces the per-vertex state table.
    fn set_vertex_table(&self, table: &VertexTable) -> Result<(), StoreError>;

    /// The descriptor for `name`.
    fn membrane(&self, name: &str) -> Result<Option<MembraneDescriptor>, StoreError>;

    /// Inserts or replaces a descriptor.
    fn put_membrane(&self, descriptor: &MembraneDescriptor) -> Result<(), StoreError>;

    /// Removes a descriptor. Returns `false` if none existed.
    fn remove_membrane(&self, name: &str) -> Result<bool, StoreError>;

    /// All descriptors, sorted by name.
    fn membranes(&self) -> Result<Vec<MembraneDescriptor>, StoreError>;

    /// The runtime record for `name`.
    fn runtime(&self, name: &str) -> Result<Option<RuntimeRecord>, StoreError>;

    /// Inserts or replaces a runtime record.
    fn put_runtime(&self, record: &RuntimeRecord) -> Result<(), StoreError>;

    /// Removes a runtime record. Returns `false` if none existed.
    fn remove_runtime(&self, name: &str) -> Result<bool, StoreError>;

    /// All runtime records, sorted by name.
    fn runtimes(&self) -> Result<Vec<RuntimeRecord>, StoreError>;

    /// The boot summary, once written.
    fn boot_summary(&self) -> Result<Option<BootSummary>, StoreError>;

    /// Persists the boot summary.
    fn put_boot_summary(&self, summary: &BootSummary) -> Result<(), StoreError>;

    /// Sets one vertex's state, returning the previous state.
    fn set_vertex_state(
        &self,
        vertex: Vertex,
        state: VertexState,
    ) -> Result<VertexState, StoreError> {
        let mut table = self.vertex_table()?;
        let previous = table.set(vertex, state);
        self.set_vertex_table(&table)?;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_table_in_production() {
        let table = VertexTable::initial(Chirality::Production);
        assert_eq!(table.get(Vertex::V000), VertexState::Active);
        assert_eq!(table.get(Vertex::V010), VertexState::Active);
        assert_eq!(table.get(Vertex::V100), VertexState::Pending);
        assert_eq!(table.get(Vertex::V110), VertexState::Pending);
        for v in Vertex::of_polarity(Chirality::Development) {
            assert_eq!(table.get(v), VertexState::Inactive);
        }
    }

    #[test]
    fn initial_table_in_development() {
        let table = VertexTable::initial(Chirality::Development);
        for v in Vertex::of_polarity(Chirality::Development) {
            assert_eq!(table.get(v), VertexState::Pending);
        }
    }

    #[test]
    fn empty_table_reads_inactive() {
        let table = VertexTable::default();
        assert!(table.rows().all(|(_, s)| s == VertexState::Inactive));
        assert_eq!(table.rows().count(), 8);
    }

    #[test]
    fn table_serializes_as_id_map() {
        let mut table = VertexTable::default();
        table.set(Vertex::V101, VertexState::Active);
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"V101":"active"}"#);
        let back: VertexTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn empty_snapshot_is_omitted() {
        let snapshot = StretchSnapshot::default();
        assert!(snapshot.is_empty());
        assert_eq!(serde_json::to_string(&snapshot).unwrap(), "{}");
    }
}
