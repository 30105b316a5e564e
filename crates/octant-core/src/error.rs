//! Error taxonomy shared by the membrane and chirality controllers.
//!
//! `NotFound`, `Busy` and `DegradedIsolation` are recoverable and reported to
//! the caller. `InvalidVertex` and `UnsupportedVertex` are caller errors.
//! `Fatal` is reserved for boot phases that cannot proceed at all.

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::vertex::Vertex;

/// Result type for octant operations.
pub type Result<T> = std::result::Result<T, OctantError>;

/// Errors surfaced by octant operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OctantError {
    /// A referenced service, vertex or descriptor does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// What kind of object was looked up.
        kind: &'static str,
        /// The name that was looked up.
        name: String,
    },

    /// The vertex identifier is not one of the eight defined ids.
    #[error("invalid vertex '{0}' (expected V000..V111)")]
    InvalidVertex(String),

    /// The operation needs an enforceable boundary and the vertex has none.
    #[error("vertex {0} has no isolation tier; membranes are not supported there")]
    UnsupportedVertex(Vertex),

    /// The membrane grouping still contains live processes.
    #[error("membrane '{name}' is busy: {} live process(es)", pids.len())]
    Busy {
        /// Service name.
        name: String,
        /// PIDs still inside the grouping.
        pids: Vec<u32>,
    },

    /// Isolation or enforcement is unavailable; the operation proceeded with
    /// reduced guarantees.
    #[error("degraded isolation: {reason}")]
    DegradedIsolation {
        /// What could not be enforced.
        reason: String,
    },

    /// A boot phase cannot proceed.
    #[error("fatal: phase {phase}: {reason}")]
    Fatal {
        /// Phase number (1-5).
        phase: u8,
        /// What failed.
        reason: String,
    },

    /// The service name is not usable as a cgroup or state file name.
    #[error("invalid service name: {reason}")]
    InvalidName {
        /// Why the name was rejected.
        reason: String,
    },

    /// Launching a process failed outright.
    #[error("failed to launch '{name}': {reason}")]
    LaunchFailed {
        /// Service name.
        name: String,
        /// Underlying failure.
        reason: String,
    },

    /// Persisted state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OctantError {
    /// Shorthand for a missing membrane descriptor.
    pub fn membrane_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "membrane",
            name: name.into(),
        }
    }

    /// Shorthand for a missing service declaration.
    pub fn service_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "service",
            name: name.into(),
        }
    }

    /// Stable snake-case code for machine-readable output.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidVertex(_) => "invalid_vertex",
            Self::UnsupportedVertex(_) => "unsupported_vertex",
            Self::Busy { .. } => "busy",
            Self::DegradedIsolation { .. } => "degraded_isolation",
            Self::Fatal { .. } => "fatal",
            Self::InvalidName { .. } => "invalid_name",
            Self::LaunchFailed { .. } => "launch_failed",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
        }
    }

    /// Returns `true` if the caller may retry or continue.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Busy { .. } | Self::DegradedIsolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_reports_process_count() {
        let err = OctantError::Busy {
            name: "dns".to_string(),
            pids: vec![10, 11],
        };
        assert_eq!(err.to_string(), "membrane 'dns' is busy: 2 live process(es)");
        assert!(err.is_recoverable());
    }

    #[test]
    fn unsupported_vertex_is_caller_error() {
        let err = OctantError::UnsupportedVertex(Vertex::V000);
        assert!(err.to_string().contains("V000"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn not_found_names_the_kind() {
        let err = OctantError::membrane_not_found("web");
        assert_eq!(err.to_string(), "membrane not found: web");
        assert_eq!(err.code(), "not_found");
    }
}
