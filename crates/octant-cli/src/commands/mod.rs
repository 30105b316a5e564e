//! `octantctl` command groups.
//!
//! Commands operate directly on the node's persisted runtime state; there is
//! no daemon round trip. Each command returns its exit code.
//!
//! # Exit Codes
//!
//! - 0: Success (possibly with degraded-isolation warnings)
//! - 1: Error
//! - 2: Referenced service, vertex or descriptor not found
//! - 3: Membrane busy

pub mod chirality;
pub mod membrane;
pub mod vertex;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use octant_core::cgroup::CgroupTree;
use octant_core::config::ConfigStore;
use octant_core::store::{FsStateStore, StateStore};
use octant_core::{ChiralityController, MembraneController, OctantError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Exit codes for all commands.
pub mod exit_codes {
    /// Success exit code.
    pub const SUCCESS: u8 = 0;
    /// General error exit code.
    pub const ERROR: u8 = 1;
    /// Not found exit code.
    pub const NOT_FOUND: u8 = 2;
    /// Busy membrane exit code.
    pub const BUSY: u8 = 3;
}

/// Everything a command needs.
#[derive(Debug)]
pub struct Context {
    /// Node configuration.
    pub config: Arc<ConfigStore>,
    /// Membrane controller over the node's state directory.
    pub membranes: Arc<MembraneController>,
    /// Machine-readable output.
    pub json: bool,
}

impl Context {
    /// Loads configuration and opens the state directory it names.
    pub fn open(config_path: &Path, json: bool) -> Result<Self> {
        let config = ConfigStore::load(config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?;
        let paths = &config.config().paths;
        let store = FsStateStore::open(&paths.state_dir).with_context(|| {
            format!("failed to open state directory {}", paths.state_dir.display())
        })?;
        debug!(
            config = %config_path.display(),
            state_dir = %paths.state_dir.display(),
            "state directory opened"
        );
        let membranes = MembraneController::new(
            Arc::new(store) as Arc<dyn StateStore>,
            CgroupTree::with_root(&paths.cgroup_root),
        );
        Ok(Self {
            config: Arc::new(config),
            membranes: Arc::new(membranes),
            json,
        })
    }

    /// Chirality controller sharing this context's state.
    #[must_use]
    pub fn chirality(&self) -> ChiralityController {
        ChiralityController::new(Arc::clone(&self.membranes), Arc::clone(&self.config))
    }
}

/// Error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

/// JSON envelope for mutating commands.
#[derive(Debug, Serialize)]
pub struct MutationResponse<'a, T: Serialize> {
    /// What the command did.
    pub result: &'a T,
    /// Degraded-isolation warnings.
    pub warnings: Vec<String>,
}

/// Exit code for an error.
#[must_use]
pub const fn exit_code_for(error: &OctantError) -> u8 {
    match error {
        OctantError::NotFound { .. } => exit_codes::NOT_FOUND,
        OctantError::Busy { .. } => exit_codes::BUSY,
        _ => exit_codes::ERROR,
    }
}

/// Prints `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Prints a mutation result in JSON form, warnings included.
pub fn print_mutation<T: Serialize>(result: &T, warnings: &[OctantError]) {
    print_json(&MutationResponse {
        result,
        warnings: warnings.iter().map(ToString::to_string).collect(),
    });
}

/// Prints degraded-isolation warnings for text output.
pub fn print_warnings(warnings: &[OctantError]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

/// Reports `error` and returns its exit code.
pub fn output_error(json_output: bool, error: &OctantError) -> u8 {
    if json_output {
        let response = ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        };
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&response).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        eprintln!("Error: {error}");
    }
    exit_code_for(error)
}

/// `-` for absent values in text tables.
fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
