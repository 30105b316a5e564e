//! cgroup v2 tree backing membranes.
//!
//! # Layout
//!
//! ```text
//! /sys/fs/cgroup/octant.slice/
//! +-- photon.slice/              # one grouping per isolation tier
//! |   +-- dns.membrane/          # one grouping per service
//! |       +-- memory.low         # soft limit
//! |       +-- memory.max         # hard limit
//! |       +-- cpu.weight
//! |       +-- pids.max
//! |       +-- cgroup.procs
//! +-- baryon.slice/
//! ...
//! ```
//!
//! # File formats read
//!
//! - `memory.current`: `<bytes>\n`
//! - `pids.current`: `<count>\n`
//! - `cpu.stat`: `usage_usec <value>\nuser_usec <value>\n...`
//! - `cgroup.procs`: one PID per line
//!
//! Every limit write reports an [`Enforcement`]: either the kernel accepted
//! the value or it was only recorded. Callers surface the latter as degraded
//! isolation rather than failing.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::validate_service_name;
use crate::vertex::ResourceEnvelope;

/// Default cgroup v2 mount point.
pub const CGROUP_V2_MOUNT: &str = "/sys/fs/cgroup";

/// Top-level grouping for everything octant launches.
pub const OCTANT_SLICE: &str = "octant.slice";

/// Controllers enabled on every octant grouping.
pub const CONTROLLERS: &str = "+cpu +memory +pids";

/// Maximum size for cgroup file reads (64 KiB).
pub const MAX_CGROUP_FILE_SIZE: u64 = 64 * 1024;

/// cgroup errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CgroupError {
    /// cgroup v2 is not mounted at the configured root.
    #[error("cgroups v2 not available: {reason}")]
    NotAvailable {
        /// Why it is considered unavailable.
        reason: String,
    },

    /// Failed to read a cgroup file.
    #[error("failed to read cgroup file '{file}': {source}")]
    ReadFailed {
        /// The file that failed to read.
        file: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse cgroup file content.
    #[error("failed to parse cgroup file '{file}': {reason}")]
    ParseFailed {
        /// The file that failed to parse.
        file: String,
        /// Reason for parse failure.
        reason: String,
    },

    /// The service name is unusable as a grouping name.
    #[error("invalid membrane name for cgroup: {reason}")]
    InvalidName {
        /// Reason for rejection.
        reason: String,
    },

    /// Failed to create a grouping.
    #[error("failed to create cgroup '{path}': {source}")]
    CreateFailed {
        /// Grouping path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The grouping still has member processes.
    #[error("cgroup '{path}' still contains {} process(es)", pids.len())]
    Populated {
        /// Grouping path.
        path: String,
        /// Member PIDs.
        pids: Vec<u32>,
    },

    /// Failed to remove a grouping.
    #[error("failed to remove cgroup '{path}': {source}")]
    RemoveFailed {
        /// Grouping path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for cgroup operations.
pub type CgroupResult<T> = Result<T, CgroupError>;

/// Outcome of pushing limit values to the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "enforcement", rename_all = "lowercase")]
pub enum Enforcement {
    /// Every value was written.
    Applied,
    /// The values are recorded but not (fully) enforced.
    Recorded {
        /// What could not be written.
        reason: String,
    },
}

impl Enforcement {
    /// `true` for [`Enforcement::Applied`].
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    /// The degradation reason, if any.
    #[must_use]
    pub fn degraded_reason(&self) -> Option<&str> {
        match self {
            Self::Applied => None,
            Self::Recorded { reason } => Some(reason),
        }
    }
}

/// Live usage of one grouping.
///
/// Individual counters are `None` when the controller file is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// `memory.current` in bytes.
    pub memory_current: Option<u64>,
    /// `cpu.stat` `usage_usec`.
    pub cpu_usage_usec: Option<u64>,
    /// `pids.current`.
    pub pids_current: Option<u64>,
    /// Member PIDs from `cgroup.procs`.
    pub pids: Vec<u32>,
}

/// The octant part of a cgroup v2 hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupTree {
    root: PathBuf,
}

impl Default for CgroupTree {
    fn default() -> Self {
        Self::with_root(CGROUP_V2_MOUNT)
    }
}

impl CgroupTree {
    /// A tree rooted at a custom mount point (tests use a temp directory).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cgroup v2 mount point.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns `true` if a unified hierarchy is mounted at the root.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.root.join("cgroup.controllers").exists()
    }

    /// `<root>/octant.slice`.
    #[must_use]
    pub fn slice_path(&self) -> PathBuf {
        self.root.join(OCTANT_SLICE)
    }

    /// `<root>/octant.slice/<tier>.slice`.
    #[must_use]
    pub fn tier_path(&self, tier: &str) -> PathBuf {
        self.slice_path().join(format!("{tier}.slice"))
    }

    /// `<root>/octant.slice/<tier>.slice/<name>.membrane`.
    pub fn membrane_path(&self, tier: &str, name: &str) -> CgroupResult<PathBuf> {
        validate_service_name(name).map_err(|reason| CgroupError::InvalidName { reason })?;
        Ok(self.tier_path(tier).join(format!("{name}.membrane")))
    }

    /// Creates the top-level slice and the grouping for `tier`.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NotAvailable` if no unified hierarchy is mounted
    /// and `CgroupError::CreateFailed` if a directory cannot be created.
    pub fn ensure_tier(&self, tier: &str) -> CgroupResult<PathBuf> {
        self.require_available()?;
        enable_controllers(&self.root);

        let slice = self.slice_path();
        create_grouping(&slice)?;
        enable_controllers(&slice);

        let tier_path = self.tier_path(tier);
        create_grouping(&tier_path)?;
        enable_controllers(&tier_path);
        Ok(tier_path)
    }

    /// Creates the grouping for one service (and its tier if needed).
    pub fn ensure_membrane(&self, tier: &str, name: &str) -> CgroupResult<PathBuf> {
        let path = self.membrane_path(tier, name)?;
        self.ensure_tier(tier)?;
        create_grouping(&path)?;
        Ok(path)
    }

    /// Writes `envelope` to the grouping at `path`.
    ///
    /// All four values are attempted; the first failures are collected into
    /// the [`Enforcement::Recorded`] reason.
    pub fn apply_limits(&self, path: &Path, envelope: &ResourceEnvelope) -> Enforcement {
        let writes = [
            ("memory.low", envelope.memory_soft.to_string()),
            ("memory.max", envelope.memory_hard.to_string()),
            ("cpu.weight", envelope.cpu_weight.to_string()),
            ("pids.max", envelope.pids_max.to_string()),
        ];

        let mut failures = Vec::new();
        for (file, value) in writes {
            let target = path.join(file);
            if let Err(e) = fs::write(&target, format!("{value}\n")) {
                debug!(path = %target.display(), error = %e, "cgroup limit write failed");
                failures.push(format!("{file}: {e}"));
            }
        }

        if failures.is_empty() {
            Enforcement::Applied
        } else {
            Enforcement::Recorded {
                reason: failures.join("; "),
            }
        }
    }

    /// Member PIDs of the grouping at `path`.
    pub fn members(&self, path: &Path) -> CgroupResult<Vec<u32>> {
        let file = path.join("cgroup.procs");
        let content = read_cgroup_file(&file)?;
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| parse_number(line, "cgroup.procs", "pid"))
            .collect()
    }

    /// Reads the live usage of the grouping at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::ReadFailed` if the grouping does not exist.
    pub fn read_usage(&self, path: &Path) -> CgroupResult<Usage> {
        let pids = self.members(path)?;
        Ok(Usage {
            memory_current: read_optional_u64(&path.join("memory.current"), "memory.current")?,
            cpu_usage_usec: read_cpu_usage(&path.join("cpu.stat"))?,
            pids_current: read_optional_u64(&path.join("pids.current"), "pids.current")?,
            pids,
        })
    }

    /// Removes a service grouping.
    ///
    /// Returns `false` if the grouping did not exist.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::Populated` if processes remain in it.
    pub fn remove_membrane(&self, tier: &str, name: &str) -> CgroupResult<bool> {
        let path = self.membrane_path(tier, name)?;
        if !path.exists() {
            return Ok(false);
        }

        let pids = match self.members(&path) {
            Ok(pids) => pids,
            Err(CgroupError::ReadFailed { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Vec::new()
            },
            Err(e) => return Err(e),
        };
        if !pids.is_empty() {
            return Err(CgroupError::Populated {
                path: path.display().to_string(),
                pids,
            });
        }

        // Real cgroupfs directories only hold interface files and go with
        // rmdir; plain directories (tests, stale trees) need their files
        // removed first.
        let result = match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(_) if !self.is_cgroupfs(&path) => fs::remove_dir_all(&path),
            Err(e) => Err(e),
        };
        result.map_err(|source| CgroupError::RemoveFailed {
            path: path.display().to_string(),
            source,
        })?;
        Ok(true)
    }

    fn require_available(&self) -> CgroupResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CgroupError::NotAvailable {
                reason: format!("no cgroup.controllers under {}", self.root.display()),
            })
        }
    }

    fn is_cgroupfs(&self, path: &Path) -> bool {
        nix::sys::statfs::statfs(path)
            .map(|fs| fs.filesystem_type() == nix::sys::statfs::CGROUP2_SUPER_MAGIC)
            .unwrap_or(false)
    }
}

fn create_grouping(path: &Path) -> CgroupResult<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(CgroupError::CreateFailed {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Enables the octant controllers for the children of `path`.
///
/// Failure is logged only: a controller missing from the kernel leaves the
/// matching limit unenforced, which `apply_limits` reports.
fn enable_controllers(path: &Path) {
    let subtree_control = path.join("cgroup.subtree_control");
    if let Err(e) = fs::write(&subtree_control, CONTROLLERS) {
        debug!(path = %subtree_control.display(), error = %e, "enabling controllers failed");
    }
}

/// Reads a cgroup file as a string with bounded size.
fn read_cgroup_file(path: &Path) -> CgroupResult<String> {
    let file = File::open(path).map_err(|e| CgroupError::ReadFailed {
        file: path.display().to_string(),
        source: e,
    })?;

    let mut reader = BufReader::new(file).take(MAX_CGROUP_FILE_SIZE);
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .map_err(|e| CgroupError::ReadFailed {
            file: path.display().to_string(),
            source: e,
        })?;
    Ok(content)
}

fn read_optional(path: &Path) -> CgroupResult<Option<String>> {
    match read_cgroup_file(path) {
        Ok(content) => Ok(Some(content)),
        Err(CgroupError::ReadFailed { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(None)
        },
        Err(e) => Err(e),
    }
}

fn read_optional_u64(path: &Path, file: &str) -> CgroupResult<Option<u64>> {
    read_optional(path)?
        .map(|content| parse_number(content.trim(), file, "value"))
        .transpose()
}

fn read_cpu_usage(path: &Path) -> CgroupResult<Option<u64>> {
    let Some(content) = read_optional(path)? else {
        return Ok(None);
    };
    parse_cpu_usage(&content).map(Some)
}

/// Extracts `usage_usec` from `cpu.stat`.
fn parse_cpu_usage(content: &str) -> CgroupResult<u64> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("usage_usec") {
            let value = parts.next().unwrap_or_default();
            return parse_number(value, "cpu.stat", "usage_usec");
        }
    }
    Err(CgroupError::ParseFailed {
        file: "cpu.stat".to_string(),
        reason: "missing usage_usec field".to_string(),
    })
}

fn parse_number<T: std::str::FromStr>(s: &str, file: &str, field: &str) -> CgroupResult<T> {
    s.parse::<T>().map_err(|_| CgroupError::ParseFailed {
        file: file.to_string(),
        reason: format!("invalid {field} value: '{s}'"),
    })
}
