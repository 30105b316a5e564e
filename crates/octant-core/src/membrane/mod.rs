//! Membrane lifecycle.
//!
//! A membrane is the boundary around one service: a cgroup grouping with
//! resource limits, the namespaces its processes are launched into, and the
//! capabilities they keep. [`MembraneController`] is the only writer of
//! membrane descriptors.
//!
//! # Lifecycle
//!
//! ```text
//!   create ──► created ──stretch──► stretched ──contract──► created
//!                 │                                            │
//!                 └──run (isolation degraded)──► ruptured      │
//!                                                              ▼
//!                                             destroy ──► (descriptor removed)
//! ```
//!
//! Mutations of one descriptor are serialized by a per-name lock inside the
//! controller. Two controllers in different processes (init and `octantctl`)
//! may race on the same name; the last writer wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use nix::sys::signal::Signal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cgroup::{CgroupError, CgroupTree, Enforcement, Usage};
use crate::config::{ServiceConfig, validate_service_name};
use crate::error::{OctantError, Result};
use crate::process::capability::capability_numbers;
use crate::process::{self, IsolationOutcome, LaunchSpec};
use crate::store::{MembraneDescriptor, MembraneState, RuntimeRecord, StateStore, StretchSnapshot};
use crate::vertex::Vertex;

/// Per-service overrides of a vertex's default envelope.
///
/// Omitted values fall back to the vertex defaults on creation and are left
/// untouched when an existing membrane is re-created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitOverrides {
    /// Soft memory limit in bytes.
    pub memory_soft: Option<u64>,
    /// Hard memory limit in bytes.
    pub memory_hard: Option<u64>,
    /// CPU weight.
    pub cpu_weight: Option<u32>,
    /// Task limit.
    pub pids_max: Option<u32>,
    /// Capability list replacing the vertex default.
    pub capabilities: Option<Vec<String>>,
}

/// Temporary widening of a running membrane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StretchRequest {
    /// New hard memory limit in bytes.
    pub memory: Option<u64>,
    /// New CPU weight.
    pub cpu: Option<u32>,
}

/// One limit that changed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitChange {
    /// Limit name (`memory_hard`, `cpu_weight`, ...).
    pub limit: &'static str,
    /// Value before.
    pub from: u64,
    /// Value after.
    pub to: u64,
}

/// Result of a mutating membrane operation.
#[derive(Debug, Clone, Serialize)]
pub struct MembraneChange {
    /// The descriptor as persisted.
    pub descriptor: MembraneDescriptor,
    /// `true` if the descriptor did not exist before.
    pub created: bool,
    /// Limits whose value changed.
    pub changes: Vec<LimitChange>,
    /// Whether the kernel accepted the limits.
    pub enforcement: Enforcement,
}

impl MembraneChange {
    /// The degraded-isolation warning to surface, if enforcement failed.
    #[must_use]
    pub fn warning(&self) -> Option<OctantError> {
        degraded(&self.enforcement)
    }
}

/// Live state of a membrane's grouping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LiveStatus {
    /// The grouping exists; usage was read from it.
    Active(Usage),
    /// No live grouping; only the descriptor is known.
    Inactive {
        /// Why no usage is available.
        reason: String,
    },
}

impl LiveStatus {
    /// `true` for [`LiveStatus::Active`].
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// Descriptor plus a best-effort usage snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    /// The persisted descriptor.
    pub descriptor: MembraneDescriptor,
    /// The runtime record, if the service was launched.
    pub runtime: Option<RuntimeRecord>,
    /// Live usage.
    pub live: LiveStatus,
}

/// Result of [`MembraneController::destroy`].
#[derive(Debug, Clone, Serialize)]
pub struct DestroyOutcome {
    /// The final descriptor, in state `destroyed`.
    pub descriptor: MembraneDescriptor,
    /// `true` if the cgroup grouping was removed.
    pub grouping_removed: bool,
    /// `true` if a runtime record was removed.
    pub runtime_removed: bool,
}

/// Result of [`MembraneController::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// The runtime record written for the new process.
    pub record: RuntimeRecord,
    /// `true` if the membrane was created by this call.
    pub created: bool,
    /// Namespace isolation achieved.
    #[serde(skip)]
    pub isolation: IsolationOutcome,
    /// Limit enforcement achieved.
    pub enforcement: Enforcement,
}

impl RunOutcome {
    /// Degraded-isolation warnings to surface.
    #[must_use]
    pub fn warnings(&self) -> Vec<OctantError> {
        let mut warnings = Vec::new();
        if let IsolationOutcome::Degraded { reason } = &self.isolation {
            warnings.push(OctantError::DegradedIsolation {
                reason: reason.clone(),
            });
        }
        warnings.extend(degraded(&self.enforcement));
        warnings
    }
}

fn degraded(enforcement: &Enforcement) -> Option<OctantError> {
    enforcement
        .degraded_reason()
        .map(|reason| OctantError::DegradedIsolation {
            reason: reason.to_string(),
        })
}

/// Rejects names that cannot be a grouping or state file name.
fn check_name(name: &str) -> Result<()> {
    validate_service_name(name).map_err(|reason| OctantError::InvalidName { reason })
}

/// Creates, mutates and destroys membranes; launches processes inside them.
pub struct MembraneController {
    store: Arc<dyn StateStore>,
    cgroups: CgroupTree,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for MembraneController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembraneController")
            .field("cgroups", &self.cgroups)
            .finish_non_exhaustive()
    }
}

impl MembraneController {
    /// A controller over `store` enforcing through `cgroups`.
    pub fn new(store: Arc<dyn StateStore>, cgroups: CgroupTree) -> Self {
        Self {
            store,
            cgroups,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// The cgroup tree.
    #[must_use]
    pub const fn cgroups(&self) -> &CgroupTree {
        &self.cgroups
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Forgets the lock for `name` unless someone still holds it.
    fn release_lock(&self, name: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(name);
        }
    }

    /// Creates a membrane, or updates the overrides of an existing one.
    ///
    /// The descriptor is persisted even when the limits cannot be enforced;
    /// the returned [`MembraneChange::enforcement`] says which happened.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVertex` if the vertex has no isolation tier
    /// - `InvalidName` if the name is unusable as a grouping name
    pub fn create(
        &self,
        name: &str,
        vertex: Vertex,
        overrides: &LimitOverrides,
    ) -> Result<MembraneChange> {
        check_name(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.create_locked(name, vertex, overrides)
    }

    fn create_locked(
        &self,
        name: &str,
        vertex: Vertex,
        overrides: &LimitOverrides,
    ) -> Result<MembraneChange> {
        let profile = vertex.profile();
        let (Some(tier), Some(envelope)) = (profile.tier, profile.envelope) else {
            return Err(OctantError::UnsupportedVertex(vertex));
        };

        let existing = self.store.membrane(name)?;
        let created = existing.is_none();
        let mut changes = Vec::new();

        let descriptor = match existing {
            Some(mut current) if current.vertex == vertex => {
                apply_override(
                    &mut changes,
                    "memory_soft",
                    &mut current.memory_soft,
                    overrides.memory_soft,
                );
                apply_override(
                    &mut changes,
                    "memory_hard",
                    &mut current.memory_hard,
                    overrides.memory_hard,
                );
                apply_override(
                    &mut changes,
                    "cpu_weight",
                    &mut current.cpu_weight,
                    overrides.cpu_weight,
                );
                apply_override(
                    &mut changes,
                    "pids_max",
                    &mut current.pids_max,
                    overrides.pids_max,
                );
                if let Some(caps) = &overrides.capabilities {
                    current.capabilities.clone_from(caps);
                }
                current
            },
            existing => {
                if let Some(previous) = &existing {
                    info!(
                        membrane = name,
                        from = %previous.vertex,
                        to = %vertex,
                        "re-creating membrane on a different vertex"
                    );
                }
                MembraneDescriptor {
                    name: name.to_string(),
                    vertex,
                    tier: tier.to_string(),
                    memory_soft: overrides.memory_soft.unwrap_or(envelope.memory_soft),
                    memory_hard: overrides.memory_hard.unwrap_or(envelope.memory_hard),
                    cpu_weight: overrides.cpu_weight.unwrap_or(envelope.cpu_weight),
                    pids_max: overrides.pids_max.unwrap_or(envelope.pids_max),
                    capabilities: overrides.capabilities.clone().unwrap_or_else(|| {
                        profile.capabilities.iter().map(|c| (*c).to_string()).collect()
                    }),
                    state: MembraneState::Created,
                    snapshot: StretchSnapshot::default(),
                    created_at: existing.map_or_else(Utc::now, |d| d.created_at),
                }
            },
        };

        self.store.put_membrane(&descriptor)?;
        let enforcement = self.enforce(&descriptor);
        info!(
            membrane = name,
            vertex = %vertex,
            tier,
            created,
            applied = enforcement.is_applied(),
            "membrane recorded"
        );
        Ok(MembraneChange {
            descriptor,
            created,
            changes,
            enforcement,
        })
    }

    /// Returns the descriptor and a best-effort live usage snapshot.
    ///
    /// The snapshot is `Inactive` unless the grouping has members or the
    /// runtime record names a live process.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no descriptor exists.
    pub fn inspect(&self, name: &str) -> Result<Inspection> {
        check_name(name)?;
        let descriptor = self.descriptor(name)?;
        let runtime = self.store.runtime(name)?;
        let running = runtime
            .as_ref()
            .is_some_and(|r| process::is_same_process(r.pid, r.start_time));
        let live = if self.cgroups.is_available() {
            match self
                .cgroups
                .membrane_path(&descriptor.tier, name)
                .and_then(|path| self.cgroups.read_usage(&path))
            {
                Ok(usage) if usage.pids.is_empty() && !running => LiveStatus::Inactive {
                    reason: "no running processes".to_string(),
                },
                Ok(usage) => LiveStatus::Active(usage),
                Err(e) => LiveStatus::Inactive {
                    reason: e.to_string(),
                },
            }
        } else {
            LiveStatus::Inactive {
                reason: format!("cgroup v2 not mounted at {}", self.cgroups.root().display()),
            }
        };
        Ok(Inspection {
            descriptor,
            runtime,
            live,
        })
    }

    /// All descriptors, sorted by name.
    pub fn list(&self) -> Result<Vec<MembraneDescriptor>> {
        Ok(self.store.membranes()?)
    }

    /// Widens the membrane's limits.
    ///
    /// The value in force before the first unreleased stretch is kept in the
    /// snapshot; later stretches do not overwrite it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no descriptor exists.
    pub fn stretch(&self, name: &str, request: StretchRequest) -> Result<MembraneChange> {
        check_name(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut descriptor = self.descriptor(name)?;
        let mut changes = Vec::new();

        if let Some(memory) = request.memory {
            descriptor.snapshot.memory_hard.get_or_insert(descriptor.memory_hard);
            apply_override(&mut changes, "memory_hard", &mut descriptor.memory_hard, Some(memory));
        }
        if let Some(cpu) = request.cpu {
            descriptor.snapshot.cpu_weight.get_or_insert(descriptor.cpu_weight);
            apply_override(&mut changes, "cpu_weight", &mut descriptor.cpu_weight, Some(cpu));
        }
        if request.memory.is_some() || request.cpu.is_some() {
            descriptor.state = MembraneState::Stretched;
        }

        self.store.put_membrane(&descriptor)?;
        let enforcement = self.enforce(&descriptor);
        info!(membrane = name, changes = changes.len(), "membrane stretched");
        Ok(MembraneChange {
            descriptor,
            created: false,
            changes,
            enforcement,
        })
    }

    /// Restores every stretched limit from the snapshot.
    ///
    /// A membrane that was never stretched is left as is.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no descriptor exists.
    pub fn contract(&self, name: &str) -> Result<MembraneChange> {
        check_name(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut descriptor = self.descriptor(name)?;

        if descriptor.snapshot.is_empty() {
            debug!(membrane = name, "contract: nothing stretched");
            return Ok(MembraneChange {
                descriptor,
                created: false,
                changes: Vec::new(),
                enforcement: Enforcement::Applied,
            });
        }

        let snapshot = std::mem::take(&mut descriptor.snapshot);
        let mut changes = Vec::new();
        apply_override(
            &mut changes,
            "memory_hard",
            &mut descriptor.memory_hard,
            snapshot.memory_hard,
        );
        apply_override(
            &mut changes,
            "cpu_weight",
            &mut descriptor.cpu_weight,
            snapshot.cpu_weight,
        );
        descriptor.state = MembraneState::Created;

        self.store.put_membrane(&descriptor)?;
        let enforcement = self.enforce(&descriptor);
        info!(membrane = name, changes = changes.len(), "membrane contracted");
        Ok(MembraneChange {
            descriptor,
            created: false,
            changes,
            enforcement,
        })
    }

    /// Removes the membrane, its grouping and its runtime record.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if the name is unusable as a grouping name
    /// - `NotFound` if no descriptor exists
    /// - `Busy` if the grouping still contains live processes; the descriptor
    ///   is left intact
    pub fn destroy(&self, name: &str) -> Result<DestroyOutcome> {
        check_name(name)?;
        let lock = self.name_lock(name);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.destroy_locked(name)
        };
        drop(lock);
        if outcome.is_ok() {
            self.release_lock(name);
        }
        outcome
    }

    fn destroy_locked(&self, name: &str) -> Result<DestroyOutcome> {
        let mut descriptor = self.descriptor(name)?;

        let grouping_removed = if self.cgroups.is_available() {
            match self.cgroups.remove_membrane(&descriptor.tier, name) {
                Ok(removed) => removed,
                Err(CgroupError::Populated { pids, .. }) => {
                    return Err(OctantError::Busy {
                        name: name.to_string(),
                        pids,
                    });
                },
                Err(e) => {
                    warn!(membrane = name, error = %e, "failed to remove cgroup grouping");
                    false
                },
            }
        } else {
            // Without a grouping, the tracked process is the only member we
            // can know of.
            if let Some(record) = self.store.runtime(name)? {
                if process::is_same_process(record.pid, record.start_time) {
                    return Err(OctantError::Busy {
                        name: name.to_string(),
                        pids: vec![record.pid],
                    });
                }
            }
            false
        };

        self.store.remove_membrane(name)?;
        let runtime_removed = self.store.remove_runtime(name)?;
        descriptor.state = MembraneState::Destroyed;
        info!(membrane = name, grouping_removed, runtime_removed, "membrane destroyed");
        Ok(DestroyOutcome {
            descriptor,
            grouping_removed,
            runtime_removed,
        })
    }

    /// Launches `command` inside the membrane for `name`.
    ///
    /// Creates the membrane with vertex defaults if it does not exist. When
    /// isolation cannot be erected the command still runs and the outcome
    /// carries the degradation; the membrane is then marked `ruptured`.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVertex` if a new membrane would be on a tier-less vertex
    /// - `Busy` if the service already has a live process
    /// - `LaunchFailed` if the command cannot be executed at all
    pub fn run(
        &self,
        name: &str,
        vertex: Vertex,
        command: &str,
        args: &[String],
    ) -> Result<RunOutcome> {
        check_name(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(record) = self.store.runtime(name)? {
            if process::is_same_process(record.pid, record.start_time) {
                return Err(OctantError::Busy {
                    name: name.to_string(),
                    pids: vec![record.pid],
                });
            }
        }

        let (mut descriptor, created) = match self.store.membrane(name)? {
            Some(descriptor) => {
                if descriptor.vertex != vertex {
                    warn!(
                        membrane = name,
                        requested = %vertex,
                        recorded = %descriptor.vertex,
                        "membrane exists on another vertex, keeping the recorded one"
                    );
                }
                (descriptor, false)
            },
            None => (
                self.create_locked(name, vertex, &LimitOverrides::default())?
                    .descriptor,
                true,
            ),
        };

        let (procs, enforcement) = match self.cgroups.ensure_membrane(&descriptor.tier, name) {
            Ok(path) => {
                let enforcement = self.cgroups.apply_limits(&path, &descriptor.envelope());
                (Some(path.join("cgroup.procs")), enforcement)
            },
            Err(e) => (
                None,
                Enforcement::Recorded {
                    reason: e.to_string(),
                },
            ),
        };

        let capabilities = match capability_numbers(&descriptor.capabilities) {
            Ok(caps) => Some(caps),
            Err(e) => {
                warn!(membrane = name, error = %e, "keeping full capability set");
                None
            },
        };

        let spec = LaunchSpec {
            name: name.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            isolation: descriptor.vertex.profile().isolation,
            cgroup_procs: procs,
            capabilities,
        };
        let launched = process::spawn(&spec).map_err(|e| OctantError::LaunchFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        if launched.isolation.is_degraded() || !enforcement.is_applied() {
            descriptor.state = MembraneState::Ruptured;
            self.store.put_membrane(&descriptor)?;
        }

        let record = RuntimeRecord {
            name: name.to_string(),
            vertex: descriptor.vertex,
            pid: launched.pid,
            start_time: launched.start_time,
            launched_at: Utc::now(),
        };
        self.store.put_runtime(&record)?;

        info!(
            membrane = name,
            pid = record.pid,
            vertex = %descriptor.vertex,
            isolated = !launched.isolation.is_degraded(),
            "service launched"
        );
        Ok(RunOutcome {
            record,
            created,
            isolation: launched.isolation,
            enforcement,
        })
    }

    /// Launches a declared service: creates its membrane with the declared
    /// overrides if none exists, then runs its command.
    ///
    /// Returns `Ok(None)` for a declaration without a command.
    ///
    /// # Errors
    ///
    /// As [`MembraneController::create`] and [`MembraneController::run`],
    /// plus `Config` if a declared size cannot be parsed.
    pub fn launch(&self, service: &ServiceConfig) -> Result<Option<RunOutcome>> {
        let Some(command) = service.command.as_deref() else {
            debug!(service = %service.name, "no command declared, nothing to launch");
            return Ok(None);
        };
        if self.store.membrane(&service.name)?.is_none() {
            self.create(&service.name, service.vertex, &service.overrides()?)?;
        }
        self.run(&service.name, service.vertex, command, &service.args)
            .map(Some)
    }

    /// Sends SIGTERM to the service's process and drops its runtime record.
    ///
    /// Returns `true` if a live process was signalled.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the service has no runtime record.
    pub fn stop(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.store.runtime(name)?.ok_or_else(|| OctantError::NotFound {
            kind: "runtime record",
            name: name.to_string(),
        })?;

        let signalled = process::signal_process(record.pid, record.start_time, Signal::SIGTERM);
        self.store.remove_runtime(name)?;
        info!(service = name, pid = record.pid, signalled, "service stopped");
        Ok(signalled)
    }

    /// Removes runtime records whose process is gone, returning them.
    pub fn prune_dead(&self) -> Result<Vec<RuntimeRecord>> {
        let mut dead = Vec::new();
        for record in self.store.runtimes()? {
            if process::is_same_process(record.pid, record.start_time) {
                continue;
            }
            let lock = self.name_lock(&record.name);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            // Re-read under the lock: the service may have been relaunched.
            if self.store.runtime(&record.name)?.as_ref() == Some(&record) {
                self.store.remove_runtime(&record.name)?;
                dead.push(record);
            }
        }
        Ok(dead)
    }

    fn descriptor(&self, name: &str) -> Result<MembraneDescriptor> {
        self.store
            .membrane(name)?
            .ok_or_else(|| OctantError::membrane_not_found(name))
    }

    fn enforce(&self, descriptor: &MembraneDescriptor) -> Enforcement {
        let outcome = match self.cgroups.ensure_membrane(&descriptor.tier, &descriptor.name) {
            Ok(path) => self.cgroups.apply_limits(&path, &descriptor.envelope()),
            Err(e) => Enforcement::Recorded {
                reason: e.to_string(),
            },
        };
        if let Some(reason) = outcome.degraded_reason() {
            warn!(membrane = %descriptor.name, reason, "limits recorded but not enforced");
        }
        outcome
    }
}

fn apply_override<T>(
    changes: &mut Vec<LimitChange>,
    limit: &'static str,
    current: &mut T,
    value: Option<T>,
) where
    T: Copy + PartialEq + Into<u64>,
{
    let Some(value) = value else {
        return;
    };
    if *current != value {
        changes.push(LimitChange {
            limit,
            from: (*current).into(),
            to: value.into(),
        });
        *current = value;
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use proptest::prelude::*;

    use super::*;
    use crate::store::MemoryStateStore;

    const MIB: u64 = 1024 * 1024;

    fn controller_without_cgroups() -> (MembraneController, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let controller = MembraneController::new(
            Arc::new(MemoryStateStore::new()),
            CgroupTree::with_root(dir.path()),
        );
        (controller, dir)
    }

    fn controller_with_cgroups() -> (MembraneController, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory pids\n").unwrap();
        let controller = MembraneController::new(
            Arc::new(MemoryStateStore::new()),
            CgroupTree::with_root(dir.path()),
        );
        (controller, dir)
    }

    #[test]
    fn create_uses_vertex_defaults() {
        let (controller, _dir) = controller_without_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();

        let inspection = controller.inspect("dns").unwrap();
        let d = inspection.descriptor;
        assert_eq!(d.vertex, Vertex::V100);
        assert_eq!(d.tier, "photon");
        assert_eq!(d.memory_hard, 128 * MIB);
        assert_eq!(d.memory_soft, 64 * MIB);
        assert_eq!(d.cpu_weight, 25);
        assert_eq!(d.pids_max, 256);
        assert_eq!(d.state, MembraneState::Created);
        assert!(!inspection.live.is_active());
    }

    #[test]
    fn create_keeps_overrides_exactly() {
        let (controller, _dir) = controller_without_cgroups();
        let overrides = LimitOverrides {
            memory_hard: Some(300 * MIB),
            pids_max: Some(17),
            ..LimitOverrides::default()
        };
        controller.create("web", Vertex::V110, &overrides).unwrap();
        let d = controller.inspect("web").unwrap().descriptor;
        assert_eq!(d.memory_hard, 300 * MIB);
        assert_eq!(d.pids_max, 17);
        assert_eq!(d.memory_soft, 512 * MIB);
        assert_eq!(d.cpu_weight, 100);
    }

    #[test]
    fn create_without_cgroups_is_soft() {
        let (controller, _dir) = controller_without_cgroups();
        let change = controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        assert!(change.created);
        assert!(matches!(
            change.warning(),
            Some(OctantError::DegradedIsolation { .. })
        ));
        assert!(controller.store().membrane("dns").unwrap().is_some());
    }

    #[test]
    fn create_is_idempotent_and_updates() {
        let (controller, _dir) = controller_without_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        let second = controller
            .create(
                "dns",
                Vertex::V100,
                &LimitOverrides {
                    cpu_weight: Some(40),
                    ..LimitOverrides::default()
                },
            )
            .unwrap();
        assert!(!second.created);
        assert_eq!(
            second.changes,
            vec![LimitChange {
                limit: "cpu_weight",
                from: 25,
                to: 40
            }]
        );
        assert_eq!(second.descriptor.memory_hard, 128 * MIB);
    }

    #[test]
    fn create_on_kernel_production_vertex_fails() {
        let (controller, _dir) = controller_without_cgroups();
        for vertex in [Vertex::V000, Vertex::V010] {
            let err = controller
                .create("kmod", vertex, &LimitOverrides::default())
                .unwrap_err();
            assert!(matches!(err, OctantError::UnsupportedVertex(v) if v == vertex));
        }
        assert!(controller.list().unwrap().is_empty());
    }

    #[test]
    fn create_rejects_bad_names() {
        let (controller, _dir) = controller_without_cgroups();
        let err = controller
            .create("../etc", Vertex::V100, &LimitOverrides::default())
            .unwrap_err();
        assert!(matches!(err, OctantError::InvalidName { .. }));
    }

    #[test]
    fn create_with_cgroups_applies_limits() {
        let (controller, dir) = controller_with_cgroups();
        let change = controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        assert_eq!(change.enforcement, Enforcement::Applied);
        let max = dir
            .path()
            .join("octant.slice/photon.slice/dns.membrane/memory.max");
        assert_eq!(fs::read_to_string(max).unwrap(), "134217728\n");
    }

    #[test]
    fn inspect_idle_membrane_is_inactive() {
        let (controller, dir) = controller_with_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        let procs = dir
            .path()
            .join("octant.slice/photon.slice/dns.membrane/cgroup.procs");
        fs::write(&procs, "").unwrap();

        let inspection = controller.inspect("dns").unwrap();
        assert!(inspection.runtime.is_none());
        assert!(matches!(
            inspection.live,
            LiveStatus::Inactive { ref reason } if reason == "no running processes"
        ));

        fs::write(&procs, "4242\n").unwrap();
        let LiveStatus::Active(usage) = controller.inspect("dns").unwrap().live else {
            panic!("populated grouping should be active");
        };
        assert_eq!(usage.pids, vec![4242]);
    }

    #[test]
    fn inspect_with_live_runtime_record_is_active() {
        let (controller, dir) = controller_with_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        fs::write(
            dir.path()
                .join("octant.slice/photon.slice/dns.membrane/cgroup.procs"),
            "",
        )
        .unwrap();
        let me = std::process::id();
        controller
            .store()
            .put_runtime(&RuntimeRecord {
                name: "dns".to_string(),
                vertex: Vertex::V100,
                pid: me,
                start_time: process::read_proc_start_time(me),
                launched_at: Utc::now(),
            })
            .unwrap();

        assert!(controller.inspect("dns").unwrap().live.is_active());
    }

    #[test]
    fn names_are_checked_before_touching_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::FsStateStore::open(dir.path()).unwrap();
        let controller =
            MembraneController::new(Arc::new(store), CgroupTree::with_root(dir.path()));
        let outside = dir.path().join("victim.json");
        fs::write(&outside, "{}").unwrap();

        let invalid = |r: Result<()>| matches!(r, Err(OctantError::InvalidName { .. }));
        assert!(invalid(controller.inspect("../victim").map(drop)));
        assert!(invalid(controller.destroy("../victim").map(drop)));
        assert!(invalid(controller.contract("../victim").map(drop)));
        assert!(invalid(
            controller
                .stretch("../victim", StretchRequest::default())
                .map(drop)
        ));
        assert!(invalid(controller.stop("../victim").map(drop)));
        assert!(invalid(
            controller
                .run("../victim", Vertex::V110, "true", &[])
                .map(drop)
        ));
        assert!(outside.exists());
    }

    #[test]
    fn destroy_forgets_the_name_lock() {
        let (controller, _dir) = controller_without_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        controller.create("web", Vertex::V110, &LimitOverrides::default()).unwrap();
        controller.destroy("dns").unwrap();

        let locks = controller.locks.lock().unwrap();
        assert!(!locks.contains_key("dns"));
        assert!(locks.contains_key("web"));
    }

    #[test]
    fn stretch_then_contract_restores() {
        let (controller, _dir) = controller_without_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();

        let stretched = controller
            .stretch(
                "dns",
                StretchRequest {
                    memory: Some(512 * MIB),
                    cpu: None,
                },
            )
            .unwrap();
        assert_eq!(stretched.descriptor.state, MembraneState::Stretched);
        assert_eq!(stretched.descriptor.snapshot.memory_hard, Some(128 * MIB));

        let contracted = controller.contract("dns").unwrap();
        assert_eq!(contracted.descriptor.memory_hard, 128 * MIB);
        assert_eq!(contracted.descriptor.state, MembraneState::Created);
        assert!(contracted.descriptor.snapshot.is_empty());
    }

    #[test]
    fn second_stretch_keeps_first_snapshot() {
        let (controller, _dir) = controller_without_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        for memory in [256 * MIB, 1024 * MIB] {
            controller
                .stretch(
                    "dns",
                    StretchRequest {
                        memory: Some(memory),
                        cpu: Some(90),
                    },
                )
                .unwrap();
        }
        let contracted = controller.contract("dns").unwrap();
        assert_eq!(contracted.descriptor.memory_hard, 128 * MIB);
        assert_eq!(contracted.descriptor.cpu_weight, 25);
    }

    #[test]
    fn contract_without_stretch_is_noop() {
        let (controller, _dir) = controller_without_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        let change = controller.contract("dns").unwrap();
        assert!(change.changes.is_empty());
        assert_eq!(change.descriptor.state, MembraneState::Created);
    }

    #[test]
    fn missing_membrane_is_not_found() {
        let (controller, _dir) = controller_without_cgroups();
        assert!(matches!(controller.inspect("x"), Err(OctantError::NotFound { .. })));
        assert!(matches!(
            controller.stretch("x", StretchRequest::default()),
            Err(OctantError::NotFound { .. })
        ));
        assert!(matches!(controller.contract("x"), Err(OctantError::NotFound { .. })));
        assert!(matches!(controller.destroy("x"), Err(OctantError::NotFound { .. })));
        assert!(matches!(controller.stop("x"), Err(OctantError::NotFound { .. })));
    }

    #[test]
    fn destroy_populated_membrane_is_busy() {
        let (controller, dir) = controller_with_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        let procs = dir
            .path()
            .join("octant.slice/photon.slice/dns.membrane/cgroup.procs");
        fs::write(&procs, "4242\n").unwrap();

        let err = controller.destroy("dns").unwrap_err();
        assert!(matches!(err, OctantError::Busy { ref pids, .. } if pids == &vec![4242]));
        assert!(controller.store().membrane("dns").unwrap().is_some());

        fs::write(&procs, "").unwrap();
        let outcome = controller.destroy("dns").unwrap();
        assert!(outcome.grouping_removed);
        assert_eq!(outcome.descriptor.state, MembraneState::Destroyed);
        assert!(controller.store().membrane("dns").unwrap().is_none());
    }

    #[test]
    fn destroy_removes_stale_runtime_record() {
        let (controller, _dir) = controller_without_cgroups();
        controller.create("dns", Vertex::V100, &LimitOverrides::default()).unwrap();
        controller
            .store()
            .put_runtime(&RuntimeRecord {
                name: "dns".to_string(),
                vertex: Vertex::V100,
                pid: u32::MAX,
                start_time: None,
                launched_at: Utc::now(),
            })
            .unwrap();
        let outcome = controller.destroy("dns").unwrap();
        assert!(outcome.runtime_removed);
    }

    #[test]
    fn run_creates_membrane_and_records_runtime() {
        let (controller, _dir) = controller_without_cgroups();
        let outcome = controller
            .run("sleeper", Vertex::V110, "sh", &["-c".to_string(), "exit 0".to_string()])
            .unwrap();
        assert!(outcome.created);
        assert!(!outcome.warnings().is_empty());
        assert_eq!(controller.store().runtime("sleeper").unwrap(), Some(outcome.record.clone()));

        let d = controller.store().membrane("sleeper").unwrap().unwrap();
        assert_eq!(d.state, MembraneState::Ruptured);

        let _ = nix::sys::wait::waitpid(
            nix::unistd::Pid::from_raw(i32::try_from(outcome.record.pid).unwrap()),
            None,
        );
        let pruned = controller.prune_dead().unwrap();
        assert_eq!(pruned.len(), 1);
        assert!(controller.store().runtime("sleeper").unwrap().is_none());
    }

    #[test]
    fn run_missing_command_fails() {
        let (controller, _dir) = controller_without_cgroups();
        let err = controller
            .run("ghost", Vertex::V100, "nonexistent_command_12345", &[])
            .unwrap_err();
        assert!(matches!(err, OctantError::LaunchFailed { .. }));
        assert!(controller.store().runtime("ghost").unwrap().is_none());
    }

    #[test]
    fn launch_applies_declared_overrides() {
        let (controller, _dir) = controller_without_cgroups();
        let mut service = ServiceConfig::new("tracer", Vertex::V101);
        assert!(controller.launch(&service).unwrap().is_none());
        assert!(controller.store().membrane("tracer").unwrap().is_none());

        service.command = Some("true".to_string());
        service.memory_hard = Some("200M".to_string());
        let outcome = controller.launch(&service).unwrap().unwrap();
        let d = controller.store().membrane("tracer").unwrap().unwrap();
        assert_eq!(d.memory_hard, 200 * MIB);
        assert_eq!(d.tier, "darkphoton");
        let _ = nix::sys::wait::waitpid(
            nix::unistd::Pid::from_raw(i32::try_from(outcome.record.pid).unwrap()),
            None,
        );
    }

    #[test]
    fn run_on_kernel_vertex_is_unsupported() {
        let (controller, _dir) = controller_without_cgroups();
        let err = controller.run("k", Vertex::V000, "true", &[]).unwrap_err();
        assert!(matches!(err, OctantError::UnsupportedVertex(Vertex::V000)));
    }

    proptest! {
        #[test]
        fn contract_restores_pre_first_stretch(
            stretches in prop::collection::vec(
                (prop::option::of(1u64..(64 * 1024 * MIB)), prop::option::of(1u32..10_000)),
                1..6,
            )
        ) {
            let (controller, _dir) = controller_without_cgroups();
            let before = controller
                .create("svc", Vertex::V111, &LimitOverrides::default())
                .unwrap()
                .descriptor;

            for (memory, cpu) in stretches {
                controller.stretch("svc", StretchRequest { memory, cpu }).unwrap();
            }
            let after = controller.contract("svc").unwrap().descriptor;

            prop_assert_eq!(after.memory_hard, before.memory_hard);
            prop_assert_eq!(after.cpu_weight, before.cpu_weight);
            prop_assert_eq!(after.memory_soft, before.memory_soft);
            prop_assert_eq!(after.pids_max, before.pids_max);
            prop_assert!(after.snapshot.is_empty());
        }
    }
}
