//! The five-phase boot sequence.
//!
//! Phases run strictly in order, each to completion before the next starts:
//!
//! 1. **Hydrogen**: virtual filesystems, kernel modules, entropy reseed
//! 2. **Helium**: isolation tiers, state directory, hostname, timezone
//! 3. **Carbon**: phase-3 services, all pinned to `V100`
//! 4. **Oxygen**: phase-4 services; development services only in development
//!    mode
//! 5. **Iron**: boot summary
//!
//! Anything that only degrades the node (a missing module, an unset hostname,
//! a service that failed to launch) becomes a warning in the summary. A
//! failure that leaves a later phase unable to run is returned as
//! [`OctantError::Fatal`] and the caller drops to the emergency shell.

mod phase;

use std::sync::Arc;

use chrono::Utc;
use octant_core::config::{ConfigStore, ServiceConfig};
use octant_core::store::{BootSummary, VertexState, VertexTable};
use octant_core::{Chirality, MembraneController, OctantError, Result, Vertex};
pub use phase::{BootState, Phase, PhaseError};
use tracing::{debug, info, warn};

use crate::platform::{MountSpec, Platform};
use crate::state::SharedState;

/// The vertex every phase-3 service runs under.
pub const CORE_SERVICE_VERTEX: Vertex = Vertex::V100;

/// Runs the boot phases against shared init state.
#[derive(Debug)]
pub struct BootSequencer {
    state: SharedState,
    config: Arc<ConfigStore>,
    membranes: Arc<MembraneController>,
    platform: Arc<dyn Platform>,
    warnings: Vec<String>,
    launched: Vec<String>,
}

fn fatal(phase: Phase, reason: impl std::fmt::Display) -> OctantError {
    OctantError::Fatal {
        phase: phase.number(),
        reason: reason.to_string(),
    }
}

impl BootSequencer {
    /// A sequencer for `state`, which must still be at phase 1.
    #[must_use]
    pub fn new(state: SharedState) -> Self {
        Self {
            config: Arc::clone(state.config()),
            membranes: Arc::clone(state.membranes()),
            platform: Arc::clone(state.platform()),
            state,
            warnings: Vec::new(),
            launched: Vec::new(),
        }
    }

    /// Runs all five phases and returns the persisted summary.
    ///
    /// # Errors
    ///
    /// Returns [`OctantError::Fatal`] naming the phase that could not
    /// proceed.
    pub fn run(mut self) -> Result<BootSummary> {
        let boot = self.state.boot_state();
        if boot.phase() != Phase::Hydrogen {
            return Err(fatal(boot.phase(), "boot sequence already ran"));
        }
        info!(mode = %boot.chirality(), phase = %Phase::Hydrogen, "boot starting");

        self.hydrogen()?;
        self.enter(Phase::Helium)?;
        self.helium()?;
        self.enter(Phase::Carbon)?;
        self.carbon()?;
        self.enter(Phase::Oxygen)?;
        self.oxygen()?;
        self.enter(Phase::Iron)?;
        Ok(self.iron())
    }

    fn enter(&self, phase: Phase) -> Result<()> {
        self.state.advance(phase).map_err(|e| fatal(phase, e))?;
        info!(%phase, "entering phase");
        Ok(())
    }

    fn warn(&mut self, phase: Phase, message: String) {
        warn!(phase = phase.number(), "{message}");
        self.warnings.push(format!("phase {}: {message}", phase.number()));
    }

    fn mode(&self) -> Chirality {
        self.state.boot_state().chirality()
    }

    fn hydrogen(&mut self) -> Result<()> {
        let config_store = Arc::clone(&self.config);
        let config = config_store.config();

        for spec in MountSpec::defaults(&config.paths.cgroup_root) {
            if self.platform.is_mounted(&spec.target) {
                debug!(target = %spec.target.display(), "already mounted");
                continue;
            }
            match self.platform.mount(&spec) {
                Ok(()) => info!(fstype = spec.fstype, target = %spec.target.display(), "mounted"),
                Err(e) if spec.required => return Err(fatal(Phase::Hydrogen, e)),
                Err(e) => self.warn(Phase::Hydrogen, e.to_string()),
            }
        }

        for module in config.boot.modules.clone() {
            match self.platform.load_module(&module) {
                Ok(()) => debug!(module, "kernel module loaded"),
                Err(e) => self.warn(Phase::Hydrogen, e.to_string()),
            }
        }

        let seed = config.boot.random_seed.clone();
        match self.platform.reseed_entropy(&seed) {
            Ok(true) => debug!(seed = %seed.display(), "entropy reseeded"),
            Ok(false) => self.warn(
                Phase::Hydrogen,
                format!("no entropy seed at {}", seed.display()),
            ),
            Err(e) => self.warn(Phase::Hydrogen, e.to_string()),
        }
        Ok(())
    }

    fn helium(&mut self) -> Result<()> {
        let cgroups = self.membranes.cgroups().clone();
        if cgroups.is_available() {
            for vertex in Vertex::ALL {
                let profile = vertex.profile();
                let (Some(tier), Some(envelope)) = (profile.tier, profile.envelope) else {
                    continue;
                };
                match cgroups.ensure_tier(tier) {
                    Ok(path) => {
                        let enforcement = cgroups.apply_limits(&path, &envelope);
                        if let Some(reason) = enforcement.degraded_reason() {
                            self.warn(Phase::Helium, format!("tier {tier}: {reason}"));
                        }
                    },
                    Err(e) => self.warn(Phase::Helium, format!("tier {tier}: {e}")),
                }
            }
        } else {
            self.warn(
                Phase::Helium,
                format!(
                    "cgroup v2 not available at {}; limits are recorded, not enforced",
                    cgroups.root().display()
                ),
            );
        }

        let mode = self.mode();
        let store = Arc::clone(self.membranes.store());
        store.initialize().map_err(|e| fatal(Phase::Helium, e))?;
        store
            .set_vertex_table(&VertexTable::initial(mode))
            .map_err(|e| fatal(Phase::Helium, e))?;
        store.set_mode(mode).map_err(|e| fatal(Phase::Helium, e))?;

        let boot = &self.config.config().boot;
        let (hostname, timezone) = (boot.hostname.clone(), boot.timezone.clone());
        if let Err(e) = self.platform.set_hostname(&hostname) {
            self.warn(Phase::Helium, e.to_string());
        }
        if let Err(e) = self.platform.set_timezone(&timezone) {
            self.warn(Phase::Helium, e.to_string());
        }
        Ok(())
    }

    fn carbon(&mut self) -> Result<()> {
        let services: Vec<ServiceConfig> = self.config.services_for_phase(3).cloned().collect();
        for mut service in services {
            if service.vertex != CORE_SERVICE_VERTEX {
                self.warn(
                    Phase::Carbon,
                    format!(
                        "service '{}' declares {} but phase-3 services run under {}",
                        service.name, service.vertex, CORE_SERVICE_VERTEX
                    ),
                );
                service.vertex = CORE_SERVICE_VERTEX;
            }
            self.launch(Phase::Carbon, &service);
        }
        self.activate(Phase::Carbon, CORE_SERVICE_VERTEX)
    }

    fn oxygen(&mut self) -> Result<()> {
        let mode = self.mode();
        let services: Vec<ServiceConfig> = self.config.services_for_phase(4).cloned().collect();
        for service in services {
            if service.vertex.is_development() && mode == Chirality::Production {
                info!(
                    service = %service.name,
                    vertex = %service.vertex,
                    "development service not started in production mode"
                );
                continue;
            }
            self.launch(Phase::Oxygen, &service);
        }

        self.activate(Phase::Oxygen, Vertex::V110)?;
        if mode == Chirality::Development {
            for vertex in Vertex::of_polarity(Chirality::Development) {
                self.activate(Phase::Oxygen, vertex)?;
            }
        }
        Ok(())
    }

    fn iron(mut self) -> BootSummary {
        let boot = self.state.boot_state();
        let completed_at = Utc::now();
        let duration_ms =
            u64::try_from((completed_at - boot.started_at()).num_milliseconds()).unwrap_or(0);

        let mut summary = BootSummary {
            version: env!("CARGO_PKG_VERSION").to_string(),
            mode: boot.chirality(),
            started_at: boot.started_at(),
            completed_at,
            duration_ms,
            services_launched: std::mem::take(&mut self.launched),
            warnings: self.warnings.clone(),
        };
        if let Err(e) = self.membranes.store().put_boot_summary(&summary) {
            self.warn(Phase::Iron, format!("boot summary not persisted: {e}"));
            summary.warnings.clone_from(&self.warnings);
        }

        info!(
            mode = %summary.mode,
            duration_ms,
            services = summary.services_launched.len(),
            warnings = summary.warnings.len(),
            "boot complete"
        );
        summary
    }

    fn launch(&mut self, phase: Phase, service: &ServiceConfig) {
        // Ordering is declaration order; `depends_on` is only reported.
        if let Some(dependency) = &service.depends_on {
            if !self.launched.contains(dependency) {
                info!(
                    service = %service.name,
                    depends_on = %dependency,
                    "dependency not launched before this service"
                );
            }
        }
        match self.membranes.launch(service) {
            Ok(Some(outcome)) => {
                for warning in outcome.warnings() {
                    self.warn(phase, format!("service '{}': {warning}", service.name));
                }
                info!(service = %service.name, pid = outcome.record.pid, "service launched");
                self.launched.push(service.name.clone());
            },
            Ok(None) => self.warn(
                phase,
                format!("service '{}' declares no command", service.name),
            ),
            Err(e) => self.warn(
                phase,
                format!("service '{}' failed to launch: {e}", service.name),
            ),
        }
    }

    fn activate(&self, phase: Phase, vertex: Vertex) -> Result<()> {
        self.membranes
            .store()
            .set_vertex_state(vertex, VertexState::Active)
            .map_err(|e| fatal(phase, e))?;
        debug!(%vertex, "vertex active");
        Ok(())
    }
}
