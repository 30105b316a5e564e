//! System-wide mode and the flip protocol.
//!
//! The persisted chirality bit selects whether the four development-polarity
//! vertices run. A flip walks those vertices, updates their state-table rows,
//! starts or stops the services declared on them, and persists the new mode
//! last: a flip that fails half way still reads as the old mode, and a retry
//! only redoes what is not yet in the target state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

pub use crate::vertex::Chirality;

use crate::config::ConfigStore;
use crate::error::Result;
use crate::membrane::MembraneController;
use crate::process;
use crate::store::{StateStore, VertexState};
use crate::vertex::Vertex;

/// Requested mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipTarget {
    /// Deactivate development vertices.
    Production,
    /// Activate development vertices.
    Development,
    /// The opposite of the current mode.
    Toggle,
}

impl FlipTarget {
    /// The concrete mode this target means when the system is in `current`.
    #[must_use]
    pub const fn resolve(self, current: Chirality) -> Chirality {
        match self {
            Self::Production => Chirality::Production,
            Self::Development => Chirality::Development,
            Self::Toggle => current.flipped(),
        }
    }
}

impl From<Chirality> for FlipTarget {
    fn from(mode: Chirality) -> Self {
        match mode {
            Chirality::Production => Self::Production,
            Chirality::Development => Self::Development,
        }
    }
}

impl FromStr for FlipTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "toggle" => Ok(Self::Toggle),
            other => other.parse::<Chirality>().map(Self::from),
        }
    }
}

impl fmt::Display for FlipTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::Toggle => "toggle",
        })
    }
}

/// Direction of a selective change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectiveAction {
    /// Mark the partner vertex active.
    Activate,
    /// Mark the partner vertex inactive.
    Deactivate,
}

impl SelectiveAction {
    const fn target_state(self) -> VertexState {
        match self {
            Self::Activate => VertexState::Active,
            Self::Deactivate => VertexState::Inactive,
        }
    }
}

impl FromStr for SelectiveAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "activate" | "on" => Ok(Self::Activate),
            "deactivate" | "off" => Ok(Self::Deactivate),
            other => Err(format!("unknown action '{other}' (expected activate|deactivate)")),
        }
    }
}

/// One state-table row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VertexTransition {
    /// The vertex.
    pub vertex: Vertex,
    /// State before.
    pub from: VertexState,
    /// State after.
    pub to: VertexState,
}

/// One row of [`ChiralityStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VertexRow {
    /// The vertex.
    pub vertex: Vertex,
    /// Human name.
    pub name: &'static str,
    /// Current state.
    pub state: VertexState,
}

/// Mode plus the full state table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChiralityStatus {
    /// Persisted mode.
    pub mode: Chirality,
    /// All eight vertices in id order.
    pub vertices: Vec<VertexRow>,
}

/// What a flip would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlipPlan {
    /// Current mode.
    pub from: Chirality,
    /// Target mode.
    pub to: Chirality,
    /// Rows that would change.
    pub transitions: Vec<VertexTransition>,
    /// Declared services that would be launched.
    pub start: Vec<String>,
    /// Tracked services that would be stopped.
    pub stop: Vec<String>,
}

impl FlipPlan {
    /// `true` if the target equals the current mode.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// What a flip did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlipReport {
    /// Mode before.
    pub from: Chirality,
    /// Mode after.
    pub to: Chirality,
    /// `true` if the system already was in the target mode.
    pub already: bool,
    /// Rows that changed.
    pub changed_vertices: Vec<VertexTransition>,
    /// Services launched.
    pub started_services: Vec<String>,
    /// Services signalled to stop.
    pub stopped_services: Vec<String>,
    /// Per-service problems that did not stop the flip.
    pub degraded: Vec<String>,
    /// Services whose launch or stop failed outright.
    pub failed: Vec<String>,
    /// `true` once the new mode bit is persisted. A flip with failed
    /// services leaves the old mode in place so it can be retried.
    pub completed: bool,
}

/// Reads and flips the system-wide mode.
#[derive(Debug, Clone)]
pub struct ChiralityController {
    membranes: Arc<MembraneController>,
    config: Arc<ConfigStore>,
}

impl ChiralityController {
    /// A controller launching services declared in `config`.
    pub fn new(membranes: Arc<MembraneController>, config: Arc<ConfigStore>) -> Self {
        Self { membranes, config }
    }

    fn store(&self) -> &Arc<dyn StateStore> {
        self.membranes.store()
    }

    /// The persisted mode and all eight state-table rows.
    pub fn status(&self) -> Result<ChiralityStatus> {
        let mode = self.store().mode()?;
        let table = self.store().vertex_table()?;
        Ok(ChiralityStatus {
            mode,
            vertices: table
                .rows()
                .map(|(vertex, state)| VertexRow {
                    vertex,
                    name: vertex.name(),
                    state,
                })
                .collect(),
        })
    }

    /// Computes what [`ChiralityController::flip`] would do, without side
    /// effects.
    pub fn diff(&self, target: FlipTarget) -> Result<FlipPlan> {
        let from = self.store().mode()?;
        let to = target.resolve(from);
        let mut plan = FlipPlan {
            from,
            to,
            transitions: Vec::new(),
            start: Vec::new(),
            stop: Vec::new(),
        };
        if plan.is_noop() {
            return Ok(plan);
        }

        let table = self.store().vertex_table()?;
        let target_state = match to {
            Chirality::Development => VertexState::Active,
            Chirality::Production => VertexState::Inactive,
        };
        plan.transitions = Vertex::of_polarity(Chirality::Development)
            .map(|vertex| VertexTransition {
                vertex,
                from: table.get(vertex),
                to: target_state,
            })
            .filter(|t| t.from != t.to)
            .collect();

        match to {
            Chirality::Development => {
                for service in self.config.services_of_polarity(Chirality::Development) {
                    if !self.has_live_process(&service.name)? {
                        plan.start.push(service.name.clone());
                    }
                }
            },
            Chirality::Production => {
                for record in self.store().runtimes()? {
                    let vertex = match self.store().membrane(&record.name)? {
                        Some(descriptor) => descriptor.vertex,
                        None => record.vertex,
                    };
                    if vertex.is_development() {
                        plan.stop.push(record.name);
                    }
                }
            },
        }
        Ok(plan)
    }

    /// Moves the system to `target`.
    ///
    /// Per-service problems are collected in the report and do not abort
    /// the flip. The mode bit is written last, and only if no service action
    /// failed outright; re-running the flip then retries just the vertices
    /// and services that are not yet in the target state.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state store fails.
    pub fn flip(&self, target: FlipTarget) -> Result<FlipReport> {
        let plan = self.diff(target)?;
        let mut report = FlipReport {
            from: plan.from,
            to: plan.to,
            ..FlipReport::default()
        };
        if plan.is_noop() {
            info!(mode = %plan.from, "already in requested mode");
            report.already = true;
            report.completed = true;
            return Ok(report);
        }

        for transition in &plan.transitions {
            self.store().set_vertex_state(transition.vertex, transition.to)?;
            report.changed_vertices.push(*transition);
        }

        for name in &plan.start {
            let Some(service) = self.config.service(name) else {
                continue;
            };
            match self.membranes.launch(service) {
                Ok(Some(outcome)) => {
                    report
                        .degraded
                        .extend(outcome.warnings().iter().map(|w| format!("{name}: {w}")));
                    report.started_services.push(name.clone());
                },
                Ok(None) => report
                    .degraded
                    .push(format!("{name}: no command declared, nothing launched")),
                Err(e) => {
                    warn!(service = %name, error = %e, "launch during flip failed");
                    report.degraded.push(format!("{name}: {e}"));
                    report.failed.push(name.clone());
                },
            }
        }

        for name in &plan.stop {
            match self.membranes.stop(name) {
                Ok(_) => report.stopped_services.push(name.clone()),
                Err(e) => {
                    warn!(service = %name, error = %e, "stop during flip failed");
                    report.degraded.push(format!("{name}: {e}"));
                    report.failed.push(name.clone());
                },
            }
        }

        if !report.failed.is_empty() {
            warn!(
                mode = %plan.from,
                failed = ?report.failed,
                "flip incomplete, mode left unchanged"
            );
            return Ok(report);
        }

        self.store().set_mode(plan.to)?;
        report.completed = true;
        info!(
            from = %plan.from,
            to = %plan.to,
            vertices = report.changed_vertices.len(),
            started = report.started_services.len(),
            stopped = report.stopped_services.len(),
            degraded = report.degraded.len(),
            "chirality flipped"
        );
        Ok(report)
    }

    /// Sets the state of `vertex`'s chiral partner only.
    ///
    /// Neither the mode bit nor any other row changes.
    pub fn selective(&self, vertex: Vertex, action: SelectiveAction) -> Result<VertexTransition> {
        let partner = vertex.partner();
        let to = action.target_state();
        let from = self.store().set_vertex_state(partner, to)?;
        info!(vertex = %vertex, partner = %partner, %from, %to, "selective chirality change");
        Ok(VertexTransition {
            vertex: partner,
            from,
            to,
        })
    }

    fn has_live_process(&self, name: &str) -> Result<bool> {
        Ok(self
            .store()
            .runtime(name)?
            .is_some_and(|r| process::is_same_process(r.pid, r.start_time)))
    }
}
