//! Supervision loop.
//!
//! Process 1 inherits every orphan on the node, so each tick first reaps all
//! exited children, then drops runtime records whose process is gone.
//! Services are not restarted; a death is logged and the record pruned.

use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use octant_core::MembraneController;
use octant_core::store::RuntimeRecord;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::SharedState;

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
}

/// A child collected by [`reap_children`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    /// The child's PID.
    pub pid: u32,
    /// How it ended.
    pub exit: ExitKind,
}

/// Result of one supervision tick.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Children reaped this tick.
    pub reaped: Vec<Reaped>,
    /// Runtime records removed because their process is gone.
    pub dead: Vec<RuntimeRecord>,
}

/// Collects every exited child without blocking.
pub fn reap_children() -> Vec<Reaped> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => reaped.push(Reaped {
                pid: pid.as_raw().unsigned_abs(),
                exit: ExitKind::Exited(code),
            }),
            Ok(WaitStatus::Signaled(pid, signal, _)) => reaped.push(Reaped {
                pid: pid.as_raw().unsigned_abs(),
                exit: ExitKind::Signaled(signal),
            }),
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Ok(_) | Err(nix::Error::EINTR) => {},
            Err(e) => {
                warn!(error = %e, "waitpid failed");
                break;
            },
        }
    }
    reaped
}

/// Prunes dead runtime records and logs each service death, using `reaped`
/// for exit details.
pub fn record_deaths(membranes: &MembraneController, reaped: Vec<Reaped>) -> TickReport {
    let dead = match membranes.prune_dead() {
        Ok(dead) => dead,
        Err(e) => {
            warn!(error = %e, "failed to prune runtime records");
            Vec::new()
        },
    };

    for record in &dead {
        match reaped.iter().find(|r| r.pid == record.pid).map(|r| r.exit) {
            Some(ExitKind::Exited(code)) => {
                info!(service = %record.name, pid = record.pid, code, "service exited");
            },
            Some(ExitKind::Signaled(signal)) => {
                warn!(
                    service = %record.name,
                    pid = record.pid,
                    ?signal,
                    "service killed by signal"
                );
            },
            None => info!(service = %record.name, pid = record.pid, "service gone"),
        }
    }
    for child in &reaped {
        if !dead.iter().any(|d| d.pid == child.pid) {
            debug!(pid = child.pid, exit = ?child.exit, "reaped child");
        }
    }

    TickReport { reaped, dead }
}

/// Runs one supervision tick.
pub fn tick(membranes: &MembraneController) -> TickReport {
    record_deaths(membranes, reap_children())
}

/// Ticks every `interval` until `cancel` fires.
pub async fn run(state: SharedState, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval = ?interval, "supervision started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = tick(state.membranes());
                if !report.dead.is_empty() {
                    debug!(dead = report.dead.len(), "supervision tick");
                }
            }
        }
    }
    info!("supervision stopped");
}
