//! Reverse sequencing: stop services, persist entropy, sync, terminal action.
//!
//! Service stop is two-staged. Every recorded process gets SIGTERM, then a
//! deadline-driven wait gives them the configured grace period. Whatever is
//! still alive afterwards gets SIGKILL. The kill stage is never wrapped in a
//! timeout, and it only kills a PID whose kernel start time still matches
//! the runtime record: a recycled PID belongs to someone else.

use std::time::Duration;

use nix::sys::signal::Signal;
use octant_core::MembraneController;
use octant_core::process::{is_alive, is_same_process, read_proc_start_time, signal_process};
use octant_core::store::RuntimeRecord;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::platform::{PlatformResult, TerminalAction};
use crate::state::SharedState;

/// Poll interval while waiting for services to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the service stop stage did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Services sent SIGTERM.
    pub terminated: Vec<String>,
    /// Services sent SIGKILL after the grace period.
    pub killed: Vec<String>,
    /// Survivors left alone because their identity could not be verified.
    pub unverified: Vec<String>,
    /// Every service exited within the grace period.
    pub graceful: bool,
}

/// Stops every service with a runtime record.
///
/// Records are snapshotted before anything is signalled; the kill stage
/// works from that snapshot.
pub async fn stop_services(membranes: &MembraneController, grace: Duration) -> ShutdownReport {
    let tracked = match membranes.store().runtimes() {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "cannot read runtime records; nothing to stop");
            Vec::new()
        },
    };
    let mut report = ShutdownReport::default();

    if tracked.is_empty() {
        info!("no running services to stop");
        report.graceful = true;
        return report;
    }

    info!(count = tracked.len(), "stopping services");
    for record in &tracked {
        if signal_process(record.pid, record.start_time, Signal::SIGTERM) {
            report.terminated.push(record.name.clone());
        }
    }

    report.graceful = wait_for_exit(&tracked, Instant::now() + grace).await;
    if report.graceful {
        info!("all services stopped gracefully");
    } else {
        force_kill(&tracked, &mut report);
    }

    for record in &tracked {
        if let Err(e) = membranes.store().remove_runtime(&record.name) {
            warn!(service = %record.name, error = %e, "failed to remove runtime record");
        }
    }
    report
}

/// Waits until every tracked process is gone or `deadline` passes.
///
/// Returns `true` if all exited in time.
async fn wait_for_exit(tracked: &[RuntimeRecord], deadline: Instant) -> bool {
    loop {
        if tracked
            .iter()
            .all(|r| !is_same_process(r.pid, r.start_time))
        {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            warn!("grace period exceeded");
            return false;
        }
        tokio::time::sleep((deadline - now).min(EXIT_POLL_INTERVAL)).await;
    }
}

/// Sends SIGKILL to every tracked process that is still the one recorded.
fn force_kill(tracked: &[RuntimeRecord], report: &mut ShutdownReport) {
    for record in tracked {
        if !is_alive(record.pid) {
            continue;
        }
        let Some(expected_start) = record.start_time else {
            warn!(
                service = %record.name,
                pid = record.pid,
                "start time unknown, skipping SIGKILL (cannot verify PID identity)"
            );
            report.unverified.push(record.name.clone());
            continue;
        };
        let current_start = read_proc_start_time(record.pid);
        if current_start != Some(expected_start) {
            warn!(
                service = %record.name,
                pid = record.pid,
                expected_start,
                ?current_start,
                "PID reuse detected, skipping kill of unrelated process"
            );
            continue;
        }
        warn!(
            service = %record.name,
            pid = record.pid,
            "still alive after grace period, sending SIGKILL"
        );
        if signal_process(record.pid, Some(expected_start), Signal::SIGKILL) {
            report.killed.push(record.name.clone());
        }
    }
}

/// Runs the shutdown sequence up to, but not including, the terminal action.
pub async fn reverse_sequence(state: &SharedState) -> ShutdownReport {
    state.request_shutdown();
    let config = state.config().config();

    let report = stop_services(state.membranes(), config.supervision.grace_period).await;

    if let Err(e) = state.platform().save_entropy(&config.boot.random_seed) {
        warn!(error = %e, "entropy seed not saved");
    }
    state.platform().sync();
    info!(
        terminated = report.terminated.len(),
        killed = report.killed.len(),
        graceful = report.graceful,
        "services stopped, filesystems synced"
    );
    report
}

/// Performs the terminal action when running as process 1; otherwise only
/// logs it.
///
/// # Errors
///
/// Returns the platform error if the kernel refused the action.
pub fn finish(state: &SharedState, action: TerminalAction) -> PlatformResult<()> {
    if state.platform().is_pid1() {
        state.platform().terminal_action(action)
    } else {
        info!(%action, "not process 1, skipping terminal action");
        Ok(())
    }
}
