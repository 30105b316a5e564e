//! Shutdown Containment Tests
//!
//! The reverse sequence must not leave a recorded service running, and must
//! never kill a process that is not the one recorded.
//!
//! # Tests
//!
//! - `term_resistant_service_is_killed`: a child ignoring SIGTERM is
//!   escalated to SIGKILL once the grace period expires.
//!
//! - `cooperative_service_stops_within_grace`: a plain child exits on SIGTERM
//!   and no SIGKILL is sent.
//!
//! - `pid_reuse_no_false_positive_kill`: a record whose start time does not
//!   match the live process at that PID is never signalled.
//!
//! # Verification
//!
//! ```text
//! cargo test -p octant-init --test shutdown_containment
//! ```

use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use octant_core::MembraneController;
use octant_core::Vertex;
use octant_core::cgroup::CgroupTree;
use octant_core::process::read_proc_start_time;
use octant_core::store::{MemoryStateStore, RuntimeRecord, StateStore};
use octant_init::shutdown::stop_services;

// =============================================================================
// Helpers
// =============================================================================

fn controller() -> (MembraneController, Arc<MemoryStateStore>) {
    let store = Arc::new(MemoryStateStore::new());
    let membranes = MembraneController::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        CgroupTree::with_root("/nonexistent/cgroup"),
    );
    (membranes, store)
}

/// Spawns `script` under `sh -c` and gives it time to install traps.
fn spawn_script(script: &str) -> Child {
    let child = Command::new("sh").arg("-c").arg(script).spawn().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    child
}

fn record_for(name: &str, child: &Child, start_time: Option<u64>) -> RuntimeRecord {
    RuntimeRecord {
        name: name.to_string(),
        vertex: Vertex::V110,
        pid: child.id(),
        start_time,
        launched_at: Utc::now(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn term_resistant_service_is_killed() {
    let (membranes, store) = controller();
    let mut child = spawn_script("trap '' TERM; exec sleep 30");
    let start = read_proc_start_time(child.id());
    assert!(start.is_some());
    store.put_runtime(&record_for("stubborn", &child, start)).unwrap();

    let report = stop_services(&membranes, Duration::from_millis(300)).await;

    assert!(!report.graceful);
    assert_eq!(report.terminated, vec!["stubborn"]);
    assert_eq!(report.killed, vec!["stubborn"]);
    let status = child.wait().unwrap();
    assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    assert!(store.runtimes().unwrap().is_empty());
}

#[tokio::test]
async fn cooperative_service_stops_within_grace() {
    let (membranes, store) = controller();
    let mut child = spawn_script("exec sleep 30");
    let start = read_proc_start_time(child.id());
    store.put_runtime(&record_for("polite", &child, start)).unwrap();

    let report = stop_services(&membranes, Duration::from_secs(5)).await;

    assert!(report.graceful);
    assert_eq!(report.terminated, vec!["polite"]);
    assert!(report.killed.is_empty());
    let status = child.wait().unwrap();
    assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
}

#[tokio::test]
async fn pid_reuse_no_false_positive_kill() {
    let (membranes, store) = controller();
    let mut child = spawn_script("exec sleep 30");
    let wrong_start = read_proc_start_time(child.id()).map(|t| t + 1);
    store.put_runtime(&record_for("recycled", &child, wrong_start)).unwrap();

    let report = stop_services(&membranes, Duration::from_millis(100)).await;

    assert!(report.graceful);
    assert!(report.terminated.is_empty());
    assert!(report.killed.is_empty());
    assert!(child.try_wait().unwrap().is_none(), "unrelated process was signalled");

    child.kill().unwrap();
    child.wait().unwrap();
}
