//! Boot Scenario Tests
//!
//! Full five-phase boots against a temporary state directory and a fake
//! cgroup v2 hierarchy, with OS actions recorded instead of performed.
//!
//! # Tests
//!
//! - `production_boot_persists_state`: vertex table, mode, boot summary and
//!   tier groupings after a production boot with one core and one main
//!   service.
//! - `development_boot_starts_development_services`: development-polarity
//!   services launch and every vertex is active.
//! - `supervision_prunes_exited_services`: services that exit after boot lose
//!   their runtime record on the next supervision tick.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use octant_core::cgroup::CgroupTree;
use octant_core::config::ConfigStore;
use octant_core::store::{FsStateStore, StateStore, VertexState};
use octant_core::{Chirality, MembraneController, Vertex};
use octant_init::boot::{BootSequencer, Phase};
use octant_init::platform::{Platform, RecordingPlatform};
use octant_init::state::{InitStateHandle, SharedState};
use octant_init::supervise;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

struct Node {
    _dir: TempDir,
    state: SharedState,
    store: Arc<FsStateStore>,
    cgroup_root: std::path::PathBuf,
}

fn node(services: &str, mode: Chirality) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("run/octant");
    let cgroup_root = dir.path().join("cgroup");
    fs::create_dir_all(&cgroup_root).unwrap();
    fs::write(cgroup_root.join("cgroup.controllers"), "cpu memory pids\n").unwrap();

    let toml = format!(
        "[boot]\nmode = \"{mode}\"\nhostname = \"node-a\"\nrandom_seed = \"{seed}\"\n\n\
         [paths]\nstate_dir = \"{state}\"\ncgroup_root = \"{cgroup}\"\n\n{services}",
        seed = dir.path().join("seed").display(),
        state = state_dir.display(),
        cgroup = cgroup_root.display(),
    );
    let config = Arc::new(ConfigStore::from_toml(&toml).unwrap());

    let store = Arc::new(FsStateStore::new(&state_dir));
    let membranes = Arc::new(MembraneController::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        CgroupTree::with_root(&cgroup_root),
    ));
    let platform = Arc::new(RecordingPlatform::new()) as Arc<dyn Platform>;
    let state = Arc::new(InitStateHandle::new(config, membranes, platform));
    Node {
        _dir: dir,
        state,
        store,
        cgroup_root,
    }
}

const SERVICES: &str = r#"
[[services]]
name = "dns"
vertex = "V100"
phase = 3
command = "/bin/sh"
args = ["-c", "exit 0"]

[[services]]
name = "db"
vertex = "V110"
command = "/bin/sh"
args = ["-c", "exit 0"]
memory_hard = "1G"

[[services]]
name = "profiler"
vertex = "V111"
command = "/bin/sh"
args = ["-c", "exit 0"]
"#;

fn tier_exists(root: &Path, tier: &str) -> bool {
    root.join("octant.slice").join(format!("{tier}.slice")).is_dir()
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn production_boot_persists_state() {
    let node = node(SERVICES, Chirality::Production);
    let summary = BootSequencer::new(Arc::clone(&node.state)).run().unwrap();

    assert_eq!(node.state.boot_state().phase(), Phase::Iron);
    assert_eq!(summary.mode, Chirality::Production);
    assert_eq!(summary.services_launched, vec!["dns", "db"]);
    assert_eq!(node.store.boot_summary().unwrap(), Some(summary));
    assert_eq!(node.store.mode().unwrap(), Chirality::Production);

    let table = node.store.vertex_table().unwrap();
    for vertex in [Vertex::V000, Vertex::V010, Vertex::V100, Vertex::V110] {
        assert_eq!(table.get(vertex), VertexState::Active, "{vertex}");
    }
    for vertex in [Vertex::V001, Vertex::V011, Vertex::V101, Vertex::V111] {
        assert_eq!(table.get(vertex), VertexState::Inactive, "{vertex}");
    }

    for tier in ["antiproton", "antineutron", "photon", "darkphoton", "baryon", "antibaryon"] {
        assert!(tier_exists(&node.cgroup_root, tier), "{tier}");
    }
    let baryon = node.cgroup_root.join("octant.slice/baryon.slice");
    assert_eq!(fs::read_to_string(baryon.join("pids.max")).unwrap().trim(), "4096");

    let db = node.store.membrane("db").unwrap().unwrap();
    assert_eq!(db.memory_hard, 1 << 30);
    assert!(node.store.membrane("profiler").unwrap().is_none());
}

#[test]
fn development_boot_starts_development_services() {
    let node = node(SERVICES, Chirality::Development);
    let summary = BootSequencer::new(Arc::clone(&node.state)).run().unwrap();

    assert_eq!(summary.services_launched, vec!["dns", "db", "profiler"]);
    let table = node.store.vertex_table().unwrap();
    for vertex in Vertex::ALL {
        assert_eq!(table.get(vertex), VertexState::Active, "{vertex}");
    }
    let profiler = node.store.membrane("profiler").unwrap().unwrap();
    assert_eq!(profiler.tier, "antibaryon");
}

#[test]
fn supervision_prunes_exited_services() {
    let node = node(SERVICES, Chirality::Production);
    BootSequencer::new(Arc::clone(&node.state)).run().unwrap();
    assert_eq!(node.store.runtimes().unwrap().len(), 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut pruned = Vec::new();
    while pruned.len() < 2 && Instant::now() < deadline {
        let report = supervise::tick(node.state.membranes());
        pruned.extend(report.dead.into_iter().map(|r| r.name));
        std::thread::sleep(Duration::from_millis(50));
    }
    pruned.sort();
    assert_eq!(pruned, vec!["db", "dns"]);
    assert!(node.store.runtimes().unwrap().is_empty());
}
