//! Process launch, isolation profiles and liveness probes.
//!
//! Services are launched as plain child processes. Isolation is erected in a
//! child created by `clone(2)` (see [`spawner`]): it starts inside the
//! namespaces selected by its vertex's [`IsolationProfile`], joins its
//! membrane's cgroup and drops every bounding-set capability it was not
//! granted.

pub mod capability;
pub mod spawner;

use nix::sched::CloneFlags;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use spawner::{IsolationOutcome, LaunchSpec, Launched, spawn};

/// Process errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The process could not be started at all.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// A capability name is not a known Linux capability.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),
}

/// Which namespaces a launched process is moved into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IsolationProfile {
    /// Private process tree.
    pub pid: bool,
    /// Private network stack.
    pub net: bool,
    /// Private mount table.
    pub mount: bool,
    /// Private hostname.
    pub uts: bool,
    /// Private System V IPC.
    pub ipc: bool,
}

impl IsolationProfile {
    /// All five boundaries (lightweight vertices).
    pub const FULL: Self = Self {
        pid: true,
        net: true,
        mount: true,
        uts: true,
        ipc: true,
    };

    /// Shares the host network and process view (heavyweight vertices).
    pub const PARTIAL: Self = Self {
        pid: false,
        net: false,
        mount: true,
        uts: true,
        ipc: true,
    };

    /// Only a private mount table; debug tooling observes the host.
    pub const OBSERVATIONAL: Self = Self {
        pid: false,
        net: false,
        mount: true,
        uts: false,
        ipc: false,
    };

    /// No boundaries.
    pub const NONE: Self = Self {
        pid: false,
        net: false,
        mount: false,
        uts: false,
        ipc: false,
    };

    /// `true` if no namespace is requested.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !(self.pid || self.net || self.mount || self.uts || self.ipc)
    }

    /// Short names of the requested namespaces, in clone flag order.
    #[must_use]
    pub fn namespaces(&self) -> Vec<&'static str> {
        [
            (self.pid, "pid"),
            (self.net, "net"),
            (self.mount, "mount"),
            (self.uts, "uts"),
            (self.ipc, "ipc"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }

    /// The `clone(2)` namespace flags for this profile.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        flags
    }
}

/// Read the start time (field 22) from `/proc/{pid}/stat`.
///
/// Used together with the PID to identify a process: the kernel may recycle
/// a PID after the original process exits. Returns `None` if the entry is
/// gone or cannot be parsed.
#[must_use]
pub fn read_proc_start_time(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;

    // comm (field 2) may contain spaces and parens; split after the last ')'.
    let after_comm = contents.rsplit_once(')')?.1;

    // Remaining tokens start at field 3, so field 22 is index 19.
    let tokens: Vec<&str> = after_comm.split_whitespace().collect();
    tokens.get(19)?.parse::<u64>().ok()
}

/// Read the state letter (field 3) from `/proc/{pid}/stat`.
fn read_proc_state(pid: u32) -> Option<char> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    contents.rsplit_once(')')?.1.split_whitespace().next()?.chars().next()
}

/// Returns `true` if `pid` exists and is not a zombie.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 || kill(Pid::from_raw(raw), None).is_err() {
        return false;
    }
    !matches!(read_proc_state(pid), Some('Z' | 'X'))
}

/// Returns `true` if `pid` is alive and still the process first seen with
/// `expected_start` (when known).
#[must_use]
pub fn is_same_process(pid: u32, expected_start: Option<u64>) -> bool {
    if !is_alive(pid) {
        return false;
    }
    match expected_start {
        Some(expected) => read_proc_start_time(pid) == Some(expected),
        None => true,
    }
}

/// Sends `signal` to `pid` after checking the process identity.
///
/// Returns `true` if the signal was delivered. A recycled PID (start time
/// mismatch) is never signalled.
pub fn signal_process(pid: u32, expected_start: Option<u64>, signal: Signal) -> bool {
    if !is_same_process(pid, expected_start) {
        return false;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(e) => {
            warn!(pid, ?signal, error = %e, "failed to signal process");
            false
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_map_to_clone_flags() {
        let full = IsolationProfile::FULL.clone_flags();
        assert!(full.contains(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNET));
        assert!(full.contains(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS));
        assert!(full.contains(CloneFlags::CLONE_NEWIPC));

        let partial = IsolationProfile::PARTIAL.clone_flags();
        assert!(!partial.contains(CloneFlags::CLONE_NEWNET));
        assert!(!partial.contains(CloneFlags::CLONE_NEWPID));

        assert_eq!(IsolationProfile::OBSERVATIONAL.namespaces(), vec!["mount"]);
        assert!(IsolationProfile::NONE.is_empty());
        assert!(IsolationProfile::NONE.clone_flags().is_empty());
    }

    #[test]
    fn namespaces_follow_flag_order() {
        assert_eq!(
            IsolationProfile::FULL.namespaces(),
            vec!["pid", "net", "mount", "uts", "ipc"]
        );
        assert_eq!(IsolationProfile::PARTIAL.namespaces(), vec!["mount", "uts", "ipc"]);
        assert!(IsolationProfile::NONE.namespaces().is_empty());
    }

    #[test]
    fn current_process_is_alive() {
        let me = std::process::id();
        assert!(is_alive(me));
        let start = read_proc_start_time(me);
        assert!(start.is_some());
        assert!(is_same_process(me, start));
        assert!(!is_same_process(me, start.map(|s| s + 1)));
    }

    #[test]
    fn invalid_pids_are_not_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }
}
