//! Process spawning inside a membrane.
//!
//! An isolated child is created with `clone(2)` carrying the namespace flags
//! of the vertex's isolation profile, so the exec'd service is itself the
//! first process of a new PID namespace. Between `clone` and `exec` it:
//!
//! 1. joins the membrane's cgroup by writing `0` to its `cgroup.procs`
//! 2. points stdin at `/dev/null` and restores default signal handling
//! 3. sets the UTS hostname to the service name (when a UTS namespace exists)
//! 4. drops bounding-set capabilities that were not granted
//!
//! A failure on the child side travels back as an errno over a close-on-exec
//! pipe.
//!
//! Isolation needs root. When it is unavailable, or the isolated spawn is
//! refused by the kernel, the command is executed directly and the launch
//! reports [`IsolationOutcome::Degraded`]. A launch is never blocked on
//! isolation.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::fcntl::OFlag;
use nix::sched::{CloneCb, clone};
use nix::sys::signal::{SigHandler, SigSet, Signal, signal};
use nix::sys::wait::waitpid;
use nix::unistd::{execvp, geteuid, pipe2, sethostname, write};
use tracing::{debug, warn};

use super::capability::drop_bounding_set;
use super::{IsolationProfile, ProcessError, read_proc_start_time};

/// What to launch and how to contain it.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Service name (also the UTS hostname).
    pub name: String,
    /// Program to execute.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Namespaces to create.
    pub isolation: IsolationProfile,
    /// `cgroup.procs` of the membrane to join before exec.
    pub cgroup_procs: Option<PathBuf>,
    /// Bounding-set capabilities to keep; `None` leaves the set untouched.
    pub capabilities: Option<Vec<u32>>,
}

impl LaunchSpec {
    /// A spec with no isolation.
    pub fn direct(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Sets the program arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn wants_isolation(&self) -> bool {
        !self.isolation.is_empty() || self.cgroup_procs.is_some() || self.capabilities.is_some()
    }
}

/// Whether the launched process got the isolation it asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationOutcome {
    /// Every requested boundary was erected.
    Isolated,
    /// The process runs with reduced guarantees.
    Degraded {
        /// What was skipped.
        reason: String,
    },
}

impl IsolationOutcome {
    /// `true` for [`IsolationOutcome::Degraded`].
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// A launched process.
#[derive(Debug)]
pub struct Launched {
    /// The OS process ID.
    pub pid: u32,
    /// Kernel start time, for PID-reuse checks.
    pub start_time: Option<u64>,
    /// Isolation actually achieved.
    pub isolation: IsolationOutcome,
}

/// Spawns a process according to `spec`.
///
/// The child handle is dropped without waiting: the caller tracks the PID and
/// process 1 reaps it. Stdin is null; stdout and stderr go to the console.
///
/// # Errors
///
/// Returns `ProcessError::SpawnFailed` if the command cannot be executed even
/// without isolation.
pub fn spawn(spec: &LaunchSpec) -> Result<Launched, ProcessError> {
    if !spec.wants_isolation() {
        return spawn_direct(spec, IsolationOutcome::Isolated);
    }

    if !geteuid().is_root() {
        return spawn_direct(
            spec,
            IsolationOutcome::Degraded {
                reason: "namespaces and cgroup placement need root".to_string(),
            },
        );
    }

    // The membrane may have been recorded without a live grouping.
    let (procs, placement_note) = match &spec.cgroup_procs {
        Some(path) => match OpenOptions::new().write(true).open(path) {
            Ok(file) => (Some(file), None),
            Err(e) => (
                None,
                Some(format!("cgroup placement skipped ({}): {e}", path.display())),
            ),
        },
        None => (None, None),
    };

    match spawn_isolated(spec, procs) {
        Ok(mut launched) => {
            if let Some(reason) = placement_note {
                launched.isolation = IsolationOutcome::Degraded { reason };
            }
            Ok(launched)
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(ProcessError::SpawnFailed(format!("{}: {e}", spec.command)))
        },
        Err(e) => {
            warn!(
                service = %spec.name,
                error = %e,
                "isolated spawn refused, executing without isolation"
            );
            spawn_direct(
                spec,
                IsolationOutcome::Degraded {
                    reason: format!("isolation refused by kernel: {e}"),
                },
            )
        },
    }
}

fn base_command(spec: &LaunchSpec) -> Command {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    cmd
}

fn spawn_direct(spec: &LaunchSpec, outcome: IsolationOutcome) -> Result<Launched, ProcessError> {
    let child = base_command(spec)
        .spawn()
        .map_err(|e| ProcessError::SpawnFailed(format!("{}: {e}", spec.command)))?;
    let pid = child.id();
    debug!(service = %spec.name, pid, isolated = false, "spawned process");
    Ok(Launched {
        pid,
        start_time: read_proc_start_time(pid),
        isolation: outcome,
    })
}

/// Stack for the cloned child; it only runs until `execvp`.
const CHILD_STACK_SIZE: usize = 256 * 1024;

#[allow(unsafe_code)] // clone(2) requires unsafe
fn spawn_isolated(spec: &LaunchSpec, procs: Option<File>) -> std::io::Result<Launched> {
    // Everything the child needs is prepared here: it must not allocate
    // between clone and exec.
    let program = CString::new(spec.command.as_str())
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?;
    let argv = std::iter::once(spec.command.as_str())
        .chain(spec.args.iter().map(String::as_str))
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?;
    let hostname = spec.isolation.uts.then(|| spec.name.clone());
    let keep_caps = spec.capabilities.clone();
    let stdin = File::open("/dev/null")?;
    let (status_read, status_write) = pipe2(OFlag::O_CLOEXEC)?;
    let mut stack = vec![0u8; CHILD_STACK_SIZE];

    let child: CloneCb<'_> = Box::new(|| {
        let errno = match prepare_child(
            procs.as_ref(),
            &stdin,
            hostname.as_deref(),
            keep_caps.as_deref(),
        ) {
            Ok(()) => match execvp(&program, &argv) {
                Ok(never) => match never {},
                Err(errno) => errno as i32,
            },
            Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        let _ = write(&status_write, &errno.to_ne_bytes());
        // SAFETY: _exit(2) is async-signal-safe and never returns.
        unsafe { libc::_exit(127) }
    });

    // SAFETY: without CLONE_VM the child runs on its own copy of the address
    // space and only calls async-signal-safe functions before exec.
    let pid = unsafe {
        clone(
            child,
            &mut stack,
            spec.isolation.clone_flags(),
            Some(libc::SIGCHLD),
        )
    }?;
    drop(status_write);

    // The write end closes on a successful exec; anything read is an errno.
    let mut status = File::from(status_read);
    let mut report = [0u8; 4];
    let read = loop {
        match status.read(&mut report) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => break other?,
        }
    };
    if read != 0 {
        let _ = waitpid(pid, None);
        return Err(std::io::Error::from_raw_os_error(i32::from_ne_bytes(report)));
    }

    let pid = pid.as_raw().unsigned_abs();
    debug!(
        service = %spec.name,
        pid,
        namespaces = ?spec.isolation.namespaces(),
        "spawned isolated process"
    );
    Ok(Launched {
        pid,
        start_time: read_proc_start_time(pid),
        isolation: IsolationOutcome::Isolated,
    })
}

/// Runs in the cloned child, already inside its namespaces.
#[allow(unsafe_code)] // dup2 and signal disposition reset
fn prepare_child(
    procs: Option<&File>,
    stdin: &File,
    hostname: Option<&str>,
    keep_caps: Option<&[u32]>,
) -> std::io::Result<()> {
    if let Some(mut handle) = procs {
        handle.write_all(b"0")?;
    }
    // SAFETY: both descriptors are open for the duration of the call.
    if unsafe { libc::dup2(stdin.as_raw_fd(), libc::STDIN_FILENO) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    SigSet::empty().thread_set_mask()?;
    // SAFETY: restoring the default disposition installs no handler.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }?;
    if let Some(name) = hostname {
        sethostname(name)?;
    }
    if let Some(keep) = keep_caps {
        drop_bounding_set(keep)?;
    }
    Ok(())
}
