//! OS-level actions taken by process 1.
//!
//! The boot sequencer and the shutdown path never call the kernel directly;
//! they go through [`Platform`]. [`LinuxPlatform`] is the real thing.
//! [`RecordingPlatform`] performs nothing and records every call; it backs
//! `--dry-run` and the tests.

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;

use nix::mount::{MsFlags, mount};
use nix::sys::reboot::{RebootMode, reboot};
use thiserror::Error;
use tracing::{debug, info};

/// Size of the persisted entropy seed.
pub const RANDOM_SEED_BYTES: usize = 512;

/// Shell spawned by the emergency fallback.
pub const EMERGENCY_SHELL: &str = "/bin/sh";

/// Platform errors.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// A filesystem or process operation failed.
    #[error("{action}: {source}")]
    Io {
        /// What was attempted.
        action: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A system call failed.
    #[error("{action}: {source}")]
    Os {
        /// What was attempted.
        action: String,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// A helper program exited unsuccessfully.
    #[error("{action}: exited with {status}")]
    Command {
        /// What was attempted.
        action: String,
        /// Exit status.
        status: ExitStatus,
    },

    /// An argument was rejected before reaching the OS.
    #[error("{0}")]
    Invalid(String),
}

impl PlatformError {
    fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            action: action.into(),
            source,
        }
    }

    fn os(action: impl Into<String>, source: nix::Error) -> Self {
        Self::Os {
            action: action.into(),
            source,
        }
    }
}

/// Result type for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// The last thing process 1 does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalAction {
    /// Restart the machine.
    Reboot,
    /// Stop the CPU, leave power on.
    Halt,
    /// Power the machine off.
    PowerOff,
}

impl fmt::Display for TerminalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reboot => "reboot",
            Self::Halt => "halt",
            Self::PowerOff => "power-off",
        })
    }
}

/// A filesystem to mount during phase 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Source device or pseudo name.
    pub source: &'static str,
    /// Mount point.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: &'static str,
    /// Mount flags.
    pub flags: MsFlags,
    /// Filesystem-specific options.
    pub data: Option<&'static str>,
    /// Boot cannot continue without it.
    pub required: bool,
}

impl MountSpec {
    /// The virtual filesystems every boot needs, with cgroup v2 at
    /// `cgroup_root`.
    #[must_use]
    pub fn defaults(cgroup_root: &Path) -> Vec<Self> {
        let hardened = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
        vec![
            Self {
                source: "proc",
                target: PathBuf::from("/proc"),
                fstype: "proc",
                flags: hardened,
                data: None,
                required: true,
            },
            Self {
                source: "sysfs",
                target: PathBuf::from("/sys"),
                fstype: "sysfs",
                flags: hardened,
                data: None,
                required: true,
            },
            Self {
                source: "devtmpfs",
                target: PathBuf::from("/dev"),
                fstype: "devtmpfs",
                flags: MsFlags::MS_NOSUID,
                data: Some("mode=0755"),
                required: false,
            },
            Self {
                source: "tmpfs",
                target: PathBuf::from("/run"),
                fstype: "tmpfs",
                flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                data: Some("mode=0755"),
                required: true,
            },
            Self {
                source: "cgroup2",
                target: cgroup_root.to_path_buf(),
                fstype: "cgroup2",
                flags: hardened,
                data: None,
                required: false,
            },
        ]
    }
}

/// OS-level actions used by boot and shutdown.
pub trait Platform: fmt::Debug + Send + Sync {
    /// `true` if this process is process 1.
    fn is_pid1(&self) -> bool;

    /// `true` if something is mounted at `target`.
    fn is_mounted(&self, target: &Path) -> bool;

    /// Mounts a filesystem, creating the mount point if needed.
    fn mount(&self, spec: &MountSpec) -> PlatformResult<()>;

    /// Loads a kernel module.
    fn load_module(&self, name: &str) -> PlatformResult<()>;

    /// Sets the hostname.
    fn set_hostname(&self, name: &str) -> PlatformResult<()>;

    /// Points `/etc/localtime` at a zoneinfo entry.
    fn set_timezone(&self, zone: &str) -> PlatformResult<()>;

    /// Mixes the persisted seed into the entropy pool.
    ///
    /// Returns `false` if there is no seed.
    fn reseed_entropy(&self, seed: &Path) -> PlatformResult<bool>;

    /// Saves fresh entropy for the next boot.
    fn save_entropy(&self, seed: &Path) -> PlatformResult<()>;

    /// Flushes filesystem buffers.
    fn sync(&self);

    /// Reboots, halts or powers off. Does not return on success.
    fn terminal_action(&self, action: TerminalAction) -> PlatformResult<()>;

    /// Runs an interactive shell on the console and waits for it.
    fn emergency_shell(&self) -> PlatformResult<ExitStatus>;
}

/// The real platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    /// A new handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Mount points listed in a `/proc/self/mountinfo` document.
fn mount_points(mountinfo: &str) -> impl Iterator<Item = &str> {
    // Field 5 is the mount point, relative to the process root.
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
}

fn valid_zone(zone: &str) -> bool {
    !zone.is_empty()
        && !zone.starts_with('/')
        && zone
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

impl Platform for LinuxPlatform {
    fn is_pid1(&self) -> bool {
        std::process::id() == 1
    }

    fn is_mounted(&self, target: &Path) -> bool {
        let Ok(mountinfo) = fs::read_to_string("/proc/self/mountinfo") else {
            return false;
        };
        let Some(target) = target.to_str() else {
            return false;
        };
        let mounted = mount_points(&mountinfo).any(|point| point == target);
        mounted
    }

    fn mount(&self, spec: &MountSpec) -> PlatformResult<()> {
        fs::create_dir_all(&spec.target).map_err(|e| {
            PlatformError::io(format!("creating mount point {}", spec.target.display()), e)
        })?;
        mount(
            Some(spec.source),
            &spec.target,
            Some(spec.fstype),
            spec.flags,
            spec.data,
        )
        .map_err(|e| {
            PlatformError::os(
                format!("mounting {} on {}", spec.fstype, spec.target.display()),
                e,
            )
        })
    }

    fn load_module(&self, name: &str) -> PlatformResult<()> {
        let action = format!("loading module {name}");
        let status = Command::new("modprobe")
            .arg("--")
            .arg(name)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| PlatformError::io(action.clone(), e))?;
        if status.success() {
            Ok(())
        } else {
            Err(PlatformError::Command { action, status })
        }
    }

    fn set_hostname(&self, name: &str) -> PlatformResult<()> {
        nix::unistd::sethostname(name)
            .map_err(|e| PlatformError::os(format!("setting hostname {name}"), e))
    }

    fn set_timezone(&self, zone: &str) -> PlatformResult<()> {
        if !valid_zone(zone) {
            return Err(PlatformError::Invalid(format!("invalid timezone '{zone}'")));
        }
        let zoneinfo = Path::new("/usr/share/zoneinfo").join(zone);
        if !zoneinfo.exists() {
            return Err(PlatformError::Invalid(format!(
                "timezone '{zone}' not found under /usr/share/zoneinfo"
            )));
        }
        let localtime = Path::new("/etc/localtime");
        match fs::remove_file(localtime) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(PlatformError::io("removing /etc/localtime", e)),
        }
        std::os::unix::fs::symlink(&zoneinfo, localtime)
            .map_err(|e| PlatformError::io("linking /etc/localtime", e))
    }

    fn reseed_entropy(&self, seed: &Path) -> PlatformResult<bool> {
        let data = match fs::read(seed) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(PlatformError::io(format!("reading {}", seed.display()), e)),
        };
        // Writing mixes the bytes in without crediting entropy.
        fs::OpenOptions::new()
            .write(true)
            .open("/dev/urandom")
            .and_then(|mut urandom| urandom.write_all(&data))
            .map_err(|e| PlatformError::io("writing /dev/urandom", e))?;
        debug!(bytes = data.len(), "entropy pool reseeded");
        Ok(true)
    }

    fn save_entropy(&self, seed: &Path) -> PlatformResult<()> {
        let mut buf = vec![0u8; RANDOM_SEED_BYTES];
        fs::File::open("/dev/urandom")
            .and_then(|mut urandom| urandom.read_exact(&mut buf))
            .map_err(|e| PlatformError::io("reading /dev/urandom", e))?;
        if let Some(parent) = seed.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PlatformError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(seed)
            .and_then(|mut file| file.write_all(&buf))
            .map_err(|e| PlatformError::io(format!("writing {}", seed.display()), e))
    }

    fn sync(&self) {
        nix::unistd::sync();
    }

    fn terminal_action(&self, action: TerminalAction) -> PlatformResult<()> {
        let mode = match action {
            TerminalAction::Reboot => RebootMode::RB_AUTOBOOT,
            TerminalAction::Halt => RebootMode::RB_HALT_SYSTEM,
            TerminalAction::PowerOff => RebootMode::RB_POWER_OFF,
        };
        info!(%action, "performing terminal action");
        match reboot(mode) {
            Ok(never) => match never {},
            Err(e) => Err(PlatformError::os(format!("{action}"), e)),
        }
    }

    fn emergency_shell(&self) -> PlatformResult<ExitStatus> {
        Command::new(EMERGENCY_SHELL)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| PlatformError::io(format!("running {EMERGENCY_SHELL}"), e))
    }
}

/// One call made against a [`RecordingPlatform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    /// `mount` (fstype, target).
    Mount(String, PathBuf),
    /// `load_module`.
    LoadModule(String),
    /// `set_hostname`.
    SetHostname(String),
    /// `set_timezone`.
    SetTimezone(String),
    /// `reseed_entropy`.
    ReseedEntropy(PathBuf),
    /// `save_entropy`.
    SaveEntropy(PathBuf),
    /// `sync`.
    Sync,
    /// `terminal_action`.
    Terminal(TerminalAction),
    /// `emergency_shell`.
    EmergencyShell,
}

/// A platform that changes nothing and records every call.
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    calls: Mutex<Vec<PlatformCall>>,
    mounted: Mutex<Vec<PathBuf>>,
    failing_modules: Vec<String>,
    failing_mounts: Vec<PathBuf>,
}

impl RecordingPlatform {
    /// A platform on which nothing is mounted yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats `targets` as already mounted.
    #[must_use]
    pub fn with_mounted<I: IntoIterator<Item = PathBuf>>(self, targets: I) -> Self {
        self.mounted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(targets);
        self
    }

    /// Makes `load_module` fail for these names.
    #[must_use]
    pub fn with_failing_modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_modules = names.into_iter().map(Into::into).collect();
        self
    }

    /// Makes `mount` fail for these targets.
    #[must_use]
    pub fn with_failing_mounts<I: IntoIterator<Item = PathBuf>>(mut self, targets: I) -> Self {
        self.failing_mounts = targets.into_iter().collect();
        self
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: PlatformCall) {
        debug!(?call, "platform call (recorded)");
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(call);
    }
}

impl Platform for RecordingPlatform {
    fn is_pid1(&self) -> bool {
        false
    }

    fn is_mounted(&self, target: &Path) -> bool {
        self.mounted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|m| m == target)
    }

    fn mount(&self, spec: &MountSpec) -> PlatformResult<()> {
        self.record(PlatformCall::Mount(spec.fstype.to_string(), spec.target.clone()));
        if self.failing_mounts.contains(&spec.target) {
            return Err(PlatformError::os(
                format!("mounting {} on {}", spec.fstype, spec.target.display()),
                nix::Error::EPERM,
            ));
        }
        self.mounted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(spec.target.clone());
        Ok(())
    }

    fn load_module(&self, name: &str) -> PlatformResult<()> {
        self.record(PlatformCall::LoadModule(name.to_string()));
        if self.failing_modules.iter().any(|m| m == name) {
            return Err(PlatformError::Invalid(format!("module {name} not found")));
        }
        Ok(())
    }

    fn set_hostname(&self, name: &str) -> PlatformResult<()> {
        self.record(PlatformCall::SetHostname(name.to_string()));
        Ok(())
    }

    fn set_timezone(&self, zone: &str) -> PlatformResult<()> {
        self.record(PlatformCall::SetTimezone(zone.to_string()));
        if valid_zone(zone) {
            Ok(())
        } else {
            Err(PlatformError::Invalid(format!("invalid timezone '{zone}'")))
        }
    }

    fn reseed_entropy(&self, seed: &Path) -> PlatformResult<bool> {
        self.record(PlatformCall::ReseedEntropy(seed.to_path_buf()));
        Ok(seed.exists())
    }

    fn save_entropy(&self, seed: &Path) -> PlatformResult<()> {
        self.record(PlatformCall::SaveEntropy(seed.to_path_buf()));
        Ok(())
    }

    fn sync(&self) {
        self.record(PlatformCall::Sync);
    }

    fn terminal_action(&self, action: TerminalAction) -> PlatformResult<()> {
        self.record(PlatformCall::Terminal(action));
        Ok(())
    }

    fn emergency_shell(&self) -> PlatformResult<ExitStatus> {
        self.record(PlatformCall::EmergencyShell);
        Command::new("true")
            .status()
            .map_err(|e| PlatformError::io("running true", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mountinfo_mount_points() {
        let mountinfo = "\
22 1 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
23 1 0:22 / /sys rw,nosuid,nodev,noexec,relatime shared:2 - sysfs sysfs rw
30 23 0:26 / /sys/fs/cgroup rw,nosuid,nodev,noexec,relatime shared:4 - cgroup2 cgroup2 rw
";
        let points: Vec<_> = mount_points(mountinfo).collect();
        assert_eq!(points, vec!["/proc", "/sys", "/sys/fs/cgroup"]);
    }

    #[test]
    fn default_mounts_cover_virtual_filesystems() {
        let mounts = MountSpec::defaults(Path::new("/sys/fs/cgroup"));
        let types: Vec<_> = mounts.iter().map(|m| m.fstype).collect();
        assert_eq!(types, vec!["proc", "sysfs", "devtmpfs", "tmpfs", "cgroup2"]);
        assert!(mounts.iter().find(|m| m.fstype == "proc").unwrap().required);
        assert!(!mounts.iter().find(|m| m.fstype == "cgroup2").unwrap().required);
    }

    #[test]
    fn zone_validation() {
        assert!(valid_zone("UTC"));
        assert!(valid_zone("Europe/Berlin"));
        assert!(!valid_zone("../etc/passwd"));
        assert!(!valid_zone("/etc/passwd"));
        assert!(!valid_zone(""));
        assert!(!valid_zone("Europe//Berlin"));
    }

    #[test]
    fn proc_is_mounted_here() {
        assert!(LinuxPlatform::new().is_mounted(Path::new("/proc")));
        assert!(!LinuxPlatform::new().is_mounted(Path::new("/definitely/not/mounted")));
    }

    #[test]
    fn recording_platform_tracks_mounts() {
        let platform = RecordingPlatform::new().with_mounted([PathBuf::from("/proc")]);
        assert!(platform.is_mounted(Path::new("/proc")));
        assert!(!platform.is_mounted(Path::new("/sys")));

        let sys = MountSpec::defaults(Path::new("/sys/fs/cgroup"))
            .into_iter()
            .find(|m| m.fstype == "sysfs")
            .unwrap();
        platform.mount(&sys).unwrap();
        assert!(platform.is_mounted(Path::new("/sys")));
        assert_eq!(
            platform.calls(),
            vec![PlatformCall::Mount("sysfs".to_string(), PathBuf::from("/sys"))]
        );
    }
}
