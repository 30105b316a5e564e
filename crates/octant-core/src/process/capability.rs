//! Linux capability names and bounding-set reduction.

use super::ProcessError;

/// Capability names indexed by their kernel number.
const CAPABILITIES: [&str; 41] = [
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// Resolves a capability name (`CAP_NET_RAW` or `net_raw`) to its number.
pub fn capability_number(name: &str) -> Result<u32, ProcessError> {
    let upper = name.trim().to_ascii_uppercase();
    let canonical = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    };
    CAPABILITIES
        .iter()
        .position(|c| *c == canonical)
        .and_then(|idx| u32::try_from(idx).ok())
        .ok_or_else(|| ProcessError::UnknownCapability(name.to_string()))
}

/// Resolves a list of names, failing on the first unknown one.
pub fn capability_numbers<S: AsRef<str>>(names: &[S]) -> Result<Vec<u32>, ProcessError> {
    names.iter().map(|n| capability_number(n.as_ref())).collect()
}

/// Drops every bounding-set capability not listed in `keep`.
///
/// Runs in the cloned child before exec, so it only issues `prctl` calls and never
/// allocates. Capabilities the running kernel does not know (`EINVAL`) end
/// the loop.
#[allow(unsafe_code)]
pub fn drop_bounding_set(keep: &[u32]) -> std::io::Result<()> {
    for cap in 0..CAPABILITIES.len() {
        let Ok(cap) = u32::try_from(cap) else {
            break;
        };
        if keep.contains(&cap) {
            continue;
        }
        // SAFETY: PR_CAPBSET_DROP takes a capability number and no pointers.
        let rc = unsafe {
            libc::prctl(
                libc::PR_CAPBSET_DROP,
                libc::c_ulong::from(cap),
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINVAL) {
                break;
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_names() {
        assert_eq!(capability_number("CAP_CHOWN").unwrap(), 0);
        assert_eq!(capability_number("CAP_NET_BIND_SERVICE").unwrap(), 10);
        assert_eq!(capability_number("sys_admin").unwrap(), 21);
        assert_eq!(capability_number("CAP_BPF").unwrap(), 39);
    }

    #[test]
    fn rejects_unknown_names() {
        let err = capability_number("CAP_TELEPORT").unwrap_err();
        assert!(matches!(err, ProcessError::UnknownCapability(n) if n == "CAP_TELEPORT"));
    }

    #[test]
    fn resolves_lists() {
        let caps = capability_numbers(&["CAP_SETUID", "CAP_SETGID"]).unwrap();
        assert_eq!(caps, vec![7, 6]);
        assert!(capability_numbers(&["CAP_SETUID", "bogus"]).is_err());
    }
}
