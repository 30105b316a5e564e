//! Emergency fallback after a fatal boot error.
//!
//! Process 1 must never exit, so the shell is respawned for as long as the
//! machine runs. Orphans re-parented to process 1 are reaped on every round.

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::platform::Platform;
use crate::supervise::reap_children;

/// Pause before respawning a shell that could not be started.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Reaps exited children, then runs one emergency shell.
///
/// Returns `true` if the shell ran, `false` if it could not be started.
pub fn shell_once(platform: &dyn Platform) -> bool {
    let reaped = reap_children();
    if !reaped.is_empty() {
        debug!(count = reaped.len(), "reaped orphaned children");
    }
    match platform.emergency_shell() {
        Ok(status) => {
            warn!(%status, "emergency shell exited, respawning");
            true
        },
        Err(e) => {
            error!(error = %e, "emergency shell could not be started");
            false
        },
    }
}

/// Drops to the emergency shell for good.
pub fn enter(platform: &dyn Platform, cause: &dyn std::error::Error) -> ! {
    error!(error = %cause, "init failed, entering emergency shell");
    loop {
        if !shell_once(platform) {
            std::thread::sleep(RESPAWN_BACKOFF);
        }
    }
}
