//! Shared init state.
//!
//! One handle is built before phase 1 and shared by the boot sequencer, the
//! supervision task, the signal task and the shutdown path.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use octant_core::MembraneController;
use octant_core::config::ConfigStore;
use tokio_util::sync::CancellationToken;

use crate::boot::{BootState, Phase, PhaseError};
use crate::platform::Platform;

/// Shared init state.
pub type SharedState = Arc<InitStateHandle>;

/// Handle to init state with interior mutability.
pub struct InitStateHandle {
    boot: RwLock<BootState>,
    config: Arc<ConfigStore>,
    membranes: Arc<MembraneController>,
    platform: Arc<dyn Platform>,
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    /// Cancelled when shutdown is requested; stops background tasks.
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

impl InitStateHandle {
    /// Creates the handle with boot at phase 1 in the configured mode.
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        membranes: Arc<MembraneController>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let boot = BootState::new(config.config().boot.mode);
        Self {
            started_at: boot.started_at(),
            boot: RwLock::new(boot),
            config,
            membranes,
            platform,
            shutdown: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Node configuration.
    #[must_use]
    pub const fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Membrane controller.
    #[must_use]
    pub const fn membranes(&self) -> &Arc<MembraneController> {
        &self.membranes
    }

    /// OS actions.
    #[must_use]
    pub const fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Snapshot of the boot state.
    #[must_use]
    pub fn boot_state(&self) -> BootState {
        *self.boot.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advances boot to `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError`] unless `phase` directly follows the current one.
    pub fn advance(&self, phase: Phase) -> Result<(), PhaseError> {
        self.boot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .advance(phase)
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown and cancel background tasks.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Token cancelled by [`InitStateHandle::request_shutdown`].
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// When init started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

impl fmt::Debug for InitStateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitStateHandle")
            .field("boot", &self.boot_state())
            .field("shutdown", &self.is_shutdown_requested())
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
