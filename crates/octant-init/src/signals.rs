//! Signal handling for process 1.
//!
//! | Signal  | Action    |
//! |---------|-----------|
//! | SIGTERM | reboot    |
//! | SIGUSR1 | halt      |
//! | SIGUSR2 | power off |
//! | SIGINT  | ignored   |
//!
//! Handlers are registered before phase 1; a signal that arrives while boot
//! is still running is held until boot finishes.

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::info;

use crate::platform::TerminalAction;

/// Registered shutdown signal streams.
#[derive(Debug)]
pub struct ShutdownSignals {
    terminate: Signal,
    user1: Signal,
    user2: Signal,
    interrupt: Signal,
}

impl ShutdownSignals {
    /// Registers all handlers. Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a handler cannot be registered.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            user1: signal(SignalKind::user_defined1())?,
            user2: signal(SignalKind::user_defined2())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Waits for the next signal that requests a terminal action.
    pub async fn next_action(&mut self) -> TerminalAction {
        loop {
            tokio::select! {
                _ = self.terminate.recv() => {
                    info!("received SIGTERM");
                    return TerminalAction::Reboot;
                }
                _ = self.user1.recv() => {
                    info!("received SIGUSR1");
                    return TerminalAction::Halt;
                }
                _ = self.user2.recv() => {
                    info!("received SIGUSR2");
                    return TerminalAction::PowerOff;
                }
                _ = self.interrupt.recv() => {
                    info!("received SIGINT, ignored");
                }
            }
        }
    }
}
