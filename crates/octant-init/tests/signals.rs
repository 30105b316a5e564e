//! Signal Mapping Tests
//!
//! Raises signals at the test process after the handlers are registered and
//! checks the terminal action each one selects. SIGINT must be swallowed.

use nix::sys::signal::{Signal, raise};
use octant_init::platform::TerminalAction;
use octant_init::signals::ShutdownSignals;

#[tokio::test]
async fn signals_map_to_terminal_actions() {
    let mut signals = ShutdownSignals::install().unwrap();

    raise(Signal::SIGINT).unwrap();
    raise(Signal::SIGUSR2).unwrap();
    assert_eq!(signals.next_action().await, TerminalAction::PowerOff);

    raise(Signal::SIGUSR1).unwrap();
    assert_eq!(signals.next_action().await, TerminalAction::Halt);

    raise(Signal::SIGTERM).unwrap();
    assert_eq!(signals.next_action().await, TerminalAction::Reboot);
}
