//! Boot phases and the boot state record.

use std::fmt;

use chrono::{DateTime, Utc};
use octant_core::Chirality;
use serde::Serialize;
use thiserror::Error;

/// The five boot phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Phase {
    /// Virtual filesystems, kernel modules, mode, entropy.
    Hydrogen = 1,
    /// Isolation tiers, state directory, hostname, timezone.
    Helium = 2,
    /// Core user services.
    Carbon = 3,
    /// Remaining declared services.
    Oxygen = 4,
    /// Boot summary.
    Iron = 5,
}

impl Phase {
    /// All phases in order.
    pub const ALL: [Self; 5] = [
        Self::Hydrogen,
        Self::Helium,
        Self::Carbon,
        Self::Oxygen,
        Self::Iron,
    ];

    /// Phase number, 1-5.
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Phase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hydrogen => "Hydrogen",
            Self::Helium => "Helium",
            Self::Carbon => "Carbon",
            Self::Oxygen => "Oxygen",
            Self::Iron => "Iron",
        }
    }

    /// The phase after this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Hydrogen => Some(Self::Helium),
            Self::Helium => Some(Self::Carbon),
            Self::Carbon => Some(Self::Oxygen),
            Self::Oxygen => Some(Self::Iron),
            Self::Iron => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.name())
    }
}

/// Rejected phase transition.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("cannot move from phase {from} to phase {to}")]
pub struct PhaseError {
    /// Current phase.
    pub from: Phase,
    /// Requested phase.
    pub to: Phase,
}

/// Where boot is, and the facts fixed when it started.
///
/// The phase only moves forward one step at a time; the mode and start time
/// never change once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootState {
    phase: Phase,
    chirality: Chirality,
    started_at: DateTime<Utc>,
}

impl BootState {
    /// Boot state at phase 1, starting now.
    #[must_use]
    pub fn new(chirality: Chirality) -> Self {
        Self {
            phase: Phase::Hydrogen,
            chirality,
            started_at: Utc::now(),
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Mode read at boot.
    #[must_use]
    pub const fn chirality(&self) -> Chirality {
        self.chirality
    }

    /// When phase 1 started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Moves to `to`, which must be the phase right after the current one.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError`] for any other target.
    pub fn advance(&mut self, to: Phase) -> Result<(), PhaseError> {
        if self.phase.next() != Some(to) {
            return Err(PhaseError {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_numbered_in_order() {
        let numbers: Vec<_> = Phase::ALL.iter().map(|p| p.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(Phase::Carbon.to_string(), "3 (Carbon)");
    }

    #[test]
    fn advance_walks_every_phase() {
        let mut state = BootState::new(Chirality::Production);
        for phase in &Phase::ALL[1..] {
            state.advance(*phase).unwrap();
            assert_eq!(state.phase(), *phase);
        }
        assert_eq!(state.chirality(), Chirality::Production);
    }

    #[test]
    fn advance_rejects_skips_repeats_and_regressions() {
        let mut state = BootState::new(Chirality::Development);
        assert!(state.advance(Phase::Carbon).is_err());
        assert!(state.advance(Phase::Hydrogen).is_err());

        state.advance(Phase::Helium).unwrap();
        let err = state.advance(Phase::Hydrogen).unwrap_err();
        assert_eq!(
            err,
            PhaseError {
                from: Phase::Helium,
                to: Phase::Hydrogen
            }
        );
        assert_eq!(state.phase(), Phase::Helium);
    }

    #[test]
    fn nothing_after_iron() {
        let mut state = BootState::new(Chirality::Production);
        for phase in &Phase::ALL[1..] {
            state.advance(*phase).unwrap();
        }
        assert_eq!(Phase::Iron.next(), None);
        assert!(state.advance(Phase::Iron).is_err());
    }
}
