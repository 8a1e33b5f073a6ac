//! Phase State Machine
//!
//! ```text
//! Uninitiated ─▶ Announcement ─▶ Shuffling ─▶ BroadcastOutput ─▶ EquivocationCheck
//!                     │              │               │                  │
//!                     ▼              ▼               ▼                  ▼
//!                   Blame ◀──────────┴───────────────┴───── VerificationAndSubmission
//!                                                                       │
//!                                                                       ▼
//!                                                                   Completed
//! ```
//!
//! Only the round engine writes the phase. [`PhaseMonitor`] hands out a
//! cheap, clonable read handle for status displays on other threads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    Uninitiated = 0,
    Announcement = 1,
    Shuffling = 2,
    BroadcastOutput = 3,
    EquivocationCheck = 4,
    VerificationAndSubmission = 5,
    Blame = 6,
    Completed = 7,
}

impl Phase {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Phase::Uninitiated),
            1 => Some(Phase::Announcement),
            2 => Some(Phase::Shuffling),
            3 => Some(Phase::BroadcastOutput),
            4 => Some(Phase::EquivocationCheck),
            5 => Some(Phase::VerificationAndSubmission),
            6 => Some(Phase::Blame),
            7 => Some(Phase::Completed),
            _ => None,
        }
    }

    /// Blame and Completed end a round
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Blame | Phase::Completed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Uninitiated => "uninitiated",
            Phase::Announcement => "announcement",
            Phase::Shuffling => "shuffling",
            Phase::BroadcastOutput => "broadcast output",
            Phase::EquivocationCheck => "equivocation check",
            Phase::VerificationAndSubmission => "verification and submission",
            Phase::Blame => "blame",
            Phase::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Shared, lock-free view of the current phase.
///
/// Reads may be stale; the value carries no ordering guarantee relative
/// to round progress.
#[derive(Debug, Clone)]
pub struct PhaseMonitor {
    current: Arc<AtomicU8>,
}

impl PhaseMonitor {
    pub fn new() -> Self {
        Self {
            current: Arc::new(AtomicU8::new(Phase::Uninitiated as u8)),
        }
    }

    pub fn get(&self) -> Phase {
        Phase::from_u8(self.current.load(Ordering::Relaxed)).unwrap_or(Phase::Uninitiated)
    }

    pub(crate) fn set(&self, phase: Phase) {
        self.current.store(phase as u8, Ordering::Relaxed);
    }
}

impl Default for PhaseMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrips_through_u8() {
        for value in 0..=7u8 {
            let phase = Phase::from_u8(value).unwrap();
            assert_eq!(phase as u8, value);
        }
        assert_eq!(Phase::from_u8(8), None);
    }

    #[test]
    fn test_monitor_clones_share_state() {
        let monitor = PhaseMonitor::new();
        let reader = monitor.clone();
        assert_eq!(reader.get(), Phase::Uninitiated);

        monitor.set(Phase::Shuffling);
        assert_eq!(reader.get(), Phase::Shuffling);
    }

    #[test]
    fn test_monitor_is_readable_from_another_thread() {
        let monitor = PhaseMonitor::new();
        monitor.set(Phase::Blame);

        let reader = monitor.clone();
        let seen = std::thread::spawn(move || reader.get()).join().unwrap();
        assert_eq!(seen, Phase::Blame);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Blame.is_terminal());
        assert!(Phase::Completed.is_terminal());
        assert!(!Phase::EquivocationCheck.is_terminal());
    }
}
