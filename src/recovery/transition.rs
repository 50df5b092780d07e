//! VM lifecycle state machine.
//!
//! | From    | Legal targets |
//! |---------|---------------|
//! | stopped | running |
//! | running | paused, halted, faulted, stopped |
//! | paused  | running, stopped, faulted |
//! | halted  | running, stopped, faulted |
//! | faulted | paused, stopped |
//!
//! Only edges in [`VmState::can_transition_to`] are legal. `Faulted` can only
//! be left through `Paused` (inspection) or `Stopped`, never straight back to
//! `Running`.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmState {
    Stopped,
    Running,
    Paused,
    Halted,
    Faulted,
}

impl VmState {
    /// The adjacency table.
    pub fn can_transition_to(self, to: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, to),
            (Stopped, Running)
                | (Running, Paused)
                | (Running, Halted)
                | (Running, Faulted)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Paused, Faulted)
                | (Halted, Running)
                | (Halted, Stopped)
                | (Halted, Faulted)
                | (Faulted, Paused)
                | (Faulted, Stopped)
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Halted => "halted",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

impl FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "stopped" => Self::Stopped,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "halted" => Self::Halted,
            "faulted" => Self::Faulted,
            other => return Err(format!("unknown VM state: {}", other)),
        })
    }
}

/// Accepted transitions kept for inspection.
pub const HISTORY_LIMIT: usize = 64;

/// Pre-transition hook; returning false vetoes the transition.
pub type TransitionGuard = Box<dyn Fn(VmState, VmState) -> bool + Send>;

/// Guarded lifecycle state holder.
pub struct SafeStateTransition {
    state: VmState,
    guards: Vec<TransitionGuard>,
    history: VecDeque<(VmState, VmState)>,
}

impl SafeStateTransition {
    pub fn new() -> Self {
        Self {
            state: VmState::Stopped,
            guards: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn add_guard(&mut self, guard: TransitionGuard) {
        self.guards.push(guard);
    }

    /// Move to `to` if the edge exists and no guard vetoes it.
    ///
    /// A rejected transition has no side effects.
    pub fn transition(&mut self, to: VmState) -> bool {
        let from = self.state;
        if !from.can_transition_to(to) {
            debug!("rejected illegal transition {} -> {}", from, to);
            return false;
        }
        if !self.guards.iter().all(|guard| guard(from, to)) {
            debug!("transition {} -> {} vetoed", from, to);
            return false;
        }
        info!("VM state {} -> {}", from, to);
        self.state = to;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back((from, to));
        true
    }

    /// Same as [`transition`](Self::transition) with a textual target.
    pub fn transition_str(&mut self, to: &str) -> bool {
        match to.parse() {
            Ok(state) => self.transition(state),
            Err(_) => false,
        }
    }

    /// The most recent accepted transitions, oldest first.
    pub fn history(&self) -> &VecDeque<(VmState, VmState)> {
        &self.history
    }
}

impl Default for SafeStateTransition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn faulted() -> SafeStateTransition {
        let mut sst = SafeStateTransition::new();
        assert!(sst.transition(VmState::Running));
        assert!(sst.transition(VmState::Faulted));
        sst
    }

    #[test]
    fn test_faulted_cannot_resume_directly() {
        let mut sst = faulted();
        assert!(!sst.transition_str("running"));
        assert_eq!(sst.state(), VmState::Faulted);
        assert!(sst.transition_str("paused"));
        assert_eq!(sst.state(), VmState::Paused);
    }

    #[test]
    fn test_stopped_only_starts() {
        let mut sst = SafeStateTransition::new();
        assert!(!sst.transition(VmState::Paused));
        assert!(!sst.transition(VmState::Halted));
        assert!(sst.transition(VmState::Running));
    }

    #[test]
    fn test_guard_vetoes_without_side_effects() {
        let mut sst = SafeStateTransition::new();
        sst.add_guard(Box::new(|_, to| to != VmState::Halted));
        sst.transition(VmState::Running);
        assert!(!sst.transition(VmState::Halted));
        assert_eq!(sst.state(), VmState::Running);
        assert_eq!(sst.history(), &[(VmState::Stopped, VmState::Running)]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sst = SafeStateTransition::new();
        for _ in 0..HISTORY_LIMIT {
            sst.transition(VmState::Running);
            sst.transition(VmState::Stopped);
        }
        assert_eq!(sst.history().len(), HISTORY_LIMIT);
        assert_eq!(sst.history().back(), Some(&(VmState::Running, VmState::Stopped)));
        assert_eq!(sst.history().front(), Some(&(VmState::Stopped, VmState::Running)));
    }

    #[test]
    fn test_unknown_state_string_rejected() {
        let mut sst = SafeStateTransition::new();
        assert!(!sst.transition_str("exploded"));
        assert_eq!("halted".parse::<VmState>(), Ok(VmState::Halted));
        assert_eq!(VmState::Faulted.to_string(), "faulted");
    }

    #[test]
    fn test_no_self_loops() {
        for s in [
            VmState::Stopped,
            VmState::Running,
            VmState::Paused,
            VmState::Halted,
            VmState::Faulted,
        ] {
            assert!(!s.can_transition_to(s));
        }
    }
}
