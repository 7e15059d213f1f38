//! Turn phases, failure accounting, and stop conditions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::types::{OutcomeStatus, StopReason};

/// Where a turn currently is. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    BuildingContext,
    AwaitingPlanner,
    Validating,
    Executing,
    Recording,
    Stopped,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self == Phase::Stopped {
            return false;
        }
        if next == Phase::Stopped {
            return true;
        }
        matches!(
            (self, next),
            (Phase::BuildingContext, Phase::AwaitingPlanner)
                | (Phase::AwaitingPlanner, Phase::Validating | Phase::Recording)
                | (Phase::Validating, Phase::Executing | Phase::Recording)
                | (Phase::Executing, Phase::Recording)
                | (Phase::Recording, Phase::BuildingContext)
        )
    }
}

/// Episode-level stop thresholds (`[episode]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeLimits {
    pub max_consecutive_failures: u32,
    /// 0 means unlimited.
    pub max_turns: u64,
    /// Whether rejected submissions count toward the failure threshold.
    pub count_validation_failures: bool,
}

impl Default for EpisodeLimits {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            max_turns: 0,
            count_validation_failures: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeState {
    pub consecutive_failures: u32,
    pub total_turns: u64,
    pub cancelled: bool,
}

impl EpisodeState {
    /// Account for one recorded turn.
    pub fn record(&mut self, status: OutcomeStatus, limits: &EpisodeLimits) {
        self.total_turns += 1;
        match status {
            OutcomeStatus::Success => self.consecutive_failures = 0,
            OutcomeStatus::ValidationFailure if !limits.count_validation_failures => {}
            OutcomeStatus::Cancelled => {
                self.consecutive_failures += 1;
                self.cancelled = true;
            }
            _ => self.consecutive_failures += 1,
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// First applicable stop condition, if any.
    pub fn stop_reason(&self, limits: &EpisodeLimits, environment_finished: bool) -> Option<StopReason> {
        if self.cancelled {
            return Some(StopReason::Cancelled);
        }
        if self.consecutive_failures >= limits.max_consecutive_failures {
            return Some(StopReason::ConsecutiveFailures {
                count: self.consecutive_failures,
                threshold: limits.max_consecutive_failures,
            });
        }
        if environment_finished {
            return Some(StopReason::EnvironmentFinished);
        }
        if limits.max_turns > 0 && self.total_turns >= limits.max_turns {
            return Some(StopReason::TurnLimit {
                max_turns: limits.max_turns,
            });
        }
        None
    }
}

/// Cooperative cancellation flag shared with the sandbox.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(threshold: u32) -> EpisodeLimits {
        EpisodeLimits {
            max_consecutive_failures: threshold,
            ..EpisodeLimits::default()
        }
    }

    /// Verifies the legal transition table.
    #[test]
    fn transitions() {
        assert!(Phase::BuildingContext.can_transition_to(Phase::AwaitingPlanner));
        assert!(Phase::AwaitingPlanner.can_transition_to(Phase::Recording));
        assert!(Phase::Validating.can_transition_to(Phase::Executing));
        assert!(Phase::Executing.can_transition_to(Phase::Stopped));
        assert!(Phase::Recording.can_transition_to(Phase::BuildingContext));
        assert!(!Phase::BuildingContext.can_transition_to(Phase::Executing));
        assert!(!Phase::Executing.can_transition_to(Phase::Validating));
        assert!(!Phase::Stopped.can_transition_to(Phase::BuildingContext));
    }

    /// Verifies failures accumulate and a success resets the count.
    #[test]
    fn failures_reset_on_success() {
        let limits = limits(3);
        let mut state = EpisodeState::default();
        state.record(OutcomeStatus::ExecutionFault, &limits);
        state.record(OutcomeStatus::ParseFailure, &limits);
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.stop_reason(&limits, false), None);
        state.record(OutcomeStatus::Success, &limits);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.total_turns, 3);
    }

    /// Verifies reaching the threshold aborts.
    #[test]
    fn threshold_aborts() {
        let limits = limits(2);
        let mut state = EpisodeState::default();
        state.record(OutcomeStatus::ExecutionTimeout, &limits);
        state.record(OutcomeStatus::ValidationFailure, &limits);
        assert_eq!(
            state.stop_reason(&limits, true),
            Some(StopReason::ConsecutiveFailures {
                count: 2,
                threshold: 2
            })
        );
    }

    /// Verifies validation failures can be excluded from the count.
    #[test]
    fn validation_failures_optionally_ignored() {
        let limits = EpisodeLimits {
            count_validation_failures: false,
            ..limits(1)
        };
        let mut state = EpisodeState::default();
        state.record(OutcomeStatus::ValidationFailure, &limits);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.stop_reason(&limits, false), None);
    }

    /// Verifies stop precedence: cancellation, failures, finish, turn limit.
    #[test]
    fn stop_precedence() {
        let limits = EpisodeLimits {
            max_turns: 1,
            ..limits(5)
        };
        let mut state = EpisodeState::default();
        state.record(OutcomeStatus::Success, &limits);
        assert_eq!(
            state.stop_reason(&limits, true),
            Some(StopReason::EnvironmentFinished)
        );
        assert_eq!(
            state.stop_reason(&limits, false),
            Some(StopReason::TurnLimit { max_turns: 1 })
        );
        state.mark_cancelled();
        assert_eq!(state.stop_reason(&limits, true), Some(StopReason::Cancelled));
    }

    /// Verifies clones of a token observe cancellation.
    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
