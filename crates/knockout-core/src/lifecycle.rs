//! Lobby phase machine for one session: waiting → countdown → running → finished.
//!
//! Pure and deterministic; the runtime owns the timers and feeds the
//! outcomes back in. All time values are passed in as parameters.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum LobbyPhase {
    Waiting,
    /// A start timer is pending.
    Countdown { target: DateTime<Utc> },
    Running,
    Finished,
}

/// What the caller must do after a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumDecision {
    /// Arm a start timer and broadcast `countdown_started`.
    ScheduleCountdown {
        delay: Duration,
        target: DateTime<Utc>,
    },
    NoChange,
}

/// Outcome of re-validating quorum when the countdown fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    /// Quorum still holds; go ahead with the start.
    Start,
    /// Membership dropped below the minimum; back to waiting.
    Revert { count: u32 },
    /// The countdown was already consumed or the session moved on.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct LobbyTracker {
    min_players: u32,
    start_delay: Duration,
    phase: LobbyPhase,
}

impl LobbyTracker {
    pub fn new(min_players: u32, start_delay: Duration) -> Self {
        Self {
            min_players,
            start_delay,
            phase: LobbyPhase::Waiting,
        }
    }

    pub fn phase(&self) -> LobbyPhase {
        self.phase
    }

    pub fn countdown_pending(&self) -> bool {
        matches!(self.phase, LobbyPhase::Countdown { .. })
    }

    /// Membership changed to `count` members at `now`.
    ///
    /// Reaching quorum with no countdown pending schedules exactly one;
    /// repeated quorum events while one is pending are no-ops. Dropping
    /// below quorum does not cancel the timer; the fire-time check does.
    pub fn on_membership(&mut self, count: u32, now: DateTime<Utc>) -> QuorumDecision {
        if self.phase != LobbyPhase::Waiting || count < self.min_players {
            return QuorumDecision::NoChange;
        }
        let target = now
            + ChronoDuration::from_std(self.start_delay).unwrap_or_else(|_| ChronoDuration::zero());
        self.phase = LobbyPhase::Countdown { target };
        QuorumDecision::ScheduleCountdown {
            delay: self.start_delay,
            target,
        }
    }

    /// The start timer fired with `count` live members.
    pub fn on_countdown_fired(&mut self, count: u32) -> CountdownOutcome {
        if !self.countdown_pending() {
            return CountdownOutcome::Ignore;
        }
        if count < self.min_players {
            self.phase = LobbyPhase::Waiting;
            return CountdownOutcome::Revert { count };
        }
        CountdownOutcome::Start
    }

    /// The start could not go through (e.g. empty question pool, lost a
    /// store race). Returns to waiting so a later quorum can retry.
    pub fn on_start_aborted(&mut self) {
        if self.countdown_pending() {
            self.phase = LobbyPhase::Waiting;
        }
    }

    /// The durable waiting → running transition succeeded.
    pub fn on_started(&mut self) -> bool {
        if self.countdown_pending() {
            self.phase = LobbyPhase::Running;
            true
        } else {
            false
        }
    }

    pub fn on_finished(&mut self) -> bool {
        if self.phase == LobbyPhase::Running {
            self.phase = LobbyPhase::Finished;
            true
        } else {
            false
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
