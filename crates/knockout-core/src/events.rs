//! Named events pushed to a session audience or to a single identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{IdentityId, QuestionId, RoundId, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerInfo {
    pub id: IdentityId,
    pub display_name: String,
}

/// Why an identity receives a spectator notice instead of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectatorReason {
    Eliminated,
}

/// Every server-originated event. Serialized as `{"method": .., "params": ..}`
/// so the transport only adds its own envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    MembershipUpdate { count: u32, min: u32, max: u32 },

    #[serde(rename_all = "camelCase")]
    CountdownStarted {
        delay_ms: u64,
        target_start_time: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    SessionStarted {
        session_id: SessionId,
        join_code: String,
    },

    /// Sent to eligible players only.
    #[serde(rename_all = "camelCase")]
    QuestionDispatched {
        session_id: SessionId,
        round_id: RoundId,
        question_id: QuestionId,
        statement: String,
        options: Vec<String>,
        category: String,
        time_budget_ms: u64,
        /// Equal to the budget on dispatch, recomputed on reconnect.
        remaining_ms: u64,
    },

    /// Sent to eliminated players in place of the question.
    #[serde(rename_all = "camelCase")]
    Spectating {
        session_id: SessionId,
        round_id: RoundId,
        reason: SpectatorReason,
    },

    /// Current standing of one identity, resent on reconnect.
    #[serde(rename_all = "camelCase")]
    PlayerStatus {
        session_id: SessionId,
        eliminated: bool,
        score: u32,
    },

    #[serde(rename_all = "camelCase")]
    AnswerProgress { round_id: RoundId, answered_count: u32 },

    #[serde(rename_all = "camelCase")]
    RoundSummary {
        round_id: RoundId,
        correct_option_index: u32,
        eliminated_identities: Vec<IdentityId>,
        eligible_count: u32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        winner: Option<WinnerInfo>,
    },

    #[serde(rename_all = "camelCase")]
    SessionFinished {
        session_id: SessionId,
        winner: Option<WinnerInfo>,
    },

    #[serde(rename_all = "camelCase")]
    CapacityExceeded { max: u32 },

    #[serde(rename_all = "camelCase")]
    NoQuestionsAvailable { message: String },

    /// The connection was replaced by a newer one for the same identity.
    Superseded,
}

impl ServerEvent {
    pub fn method(&self) -> &'static str {
        match self {
            Self::MembershipUpdate { .. } => "membership_update",
            Self::CountdownStarted { .. } => "countdown_started",
            Self::SessionStarted { .. } => "session_started",
            Self::QuestionDispatched { .. } => "question_dispatched",
            Self::Spectating { .. } => "spectating",
            Self::PlayerStatus { .. } => "player_status",
            Self::AnswerProgress { .. } => "answer_progress",
            Self::RoundSummary { .. } => "round_summary",
            Self::SessionFinished { .. } => "session_finished",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::NoQuestionsAvailable { .. } => "no_questions_available",
            Self::Superseded => "superseded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_update_wire_shape() {
        let ev = ServerEvent::MembershipUpdate {
            count: 2,
            min: 2,
            max: 10,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["method"], "membership_update");
        assert_eq!(v["params"]["count"], 2);
        assert_eq!(v["params"]["max"], 10);
    }

    #[test]
    fn method_matches_serde_tag() {
        let events = vec![
            ServerEvent::CountdownStarted {
                delay_ms: 15_000,
                target_start_time: Utc::now(),
            },
            ServerEvent::AnswerProgress {
                round_id: RoundId(3),
                answered_count: 1,
            },
            ServerEvent::SessionFinished {
                session_id: SessionId(1),
                winner: None,
            },
            ServerEvent::NoQuestionsAvailable {
                message: "empty".into(),
            },
            ServerEvent::Superseded,
        ];
        for ev in events {
            let v = serde_json::to_value(&ev).unwrap();
            assert_eq!(v["method"], ev.method());
        }
    }

    #[test]
    fn round_summary_omits_absent_winner() {
        let ev = ServerEvent::RoundSummary {
            round_id: RoundId(1),
            correct_option_index: 2,
            eliminated_identities: vec![IdentityId::new("p2")],
            eligible_count: 2,
            winner: None,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["params"]["correctOptionIndex"], 2);
        assert_eq!(v["params"]["eliminatedIdentities"][0], "p2");
        assert!(v["params"].get("winner").is_none());
    }

    #[test]
    fn countdown_target_is_camel_case() {
        let ev = ServerEvent::CountdownStarted {
            delay_ms: 10,
            target_start_time: Utc::now(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert!(v["params"].get("targetStartTime").is_some());
        assert_eq!(v["params"]["delayMs"], 10);
    }
}
