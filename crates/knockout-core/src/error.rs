//! Error types shared by every knockout crate.

use thiserror::Error;

use crate::types::{RoundId, SessionId};

/// Failures of the durable session record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("corrupt store record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Backend failures may succeed on retry; a missing or corrupt record won't.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuestionSourceError {
    #[error("question source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid question {id}: {detail}")]
    Invalid { id: String, detail: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Game-level failures. Most are expected under normal races and are
/// dropped silently by the caller; see the variant docs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KnockoutError {
    /// Invalid or missing credential. The connection is refused.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    /// Waiting room is full. Joiner is notified, nothing changes.
    #[error("session {session_id} is full ({max} players)")]
    CapacityExceeded { session_id: SessionId, max: u32 },

    /// Answer for a round that is not the currently open one.
    #[error("answer for stale or mismatched round (open: {open:?})")]
    StaleOrMismatchedRound { open: Option<RoundId> },

    /// Second answer from the same identity in the same round.
    #[error("duplicate answer in round {0}")]
    DuplicateAnswer(RoundId),

    /// Identity is eliminated or not a player of the session.
    #[error("identity is not an eligible player")]
    NotEligible,

    /// No question is available when a round must start.
    #[error("question pool is empty")]
    EmptyQuestionPool,

    #[error(transparent)]
    QuestionSource(#[from] QuestionSourceError),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl KnockoutError {
    /// Expected outcomes of racing clients; dropped without a reply.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            Self::StaleOrMismatchedRound { .. } | Self::DuplicateAnswer(_) | Self::NotEligible
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_kinds() {
        assert!(KnockoutError::DuplicateAnswer(RoundId(1)).is_silent());
        assert!(KnockoutError::StaleOrMismatchedRound { open: None }.is_silent());
        assert!(KnockoutError::NotEligible.is_silent());
        assert!(!KnockoutError::EmptyQuestionPool.is_silent());
        assert!(!KnockoutError::Persistence(StoreError::Backend("io".into())).is_silent());
    }

    #[test]
    fn only_backend_errors_are_retryable() {
        assert!(StoreError::Backend("locked".into()).is_retryable());
        assert!(!StoreError::NotFound(SessionId(1)).is_retryable());
        assert!(!StoreError::Corrupt("bad ts".into()).is_retryable());
    }

    #[test]
    fn store_error_converts() {
        let err: KnockoutError = StoreError::NotFound(SessionId(7)).into();
        assert_eq!(err.to_string(), "session 7 not found");
    }
}
