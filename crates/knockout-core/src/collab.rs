//! Seams to the collaborators the game consumes: credential oracle,
//! question bank, user directory, and the durable session store.
//! Each is a trait so tests can inject fakes.

use chrono::{DateTime, Utc};

use crate::error::{KnockoutError, QuestionSourceError, StoreError};
use crate::rules::RoundResolution;
use crate::types::{
    AnswerRecord, Capacity, ConnectionId, Identity, IdentityId, Question, QuestionId, RoundId,
    Session, SessionId, SessionPlayer,
};

/// Maps an opaque credential to a verified identity.
pub trait CredentialVerifier: Send + Sync {
    /// Fails with `KnockoutError::AuthenticationFailure`.
    fn verify(&self, credential: &str) -> Result<Identity, KnockoutError>;
}

/// Question bank.
pub trait QuestionSource: Send + Sync {
    /// A random question whose id is not in `exclude`, or `None` when every
    /// remaining question is excluded.
    fn fetch_random(&self, exclude: &[QuestionId]) -> Result<Option<Question>, QuestionSourceError>;

    fn count_available(&self) -> Result<u64, QuestionSourceError>;

    fn fetch(&self, id: &QuestionId) -> Result<Option<Question>, QuestionSourceError>;
}

impl<T: QuestionSource + ?Sized> QuestionSource for &T {
    fn fetch_random(&self, exclude: &[QuestionId]) -> Result<Option<Question>, QuestionSourceError> {
        (**self).fetch_random(exclude)
    }

    fn count_available(&self) -> Result<u64, QuestionSourceError> {
        (**self).count_available()
    }

    fn fetch(&self, id: &QuestionId) -> Result<Option<Question>, QuestionSourceError> {
        (**self).fetch(id)
    }
}

/// User-directory name resolution.
pub trait NameDirectory: Send + Sync {
    fn resolve_display_name(&self, identity: &IdentityId) -> Option<String>;

    fn display_name_or_id(&self, identity: &IdentityId) -> String {
        self.resolve_display_name(identity)
            .unwrap_or_else(|| identity.to_string())
    }
}

/// Outcome of creating the open waiting session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitingSlot {
    Created(Session),
    /// Another caller won the race; this is its session.
    Existing(Session),
}

impl WaitingSlot {
    pub fn into_session(self) -> Session {
        match self {
            Self::Created(s) | Self::Existing(s) => s,
        }
    }
}

/// Durable record of sessions, rounds, players and answers.
///
/// Every mutation that affects round closing, elimination or status is
/// conditioned on the expected prior state and reports whether it took
/// effect, so redundant callers observe at-most-once effects.
pub trait SessionStore: Send {
    /// Create the single open waiting session. If the store already holds
    /// one, returns it as `Existing` instead of creating a duplicate.
    fn create_waiting(
        &mut self,
        join_code: &str,
        capacity: Capacity,
        now: DateTime<Utc>,
    ) -> Result<WaitingSlot, StoreError>;

    fn find_open_waiting(&self) -> Result<Option<Session>, StoreError>;

    fn find_running_for_identity(&self, identity: &IdentityId) -> Result<Option<Session>, StoreError>;

    fn load_session(&self, id: SessionId) -> Result<Session, StoreError>;

    fn list_running(&self) -> Result<Vec<SessionId>, StoreError>;

    /// waiting → running with `roster` as the authoritative player set.
    fn start_session(
        &mut self,
        id: SessionId,
        roster: &[SessionPlayer],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Open a new round. `None` when the session is not running or a round
    /// is still open.
    fn append_round(
        &mut self,
        id: SessionId,
        question: &Question,
        started_at: DateTime<Utc>,
    ) -> Result<Option<RoundId>, StoreError>;

    /// First answer per (identity, round) wins; later ones return `false`.
    fn record_answer(&mut self, round_id: RoundId, answer: &AnswerRecord) -> Result<bool, StoreError>;

    /// Close the round and apply `resolution` in one atomic step, only if
    /// the round is still open.
    fn close_round_if_open(
        &mut self,
        round_id: RoundId,
        ended_at: DateTime<Utc>,
        resolution: &RoundResolution,
    ) -> Result<bool, StoreError>;

    /// false → true only.
    fn mark_eliminated(&mut self, id: SessionId, identity: &IdentityId) -> Result<bool, StoreError>;

    fn set_connection(
        &mut self,
        id: SessionId,
        identity: &IdentityId,
        connection: Option<ConnectionId>,
    ) -> Result<bool, StoreError>;

    /// Drop every stored live-connection handle (they die with the process).
    fn clear_connections(&mut self) -> Result<usize, StoreError>;

    /// running → finished.
    fn finalize(
        &mut self,
        id: SessionId,
        winner: Option<&IdentityId>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
