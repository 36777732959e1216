use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

// ─── Identifiers ──────────────────────────────────────────────────

/// Verified identity id, owned by the external credential oracle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(pub i64);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuestionId(pub String);

impl QuestionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-local handle of one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ─── Identity ─────────────────────────────────────────────────────

/// A verified identity as returned by the credential oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
}

// ─── Session status ───────────────────────────────────────────────

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Waiting,
    Running,
    Finished,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }

    /// Status only moves forward: waiting → running → finished.
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Running) | (Self::Running, Self::Finished)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            other => Err(StoreError::Corrupt(format!("unknown session status: {other}"))),
        }
    }
}

// ─── Questions ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: QuestionId,
    pub statement: String,
    pub options: Vec<String>,
    pub correct_option_index: u32,
    pub category: String,
}

// ─── Session record ───────────────────────────────────────────────

/// Last accepted answer of a player, kept on the player row for reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastAnswer {
    pub round_id: RoundId,
    pub chosen_option: u32,
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPlayer {
    pub identity: IdentityId,
    /// Live transport handle; `None` while disconnected or after a restart.
    pub connection: Option<ConnectionId>,
    pub eliminated: bool,
    pub score: u32,
    pub last_answer: Option<LastAnswer>,
}

impl SessionPlayer {
    pub fn new(identity: IdentityId, connection: Option<ConnectionId>) -> Self {
        Self {
            identity,
            connection,
            eliminated: false,
            score: 0,
            last_answer: None,
        }
    }

    pub fn is_eligible(&self) -> bool {
        !self.eliminated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub identity: IdentityId,
    pub chosen_option: u32,
    pub correct: bool,
    /// Server-measured latency from round start to receipt.
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub question_id: QuestionId,
    /// Correct option captured when the round was opened.
    pub correct_option: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub answers: Vec<AnswerRecord>,
}

impl Round {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn answer_of(&self, identity: &IdentityId) -> Option<&AnswerRecord> {
        self.answers.iter().find(|a| &a.identity == identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub join_code: String,
    pub status: SessionStatus,
    pub min_players: u32,
    pub max_players: u32,
    pub rounds: Vec<Round>,
    pub players: Vec<SessionPlayer>,
    pub winner: Option<IdentityId>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn player(&self, identity: &IdentityId) -> Option<&SessionPlayer> {
        self.players.iter().find(|p| &p.identity == identity)
    }

    pub fn player_mut(&mut self, identity: &IdentityId) -> Option<&mut SessionPlayer> {
        self.players.iter_mut().find(|p| &p.identity == identity)
    }

    pub fn eligible(&self) -> impl Iterator<Item = &SessionPlayer> {
        self.players.iter().filter(|p| p.is_eligible())
    }

    pub fn eligible_count(&self) -> usize {
        self.eligible().count()
    }

    /// The single open round, if any.
    pub fn open_round(&self) -> Option<&Round> {
        self.rounds.last().filter(|r| r.is_open())
    }

    pub fn open_round_mut(&mut self) -> Option<&mut Round> {
        self.rounds.last_mut().filter(|r| r.is_open())
    }

    /// Question ids of the most recent `k` rounds, newest first.
    pub fn recent_questions(&self, k: usize) -> Vec<QuestionId> {
        self.rounds
            .iter()
            .rev()
            .take(k)
            .map(|r| r.question_id.clone())
            .collect()
    }

    pub fn capacity(&self) -> Capacity {
        Capacity {
            min: self.min_players,
            max: self.max_players,
        }
    }
}

/// Quorum and capacity thresholds of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capacity {
    pub min: u32,
    pub max: u32,
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn round(id: i64, question: &str, open: bool) -> Round {
        Round {
            id: RoundId(id),
            question_id: QuestionId::new(question),
            correct_option: 0,
            started_at: Utc::now(),
            ended_at: if open { None } else { Some(Utc::now()) },
            answers: Vec::new(),
        }
    }

    fn session(rounds: Vec<Round>) -> Session {
        Session {
            id: SessionId(1),
            join_code: "ABC234".into(),
            status: SessionStatus::Running,
            min_players: 2,
            max_players: 10,
            rounds,
            players: vec![
                SessionPlayer::new(IdentityId::new("p1"), None),
                SessionPlayer {
                    eliminated: true,
                    ..SessionPlayer::new(IdentityId::new("p2"), None)
                },
            ],
            winner: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_only_advances() {
        use SessionStatus::*;
        assert!(Waiting.can_advance_to(Running));
        assert!(Running.can_advance_to(Finished));
        assert!(!Waiting.can_advance_to(Finished));
        assert!(!Running.can_advance_to(Waiting));
        assert!(!Finished.can_advance_to(Running));
        assert!(!Running.can_advance_to(Running));
    }

    #[test]
    fn status_parse_roundtrip() {
        for s in [SessionStatus::Waiting, SessionStatus::Running, SessionStatus::Finished] {
            assert_eq!(s.as_str().parse::<SessionStatus>().unwrap(), s);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn open_round_is_only_the_last_unclosed_one() {
        let s = session(vec![round(1, "q1", false), round(2, "q2", true)]);
        assert_eq!(s.open_round().map(|r| r.id), Some(RoundId(2)));

        let s = session(vec![round(1, "q1", false)]);
        assert!(s.open_round().is_none());
    }

    #[test]
    fn recent_questions_newest_first() {
        let s = session(vec![
            round(1, "q1", false),
            round(2, "q2", false),
            round(3, "q3", false),
        ]);
        assert_eq!(
            s.recent_questions(2),
            vec![QuestionId::new("q3"), QuestionId::new("q2")]
        );
        assert_eq!(s.recent_questions(10).len(), 3);
    }

    #[test]
    fn eligible_skips_eliminated() {
        let s = session(vec![]);
        assert_eq!(s.eligible_count(), 1);
        assert_eq!(s.eligible().next().unwrap().identity.as_str(), "p1");
    }

    #[test]
    fn question_serializes_camel_case() {
        let q = Question {
            id: QuestionId::new("q1"),
            statement: "2+2?".into(),
            options: vec!["3".into(), "4".into()],
            correct_option_index: 1,
            category: "math".into(),
        };
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(v["correctOptionIndex"], 1);
        assert_eq!(v["id"], "q1");
    }
}
