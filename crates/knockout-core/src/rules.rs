//! Round rules: answer validation, elimination, question selection.
//!
//! Elimination rule: at close, every eligible player whose answer is wrong
//! or absent is eliminated; a correct answer survives and scores one point.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::collab::QuestionSource;
use crate::error::KnockoutError;
use crate::types::{
    AnswerRecord, IdentityId, LastAnswer, Question, QuestionId, Round, RoundId, Session,
    SessionId, SessionStatus,
};

/// Alphabet without look-alikes (no 0/O, 1/I).
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Inbound `submit_answer` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmission {
    pub session_id: SessionId,
    #[serde(default)]
    pub round_id: Option<RoundId>,
    pub question_id: QuestionId,
    pub chosen_option_index: u32,
    /// Client wall clock in epoch milliseconds, used for latency logging only.
    #[serde(default)]
    pub client_timestamp: Option<i64>,
}

/// Effects of closing one round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResolution {
    /// Eligible players eliminated by this round, in roster order.
    pub eliminated: Vec<IdentityId>,
    /// Players whose correct answer scores a point.
    pub scored: Vec<IdentityId>,
    /// Players still eligible after the round.
    pub eligible_after: Vec<IdentityId>,
}

impl RoundResolution {
    pub fn eligible_count(&self) -> usize {
        self.eligible_after.len()
    }

    /// The sole survivor, once exactly one remains.
    pub fn winner(&self) -> Option<&IdentityId> {
        match self.eligible_after.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.eligible_after.len() <= 1
    }
}

/// Decide the round outcome from the roster and the recorded answers.
pub fn resolve_round(session: &Session, answers: &[AnswerRecord]) -> RoundResolution {
    let mut resolution = RoundResolution::default();
    for player in session.eligible() {
        let answer = answers.iter().find(|a| a.identity == player.identity);
        match answer {
            Some(a) if a.correct => {
                resolution.scored.push(player.identity.clone());
                resolution.eligible_after.push(player.identity.clone());
            }
            _ => resolution.eliminated.push(player.identity.clone()),
        }
    }
    resolution
}

/// Mirror a committed round close into an in-memory session.
pub fn apply_resolution(
    session: &mut Session,
    round_id: RoundId,
    ended_at: DateTime<Utc>,
    resolution: &RoundResolution,
) {
    if let Some(round) = session.rounds.iter_mut().find(|r| r.id == round_id) {
        if round.ended_at.is_none() {
            round.ended_at = Some(ended_at);
        }
    }
    for p in &mut session.players {
        if resolution.eliminated.contains(&p.identity) {
            p.eliminated = true;
        }
        if resolution.scored.contains(&p.identity) {
            p.score += 1;
        }
    }
}

/// Mirror a committed answer into an in-memory session.
pub fn apply_answer(session: &mut Session, round_id: RoundId, answer: &AnswerRecord) {
    if let Some(round) = session.rounds.iter_mut().find(|r| r.id == round_id) {
        if round.answer_of(&answer.identity).is_none() {
            round.answers.push(answer.clone());
        }
    }
    if let Some(p) = session.player_mut(&answer.identity) {
        p.last_answer = Some(LastAnswer {
            round_id,
            chosen_option: answer.chosen_option,
            correct: answer.correct,
        });
    }
}

/// Terminal check: `Some(winner)` when at most one eligible player remains.
pub fn terminal_winner(session: &Session) -> Option<Option<IdentityId>> {
    let mut eligible = session.eligible();
    let first = eligible.next();
    if eligible.next().is_some() {
        return None;
    }
    Some(first.map(|p| p.identity.clone()))
}

/// Check a submission against the session's current state.
///
/// Returns the open round it targets. Every error is an expected race
/// outcome and must be dropped without state change.
pub fn validate_submission<'a>(
    session: &'a Session,
    identity: &IdentityId,
    submission: &AnswerSubmission,
) -> Result<&'a Round, KnockoutError> {
    let open = session.open_round();
    let stale = || KnockoutError::StaleOrMismatchedRound {
        open: open.map(|r| r.id),
    };
    if session.status != SessionStatus::Running || submission.session_id != session.id {
        return Err(stale());
    }
    let Some(round) = open else {
        return Err(stale());
    };
    if submission.round_id.is_some_and(|r| r != round.id) || submission.question_id != round.question_id {
        return Err(stale());
    }
    match session.player(identity) {
        Some(p) if p.is_eligible() => {}
        _ => return Err(KnockoutError::NotEligible),
    }
    if round.answer_of(identity).is_some() {
        return Err(KnockoutError::DuplicateAnswer(round.id));
    }
    Ok(round)
}

/// True once every eligible player has an answer in `round`.
pub fn all_answered(session: &Session, round: &Round) -> bool {
    session
        .eligible()
        .all(|p| round.answer_of(&p.identity).is_some())
}

/// Pick the next question, avoiding `recent` when the pool allows it.
///
/// Falls back to an unrestricted pick when the exclusion exhausts the pool.
pub fn select_question(
    source: &dyn QuestionSource,
    recent: &[QuestionId],
) -> Result<Question, KnockoutError> {
    if source.count_available()? == 0 {
        return Err(KnockoutError::EmptyQuestionPool);
    }
    if let Some(q) = source.fetch_random(recent)? {
        return Ok(q);
    }
    source
        .fetch_random(&[])?
        .ok_or(KnockoutError::EmptyQuestionPool)
}

pub fn generate_join_code(len: usize, rng: &mut impl Rng) -> String {
    (0..len)
        .map(|_| JOIN_CODE_ALPHABET[rng.random_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Time left in a round that started at `started_at`.
pub fn remaining_budget(started_at: DateTime<Utc>, budget: Duration, now: DateTime<Utc>) -> Duration {
    let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
    budget.saturating_sub(elapsed)
}

/// Latency from round start to receipt, clamped at zero.
pub fn latency_ms(started_at: DateTime<Utc>, received_at: DateTime<Utc>) -> u64 {
    (received_at - started_at).num_milliseconds().max(0) as u64
}

// ─── Tests ────────────────────────────────────────────────────────
