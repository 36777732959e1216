//! SQLite-backed session store.
//!
//! Every transition that must happen at most once (start, round close,
//! elimination, finalize) is a single conditional UPDATE inside an
//! IMMEDIATE transaction; the affected-row count tells the caller whether
//! it won.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Result, TransactionBehavior};

use knockout_core::collab::{SessionStore, WaitingSlot};
use knockout_core::error::StoreError;
use knockout_core::rules::RoundResolution;
use knockout_core::types::{
    AnswerRecord, Capacity, ConnectionId, IdentityId, LastAnswer, Question, QuestionId, Round,
    RoundId, Session, SessionId, SessionPlayer, SessionStatus,
};

use crate::schema::{configure, migrate_sessions, parse_opt_ts, parse_ts, ts};

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database at the given filesystem path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        configure(&conn)?;
        migrate_sessions(&conn)?;
        tracing::debug!("session store ready");
        Ok(Self { conn })
    }

    fn read_session(&self, id: SessionId) -> Result<Option<Session>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, join_code, status, min_players, max_players, winner, created_at
                 FROM sessions WHERE id = ?1",
                params![id.0],
                |row| {
                    let status: String = row.get(2)?;
                    let status = status.parse::<SessionStatus>().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                    })?;
                    let created_at: String = row.get(6)?;
                    Ok(Session {
                        id: SessionId(row.get(0)?),
                        join_code: row.get(1)?,
                        status,
                        min_players: row.get(3)?,
                        max_players: row.get(4)?,
                        rounds: Vec::new(),
                        players: Vec::new(),
                        winner: row.get::<_, Option<String>>(5)?.map(IdentityId),
                        created_at: parse_ts(6, &created_at)?,
                    })
                },
            )
            .optional()?;

        let Some(mut session) = row else {
            return Ok(None);
        };
        session.players = self.read_players(id)?;
        session.rounds = self.read_rounds(id)?;
        Ok(Some(session))
    }

    fn read_players(&self, id: SessionId) -> Result<Vec<SessionPlayer>> {
        let mut stmt = self.conn.prepare(
            "SELECT identity, connection_id, eliminated, score,
                    last_round_id, last_option, last_correct
             FROM session_players WHERE session_id = ?1 ORDER BY seat",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            let last_round: Option<i64> = row.get(4)?;
            let last_option: Option<u32> = row.get(5)?;
            let last_correct: Option<bool> = row.get(6)?;
            let last_answer = match (last_round, last_option, last_correct) {
                (Some(r), Some(o), Some(c)) => Some(LastAnswer {
                    round_id: RoundId(r),
                    chosen_option: o,
                    correct: c,
                }),
                _ => None,
            };
            Ok(SessionPlayer {
                identity: IdentityId(row.get(0)?),
                connection: row.get::<_, Option<i64>>(1)?.map(|c| ConnectionId(c as u64)),
                eliminated: row.get(2)?,
                score: row.get(3)?,
                last_answer,
            })
        })?;
        rows.collect()
    }

    fn read_rounds(&self, id: SessionId) -> Result<Vec<Round>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, question_id, correct_option, started_at, ended_at
             FROM rounds WHERE session_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            let started_at: String = row.get(3)?;
            Ok(Round {
                id: RoundId(row.get(0)?),
                question_id: QuestionId(row.get(1)?),
                correct_option: row.get(2)?,
                started_at: parse_ts(3, &started_at)?,
                ended_at: parse_opt_ts(4, row.get(4)?)?,
                answers: Vec::new(),
            })
        })?;
        let mut rounds: Vec<Round> = rows.collect::<Result<_>>()?;

        let mut answers = self.conn.prepare(
            "SELECT identity, chosen_option, correct, latency_ms
             FROM answers WHERE round_id = ?1 ORDER BY rowid",
        )?;
        for round in &mut rounds {
            let rows = answers.query_map(params![round.id.0], |row| {
                Ok(AnswerRecord {
                    identity: IdentityId(row.get(0)?),
                    chosen_option: row.get(1)?,
                    correct: row.get(2)?,
                    latency_ms: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })?;
            round.answers = rows.collect::<Result<_>>()?;
        }
        Ok(rounds)
    }

    fn open_waiting_id(&self) -> Result<Option<SessionId>> {
        self.conn
            .query_row(
                "SELECT id FROM sessions WHERE status = 'waiting' LIMIT 1",
                [],
                |row| row.get(0).map(SessionId),
            )
            .optional()
    }

    fn insert_waiting(&mut self, join_code: &str, capacity: Capacity, now: DateTime<Utc>) -> Result<WaitingSlot> {
        let inserted = self.conn.execute(
            "INSERT INTO sessions (join_code, status, min_players, max_players, created_at)
             VALUES (?1, 'waiting', ?2, ?3, ?4)",
            params![join_code, capacity.min, capacity.max, ts(now)],
        );
        match inserted {
            Ok(_) => {
                let id = SessionId(self.conn.last_insert_rowid());
                let session = self
                    .read_session(id)?
                    .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                Ok(WaitingSlot::Created(session))
            }
            Err(rusqlite::Error::SqliteFailure(e, msg)) if e.code == ErrorCode::ConstraintViolation => {
                // Lost the race for the single waiting slot, or the join
                // code collided. Only the former has a session to return.
                match self.open_waiting_id()? {
                    Some(id) => {
                        let session = self
                            .read_session(id)?
                            .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                        Ok(WaitingSlot::Existing(session))
                    }
                    None => Err(rusqlite::Error::SqliteFailure(e, msg)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn write_start(&mut self, id: SessionId, roster: &[SessionPlayer], now: DateTime<Utc>) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE sessions SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'waiting'",
            params![id.0, ts(now)],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM session_players WHERE session_id = ?1",
            params![id.0],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO session_players
                    (session_id, identity, seat, connection_id, eliminated, score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (seat, p) in roster.iter().enumerate() {
                insert.execute(params![
                    id.0,
                    p.identity.as_str(),
                    seat as i64,
                    p.connection.map(|c| c.0 as i64),
                    p.eliminated,
                    p.score,
                ])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    fn write_round(&mut self, id: SessionId, question: &Question, started_at: DateTime<Utc>) -> Result<Option<RoundId>> {
        let inserted = self.conn.execute(
            "INSERT INTO rounds (session_id, seq, question_id, correct_option, started_at)
             SELECT ?1,
                    COALESCE((SELECT MAX(seq) FROM rounds WHERE session_id = ?1), 0) + 1,
                    ?2, ?3, ?4
             WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ?1 AND status = 'running')
               AND NOT EXISTS (SELECT 1 FROM rounds WHERE session_id = ?1 AND ended_at IS NULL)",
            params![
                id.0,
                question.id.as_str(),
                question.correct_option_index,
                ts(started_at)
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(RoundId(self.conn.last_insert_rowid())))
    }

    fn write_answer(&mut self, round_id: RoundId, answer: &AnswerRecord) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO answers (round_id, identity, chosen_option, correct, latency_ms)
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE EXISTS (SELECT 1 FROM rounds WHERE id = ?1 AND ended_at IS NULL)",
            params![
                round_id.0,
                answer.identity.as_str(),
                answer.chosen_option,
                answer.correct,
                answer.latency_ms as i64,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE session_players
             SET last_round_id = ?1, last_option = ?3, last_correct = ?4
             WHERE session_id = (SELECT session_id FROM rounds WHERE id = ?1) AND identity = ?2",
            params![
                round_id.0,
                answer.identity.as_str(),
                answer.chosen_option,
                answer.correct
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn write_close(&mut self, round_id: RoundId, ended_at: DateTime<Utc>, resolution: &RoundResolution) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let closed = tx.execute(
            "UPDATE rounds SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
            params![round_id.0, ts(ended_at)],
        )?;
        if closed == 0 {
            return Ok(false);
        }
        let session_id: i64 = tx.query_row(
            "SELECT session_id FROM rounds WHERE id = ?1",
            params![round_id.0],
            |row| row.get(0),
        )?;
        for identity in &resolution.eliminated {
            tx.execute(
                "UPDATE session_players SET eliminated = 1
                 WHERE session_id = ?1 AND identity = ?2 AND eliminated = 0",
                params![session_id, identity.as_str()],
            )?;
        }
        for identity in &resolution.scored {
            tx.execute(
                "UPDATE session_players SET score = score + 1
                 WHERE session_id = ?1 AND identity = ?2 AND eliminated = 0",
                params![session_id, identity.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
            StoreError::Corrupt(e.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

impl SessionStore for SqliteStore {
    fn create_waiting(
        &mut self,
        join_code: &str,
        capacity: Capacity,
        now: DateTime<Utc>,
    ) -> std::result::Result<WaitingSlot, StoreError> {
        self.insert_waiting(join_code, capacity, now).map_err(backend)
    }

    fn find_open_waiting(&self) -> std::result::Result<Option<Session>, StoreError> {
        match self.open_waiting_id().map_err(backend)? {
            Some(id) => self.read_session(id).map_err(backend),
            None => Ok(None),
        }
    }

    fn find_running_for_identity(
        &self,
        identity: &IdentityId,
    ) -> std::result::Result<Option<Session>, StoreError> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT s.id FROM sessions s
                 JOIN session_players p ON p.session_id = s.id
                 WHERE s.status = 'running' AND p.identity = ?1
                 ORDER BY s.id DESC LIMIT 1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        match id {
            Some(id) => self.read_session(SessionId(id)).map_err(backend),
            None => Ok(None),
        }
    }

    fn load_session(&self, id: SessionId) -> std::result::Result<Session, StoreError> {
        self.read_session(id)
            .map_err(backend)?
            .ok_or(StoreError::NotFound(id))
    }

    fn list_running(&self) -> std::result::Result<Vec<SessionId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM sessions WHERE status = 'running' ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| row.get(0).map(SessionId))
            .map_err(backend)?;
        rows.collect::<Result<_>>().map_err(backend)
    }

    fn start_session(
        &mut self,
        id: SessionId,
        roster: &[SessionPlayer],
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, StoreError> {
        self.write_start(id, roster, now).map_err(backend)
    }

    fn append_round(
        &mut self,
        id: SessionId,
        question: &Question,
        started_at: DateTime<Utc>,
    ) -> std::result::Result<Option<RoundId>, StoreError> {
        self.write_round(id, question, started_at).map_err(backend)
    }

    fn record_answer(
        &mut self,
        round_id: RoundId,
        answer: &AnswerRecord,
    ) -> std::result::Result<bool, StoreError> {
        self.write_answer(round_id, answer).map_err(backend)
    }

    fn close_round_if_open(
        &mut self,
        round_id: RoundId,
        ended_at: DateTime<Utc>,
        resolution: &RoundResolution,
    ) -> std::result::Result<bool, StoreError> {
        self.write_close(round_id, ended_at, resolution)
            .map_err(backend)
    }

    fn mark_eliminated(
        &mut self,
        id: SessionId,
        identity: &IdentityId,
    ) -> std::result::Result<bool, StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE session_players SET eliminated = 1
                 WHERE session_id = ?1 AND identity = ?2 AND eliminated = 0",
                params![id.0, identity.as_str()],
            )
            .map_err(backend)?;
        Ok(changed > 0)
    }

    fn set_connection(
        &mut self,
        id: SessionId,
        identity: &IdentityId,
        connection: Option<ConnectionId>,
    ) -> std::result::Result<bool, StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE session_players SET connection_id = ?3
                 WHERE session_id = ?1 AND identity = ?2",
                params![id.0, identity.as_str(), connection.map(|c| c.0 as i64)],
            )
            .map_err(backend)?;
        Ok(changed > 0)
    }

    fn clear_connections(&mut self) -> std::result::Result<usize, StoreError> {
        self.conn
            .execute(
                "UPDATE session_players SET connection_id = NULL WHERE connection_id IS NOT NULL",
                [],
            )
            .map_err(backend)
    }

    fn finalize(
        &mut self,
        id: SessionId,
        winner: Option<&IdentityId>,
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET status = 'finished', winner = ?2, finished_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id.0, winner.map(|w| w.as_str()), ts(now)],
            )
            .map_err(backend)?;
        Ok(changed > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
