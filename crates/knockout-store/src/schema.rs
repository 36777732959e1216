//! Schema creation and connection setup.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Result};

/// Sessions, players, rounds and answers.
///
/// Two partial unique indexes carry the core invariants: at most one
/// waiting session, and at most one open round per session.
const SESSION_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    join_code    TEXT NOT NULL UNIQUE,
    status       TEXT NOT NULL CHECK (status IN ('waiting', 'running', 'finished')),
    min_players  INTEGER NOT NULL,
    max_players  INTEGER NOT NULL,
    winner       TEXT,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    finished_at  TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS sessions_one_waiting
    ON sessions(status) WHERE status = 'waiting';

CREATE TABLE IF NOT EXISTS session_players (
    session_id     INTEGER NOT NULL REFERENCES sessions(id),
    identity       TEXT NOT NULL,
    seat           INTEGER NOT NULL,
    connection_id  INTEGER,
    eliminated     INTEGER NOT NULL DEFAULT 0,
    score          INTEGER NOT NULL DEFAULT 0,
    last_round_id  INTEGER,
    last_option    INTEGER,
    last_correct   INTEGER,
    PRIMARY KEY (session_id, identity)
);
CREATE INDEX IF NOT EXISTS session_players_identity ON session_players(identity);

CREATE TABLE IF NOT EXISTS rounds (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id      INTEGER NOT NULL REFERENCES sessions(id),
    seq             INTEGER NOT NULL,
    question_id     TEXT NOT NULL,
    correct_option  INTEGER NOT NULL,
    started_at      TEXT NOT NULL,
    ended_at        TEXT,
    UNIQUE (session_id, seq)
);
CREATE UNIQUE INDEX IF NOT EXISTS rounds_one_open
    ON rounds(session_id) WHERE ended_at IS NULL;

CREATE TABLE IF NOT EXISTS answers (
    round_id       INTEGER NOT NULL REFERENCES rounds(id),
    identity       TEXT NOT NULL,
    chosen_option  INTEGER NOT NULL,
    correct        INTEGER NOT NULL,
    latency_ms     INTEGER NOT NULL,
    PRIMARY KEY (round_id, identity)
);
";

const QUESTION_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS questions (
    id             TEXT PRIMARY KEY,
    statement      TEXT NOT NULL,
    options        TEXT NOT NULL,
    correct_index  INTEGER NOT NULL,
    category       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS questions_category ON questions(category);
";

pub(crate) fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "foreign_keys", true)?;
    // In-memory databases answer "memory"; anything else is fine too.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    Ok(())
}

pub(crate) fn migrate_sessions(conn: &Connection) -> Result<()> {
    conn.execute_batch(SESSION_SCHEMA)
}

pub(crate) fn migrate_questions(conn: &Connection) -> Result<()> {
    conn.execute_batch(QUESTION_SCHEMA)
}

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(|s| parse_ts(idx, s)).transpose()
}
