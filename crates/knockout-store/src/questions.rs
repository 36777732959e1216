//! SQLite-backed question bank.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result, Row};
use serde::Deserialize;

use knockout_core::collab::QuestionSource;
use knockout_core::error::QuestionSourceError;
use knockout_core::types::{Question, QuestionId};

use crate::schema::{configure, migrate_questions};

/// Question bank stored in its own table. Reads and writes share one
/// connection behind a mutex so the bank can be handed out as
/// `Arc<dyn QuestionSource>`.
pub struct SqliteQuestionBank {
    conn: Mutex<Connection>,
}

/// One entry of an import file. `id` is optional; missing ids are generated.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionDraft {
    #[serde(default)]
    id: Option<String>,
    statement: String,
    options: Vec<String>,
    correct_option_index: u32,
    category: String,
}

impl QuestionDraft {
    fn into_question(self, rng: &mut impl Rng) -> std::result::Result<Question, QuestionSourceError> {
        let id = match self.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => format!("q{:016x}", rng.random::<u64>()),
        };
        let invalid = |detail: &str| QuestionSourceError::Invalid {
            id: id.clone(),
            detail: detail.to_string(),
        };
        if self.statement.trim().is_empty() {
            return Err(invalid("statement is empty"));
        }
        if self.options.len() < 2 {
            return Err(invalid("needs at least two options"));
        }
        if self.options.iter().any(|o| o.trim().is_empty()) {
            return Err(invalid("option text is empty"));
        }
        if self.category.trim().is_empty() {
            return Err(invalid("category is empty"));
        }
        if self.correct_option_index as usize >= self.options.len() {
            return Err(invalid("correctOptionIndex out of range"));
        }
        Ok(Question {
            id: QuestionId(id),
            statement: self.statement,
            options: self.options,
            correct_option_index: self.correct_option_index,
            category: self.category,
        })
    }
}

fn unavailable(e: rusqlite::Error) -> QuestionSourceError {
    QuestionSourceError::Unavailable(e.to_string())
}

fn row_to_question(row: &Row<'_>) -> Result<Question> {
    let options: String = row.get(2)?;
    let options: Vec<String> = serde_json::from_str(&options)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(Question {
        id: QuestionId(row.get(0)?),
        statement: row.get(1)?,
        options,
        correct_option_index: row.get(3)?,
        category: row.get(4)?,
    })
}

impl SqliteQuestionBank {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        configure(&conn)?;
        migrate_questions(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace validated questions.
    pub fn insert(&self, questions: &[Question]) -> std::result::Result<usize, QuestionSourceError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(unavailable)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO questions
                        (id, statement, options, correct_index, category)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(unavailable)?;
            for q in questions {
                let options = serde_json::to_string(&q.options).map_err(|e| {
                    QuestionSourceError::Invalid {
                        id: q.id.to_string(),
                        detail: e.to_string(),
                    }
                })?;
                stmt.execute(params![
                    q.id.as_str(),
                    q.statement,
                    options,
                    q.correct_option_index,
                    q.category
                ])
                .map_err(unavailable)?;
            }
        }
        tx.commit().map_err(unavailable)?;
        Ok(questions.len())
    }

    /// Parse a JSON array of questions, validate every entry, then insert
    /// them all. Nothing is written if any entry is invalid.
    pub fn import_json(&self, text: &str) -> std::result::Result<usize, QuestionSourceError> {
        let drafts: Vec<QuestionDraft> =
            serde_json::from_str(text).map_err(|e| QuestionSourceError::Invalid {
                id: "<file>".to_string(),
                detail: e.to_string(),
            })?;
        let mut rng = rand::rng();
        let questions = drafts
            .into_iter()
            .map(|d| d.into_question(&mut rng))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let n = self.insert(&questions)?;
        tracing::info!(count = n, "imported questions");
        Ok(n)
    }
}

impl QuestionSource for SqliteQuestionBank {
    fn fetch_random(
        &self,
        exclude: &[QuestionId],
    ) -> std::result::Result<Option<Question>, QuestionSourceError> {
        let conn = self.lock();
        let sql = if exclude.is_empty() {
            "SELECT id, statement, options, correct_index, category
             FROM questions ORDER BY RANDOM() LIMIT 1"
                .to_string()
        } else {
            let placeholders = vec!["?"; exclude.len()].join(", ");
            format!(
                "SELECT id, statement, options, correct_index, category
                 FROM questions WHERE id NOT IN ({placeholders})
                 ORDER BY RANDOM() LIMIT 1"
            )
        };
        conn.query_row(
            &sql,
            params_from_iter(exclude.iter().map(QuestionId::as_str)),
            row_to_question,
        )
        .optional()
        .map_err(unavailable)
    }

    fn count_available(&self) -> std::result::Result<u64, QuestionSourceError> {
        let n: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM questions", [], |row| row.get(0))
            .map_err(unavailable)?;
        Ok(n.max(0) as u64)
    }

    fn fetch(&self, id: &QuestionId) -> std::result::Result<Option<Question>, QuestionSourceError> {
        self.lock()
            .query_row(
                "SELECT id, statement, options, correct_index, category
                 FROM questions WHERE id = ?1",
                params![id.as_str()],
                row_to_question,
            )
            .optional()
            .map_err(unavailable)
    }
}
