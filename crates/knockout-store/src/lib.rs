//! knockout-store: SQLite persistence for sessions and the question bank.

mod questions;
mod schema;
mod sessions;

pub use questions::SqliteQuestionBank;
pub use sessions::SqliteStore;
