//! Typed error type for the db crate.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("{table} row {id} not found")]
    NotFound { table: &'static str, id: Uuid },

    /// A stored value could not be mapped back onto its Rust type
    /// (unknown enum text, negative counter, …).
    #[error("corrupt {table} row: {message}")]
    Corrupt {
        table: &'static str,
        message: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub fn not_found(table: &'static str, id: Uuid) -> Self {
        Self::NotFound { table, id }
    }

    pub fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
