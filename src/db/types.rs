//! Shared type definitions for the database layer.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::error::{ErrorContext, StoreError};
use crate::migrations::MigrationError;

/// Errors opening or preparing the database, before any meeting operation.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),

    #[error("Schema migration failed: {0}")]
    Migration(#[from] MigrationError),
}

impl DbError {
    pub(crate) fn into_store_error(self, context: ErrorContext) -> StoreError {
        match self {
            DbError::Sqlite(e) => sqlite_error(context, e),
            DbError::InvalidUrl(msg) => StoreError::validation(context, msg),
            // A busy or unreadable database during bookkeeping is an availability problem.
            DbError::Migration(MigrationError::Bookkeeping(e)) => sqlite_error(context, e),
            DbError::Migration(e) => StoreError::internal(context, e.to_string()),
        }
    }
}

/// Where the relational store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbTarget {
    Memory,
    File(PathBuf),
}

impl DbTarget {
    /// Accepts `sqlite://<path>`, `sqlite:<path>`, a bare path, or `:memory:`.
    pub fn parse(url: &str) -> Result<Self, DbError> {
        let trimmed = url.trim();
        let rest = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("sqlite:"))
            .unwrap_or(trimmed);
        if rest.is_empty() {
            return Err(DbError::InvalidUrl(format!("no database path in '{url}'")));
        }
        if rest == ":memory:" {
            return Ok(DbTarget::Memory);
        }
        Ok(DbTarget::File(PathBuf::from(rest)))
    }
}

/// Map a SQLite failure onto the store error taxonomy.
///
/// Busy, locked, unopenable or I/O-failing databases are unavailable;
/// constraint and type violations are bad input; anything else is internal.
pub(crate) fn sqlite_error(context: ErrorContext, err: rusqlite::Error) -> StoreError {
    let message = err.to_string();
    match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::NotADatabase
            | ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly => StoreError::unavailable(context, message),
            ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig => {
                StoreError::validation(context, message)
            }
            _ => StoreError::internal(context, message),
        },
        _ => StoreError::internal(context, message),
    }
}
