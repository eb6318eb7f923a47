//! Embedded schema migrations for the meetings database.
//!
//! Scripts are numbered and compiled in with `include_str!`. Each one runs
//! once, in its own transaction together with the `schema_version` row that
//! records it. A file database is hot-copied to `<db>.pre-migration.bak`
//! before any pending script runs.

use std::path::PathBuf;

use rusqlite::{Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use thiserror::Error;

const MIGRATIONS: &[(u32, &str)] = &[
    (1, include_str!("migrations/001_baseline.sql")),
    (2, include_str!("migrations/002_sync_keys.sql")),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("schema bookkeeping failed: {0}")]
    Bookkeeping(#[source] rusqlite::Error),

    #[error("migration v{version} failed: {source}")]
    Script {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database schema v{found} is newer than this build supports (v{supported}); upgrade meetboard")]
    TooNew { found: u32, supported: u32 },

    #[error("pre-migration backup to {path} failed: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |(version, _)| *version)
}

fn applied_version(conn: &Connection) -> Result<u32, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(MigrationError::Bookkeeping)?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(MigrationError::Bookkeeping)
}

/// A `meetings` table with no version rows predates versioning. Record the
/// baseline as applied instead of running it over live data.
fn adopt_unversioned(conn: &Connection) -> Result<bool, MigrationError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'meetings'",
            [],
            |_| Ok(()),
        )
        .optional()
        .map_err(MigrationError::Bookkeeping)?
        .is_some();
    if exists {
        conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])
            .map_err(MigrationError::Bookkeeping)?;
        log::info!("Unversioned meetings database found; baseline marked as applied");
    }
    Ok(exists)
}

/// Copy the main database next to itself. In-memory databases are skipped.
fn snapshot(conn: &Connection) -> Result<Option<PathBuf>, MigrationError> {
    let file: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(MigrationError::Bookkeeping)?;
    if file.is_empty() {
        return Ok(None);
    }
    let path = PathBuf::from(format!("{file}.pre-migration.bak"));
    conn.backup(DatabaseName::Main, &path, None)
        .map_err(|source| MigrationError::Backup {
            path: path.clone(),
            source,
        })?;
    log::info!("Pre-migration snapshot written to {}", path.display());
    Ok(Some(path))
}

/// Bring the schema up to date. Returns how many scripts ran.
pub fn run_migrations(conn: &mut Connection) -> Result<usize, MigrationError> {
    let mut current = applied_version(conn)?;
    if current == 0 && adopt_unversioned(conn)? {
        current = 1;
    }

    let supported = latest_version();
    if current > supported {
        return Err(MigrationError::TooNew {
            found: current,
            supported,
        });
    }

    let pending: Vec<(u32, &str)> = MIGRATIONS
        .iter()
        .copied()
        .filter(|(version, _)| *version > current)
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }

    snapshot(conn)?;
    for &(version, sql) in &pending {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(MigrationError::Bookkeeping)?;
        tx.execute_batch(sql)
            .map_err(|source| MigrationError::Script { version, source })?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
            .map_err(MigrationError::Bookkeeping)?;
        tx.commit().map_err(MigrationError::Bookkeeping)?;
        log::info!("Applied schema migration v{version}");
    }
    Ok(pending.len())
}
