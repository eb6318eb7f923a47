//! SQLite-backed relational store for meetings and their audit log.
//!
//! This is the authoritative store. Every mutation runs in one immediate
//! transaction together with its audit append (`audit_log`), so a change
//! either commits with its history row or not at all.
//!
//! The connection is opened lazily and dropped after an availability
//! failure, so a database that comes back (share remounted, lock released)
//! is picked up by the next call without restarting the process.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{ErrorContext, Operation, StoreError, StoreKind};

pub mod audit_log;
pub mod meetings;
pub mod types;
pub use types::*;

/// How long SQLite waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MeetingDb {
    target: DbTarget,
    conn: Mutex<Option<Connection>>,
}

impl MeetingDb {
    /// Create a store for `url` without connecting yet.
    pub fn new(url: &str) -> Result<Self, DbError> {
        Ok(Self {
            target: DbTarget::parse(url)?,
            conn: Mutex::new(None),
        })
    }

    /// Open a database at an explicit path and connect immediately.
    pub fn open_at(path: &Path) -> Result<Self, DbError> {
        let db = Self {
            target: DbTarget::File(path.to_path_buf()),
            conn: Mutex::new(None),
        };
        let conn = db.connect()?;
        *db.conn.lock() = Some(conn);
        Ok(db)
    }

    pub fn target(&self) -> &DbTarget {
        &self.target
    }

    /// Open a connection and bring the schema up to date.
    ///
    /// The parent directory is deliberately not created: a missing directory
    /// means the database location is not reachable right now.
    fn connect(&self) -> Result<Connection, DbError> {
        let mut conn = match &self.target {
            DbTarget::Memory => Connection::open_in_memory()?,
            DbTarget::File(path) => {
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                conn
            }
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        crate::migrations::run_migrations(&mut conn)?;
        log::debug!("Connected to meetings database {:?}", self.target);
        Ok(conn)
    }

    /// Check that the database is reachable.
    pub fn ping(&self) -> Result<(), StoreError> {
        let ctx = ErrorContext::new(Operation::Connect, StoreKind::Relational);
        self.with_conn(ctx, |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| sqlite_error(ctx, e))
        })
    }

    /// Run `f` with a live connection, connecting first if needed.
    pub(crate) fn with_conn<T>(
        &self,
        ctx: ErrorContext,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            let conn = self.connect().map_err(|e| e.into_store_error(ctx))?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::internal(ctx, "connection was not initialised"));
        };

        let result = f(conn);
        if let Err(err) = &result {
            // In-memory databases cannot be reopened without losing data.
            if err.falls_back() && matches!(self.target, DbTarget::File(_)) {
                log::warn!("Dropping meetings database connection after: {err}");
                *guard = None;
            }
        }
        result
    }

    /// Execute a closure within an immediate SQLite transaction.
    /// Commits on Ok; an Err drops the transaction, which rolls it back.
    pub(crate) fn with_transaction<T>(
        &self,
        ctx: ErrorContext,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.with_conn(ctx, |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| sqlite_error(ctx, e))?;
            let value = f(&tx)?;
            tx.commit().map_err(|e| sqlite_error(ctx, e))?;
            Ok(value)
        })
    }

    /// Hot-copy the live database to `dest` using SQLite's online backup API.
    pub fn backup_to(&self, dest: &Path) -> Result<(), StoreError> {
        let ctx = ErrorContext::new(Operation::Export, StoreKind::Relational);
        self.with_conn(ctx, |conn| {
            let mut backup_conn = Connection::open(dest).map_err(|e| sqlite_error(ctx, e))?;
            let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
                .map_err(|e| sqlite_error(ctx, e))?;
            // Copy all pages in one step; meeting databases stay small.
            backup.step(-1).map_err(|e| sqlite_error(ctx, e))?;
            log::info!("Meetings database backed up to {}", dest.display());
            Ok(())
        })
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================

#[cfg(test)]
pub mod test_utils {
    use super::MeetingDb;

    /// Create a temporary file-backed database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    pub fn test_db() -> MeetingDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("meetings.db");
        std::mem::forget(dir);
        MeetingDb::open_at(&path).expect("Failed to open test database")
    }

    /// Run raw SQL against the test database, bypassing the store API.
    pub fn raw_exec(db: &MeetingDb, sql: &str) {
        let guard = db.conn.lock();
        guard
            .as_ref()
            .expect("test database is connected")
            .execute_batch(sql)
            .expect("raw sql");
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        let ctx = ErrorContext::new(Operation::List, StoreKind::Relational);
        let counts: (i64, i64) = db
            .with_conn(ctx, |conn| {
                conn.query_row(
                    "SELECT (SELECT COUNT(*) FROM meetings), (SELECT COUNT(*) FROM meetings_audit_log)",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| sqlite_error(ctx, e))
            })
            .expect("tables should exist");
        assert_eq!(counts, (0, 0));
    }

    #[test]
    fn test_missing_directory_is_unavailable_until_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let share = dir.path().join("share");
        let db = MeetingDb::new(share.join("meetings.db").to_str().unwrap()).unwrap();

        let err = db.ping().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        std::fs::create_dir_all(&share).unwrap();
        db.ping().expect("reconnects once the directory exists");
    }

    #[test]
    fn test_backup_creates_copy() {
        let db = test_db();
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("meetings.db.bak");
        db.backup_to(&dest).expect("backup");

        let copy = Connection::open(&dest).unwrap();
        let version: i64 = copy
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
