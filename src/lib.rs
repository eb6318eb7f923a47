//! Meeting persistence with a relational primary and a flat-file backup.
//!
//! - [`db::MeetingDb`]: SQLite store; every mutation is audited in the same
//!   transaction.
//! - [`flatfile::FlatFileStore`]: CSV store with spreadsheet headers, used as
//!   mirror and as fallback.
//! - [`sync::SyncCoordinator`]: tries the primary, falls back on
//!   unavailability, and reconciles pending changes on request.
//! - [`status::classify`]: meeting status computed at read time.

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod flatfile;
pub mod import;
pub mod migrations;
pub mod status;
pub mod store;
pub mod sync;
pub mod types;

pub use audit::{AuditContext, AuditEntry, AuditOperation};
pub use config::{Config, ConfigError};
pub use db::MeetingDb;
pub use error::{ErrorKind, ErrorPayload, StoreError, StoreKind};
pub use flatfile::FlatFileStore;
pub use import::{ImportMode, ImportOptions, ImportReport};
pub use status::{classify, MeetingStatus};
pub use store::{MeetingStore, PendingMarker, PendingOp, PendingSync};
pub use sync::{Dashboard, ReadOutcome, ReconcileReport, SyncCoordinator, SyncState, WriteOutcome};
pub use types::{Change, Meeting, MeetingFields, MeetingFilter, MeetingId, MeetingView};
