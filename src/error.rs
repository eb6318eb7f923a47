//! Error types for the persistence layer
//!
//! Errors are classified by how the sync coordinator reacts to them:
//! - Unavailable: transient infrastructure issue, triggers fallback
//! - Validation / NotFound: bad input, never retried, never falls back
//! - AuditFailure: integrity issue, the mutation was rolled back
//! - Internal: unexpected storage error, surfaced as-is

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::types::MeetingId;

/// Which backing store produced an error or served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Relational,
    FlatFile,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Relational => "relational",
            StoreKind::FlatFile => "flat-file",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The store operation that was running when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Connect,
    Insert,
    Update,
    Delete,
    Get,
    List,
    Upsert,
    Reconcile,
    Export,
    Import,
    History,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Upsert => "upsert",
            Operation::Reconcile => "reconcile",
            Operation::Export => "export",
            Operation::Import => "import",
            Operation::History => "history",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an error happened: operation, meeting and store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub operation: Operation,
    pub meeting_id: Option<MeetingId>,
    pub store: StoreKind,
}

impl ErrorContext {
    pub fn new(operation: Operation, store: StoreKind) -> Self {
        Self {
            operation,
            meeting_id: None,
            store,
        }
    }

    pub fn meeting(mut self, id: MeetingId) -> Self {
        self.meeting_id = Some(id);
        self
    }

    pub fn maybe_meeting(mut self, id: Option<MeetingId>) -> Self {
        self.meeting_id = id;
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.meeting_id {
            Some(id) => write!(f, "{} of meeting {} on {} store", self.operation, id, self.store),
            None => write!(f, "{} on {} store", self.operation, self.store),
        }
    }
}

/// Errors surfaced by both record stores and the sync coordinator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Validation error during {context}: {message}")]
    Validation {
        context: ErrorContext,
        message: String,
    },

    #[error("Meeting not found during {context}")]
    NotFound { context: ErrorContext },

    #[error("Store unavailable during {context}: {message}")]
    Unavailable {
        context: ErrorContext,
        message: String,
    },

    #[error("Audit failure during {context}: {message}")]
    AuditFailure {
        context: ErrorContext,
        message: String,
    },

    #[error("Storage error during {context}: {message}")]
    Internal {
        context: ErrorContext,
        message: String,
    },
}

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unavailable,
    AuditFailure,
    Internal,
}

impl StoreError {
    pub fn validation(context: ErrorContext, message: impl Into<String>) -> Self {
        StoreError::Validation {
            context,
            message: message.into(),
        }
    }

    pub fn not_found(context: ErrorContext) -> Self {
        StoreError::NotFound { context }
    }

    pub fn unavailable(context: ErrorContext, message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            context,
            message: message.into(),
        }
    }

    pub fn audit_failure(context: ErrorContext, message: impl Into<String>) -> Self {
        StoreError::AuditFailure {
            context,
            message: message.into(),
        }
    }

    pub fn internal(context: ErrorContext, message: impl Into<String>) -> Self {
        StoreError::Internal {
            context,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation { .. } => ErrorKind::Validation,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Unavailable { .. } => ErrorKind::Unavailable,
            StoreError::AuditFailure { .. } => ErrorKind::AuditFailure,
            StoreError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            StoreError::Validation { context, .. }
            | StoreError::NotFound { context }
            | StoreError::Unavailable { context, .. }
            | StoreError::AuditFailure { context, .. }
            | StoreError::Internal { context, .. } => context,
        }
    }

    /// Returns true if the coordinator should fall back to the backup store.
    pub fn falls_back(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }

    /// Returns true if the same call may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Get a user-facing recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            StoreError::Validation { .. } => "Check the meeting fields and try again.",
            StoreError::NotFound { .. } => "The meeting may have been deleted. Refresh the list.",
            StoreError::Unavailable { context, .. } => match context.store {
                StoreKind::Relational => {
                    "The database is unreachable. Changes are kept in the local backup; run reconcile once it is back."
                }
                StoreKind::FlatFile => {
                    "The backup file is locked or unreadable. Close other editors and try again."
                }
            },
            StoreError::AuditFailure { .. } => {
                "The change was rejected because it could not be audited. Contact an administrator."
            }
            StoreError::Internal { .. } => "Unexpected storage error. Check the logs for details.",
        }
    }
}

/// Serializable error representation for callers rendering messages
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub kind: ErrorKind,
    pub context: ErrorContext,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

impl From<&StoreError> for ErrorPayload {
    fn from(err: &StoreError) -> Self {
        ErrorPayload {
            message: err.to_string(),
            kind: err.kind(),
            context: *err.context(),
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
