//! The capability set shared by both record stores.
//!
//! The sync coordinator is generic over [`MeetingStore`] and never looks at
//! the concrete store beyond the try/fallback ordering. The backup store
//! additionally implements [`PendingSync`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditContext;
use crate::error::{StoreError, StoreKind};
use crate::types::{format_ts, Change, Meeting, MeetingFields, MeetingFilter, MeetingId};

pub trait MeetingStore {
    fn kind(&self) -> StoreKind;

    /// Create a meeting and assign its identifier.
    fn insert(&self, fields: &MeetingFields, audit: &AuditContext) -> Result<Meeting, StoreError>;

    /// Insert under an idempotency key. A key seen before returns the meeting
    /// it created, or `NotFound` if that meeting has since been deleted.
    /// Stores without key bookkeeping insert unconditionally.
    fn insert_once(
        &self,
        key: &str,
        fields: &MeetingFields,
        audit: &AuditContext,
    ) -> Result<Meeting, StoreError> {
        let _ = key;
        self.insert(fields, audit)
    }

    /// Replace the business fields of an existing meeting.
    fn update(
        &self,
        id: MeetingId,
        fields: &MeetingFields,
        audit: &AuditContext,
    ) -> Result<Meeting, StoreError>;

    /// Remove a meeting, returning the row as it was.
    fn delete(&self, id: MeetingId, audit: &AuditContext) -> Result<Meeting, StoreError>;

    fn get(&self, id: MeetingId) -> Result<Option<Meeting>, StoreError>;

    fn list(&self, filter: &MeetingFilter) -> Result<Vec<Meeting>, StoreError>;

    /// Write a complete record under its existing identifier, bookkeeping
    /// included. Used for mirroring and reconciliation.
    fn upsert(&self, meeting: &Meeting, audit: &AuditContext) -> Result<Meeting, StoreError>;

    /// Stamp `last_synced_at` without touching business data or the version.
    fn mark_synced(&self, id: MeetingId, at: DateTime<Utc>) -> Result<(), StoreError>;

    fn apply(&self, change: &Change, audit: &AuditContext) -> Result<Meeting, StoreError> {
        match change {
            Change::Insert(fields) => self.insert(fields, audit),
            Change::Update(id, fields) => self.update(*id, fields, audit),
            Change::Delete(id) => self.delete(*id, audit),
        }
    }
}

/// What a pending-sync marker asks the reconciler to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOp {
    /// The meeting was created while the primary was down and has no
    /// primary identifier yet.
    Insert,
    Update,
    Delete,
}

impl PendingOp {
    /// Combine an existing marker with a newer degraded write.
    /// `None` means the two cancel out and the marker should be dropped.
    pub fn merge(existing: PendingOp, next: PendingOp) -> Option<PendingOp> {
        match (existing, next) {
            (PendingOp::Insert, PendingOp::Delete) => None,
            (PendingOp::Insert, _) => Some(PendingOp::Insert),
            (_, next) => Some(next),
        }
    }
}

/// Per-meeting flag: the backup holds data the primary has not seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMarker {
    pub meeting_id: MeetingId,
    pub op: PendingOp,
    pub marked_at: DateTime<Utc>,
    /// Idempotency key for replaying an `Insert`. Fixed when the meeting is
    /// created offline and kept through merges and id moves.
    #[serde(default)]
    pub sync_key: Option<String>,
}

impl PendingMarker {
    pub fn new(meeting_id: MeetingId, op: PendingOp, marked_at: DateTime<Utc>) -> Self {
        let sync_key = (op == PendingOp::Insert)
            .then(|| format!("local:{meeting_id}:{}", format_ts(&marked_at)));
        Self {
            meeting_id,
            op,
            marked_at,
            sync_key,
        }
    }
}

/// Degraded-mode writes and the marker set that records them.
///
/// Implementations must update data and markers under one lock so the two
/// can never diverge.
pub trait PendingSync {
    /// Apply `change` locally and record a pending marker for it.
    fn apply_pending(
        &self,
        change: &Change,
        marked_at: DateTime<Utc>,
    ) -> Result<Meeting, StoreError>;

    /// All markers, ordered by meeting identifier.
    fn pending(&self) -> Result<Vec<PendingMarker>, StoreError>;

    /// Drop the marker for `marker.meeting_id` if it is still the one given.
    /// Returns false when a newer degraded write replaced it meanwhile.
    fn clear_pending(&self, marker: &PendingMarker) -> Result<bool, StoreError>;

    /// Move a locally created meeting to the identifier the primary assigned
    /// and clear its marker.
    fn adopt(&self, local_id: MeetingId, primary: &Meeting) -> Result<(), StoreError>;
}
