//! Try-primary, fall-back-to-backup coordination between the two stores.
//!
//! Every call attempts exactly one store as primary: the relational store
//! when it is configured, the flat file otherwise. Only an availability
//! failure moves a call to the backup; bad input, missing meetings and
//! audit failures are surfaced unchanged. Degraded writes leave a pending
//! marker in the backup, which `reconcile` replays once the primary is back.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditContext, AuditEntry};
use crate::db::MeetingDb;
use crate::error::{ErrorContext, Operation, StoreError, StoreKind};
use crate::flatfile::{export_meetings, FlatFileStore};
use crate::status::{status_counts, MeetingStatus};
use crate::store::{MeetingStore, PendingMarker, PendingOp, PendingSync};
use crate::types::{format_ts, now_utc, Change, Meeting, MeetingFields, MeetingFilter, MeetingId, MeetingView};

/// The production pairing: SQLite primary, CSV backup.
pub type Dashboard = SyncCoordinator<MeetingDb, FlatFileStore>;

/// Result of a coordinated write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub meeting: Meeting,
    /// The primary was unavailable; only the backup holds this change.
    pub degraded: bool,
    /// The backup copy was refreshed after a primary write.
    pub mirrored: bool,
}

/// Result of a coordinated read, tagged with the store that served it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOutcome<T> {
    pub value: T,
    pub source: StoreKind,
    /// Served by the backup because the primary was unavailable.
    pub degraded: bool,
    /// Reference time used for every computed status in `value`.
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFailure {
    pub meeting_id: MeetingId,
    pub op: PendingOp,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub attempted: usize,
    pub reconciled: usize,
    pub unreconciled: usize,
    pub failures: Vec<ReconcileFailure>,
}

/// How the two copies of one meeting relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    InSync,
    /// The backup holds changes the primary has not seen.
    BackupAhead,
    /// The backup copy is stale.
    PrimaryAhead,
    BackupOnly,
    PrimaryOnly,
}

pub struct SyncCoordinator<P, B> {
    primary: Option<P>,
    backup: B,
}

impl<P, B> SyncCoordinator<P, B>
where
    P: MeetingStore,
    B: MeetingStore + PendingSync,
{
    /// Relational primary with the flat file as backup.
    pub fn new(primary: P, backup: B) -> Self {
        Self {
            primary: Some(primary),
            backup,
        }
    }

    /// The flat file alone is authoritative; nothing is ever pending.
    pub fn backup_only(backup: B) -> Self {
        Self {
            primary: None,
            backup,
        }
    }

    pub fn primary(&self) -> Option<&P> {
        self.primary.as_ref()
    }

    pub fn backup(&self) -> &B {
        &self.backup
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn create(
        &self,
        fields: MeetingFields,
        audit: &AuditContext,
    ) -> Result<WriteOutcome, StoreError> {
        self.write(&Change::Insert(fields), audit)
    }

    pub fn update(
        &self,
        id: MeetingId,
        fields: MeetingFields,
        audit: &AuditContext,
    ) -> Result<WriteOutcome, StoreError> {
        self.write(&Change::Update(id, fields), audit)
    }

    pub fn delete(&self, id: MeetingId, audit: &AuditContext) -> Result<WriteOutcome, StoreError> {
        self.write(&Change::Delete(id), audit)
    }

    /// Apply one change: primary first, backup on unavailability.
    pub fn write(&self, change: &Change, audit: &AuditContext) -> Result<WriteOutcome, StoreError> {
        let Some(primary) = &self.primary else {
            let meeting = self.backup.apply(change, audit)?;
            return Ok(WriteOutcome {
                meeting,
                degraded: false,
                mirrored: false,
            });
        };

        match primary.apply(change, audit) {
            Ok(meeting) => Ok(self.mirror(primary, change, meeting, audit)),
            Err(err) if err.falls_back() => {
                log::warn!("{err}; writing to {} store only", self.backup.kind());
                let meeting = self.backup.apply_pending(change, now_utc())?;
                log::info!(
                    "Meeting {} marked pending sync ({})",
                    meeting.id,
                    change.operation()
                );
                Ok(WriteOutcome {
                    meeting,
                    degraded: true,
                    mirrored: false,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Best-effort copy of a committed primary write into the backup.
    fn mirror(
        &self,
        primary: &P,
        change: &Change,
        meeting: Meeting,
        audit: &AuditContext,
    ) -> WriteOutcome {
        let now = now_utc();
        match self.copy_to_backup(change, &meeting, now, audit) {
            Ok(Some(mirrored)) => {
                if !matches!(change, Change::Delete(_)) {
                    if let Err(e) = primary.mark_synced(meeting.id, now) {
                        log::warn!("Could not stamp sync time on meeting {}: {e}", meeting.id);
                    }
                }
                WriteOutcome {
                    meeting: mirrored,
                    degraded: false,
                    mirrored: true,
                }
            }
            Ok(None) => WriteOutcome {
                meeting,
                degraded: false,
                mirrored: false,
            },
            Err(e) => {
                log::warn!("Mirror to {} store failed: {e}", self.backup.kind());
                WriteOutcome {
                    meeting,
                    degraded: false,
                    mirrored: false,
                }
            }
        }
    }

    /// Apply a committed primary write to the backup, settling any unsynced
    /// local change to the same meeting. `Ok(None)` means the local copy is
    /// ahead and was left for `reconcile`.
    fn copy_to_backup(
        &self,
        change: &Change,
        meeting: &Meeting,
        now: DateTime<Utc>,
        audit: &AuditContext,
    ) -> Result<Option<Meeting>, StoreError> {
        let marker = match change {
            // A local insert sharing the id is moved aside by `upsert`.
            Change::Insert(_) => None,
            Change::Update(id, _) | Change::Delete(id) => self
                .backup
                .pending()?
                .into_iter()
                .find(|m| m.meeting_id == *id && m.op != PendingOp::Insert),
        };
        let synced = Meeting {
            last_synced_at: Some(now),
            ..meeting.clone()
        };

        match (change, marker) {
            (Change::Delete(id), marker) => {
                match self.backup.delete(*id, audit) {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                if let Some(marker) = marker {
                    log::warn!(
                        "Meeting {id} deleted on the primary; dropping unsynced local {:?}",
                        marker.op
                    );
                    self.backup.clear_pending(&marker)?;
                }
                Ok(Some(meeting.clone()))
            }
            (_, None) => self.backup.upsert(&synced, audit).map(Some),
            (_, Some(marker)) => {
                let local = self.backup.get(meeting.id)?;
                let local_ahead = marker.op == PendingOp::Update
                    && local.is_some_and(|l| l.sync_version > meeting.sync_version);
                if local_ahead {
                    log::warn!(
                        "Meeting {} has a newer unsynced local edit; left for reconcile",
                        meeting.id
                    );
                    return Ok(None);
                }
                log::warn!(
                    "Meeting {}: edit v{} supersedes unsynced local {:?}",
                    meeting.id,
                    meeting.sync_version,
                    marker.op
                );
                self.backup.adopt(meeting.id, &synced)?;
                Ok(Some(synced))
            }
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Run `op` on the primary, or on the backup if the primary is down.
    fn read_with<T>(
        &self,
        op: impl Fn(&dyn MeetingStore) -> Result<T, StoreError>,
    ) -> Result<(T, StoreKind, bool), StoreError> {
        if let Some(primary) = &self.primary {
            match op(primary) {
                Ok(value) => return Ok((value, primary.kind(), false)),
                Err(err) if err.falls_back() => {
                    log::warn!("{err}; serving from {} store", self.backup.kind());
                    let value = op(&self.backup)?;
                    return Ok((value, self.backup.kind(), true));
                }
                Err(err) => return Err(err),
            }
        }
        Ok((op(&self.backup)?, self.backup.kind(), false))
    }

    /// Meetings matching `filter`, each with its status as of one instant.
    pub fn read(
        &self,
        filter: &MeetingFilter,
    ) -> Result<ReadOutcome<Vec<MeetingView>>, StoreError> {
        let as_of = filter.now();
        let filter = MeetingFilter {
            as_of: Some(as_of),
            ..filter.clone()
        };
        let (meetings, source, degraded) = self.read_with(|store| store.list(&filter))?;
        Ok(ReadOutcome {
            value: meetings
                .into_iter()
                .map(|m| MeetingView::at(m, as_of))
                .collect(),
            source,
            degraded,
            as_of,
        })
    }

    pub fn get(&self, id: MeetingId) -> Result<ReadOutcome<Option<MeetingView>>, StoreError> {
        let as_of = Utc::now();
        let (meeting, source, degraded) = self.read_with(|store| store.get(id))?;
        Ok(ReadOutcome {
            value: meeting.map(|m| MeetingView::at(m, as_of)),
            source,
            degraded,
            as_of,
        })
    }

    /// Per-status tallies for the meetings matching `filter`.
    pub fn counts(
        &self,
        filter: &MeetingFilter,
    ) -> Result<ReadOutcome<BTreeMap<MeetingStatus, usize>>, StoreError> {
        let outcome = self.read(filter)?;
        let counts = status_counts(outcome.value.iter().map(|v| &v.meeting), outcome.as_of);
        Ok(ReadOutcome {
            value: counts,
            source: outcome.source,
            degraded: outcome.degraded,
            as_of: outcome.as_of,
        })
    }

    /// Write every meeting, with its status, to a spreadsheet CSV at `dest`.
    pub fn export(&self, dest: &Path) -> Result<ReadOutcome<usize>, StoreError> {
        let outcome = self.read(&MeetingFilter::default())?;
        let ctx = ErrorContext::new(Operation::Export, outcome.source);
        let meetings: Vec<Meeting> = outcome.value.into_iter().map(|v| v.meeting).collect();
        let written = export_meetings(ctx, dest, &meetings, outcome.as_of)?;
        Ok(ReadOutcome {
            value: written,
            source: outcome.source,
            degraded: outcome.degraded,
            as_of: outcome.as_of,
        })
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Replay pending markers against the primary, lowest id first.
    ///
    /// Stops at the first availability failure; the markers not yet visited
    /// count as unreconciled. Other failures are recorded and skipped.
    pub fn reconcile(&self, audit: &AuditContext) -> Result<ReconcileReport, StoreError> {
        let Some(primary) = &self.primary else {
            return Ok(ReconcileReport::default());
        };
        let markers = self.backup.pending()?;
        let mut report = ReconcileReport {
            attempted: markers.len(),
            ..Default::default()
        };

        for (i, marker) in markers.iter().enumerate() {
            match self.replay(primary, marker, audit) {
                Ok(()) => report.reconciled += 1,
                Err(err) => {
                    log::warn!("Reconcile of meeting {} failed: {err}", marker.meeting_id);
                    report.failures.push(ReconcileFailure {
                        meeting_id: marker.meeting_id,
                        op: marker.op,
                        message: err.to_string(),
                    });
                    if err.falls_back() {
                        report.unreconciled += markers.len() - i;
                        break;
                    }
                    report.unreconciled += 1;
                }
            }
        }

        log::info!(
            "Reconcile finished: {} of {} reconciled, {} left pending",
            report.reconciled,
            report.attempted,
            report.unreconciled
        );
        Ok(report)
    }

    fn replay(
        &self,
        primary: &P,
        marker: &PendingMarker,
        audit: &AuditContext,
    ) -> Result<(), StoreError> {
        let id = marker.meeting_id;
        let now = now_utc();
        match marker.op {
            PendingOp::Insert => {
                let Some(local) = self.backup.get(id)? else {
                    self.backup.clear_pending(marker)?;
                    return Ok(());
                };
                let key = marker
                    .sync_key
                    .clone()
                    .unwrap_or_else(|| format!("local:{id}:{}", format_ts(&local.created_at)));
                let created = match primary.insert_once(&key, &local.fields, audit) {
                    Ok(created) => created,
                    Err(e) if e.is_not_found() => {
                        // Replayed before, then deleted on the primary.
                        log::warn!("Local meeting {id} was deleted after an earlier replay; dropping it");
                        match self.backup.delete(id, audit) {
                            Ok(_) => {}
                            Err(e) if e.is_not_found() => {}
                            Err(e) => return Err(e),
                        }
                        self.backup.clear_pending(marker)?;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let created = Meeting {
                    last_synced_at: Some(now),
                    ..created
                };
                self.backup.adopt(id, &created)?;
                primary.mark_synced(created.id, now)?;
                if created.id != id {
                    log::info!("Local meeting {id} stored as {}", created.id);
                }
            }
            PendingOp::Update => {
                let Some(local) = self.backup.get(id)? else {
                    self.backup.clear_pending(marker)?;
                    return Ok(());
                };
                let winner = match primary.get(id)? {
                    None => primary.upsert(&local, audit)?,
                    Some(remote) if local.sync_version > remote.sync_version => {
                        let merged = Meeting {
                            created_at: remote.created_at,
                            updated_at: now,
                            ..local
                        };
                        primary.upsert(&merged, audit)?
                    }
                    Some(remote) => {
                        if remote.fields != local.fields {
                            log::warn!(
                                "Meeting {id}: relational copy (v{}) supersedes local edit (v{})",
                                remote.sync_version,
                                local.sync_version
                            );
                        }
                        remote
                    }
                };
                let winner = Meeting {
                    last_synced_at: Some(now),
                    ..winner
                };
                self.backup.upsert(&winner, audit)?;
                primary.mark_synced(id, now)?;
                self.backup.clear_pending(marker)?;
            }
            PendingOp::Delete => {
                match primary.get(id)? {
                    Some(remote) if remote.updated_at > marker.marked_at => {
                        log::warn!(
                            "Meeting {id} was edited (v{}) after the offline delete; keeping it",
                            remote.sync_version
                        );
                        let restored = Meeting {
                            last_synced_at: Some(now),
                            ..remote
                        };
                        self.backup.upsert(&restored, audit)?;
                        primary.mark_synced(id, now)?;
                    }
                    Some(_) => match primary.delete(id, audit) {
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    },
                    None => {
                        log::debug!("Meeting {id} already absent from {} store", primary.kind());
                    }
                }
                self.backup.clear_pending(marker)?;
            }
        }
        Ok(())
    }

    /// Pending markers currently held by the backup.
    pub fn pending(&self) -> Result<Vec<PendingMarker>, StoreError> {
        self.backup.pending()
    }

    /// Compare the two copies of one meeting.
    pub fn sync_state(&self, id: MeetingId) -> Result<SyncState, StoreError> {
        let ctx = ErrorContext::new(Operation::Get, self.backup.kind()).meeting(id);
        let local = self.backup.get(id)?;
        let Some(primary) = &self.primary else {
            return local
                .map(|_| SyncState::BackupOnly)
                .ok_or_else(|| StoreError::not_found(ctx));
        };
        let remote = primary.get(id)?;
        let pending = self
            .backup
            .pending()?
            .into_iter()
            .any(|m| m.meeting_id == id);

        Ok(match (remote, local) {
            (None, None) if pending => SyncState::BackupAhead,
            (None, None) => return Err(StoreError::not_found(ctx)),
            (None, Some(_)) => SyncState::BackupOnly,
            (Some(_), None) if pending => SyncState::BackupAhead,
            (Some(_), None) => SyncState::PrimaryOnly,
            (Some(_), Some(_)) if pending => SyncState::BackupAhead,
            (Some(remote), Some(local)) => {
                if remote.fields == local.fields {
                    SyncState::InSync
                } else if local.sync_version > remote.sync_version {
                    SyncState::BackupAhead
                } else {
                    SyncState::PrimaryAhead
                }
            }
        })
    }
}

impl<B> SyncCoordinator<MeetingDb, B>
where
    B: MeetingStore + PendingSync,
{
    /// Audit history of one meeting. Needs the relational store.
    pub fn history(&self, id: MeetingId) -> Result<Vec<AuditEntry>, StoreError> {
        self.require_primary(Operation::History, Some(id))?
            .audit_history(id)
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        self.require_primary(Operation::History, None)?
            .recent_audit(limit)
    }

    fn require_primary(
        &self,
        operation: Operation,
        id: Option<MeetingId>,
    ) -> Result<&MeetingDb, StoreError> {
        self.primary.as_ref().ok_or_else(|| {
            StoreError::validation(
                ErrorContext::new(operation, StoreKind::Relational).maybe_meeting(id),
                "the relational backend is disabled",
            )
        })
    }
}


#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::test_utils::Flaky;
    use super::*;
    use crate::db::test_utils::{raw_exec, test_db};
    use crate::error::ErrorKind;
    use crate::flatfile::test_utils::test_backup;
    use crate::flatfile::{FileLock, RetryPolicy};
    use crate::types::fixtures::{at, sample_fields};

    type Harness = SyncCoordinator<Flaky<MeetingDb>, FlatFileStore>;

    fn harness() -> Harness {
        SyncCoordinator::new(Flaky::new(test_db()), test_backup())
    }

    fn audit() -> AuditContext {
        AuditContext::new("dana")
    }

    fn set_down(h: &Harness, down: bool) {
        h.primary().expect("primary").down.set(down);
    }

    #[test]
    fn test_healthy_write_is_mirrored() {
        let h = harness();
        let out = h.create(sample_fields("Kickoff"), &audit()).unwrap();
        assert!(out.mirrored);
        assert!(!out.degraded);
        assert!(out.meeting.last_synced_at.is_some());

        let local = h.backup().get(out.meeting.id).unwrap().expect("mirrored");
        assert_eq!(local.fields, out.meeting.fields);
        assert_eq!(h.sync_state(out.meeting.id).unwrap(), SyncState::InSync);
        assert!(h.pending().unwrap().is_empty());
    }

    #[test]
    fn test_unavailable_primary_falls_back_and_reads_from_backup() {
        let h = harness();
        set_down(&h, true);

        let out = h.create(sample_fields("Offline"), &audit()).unwrap();
        assert!(out.degraded);

        let read = h.read(&MeetingFilter::default()).unwrap();
        assert_eq!(read.source, StoreKind::FlatFile);
        assert!(read.degraded);
        assert_eq!(read.value.len(), 1);
        assert_eq!(read.value[0].meeting.fields.title, "Offline");

        let markers = h.pending().unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].op, PendingOp::Insert);
    }

    #[test]
    fn test_validation_error_never_falls_back() {
        let h = harness();
        let mut fields = sample_fields("Bad");
        fields.stakeholder_name = None;
        let err = h.create(fields, &audit()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.backup().list(&MeetingFilter::default()).unwrap().is_empty());
        assert!(h.pending().unwrap().is_empty());
    }

    #[test]
    fn test_not_found_is_surfaced_from_primary() {
        let h = harness();
        let err = h.delete(77, &audit()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.context().store, StoreKind::Relational);
    }

    #[test]
    fn test_reconcile_replays_offline_insert_once() {
        let h = harness();
        set_down(&h, true);
        let local = h.create(sample_fields("Offline"), &audit()).unwrap().meeting;
        set_down(&h, false);

        let first = h.reconcile(&audit().with_origin("reconcile")).unwrap();
        assert_eq!(first.attempted, 1);
        assert_eq!(first.reconciled, 1);
        assert_eq!(first.unreconciled, 0);

        let second = h.reconcile(&audit()).unwrap();
        assert_eq!(second, ReconcileReport::default());

        let stored = h.read(&MeetingFilter::default()).unwrap();
        assert_eq!(stored.source, StoreKind::Relational);
        assert_eq!(stored.value.len(), 1);
        let id = stored.value[0].meeting.id;
        assert_eq!(h.backup().get(id).unwrap().unwrap().fields, local.fields);
        assert_eq!(h.sync_state(id).unwrap(), SyncState::InSync);

        let history = h.primary().unwrap().inner.audit_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].changed_from, "reconcile");
    }

    #[test]
    fn test_reconcile_offline_update_newer_local_wins() {
        let h = harness();
        let id = h.create(sample_fields("Kickoff"), &audit()).unwrap().meeting.id;

        set_down(&h, true);
        let mut fields = sample_fields("Kickoff");
        fields.location = Some("Room 9".to_string());
        h.update(id, fields, &audit()).unwrap();
        assert!(h.sync_state(id).is_err(), "primary still down");
        set_down(&h, false);
        assert_eq!(h.sync_state(id).unwrap(), SyncState::BackupAhead);

        let report = h.reconcile(&audit()).unwrap();
        assert_eq!(report.reconciled, 1);

        let remote = h.primary().unwrap().inner.get(id).unwrap().unwrap();
        assert_eq!(remote.fields.location.as_deref(), Some("Room 9"));
        assert_eq!(remote.sync_version, 2);
        assert_eq!(h.sync_state(id).unwrap(), SyncState::InSync);
    }

    #[test]
    fn test_reconcile_tie_keeps_relational_copy() {
        let h = harness();
        let id = h.create(sample_fields("Kickoff"), &audit()).unwrap().meeting.id;

        set_down(&h, true);
        let mut offline = sample_fields("Kickoff");
        offline.notes = Some("offline note".to_string());
        h.update(id, offline, &audit()).unwrap();
        set_down(&h, false);

        // Someone else edits the relational copy in the meantime.
        let mut elsewhere = sample_fields("Kickoff");
        elsewhere.notes = Some("server note".to_string());
        h.primary().unwrap().inner.update(id, &elsewhere, &audit()).unwrap();

        h.reconcile(&audit()).unwrap();
        let local = h.backup().get(id).unwrap().unwrap();
        assert_eq!(local.fields.notes.as_deref(), Some("server note"));
        assert!(h.pending().unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_offline_delete() {
        let h = harness();
        let id = h.create(sample_fields("Kickoff"), &audit()).unwrap().meeting.id;
        set_down(&h, true);
        h.delete(id, &audit()).unwrap();
        set_down(&h, false);

        let report = h.reconcile(&audit()).unwrap();
        assert_eq!(report.reconciled, 1);
        assert!(h.primary().unwrap().inner.get(id).unwrap().is_none());
        assert!(h.sync_state(id).is_err());
    }

    #[test]
    fn test_reconcile_stops_while_primary_down() {
        let h = harness();
        set_down(&h, true);
        h.create(sample_fields("One"), &audit()).unwrap();
        h.create(sample_fields("Two"), &audit()).unwrap();

        let report = h.reconcile(&audit()).unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.reconciled, 0);
        assert_eq!(report.unreconciled, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(h.pending().unwrap().len(), 2);
    }

    #[test]
    fn test_backup_only_mode_never_marks_pending() {
        let h: SyncCoordinator<MeetingDb, FlatFileStore> =
            SyncCoordinator::backup_only(test_backup());
        let out = h.create(sample_fields("Solo"), &audit()).unwrap();
        assert!(!out.degraded);
        assert!(h.pending().unwrap().is_empty());
        assert_eq!(h.sync_state(out.meeting.id).unwrap(), SyncState::BackupOnly);
        assert_eq!(h.history(out.meeting.id).unwrap_err().kind(), ErrorKind::Validation);

        let read = h.read(&MeetingFilter::default()).unwrap();
        assert_eq!(read.source, StoreKind::FlatFile);
        assert!(!read.degraded);
    }

    #[test]
    fn test_counts_use_single_reference_time() {
        let h = harness();
        h.create(sample_fields("Standup"), &audit()).unwrap();
        let mut done = sample_fields("Retro");
        done.status_override = true;
        h.create(done, &audit()).unwrap();

        let filter = MeetingFilter {
            as_of: Some(at(9, 30)),
            ..Default::default()
        };
        let counts = h.counts(&filter).unwrap();
        assert_eq!(counts.as_of, at(9, 30));
        assert_eq!(counts.value[&MeetingStatus::Ongoing], 1);
        assert_eq!(counts.value[&MeetingStatus::Completed], 1);
    }

    #[test]
    fn test_export_fills_status_from_serving_store() {
        let h = harness();
        h.create(sample_fields("Standup"), &audit()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out").join("meetings.csv");

        let out = h.export(&dest).unwrap();
        assert_eq!(out.value, 1);
        assert_eq!(out.source, StoreKind::Relational);

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.lines().next().unwrap().contains("Status"));
        assert!(text.contains("Standup"));
    }

    // =========================================================================
    // Failure paths during mirror and reconcile
    // =========================================================================

    /// Flat-file backup whose next `adopt` fails as if the file were locked.
    struct AdoptFailsOnce {
        inner: FlatFileStore,
        fail_next: Cell<bool>,
    }

    impl MeetingStore for AdoptFailsOnce {
        fn kind(&self) -> StoreKind {
            self.inner.kind()
        }

        fn insert(&self, fields: &MeetingFields, audit: &AuditContext) -> Result<Meeting, StoreError> {
            self.inner.insert(fields, audit)
        }

        fn update(
            &self,
            id: MeetingId,
            fields: &MeetingFields,
            audit: &AuditContext,
        ) -> Result<Meeting, StoreError> {
            self.inner.update(id, fields, audit)
        }

        fn delete(&self, id: MeetingId, audit: &AuditContext) -> Result<Meeting, StoreError> {
            self.inner.delete(id, audit)
        }

        fn get(&self, id: MeetingId) -> Result<Option<Meeting>, StoreError> {
            self.inner.get(id)
        }

        fn list(&self, filter: &MeetingFilter) -> Result<Vec<Meeting>, StoreError> {
            self.inner.list(filter)
        }

        fn upsert(&self, meeting: &Meeting, audit: &AuditContext) -> Result<Meeting, StoreError> {
            self.inner.upsert(meeting, audit)
        }

        fn mark_synced(&self, id: MeetingId, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.mark_synced(id, at)
        }
    }

    impl PendingSync for AdoptFailsOnce {
        fn apply_pending(
            &self,
            change: &Change,
            marked_at: DateTime<Utc>,
        ) -> Result<Meeting, StoreError> {
            self.inner.apply_pending(change, marked_at)
        }

        fn pending(&self) -> Result<Vec<PendingMarker>, StoreError> {
            self.inner.pending()
        }

        fn clear_pending(&self, marker: &PendingMarker) -> Result<bool, StoreError> {
            self.inner.clear_pending(marker)
        }

        fn adopt(&self, local_id: MeetingId, primary: &Meeting) -> Result<(), StoreError> {
            if self.fail_next.replace(false) {
                return Err(StoreError::unavailable(
                    ErrorContext::new(Operation::Upsert, StoreKind::FlatFile).meeting(local_id),
                    "flat-file lock busy",
                ));
            }
            self.inner.adopt(local_id, primary)
        }
    }

    fn harness_with_failing_adopt() -> SyncCoordinator<Flaky<MeetingDb>, AdoptFailsOnce> {
        let h = SyncCoordinator::new(
            Flaky::new(test_db()),
            AdoptFailsOnce {
                inner: test_backup(),
                fail_next: Cell::new(true),
            },
        );
        h.primary().unwrap().down.set(true);
        h.create(sample_fields("Offline"), &audit()).unwrap();
        h.primary().unwrap().down.set(false);
        h
    }

    #[test]
    fn test_reconcile_after_failed_adopt_inserts_once() {
        let h = harness_with_failing_adopt();

        let first = h.reconcile(&audit()).unwrap();
        assert_eq!(first.reconciled, 0);
        assert_eq!(first.failures.len(), 1);
        assert_eq!(h.pending().unwrap().len(), 1);

        let second = h.reconcile(&audit()).unwrap();
        assert_eq!(second.reconciled, 1);
        assert!(h.pending().unwrap().is_empty());

        let remote = h.primary().unwrap().inner.list(&MeetingFilter::default()).unwrap();
        assert_eq!(remote.len(), 1);
        let local = h.backup().inner.list(&MeetingFilter::default()).unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id, remote[0].id);
        let history = h.primary().unwrap().inner.audit_history(remote[0].id).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_reconcile_drops_local_insert_deleted_after_replay() {
        let h = harness_with_failing_adopt();
        h.reconcile(&audit()).unwrap();
        let remote = h.primary().unwrap().inner.list(&MeetingFilter::default()).unwrap();
        h.primary().unwrap().inner.delete(remote[0].id, &audit()).unwrap();

        let report = h.reconcile(&audit()).unwrap();
        assert_eq!(report.reconciled, 1);
        assert!(h.pending().unwrap().is_empty());
        assert!(h.primary().unwrap().inner.list(&MeetingFilter::default()).unwrap().is_empty());
        assert!(h.backup().inner.list(&MeetingFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_online_edit_leaves_newer_offline_edits_for_reconcile() {
        let h = harness();
        let id = h.create(sample_fields("Kickoff"), &audit()).unwrap().meeting.id;

        set_down(&h, true);
        let mut offline = sample_fields("Kickoff");
        offline.notes = Some("offline note".to_string());
        h.update(id, offline.clone(), &audit()).unwrap();
        offline.location = Some("Room 9".to_string());
        h.update(id, offline, &audit()).unwrap();
        set_down(&h, false);

        let mut online = sample_fields("Kickoff");
        online.priority = Some("Low".to_string());
        let out = h.update(id, online, &audit()).unwrap();
        assert!(!out.mirrored);
        assert_eq!(out.meeting.sync_version, 2);
        let local = h.backup().get(id).unwrap().unwrap();
        assert_eq!(local.fields.notes.as_deref(), Some("offline note"));
        assert_eq!(local.fields.location.as_deref(), Some("Room 9"));
        assert_eq!(local.sync_version, 3);

        h.reconcile(&audit()).unwrap();
        let remote = h.primary().unwrap().inner.get(id).unwrap().unwrap();
        assert_eq!(remote.fields.notes.as_deref(), Some("offline note"));
        assert_eq!(remote.fields.location.as_deref(), Some("Room 9"));
        assert!(h.pending().unwrap().is_empty());
        assert_eq!(h.sync_state(id).unwrap(), SyncState::InSync);
    }

    #[test]
    fn test_online_edit_supersedes_older_offline_edit() {
        let h = harness();
        let id = h.create(sample_fields("Kickoff"), &audit()).unwrap().meeting.id;

        set_down(&h, true);
        let mut offline = sample_fields("Kickoff");
        offline.notes = Some("offline note".to_string());
        h.update(id, offline, &audit()).unwrap();
        set_down(&h, false);

        let mut online = sample_fields("Kickoff");
        online.notes = Some("online note".to_string());
        let out = h.update(id, online, &audit()).unwrap();
        assert!(out.mirrored);
        assert!(h.pending().unwrap().is_empty());
        let local = h.backup().get(id).unwrap().unwrap();
        assert_eq!(local.fields.notes.as_deref(), Some("online note"));
    }

    #[test]
    fn test_online_edit_after_offline_delete_restores_meeting() {
        let h = harness();
        let id = h.create(sample_fields("Kickoff"), &audit()).unwrap().meeting.id;
        set_down(&h, true);
        h.delete(id, &audit()).unwrap();
        set_down(&h, false);

        let mut online = sample_fields("Kickoff");
        online.location = Some("Room 4".to_string());
        let out = h.update(id, online, &audit()).unwrap();
        assert!(out.mirrored);
        assert!(h.pending().unwrap().is_empty());

        assert_eq!(h.reconcile(&audit()).unwrap(), ReconcileReport::default());
        assert!(h.primary().unwrap().inner.get(id).unwrap().is_some());
        let local = h.backup().get(id).unwrap().unwrap();
        assert_eq!(local.fields.location.as_deref(), Some("Room 4"));
    }

    #[test]
    fn test_reconcile_skips_delete_older_than_relational_edit() {
        let h = harness();
        let id = h.create(sample_fields("Kickoff"), &audit()).unwrap().meeting.id;
        // Deleted offline at a time before the relational copy was last edited.
        h.backup().apply_pending(&Change::Delete(id), at(8, 0)).unwrap();

        let report = h.reconcile(&audit()).unwrap();
        assert_eq!(report.reconciled, 1);
        assert!(h.primary().unwrap().inner.get(id).unwrap().is_some());
        assert!(h.backup().get(id).unwrap().is_some());
        assert!(h.pending().unwrap().is_empty());
    }

    #[test]
    fn test_online_delete_drops_unsynced_local_edit() {
        let h = harness();
        let id = h.create(sample_fields("Kickoff"), &audit()).unwrap().meeting.id;
        set_down(&h, true);
        let mut offline = sample_fields("Kickoff");
        offline.notes = Some("offline note".to_string());
        h.update(id, offline, &audit()).unwrap();
        set_down(&h, false);

        let out = h.delete(id, &audit()).unwrap();
        assert!(out.mirrored);
        assert!(h.pending().unwrap().is_empty());
        assert!(h.backup().get(id).unwrap().is_none());
        assert_eq!(h.reconcile(&audit()).unwrap(), ReconcileReport::default());
    }

    #[test]
    fn test_audit_failure_never_falls_back() {
        let h = harness();
        let id = h.create(sample_fields("Kickoff"), &audit()).unwrap().meeting.id;
        raw_exec(&h.primary().unwrap().inner, "DROP TABLE meetings_audit_log;");

        let mut fields = sample_fields("Kickoff");
        fields.notes = Some("never stored".to_string());
        let err = h.update(id, fields, &audit()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuditFailure);
        assert!(h.pending().unwrap().is_empty());

        let local = h.backup().get(id).unwrap().unwrap();
        assert_eq!(local.fields.notes, None);
        assert_eq!(local.sync_version, 1);
        let remote = h.primary().unwrap().inner.get(id).unwrap().unwrap();
        assert_eq!(remote.fields.notes, None);
        assert_eq!(remote.sync_version, 1);
    }

    #[test]
    fn test_mirror_failure_still_reports_committed_write() {
        let h = harness();
        let held = FileLock::acquire(
            h.backup().path(),
            "editor",
            &RetryPolicy {
                max_attempts: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
            },
        )
        .unwrap();

        let out = h.create(sample_fields("Kickoff"), &audit()).unwrap();
        assert!(!out.mirrored);
        assert!(!out.degraded);
        let remote = h.primary().unwrap().inner.get(out.meeting.id).unwrap().unwrap();
        assert_eq!(remote.last_synced_at, None);

        drop(held);
        assert!(h.backup().get(out.meeting.id).unwrap().is_none());
        assert!(h.pending().unwrap().is_empty());
        assert_eq!(h.sync_state(out.meeting.id).unwrap(), SyncState::PrimaryOnly);
    }
}
