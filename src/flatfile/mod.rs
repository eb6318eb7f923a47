//! CSV-backed meeting store.
//!
//! The flat file mirrors the relational `meetings` table with spreadsheet
//! headers, so it can be opened directly in a spreadsheet application. It
//! keeps no audit log. When the relational store is unreachable it takes
//! writes on its own and records a pending-sync marker per meeting in a
//! sidecar `<file>.pending.csv`. Data and markers are only touched while
//! holding the same advisory lock, so they cannot drift apart.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::audit::AuditContext;
use crate::error::{ErrorContext, Operation, StoreError, StoreKind};
use crate::store::{MeetingStore, PendingMarker, PendingOp, PendingSync};
use crate::types::{now_utc, Change, Meeting, MeetingFields, MeetingFilter, MeetingId};

pub mod lock;
pub mod row;

pub use lock::{FileLock, LockError, RetryPolicy};

/// In-memory view of the data file and its markers while the lock is held.
#[derive(Debug, Default)]
struct Table {
    meetings: BTreeMap<MeetingId, Meeting>,
    pending: BTreeMap<MeetingId, PendingMarker>,
    meetings_dirty: bool,
    pending_dirty: bool,
}

impl Table {
    fn next_id(&self) -> MeetingId {
        let max_meeting = self.meetings.keys().next_back().copied().unwrap_or(0);
        let max_marker = self.pending.keys().next_back().copied().unwrap_or(0);
        max_meeting.max(max_marker) + 1
    }

    fn put(&mut self, meeting: Meeting) {
        self.meetings.insert(meeting.id, meeting);
        self.meetings_dirty = true;
    }

    fn remove(&mut self, id: MeetingId) -> Option<Meeting> {
        let removed = self.meetings.remove(&id);
        self.meetings_dirty |= removed.is_some();
        removed
    }

    fn mark(&mut self, id: MeetingId, op: PendingOp, at: DateTime<Utc>) {
        let existing = self.pending.remove(&id);
        let merged = match &existing {
            Some(existing) => PendingOp::merge(existing.op, op),
            None => Some(op),
        };
        if let Some(op) = merged {
            let mut marker = PendingMarker::new(id, op, at);
            if let Some(key) = existing.and_then(|m| m.sync_key).filter(|_| op == PendingOp::Insert) {
                marker.sync_key = Some(key);
            }
            self.pending.insert(id, marker);
        }
        self.pending_dirty = true;
    }

    fn unmark(&mut self, id: MeetingId) -> Option<PendingMarker> {
        let removed = self.pending.remove(&id);
        self.pending_dirty |= removed.is_some();
        removed
    }

    /// Move a locally created meeting that has not reached the primary yet
    /// out of the way of `id`, which the primary now owns.
    fn evict_local_insert(&mut self, id: MeetingId) {
        let is_local = self
            .pending
            .get(&id)
            .is_some_and(|m| m.op == PendingOp::Insert);
        if !is_local {
            return;
        }
        let new_id = self.next_id();
        if let (Some(mut meeting), Some(mut marker)) = (self.remove(id), self.unmark(id)) {
            log::info!("Moving unsynced local meeting {id} to {new_id}; id taken by primary");
            meeting.id = new_id;
            marker.meeting_id = new_id;
            self.put(meeting);
            self.pending.insert(new_id, marker);
            self.pending_dirty = true;
        }
    }
}

pub struct FlatFileStore {
    path: PathBuf,
    retry: RetryPolicy,
}

impl FlatFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pending_path(&self) -> PathBuf {
        lock::sibling(&self.path, "pending.csv")
    }

    fn lock(&self, ctx: ErrorContext) -> Result<FileLock, StoreError> {
        FileLock::acquire(&self.path, ctx.operation.as_str(), &self.retry)
            .map_err(|e| StoreError::unavailable(ctx, e.to_string()))
    }

    fn io_error(ctx: ErrorContext, path: &Path, err: io::Error) -> StoreError {
        StoreError::unavailable(ctx, format!("{}: {}", path.display(), err))
    }

    fn load(&self, ctx: ErrorContext) -> Result<Table, StoreError> {
        let mut table = Table::default();
        for meeting in read_meetings(&self.path, ctx)? {
            if table.meetings.insert(meeting.id, meeting.clone()).is_some() {
                return Err(StoreError::validation(
                    ctx,
                    format!("{}: duplicate Meeting ID {}", self.path.display(), meeting.id),
                ));
            }
        }
        for marker in read_markers(&self.pending_path(), ctx)? {
            table.pending.insert(marker.meeting_id, marker);
        }
        Ok(table)
    }

    fn save(&self, ctx: ErrorContext, table: &Table) -> Result<(), StoreError> {
        if table.meetings_dirty {
            let mut writer = csv::Writer::from_writer(Vec::new());
            let write = |writer: &mut csv::Writer<Vec<u8>>| -> csv::Result<()> {
                writer.write_record(row::HEADERS)?;
                for meeting in table.meetings.values() {
                    writer.write_record(&row::meeting_to_record(meeting, None))?;
                }
                writer.flush()?;
                Ok(())
            };
            write(&mut writer).map_err(|e| StoreError::internal(ctx, e.to_string()))?;
            let bytes = writer
                .into_inner()
                .map_err(|e| StoreError::internal(ctx, e.to_string()))?;
            write_atomic(&self.path, &bytes).map_err(|e| Self::io_error(ctx, &self.path, e))?;
        }
        if table.pending_dirty {
            let path = self.pending_path();
            if table.pending.is_empty() {
                match fs::remove_file(&path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => {
                        return Err(Self::io_error(ctx, &path, e));
                    }
                    _ => {}
                }
            } else {
                let mut writer = csv::Writer::from_writer(Vec::new());
                for marker in table.pending.values() {
                    writer
                        .serialize(marker)
                        .map_err(|e| StoreError::internal(ctx, e.to_string()))?;
                }
                let bytes = writer
                    .into_inner()
                    .map_err(|e| StoreError::internal(ctx, e.to_string()))?;
                write_atomic(&path, &bytes).map_err(|e| Self::io_error(ctx, &path, e))?;
            }
        }
        Ok(())
    }

    /// Read under the lock.
    fn read<T>(&self, ctx: ErrorContext, f: impl FnOnce(&Table) -> T) -> Result<T, StoreError> {
        let _lock = self.lock(ctx)?;
        let table = self.load(ctx)?;
        Ok(f(&table))
    }

    /// Load, modify and save under one lock. Nothing is written if `f` fails.
    fn modify<T>(
        &self,
        ctx: ErrorContext,
        f: impl FnOnce(&mut Table) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock(ctx)?;
        let mut table = self.load(ctx)?;
        let value = f(&mut table)?;
        self.save(ctx, &table)?;
        Ok(value)
    }

    /// Write every meeting, with its computed status, to `dest`.
    pub fn export_to(&self, dest: &Path, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let ctx = ErrorContext::new(Operation::Export, StoreKind::FlatFile);
        let meetings = self.read(ctx, |t| t.meetings.values().cloned().collect::<Vec<_>>())?;
        export_meetings(ctx, dest, &meetings, now)
    }
}

/// Write meetings as a spreadsheet CSV with the Status column filled in.
pub fn export_meetings(
    ctx: ErrorContext,
    dest: &Path,
    meetings: &[Meeting],
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut write = || -> csv::Result<()> {
        writer.write_record(row::HEADERS)?;
        for meeting in meetings {
            writer.write_record(&row::meeting_to_record(meeting, Some(meeting.status_at(now))))?;
        }
        writer.flush()?;
        Ok(())
    };
    write().map_err(|e| StoreError::internal(ctx, e.to_string()))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| StoreError::internal(ctx, e.to_string()))?;
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| FlatFileStore::io_error(ctx, parent, e))?;
    }
    write_atomic(dest, &bytes).map_err(|e| FlatFileStore::io_error(ctx, dest, e))?;
    log::info!("Exported {} meetings to {}", meetings.len(), dest.display());
    Ok(meetings.len())
}

/// Replace `path` with `bytes` via a temp file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_meetings(path: &Path, ctx: ErrorContext) -> Result<Vec<Meeting>, StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FlatFileStore::io_error(ctx, path, e)),
    };
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    let headers = reader
        .headers()
        .map_err(|e| StoreError::validation(ctx, format!("{}: {}", path.display(), e)))?
        .clone();
    let index = row::HeaderIndex::new(headers.iter());
    for required in [row::ID, row::TITLE, row::START, row::END] {
        if !index.has(required) {
            return Err(StoreError::validation(
                ctx,
                format!("{}: missing column '{}'", path.display(), required),
            ));
        }
    }

    let mut meetings = Vec::new();
    for (i, record) in reader.records().enumerate() {
        // Header is line 1.
        let line = i + 2;
        let record = record
            .map_err(|e| StoreError::validation(ctx, format!("{} row {}: {}", path.display(), line, e)))?;
        let cells: Vec<String> = record.iter().map(str::to_string).collect();
        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let meeting = row::meeting_from_row(&index, &cells)
            .map_err(|e| StoreError::validation(ctx, format!("{} row {}: {}", path.display(), line, e)))?;
        meetings.push(meeting);
    }
    Ok(meetings)
}

fn read_markers(path: &Path, ctx: ErrorContext) -> Result<Vec<PendingMarker>, StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FlatFileStore::io_error(ctx, path, e)),
    };
    csv::Reader::from_reader(file)
        .deserialize()
        .collect::<Result<Vec<PendingMarker>, _>>()
        .map_err(|e| StoreError::validation(ctx, format!("{}: {}", path.display(), e)))
}

fn ctx_for(operation: Operation, id: Option<MeetingId>) -> ErrorContext {
    ErrorContext::new(operation, StoreKind::FlatFile).maybe_meeting(id)
}

fn checked_fields(ctx: ErrorContext, fields: &MeetingFields) -> Result<MeetingFields, StoreError> {
    let fields = fields.clone().normalized();
    fields
        .validate()
        .map_err(|errors| StoreError::validation(ctx, errors.join("; ")))?;
    Ok(fields)
}

fn insert_into(table: &mut Table, fields: MeetingFields) -> Meeting {
    let now = now_utc();
    let meeting = Meeting {
        id: table.next_id(),
        fields,
        created_at: now,
        updated_at: now,
        last_synced_at: None,
        sync_version: 1,
    };
    table.put(meeting.clone());
    meeting
}

/// The flag is false when the fields were already current.
fn update_in(
    table: &mut Table,
    ctx: ErrorContext,
    id: MeetingId,
    fields: MeetingFields,
) -> Result<(Meeting, bool), StoreError> {
    let old = table
        .meetings
        .get(&id)
        .cloned()
        .ok_or_else(|| StoreError::not_found(ctx))?;
    if old.fields == fields {
        return Ok((old, false));
    }
    let new = Meeting {
        fields,
        updated_at: now_utc(),
        sync_version: old.sync_version + 1,
        ..old
    };
    table.put(new.clone());
    Ok((new, true))
}

fn delete_from(table: &mut Table, ctx: ErrorContext, id: MeetingId) -> Result<Meeting, StoreError> {
    table.remove(id).ok_or_else(|| StoreError::not_found(ctx))
}

impl MeetingStore for FlatFileStore {
    fn kind(&self) -> StoreKind {
        StoreKind::FlatFile
    }

    fn insert(&self, fields: &MeetingFields, _audit: &AuditContext) -> Result<Meeting, StoreError> {
        let ctx = ctx_for(Operation::Insert, None);
        let fields = checked_fields(ctx, fields)?;
        self.modify(ctx, |table| Ok(insert_into(table, fields)))
    }

    fn update(
        &self,
        id: MeetingId,
        fields: &MeetingFields,
        _audit: &AuditContext,
    ) -> Result<Meeting, StoreError> {
        let ctx = ctx_for(Operation::Update, Some(id));
        let fields = checked_fields(ctx, fields)?;
        self.modify(ctx, |table| Ok(update_in(table, ctx, id, fields)?.0))
    }

    fn delete(&self, id: MeetingId, _audit: &AuditContext) -> Result<Meeting, StoreError> {
        let ctx = ctx_for(Operation::Delete, Some(id));
        self.modify(ctx, |table| delete_from(table, ctx, id))
    }

    fn get(&self, id: MeetingId) -> Result<Option<Meeting>, StoreError> {
        let ctx = ctx_for(Operation::Get, Some(id));
        self.read(ctx, |table| table.meetings.get(&id).cloned())
    }

    fn list(&self, filter: &MeetingFilter) -> Result<Vec<Meeting>, StoreError> {
        let ctx = ctx_for(Operation::List, None);
        let now = filter.now();
        let mut meetings = self.read(ctx, |table| {
            table
                .meetings
                .values()
                .filter(|m| filter.matches(m, now))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        meetings.sort_by(|a, b| {
            a.fields
                .start_at
                .cmp(&b.fields.start_at)
                .then(a.id.cmp(&b.id))
        });
        Ok(meetings)
    }

    fn upsert(&self, meeting: &Meeting, _audit: &AuditContext) -> Result<Meeting, StoreError> {
        let ctx = ctx_for(Operation::Upsert, Some(meeting.id));
        let mut incoming = meeting.clone();
        incoming.fields = checked_fields(ctx, &incoming.fields)?;
        self.modify(ctx, |table| {
            table.evict_local_insert(incoming.id);
            if let Some(existing) = table.meetings.get(&incoming.id) {
                incoming.created_at = existing.created_at;
                if *existing == incoming {
                    return Ok(incoming);
                }
            }
            table.put(incoming.clone());
            Ok(incoming)
        })
    }

    fn mark_synced(&self, id: MeetingId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let ctx = ctx_for(Operation::Update, Some(id));
        self.modify(ctx, |table| {
            let mut meeting = table
                .meetings
                .get(&id)
                .cloned()
                .ok_or_else(|| StoreError::not_found(ctx))?;
            meeting.last_synced_at = Some(at);
            table.put(meeting);
            Ok(())
        })
    }
}

impl PendingSync for FlatFileStore {
    fn apply_pending(
        &self,
        change: &Change,
        marked_at: DateTime<Utc>,
    ) -> Result<Meeting, StoreError> {
        let ctx = ctx_for(change.operation(), change.meeting_id());
        let checked = match change {
            Change::Insert(fields) | Change::Update(_, fields) => Some(checked_fields(ctx, fields)?),
            Change::Delete(_) => None,
        };
        self.modify(ctx, |table| match (change, checked) {
            (Change::Insert(_), Some(fields)) => {
                let meeting = insert_into(table, fields);
                table.mark(meeting.id, PendingOp::Insert, marked_at);
                Ok(meeting)
            }
            (Change::Update(id, _), Some(fields)) => {
                let (meeting, changed) = update_in(table, ctx, *id, fields)?;
                if changed {
                    table.mark(*id, PendingOp::Update, marked_at);
                }
                Ok(meeting)
            }
            (Change::Delete(id), _) => {
                let meeting = delete_from(table, ctx, *id)?;
                table.mark(*id, PendingOp::Delete, marked_at);
                Ok(meeting)
            }
            _ => Err(StoreError::internal(ctx, "change without fields")),
        })
    }

    fn pending(&self) -> Result<Vec<PendingMarker>, StoreError> {
        let ctx = ctx_for(Operation::Reconcile, None);
        self.read(ctx, |table| table.pending.values().cloned().collect())
    }

    fn clear_pending(&self, marker: &PendingMarker) -> Result<bool, StoreError> {
        let ctx = ctx_for(Operation::Reconcile, Some(marker.meeting_id));
        self.modify(ctx, |table| {
            if table.pending.get(&marker.meeting_id) != Some(marker) {
                return Ok(false);
            }
            table.unmark(marker.meeting_id);
            Ok(true)
        })
    }

    fn adopt(&self, local_id: MeetingId, primary: &Meeting) -> Result<(), StoreError> {
        let ctx = ctx_for(Operation::Reconcile, Some(local_id));
        self.modify(ctx, |table| {
            table.remove(local_id);
            table.unmark(local_id);
            if primary.id != local_id {
                table.evict_local_insert(primary.id);
            }
            table.put(primary.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::{FlatFileStore, RetryPolicy};

    /// Flat-file store in a leaked temp dir with fast retries.
    pub fn test_backup() -> FlatFileStore {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("meetings.csv");
        std::mem::forget(dir);
        FlatFileStore::new(path).with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        })
    }
}
