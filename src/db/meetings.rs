use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

use super::audit_log::append_audit;
use super::*;
use crate::audit::{AuditContext, PendingAudit};
use crate::store::MeetingStore;
use crate::types::{format_ts, now_utc, Meeting, MeetingFields, MeetingFilter, MeetingId};

const MEETING_COLUMNS: &str = "id, title, organization, client, stakeholder_name, purpose, agenda,
     start_at, end_at, time_zone, meeting_type, meeting_link, location, priority,
     attendees, guests, notes, next_action, follow_up_date, reminder_sent, calendar_sync,
     calendar_event_title, status_override, created_at, updated_at, last_synced_at, sync_version";

pub(crate) fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, s)).transpose()
}

fn parse_opt_date(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn row_to_meeting(row: &Row<'_>) -> rusqlite::Result<Meeting> {
    Ok(Meeting {
        id: row.get(0)?,
        fields: MeetingFields {
            title: row.get(1)?,
            organization: row.get(2)?,
            client: row.get(3)?,
            stakeholder_name: row.get(4)?,
            purpose: row.get(5)?,
            agenda: row.get(6)?,
            start_at: parse_ts(7, row.get(7)?)?,
            end_at: parse_ts(8, row.get(8)?)?,
            time_zone: row.get(9)?,
            meeting_type: row.get(10)?,
            meeting_link: row.get(11)?,
            location: row.get(12)?,
            priority: row.get(13)?,
            attendees: row.get(14)?,
            guests: row.get(15)?,
            notes: row.get(16)?,
            next_action: row.get(17)?,
            follow_up_date: parse_opt_date(18, row.get(18)?)?,
            reminder_sent: row.get(19)?,
            calendar_sync: row.get(20)?,
            calendar_event_title: row.get(21)?,
            status_override: row.get(22)?,
        },
        created_at: parse_ts(23, row.get(23)?)?,
        updated_at: parse_ts(24, row.get(24)?)?,
        last_synced_at: parse_opt_ts(25, row.get(25)?)?,
        sync_version: row.get(26)?,
    })
}

fn select_meeting(conn: &Connection, id: MeetingId) -> rusqlite::Result<Option<Meeting>> {
    conn.query_row(
        &format!("SELECT {MEETING_COLUMNS} FROM meetings WHERE id = ?1"),
        params![id],
        row_to_meeting,
    )
    .optional()
}

fn insert_row(conn: &Connection, m: &Meeting) -> rusqlite::Result<()> {
    let f = &m.fields;
    conn.execute(
        &format!(
            "INSERT INTO meetings ({MEETING_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)"
        ),
        params![
            m.id,
            f.title,
            f.organization,
            f.client,
            f.stakeholder_name,
            f.purpose,
            f.agenda,
            format_ts(&f.start_at),
            format_ts(&f.end_at),
            f.time_zone,
            f.meeting_type,
            f.meeting_link,
            f.location,
            f.priority,
            f.attendees,
            f.guests,
            f.notes,
            f.next_action,
            f.follow_up_date.map(|d| d.format("%Y-%m-%d").to_string()),
            f.reminder_sent,
            f.calendar_sync,
            f.calendar_event_title,
            f.status_override,
            format_ts(&m.created_at),
            format_ts(&m.updated_at),
            m.last_synced_at.as_ref().map(format_ts),
            m.sync_version,
        ],
    )?;
    Ok(())
}

/// Overwrite every column except `id` and `created_at`.
fn update_row(conn: &Connection, m: &Meeting) -> rusqlite::Result<usize> {
    let f = &m.fields;
    conn.execute(
        "UPDATE meetings SET
            title = ?2, organization = ?3, client = ?4, stakeholder_name = ?5,
            purpose = ?6, agenda = ?7, start_at = ?8, end_at = ?9, time_zone = ?10,
            meeting_type = ?11, meeting_link = ?12, location = ?13, priority = ?14,
            attendees = ?15, guests = ?16, notes = ?17, next_action = ?18,
            follow_up_date = ?19, reminder_sent = ?20, calendar_sync = ?21,
            calendar_event_title = ?22, status_override = ?23,
            updated_at = ?24, last_synced_at = ?25, sync_version = ?26
         WHERE id = ?1",
        params![
            m.id,
            f.title,
            f.organization,
            f.client,
            f.stakeholder_name,
            f.purpose,
            f.agenda,
            format_ts(&f.start_at),
            format_ts(&f.end_at),
            f.time_zone,
            f.meeting_type,
            f.meeting_link,
            f.location,
            f.priority,
            f.attendees,
            f.guests,
            f.notes,
            f.next_action,
            f.follow_up_date.map(|d| d.format("%Y-%m-%d").to_string()),
            f.reminder_sent,
            f.calendar_sync,
            f.calendar_event_title,
            f.status_override,
            format_ts(&m.updated_at),
            m.last_synced_at.as_ref().map(format_ts),
            m.sync_version,
        ],
    )
}

/// Next identifier. Never reuses an id that still has audit history, even
/// after the meeting itself was deleted.
fn next_meeting_id(conn: &Connection) -> rusqlite::Result<MeetingId> {
    conn.query_row(
        "SELECT MAX(
            COALESCE((SELECT MAX(id) FROM meetings), 0),
            COALESCE((SELECT MAX(meeting_id) FROM meetings_audit_log), 0)
         ) + 1",
        [],
        |row| row.get(0),
    )
}

fn validate(ctx: ErrorContext, fields: &MeetingFields) -> Result<(), StoreError> {
    fields
        .validate()
        .map_err(|errors| StoreError::validation(ctx, errors.join("; ")))
}

/// Append the audit row or fail the whole transaction.
fn audit_or_fail(
    conn: &Connection,
    ctx: ErrorContext,
    entry: &PendingAudit,
    audit: &AuditContext,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    append_audit(conn, entry, audit, at)
        .map(|_| ())
        .map_err(|msg| StoreError::audit_failure(ctx, msg))
}

/// Assign the next id, write the row and its audit entry.
fn create_meeting(
    conn: &Connection,
    ctx: ErrorContext,
    fields: MeetingFields,
    audit: &AuditContext,
) -> Result<Meeting, StoreError> {
    let id = next_meeting_id(conn).map_err(|e| sqlite_error(ctx, e))?;
    let ctx = ctx.meeting(id);
    let now = now_utc();
    let meeting = Meeting {
        id,
        fields,
        created_at: now,
        updated_at: now,
        last_synced_at: None,
        sync_version: 1,
    };
    insert_row(conn, &meeting).map_err(|e| sqlite_error(ctx, e))?;
    audit_or_fail(conn, ctx, &PendingAudit::insert(&meeting), audit, now)?;
    log::debug!("Inserted meeting {} ({})", id, meeting.fields.title);
    Ok(meeting)
}

impl MeetingStore for MeetingDb {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn insert(&self, fields: &MeetingFields, audit: &AuditContext) -> Result<Meeting, StoreError> {
        let ctx = ErrorContext::new(Operation::Insert, StoreKind::Relational);
        let fields = fields.clone().normalized();
        validate(ctx, &fields)?;

        self.with_transaction(ctx, |tx| create_meeting(tx, ctx, fields, audit))
    }

    fn insert_once(
        &self,
        key: &str,
        fields: &MeetingFields,
        audit: &AuditContext,
    ) -> Result<Meeting, StoreError> {
        let ctx = ErrorContext::new(Operation::Insert, StoreKind::Relational);
        let fields = fields.clone().normalized();
        validate(ctx, &fields)?;

        self.with_transaction(ctx, |tx| {
            let seen: Option<MeetingId> = tx
                .query_row(
                    "SELECT meeting_id FROM meetings_sync_keys WHERE sync_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| sqlite_error(ctx, e))?;
            if let Some(id) = seen {
                let ctx = ctx.meeting(id);
                log::debug!("Sync key {key} already stored as meeting {id}");
                return select_meeting(tx, id)
                    .map_err(|e| sqlite_error(ctx, e))?
                    .ok_or_else(|| StoreError::not_found(ctx));
            }

            let meeting = create_meeting(tx, ctx, fields, audit)?;
            tx.execute(
                "INSERT INTO meetings_sync_keys (sync_key, meeting_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![key, meeting.id, format_ts(&meeting.created_at)],
            )
            .map_err(|e| sqlite_error(ctx.meeting(meeting.id), e))?;
            Ok(meeting)
        })
    }

    fn update(
        &self,
        id: MeetingId,
        fields: &MeetingFields,
        audit: &AuditContext,
    ) -> Result<Meeting, StoreError> {
        let ctx = ErrorContext::new(Operation::Update, StoreKind::Relational).meeting(id);
        let fields = fields.clone().normalized();
        validate(ctx, &fields)?;

        self.with_transaction(ctx, |tx| {
            let old = select_meeting(tx, id)
                .map_err(|e| sqlite_error(ctx, e))?
                .ok_or_else(|| StoreError::not_found(ctx))?;
            let now = now_utc();
            let new = Meeting {
                fields,
                updated_at: now,
                sync_version: old.sync_version + 1,
                ..old.clone()
            };

            // A write that changes no tracked field is not a change at all:
            // no row update, no version bump, no audit entry.
            let Some(entry) = PendingAudit::update(&old, &new) else {
                log::debug!("Update of meeting {id} changed nothing; skipped");
                return Ok(old);
            };

            update_row(tx, &new).map_err(|e| sqlite_error(ctx, e))?;
            audit_or_fail(tx, ctx, &entry, audit, now)?;
            Ok(new)
        })
    }

    fn delete(&self, id: MeetingId, audit: &AuditContext) -> Result<Meeting, StoreError> {
        let ctx = ErrorContext::new(Operation::Delete, StoreKind::Relational).meeting(id);
        self.with_transaction(ctx, |tx| {
            let old = select_meeting(tx, id)
                .map_err(|e| sqlite_error(ctx, e))?
                .ok_or_else(|| StoreError::not_found(ctx))?;
            tx.execute("DELETE FROM meetings WHERE id = ?1", params![id])
                .map_err(|e| sqlite_error(ctx, e))?;
            audit_or_fail(tx, ctx, &PendingAudit::delete(&old), audit, now_utc())?;
            Ok(old)
        })
    }

    fn get(&self, id: MeetingId) -> Result<Option<Meeting>, StoreError> {
        let ctx = ErrorContext::new(Operation::Get, StoreKind::Relational).meeting(id);
        self.with_conn(ctx, |conn| {
            select_meeting(conn, id).map_err(|e| sqlite_error(ctx, e))
        })
    }

    fn list(&self, filter: &MeetingFilter) -> Result<Vec<Meeting>, StoreError> {
        let ctx = ErrorContext::new(Operation::List, StoreKind::Relational);
        // Date bounds narrow the scan; search and status are applied below.
        let lower = filter
            .from
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| format_ts(&d.and_utc()));
        let upper = filter
            .to
            .and_then(|d| d.succ_opt())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| format_ts(&d.and_utc()));

        let meetings = self.with_conn(ctx, |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MEETING_COLUMNS} FROM meetings
                     WHERE (?1 IS NULL OR start_at >= ?1)
                       AND (?2 IS NULL OR start_at < ?2)
                     ORDER BY start_at ASC, id ASC"
                ))
                .map_err(|e| sqlite_error(ctx, e))?;
            let rows = stmt
                .query_map(params![lower, upper], row_to_meeting)
                .map_err(|e| sqlite_error(ctx, e))?;
            let mut meetings = Vec::new();
            for row in rows {
                meetings.push(row.map_err(|e| sqlite_error(ctx, e))?);
            }
            Ok(meetings)
        })?;

        let now = filter.now();
        Ok(meetings
            .into_iter()
            .filter(|m| filter.matches(m, now))
            .collect())
    }

    fn upsert(&self, meeting: &Meeting, audit: &AuditContext) -> Result<Meeting, StoreError> {
        let ctx = ErrorContext::new(Operation::Upsert, StoreKind::Relational).meeting(meeting.id);
        let mut incoming = meeting.clone();
        incoming.fields = incoming.fields.normalized();
        validate(ctx, &incoming.fields)?;

        self.with_transaction(ctx, |tx| {
            let now = now_utc();
            match select_meeting(tx, incoming.id).map_err(|e| sqlite_error(ctx, e))? {
                None => {
                    insert_row(tx, &incoming).map_err(|e| sqlite_error(ctx, e))?;
                    audit_or_fail(tx, ctx, &PendingAudit::insert(&incoming), audit, now)?;
                }
                Some(old) => {
                    incoming.created_at = old.created_at;
                    if incoming == old {
                        return Ok(old);
                    }
                    update_row(tx, &incoming).map_err(|e| sqlite_error(ctx, e))?;
                    // Bookkeeping-only refreshes are written but never audited.
                    if let Some(entry) = PendingAudit::update(&old, &incoming) {
                        audit_or_fail(tx, ctx, &entry, audit, now)?;
                    }
                }
            }
            Ok(incoming)
        })
    }

    fn mark_synced(&self, id: MeetingId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let ctx = ErrorContext::new(Operation::Update, StoreKind::Relational).meeting(id);
        self.with_conn(ctx, |conn| {
            let changed = conn
                .execute(
                    "UPDATE meetings SET last_synced_at = ?2 WHERE id = ?1",
                    params![id, format_ts(&at)],
                )
                .map_err(|e| sqlite_error(ctx, e))?;
            if changed == 0 {
                return Err(StoreError::not_found(ctx));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{raw_exec, test_db};
    use super::*;
    use crate::audit::AuditOperation;
    use crate::error::ErrorKind;
    use crate::status::MeetingStatus;
    use crate::types::fixtures::{at, sample_fields};

    fn ctx() -> AuditContext {
        AuditContext::new("dana")
    }

    #[test]
    fn test_insert_assigns_ids_and_audits() {
        let db = test_db();
        let first = db.insert(&sample_fields("Kickoff"), &ctx()).expect("insert");
        let second = db.insert(&sample_fields("Review"), &ctx()).expect("insert");
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.sync_version, 1);

        let history = db.audit_history(first.id).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].operation, AuditOperation::Insert);
        assert!(history[0].old_values.is_none());
        assert_eq!(history[0].changed_by, "dana");
        assert_eq!(history[0].changed_from, "dashboard");
    }

    #[test]
    fn test_get_round_trips_fields() {
        let db = test_db();
        let mut fields = sample_fields("Kickoff");
        fields.follow_up_date = NaiveDate::from_ymd_opt(2026, 3, 9);
        fields.calendar_sync = true;
        let created = db.insert(&fields, &ctx()).unwrap();

        let loaded = db.get(created.id).unwrap().expect("present");
        assert_eq!(loaded, created);
        assert!(db.get(99).unwrap().is_none());
    }

    #[test]
    fn test_noop_update_writes_no_audit() {
        let db = test_db();
        let created = db.insert(&sample_fields("Kickoff"), &ctx()).unwrap();

        let mut same = created.fields.clone();
        same.title = "  Kickoff  ".to_string();
        let result = db.update(created.id, &same, &ctx()).expect("update");

        assert_eq!(result.sync_version, 1, "no-op must not bump the version");
        assert_eq!(db.audit_history(created.id).unwrap().len(), 1);
    }

    #[test]
    fn test_single_field_update_audits_that_field() {
        let db = test_db();
        let created = db.insert(&sample_fields("Kickoff"), &ctx()).unwrap();

        let mut fields = created.fields.clone();
        fields.location = Some("Room 4".to_string());
        let updated = db.update(created.id, &fields, &ctx().with_origin("cli")).unwrap();
        assert_eq!(updated.sync_version, 2);
        assert_eq!(updated.created_at, created.created_at);

        let history = db.audit_history(created.id).unwrap();
        assert_eq!(history.len(), 2);
        let entry = &history[1];
        assert_eq!(entry.operation, AuditOperation::Update);
        assert_eq!(entry.changed_fields, vec!["location".to_string()]);
        assert_eq!(entry.changed_from, "cli");
        assert_eq!(entry.old_values.as_ref().unwrap()["location"], serde_json::Value::Null);
        assert_eq!(entry.new_values.as_ref().unwrap()["location"], "Room 4");
    }

    #[test]
    fn test_long_numeric_edit_is_not_a_noop() {
        let db = test_db();
        let mut fields = sample_fields("Kickoff");
        fields.meeting_link = Some("12345678901234567".to_string());
        let created = db.insert(&fields, &ctx()).unwrap();

        fields.meeting_link = Some("12345678901234568".to_string());
        let updated = db.update(created.id, &fields, &ctx()).unwrap();
        assert_eq!(updated.sync_version, 2);

        let stored = db.get(created.id).unwrap().expect("present");
        assert_eq!(stored.fields.meeting_link.as_deref(), Some("12345678901234568"));
        let history = db.audit_history(created.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].changed_fields, vec!["meeting_link".to_string()]);
    }

    #[test]
    fn test_insert_once_returns_first_meeting_for_same_key() {
        let db = test_db();
        let first = db
            .insert_once("local:3:2026-03-02T08:00:00Z", &sample_fields("Offline"), &ctx())
            .unwrap();
        let again = db
            .insert_once("local:3:2026-03-02T08:00:00Z", &sample_fields("Offline"), &ctx())
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(db.list(&MeetingFilter::default()).unwrap().len(), 1);
        assert_eq!(db.audit_history(first.id).unwrap().len(), 1);

        let other = db
            .insert_once("local:4:2026-03-02T08:00:00Z", &sample_fields("Offline"), &ctx())
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[test]
    fn test_insert_once_after_delete_is_not_found() {
        let db = test_db();
        let key = "local:1:2026-03-02T08:00:00Z";
        let first = db.insert_once(key, &sample_fields("Offline"), &ctx()).unwrap();
        db.delete(first.id, &ctx()).unwrap();

        let err = db
            .insert_once(key, &sample_fields("Offline"), &ctx())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(db.list(&MeetingFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_delete_audits_tombstone_and_history_survives() {
        let db = test_db();
        let created = db.insert(&sample_fields("Kickoff"), &ctx()).unwrap();
        db.delete(created.id, &ctx()).expect("delete");

        assert!(db.get(created.id).unwrap().is_none());
        let history = db.audit_history(created.id).unwrap();
        assert_eq!(history.len(), 2);
        let tombstone = &history[1];
        assert_eq!(tombstone.operation, AuditOperation::Delete);
        assert!(tombstone.old_values.is_some());
        assert!(tombstone.new_values.is_none());

        // The id is not handed out again.
        let next = db.insert(&sample_fields("Next"), &ctx()).unwrap();
        assert_eq!(next.id, created.id + 1);
    }

    #[test]
    fn test_missing_meeting_is_not_found() {
        let db = test_db();
        let err = db.delete(42, &ctx()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = db.update(42, &sample_fields("Ghost"), &ctx()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_invalid_fields_are_rejected_before_write() {
        let db = test_db();
        let mut fields = sample_fields("Backwards");
        fields.end_at = at(8, 0);
        let err = db.insert(&fields, &ctx()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(db.recent_audit(10).unwrap().is_empty());
    }

    #[test]
    fn test_audit_failure_rolls_back_mutation() {
        let db = test_db();
        let created = db.insert(&sample_fields("Kickoff"), &ctx()).unwrap();
        raw_exec(&db, "DROP TABLE meetings_audit_log;");

        let mut fields = created.fields.clone();
        fields.title = "Renamed".to_string();
        let err = db.update(created.id, &fields, &ctx()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuditFailure);

        let err = db.delete(created.id, &ctx()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuditFailure);

        let stored = db.get(created.id).unwrap().expect("still present");
        assert_eq!(stored.fields.title, "Kickoff");
        assert_eq!(stored.sync_version, 1);
    }

    #[test]
    fn test_list_filters_by_date_search_and_status() {
        let db = test_db();
        let mut morning = sample_fields("Acme QBR");
        morning.client = Some("Globex".to_string());
        db.insert(&morning, &ctx()).unwrap();

        let mut next_day = sample_fields("Planning");
        next_day.start_at = at(9, 0) + chrono::Duration::days(1);
        next_day.end_at = at(10, 0) + chrono::Duration::days(1);
        db.insert(&next_day, &ctx()).unwrap();

        let day = at(9, 0).date_naive();
        let only_first_day = MeetingFilter {
            from: Some(day),
            to: Some(day),
            ..Default::default()
        };
        let found = db.list(&only_first_day).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fields.title, "Acme QBR");

        let search = MeetingFilter {
            search: Some("globex".to_string()),
            ..Default::default()
        };
        assert_eq!(db.list(&search).unwrap().len(), 1);

        let ongoing = MeetingFilter {
            status: Some(MeetingStatus::Ongoing),
            as_of: Some(at(9, 30)),
            ..Default::default()
        };
        let found = db.list(&ongoing).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fields.title, "Acme QBR");

        let all = db.list(&MeetingFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].fields.start_at < all[1].fields.start_at);
    }

    #[test]
    fn test_upsert_inserts_with_given_id_then_updates() {
        let db = test_db();
        let mut meeting = Meeting {
            id: 17,
            fields: sample_fields("Offline"),
            created_at: at(6, 0),
            updated_at: at(6, 0),
            last_synced_at: None,
            sync_version: 3,
        };
        db.upsert(&meeting, &ctx()).expect("insert via upsert");
        assert_eq!(db.get(17).unwrap().unwrap().sync_version, 3);

        meeting.fields.notes = Some("bring slides".to_string());
        meeting.sync_version = 4;
        db.upsert(&meeting, &ctx()).expect("update via upsert");

        let history = db.audit_history(17).unwrap();
        let ops: Vec<_> = history.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![AuditOperation::Insert, AuditOperation::Update]);
        assert_eq!(history[1].changed_fields, vec!["notes".to_string()]);
    }

    #[test]
    fn test_mark_synced_is_not_audited() {
        let db = test_db();
        let created = db.insert(&sample_fields("Kickoff"), &ctx()).unwrap();
        db.mark_synced(created.id, at(12, 0)).unwrap();

        let stored = db.get(created.id).unwrap().unwrap();
        assert_eq!(stored.last_synced_at, Some(at(12, 0)));
        assert_eq!(stored.sync_version, 1);
        assert_eq!(db.audit_history(created.id).unwrap().len(), 1);

        let err = db.mark_synced(99, at(12, 0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
