use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::{Map, Value};

use super::*;
use crate::audit::{AuditContext, AuditEntry, AuditOperation, PendingAudit};
use crate::types::{format_ts, MeetingId};

const AUDIT_COLUMNS: &str = "id, meeting_id, operation, old_values, new_values, changed_fields,
     changed_by, changed_from, changed_at";

/// Append one audit row. Must run inside the mutation's transaction.
pub(crate) fn append_audit(
    conn: &Connection,
    entry: &PendingAudit,
    audit: &AuditContext,
    at: DateTime<Utc>,
) -> Result<i64, String> {
    let encode = |map: &Option<Map<String, Value>>| -> Result<Option<String>, String> {
        map.as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| format!("Failed to encode audit snapshot: {e}"))
    };
    let old_values = encode(&entry.old_values)?;
    let new_values = encode(&entry.new_values)?;
    let changed_fields = if entry.operation == AuditOperation::Update {
        Some(
            serde_json::to_string(&entry.changed_fields)
                .map_err(|e| format!("Failed to encode changed fields: {e}"))?,
        )
    } else {
        None
    };

    conn.execute(
        "INSERT INTO meetings_audit_log
            (meeting_id, operation, old_values, new_values, changed_fields,
             changed_by, changed_from, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.meeting_id,
            entry.operation.as_str(),
            old_values,
            new_values,
            changed_fields,
            audit.actor(),
            audit.origin(),
            format_ts(&at),
        ],
    )
    .map_err(|e| format!("Failed to append audit entry: {e}"))?;
    Ok(conn.last_insert_rowid())
}

fn decode_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<T>> {
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let operation: String = row.get(2)?;
    let operation = operation.parse::<AuditOperation>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(e),
        )
    })?;
    Ok(AuditEntry {
        id: row.get(0)?,
        meeting_id: row.get(1)?,
        operation,
        old_values: decode_json(3, row.get(3)?)?,
        new_values: decode_json(4, row.get(4)?)?,
        changed_fields: decode_json(5, row.get(5)?)?.unwrap_or_default(),
        changed_by: row.get(6)?,
        changed_from: row.get(7)?,
        changed_at: meetings::parse_ts(8, row.get(8)?)?,
    })
}

impl MeetingDb {
    // =========================================================================
    // Audit log (read side; writes happen in `meetings`)
    // =========================================================================

    /// Full history of one meeting, oldest first. Survives the meeting's deletion.
    pub fn audit_history(&self, meeting_id: MeetingId) -> Result<Vec<AuditEntry>, StoreError> {
        let ctx = ErrorContext::new(Operation::History, StoreKind::Relational).meeting(meeting_id);
        self.with_conn(ctx, |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM meetings_audit_log
                     WHERE meeting_id = ?1 ORDER BY id ASC"
                ))
                .map_err(|e| sqlite_error(ctx, e))?;
            let rows = stmt
                .query_map(params![meeting_id], row_to_entry)
                .map_err(|e| sqlite_error(ctx, e))?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| sqlite_error(ctx, e))?);
            }
            Ok(entries)
        })
    }

    /// Most recent audit entries across all meetings, newest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let ctx = ErrorContext::new(Operation::History, StoreKind::Relational);
        self.with_conn(ctx, |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM meetings_audit_log ORDER BY id DESC LIMIT ?1"
                ))
                .map_err(|e| sqlite_error(ctx, e))?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![limit], row_to_entry)
                .map_err(|e| sqlite_error(ctx, e))?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| sqlite_error(ctx, e))?);
            }
            Ok(entries)
        })
    }
}
