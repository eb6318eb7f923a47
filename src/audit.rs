//! Field-level change history for meetings.
//!
//! Entries are built here and appended by the relational store inside the
//! same transaction as the mutation they describe (see `db::audit_log`).
//! An UPDATE whose tracked fields all compare equal after normalization
//! produces no entry at all.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Meeting, MeetingId};

/// Origin label recorded when the caller does not provide one.
pub const DEFAULT_ORIGIN: &str = "dashboard";

/// Actor recorded when the caller does not identify itself.
pub const DEFAULT_ACTOR: &str = "system";

/// Business columns eligible for change detection, in schema order.
pub const TRACKED_FIELDS: &[&str] = &[
    "title",
    "organization",
    "client",
    "stakeholder_name",
    "purpose",
    "agenda",
    "start_at",
    "end_at",
    "time_zone",
    "meeting_type",
    "meeting_link",
    "location",
    "priority",
    "attendees",
    "guests",
    "notes",
    "next_action",
    "follow_up_date",
    "reminder_sent",
    "calendar_sync",
    "calendar_event_title",
    "status_override",
];

/// Bookkeeping columns. Present in snapshots, never diffed.
pub const BOOKKEEPING_FIELDS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "last_synced_at",
    "sync_version",
];

/// Who made a change and through which surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub actor: String,
    pub origin: Option<String>,
}

impl Default for AuditContext {
    fn default() -> Self {
        Self {
            actor: DEFAULT_ACTOR.to_string(),
            origin: None,
        }
    }
}

impl AuditContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Origin label, falling back to [`DEFAULT_ORIGIN`] when unset or blank.
    pub fn origin(&self) -> &str {
        self.origin
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_ORIGIN)
    }

    pub fn actor(&self) -> &str {
        let actor = self.actor.trim();
        if actor.is_empty() {
            DEFAULT_ACTOR
        } else {
            actor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOperation {
    Insert,
    Update,
    Delete,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Insert => "INSERT",
            AuditOperation::Update => "UPDATE",
            AuditOperation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(AuditOperation::Insert),
            "UPDATE" => Ok(AuditOperation::Update),
            "DELETE" => Ok(AuditOperation::Delete),
            other => Err(format!("Unknown audit operation: {other}")),
        }
    }
}

/// A row from `meetings_audit_log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub meeting_id: MeetingId,
    pub operation: AuditOperation,
    pub old_values: Option<Map<String, Value>>,
    pub new_values: Option<Map<String, Value>>,
    pub changed_fields: Vec<String>,
    pub changed_by: String,
    pub changed_from: String,
    pub changed_at: DateTime<Utc>,
}

/// An audit row about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAudit {
    pub meeting_id: MeetingId,
    pub operation: AuditOperation,
    pub old_values: Option<Map<String, Value>>,
    pub new_values: Option<Map<String, Value>>,
    pub changed_fields: Vec<String>,
}

impl PendingAudit {
    pub fn insert(new: &Meeting) -> Self {
        Self {
            meeting_id: new.id,
            operation: AuditOperation::Insert,
            old_values: None,
            new_values: Some(snapshot(new)),
            changed_fields: Vec::new(),
        }
    }

    /// `None` when no tracked field changed.
    pub fn update(old: &Meeting, new: &Meeting) -> Option<Self> {
        let old_values = snapshot(old);
        let new_values = snapshot(new);
        let changed = changed_fields(&old_values, &new_values);
        if changed.is_empty() {
            return None;
        }
        Some(Self {
            meeting_id: new.id,
            operation: AuditOperation::Update,
            old_values: Some(old_values),
            new_values: Some(new_values),
            changed_fields: changed,
        })
    }

    pub fn delete(old: &Meeting) -> Self {
        Self {
            meeting_id: old.id,
            operation: AuditOperation::Delete,
            old_values: Some(snapshot(old)),
            new_values: None,
            changed_fields: Vec::new(),
        }
    }
}

/// Full column snapshot of a meeting, keyed by column name.
pub fn snapshot(meeting: &Meeting) -> Map<String, Value> {
    match serde_json::to_value(meeting) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Tracked fields whose normalized values differ, in schema order.
pub fn changed_fields(old: &Map<String, Value>, new: &Map<String, Value>) -> Vec<String> {
    TRACKED_FIELDS
        .iter()
        .filter(|field| {
            let before = old.get(**field).map(normalize_value).unwrap_or_default();
            let after = new.get(**field).map(normalize_value).unwrap_or_default();
            before != after
        })
        .map(|field| field.to_string())
        .collect()
}

/// Normalize a snapshot value to the string used for change comparison.
///
/// Null and blank text are equal. Numbers compare by value (`1.50 == 1.5`),
/// whether they arrive as JSON numbers or numeric text. RFC 3339 timestamps
/// compare as UTC instants.
pub fn normalize_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => canonical_number(&n.to_string()).unwrap_or_else(|| n.to_string()),
        Value::String(s) => normalize_text(s),
        other => other.to_string(),
    }
}

fn normalize_text(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(number) = canonical_number(trimmed) {
        return number;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return ts
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::AutoSi, true);
    }
    trimmed.to_string()
}

/// Plain decimal text in canonical form: no `+`, no leading integer zeros,
/// no trailing fractional zeros. Compared as text, so precision is exact.
fn canonical_number(text: &str) -> Option<String> {
    let (negative, unsigned) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let (int, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if (int.is_empty() && frac.is_empty()) || !digits(int) || !digits(frac) {
        return None;
    }

    let int = match int.trim_start_matches('0') {
        "" => "0",
        rest => rest,
    };
    let frac = frac.trim_end_matches('0');
    let mut out = String::with_capacity(text.len());
    if negative && !(int == "0" && frac.is_empty()) {
        out.push('-');
    }
    out.push_str(int);
    if !frac.is_empty() {
        out.push('.');
        out.push_str(frac);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{at, sample_fields};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn meeting() -> Meeting {
        Meeting {
            id: 3,
            fields: sample_fields("Acme QBR"),
            created_at: at(7, 0),
            updated_at: at(7, 0),
            last_synced_at: None,
            sync_version: 1,
        }
    }

    #[test]
    fn test_snapshot_columns_are_tracked_or_bookkeeping() {
        let snap = snapshot(&meeting());
        let keys: BTreeSet<&str> = snap.keys().map(String::as_str).collect();
        let expected: BTreeSet<&str> = TRACKED_FIELDS
            .iter()
            .chain(BOOKKEEPING_FIELDS)
            .copied()
            .collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_bookkeeping_only_change_is_not_audited() {
        let old = meeting();
        let mut new = old.clone();
        new.updated_at = at(12, 0);
        new.last_synced_at = Some(at(12, 0));
        new.sync_version = 9;
        assert!(PendingAudit::update(&old, &new).is_none());
    }

    #[test]
    fn test_single_field_change_lists_that_field() {
        let old = meeting();
        let mut new = old.clone();
        new.fields.location = Some("Room 4".to_string());
        let entry = PendingAudit::update(&old, &new).expect("should audit");
        assert_eq!(entry.operation, AuditOperation::Update);
        assert_eq!(entry.changed_fields, vec!["location".to_string()]);
    }

    #[test]
    fn test_changed_fields_follow_schema_order() {
        let old = meeting();
        let mut new = old.clone();
        new.fields.status_override = true;
        new.fields.title = "Acme QBR (moved)".to_string();
        new.fields.end_at = at(10, 30);
        let entry = PendingAudit::update(&old, &new).unwrap();
        assert_eq!(entry.changed_fields, vec!["title", "end_at", "status_override"]);
    }

    #[test]
    fn test_normalization_ignores_formatting_noise() {
        assert_eq!(normalize_value(&json!(1.50)), normalize_value(&json!("1.5")));
        assert_eq!(normalize_value(&json!(2.0)), normalize_value(&json!(2)));
        assert_eq!(normalize_value(&json!("  Room 4 ")), normalize_value(&json!("Room 4")));
        assert_eq!(normalize_value(&Value::Null), normalize_value(&json!("")));
        assert_eq!(
            normalize_value(&json!("2026-03-02T09:00:00Z")),
            normalize_value(&json!("2026-03-02T10:00:00+01:00"))
        );
        assert_ne!(normalize_value(&json!("1.5")), normalize_value(&json!("1.05")));
        assert_ne!(normalize_value(&json!("Room 4")), normalize_value(&json!("room 4")));
        assert_eq!(normalize_value(&json!("+007.250")), "7.25");
        assert_eq!(normalize_value(&json!("-0.0")), "0");
        assert_eq!(normalize_value(&json!("12.")), "12");
    }

    #[test]
    fn test_long_digit_strings_stay_distinct() {
        assert_ne!(
            normalize_value(&json!("12345678901234567")),
            normalize_value(&json!("12345678901234568"))
        );
        assert_ne!(
            normalize_value(&json!("0.10000000000000000001")),
            normalize_value(&json!("0.1"))
        );

        let mut new = meeting();
        new.fields.meeting_link = Some("12345678901234568".into());
        let mut before = meeting();
        before.fields.meeting_link = Some("12345678901234567".into());
        let changed = changed_fields(&snapshot(&before), &snapshot(&new));
        assert_eq!(changed, vec!["meeting_link".to_string()]);
    }

    #[test]
    fn test_insert_and_delete_snapshots() {
        let m = meeting();
        let insert = PendingAudit::insert(&m);
        assert!(insert.old_values.is_none());
        assert_eq!(insert.new_values.as_ref().unwrap()["title"], json!("Acme QBR"));

        let delete = PendingAudit::delete(&m);
        assert!(delete.new_values.is_none());
        assert_eq!(delete.old_values.as_ref().unwrap()["id"], json!(3));
        assert!(delete.changed_fields.is_empty());
    }

    #[test]
    fn test_context_defaults() {
        let ctx = AuditContext::new("  ");
        assert_eq!(ctx.actor(), DEFAULT_ACTOR);
        assert_eq!(ctx.origin(), DEFAULT_ORIGIN);
        let ctx = AuditContext::new("dana").with_origin("import");
        assert_eq!(ctx.actor(), "dana");
        assert_eq!(ctx.origin(), "import");
    }
}
