//! Shared domain types for meetings and store requests.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{classify, MeetingStatus};

/// Meeting identifier. Assigned by the store on creation, never reused.
pub type MeetingId = i64;

/// Business data of a meeting as captured by the form layer.
///
/// Everything here is a tracked field for the audit log.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeetingFields {
    pub title: String,
    pub organization: Option<String>,
    pub client: Option<String>,
    pub stakeholder_name: Option<String>,
    pub purpose: Option<String>,
    pub agenda: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub time_zone: Option<String>,
    pub meeting_type: Option<String>,
    pub meeting_link: Option<String>,
    pub location: Option<String>,
    pub priority: Option<String>,
    pub attendees: Option<String>,
    /// Internal/external guests.
    pub guests: Option<String>,
    pub notes: Option<String>,
    pub next_action: Option<String>,
    pub follow_up_date: Option<NaiveDate>,
    pub reminder_sent: bool,
    pub calendar_sync: bool,
    pub calendar_event_title: Option<String>,
    /// Manual "Completed" override. Fixes the status until cleared.
    pub status_override: bool,
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

impl MeetingFields {
    /// Check the form-level invariants. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.title.trim().is_empty() {
            errors.push("Meeting Title is required".to_string());
        }
        if is_blank(&self.stakeholder_name) {
            errors.push("Stakeholder Name is required".to_string());
        }
        if is_blank(&self.attendees) {
            errors.push("Attendees is required".to_string());
        }
        if is_blank(&self.guests) {
            errors.push("Internal External Guests is required".to_string());
        }
        if self.end_at < self.start_at {
            errors.push("End time must not be before start time".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Trim text fields and collapse whitespace-only values to `None`.
    pub fn normalized(mut self) -> Self {
        fn clean(value: &mut Option<String>) {
            *value = value
                .take()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
        }
        self.title = self.title.trim().to_string();
        for field in [
            &mut self.organization,
            &mut self.client,
            &mut self.stakeholder_name,
            &mut self.purpose,
            &mut self.agenda,
            &mut self.time_zone,
            &mut self.meeting_type,
            &mut self.meeting_link,
            &mut self.location,
            &mut self.priority,
            &mut self.attendees,
            &mut self.guests,
            &mut self.notes,
            &mut self.next_action,
            &mut self.calendar_event_title,
        ] {
            clean(field);
        }
        self
    }
}

/// A stored meeting: business fields plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: MeetingId,
    #[serde(flatten)]
    pub fields: MeetingFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Bumped on every business-data change; compared across stores.
    pub sync_version: i64,
}

impl Meeting {
    /// Status as of `now`. Never cached, "now" moves independently of the row.
    pub fn status_at(&self, now: DateTime<Utc>) -> MeetingStatus {
        classify(
            self.fields.start_at,
            self.fields.end_at,
            self.fields.status_override,
            now,
        )
    }
}

/// A meeting paired with the status computed at read time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeetingView {
    #[serde(flatten)]
    pub meeting: Meeting,
    pub status: MeetingStatus,
}

impl MeetingView {
    pub fn at(meeting: Meeting, now: DateTime<Utc>) -> Self {
        let status = meeting.status_at(now);
        Self { meeting, status }
    }
}

/// Listing criteria, mirroring the dashboard's filter bar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeetingFilter {
    pub status: Option<MeetingStatus>,
    /// Inclusive start date (UTC) of the meeting.
    pub from: Option<NaiveDate>,
    /// Inclusive end date (UTC); covers the whole day.
    pub to: Option<NaiveDate>,
    /// Case-insensitive substring over the searchable text fields.
    pub search: Option<String>,
    /// Reference time for status filtering. Defaults to now.
    pub as_of: Option<DateTime<Utc>>,
}

impl MeetingFilter {
    pub fn now(&self) -> DateTime<Utc> {
        self.as_of.unwrap_or_else(Utc::now)
    }

    fn search_needle(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }

    /// Whether the meeting passes every criterion. Status is evaluated at `now`.
    pub fn matches(&self, meeting: &Meeting, now: DateTime<Utc>) -> bool {
        let date = meeting.fields.start_at.date_naive();
        if self.from.is_some_and(|from| date < from) {
            return false;
        }
        if self.to.is_some_and(|to| date > to) {
            return false;
        }
        if let Some(status) = self.status {
            if meeting.status_at(now) != status {
                return false;
            }
        }
        if let Some(needle) = self.search_needle() {
            let f = &meeting.fields;
            let haystacks = [
                Some(&f.title),
                f.organization.as_ref(),
                f.client.as_ref(),
                f.stakeholder_name.as_ref(),
                f.purpose.as_ref(),
                f.attendees.as_ref(),
                f.guests.as_ref(),
                f.notes.as_ref(),
            ];
            let hit = haystacks
                .into_iter()
                .flatten()
                .any(|text| text.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        true
    }
}

/// One logical write requested by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert(MeetingFields),
    Update(MeetingId, MeetingFields),
    Delete(MeetingId),
}

impl Change {
    pub fn operation(&self) -> crate::error::Operation {
        use crate::error::Operation;
        match self {
            Change::Insert(_) => Operation::Insert,
            Change::Update(..) => Operation::Update,
            Change::Delete(_) => Operation::Delete,
        }
    }

    pub fn meeting_id(&self) -> Option<MeetingId> {
        match self {
            Change::Insert(_) => None,
            Change::Update(id, _) | Change::Delete(id) => Some(*id),
        }
    }
}

/// Current UTC time truncated to whole seconds, the precision stored on disk.
pub fn now_utc() -> DateTime<Utc> {
    use chrono::SubsecRound;
    Utc::now().trunc_subsecs(0)
}

/// RFC 3339 with whole seconds and a `Z` suffix: the on-disk timestamp form
/// for both stores.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
