//! Spreadsheet row layout shared by the flat file, exports and imports.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use csv::StringRecord;

use crate::status::MeetingStatus;
use crate::types::{format_ts, now_utc, Meeting, MeetingFields, MeetingId};

pub const ID: &str = "Meeting ID";
pub const TITLE: &str = "Meeting Title";
pub const ORGANIZATION: &str = "Organization";
pub const CLIENT: &str = "Client";
pub const STAKEHOLDER: &str = "Stakeholder Name";
pub const PURPOSE: &str = "Purpose";
pub const AGENDA: &str = "Agenda";
pub const START: &str = "Start";
pub const END: &str = "End";
pub const TIME_ZONE: &str = "Time Zone";
pub const MEETING_TYPE: &str = "Meeting Type";
pub const MEETING_LINK: &str = "Meeting Link";
pub const LOCATION: &str = "Location";
pub const PRIORITY: &str = "Priority";
pub const ATTENDEES: &str = "Attendees";
pub const GUESTS: &str = "Internal External Guests";
pub const NOTES: &str = "Notes";
pub const NEXT_ACTION: &str = "Next Action";
pub const FOLLOW_UP: &str = "Follow up Date";
pub const REMINDER_SENT: &str = "Reminder Sent";
pub const CALENDAR_SYNC: &str = "Calendar Sync";
pub const CALENDAR_TITLE: &str = "Calendar Event Title";
pub const STATUS: &str = "Status";
pub const STATUS_OVERRIDE: &str = "Status Override";
pub const CREATED_AT: &str = "Created At";
pub const UPDATED_AT: &str = "Updated At";
pub const LAST_SYNCED_AT: &str = "Last Synced At";
pub const SYNC_VERSION: &str = "Sync Version";

/// Template layout: a date column plus wall-clock start (and optional end).
pub const MEETING_DATE: &str = "Meeting Date";
pub const START_TIME: &str = "Start Time";
pub const END_TIME: &str = "End Time";

/// Length assumed when a template row gives only a start time.
pub const DEFAULT_DURATION_MINUTES: i64 = 60;

/// Column order of the flat file and of exports.
pub const HEADERS: [&str; 28] = [
    ID,
    TITLE,
    ORGANIZATION,
    CLIENT,
    STAKEHOLDER,
    PURPOSE,
    AGENDA,
    START,
    END,
    TIME_ZONE,
    MEETING_TYPE,
    MEETING_LINK,
    LOCATION,
    PRIORITY,
    ATTENDEES,
    GUESTS,
    NOTES,
    NEXT_ACTION,
    FOLLOW_UP,
    REMINDER_SENT,
    CALENDAR_SYNC,
    CALENDAR_TITLE,
    STATUS,
    STATUS_OVERRIDE,
    CREATED_AT,
    UPDATED_AT,
    LAST_SYNCED_AT,
    SYNC_VERSION,
];

/// Case-insensitive header lookup for one sheet.
#[derive(Debug, Clone, Default)]
pub struct HeaderIndex {
    columns: HashMap<String, usize>,
}

impl HeaderIndex {
    pub fn new<'a>(headers: impl IntoIterator<Item = &'a str>) -> Self {
        let columns = headers
            .into_iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_lowercase(), i))
            .collect();
        Self { columns }
    }

    pub fn has(&self, header: &str) -> bool {
        self.columns.contains_key(&header.to_lowercase())
    }

    /// Trimmed cell text, `None` when the column is absent or the cell blank.
    pub fn cell<'r>(&self, row: &'r [String], header: &str) -> Option<&'r str> {
        self.columns
            .get(&header.to_lowercase())
            .and_then(|&i| row.get(i))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn text(&self, row: &[String], header: &str) -> Option<String> {
        self.cell(row, header).map(str::to_string)
    }
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM[:SS]` read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    ["%Y-%m-%d", "%m/%d/%Y", "%d-%m-%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| parse_timestamp(raw).map(|ts| ts.date_naive()))
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "" | "false" | "no" | "n" | "0" => Some(false),
        "true" | "yes" | "y" | "1" => Some(true),
        _ => None,
    }
}

fn required_ts(index: &HeaderIndex, row: &[String], header: &str) -> Result<DateTime<Utc>, String> {
    let raw = index
        .cell(row, header)
        .ok_or_else(|| format!("{header} is required"))?;
    parse_timestamp(raw).ok_or_else(|| format!("{header} '{raw}' is not a valid timestamp"))
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    ["%H:%M:%S", "%H:%M", "%I:%M %p", "%I:%M:%S %p"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
        .or_else(|| parse_timestamp(raw).map(|ts| ts.time()))
}

/// Meeting window from either `Start`/`End` or `Meeting Date` + `Start Time`
/// (+ `End Time`, else one hour).
pub fn window_from_row(
    index: &HeaderIndex,
    row: &[String],
) -> Result<(DateTime<Utc>, DateTime<Utc>), String> {
    if index.has(START) || !index.has(MEETING_DATE) {
        return Ok((required_ts(index, row, START)?, required_ts(index, row, END)?));
    }
    let raw_date = index
        .cell(row, MEETING_DATE)
        .ok_or_else(|| format!("{MEETING_DATE} is required"))?;
    let date = parse_date(raw_date)
        .ok_or_else(|| format!("{MEETING_DATE} '{raw_date}' is not a date"))?;
    let raw_time = index
        .cell(row, START_TIME)
        .ok_or_else(|| format!("{START_TIME} is required"))?;
    let time = parse_time(raw_time)
        .ok_or_else(|| format!("{START_TIME} '{raw_time}' is not a time"))?;
    let start = date.and_time(time).and_utc();
    let end = match index.cell(row, END_TIME) {
        Some(raw) => {
            let t = parse_time(raw).ok_or_else(|| format!("{END_TIME} '{raw}' is not a time"))?;
            date.and_time(t).and_utc()
        }
        None => start + Duration::minutes(DEFAULT_DURATION_MINUTES),
    };
    Ok((start, end))
}

fn optional_ts(
    index: &HeaderIndex,
    row: &[String],
    header: &str,
) -> Result<Option<DateTime<Utc>>, String> {
    index
        .cell(row, header)
        .map(|raw| {
            parse_timestamp(raw).ok_or_else(|| format!("{header} '{raw}' is not a valid timestamp"))
        })
        .transpose()
}

fn flag(index: &HeaderIndex, row: &[String], header: &str) -> Result<bool, String> {
    match index.cell(row, header) {
        None => Ok(false),
        Some(raw) => parse_bool(raw).ok_or_else(|| format!("{header} '{raw}' is not yes/no")),
    }
}

/// Business fields from a sheet row. Structural problems only; form-level
/// validation is the caller's job.
pub fn fields_from_row(index: &HeaderIndex, row: &[String]) -> Result<MeetingFields, String> {
    let follow_up_date = index
        .cell(row, FOLLOW_UP)
        .map(|raw| parse_date(raw).ok_or_else(|| format!("{FOLLOW_UP} '{raw}' is not a date")))
        .transpose()?;
    let (start_at, end_at) = window_from_row(index, row)?;
    Ok(MeetingFields {
        title: index.text(row, TITLE).unwrap_or_default(),
        organization: index.text(row, ORGANIZATION),
        client: index.text(row, CLIENT),
        stakeholder_name: index.text(row, STAKEHOLDER),
        purpose: index.text(row, PURPOSE),
        agenda: index.text(row, AGENDA),
        start_at,
        end_at,
        time_zone: index.text(row, TIME_ZONE),
        meeting_type: index.text(row, MEETING_TYPE),
        meeting_link: index.text(row, MEETING_LINK),
        location: index.text(row, LOCATION),
        priority: index.text(row, PRIORITY),
        attendees: index.text(row, ATTENDEES),
        guests: index.text(row, GUESTS),
        notes: index.text(row, NOTES),
        next_action: index.text(row, NEXT_ACTION),
        follow_up_date,
        reminder_sent: flag(index, row, REMINDER_SENT)?,
        calendar_sync: flag(index, row, CALENDAR_SYNC)?,
        calendar_event_title: index.text(row, CALENDAR_TITLE),
        status_override: flag(index, row, STATUS_OVERRIDE)?,
    })
}

pub fn parse_id(raw: &str) -> Option<MeetingId> {
    raw.parse::<MeetingId>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as MeetingId))
        .filter(|id| *id > 0)
}

/// A full stored meeting from a flat-file row.
pub fn meeting_from_row(index: &HeaderIndex, row: &[String]) -> Result<Meeting, String> {
    let raw_id = index
        .cell(row, ID)
        .ok_or_else(|| format!("{ID} is required"))?;
    let id = parse_id(raw_id).ok_or_else(|| format!("{ID} '{raw_id}' is not a positive integer"))?;
    let fields = fields_from_row(index, row)?;
    let now = now_utc();
    let sync_version = match index.cell(row, SYNC_VERSION) {
        None => 1,
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|v| *v >= 1)
            .ok_or_else(|| format!("{SYNC_VERSION} '{raw}' is not a positive integer"))?,
    };
    Ok(Meeting {
        id,
        fields,
        created_at: optional_ts(index, row, CREATED_AT)?.unwrap_or(now),
        updated_at: optional_ts(index, row, UPDATED_AT)?.unwrap_or(now),
        last_synced_at: optional_ts(index, row, LAST_SYNCED_AT)?,
        sync_version,
    })
}

fn yes_no(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}

/// Row in [`HEADERS`] order. `status` fills the computed Status column.
pub fn meeting_to_record(meeting: &Meeting, status: Option<MeetingStatus>) -> StringRecord {
    let f = &meeting.fields;
    let text = |v: &Option<String>| v.clone().unwrap_or_default();
    StringRecord::from(vec![
        meeting.id.to_string(),
        f.title.clone(),
        text(&f.organization),
        text(&f.client),
        text(&f.stakeholder_name),
        text(&f.purpose),
        text(&f.agenda),
        format_ts(&f.start_at),
        format_ts(&f.end_at),
        text(&f.time_zone),
        text(&f.meeting_type),
        text(&f.meeting_link),
        text(&f.location),
        text(&f.priority),
        text(&f.attendees),
        text(&f.guests),
        text(&f.notes),
        text(&f.next_action),
        f.follow_up_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        yes_no(f.reminder_sent),
        yes_no(f.calendar_sync),
        text(&f.calendar_event_title),
        status.map(|s| s.to_string()).unwrap_or_default(),
        yes_no(f.status_override),
        format_ts(&meeting.created_at),
        format_ts(&meeting.updated_at),
        meeting.last_synced_at.as_ref().map(format_ts).unwrap_or_default(),
        meeting.sync_version.to_string(),
    ])
}
