//! Meeting status classification.
//!
//! Status is derived from the meeting window and the current time on every
//! read. The only stored input is the manual "Completed" override.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Meeting;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MeetingStatus {
    Upcoming,
    Ongoing,
    Ended,
    Completed,
}

impl MeetingStatus {
    pub const ALL: [MeetingStatus; 4] = [
        MeetingStatus::Upcoming,
        MeetingStatus::Ongoing,
        MeetingStatus::Ended,
        MeetingStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Upcoming => "Upcoming",
            MeetingStatus::Ongoing => "Ongoing",
            MeetingStatus::Ended => "Ended",
            MeetingStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeetingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        MeetingStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| format!("Unknown meeting status: {trimmed}"))
    }
}

/// Classify a meeting window relative to `now`.
///
/// The override wins unconditionally. Otherwise the window is closed on both
/// ends: a meeting is `Ongoing` at exactly its start and its end.
pub fn classify(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    overridden: bool,
    now: DateTime<Utc>,
) -> MeetingStatus {
    if overridden {
        MeetingStatus::Completed
    } else if now < start {
        MeetingStatus::Upcoming
    } else if now <= end {
        MeetingStatus::Ongoing
    } else {
        MeetingStatus::Ended
    }
}

/// Tally meetings per status as of `now`. Every status has an entry.
pub fn status_counts<'a>(
    meetings: impl IntoIterator<Item = &'a Meeting>,
    now: DateTime<Utc>,
) -> BTreeMap<MeetingStatus, usize> {
    let mut counts: BTreeMap<MeetingStatus, usize> =
        MeetingStatus::ALL.into_iter().map(|s| (s, 0)).collect();
    for meeting in meetings {
        *counts.entry(meeting.status_at(now)).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{at, sample_fields};
    use chrono::Duration;

    #[test]
    fn test_scenario_nine_to_ten() {
        let (start, end) = (at(9, 0), at(10, 0));
        assert_eq!(classify(start, end, false, at(8, 0)), MeetingStatus::Upcoming);
        assert_eq!(classify(start, end, false, at(9, 30)), MeetingStatus::Ongoing);
        assert_eq!(classify(start, end, false, at(11, 0)), MeetingStatus::Ended);
        for now in [at(8, 0), at(9, 30), at(11, 0)] {
            assert_eq!(classify(start, end, true, now), MeetingStatus::Completed);
        }
    }

    #[test]
    fn test_window_boundaries_are_ongoing() {
        let (start, end) = (at(9, 0), at(10, 0));
        assert_eq!(classify(start, end, false, start), MeetingStatus::Ongoing);
        assert_eq!(classify(start, end, false, end), MeetingStatus::Ongoing);
        assert_eq!(
            classify(start, end, false, end + Duration::seconds(1)),
            MeetingStatus::Ended
        );
    }

    #[test]
    fn test_status_is_monotonic_in_now() {
        let (start, end) = (at(9, 0), at(9, 45));
        let mut now = at(8, 0);
        let mut previous = classify(start, end, false, now);
        while now < at(11, 0) {
            now += Duration::minutes(5);
            let current = classify(start, end, false, now);
            assert_ne!(current, MeetingStatus::Completed);
            assert!(current >= previous, "{previous} -> {current} at {now}");
            previous = current;
        }
        assert_eq!(previous, MeetingStatus::Ended);
    }

    #[test]
    fn test_parse_status_labels() {
        assert_eq!("completed".parse::<MeetingStatus>(), Ok(MeetingStatus::Completed));
        assert_eq!(" Ongoing ".parse::<MeetingStatus>(), Ok(MeetingStatus::Ongoing));
        assert!("Cancelled".parse::<MeetingStatus>().is_err());
    }

    #[test]
    fn test_status_counts_include_empty_buckets() {
        let meeting = Meeting {
            id: 1,
            fields: sample_fields("Sync"),
            created_at: at(8, 0),
            updated_at: at(8, 0),
            last_synced_at: None,
            sync_version: 1,
        };
        let counts = status_counts([&meeting], at(9, 30));
        assert_eq!(counts[&MeetingStatus::Ongoing], 1);
        assert_eq!(counts[&MeetingStatus::Upcoming], 0);
        assert_eq!(counts.len(), 4);
    }
}
