//! Provider-neutral event types.
//!
//! These types represent calendar events in a provider-agnostic way.
//! Providers convert their API responses into these types, and the
//! reconciliation engine works exclusively with them.

use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A calendar event (provider-neutral), as observed in a source or target calendar.
///
/// Incremental listings report deletions as bare `Cancelled` records that carry
/// little more than an id, so most fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Provider-assigned identifier, unique within its calendar
    pub id: String,
    /// iCalendar UID (shared by every instance of a recurring series)
    pub ical_uid: Option<String>,
    /// Title. Empty when the provider reports none.
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    pub status: EventStatus,
    pub visibility: Option<Visibility>,

    // Recurrence fields
    /// RRULE, EXRULE, RDATE, EXDATE lines for master events
    pub recurrence: Option<Vec<String>>,
    /// Original start of the series instance this exception replaces
    pub original_start: Option<EventTime>,

    // Meeting data
    pub attendees: Vec<Attendee>,
    pub attachments: Vec<Attachment>,
    /// Reminder overrides (empty when the calendar default applies)
    pub reminders: Vec<Reminder>,

    // Sync infrastructure
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    /// Private `origin` tag linking a mirror to its source event
    pub origin: Option<String>,
}

impl Event {
    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }

    /// Title for log lines.
    pub fn display_summary(&self) -> &str {
        if self.summary.is_empty() {
            "(no title)"
        } else {
            &self.summary
        }
    }

    /// Start for log lines.
    pub fn display_start(&self) -> String {
        self.start
            .as_ref()
            .map(EventTime::to_iso)
            .unwrap_or_else(|| "unknown date".to_string())
    }
}

/// An event attendee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    /// Display name
    pub name: Option<String>,
    /// Email address
    pub email: String,
    pub response_status: Option<ParticipationStatus>,
}

/// Attendee response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipationStatus {
    Accepted,
    Declined,
    Tentative,
    NeedsAction,
}

/// A file attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_url: String,
    pub title: Option<String>,
}

/// A reminder override for an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    /// "popup" or "email"
    pub method: String,
    /// Minutes before the event to trigger
    pub minutes: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Default,
    Public,
    Private,
    Confidential,
}

/// Start or end of an event: a timed instant or an all-day date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventTime {
    Date(NaiveDate),
    DateTime {
        /// The instant, keeping the offset the provider reported it in
        instant: DateTime<FixedOffset>,
        /// IANA zone name, required by providers for recurring events
        time_zone: Option<String>,
    },
}

impl EventTime {
    pub fn date(date: NaiveDate) -> Self {
        EventTime::Date(date)
    }

    pub fn instant<Tz: TimeZone>(instant: DateTime<Tz>) -> Self {
        EventTime::DateTime {
            instant: instant.fixed_offset(),
            time_zone: None,
        }
    }

    /// ISO 8601 rendering: `YYYY-MM-DD` for dates, RFC 3339 (seconds, `Z`
    /// for UTC) for instants.
    pub fn to_iso(&self) -> String {
        match self {
            EventTime::Date(d) => d.format("%Y-%m-%d").to_string(),
            EventTime::DateTime { instant, .. } => {
                instant.to_rfc3339_opts(SecondsFormat::Secs, true)
            }
        }
    }

    /// Same date, or same instant regardless of reported offset and zone name.
    pub fn same_time(&self, other: &EventTime) -> bool {
        match (self, other) {
            (EventTime::Date(a), EventTime::Date(b)) => a == b,
            (EventTime::DateTime { instant: a, .. }, EventTime::DateTime { instant: b, .. }) => {
                a == b
            }
            _ => false,
        }
    }

    /// The instant this time begins at. Dates begin at UTC midnight.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            EventTime::Date(d) => d.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc(),
            EventTime::DateTime { instant, .. } => instant.with_timezone(&Utc),
        }
    }
}
