//! Google Calendar v3 wire types and their conversion to and from the
//! provider-neutral model.

use calmirror_core::origin::ORIGIN_PROPERTY;
use calmirror_core::{
    Attachment, Attendee, Event, EventStatus, EventTime, MirrorBody, OriginKey,
    ParticipationStatus, Reminder, Visibility,
};
use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "iCalUID")]
    pub ical_uid: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<GoogleTime>,
    pub end: Option<GoogleTime>,
    pub original_start_time: Option<GoogleTime>,
    pub status: Option<String>,
    pub visibility: Option<String>,
    pub recurrence: Option<Vec<String>>,
    #[serde(default)]
    pub attendees: Vec<GoogleAttendee>,
    #[serde(default)]
    pub attachments: Vec<GoogleAttachment>,
    pub reminders: Option<GoogleReminders>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub extended_properties: Option<GoogleExtendedProperties>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleTime {
    pub date: Option<NaiveDate>,
    pub date_time: Option<DateTime<FixedOffset>>,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleAttendee {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub response_status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleAttachment {
    pub file_url: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleReminders {
    #[serde(default)]
    pub overrides: Vec<GoogleReminder>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleReminder {
    pub method: String,
    pub minutes: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleExtendedProperties {
    #[serde(default)]
    pub private: Map<String, Value>,
}

/// `events.list` response page
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEventList {
    #[serde(default)]
    pub items: Vec<GoogleEvent>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleCalendarListEntry {
    pub id: String,
}

/// `{"error": {"code": 410, "message": "...", "errors": [{"reason": "..."}]}}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleErrorBody {
    #[serde(default)]
    pub error: GoogleErrorDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<GoogleErrorItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleErrorItem {
    #[serde(default)]
    pub reason: String,
}

impl GoogleErrorBody {
    /// Lenient parse: a body that is not Google's error JSON becomes the
    /// message itself.
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| GoogleErrorBody {
            error: GoogleErrorDetail {
                message: body.trim().to_string(),
                errors: Vec::new(),
            },
        })
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.error.errors.iter().any(|e| e.reason == reason)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn from_google_time(time: GoogleTime) -> Option<EventTime> {
    match (time.date_time, time.date) {
        (Some(instant), _) => Some(EventTime::DateTime {
            instant,
            time_zone: time.time_zone,
        }),
        (None, Some(date)) => Some(EventTime::Date(date)),
        (None, None) => None,
    }
}

fn from_google_status(status: Option<&str>) -> EventStatus {
    match status {
        Some("cancelled") => EventStatus::Cancelled,
        Some("tentative") => EventStatus::Tentative,
        _ => EventStatus::Confirmed,
    }
}

fn from_google_visibility(visibility: Option<&str>) -> Option<Visibility> {
    match visibility? {
        "default" => Some(Visibility::Default),
        "public" => Some(Visibility::Public),
        "private" => Some(Visibility::Private),
        "confidential" => Some(Visibility::Confidential),
        _ => None,
    }
}

fn from_google_response_status(status: Option<&str>) -> Option<ParticipationStatus> {
    match status? {
        "accepted" => Some(ParticipationStatus::Accepted),
        "declined" => Some(ParticipationStatus::Declined),
        "tentative" => Some(ParticipationStatus::Tentative),
        "needsAction" => Some(ParticipationStatus::NeedsAction),
        _ => None,
    }
}

pub fn from_google(event: GoogleEvent) -> Event {
    let origin = event
        .extended_properties
        .as_ref()
        .and_then(|props| props.private.get(ORIGIN_PROPERTY))
        .and_then(Value::as_str)
        .map(str::to_string);

    let attendees = event
        .attendees
        .into_iter()
        .filter_map(|a| {
            Some(Attendee {
                email: a.email?,
                name: non_empty(a.display_name),
                response_status: from_google_response_status(a.response_status.as_deref()),
            })
        })
        .collect();

    let attachments = event
        .attachments
        .into_iter()
        .map(|a| Attachment {
            file_url: a.file_url,
            title: a.title,
        })
        .collect();

    let reminders = event
        .reminders
        .map(|r| {
            r.overrides
                .into_iter()
                .map(|o| Reminder {
                    method: o.method,
                    minutes: o.minutes,
                })
                .collect()
        })
        .unwrap_or_default();

    Event {
        id: event.id,
        ical_uid: event.ical_uid,
        summary: event.summary.unwrap_or_default(),
        description: non_empty(event.description),
        location: non_empty(event.location),
        start: event.start.and_then(from_google_time),
        end: event.end.and_then(from_google_time),
        status: from_google_status(event.status.as_deref()),
        visibility: from_google_visibility(event.visibility.as_deref()),
        recurrence: event.recurrence.filter(|r| !r.is_empty()),
        original_start: event.original_start_time.and_then(from_google_time),
        attendees,
        attachments,
        reminders,
        created: event.created,
        updated: event.updated,
        origin,
    }
}

fn to_google_time(time: &EventTime) -> Value {
    match time {
        EventTime::Date(date) => json!({ "date": date.format("%Y-%m-%d").to_string() }),
        EventTime::DateTime { instant, time_zone } => {
            let mut value = json!({
                "dateTime": instant.to_rfc3339_opts(SecondsFormat::Secs, true),
            });
            if let Some(tz) = time_zone {
                value["timeZone"] = json!(tz);
            }
            value
        }
    }
}

fn to_google_visibility(visibility: Option<Visibility>) -> &'static str {
    match visibility.unwrap_or(Visibility::Default) {
        Visibility::Default => "default",
        Visibility::Public => "public",
        Visibility::Private => "private",
        Visibility::Confidential => "confidential",
    }
}

fn origin_properties(key: &OriginKey) -> Value {
    json!({ "private": { ORIGIN_PROPERTY: key.as_str() } })
}

/// Body for `events.insert` and `events.patch`. Absent optional fields are
/// sent as `null` so a patch clears what the source no longer has.
pub fn to_google_body(body: &MirrorBody) -> Value {
    let mut value = json!({
        "summary": body.summary,
        "description": body.description,
        "location": body.location,
        "visibility": to_google_visibility(body.visibility),
        "recurrence": body.recurrence,
        "extendedProperties": origin_properties(&body.origin),
    });
    if let Some(start) = &body.start {
        value["start"] = to_google_time(start);
    }
    if let Some(end) = &body.end {
        value["end"] = to_google_time(end);
    }
    value
}

/// Patch that only sets the origin tag.
pub fn origin_tag_patch(key: &OriginKey) -> Value {
    json!({ "extendedProperties": origin_properties(key) })
}
