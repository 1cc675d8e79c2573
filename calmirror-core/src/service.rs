//! The remote calendar capability the engine consumes.
//!
//! Implementations live in provider crates (e.g. `calmirror-provider-google`).
//! Every mutating call must suppress notification fan-out to attendees.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::Event;
use crate::mirror::MirrorBody;
use crate::origin::{ORIGIN_PROPERTY, OriginKey};

/// Classified failure of a calendar service call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// The sync cursor was rejected; a full (windowed) listing is required.
    #[error("sync cursor is no longer valid")]
    CursorInvalidated,

    #[error("not found: {0}")]
    NotFound(String),

    /// The service reports the object already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Rate limiting, server errors, transport failures.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

/// Fallback for services that only report duplicates in prose.
pub fn is_duplicate_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("duplicate") || lower.contains("already exists")
}

/// Outcome of an insert, as the engine's creation path sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(Event),
    Conflict(String),
    TransientFailure(String),
    FatalFailure(ServiceError),
}

impl From<Result<Event, ServiceError>> for InsertOutcome {
    fn from(result: Result<Event, ServiceError>) -> Self {
        match result {
            Ok(event) => InsertOutcome::Created(event),
            Err(ServiceError::Conflict(msg)) => InsertOutcome::Conflict(msg),
            Err(ServiceError::Transient(msg)) => InsertOutcome::TransientFailure(msg),
            Err(ServiceError::Fatal(msg)) if is_duplicate_message(&msg) => {
                InsertOutcome::Conflict(msg)
            }
            Err(other) => InsertOutcome::FatalFailure(other),
        }
    }
}

/// Parameters of an event listing. Unset fields are omitted from the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub sync_token: Option<String>,
    pub time_min: Option<DateTime<Utc>>,
    pub time_max: Option<DateTime<Utc>>,
    pub page_token: Option<String>,
    /// Free-text search
    pub query: Option<String>,
    /// `(name, value)` of a private extended property to filter on
    pub private_property: Option<(String, String)>,
    pub ical_uid: Option<String>,
    pub show_deleted: bool,
    pub single_events: bool,
    pub max_results: Option<u32>,
}

impl ListQuery {
    /// Changes since a previously issued cursor, deletions included.
    pub fn changes_since(sync_token: &str) -> Self {
        ListQuery {
            sync_token: Some(sync_token.to_string()),
            show_deleted: true,
            max_results: Some(2500),
            ..Default::default()
        }
    }

    /// Everything in `[time_min, time_max)`, deletions included.
    pub fn window(time_min: DateTime<Utc>, time_max: DateTime<Utc>) -> Self {
        ListQuery {
            time_min: Some(time_min),
            time_max: Some(time_max),
            show_deleted: true,
            max_results: Some(2500),
            ..Default::default()
        }
    }

    pub fn by_origin(key: &OriginKey) -> Self {
        ListQuery {
            private_property: Some((ORIGIN_PROPERTY.to_string(), key.to_string())),
            max_results: Some(10),
            ..Default::default()
        }
    }

    pub fn by_ical_uid(uid: &str) -> Self {
        ListQuery {
            ical_uid: Some(uid.to_string()),
            max_results: Some(50),
            ..Default::default()
        }
    }

    /// Expanded instances in a window whose text matches `title`.
    pub fn by_title(title: &str, time_min: DateTime<Utc>, time_max: DateTime<Utc>) -> Self {
        ListQuery {
            query: Some(title.to_string()),
            time_min: Some(time_min),
            time_max: Some(time_max),
            single_events: true,
            max_results: Some(50),
            ..Default::default()
        }
    }

    pub fn with_page_token(mut self, page_token: Option<String>) -> Self {
        self.page_token = page_token;
        self
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub items: Vec<Event>,
    pub next_page_token: Option<String>,
    /// Only present on the final page of a listing
    pub next_sync_token: Option<String>,
}

/// What a patch call changes.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPatch {
    /// Overwrite the whole mirror projection (tag included).
    Mirror(MirrorBody),
    /// Only set the origin tag, leaving everything else alone.
    OriginTag(OriginKey),
}

#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Resolve an alias such as `primary` to the calendar's canonical id.
    async fn resolve_calendar_id(&self, calendar_id: &str) -> Result<String, ServiceError>;

    async fn list(&self, calendar_id: &str, query: &ListQuery) -> Result<EventPage, ServiceError>;

    async fn insert(&self, calendar_id: &str, body: &MirrorBody) -> Result<Event, ServiceError>;

    async fn patch(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<Event, ServiceError>;

    /// Deleting something already gone is not an error.
    async fn delete(&self, calendar_id: &str, event_id: &str) -> Result<(), ServiceError>;
}
