//! The projection of a source event that gets written into the target.

use crate::event::{Event, EventStatus, EventTime, Visibility};
use crate::origin::OriginKey;

/// Title given to mirrors of untitled source events.
pub const BUSY_PLACEHOLDER: &str = "(busy)";

/// Fields the engine owns on a mirror event. Anything else on the target
/// event (attendees, reminders, colors) is left to the target's owner.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorBody {
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    pub visibility: Option<Visibility>,
    pub recurrence: Option<Vec<String>>,
    pub origin: OriginKey,
}

impl MirrorBody {
    pub fn project(source: &Event, key: &OriginKey) -> Self {
        MirrorBody {
            summary: if source.summary.is_empty() {
                BUSY_PLACEHOLDER.to_string()
            } else {
                source.summary.clone()
            },
            description: source.description.clone(),
            location: source.location.clone(),
            start: source.start.clone(),
            end: source.end.clone(),
            visibility: source.visibility,
            recurrence: source.recurrence.clone(),
            origin: key.clone(),
        }
    }

    /// Whether `mirror` already shows exactly this projection, so a patch
    /// would change nothing.
    pub fn is_reflected_by(&self, mirror: &Event) -> bool {
        self.origin.tags(mirror)
            && self.summary == mirror.summary
            && non_empty(&self.description) == non_empty(&mirror.description)
            && non_empty(&self.location) == non_empty(&mirror.location)
            && same_time(&self.start, &mirror.start)
            && same_time(&self.end, &mirror.end)
            && effective_visibility(self.visibility) == effective_visibility(mirror.visibility)
            && rules(&self.recurrence) == rules(&mirror.recurrence)
    }

    /// The body as a not-yet-created event, so it can compete with existing
    /// duplicates on equal terms. Timestamps and detail come from the source.
    pub fn as_candidate(&self, source: &Event) -> Event {
        Event {
            id: String::new(),
            ical_uid: source.ical_uid.clone(),
            summary: self.summary.clone(),
            description: self.description.clone(),
            location: self.location.clone(),
            start: self.start.clone(),
            end: self.end.clone(),
            status: EventStatus::Confirmed,
            visibility: self.visibility,
            recurrence: self.recurrence.clone(),
            original_start: source.original_start.clone(),
            attendees: source.attendees.clone(),
            attachments: source.attachments.clone(),
            reminders: source.reminders.clone(),
            created: source.created,
            updated: source.updated,
            origin: Some(self.origin.to_string()),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

fn same_time(a: &Option<EventTime>, b: &Option<EventTime>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_time(b),
        (None, None) => true,
        _ => false,
    }
}

fn effective_visibility(visibility: Option<Visibility>) -> Visibility {
    visibility.unwrap_or(Visibility::Default)
}

fn rules(recurrence: &Option<Vec<String>>) -> &[String] {
    recurrence.as_deref().unwrap_or(&[])
}
