#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use calmirror_core::{
    CalendarService, EngineOptions, Event, EventPage, EventPatch, EventStatus, EventTime,
    ListQuery, MirrorBody, ReconciliationEngine, ServiceError,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

pub const SOURCE: &str = "src1";
pub const TARGET: &str = "mirror@example.com";

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

/// A confirmed, timed source event. `id` doubles as the Google-style UID
/// (`<id>@google.com`).
pub fn source_event(id: &str, summary: &str, day: u32, hour: u32) -> Event {
    Event {
        id: id.to_string(),
        ical_uid: Some(format!("{id}@google.com")),
        summary: summary.to_string(),
        start: Some(EventTime::instant(at(day, hour))),
        end: Some(EventTime::instant(at(day, hour + 1))),
        created: Some(at(1, 8)),
        updated: Some(at(1, 9)),
        ..Default::default()
    }
}

/// The bare record an incremental listing reports for a deletion.
pub fn cancelled(id: &str) -> Event {
    Event {
        id: id.to_string(),
        status: EventStatus::Cancelled,
        ..Default::default()
    }
}

pub fn page(items: Vec<Event>, next_sync_token: Option<&str>) -> EventPage {
    EventPage {
        items,
        next_page_token: None,
        next_sync_token: next_sync_token.map(str::to_string),
    }
}

pub fn options() -> EngineOptions {
    EngineOptions {
        pace_every: 10,
        pace_delay: std::time::Duration::ZERO,
        race_retry_delay: std::time::Duration::ZERO,
        window: Duration::days(14),
    }
}

pub fn engine(source: &Arc<ScriptedSource>, target: &Arc<FakeTarget>) -> ReconciliationEngine {
    ReconciliationEngine::new(source.clone(), target.clone(), TARGET, options())
}

/// Source calendar that replays queued listing responses.
#[derive(Default)]
pub struct ScriptedSource {
    responses: Mutex<VecDeque<Result<EventPage, ServiceError>>>,
    queries: Mutex<Vec<ListQuery>>,
    aliases: HashMap<String, String>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_aliases(aliases: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(ScriptedSource {
            aliases: aliases
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        })
    }

    pub fn push(&self, response: Result<EventPage, ServiceError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn queries(&self) -> Vec<ListQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl CalendarService for ScriptedSource {
    async fn resolve_calendar_id(&self, calendar_id: &str) -> Result<String, ServiceError> {
        if calendar_id == "unreachable" {
            return Err(ServiceError::Transient("connection reset".into()));
        }
        Ok(self
            .aliases
            .get(calendar_id)
            .cloned()
            .unwrap_or_else(|| calendar_id.to_string()))
    }

    async fn list(&self, _calendar_id: &str, query: &ListQuery) -> Result<EventPage, ServiceError> {
        self.queries.lock().unwrap().push(query.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(EventPage::default()))
    }

    async fn insert(&self, _: &str, _: &MirrorBody) -> Result<Event, ServiceError> {
        Err(ServiceError::Fatal("source is read-only".into()))
    }

    async fn patch(&self, _: &str, _: &str, _: &EventPatch) -> Result<Event, ServiceError> {
        Err(ServiceError::Fatal("source is read-only".into()))
    }

    async fn delete(&self, _: &str, _: &str) -> Result<(), ServiceError> {
        Err(ServiceError::Fatal("source is read-only".into()))
    }
}

#[derive(Default)]
struct TargetState {
    events: Vec<Event>,
    next_id: usize,
    clock: i64,
    inserts: usize,
    patches: usize,
    deletes: usize,
    insert_failures: VecDeque<ServiceError>,
    patch_failures: VecDeque<ServiceError>,
    search_failures: VecDeque<ServiceError>,
    /// Appears in the calendar when the next insert fails, as if another
    /// writer had won the race.
    racing_event: Option<Event>,
}

impl TargetState {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(self.clock)
    }
}

/// In-memory target calendar that filters listings the way the real
/// service does.
#[derive(Default)]
pub struct FakeTarget {
    state: Mutex<TargetState>,
}

impl FakeTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_events(events: Vec<Event>) -> Arc<Self> {
        let target = Self::default();
        target.state.lock().unwrap().events = events;
        Arc::new(target)
    }

    pub fn fail_next_insert(&self, error: ServiceError, racing_event: Option<Event>) {
        let mut state = self.state.lock().unwrap();
        state.insert_failures.push_back(error);
        state.racing_event = racing_event;
    }

    pub fn fail_next_patch(&self, error: ServiceError) {
        self.state.lock().unwrap().patch_failures.push_back(error);
    }

    /// Fails the next full-text (title) listing.
    pub fn fail_next_search(&self, error: ServiceError) {
        self.state.lock().unwrap().search_failures.push_back(error);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn event(&self, id: &str) -> Option<Event> {
        self.events().into_iter().find(|e| e.id == id)
    }

    pub fn tagged(&self, origin: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.origin.as_deref() == Some(origin))
            .collect()
    }

    /// (inserts, patches, deletes)
    pub fn mutations(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (state.inserts, state.patches, state.deletes)
    }
}

fn apply_body(event: &mut Event, body: &MirrorBody) {
    event.summary = body.summary.clone();
    event.description = body.description.clone();
    event.location = body.location.clone();
    event.start = body.start.clone();
    event.end = body.end.clone();
    event.visibility = body.visibility;
    event.recurrence = body.recurrence.clone();
    event.origin = Some(body.origin.to_string());
}

#[async_trait]
impl CalendarService for FakeTarget {
    async fn resolve_calendar_id(&self, calendar_id: &str) -> Result<String, ServiceError> {
        Ok(calendar_id.to_string())
    }

    async fn list(&self, _calendar_id: &str, query: &ListQuery) -> Result<EventPage, ServiceError> {
        let mut state = self.state.lock().unwrap();

        if query.query.is_some() {
            if let Some(error) = state.search_failures.pop_front() {
                return Err(error);
            }
        }

        let items = state
            .events
            .iter()
            .filter(|e| query.show_deleted || !e.is_cancelled())
            .filter(|e| match &query.private_property {
                Some((_, value)) => e.origin.as_deref() == Some(value.as_str()),
                None => true,
            })
            .filter(|e| match &query.ical_uid {
                Some(uid) => e.ical_uid.as_deref() == Some(uid.as_str()),
                None => true,
            })
            .filter(|e| match &query.query {
                Some(q) => e.summary.to_lowercase().contains(&q.to_lowercase()),
                None => true,
            })
            .filter(|e| {
                let start = e.start.as_ref().map(EventTime::to_utc);
                query.time_min.is_none_or(|min| start.is_some_and(|s| s >= min))
                    && query.time_max.is_none_or(|max| start.is_some_and(|s| s < max))
            })
            .cloned()
            .collect();

        Ok(page(items, None))
    }

    async fn insert(&self, _calendar_id: &str, body: &MirrorBody) -> Result<Event, ServiceError> {
        let mut state = self.state.lock().unwrap();

        if let Some(error) = state.insert_failures.pop_front() {
            if let Some(racing) = state.racing_event.take() {
                state.events.push(racing);
            }
            return Err(error);
        }

        state.next_id += 1;
        let id = format!("m{}", state.next_id);
        let now = state.tick();
        let mut event = Event {
            id: id.clone(),
            ical_uid: Some(format!("{id}@google.com")),
            created: Some(now),
            updated: Some(now),
            ..Default::default()
        };
        apply_body(&mut event, body);

        state.inserts += 1;
        state.events.push(event.clone());
        Ok(event)
    }

    async fn patch(
        &self,
        _calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<Event, ServiceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.patch_failures.pop_front() {
            return Err(error);
        }
        let now = state.tick();

        let Some(event) = state.events.iter_mut().find(|e| e.id == event_id) else {
            return Err(ServiceError::NotFound(event_id.to_string()));
        };
        match patch {
            EventPatch::Mirror(body) => apply_body(event, body),
            EventPatch::OriginTag(key) => event.origin = Some(key.to_string()),
        }
        event.updated = Some(now);
        let patched = event.clone();

        state.patches += 1;
        Ok(patched)
    }

    async fn delete(&self, _calendar_id: &str, event_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        let before = state.events.len();
        state.events.retain(|e| e.id != event_id);
        if state.events.len() < before {
            state.deletes += 1;
        }
        Ok(())
    }
}
