//! `CalendarService` over the Google Calendar v3 REST API.
//!
//! Event calls go through `reqwest` directly rather than
//! `google_calendar::Client`, whose list and error types drop the sync and
//! page tokens and the structured error reasons this service classifies on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use calmirror_core::{
    CalendarService, CredentialProvider, Event, EventPage, EventPatch, ListQuery, MirrorBody,
    Role, ServiceError,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::convert::{
    GoogleCalendarListEntry, GoogleErrorBody, GoogleEvent, GoogleEventList, from_google,
    origin_tag_patch, to_google_body,
};

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

/// Attempts for idempotent reads. Mutations are sent once.
const READ_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default bound on one request, response body included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GoogleCalendar {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    role: Role,
    base_url: String,
}

impl GoogleCalendar {
    /// Client acting as the account `role` refers to.
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        role: Role,
    ) -> Result<Self, ServiceError> {
        Self::with_timeout(credentials, role, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        credentials: Arc<dyn CredentialProvider>,
        role: Role,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Fatal(format!("Could not build HTTP client: {e}")))?;

        Ok(GoogleCalendar {
            http,
            credentials,
            role,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ServiceError::Fatal(format!("Invalid base URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::Fatal(format!("Invalid base URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder, ServiceError> {
        let token = self
            .credentials
            .access_token(self.role)
            .await
            .map_err(|e| ServiceError::Fatal(e.to_string()))?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn send(request: RequestBuilder) -> Result<Response, ServiceError> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Transient(format!("request timed out: {e}"))
            } else {
                ServiceError::Transient(format!("request failed: {e}"))
            }
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Transient(format!("response timed out: {e}"))
            } else {
                ServiceError::Fatal(format!("unexpected response: {e}"))
            }
        })
    }

    async fn failure(response: Response, listing: bool) -> ServiceError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify(status, &body, listing)
    }

    /// Retry an idempotent read on transient failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, ServiceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(ServiceError::Transient(message)) if attempt + 1 < READ_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %message, "transient error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn list_once(
        &self,
        calendar_id: &str,
        query: &ListQuery,
    ) -> Result<EventPage, ServiceError> {
        let url = self.url(&["calendars", calendar_id, "events"])?;
        let request = self
            .request(Method::GET, url)
            .await?
            .query(&list_params(query));

        let response = Self::send(request).await?;
        if !response.status().is_success() {
            return Err(Self::failure(response, true).await);
        }

        let list: GoogleEventList = Self::decode(response).await?;
        Ok(EventPage {
            items: list.items.into_iter().map(from_google).collect(),
            next_page_token: list.next_page_token,
            next_sync_token: list.next_sync_token,
        })
    }

    async fn resolve_once(&self, calendar_id: &str) -> Result<String, ServiceError> {
        let url = self.url(&["users", "me", "calendarList", calendar_id])?;
        let response = Self::send(self.request(Method::GET, url).await?).await?;
        if !response.status().is_success() {
            return Err(Self::failure(response, false).await);
        }
        let entry: GoogleCalendarListEntry = Self::decode(response).await?;
        Ok(entry.id)
    }

    async fn write(&self, method: Method, url: Url, body: &Value) -> Result<Event, ServiceError> {
        let request = self
            .request(method, url)
            .await?
            .query(&[("sendUpdates", "none")])
            .json(body);

        let response = Self::send(request).await?;
        if !response.status().is_success() {
            return Err(Self::failure(response, false).await);
        }

        let event: GoogleEvent = Self::decode(response).await?;
        Ok(from_google(event))
    }
}

/// Query string for `events.list`. Unset parameters are left out.
fn list_params(query: &ListQuery) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();

    if let Some(token) = &query.sync_token {
        params.push(("syncToken", token.clone()));
    }
    if let Some(min) = query.time_min {
        params.push(("timeMin", min.to_rfc3339()));
    }
    if let Some(max) = query.time_max {
        params.push(("timeMax", max.to_rfc3339()));
    }
    if let Some(page) = &query.page_token {
        params.push(("pageToken", page.clone()));
    }
    if let Some(q) = &query.query {
        params.push(("q", q.clone()));
    }
    if let Some((name, value)) = &query.private_property {
        params.push(("privateExtendedProperty", format!("{name}={value}")));
    }
    if let Some(uid) = &query.ical_uid {
        params.push(("iCalUID", uid.clone()));
    }
    if query.show_deleted {
        params.push(("showDeleted", "true".to_string()));
    }
    if query.single_events {
        params.push(("singleEvents", "true".to_string()));
    }
    if let Some(max) = query.max_results {
        params.push(("maxResults", max.to_string()));
    }

    params
}

/// Map a failed response onto the engine's error taxonomy. A 410 on a
/// listing means the sync token expired.
pub fn classify(status: StatusCode, body: &str, listing: bool) -> ServiceError {
    let parsed = GoogleErrorBody::parse(body);
    let message = if parsed.error.message.is_empty() {
        status.to_string()
    } else {
        parsed.error.message.clone()
    };

    match status {
        StatusCode::GONE if listing => ServiceError::CursorInvalidated,
        StatusCode::NOT_FOUND | StatusCode::GONE => ServiceError::NotFound(message),
        StatusCode::CONFLICT => ServiceError::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS => ServiceError::Transient(message),
        s if s.is_server_error() => ServiceError::Transient(message),
        StatusCode::FORBIDDEN
            if parsed.has_reason("rateLimitExceeded")
                || parsed.has_reason("userRateLimitExceeded") =>
        {
            ServiceError::Transient(message)
        }
        s if parsed.has_reason("duplicate") => ServiceError::Conflict(format!("{s}: {message}")),
        s => ServiceError::Fatal(format!("{s}: {message}")),
    }
}

#[async_trait]
impl CalendarService for GoogleCalendar {
    async fn resolve_calendar_id(&self, calendar_id: &str) -> Result<String, ServiceError> {
        self.with_retry("resolve_calendar_id", || self.resolve_once(calendar_id))
            .await
    }

    async fn list(&self, calendar_id: &str, query: &ListQuery) -> Result<EventPage, ServiceError> {
        let page = self
            .with_retry("list_events", || self.list_once(calendar_id, query))
            .await?;
        debug!(
            calendar = calendar_id,
            items = page.items.len(),
            more = page.next_page_token.is_some(),
            "listed events"
        );
        Ok(page)
    }

    async fn insert(&self, calendar_id: &str, body: &MirrorBody) -> Result<Event, ServiceError> {
        let url = self.url(&["calendars", calendar_id, "events"])?;
        self.write(Method::POST, url, &to_google_body(body)).await
    }

    async fn patch(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<Event, ServiceError> {
        let url = self.url(&["calendars", calendar_id, "events", event_id])?;
        let body = match patch {
            EventPatch::Mirror(body) => to_google_body(body),
            EventPatch::OriginTag(key) => origin_tag_patch(key),
        };
        self.write(Method::PATCH, url, &body).await
    }

    async fn delete(&self, calendar_id: &str, event_id: &str) -> Result<(), ServiceError> {
        let url = self.url(&["calendars", calendar_id, "events", event_id])?;
        let request = self
            .request(Method::DELETE, url)
            .await?
            .query(&[("sendUpdates", "none")]);

        let response = Self::send(request).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            // Already deleted
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(()),
            _ => Err(Self::failure(response, false).await),
        }
    }
}
