//! Locating the mirror of a source event in the target calendar.
//!
//! Strategies run in priority order and stop at the first hit:
//! 1. the exact origin tag,
//! 2. the iCalendar UID (tagging the hit so step 1 finds it next time).
//!
//! Title+time search is not a mirror lookup; the engine uses it only to
//! guard creation against untagged duplicates.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::event::Event;
use crate::origin::{OriginKey, normalize_title};
use crate::service::{CalendarService, EventPatch, ListQuery, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    OriginKey,
    ICalUid,
}

/// Mirror lookup order.
pub const MIRROR_STRATEGIES: [MatchStrategy; 2] = [MatchStrategy::OriginKey, MatchStrategy::ICalUid];

pub struct EventMatcher {
    target: Arc<dyn CalendarService>,
    target_id: String,
}

impl EventMatcher {
    pub fn new(target: Arc<dyn CalendarService>, target_id: impl Into<String>) -> Self {
        EventMatcher {
            target,
            target_id: target_id.into(),
        }
    }

    /// Find the existing mirror of `source`, trying each strategy in order.
    pub async fn find_mirror(
        &self,
        source: &Event,
        key: &OriginKey,
    ) -> Result<Option<Event>, ServiceError> {
        for strategy in MIRROR_STRATEGIES {
            if let Some(mirror) = self.find_with(strategy, source, key).await? {
                return Ok(Some(mirror));
            }
        }
        Ok(None)
    }

    pub async fn find_with(
        &self,
        strategy: MatchStrategy,
        source: &Event,
        key: &OriginKey,
    ) -> Result<Option<Event>, ServiceError> {
        match strategy {
            MatchStrategy::OriginKey => self.find_by_origin(key).await,
            MatchStrategy::ICalUid => self.find_by_ical_uid(source, key).await,
        }
    }

    /// Target events tagged with exactly `key`. More than one is an anomaly:
    /// the oldest is taken and the rest are left for a later run.
    pub async fn find_by_origin(&self, key: &OriginKey) -> Result<Option<Event>, ServiceError> {
        let page = self
            .target
            .list(&self.target_id, &ListQuery::by_origin(key))
            .await?;

        let mut items: Vec<Event> = page
            .items
            .into_iter()
            .filter(|e| !e.is_cancelled() && key.tags(e))
            .collect();

        if items.len() > 1 {
            warn!(
                origin = %key,
                count = items.len(),
                "multiple mirrors carry the same origin, using the oldest"
            );
            items.sort_by_key(|e| e.created.unwrap_or(DateTime::<Utc>::MAX_UTC));
        }

        Ok(items.into_iter().next())
    }

    /// Target events sharing the source's UID. Events already owned by a
    /// different origin are never claimed. A hit gets the origin tag
    /// backfilled; failing to tag is logged, not fatal.
    pub async fn find_by_ical_uid(
        &self,
        source: &Event,
        key: &OriginKey,
    ) -> Result<Option<Event>, ServiceError> {
        let Some(uid) = source.ical_uid.as_deref() else {
            return Ok(None);
        };

        let page = self
            .target
            .list(&self.target_id, &ListQuery::by_ical_uid(uid))
            .await?;

        let items: Vec<Event> = page
            .items
            .into_iter()
            .filter(|e| !e.is_cancelled() && (e.origin.is_none() || key.tags(e)))
            .collect();

        let instance_match = source.original_start.as_ref().and_then(|original| {
            items.iter().position(|item| {
                item.original_start
                    .as_ref()
                    .is_some_and(|o| o.same_time(original))
            })
        });

        let Some(mut winner) = items.into_iter().nth(instance_match.unwrap_or(0)) else {
            return Ok(None);
        };

        if !key.tags(&winner) {
            let patch = EventPatch::OriginTag(key.clone());
            match self.target.patch(&self.target_id, &winner.id, &patch).await {
                Ok(_) => {
                    debug!(origin = %key, event_id = %winner.id, "backfilled origin tag");
                    winner.origin = Some(key.to_string());
                }
                Err(e) => warn!(origin = %key, event_id = %winner.id, error = %e, "origin backfill failed"),
            }
        }

        Ok(Some(winner))
    }

    /// Target events with the same normalized title, start and end, found in
    /// a one-day window from the source's start. Search failures yield none.
    pub async fn find_title_time_duplicates(&self, source: &Event) -> Vec<Event> {
        let title = normalize_title(&source.summary);
        let (Some(start), Some(end)) = (&source.start, &source.end) else {
            return Vec::new();
        };
        if title.is_empty() {
            return Vec::new();
        }

        let window_start = start.to_utc();
        let query = ListQuery::by_title(
            &source.summary,
            window_start,
            window_start + Duration::days(1),
        );

        let page = match self.target.list(&self.target_id, &query).await {
            Ok(page) => page,
            Err(e) => {
                warn!(summary = %source.summary, error = %e, "title/time search failed");
                return Vec::new();
            }
        };

        page.items
            .into_iter()
            .filter(|item| {
                !item.is_cancelled()
                    && normalize_title(&item.summary) == title
                    && item.start.as_ref().is_some_and(|s| s.same_time(start))
                    && item.end.as_ref().is_some_and(|e| e.same_time(end))
            })
            .collect()
    }
}
