//! The reconciliation engine.
//!
//! For each source calendar, pages through changed events (since the stored
//! cursor, or over a forward window when there is none) and decides per
//! event whether its mirror in the target must be deleted, updated, adopted
//! from an untagged duplicate, or created. Nothing is carried between
//! events except what is visible in the target calendar itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MirrorConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::event::Event;
use crate::matcher::EventMatcher;
use crate::mirror::MirrorBody;
use crate::origin::OriginKey;
use crate::report::{Action, Reconciled, SourceReport, SyncReport};
use crate::resolver;
use crate::service::{CalendarService, EventPatch, InsertOutcome, ListQuery, ServiceError};
use crate::state::SyncStateStore;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Pause after this many events (0 disables pacing).
    pub pace_every: usize,
    pub pace_delay: Duration,
    pub race_retry_delay: Duration,
    /// Forward window listed when a source has no cursor.
    pub window: chrono::Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            pace_every: 10,
            pace_delay: Duration::from_millis(100),
            race_retry_delay: Duration::from_millis(200),
            window: chrono::Duration::weeks(2),
        }
    }
}

impl TryFrom<&MirrorConfig> for EngineOptions {
    type Error = MirrorError;

    fn try_from(config: &MirrorConfig) -> MirrorResult<Self> {
        Ok(EngineOptions {
            pace_every: config.pace_every,
            pace_delay: config.pace_delay,
            race_retry_delay: config.race_retry_delay,
            window: config.window()?,
        })
    }
}

/// A configured source id and the canonical id it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMapping {
    pub configured: String,
    pub canonical: String,
}

pub struct ReconciliationEngine {
    source: Arc<dyn CalendarService>,
    target: Arc<dyn CalendarService>,
    target_id: String,
    matcher: EventMatcher,
    options: EngineOptions,
    cancel: CancellationToken,
}

impl ReconciliationEngine {
    pub fn new(
        source: Arc<dyn CalendarService>,
        target: Arc<dyn CalendarService>,
        target_id: impl Into<String>,
        options: EngineOptions,
    ) -> Self {
        let target_id = target_id.into();
        let matcher = EventMatcher::new(Arc::clone(&target), target_id.clone());

        ReconciliationEngine {
            source,
            target,
            target_id,
            matcher,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between units of work once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Resolve aliases like `primary` to canonical ids, in configured order.
    /// Resolution failures fall back to the configured id. Repeats are kept
    /// here and skipped by [`ReconciliationEngine::run`].
    pub async fn canonical_sources(&self, configured: &[String]) -> Vec<SourceMapping> {
        let mut mappings: Vec<SourceMapping> = Vec::new();

        for raw in configured {
            let canonical = match self.source.resolve_calendar_id(raw).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(calendar = %raw, error = %e, "could not resolve calendar id, using it as given");
                    raw.clone()
                }
            };
            mappings.push(SourceMapping {
                configured: raw.clone(),
                canonical,
            });
        }

        mappings
    }

    /// Mirror every source in order. A failing source aborts the run; cursors
    /// already persisted for earlier sources and pages stay valid.
    pub async fn run(
        &self,
        sources: &[String],
        state: &mut SyncStateStore,
    ) -> MirrorResult<SyncReport> {
        let mut report = SyncReport::default();
        let mut seen: Vec<&str> = Vec::new();

        for source_id in sources {
            if seen.contains(&source_id.as_str()) {
                continue;
            }
            seen.push(source_id);

            match self.sync_source(source_id, state).await {
                Ok(source_report) => report.sources.push(source_report),
                Err(MirrorError::Cancelled) => {
                    info!(source = %source_id, "run interrupted, stopping");
                    report.cancelled = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    fn window_query(&self) -> ListQuery {
        let now = Utc::now();
        ListQuery::window(now, now + self.options.window)
    }

    /// Page through one source and reconcile each event, persisting the
    /// cursor as soon as a page carries one.
    pub async fn sync_source(
        &self,
        source_id: &str,
        state: &mut SyncStateStore,
    ) -> MirrorResult<SourceReport> {
        let mut report = SourceReport::new(source_id);

        let mut query = match state.cursor(source_id) {
            Some(token) => ListQuery::changes_since(token),
            None => self.window_query(),
        };
        let mut page_token: Option<String> = None;
        let mut processed = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }

            let incremental = query.sync_token.is_some();
            let request = query.clone().with_page_token(page_token.take());

            let page = match self.source.list(source_id, &request).await {
                Ok(page) => page,
                Err(ServiceError::CursorInvalidated) if incremental => {
                    warn!(source = %source_id, "stale sync token, resetting to window");
                    state.clear_cursor(source_id);
                    report.cursor_resets += 1;
                    query = self.window_query();
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            report.pages += 1;
            report.fetched += page.items.len();
            info!(
                source = %source_id,
                target = %self.target_id,
                items = page.items.len(),
                mode = if incremental { "inc" } else { "full" },
                "fetched page"
            );

            for event in &page.items {
                if self.cancel.is_cancelled() {
                    return Err(MirrorError::Cancelled);
                }
                if self.options.pace_every > 0
                    && processed > 0
                    && processed % self.options.pace_every == 0
                {
                    tokio::time::sleep(self.options.pace_delay).await;
                }

                let reconciled = self.reconcile_event(source_id, event).await?;
                report.record(&reconciled);
                processed += 1;
            }

            if let Some(token) = page.next_sync_token.as_deref() {
                state.set_cursor(source_id, token);
                debug!(source = %source_id, "sync token persisted");
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(report)
    }

    /// Decide and apply the mutation for one observed source event.
    pub async fn reconcile_event(
        &self,
        source_id: &str,
        event: &Event,
    ) -> MirrorResult<Reconciled> {
        let key = OriginKey::for_event(source_id, event);

        if event.is_cancelled() {
            return self.remove_mirror(event, &key).await.map(Reconciled::from);
        }

        let body = MirrorBody::project(event, &key);

        if let Some(mirror) = self.matcher.find_mirror(event, &key).await? {
            return self.update_mirror(event, &mirror, &body).await.map(Reconciled::from);
        }

        let duplicates: Vec<Event> = self
            .matcher
            .find_title_time_duplicates(event)
            .await
            .into_iter()
            .filter(|dup| dup.origin.is_none())
            .collect();

        let mut duplicates_removed = 0;
        if !duplicates.is_empty() {
            let (survivor, removed) = self.resolve_duplicates(event, &body, duplicates).await;
            duplicates_removed = removed;

            if let Some(adopted) = survivor {
                self.target
                    .patch(&self.target_id, &adopted.id, &EventPatch::Mirror(body.clone()))
                    .await?;
                info!(
                    origin = %key,
                    event_id = %adopted.id,
                    summary = %event.display_summary(),
                    start = %event.display_start(),
                    "adopted existing event as mirror"
                );
                return Ok(Reconciled {
                    action: Action::Adopted {
                        event_id: adopted.id,
                    },
                    duplicates_removed,
                });
            }
        }

        let action = self.create_mirror(event, &key, &body).await?;
        Ok(Reconciled {
            action,
            duplicates_removed,
        })
    }

    async fn remove_mirror(&self, event: &Event, key: &OriginKey) -> MirrorResult<Action> {
        let Some(mirror) = self.matcher.find_mirror(event, key).await? else {
            debug!(origin = %key, "cancelled at source, no mirror to delete");
            return Ok(Action::NoMirror);
        };

        self.target.delete(&self.target_id, &mirror.id).await?;
        info!(
            origin = %key,
            event_id = %mirror.id,
            summary = %mirror.display_summary(),
            start = %mirror.display_start(),
            "deleted mirror"
        );
        Ok(Action::Deleted {
            event_id: mirror.id,
        })
    }

    async fn update_mirror(
        &self,
        event: &Event,
        mirror: &Event,
        body: &MirrorBody,
    ) -> MirrorResult<Action> {
        if body.is_reflected_by(mirror) {
            debug!(origin = %body.origin, event_id = %mirror.id, "mirror up to date, skipping");
            return Ok(Action::Unchanged {
                event_id: mirror.id.clone(),
            });
        }

        self.target
            .patch(&self.target_id, &mirror.id, &EventPatch::Mirror(body.clone()))
            .await?;
        info!(
            origin = %body.origin,
            event_id = %mirror.id,
            summary = %event.display_summary(),
            start = %event.display_start(),
            "updated mirror"
        );
        Ok(Action::Updated {
            event_id: mirror.id.clone(),
        })
    }

    /// Let the fresh body compete with untagged duplicates. Every loser that
    /// exists in the target is deleted; returns the winner if it is one of
    /// the duplicates, along with how many were removed.
    async fn resolve_duplicates(
        &self,
        event: &Event,
        body: &MirrorBody,
        duplicates: Vec<Event>,
    ) -> (Option<Event>, usize) {
        let mut candidates = Vec::with_capacity(duplicates.len() + 1);
        candidates.push(body.as_candidate(event));
        candidates.extend(duplicates);

        let winner = resolver::survivor(&candidates).unwrap_or(0);
        let mut removed = 0;

        for (i, dup) in candidates.iter().enumerate().skip(1) {
            if i == winner {
                continue;
            }
            match self.target.delete(&self.target_id, &dup.id).await {
                Ok(()) => {
                    removed += 1;
                    info!(
                        event_id = %dup.id,
                        summary = %dup.display_summary(),
                        "deleted older duplicate with same title+time"
                    );
                }
                Err(e) => warn!(event_id = %dup.id, error = %e, "failed to delete duplicate"),
            }
        }

        let survivor = (winner != 0).then(|| candidates.swap_remove(winner));
        (survivor, removed)
    }

    /// Insert a new mirror, guarding against one having appeared since the
    /// lookup (an earlier page, or a concurrent writer).
    async fn create_mirror(
        &self,
        event: &Event,
        key: &OriginKey,
        body: &MirrorBody,
    ) -> MirrorResult<Action> {
        if let Some(mirror) = self.matcher.find_by_origin(key).await? {
            debug!(origin = %key, event_id = %mirror.id, "mirror appeared before insert");
            return self.update_mirror(event, &mirror, body).await;
        }

        let failure = match InsertOutcome::from(self.target.insert(&self.target_id, body).await) {
            InsertOutcome::Created(created) => {
                info!(
                    origin = %key,
                    event_id = %created.id,
                    summary = %event.display_summary(),
                    start = %event.display_start(),
                    "created mirror"
                );
                return Ok(Action::Created {
                    event_id: created.id,
                });
            }
            failure => failure,
        };

        warn!(origin = %key, failure = ?failure, "insert failed, checking for a racing mirror");
        tokio::time::sleep(self.options.race_retry_delay).await;

        let raced = match self.matcher.find_by_origin(key).await? {
            Some(mirror) => Some(mirror),
            None => self.matcher.find_by_ical_uid(event, key).await?,
        };

        if let Some(mirror) = raced {
            let patch = EventPatch::Mirror(body.clone());
            match self.target.patch(&self.target_id, &mirror.id, &patch).await {
                Ok(_) => info!(
                    origin = %key,
                    event_id = %mirror.id,
                    summary = %event.display_summary(),
                    "updated mirror (race resolved)"
                ),
                Err(e) => warn!(origin = %key, event_id = %mirror.id, error = %e, "patch failed after race"),
            }
            return Ok(Action::RaceResolved {
                event_id: mirror.id,
            });
        }

        match failure {
            InsertOutcome::Conflict(message) => {
                warn!(origin = %key, %message, "duplicate reported, mirror may already exist");
                Ok(Action::DuplicateIgnored)
            }
            InsertOutcome::TransientFailure(message) => {
                Err(ServiceError::Transient(message).into())
            }
            InsertOutcome::FatalFailure(error) => Err(error.into()),
            InsertOutcome::Created(created) => Ok(Action::Created {
                event_id: created.id,
            }),
        }
    }
}
