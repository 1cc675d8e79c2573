//! Freshness ordering between candidate events, used to pick a survivor
//! when the same logical event exists more than once in the target.

use chrono::{DateTime, Utc};

use crate::event::Event;

/// Last update, else creation, else the epoch.
fn freshness(event: &Event) -> DateTime<Utc> {
    event
        .updated
        .or(event.created)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Heuristic richness of an event, used to break timestamp ties.
pub fn detail_score(event: &Event) -> usize {
    let mut score = 0;
    if event.description.as_deref().is_some_and(|d| !d.trim().is_empty()) {
        score += 2;
    }
    if event.location.as_deref().is_some_and(|l| !l.trim().is_empty()) {
        score += 1;
    }
    score += event.attendees.len();
    score += event.attachments.len();
    if !event.reminders.is_empty() {
        score += 1;
    }
    score
}

/// Whether `a` should win over `b`. Strictly fresher wins; on equal
/// freshness the strictly richer one wins; a full tie keeps `b`.
pub fn is_newer(a: &Event, b: &Event) -> bool {
    let (fa, fb) = (freshness(a), freshness(b));
    if fa != fb {
        return fa > fb;
    }
    detail_score(a) > detail_score(b)
}

/// Index of the surviving candidate. Earlier candidates win full ties.
pub fn survivor(candidates: &[Event]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let mut best = 0;
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        if is_newer(candidate, &candidates[best]) {
            best = i;
        }
    }
    Some(best)
}
