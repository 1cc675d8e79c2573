//! Origin keys: the tag that links a mirror back to exactly one source event.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Name of the private extended property carrying the origin key.
pub const ORIGIN_PROPERTY: &str = "origin";

/// Suffix Google appends to UIDs of natively created events.
const VENDOR_UID_SUFFIX: &str = "@google.com";

/// `<canonicalSourceCalendarId>:<normalizedICalUID>[:<originalStartISO>]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginKey(String);

impl OriginKey {
    /// Build the key for a source event. Falls back to the event id when the
    /// provider omits the UID (bare cancellation records do).
    pub fn for_event(source_calendar_id: &str, event: &Event) -> Self {
        let uid = event.ical_uid.as_deref().unwrap_or(&event.id);
        let base = format!("{}:{}", source_calendar_id, normalize_ical_uid(uid));

        match &event.original_start {
            Some(original) => OriginKey(format!("{}:{}", base, original.to_iso())),
            None => OriginKey(base),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether an event carries exactly this tag.
    pub fn tags(&self, event: &Event) -> bool {
        event.origin.as_deref() == Some(self.as_str())
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip the vendor suffix so UIDs round-trip across calendar systems.
pub fn normalize_ical_uid(uid: &str) -> String {
    uid.replace(VENDOR_UID_SUFFIX, "")
}

/// Lower-cased, trimmed title used for title+time duplicate detection.
pub fn normalize_title(summary: &str) -> String {
    summary.trim().to_lowercase()
}
