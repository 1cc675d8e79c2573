//! Google Calendar provider for calmirror.
//!
//! - `api`: [`GoogleCalendar`], the `CalendarService` over the v3 REST API
//! - `convert`: Google JSON <-> provider-neutral events
//! - `session`: stored OAuth tokens and refresh ([`TokenStore`])
//! - `auth`: the interactive consent flow

pub mod api;
pub mod auth;
pub mod convert;
pub mod session;

pub use api::GoogleCalendar;
pub use session::{StoredTokens, TokenStore};
