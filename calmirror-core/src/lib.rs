//! Core of calmirror, a one-way calendar mirror.
//!
//! This crate knows nothing about any particular calendar service:
//! - `event` and `origin` model source events and the key their mirrors carry
//! - `matcher`, `resolver` and `engine` decide and apply target mutations
//! - `state` and `lock` hold the per-source cursors and the run lock
//!
//! Services plug in through [`CalendarService`] and [`CredentialProvider`].

pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod event;
pub mod lock;
pub mod matcher;
pub mod mirror;
pub mod origin;
pub mod report;
pub mod resolver;
pub mod service;
pub mod state;

pub use config::MirrorConfig;
pub use credentials::{CredentialProvider, Role};
pub use engine::{EngineOptions, ReconciliationEngine, SourceMapping};
pub use error::{MirrorError, MirrorResult};
pub use event::*;
pub use mirror::MirrorBody;
pub use origin::OriginKey;
pub use report::{Action, Reconciled, SourceReport, SyncReport};
pub use service::{
    CalendarService, EventPage, EventPatch, InsertOutcome, ListQuery, ServiceError,
};
pub use state::SyncStateStore;
