//! Run configuration.
//!
//! Layered with the `config` crate: serde defaults, then an optional TOML
//! file (`~/.config/calmirror/config.toml` unless one is given), then
//! environment variables such as `SOURCE_CALENDAR_IDS` and
//! `TARGET_CALENDAR_ID`. The resulting value is immutable and handed to
//! the engine explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer};

use crate::credentials::Role;
use crate::error::{MirrorError, MirrorResult};

const DEFAULT_TARGET_CALENDAR: &str = "primary";
const DEFAULT_STATE_FILE: &str = "state.json";
const DEFAULT_LOCK_FILE: &str = "sync.lock";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:3333/oauth/callback";

/// Longest forward window accepted for a full listing.
pub const MAX_WINDOW_DAYS: i64 = 3650;

fn default_target_calendar_id() -> String {
    DEFAULT_TARGET_CALENDAR.to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_FILE)
}

fn default_lock_file() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_FILE)
}

fn default_redirect_uri() -> String {
    DEFAULT_REDIRECT_URI.to_string()
}

fn default_pace_every() -> usize {
    10
}

fn default_pace_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_race_retry_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_window_days() -> i64 {
    14
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn humantime_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    /// Source calendars, in processing order. `primary` is resolved later.
    #[serde(default)]
    pub source_calendar_ids: Vec<String>,

    #[serde(default = "default_target_calendar_id")]
    pub target_calendar_id: String,

    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Neither read nor write sync state.
    #[serde(default)]
    pub state_disable: bool,

    /// Drop every stored cursor before syncing.
    #[serde(default)]
    pub reset: bool,

    /// Drop the stored cursors of these sources before syncing.
    #[serde(default)]
    pub reset_for: Vec<String>,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Callback address of the OAuth consent flow (`calmirror auth` only).
    #[serde(default = "default_redirect_uri")]
    pub oauth_redirect_uri: String,

    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,

    /// Token JSON for the source account, overriding `source-tokens.json`.
    pub source_tokens_json: Option<String>,
    /// Token JSON for the target account, overriding `target-tokens.json`.
    pub target_tokens_json: Option<String>,

    /// Pause after this many events.
    #[serde(default = "default_pace_every")]
    pub pace_every: usize,

    #[serde(default = "default_pace_delay", deserialize_with = "humantime_duration")]
    pub pace_delay: Duration,

    /// Wait before re-checking for a mirror after a failed insert.
    #[serde(
        default = "default_race_retry_delay",
        deserialize_with = "humantime_duration"
    )]
    pub race_retry_delay: Duration,

    /// Forward window listed when a source has no cursor.
    #[serde(default = "default_window_days")]
    pub window_days: i64,

    /// Upper bound on one Calendar API exchange, body included.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "humantime_duration"
    )]
    pub request_timeout: Duration,
}

impl MirrorConfig {
    /// Default location of the optional config file.
    pub fn default_config_path() -> MirrorResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| MirrorError::Config("Could not determine config directory".into()))?
            .join("calmirror");

        Ok(config_dir.join("config.toml"))
    }

    /// Environment source using the variable names of the original tool.
    pub fn environment() -> Environment {
        Environment::default()
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("source_calendar_ids")
            .with_list_parse_key("reset_for")
    }

    /// Load from `file` (required when given) or the default location
    /// (optional), overlaid with the process environment.
    pub fn load(file: Option<&Path>) -> MirrorResult<Self> {
        Self::load_from(file, Self::environment())
    }

    pub fn load_from(file: Option<&Path>, env: Environment) -> MirrorResult<Self> {
        let file_source = match file {
            Some(path) => File::from(path.to_path_buf()).required(true),
            None => File::from(Self::default_config_path()?).required(false),
        };

        let config: MirrorConfig = Config::builder()
            .add_source(file_source)
            .add_source(env)
            .build()
            .map_err(|e| MirrorError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| MirrorError::Config(e.to_string()))?;

        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.source_calendar_ids = clean_ids(self.source_calendar_ids);
        self.reset_for = clean_ids(self.reset_for);
        self.target_calendar_id = self.target_calendar_id.trim().to_string();
        self
    }

    /// Fail before any side effect if the run cannot proceed.
    pub fn validate(&self) -> MirrorResult<()> {
        if self.source_calendar_ids.is_empty() {
            return Err(MirrorError::Config(
                "Set SOURCE_CALENDAR_IDS (comma-separated)".into(),
            ));
        }
        if self.target_calendar_id.is_empty() {
            return Err(MirrorError::Config("TARGET_CALENDAR_ID is empty".into()));
        }
        self.window()?;
        if self.request_timeout.is_zero() {
            return Err(MirrorError::Config("REQUEST_TIMEOUT must be positive".into()));
        }
        Ok(())
    }

    /// The forward window listed when a source has no cursor.
    pub fn window(&self) -> MirrorResult<chrono::Duration> {
        let out_of_range = || {
            MirrorError::Config(format!(
                "WINDOW_DAYS must be between 1 and {MAX_WINDOW_DAYS}, got {}",
                self.window_days
            ))
        };
        if !(1..=MAX_WINDOW_DAYS).contains(&self.window_days) {
            return Err(out_of_range());
        }
        chrono::Duration::try_days(self.window_days).ok_or_else(out_of_range)
    }

    pub fn state_path(&self) -> PathBuf {
        expand(&self.state_file)
    }

    pub fn lock_path(&self) -> PathBuf {
        expand(&self.lock_file)
    }

    /// `<role>-tokens.json`, next to the state file.
    pub fn token_path(&self, role: Role) -> PathBuf {
        let file_name = format!("{}-tokens.json", role.as_str());
        match self.state_path().parent() {
            Some(dir) => dir.join(file_name),
            None => PathBuf::from(file_name),
        }
    }

    /// Inline token JSON for a role, if configured.
    pub fn tokens_json(&self, role: Role) -> Option<&str> {
        let raw = match role {
            Role::Source => self.source_tokens_json.as_deref(),
            Role::Target => self.target_tokens_json.as_deref(),
        };
        raw.filter(|s| !s.trim().is_empty())
    }
}

fn clean_ids(ids: Vec<String>) -> Vec<String> {
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}
