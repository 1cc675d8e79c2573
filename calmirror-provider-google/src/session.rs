//! OAuth tokens for the source and target accounts, refreshed on demand.
//!
//! Tokens for a role come from `<ROLE>_TOKENS_JSON` when set, else from
//! `<role>-tokens.json` next to the state file. Refreshed tokens that were
//! loaded from a file are written back to it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use calmirror_core::{CredentialProvider, MirrorConfig, MirrorError, MirrorResult, Role};
use chrono::{DateTime, Duration, Utc};
use google_calendar::{AccessToken, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Refresh tokens that expire within this margin.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Token JSON as written by `calmirror auth`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Milliseconds since the epoch
    #[serde(default)]
    pub expiry_date: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl StoredTokens {
    /// Tokens from an OAuth response. Google usually omits the refresh token
    /// on refresh, so `previous` supplies it.
    pub fn from_access_token(token: &AccessToken, previous: Option<&StoredTokens>) -> Self {
        let refresh_token = if token.refresh_token.is_empty() {
            previous.and_then(|p| p.refresh_token.clone())
        } else {
            Some(token.refresh_token.clone())
        };
        let expiry_date = (token.expires_in > 0)
            .then(|| (Utc::now() + Duration::seconds(token.expires_in)).timestamp_millis());

        StoredTokens {
            access_token: token.access_token.clone(),
            refresh_token,
            token_type: Some("Bearer".to_string()),
            expiry_date,
            scope: previous.and_then(|p| p.scope.clone()),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiry_date.and_then(DateTime::from_timestamp_millis)
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        self.expires_at()
            .is_some_and(|expires_at| expires_at - now <= Duration::seconds(EXPIRY_SKEW_SECS))
    }
}

/// Write tokens with owner-only permissions.
pub fn save_tokens(path: &Path, tokens: &StoredTokens) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let contents = serde_json::to_string_pretty(tokens).context("Failed to serialize tokens")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write tokens to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

fn load_tokens(path: &Path) -> Result<StoredTokens> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tokens from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse tokens from {}", path.display()))
}

/// OAuth client registration shared by both roles.
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl OAuthApp {
    pub fn from_config(config: &MirrorConfig) -> MirrorResult<Self> {
        let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

        match (
            non_empty(&config.google_client_id),
            non_empty(&config.google_client_secret),
        ) {
            (Some(client_id), Some(client_secret)) => Ok(OAuthApp {
                client_id,
                client_secret,
                redirect_uri: config.oauth_redirect_uri.clone(),
            }),
            _ => Err(MirrorError::Credentials(
                "Set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET".into(),
            )),
        }
    }

    pub fn client(&self, access_token: String, refresh_token: String) -> Client {
        Client::new(
            self.client_id.clone(),
            self.client_secret.clone(),
            self.redirect_uri.clone(),
            access_token,
            refresh_token,
        )
    }
}

#[derive(Debug)]
struct Session {
    tokens: StoredTokens,
    /// File to write refreshed tokens back to; `None` for inline JSON
    file: Option<PathBuf>,
}

/// `CredentialProvider` holding one session per role.
pub struct TokenStore {
    app: OAuthApp,
    sessions: Mutex<HashMap<Role, Session>>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("client_id", &self.app.client_id)
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    /// Load both roles' tokens, failing if any are missing or unreadable.
    pub fn load(config: &MirrorConfig) -> MirrorResult<Self> {
        let app = OAuthApp::from_config(config)?;

        let mut sessions = HashMap::new();
        for role in Role::ALL {
            sessions.insert(role, Self::load_session(config, role)?);
        }

        Ok(TokenStore {
            app,
            sessions: Mutex::new(sessions),
        })
    }

    fn load_session(config: &MirrorConfig, role: Role) -> MirrorResult<Session> {
        let env_name = format!("{}_TOKENS_JSON", role.as_str().to_uppercase());

        if let Some(json) = config.tokens_json(role) {
            let tokens = serde_json::from_str(json)
                .map_err(|e| MirrorError::Credentials(format!("{env_name} is not valid token JSON: {e}")))?;
            debug!(role = %role, "using inline tokens");
            return Ok(Session { tokens, file: None });
        }

        let path = config.token_path(role);
        if !path.exists() {
            return Err(MirrorError::Credentials(format!(
                "No tokens for the {role} account. Set {env_name} or run `calmirror auth {role}`"
            )));
        }

        let tokens = load_tokens(&path).map_err(|e| MirrorError::Credentials(format!("{e:#}")))?;
        debug!(role = %role, path = %path.display(), "loaded tokens");
        Ok(Session {
            tokens,
            file: Some(path),
        })
    }

    async fn refresh(&self, role: Role, tokens: &StoredTokens) -> Result<StoredTokens> {
        let refresh_token = tokens
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .with_context(|| format!("The {role} tokens have no refresh token; run `calmirror auth {role}`"))?;

        let client = self.app.client(tokens.access_token.clone(), refresh_token);
        let refreshed = client
            .refresh_access_token()
            .await
            .with_context(|| format!("Failed to refresh the {role} access token"))?;

        Ok(StoredTokens::from_access_token(&refreshed, Some(tokens)))
    }
}

#[async_trait]
impl CredentialProvider for TokenStore {
    async fn access_token(&self, role: Role) -> MirrorResult<String> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&role)
            .ok_or_else(|| MirrorError::Credentials(format!("No session for the {role} account")))?;

        if session.tokens.needs_refresh(Utc::now()) {
            info!(role = %role, "access token expiring, refreshing");
            let refreshed = self
                .refresh(role, &session.tokens)
                .await
                .map_err(|e| MirrorError::Credentials(format!("{e:#}")))?;

            if let Some(path) = &session.file {
                save_tokens(path, &refreshed).map_err(|e| MirrorError::Credentials(format!("{e:#}")))?;
            }
            session.tokens = refreshed;
        }

        Ok(session.tokens.access_token.clone())
    }
}
