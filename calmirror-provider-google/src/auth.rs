//! Interactive OAuth consent for one role.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;

use anyhow::{Context, Result};
use calmirror_core::{MirrorConfig, Role};
use tracing::{debug, info};
use url::Url;

use crate::session::{OAuthApp, StoredTokens, save_tokens};

pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/calendar",
    "https://www.googleapis.com/auth/userinfo.email",
    "openid",
];

/// Run the consent flow for `role` and store the resulting tokens in
/// `<role>-tokens.json`. Returns the tokens so the caller can print them.
pub async fn authenticate(config: &MirrorConfig, role: Role) -> Result<StoredTokens> {
    let app = OAuthApp::from_config(config)?;
    let redirect = Url::parse(&app.redirect_uri)
        .with_context(|| format!("Invalid OAUTH_REDIRECT_URI: {}", app.redirect_uri))?;

    let mut client = app.client(String::new(), String::new());

    let scopes: Vec<String> = SCOPES.iter().map(|s| s.to_string()).collect();
    // Force the consent screen so Google issues a refresh token every time.
    let auth_url = format!("{}&prompt=consent", client.user_consent_url(&scopes));

    eprintln!("\nOpen this URL in your browser to authorize the {role} account:\n");
    eprintln!("{}\n", auth_url);

    if open::that(&auth_url).is_err() {
        eprintln!("(Could not open browser automatically, please copy the URL above)");
    }

    let callback = redirect.clone();
    let (code, state) = tokio::task::spawn_blocking(move || wait_for_callback(&callback))
        .await
        .context("OAuth callback listener panicked")??;

    eprintln!("\nReceived authorization code, exchanging for tokens...");

    let access_token = client
        .get_access_token(&code, &state)
        .await
        .context("Failed to exchange code for tokens")?;

    let mut tokens = StoredTokens::from_access_token(&access_token, None);
    tokens.scope = Some(SCOPES.join(" "));

    let path = config.token_path(role);
    save_tokens(&path, &tokens)?;
    info!(role = %role, path = %path.display(), "tokens saved");

    Ok(tokens)
}

/// Serve the redirect address until the browser delivers the code.
fn wait_for_callback(redirect: &Url) -> Result<(String, String)> {
    let host = redirect.host_str().unwrap_or("localhost");
    let port = redirect
        .port_or_known_default()
        .context("OAUTH_REDIRECT_URI has no port")?;
    let bind_host = if host == "localhost" { "127.0.0.1" } else { host };

    let listener = TcpListener::bind((bind_host, port))
        .with_context(|| format!("Failed to bind to {bind_host}:{port}"))?;

    eprintln!("Waiting for OAuth callback on {}...", redirect);

    loop {
        let (mut stream, _) = listener.accept().context("Failed to accept connection")?;

        let mut reader = BufReader::new(&stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;

        let url_part = request_line
            .split_whitespace()
            .nth(1)
            .context("Invalid request")?;
        let url = redirect.join(url_part)?;

        if url.path() != redirect.path() {
            debug!(path = url.path(), "ignoring request outside the callback path");
            stream.write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n")?;
            continue;
        }

        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.to_string())
        };

        let Some(code) = param("code") else {
            stream.write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\nMissing code")?;
            continue;
        };
        let state = param("state").unwrap_or_default();

        let response = "HTTP/1.1 200 OK\r\n\
            Content-Type: text/html\r\n\
            Connection: close\r\n\
            \r\n\
            <html><body>\
            <h1>Authentication successful!</h1>\
            <p>You can close this window and return to the terminal.</p>\
            </body></html>";

        stream.write_all(response.as_bytes())?;
        stream.flush()?;

        return Ok((code, state));
    }
}
