use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use calmirror_core::lock::{LockAttempt, LockManager};
use calmirror_core::{
    CredentialProvider, EngineOptions, MirrorConfig, ReconciliationEngine, Role, SyncReport,
    SyncStateStore,
};
use calmirror_provider_google::{GoogleCalendar, TokenStore};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command line overrides layered on top of the loaded config.
pub struct SyncFlags {
    pub reset: bool,
    pub reset_for: Vec<String>,
    pub no_state: bool,
}

pub async fn run(config_path: Option<&Path>, flags: SyncFlags) -> Result<()> {
    let mut config = MirrorConfig::load(config_path)?;
    config.reset |= flags.reset;
    config.reset_for.extend(flags.reset_for);
    config.state_disable |= flags.no_state;
    config.validate()?;

    let credentials: Arc<dyn CredentialProvider> = Arc::new(TokenStore::load(&config)?);

    let lock = LockManager::new(config.lock_path());
    let guard = match lock.try_acquire()? {
        LockAttempt::Acquired(guard) => guard,
        LockAttempt::Held { pid } => {
            println!(
                "{}",
                format!("Another sync is running (pid {pid}), skipping this run").yellow()
            );
            return Ok(());
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(stop_on_signal(cancel.clone()));

    let timeout = config.request_timeout;
    let source = Arc::new(GoogleCalendar::with_timeout(
        credentials.clone(),
        Role::Source,
        timeout,
    )?);
    let target = Arc::new(GoogleCalendar::with_timeout(
        credentials,
        Role::Target,
        timeout,
    )?);
    let engine = ReconciliationEngine::new(
        source,
        target,
        config.target_calendar_id.clone(),
        EngineOptions::try_from(&config)?,
    )
    .with_cancellation(cancel);

    let mappings = engine.canonical_sources(&config.source_calendar_ids).await;
    let rendered: Vec<String> = mappings
        .iter()
        .map(|m| format!("{} -> {}", m.configured, m.canonical))
        .collect();
    println!("Sources: {}", rendered.join(", "));
    println!("Target:  {}", engine.target_id());

    let mut state = SyncStateStore::load(config.state_path(), !config.state_disable);

    if config.reset {
        info!("resetting all sync tokens");
        state.reset_all();
    } else if !config.reset_for.is_empty() {
        let reset: Vec<String> = engine
            .canonical_sources(&config.reset_for)
            .await
            .into_iter()
            .map(|m| m.canonical)
            .collect();
        info!(calendars = ?reset, "resetting sync tokens");
        state.reset(&reset);
    }

    let source_ids: Vec<String> = mappings.into_iter().map(|m| m.canonical).collect();
    let report = engine
        .run(&source_ids, &mut state)
        .await
        .context("Sync aborted")?;

    print_summary(&report);

    guard.release()?;
    Ok(())
}

async fn stop_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    warn!("stop requested, finishing the current event");
    cancel.cancel();
}

fn print_summary(report: &SyncReport) {
    for source in &report.sources {
        let line = format!(
            "{}: {} fetched, {} created, {} updated, {} adopted, {} deleted, {} duplicates removed, {} unchanged",
            source.source_id,
            source.fetched,
            source.created,
            source.updated,
            source.adopted,
            source.deleted,
            source.duplicates_removed,
            source.unchanged,
        );
        println!("   {}", line.dimmed());
    }

    let (created, updated, deleted) = report.counts();
    println!(
        "\nMirrored: {} created, {} updated, {} deleted",
        created.green(),
        updated.yellow(),
        deleted.red()
    );

    if report.cancelled {
        println!("{}", "Stopped early on request".yellow());
    }
}
