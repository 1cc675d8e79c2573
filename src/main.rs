mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use calmirror_core::Role;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "calmirror")]
#[command(about = "Mirror events from source calendars into one target calendar")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass over every source calendar
    Sync {
        /// Config file (default: ~/.config/calmirror/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Forget every stored sync token before syncing
        #[arg(long)]
        reset: bool,

        /// Forget the sync tokens of these source calendars
        #[arg(long, value_delimiter = ',')]
        reset_for: Vec<String>,

        /// Neither read nor write sync state
        #[arg(long)]
        no_state: bool,
    },
    /// Authorize the source or target Google account
    Auth {
        /// "source" or "target"
        role: Role,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sync {
            config,
            reset,
            reset_for,
            no_state,
        } => {
            let flags = commands::sync::SyncFlags {
                reset,
                reset_for,
                no_state,
            };
            commands::sync::run(config.as_deref(), flags).await
        }
        Commands::Auth { role, config } => commands::auth::run(role, config.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red(), e);
            ExitCode::FAILURE
        }
    }
}
