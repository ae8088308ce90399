//! Chatvault - local store for AI conversation sessions
//!
#![doc = "Chatvault - local store for AI conversation sessions"]
#![doc = "Main entry point for the chatvault command-line tool."]

use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chatvault::cli::{Cli, Commands};
use chatvault::commands::{self, CommandContext};
use chatvault::config::Config;
use chatvault::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    // Validate configuration
    config.validate().context("invalid configuration")?;

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling current operation");
            interrupt.cancel();
        }
    });

    let timeout = Duration::from_secs(config.session.operation_timeout_seconds);
    let cmd = CommandContext::new(token, timeout);

    // Execute command
    let outcome = match cli.command {
        Commands::Session { command } => {
            tracing::debug!(?command, "Starting session command");
            // The store is synchronous; keep it off the async workers.
            tokio::task::spawn_blocking(move || {
                let manager = SessionManager::open(&config)?;
                commands::session::handle_session(&manager, &config, &cmd, command)
            })
            .await
            .context("session command task failed")?
        }
    };

    if let Err(err) = outcome {
        commands::report_error(&err, timeout);
        std::process::exit(1);
    }
    Ok(())
}

/// Initialize tracing subscriber with environment filter
///
/// Logs go to stderr so `--json` output on stdout stays machine-readable.
fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "chatvault=debug"
    } else {
        "chatvault=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
