/*!
Command handlers for the CLI

This module provides the handlers invoked by the CLI entrypoint. The
`session` module implements every `chatvault session ...` subcommand on top
of [`SessionManager`](crate::manager::SessionManager).
*/

use crate::context::OpContext;
use crate::error::ChatvaultError;
use colored::Colorize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// Session command handlers
pub mod session;

/// Per-command cancellation source
///
/// Hands out fresh [`OpContext`]s that share the process-wide cancellation
/// token (cancelled on Ctrl-C) and carry a deadline measured from the moment
/// each phase starts. Time spent at a confirmation prompt is not charged to
/// the store operation that follows it.
#[derive(Debug, Clone)]
pub struct CommandContext {
    token: CancellationToken,
    timeout: Duration,
}

impl CommandContext {
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self { token, timeout }
    }

    /// Context for the next store operation
    pub fn op(&self) -> OpContext {
        OpContext::from_token(self.token.clone(), Instant::now().checked_add(self.timeout))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Print a command failure to stderr
///
/// Input and lookup errors are shown as-is. Cancellation gets a hint about
/// `--timeout`. Storage and export internals are logged in full and the user
/// sees a short summary.
pub fn report_error(err: &ChatvaultError, timeout: Duration) {
    match err {
        e if e.is_user_facing() => {
            eprintln!("{} {}", "Error:".red().bold(), e);
        }
        ChatvaultError::DeadlineExceeded(op) => {
            eprintln!(
                "{} {} did not finish within {}s",
                "Error:".red().bold(),
                op,
                timeout.as_secs()
            );
            eprintln!("Retry with a longer {}", "--timeout <SECONDS>".cyan());
        }
        ChatvaultError::Cancelled(op) => {
            eprintln!("{} {} was cancelled", "Error:".red().bold(), op);
        }
        ChatvaultError::Export { .. } => {
            tracing::error!(error = %error_chain(err), "Export failed");
            eprintln!("{} {}", "Error:".red().bold(), err);
        }
        other => {
            tracing::error!(error = %other, "Command failed");
            eprintln!(
                "{} the session store could not complete the request (run with -v for details)",
                "Error:".red().bold()
            );
        }
    }
}

/// Render an error and all of its sources on one line
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
