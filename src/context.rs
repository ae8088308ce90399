//! Cancellable, deadline-bearing operation context
//!
//! Every store, search and export operation takes an [`OpContext`]. The
//! context is checked before a connection is opened, between statements of a
//! transaction and again before commit, so a cancelled or expired operation
//! never commits partial work.

use crate::error::{ChatvaultError, Result};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline carrier for a single logical operation
///
/// Cloning shares the cancellation token, so cancelling any clone cancels
/// them all.
///
/// # Examples
///
/// ```
/// use chatvault::OpContext;
/// use std::time::Duration;
///
/// let ctx = OpContext::with_timeout(Duration::from_secs(30));
/// assert!(ctx.check("list sessions").is_ok());
///
/// ctx.cancel();
/// assert!(ctx.check("list sessions").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context that expires `timeout` from now
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Context that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Context driven by an existing cancellation token
    pub fn from_token(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { token, deadline }
    }

    /// The token backing this context
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The deadline, if one was set
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every clone of it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context was cancelled explicitly
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the deadline has elapsed
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline; `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail with `Cancelled` or `DeadlineExceeded` if the operation must stop
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(ChatvaultError::Cancelled(operation.to_string()));
        }
        if self.is_expired() {
            return Err(ChatvaultError::DeadlineExceeded(operation.to_string()));
        }
        Ok(())
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}
