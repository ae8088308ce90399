//! Embedded SQLite storage engine
//!
//! A [`Database`] owns the location of the session database and hands out
//! short-lived connections. Each public operation opens its own connection,
//! runs inside one transaction when it writes, and drops the connection on
//! every exit path. Session rows, message rows and search-index rows are
//! always written through the same transaction handle.

use crate::context::OpContext;
use crate::error::{ChatvaultError, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub mod schema;

/// Environment variable that overrides the default database location
pub const DB_PATH_ENV: &str = "CHATVAULT_DB";

/// Default time a connection waits on a locked database
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest lock wait SQLite can be asked for here
pub const MAX_BUSY_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Lock waits ending this close to the deadline are reported as expired
const DEADLINE_SLACK: Duration = Duration::from_millis(10);

/// Longest single wait for the write lock between context checks
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Handle to the on-disk session database
#[derive(Debug, Clone)]
pub struct Database {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Open the database at its default location
    ///
    /// Honors the `CHATVAULT_DB` environment variable, otherwise places
    /// `sessions.db` in the user's data directory.
    pub fn new() -> Result<Self> {
        if let Ok(override_path) = std::env::var(DB_PATH_ENV) {
            return Self::new_with_path(override_path);
        }
        Self::new_with_path(default_db_path()?)
    }

    /// Open (creating and migrating if needed) the database at `db_path`
    ///
    /// # Examples
    ///
    /// ```
    /// use chatvault::storage::Database;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let db = Database::new_with_path(dir.path().join("sessions.db")).unwrap();
    /// assert!(db.path().exists());
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ChatvaultError::storage("create parent directory for database", e)
                })?;
            }
        }

        let db = Self {
            db_path,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };
        db.init()?;
        Ok(db)
    }

    /// Replace the lock wait applied to every connection
    ///
    /// Waits longer than [`MAX_BUSY_TIMEOUT`] are clamped to it.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout.min(MAX_BUSY_TIMEOUT);
        self
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn init(&self) -> Result<()> {
        let mut conn = Connection::open(&self.db_path)
            .map_err(|e| ChatvaultError::storage("open database", e))?;

        // WAL persists in the file; readers no longer block the single writer.
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| ChatvaultError::storage("enable WAL journal", e))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(mode = %mode, "Database did not switch to WAL journal mode");
        }
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| ChatvaultError::storage("enable foreign keys", e))?;

        schema::migrate(&mut conn)?;
        tracing::debug!(path = %self.db_path.display(), "Session database ready");
        Ok(())
    }

    /// Open a connection for one operation
    ///
    /// The lock wait is clamped to whatever is left of the context deadline so
    /// a contended statement gives up instead of outliving its caller.
    pub(crate) fn connect(&self, ctx: &OpContext, operation: &str) -> Result<Connection> {
        ctx.check(operation)?;

        let conn = Connection::open(&self.db_path)
            .map_err(|e| ChatvaultError::storage(format!("{operation}: open database"), e))?;

        conn.busy_timeout(self.lock_wait(ctx))
            .map_err(|e| ChatvaultError::storage(format!("{operation}: set busy timeout"), e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| ChatvaultError::storage(format!("{operation}: enable foreign keys"), e))?;

        Ok(conn)
    }

    /// How long a statement may wait on a locked database
    fn lock_wait(&self, ctx: &OpContext) -> Duration {
        // SQLite counts the wait in whole milliseconds; round up so the wait
        // never ends before the deadline it was clamped to.
        ctx.remaining().map_or(self.busy_timeout, |left| {
            (left + Duration::from_millis(1)).min(self.busy_timeout)
        })
    }

    /// Run a read-only unit of work on a fresh connection
    ///
    /// Every statement in `f` sees the same snapshot of the database.
    pub(crate) fn read<T, F>(&self, ctx: &OpContext, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.connect(ctx, operation)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(|e| classify(ctx, operation, e))?;

        let value = f(&*tx)?;

        ctx.check(operation)?;
        tx.commit().map_err(|e| classify(ctx, operation, e))?;
        Ok(value)
    }

    /// Run a write unit of work inside one `BEGIN IMMEDIATE` transaction
    ///
    /// The write lock is requested in short slices with the context checked
    /// in between, so cancellation is noticed while another writer holds the
    /// lock. The transaction commits only if `f` succeeds and the context is
    /// still live afterwards; any other exit drops it, which rolls back.
    pub(crate) fn write<T, F>(&self, ctx: &OpContext, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connect(ctx, operation)?;
        let wait = self.lock_wait(ctx);
        let started = Instant::now();

        let tx = loop {
            let slice = LOCK_POLL_INTERVAL.min(wait.saturating_sub(started.elapsed()));
            conn.busy_timeout(slice)
                .map_err(|e| ChatvaultError::storage(format!("{operation}: set busy timeout"), e))?;
            match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
                Ok(tx) => break tx,
                Err(e) if is_busy(&e) && started.elapsed() < wait => ctx.check(operation)?,
                Err(e) => return Err(classify(ctx, operation, e)),
            }
        };
        tx.busy_timeout(self.lock_wait(ctx))
            .map_err(|e| ChatvaultError::storage(format!("{operation}: set busy timeout"), e))?;

        let value = f(&tx)?;

        ctx.check(operation)?;
        tx.commit().map_err(|e| classify(ctx, operation, e))?;
        Ok(value)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn default_db_path() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("dev", "chatvault", "chatvault")
        .ok_or_else(|| ChatvaultError::Config("Could not determine data directory".into()))?;
    Ok(proj_dirs.data_dir().join("sessions.db"))
}

/// Translate a SQLite failure into the error taxonomy
///
/// Lock contention that ran past the context deadline becomes
/// `DeadlineExceeded`; an interrupted statement becomes `Cancelled`.
pub(crate) fn classify(ctx: &OpContext, operation: &str, err: rusqlite::Error) -> ChatvaultError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) if ctx.is_cancelled() => {
            ChatvaultError::Cancelled(operation.to_string())
        }
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            if ctx.remaining().is_some_and(|left| left <= DEADLINE_SLACK) =>
        {
            ChatvaultError::DeadlineExceeded(format!("{operation}: database is locked"))
        }
        Some(ErrorCode::OperationInterrupted) => ChatvaultError::Cancelled(operation.to_string()),
        _ => ChatvaultError::storage(operation.to_string(), err),
    }
}

/// Whether a SQLite error is a uniqueness / primary key violation
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

/// Attach an operation name to a raw rusqlite result
pub(crate) trait StorageResultExt<T> {
    fn storage_context(self, context: &str) -> Result<T>;
}

impl<T> StorageResultExt<T> for rusqlite::Result<T> {
    fn storage_context(self, context: &str) -> Result<T> {
        self.map_err(|e| ChatvaultError::storage(context.to_string(), e))
    }
}

/// `%needle%` pattern for a `LIKE ... ESCAPE '\'` clause
///
/// Wildcards in the needle match themselves.
pub(crate) fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Render a timestamp in the sortable form stored in TEXT columns
///
/// Fixed-width UTC with microseconds, so lexical order equals time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
///
/// Accepts RFC 3339 and the legacy `YYYY-MM-DD HH:MM:SS` form.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if s.is_empty() {
        return Err(ChatvaultError::storage("parse timestamp", "empty timestamp"));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| ChatvaultError::storage(format!("parse timestamp {s:?}"), e))
}
