//! Session manager facade
//!
//! [`SessionManager`] is the single entry point outer layers use. It owns the
//! session store, the search index and the exporter, turns loosely-typed
//! requests (comma-separated tags, JSON strings, date strings) into validated
//! domain values, and applies the deletion confirmation policy.

use crate::config::Config;
use crate::context::OpContext;
use crate::error::{ChatvaultError, Result};
use crate::export::{ExportFormat, Exporter, ExporterOptions};
use crate::search::{parse_date_bound, DateBound, SearchIndex, SearchOptions, SearchResultSet};
use crate::session::{
    ListOptions, Message, Session, SessionExport, SessionStatus, SessionStore, SessionSummary,
    Settings,
};
use crate::storage::Database;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Providers accepted by [`SessionManager::create_session`]
pub const KNOWN_PROVIDERS: &[&str] = &[
    "anthropic",
    "openai",
    "azure",
    "bedrock",
    "gemini",
    "ollama",
    "meta",
];

/// Input for creating a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub title: String,
    /// Comma-separated tags
    pub tags: Option<String>,
    pub provider: Option<String>,
    /// Overrides the model implied by `provider`
    pub model: Option<String>,
    /// JSON object merged into the session settings
    pub metadata_json: Option<String>,
    pub no_activate: bool,
}

/// A freshly created session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedSession {
    pub session: Session,
    pub tags: Vec<String>,
    /// Whether the caller should treat this as the session to continue in
    pub activated: bool,
}

/// Input for listing sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Ignore `limit` and return everything
    pub all: bool,
    pub limit: i64,
    pub status: Option<SessionStatus>,
}

/// A session with its statistics and full transcript
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDetails {
    pub summary: SessionSummary,
    pub messages: Vec<Message>,
}

/// What a deletion would remove
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionPreview {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub message_count: i64,
}

/// Input for deleting a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRequest {
    pub session_id: String,
    /// The caller has obtained confirmation
    pub confirmed: bool,
}

/// Result of a delete request
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// The session and its messages were removed
    Deleted(DeletionPreview),
    /// Nothing was touched because the request was not confirmed
    NotConfirmed(DeletionPreview),
}

/// Input for exporting a session to a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub session_id: String,
    pub format: ExportFormat,
    /// Destination; defaults to `session-<id>.<ext>` in the working directory
    pub output: Option<PathBuf>,
    /// Custom tera template; takes precedence over `format`
    pub template: Option<PathBuf>,
}

/// Summary of a finished export
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportReport {
    pub session_id: String,
    pub session_name: String,
    pub format: ExportFormat,
    pub path: PathBuf,
    pub template: Option<PathBuf>,
    pub message_count: usize,
    pub total_tokens: i64,
    pub bytes_written: u64,
}

/// Input for a full-text search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub limit: i64,
    pub offset: i64,
    /// `YYYY-MM-DD` or RFC 3339
    pub date_from: Option<String>,
    /// `YYYY-MM-DD` (through end of day) or RFC 3339
    pub date_to: Option<String>,
    pub provider: Option<String>,
}

/// Entry point for session operations
#[derive(Debug, Clone)]
pub struct SessionManager {
    store: SessionStore,
    index: SearchIndex,
    exporter: Exporter,
}

impl SessionManager {
    /// Create a manager over an opened database
    pub fn new(db: Database, exporter_options: ExporterOptions) -> Self {
        Self {
            store: SessionStore::new(db.clone()),
            index: SearchIndex::new(db),
            exporter: Exporter::new(exporter_options),
        }
    }

    /// Open the database described by `config`
    ///
    /// Without a configured path the default location (or `CHATVAULT_DB`) is
    /// used.
    pub fn open(config: &Config) -> Result<Self> {
        let db = match config.database.path.as_deref() {
            Some(path) if !path.trim().is_empty() => Database::new_with_path(path)?,
            _ => Database::new()?,
        }
        .with_busy_timeout(Duration::from_millis(config.database.busy_timeout_ms));

        tracing::debug!(path = %db.path().display(), "Opened session database");
        Ok(Self::new(
            db,
            ExporterOptions {
                pretty_json: config.export.pretty_json,
            },
        ))
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    /// Validate a create request and persist the new session
    pub fn create_session(
        &self,
        ctx: &OpContext,
        req: &CreateSessionRequest,
    ) -> Result<CreatedSession> {
        let title = req.title.trim();
        if title.is_empty() {
            return Err(ChatvaultError::Validation(
                "session title cannot be empty".to_string(),
            ));
        }

        let tags = parse_tags(req.tags.as_deref());
        let mut settings = parse_metadata(req.metadata_json.as_deref())?;
        let provider = normalize_provider(req.provider.as_deref())?;

        if !tags.is_empty() {
            settings
                .get_or_insert_with(Settings::new)
                .insert("tags".to_string(), Value::from(tags.clone()));
        }

        let mut session = Session::new(title);
        if let Some(provider) = &provider {
            session.model = Some(provider.clone());
            settings
                .get_or_insert_with(Settings::new)
                .insert("provider".to_string(), Value::from(provider.as_str()));
        }
        if let Some(model) = req.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            session.model = Some(model.to_string());
        }
        session.settings = settings;

        self.store.create_session(ctx, &session)?;

        let activated = !req.no_activate;
        tracing::info!(
            session_id = %session.id,
            title = %session.name,
            provider = provider.as_deref().unwrap_or(""),
            activated,
            "Session created"
        );

        Ok(CreatedSession {
            session,
            tags,
            activated,
        })
    }

    /// Sessions, newest first
    pub fn list_sessions(&self, ctx: &OpContext, req: &ListRequest) -> Result<Vec<Session>> {
        let mut opts = ListOptions::default().with_limit(if req.all { 0 } else { req.limit });
        if let Some(status) = req.status {
            opts = opts.with_status(status);
        }
        self.store.list_sessions(ctx, &opts)
    }

    /// One session with its statistics and messages
    pub fn show_session(&self, ctx: &OpContext, session_id: &str) -> Result<SessionDetails> {
        let (summary, messages) = self.store.get_session_with_messages(ctx, session_id)?;
        Ok(SessionDetails { summary, messages })
    }

    /// Describe what deleting `session_id` would remove
    pub fn deletion_preview(&self, ctx: &OpContext, session_id: &str) -> Result<DeletionPreview> {
        let summary = self.store.get_session_summary(ctx, session_id)?;
        Ok(DeletionPreview {
            id: summary.session.id,
            name: summary.session.name,
            status: summary.session.status,
            created_at: summary.session.created_at,
            message_count: summary.message_count,
        })
    }

    /// Hard-delete a session once the caller has confirmed
    ///
    /// # Errors
    ///
    /// `Validation` for an empty id, `NotFound` if the session does not exist.
    pub fn delete_session(&self, ctx: &OpContext, req: &DeleteRequest) -> Result<DeleteOutcome> {
        let session_id = req.session_id.trim();
        if session_id.is_empty() {
            return Err(ChatvaultError::Validation(
                "session id cannot be empty".to_string(),
            ));
        }

        let preview = self.deletion_preview(ctx, session_id)?;
        if !req.confirmed {
            tracing::info!(session_id = %session_id, "Session deletion not confirmed");
            return Ok(DeleteOutcome::NotConfirmed(preview));
        }

        self.store.hard_delete_session(ctx, session_id)?;
        tracing::info!(
            session_id = %session_id,
            title = %preview.name,
            messages_deleted = preview.message_count,
            "Session deleted"
        );
        Ok(DeleteOutcome::Deleted(preview))
    }

    /// Export a session to a file
    pub fn export_session(&self, ctx: &OpContext, req: &ExportRequest) -> Result<ExportReport> {
        let (session, messages) = self.load_for_export(ctx, &req.session_id)?;

        let path = req.output.clone().unwrap_or_else(|| {
            PathBuf::from(format!(
                "session-{}.{}",
                session.id,
                req.format.extension()
            ))
        });
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| {
            ChatvaultError::export(
                format!("failed to create output directory {}", dir.display()),
                e,
            )
        })?;

        // Render next to the target and rename over it, so a failed render
        // leaves any existing file untouched.
        let mut staged = tempfile::NamedTempFile::new_in(&dir).map_err(|e| {
            ChatvaultError::export(
                format!("failed to create temporary file in {}", dir.display()),
                e,
            )
        })?;
        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            self.render(&mut writer, req.format, req.template.as_deref(), &session, &messages)?;
            writer
                .flush()
                .map_err(|e| ChatvaultError::export("failed to flush export file", e))?;
        }
        let file = staged.persist(&path).map_err(|e| {
            ChatvaultError::export(format!("failed to write {}", path.display()), e.error)
        })?;

        let bytes_written = file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| ChatvaultError::export(format!("failed to stat {}", path.display()), e))?;

        tracing::info!(
            session_id = %session.id,
            format = %req.format,
            output = %path.display(),
            messages = messages.len(),
            "Session exported"
        );

        Ok(ExportReport {
            session_id: session.id,
            session_name: session.name,
            format: req.format,
            path,
            template: req.template.clone(),
            message_count: messages.len(),
            total_tokens: messages.iter().filter_map(|m| m.tokens_used).sum(),
            bytes_written,
        })
    }

    /// Export a session into any writer
    pub fn export_session_to<W: Write>(
        &self,
        ctx: &OpContext,
        session_id: &str,
        format: ExportFormat,
        template: Option<&Path>,
        writer: W,
    ) -> Result<()> {
        let (session, messages) = self.load_for_export(ctx, session_id)?;
        self.render(writer, format, template, &session, &messages)
    }

    fn load_for_export(
        &self,
        ctx: &OpContext,
        session_id: &str,
    ) -> Result<(Session, Vec<Message>)> {
        let (summary, messages) = self.store.get_session_with_messages(ctx, session_id)?;
        ctx.check("export session")?;
        Ok((summary.session, messages))
    }

    fn render<W: Write>(
        &self,
        writer: W,
        format: ExportFormat,
        template: Option<&Path>,
        session: &Session,
        messages: &[Message],
    ) -> Result<()> {
        match template {
            Some(path) => self
                .exporter
                .export_with_template(writer, path, session, messages),
            None => self.exporter.export(writer, format, session, messages),
        }
    }

    /// Full-text search with string date filters
    pub fn search(&self, ctx: &OpContext, req: &SearchRequest) -> Result<SearchResultSet> {
        let date_from = non_empty(req.date_from.as_deref())
            .map(|d| parse_date_bound(d, DateBound::Start))
            .transpose()?;
        let date_to = non_empty(req.date_to.as_deref())
            .map(|d| parse_date_bound(d, DateBound::End))
            .transpose()?;

        let mut opts = SearchOptions::new(req.query.trim())
            .with_limit(req.limit)
            .with_offset(req.offset)
            .with_date_range(date_from, date_to);
        if let Some(provider) = non_empty(req.provider.as_deref()) {
            opts = opts.with_provider(provider);
        }

        self.index.search_all_messages(ctx, &opts)
    }

    /// Append a message to an active session
    pub fn add_message(&self, ctx: &OpContext, message: &Message) -> Result<()> {
        self.store.add_message(ctx, message)
    }

    /// Read a JSON export and insert it
    pub fn import_session<R: Read>(&self, ctx: &OpContext, reader: R) -> Result<Session> {
        let export: SessionExport = serde_json::from_reader(reader).map_err(|e| {
            ChatvaultError::Validation(format!("invalid session export document: {e}"))
        })?;
        self.store.import_session(ctx, &export)
    }

    pub fn archive_session(&self, ctx: &OpContext, session_id: &str) -> Result<()> {
        self.store.archive_session(ctx, session_id)?;
        tracing::info!(session_id = %session_id, "Session archived");
        Ok(())
    }

    /// Rebuild and compact the search index; returns the rows indexed
    pub fn rebuild_search_index(&self, ctx: &OpContext) -> Result<usize> {
        let indexed = self.index.rebuild(ctx)?;
        self.index.optimize(ctx)?;
        Ok(indexed)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Split comma-separated tags, dropping blanks
fn parse_tags(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_metadata(raw: Option<&str>) -> Result<Option<Settings>> {
    let Some(raw) = non_empty(raw) else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(ChatvaultError::Validation(
            "metadata must be a JSON object".to_string(),
        )),
        Err(e) => Err(ChatvaultError::Validation(format!(
            "invalid metadata JSON: {e}"
        ))),
    }
}

/// Lower-case and check a provider name
fn normalize_provider(raw: Option<&str>) -> Result<Option<String>> {
    let Some(raw) = non_empty(raw) else {
        return Ok(None);
    };
    let provider = raw.to_lowercase();
    if KNOWN_PROVIDERS.contains(&provider.as_str()) {
        Ok(Some(provider))
    } else {
        Err(ChatvaultError::Validation(format!(
            "invalid provider: {raw} (valid options: {})",
            KNOWN_PROVIDERS.join(", ")
        )))
    }
}
