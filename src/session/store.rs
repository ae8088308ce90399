//! CRUD over sessions and messages
//!
//! Every write runs in one transaction that also carries the matching
//! search-index change, so the index never holds a row for a message that
//! does not exist and never misses one that does.

use super::types::{ListOptions, Message, Session, SessionExport, SessionStatus, SessionSummary};
use crate::context::OpContext;
use crate::error::{ChatvaultError, Result};
use crate::search;
use crate::storage::{
    format_timestamp, is_constraint_violation, like_pattern, parse_timestamp, Database,
    StorageResultExt,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;

pub(crate) const SESSION_COLUMNS: &str =
    "s.id, s.name, s.status, s.created_at, s.updated_at, s.model, s.temperature, s.max_tokens, s.settings";

pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.session_id, m.role, m.content, m.timestamp, \
     m.parent_id, m.tokens_used, m.model, m.finish_reason, m.metadata";

/// Number of columns in [`MESSAGE_COLUMNS`]
pub(crate) const MESSAGE_COLUMN_COUNT: usize = 10;

/// Raw session columns, decoded outside the rusqlite row callback
pub(crate) struct SessionRow {
    id: String,
    name: String,
    status: String,
    created_at: String,
    updated_at: String,
    model: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<i64>,
    settings: Option<String>,
}

impl SessionRow {
    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            model: row.get(5)?,
            temperature: row.get(6)?,
            max_tokens: row.get(7)?,
            settings: row.get(8)?,
        })
    }

    pub(crate) fn into_session(self) -> Result<Session> {
        let settings = match self.settings.as_deref() {
            Some(raw) if !raw.is_empty() => Some(
                serde_json::from_str(raw)
                    .map_err(|e| ChatvaultError::storage("decode session settings", e))?,
            ),
            _ => None,
        };

        Ok(Session {
            status: self
                .status
                .parse()
                .map_err(|e| ChatvaultError::storage("decode session status", e))?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            name: self.name,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            settings,
        })
    }
}

/// Raw message columns starting at `offset` in a result row
pub(crate) struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    timestamp: String,
    parent_id: Option<String>,
    tokens_used: Option<i64>,
    model: Option<String>,
    finish_reason: Option<String>,
    metadata: Option<String>,
}

impl MessageRow {
    pub(crate) fn read(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            session_id: row.get(offset + 1)?,
            role: row.get(offset + 2)?,
            content: row.get(offset + 3)?,
            timestamp: row.get(offset + 4)?,
            parent_id: row.get(offset + 5)?,
            tokens_used: row.get(offset + 6)?,
            model: row.get(offset + 7)?,
            finish_reason: row.get(offset + 8)?,
            metadata: row.get(offset + 9)?,
        })
    }

    pub(crate) fn into_message(self) -> Result<Message> {
        let metadata = match self.metadata.as_deref() {
            Some(raw) if !raw.is_empty() => Some(
                serde_json::from_str(raw)
                    .map_err(|e| ChatvaultError::storage("decode message metadata", e))?,
            ),
            _ => None,
        };

        Ok(Message {
            role: self
                .role
                .parse()
                .map_err(|e| ChatvaultError::storage("decode message role", e))?,
            timestamp: parse_timestamp(&self.timestamp)?,
            id: self.id,
            session_id: self.session_id,
            content: self.content,
            parent_id: self.parent_id,
            tokens_used: self.tokens_used,
            model: self.model,
            finish_reason: self.finish_reason,
            metadata,
        })
    }
}

/// Session and message persistence
#[derive(Debug, Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The database this store writes to
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Insert a new session
    ///
    /// # Errors
    ///
    /// `Validation` for an empty name or out-of-range settings, `Conflict` if
    /// the id already exists.
    pub fn create_session(&self, ctx: &OpContext, session: &Session) -> Result<()> {
        validate_session(session)?;
        let settings = encode_json(session.settings.as_ref(), "encode session settings")?;

        self.db.write(ctx, "create session", |tx| {
            if session_status(tx, &session.id)?.is_some() {
                return Err(conflict("session", &session.id));
            }
            insert_session(tx, session, settings.as_deref())
        })?;

        tracing::debug!(session_id = %session.id, name = %session.name, "Created session");
        Ok(())
    }

    /// Fetch one session
    pub fn get_session(&self, ctx: &OpContext, id: &str) -> Result<Session> {
        require_id(id, "session id")?;
        self.db
            .read(ctx, "get session", |conn| fetch_session(conn, id))?
            .ok_or_else(|| ChatvaultError::session_not_found(id))
    }

    /// Fetch one session with its message count and token total
    pub fn get_session_summary(&self, ctx: &OpContext, id: &str) -> Result<SessionSummary> {
        require_id(id, "session id")?;
        self.db
            .read(ctx, "get session summary", |conn| fetch_summary(conn, id))?
            .ok_or_else(|| ChatvaultError::session_not_found(id))
    }

    /// A session summary and all of its messages, read from one snapshot
    ///
    /// The counts in the summary always agree with the returned messages.
    pub fn get_session_with_messages(
        &self,
        ctx: &OpContext,
        id: &str,
    ) -> Result<(SessionSummary, Vec<Message>)> {
        require_id(id, "session id")?;
        self.db
            .read(ctx, "get session with messages", |conn| {
                let Some(summary) = fetch_summary(conn, id)? else {
                    return Ok(None);
                };
                let messages = fetch_messages(conn, id, 0, 0)?;
                Ok(Some((summary, messages)))
            })?
            .ok_or_else(|| ChatvaultError::session_not_found(id))
    }

    /// List sessions, most recently created first
    pub fn list_sessions(&self, ctx: &OpContext, opts: &ListOptions) -> Result<Vec<Session>> {
        let status_clause = if opts.status.is_some() {
            "WHERE s.status = ?3"
        } else {
            "WHERE s.status != 'deleted_pending'"
        };
        let sql = format!(
            "SELECT {SESSION_COLUMNS}
             FROM sessions s
             {status_clause}
             ORDER BY s.created_at DESC, s.id DESC
             LIMIT ?1 OFFSET ?2"
        );
        let limit = if opts.limit > 0 { opts.limit } else { -1 };
        let offset = opts.offset.max(0);

        let rows = self.db.read(ctx, "list sessions", |conn| {
            let mut stmt = conn.prepare(&sql).storage_context("prepare list sessions")?;
            let rows = match opts.status {
                Some(status) => {
                    stmt.query_map(params![limit, offset, status.as_str()], SessionRow::read)
                }
                None => stmt.query_map(params![limit, offset], SessionRow::read),
            }
            .storage_context("query sessions")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .storage_context("read session rows")
        })?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Substring search over session names and ids
    pub fn search_sessions(
        &self,
        ctx: &OpContext,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ChatvaultError::Validation(
                "search query cannot be empty".to_string(),
            ));
        }

        let pattern = like_pattern(query);
        let limit = if limit > 0 { limit } else { -1 };
        let sql = format!(
            "SELECT {SESSION_COLUMNS}
             FROM sessions s
             WHERE (s.name LIKE ?1 ESCAPE '\\' OR s.id LIKE ?1 ESCAPE '\\')
               AND s.status != 'deleted_pending'
             ORDER BY s.created_at DESC, s.id DESC
             LIMIT ?2 OFFSET ?3"
        );

        let rows = self.db.read(ctx, "search sessions", |conn| {
            let mut stmt = conn.prepare(&sql).storage_context("prepare search sessions")?;
            let rows = stmt
                .query_map(params![pattern, limit, offset.max(0)], SessionRow::read)
                .storage_context("query sessions")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .storage_context("read session rows")
        })?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Update a session's mutable fields and refresh `updated_at`
    ///
    /// Returns the session as stored.
    pub fn update_session(&self, ctx: &OpContext, session: &Session) -> Result<Session> {
        validate_session(session)?;
        let settings = encode_json(session.settings.as_ref(), "encode session settings")?;
        let now = format_timestamp(&super::types::now());

        let updated = self.db.write(ctx, "update session", |tx| {
            let changed = tx
                .execute(
                    "UPDATE sessions
                     SET name = ?1, status = ?2, model = ?3, temperature = ?4,
                         max_tokens = ?5, settings = ?6, updated_at = ?7
                     WHERE id = ?8",
                    params![
                        session.name.trim(),
                        session.status.as_str(),
                        session.model,
                        session.temperature,
                        session.max_tokens,
                        settings,
                        now,
                        session.id
                    ],
                )
                .storage_context("update session")?;
            if changed == 0 {
                return Err(ChatvaultError::session_not_found(&session.id));
            }
            fetch_session(tx, &session.id)?
                .ok_or_else(|| ChatvaultError::session_not_found(&session.id))
        })?;

        tracing::debug!(session_id = %session.id, "Updated session");
        Ok(updated)
    }

    /// Mark a session archived; archived sessions refuse new messages
    pub fn archive_session(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.set_status(ctx, id, SessionStatus::Archived, "archive session")
    }

    /// Refresh a session's `updated_at` without changing anything else
    pub fn touch_session(&self, ctx: &OpContext, id: &str) -> Result<()> {
        require_id(id, "session id")?;
        let now = format_timestamp(&super::types::now());
        self.db.write(ctx, "touch session", |tx| {
            let changed = tx
                .execute(
                    "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )
                .storage_context("touch session")?;
            if changed == 0 {
                return Err(ChatvaultError::session_not_found(id));
            }
            Ok(())
        })
    }

    fn set_status(
        &self,
        ctx: &OpContext,
        id: &str,
        status: SessionStatus,
        operation: &str,
    ) -> Result<()> {
        require_id(id, "session id")?;
        let now = format_timestamp(&super::types::now());
        self.db.write(ctx, operation, |tx| {
            let changed = tx
                .execute(
                    "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), now, id],
                )
                .storage_context(operation)?;
            if changed == 0 {
                return Err(ChatvaultError::session_not_found(id));
            }
            Ok(())
        })?;
        tracing::debug!(session_id = %id, status = %status, "Changed session status");
        Ok(())
    }

    /// Permanently remove a session, its messages and their index entries
    ///
    /// Deleting a session that does not exist succeeds without doing anything.
    pub fn hard_delete_session(&self, ctx: &OpContext, id: &str) -> Result<()> {
        require_id(id, "session id")?;

        let removed = self.db.write(ctx, "hard delete session", |tx| {
            let marked = tx
                .execute(
                    "UPDATE sessions SET status = 'deleted_pending' WHERE id = ?1",
                    params![id],
                )
                .storage_context("mark session for deletion")?;
            if marked == 0 {
                return Ok(None);
            }

            ctx.check("hard delete session")?;
            search::remove_session(tx, id)?;
            let messages = tx
                .execute("DELETE FROM messages WHERE session_id = ?1", params![id])
                .storage_context("delete session messages")?;

            ctx.check("hard delete session")?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])
                .storage_context("delete session")?;
            Ok(Some(messages))
        })?;

        match removed {
            Some(messages_deleted) => tracing::info!(
                session_id = %id,
                messages_deleted,
                "Hard-deleted session"
            ),
            None => tracing::debug!(session_id = %id, "Hard delete of absent session is a no-op"),
        }
        Ok(())
    }

    /// Append a message and index its content in the same transaction
    ///
    /// # Errors
    ///
    /// `NotFound` if the session does not exist, `Validation` for empty
    /// content or an archived session, `Conflict` for a reused message id.
    pub fn add_message(&self, ctx: &OpContext, message: &Message) -> Result<()> {
        validate_message(message)?;
        let metadata = encode_json(message.metadata.as_ref(), "encode message metadata")?;

        self.db.write(ctx, "add message", |tx| {
            match session_status(tx, &message.session_id)? {
                None => return Err(ChatvaultError::session_not_found(&message.session_id)),
                Some(SessionStatus::Active) => {}
                Some(status) => {
                    return Err(ChatvaultError::Validation(format!(
                        "session {} is {status} and does not accept new messages",
                        message.session_id
                    )))
                }
            }
            if message_exists(tx, &message.id)? {
                return Err(conflict("message", &message.id));
            }

            insert_message(tx, message, metadata.as_deref())?;
            ctx.check("add message")?;
            search::index_message(tx, message)
        })?;

        tracing::debug!(
            session_id = %message.session_id,
            message_id = %message.id,
            role = %message.role,
            "Added message"
        );
        Ok(())
    }

    /// Fetch one message
    pub fn get_message(&self, ctx: &OpContext, id: &str) -> Result<Message> {
        require_id(id, "message id")?;
        self.db
            .read(ctx, "get message", |conn| fetch_message(conn, id))?
            .ok_or_else(|| ChatvaultError::message_not_found(id))
    }

    /// All messages of a session in insertion order
    ///
    /// A session without messages (or one that no longer exists) yields an
    /// empty list.
    pub fn get_messages(&self, ctx: &OpContext, session_id: &str) -> Result<Vec<Message>> {
        self.get_messages_paginated(ctx, session_id, 0, 0)
    }

    /// A page of a session's messages in insertion order; limit 0 means all
    pub fn get_messages_paginated(
        &self,
        ctx: &OpContext,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        require_id(session_id, "session id")?;
        self.db.read(ctx, "get messages", |conn| {
            fetch_messages(conn, session_id, limit, offset)
        })
    }

    /// The reply chain ending at `message_id`, root first
    ///
    /// Follows `parent_id` links upward until a message has no parent or the
    /// parent is not stored. A message without a parent is a thread of one.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty id, `NotFound` if the message does not exist.
    pub fn get_conversation_thread(
        &self,
        ctx: &OpContext,
        message_id: &str,
    ) -> Result<Vec<Message>> {
        require_id(message_id, "message id")?;
        // A parent loop would recurse forever; no acyclic chain is longer
        // than the table.
        let sql = format!(
            "WITH RECURSIVE thread(id, depth) AS (
                 SELECT id, 0 FROM messages WHERE id = ?1
                 UNION ALL
                 SELECT m.parent_id, thread.depth + 1
                 FROM messages m
                 JOIN thread ON m.id = thread.id
                 WHERE m.parent_id IS NOT NULL
                   AND thread.depth < (SELECT COUNT(*) FROM messages)
             )
             SELECT {MESSAGE_COLUMNS}
             FROM thread
             JOIN messages m ON m.id = thread.id
             ORDER BY thread.depth DESC"
        );

        let rows = self.db.read(ctx, "get conversation thread", |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .storage_context("prepare conversation thread")?;
            let rows = stmt
                .query_map(params![message_id], |row| MessageRow::read(row, 0))
                .storage_context("query conversation thread")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .storage_context("read thread rows")
        })?;
        if rows.is_empty() {
            return Err(ChatvaultError::message_not_found(message_id));
        }

        // Walk from the leaf so a loop is cut where it first repeats.
        let mut seen = HashSet::new();
        let mut thread = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            let message = row.into_message()?;
            if seen.insert(message.id.clone()) {
                thread.push(message);
            }
        }
        thread.reverse();
        Ok(thread)
    }

    /// Replace a message's content and completion metadata, re-indexing it
    pub fn update_message(&self, ctx: &OpContext, message: &Message) -> Result<Message> {
        require_id(&message.id, "message id")?;
        if message.content.is_empty() {
            return Err(ChatvaultError::Validation(
                "message content cannot be empty".to_string(),
            ));
        }
        let metadata = encode_json(message.metadata.as_ref(), "encode message metadata")?;

        let stored = self.db.write(ctx, "update message", |tx| {
            let changed = tx
                .execute(
                    "UPDATE messages
                     SET content = ?1, tokens_used = ?2, finish_reason = ?3, metadata = ?4
                     WHERE id = ?5",
                    params![
                        message.content,
                        message.tokens_used,
                        message.finish_reason,
                        metadata,
                        message.id
                    ],
                )
                .storage_context("update message")?;
            if changed == 0 {
                return Err(ChatvaultError::message_not_found(&message.id));
            }

            let stored = fetch_message(tx, &message.id)?
                .ok_or_else(|| ChatvaultError::message_not_found(&message.id))?;
            search::index_message(tx, &stored)?;
            Ok(stored)
        })?;

        tracing::debug!(message_id = %message.id, "Updated message");
        Ok(stored)
    }

    /// Remove one message and its index entry
    pub fn delete_message(&self, ctx: &OpContext, id: &str) -> Result<()> {
        require_id(id, "message id")?;
        self.db.write(ctx, "delete message", |tx| {
            search::remove_message(tx, id)?;
            let changed = tx
                .execute("DELETE FROM messages WHERE id = ?1", params![id])
                .storage_context("delete message")?;
            if changed == 0 {
                return Err(ChatvaultError::message_not_found(id));
            }
            Ok(())
        })?;
        tracing::debug!(message_id = %id, "Deleted message");
        Ok(())
    }

    /// Number of messages stored for a session
    pub fn get_session_message_count(&self, ctx: &OpContext, session_id: &str) -> Result<i64> {
        require_id(session_id, "session id")?;
        self.db.read(ctx, "count messages", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .storage_context("count messages")
        })
    }

    /// Sum of `tokens_used` across a session's messages
    pub fn get_total_tokens_used(&self, ctx: &OpContext, session_id: &str) -> Result<i64> {
        require_id(session_id, "session id")?;
        self.db.read(ctx, "sum tokens", |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(tokens_used), 0) FROM messages WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .storage_context("sum tokens")
        })
    }

    /// Insert a previously exported session and all its messages atomically
    pub fn import_session(&self, ctx: &OpContext, export: &SessionExport) -> Result<Session> {
        let session = &export.session;
        validate_session(session)?;
        for message in &export.messages {
            validate_message(message)?;
            if message.session_id != session.id {
                return Err(ChatvaultError::Validation(format!(
                    "message {} belongs to session {}, not {}",
                    message.id, message.session_id, session.id
                )));
            }
        }
        let settings = encode_json(session.settings.as_ref(), "encode session settings")?;

        self.db.write(ctx, "import session", |tx| {
            if session_status(tx, &session.id)?.is_some() {
                return Err(conflict("session", &session.id));
            }
            insert_session(tx, session, settings.as_deref())?;

            for message in &export.messages {
                ctx.check("import session")?;
                if message_exists(tx, &message.id)? {
                    return Err(conflict("message", &message.id));
                }
                let metadata = encode_json(message.metadata.as_ref(), "encode message metadata")?;
                insert_message(tx, message, metadata.as_deref())?;
                search::index_message(tx, message)?;
            }
            Ok(())
        })?;

        tracing::info!(
            session_id = %session.id,
            messages = export.messages.len(),
            "Imported session"
        );
        Ok(session.clone())
    }
}

fn require_id(id: &str, what: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(ChatvaultError::Validation(format!("{what} cannot be empty")));
    }
    Ok(())
}

fn conflict(entity: &'static str, id: &str) -> ChatvaultError {
    ChatvaultError::Conflict {
        entity,
        id: id.to_string(),
    }
}

fn validate_session(session: &Session) -> Result<()> {
    require_id(&session.id, "session id")?;
    if session.name.trim().is_empty() {
        return Err(ChatvaultError::Validation(
            "session name cannot be empty".to_string(),
        ));
    }
    if !session.status.is_assignable() {
        return Err(ChatvaultError::Validation(format!(
            "session status cannot be set to {}",
            session.status
        )));
    }
    if let Some(t) = session.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(ChatvaultError::Validation(format!(
                "temperature must be between 0 and 2, got {t}"
            )));
        }
    }
    if let Some(max) = session.max_tokens {
        if max <= 0 {
            return Err(ChatvaultError::Validation(format!(
                "max_tokens must be positive, got {max}"
            )));
        }
    }
    require_micros(&session.created_at, "session created_at")?;
    require_micros(&session.updated_at, "session updated_at")?;
    Ok(())
}

fn validate_message(message: &Message) -> Result<()> {
    require_id(&message.id, "message id")?;
    require_id(&message.session_id, "session id")?;
    if message.content.is_empty() {
        return Err(ChatvaultError::Validation(
            "message content cannot be empty".to_string(),
        ));
    }
    if message.parent_id.as_deref() == Some(message.id.as_str()) {
        return Err(ChatvaultError::Validation(format!(
            "message {} cannot be its own parent",
            message.id
        )));
    }
    if let Some(tokens) = message.tokens_used {
        if tokens < 0 {
            return Err(ChatvaultError::Validation(format!(
                "tokens_used cannot be negative, got {tokens}"
            )));
        }
    }
    require_micros(&message.timestamp, "message timestamp")?;
    Ok(())
}

/// Timestamps are persisted with microsecond precision; anything finer
/// would not read back unchanged
fn require_micros(ts: &DateTime<Utc>, what: &str) -> Result<()> {
    if ts.timestamp_subsec_nanos() % 1_000 != 0 {
        return Err(ChatvaultError::Validation(format!(
            "{what} {} is finer than microsecond precision",
            ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )));
    }
    Ok(())
}

fn encode_json(value: Option<&super::types::Settings>, context: &str) -> Result<Option<String>> {
    value
        .map(|v| {
            serde_json::to_string(v).map_err(|e| ChatvaultError::storage(context.to_string(), e))
        })
        .transpose()
}

fn session_status(conn: &Connection, id: &str) -> Result<Option<SessionStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM sessions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .storage_context("look up session")?;
    raw.map(|s| {
        s.parse()
            .map_err(|e| ChatvaultError::storage("decode session status", e))
    })
    .transpose()
}

fn message_exists(conn: &Connection, id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM messages WHERE id = ?1",
        params![id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .storage_context("look up message")
}

fn fetch_session(conn: &Connection, id: &str) -> Result<Option<Session>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions s
         WHERE s.id = ?1 AND s.status != 'deleted_pending'"
    );
    conn.query_row(&sql, params![id], SessionRow::read)
        .optional()
        .storage_context("query session")?
        .map(SessionRow::into_session)
        .transpose()
}

fn fetch_message(conn: &Connection, id: &str) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1");
    conn.query_row(&sql, params![id], |row| MessageRow::read(row, 0))
        .optional()
        .storage_context("query message")?
        .map(MessageRow::into_message)
        .transpose()
}

fn fetch_summary(conn: &Connection, id: &str) -> Result<Option<SessionSummary>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS},
                (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id),
                (SELECT COALESCE(SUM(m.tokens_used), 0) FROM messages m WHERE m.session_id = s.id)
         FROM sessions s
         WHERE s.id = ?1"
    );
    let row = conn
        .query_row(&sql, params![id], |row| {
            Ok((SessionRow::read(row)?, row.get::<_, i64>(9)?, row.get::<_, i64>(10)?))
        })
        .optional()
        .storage_context("query session summary")?;

    row.map(|(session_row, message_count, total_tokens)| {
        Ok(SessionSummary {
            session: session_row.into_session()?,
            message_count,
            total_tokens,
        })
    })
    .transpose()
}

/// A page of a session's messages in insertion order; limit 0 means all
fn fetch_messages(
    conn: &Connection,
    session_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages m
         WHERE m.session_id = ?1
         ORDER BY m.timestamp ASC, m.seq ASC
         LIMIT ?2 OFFSET ?3"
    );
    let limit = if limit > 0 { limit } else { -1 };

    let mut stmt = conn.prepare(&sql).storage_context("prepare get messages")?;
    let rows = stmt
        .query_map(params![session_id, limit, offset.max(0)], |row| {
            MessageRow::read(row, 0)
        })
        .storage_context("query messages")?;
    let rows = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .storage_context("read message rows")?;

    rows.into_iter().map(MessageRow::into_message).collect()
}

fn insert_session(conn: &Connection, session: &Session, settings: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions
            (id, name, status, created_at, updated_at, model, temperature, max_tokens, settings)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            session.id,
            session.name,
            session.status.as_str(),
            format_timestamp(&session.created_at),
            format_timestamp(&session.updated_at),
            session.model,
            session.temperature,
            session.max_tokens,
            settings
        ],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            conflict("session", &session.id)
        } else {
            ChatvaultError::storage("insert session", e)
        }
    })?;
    Ok(())
}

fn insert_message(conn: &Connection, message: &Message, metadata: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO messages
            (id, session_id, role, content, timestamp, parent_id, tokens_used, model,
             finish_reason, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            message.id,
            message.session_id,
            message.role.as_str(),
            message.content,
            format_timestamp(&message.timestamp),
            message.parent_id,
            message.tokens_used,
            message.model,
            message.finish_reason,
            metadata
        ],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            conflict("message", &message.id)
        } else {
            ChatvaultError::storage("insert message", e)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::MessageRole;
    use serde_json::json;
    use tempfile::tempdir;

    fn create_test_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempdir().expect("failed to create tempdir");
        let db = Database::new_with_path(dir.path().join("sessions.db"))
            .expect("failed to create database");
        (SessionStore::new(db), dir)
    }

    #[test]
    fn test_create_and_get_session_roundtrip() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let settings = json!({"tags": ["go"], "priority": "high"})
            .as_object()
            .cloned()
            .unwrap();
        let session = Session::new("Bug Investigation")
            .with_model("claude-3-5-sonnet")
            .with_temperature(0.7)
            .with_max_tokens(4096)
            .with_settings(settings);

        store.create_session(&ctx, &session).expect("create");
        let loaded = store.get_session(&ctx, &session.id).expect("get");
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_create_session_rejects_empty_name() {
        let (store, _dir) = create_test_store();
        let err = store
            .create_session(&OpContext::background(), &Session::new("   "))
            .unwrap_err();
        assert!(matches!(err, ChatvaultError::Validation(_)));
    }

    #[test]
    fn test_create_session_rejects_out_of_range_settings() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        assert!(matches!(
            store.create_session(&ctx, &Session::new("t").with_temperature(2.5)),
            Err(ChatvaultError::Validation(_))
        ));
        assert!(matches!(
            store.create_session(&ctx, &Session::new("t").with_max_tokens(0)),
            Err(ChatvaultError::Validation(_))
        ));
    }

    #[test]
    fn test_sub_microsecond_timestamps_rejected() {
        use chrono::{Duration, SubsecRound, TimeZone};

        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let precise = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap()
            + Duration::nanoseconds(123_456_789);

        let mut session = Session::new("nanos");
        session.created_at = precise;
        assert!(matches!(
            store.create_session(&ctx, &session),
            Err(ChatvaultError::Validation(_))
        ));

        session.created_at = precise.trunc_subsecs(6);
        session.updated_at = precise.trunc_subsecs(6);
        store.create_session(&ctx, &session).expect("create");
        let loaded = store.get_session(&ctx, &session.id).expect("get");
        assert_eq!(loaded.created_at, session.created_at);

        let message = Message::user(&session.id, "hello").with_timestamp(precise);
        assert!(matches!(
            store.add_message(&ctx, &message),
            Err(ChatvaultError::Validation(_))
        ));

        let message = Message::user(&session.id, "hello").with_timestamp(precise.trunc_subsecs(6));
        store.add_message(&ctx, &message).expect("add");
        let loaded = store.get_message(&ctx, &message.id).expect("get message");
        assert_eq!(loaded.timestamp, message.timestamp);
    }

    #[test]
    fn test_create_session_duplicate_id_conflicts() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("one");
        store.create_session(&ctx, &session).expect("create");

        let dup = Session::new("two").with_id(session.id.clone());
        assert!(matches!(
            store.create_session(&ctx, &dup),
            Err(ChatvaultError::Conflict { entity: "session", .. })
        ));
    }

    #[test]
    fn test_get_session_missing_is_not_found() {
        let (store, _dir) = create_test_store();
        assert!(matches!(
            store.get_session(&OpContext::background(), "missing"),
            Err(ChatvaultError::NotFound { entity: "session", .. })
        ));
    }

    #[test]
    fn test_add_message_requires_existing_session() {
        let (store, _dir) = create_test_store();
        let err = store
            .add_message(&OpContext::background(), &Message::user("nope", "hello"))
            .unwrap_err();
        assert!(matches!(err, ChatvaultError::NotFound { entity: "session", .. }));
    }

    #[test]
    fn test_add_message_rejects_empty_content_and_self_parent() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("s");
        store.create_session(&ctx, &session).unwrap();

        assert!(matches!(
            store.add_message(&ctx, &Message::user(&session.id, "")),
            Err(ChatvaultError::Validation(_))
        ));

        let msg = Message::user(&session.id, "hi");
        let looped = msg.clone().with_parent(msg.id.clone());
        assert!(matches!(
            store.add_message(&ctx, &looped),
            Err(ChatvaultError::Validation(_))
        ));
    }

    #[test]
    fn test_add_message_duplicate_id_conflicts() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("s");
        store.create_session(&ctx, &session).unwrap();
        let msg = Message::user(&session.id, "hello");
        store.add_message(&ctx, &msg).unwrap();
        assert!(matches!(
            store.add_message(&ctx, &msg),
            Err(ChatvaultError::Conflict { entity: "message", .. })
        ));
    }

    #[test]
    fn test_archived_session_refuses_messages() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("s");
        store.create_session(&ctx, &session).unwrap();
        store.archive_session(&ctx, &session.id).unwrap();

        let err = store
            .add_message(&ctx, &Message::user(&session.id, "late"))
            .unwrap_err();
        assert!(matches!(err, ChatvaultError::Validation(msg) if msg.contains("archived")));
    }

    #[test]
    fn test_messages_with_equal_timestamps_keep_insertion_order() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("s");
        store.create_session(&ctx, &session).unwrap();

        let ts = crate::session::types::now();
        for i in 0..5 {
            let msg =
                Message::new(&session.id, MessageRole::User, format!("m{i}")).with_timestamp(ts);
            store.add_message(&ctx, &msg).unwrap();
        }

        let contents: Vec<String> = store
            .get_messages(&ctx, &session.id)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_get_messages_paginated() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("s");
        store.create_session(&ctx, &session).unwrap();
        for i in 0..5 {
            store
                .add_message(&ctx, &Message::user(&session.id, format!("m{i}")))
                .unwrap();
        }

        let page = store
            .get_messages_paginated(&ctx, &session.id, 2, 2)
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m2");
        assert_eq!(page[1].content, "m3");
    }

    #[test]
    fn test_summary_counts_messages_and_tokens() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("s");
        store.create_session(&ctx, &session).unwrap();
        store
            .add_message(&ctx, &Message::user(&session.id, "q").with_tokens(10))
            .unwrap();
        store
            .add_message(&ctx, &Message::assistant(&session.id, "a").with_tokens(32))
            .unwrap();
        store
            .add_message(&ctx, &Message::system(&session.id, "s"))
            .unwrap();

        let summary = store.get_session_summary(&ctx, &session.id).unwrap();
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.total_tokens, 42);
        assert_eq!(store.get_total_tokens_used(&ctx, &session.id).unwrap(), 42);
    }

    #[test]
    fn test_update_session_refreshes_updated_at() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("Original");
        store.create_session(&ctx, &session).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut changed = session.clone();
        changed.name = "Renamed".to_string();
        let stored = store.update_session(&ctx, &changed).unwrap();

        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.created_at, session.created_at);
        assert!(stored.updated_at > session.updated_at);
    }

    #[test]
    fn test_update_missing_session_is_not_found() {
        let (store, _dir) = create_test_store();
        assert!(matches!(
            store.update_session(&OpContext::background(), &Session::new("ghost")),
            Err(ChatvaultError::NotFound { .. })
        ));
    }

    #[test]
    fn test_hard_delete_validation_and_idempotence() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        assert!(matches!(
            store.hard_delete_session(&ctx, ""),
            Err(ChatvaultError::Validation(_))
        ));
        store
            .hard_delete_session(&ctx, "nonexistent-id")
            .expect("absent session delete is a no-op");
    }

    #[test]
    fn test_hard_delete_cancelled_keeps_everything() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("keep me");
        store.create_session(&ctx, &session).unwrap();
        store
            .add_message(&ctx, &Message::user(&session.id, "still here"))
            .unwrap();

        let cancelled = OpContext::background();
        cancelled.cancel();
        assert!(matches!(
            store.hard_delete_session(&cancelled, &session.id),
            Err(ChatvaultError::Cancelled(_))
        ));

        assert!(store.get_session(&ctx, &session.id).is_ok());
        assert_eq!(store.get_session_message_count(&ctx, &session.id).unwrap(), 1);
    }

    #[test]
    fn test_update_and_delete_message() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("s");
        store.create_session(&ctx, &session).unwrap();
        let msg = Message::assistant(&session.id, "draft");
        store.add_message(&ctx, &msg).unwrap();

        let mut edited = msg.clone();
        edited.content = "final answer".to_string();
        edited.finish_reason = Some("stop".to_string());
        let stored = store.update_message(&ctx, &edited).unwrap();
        assert_eq!(stored.content, "final answer");
        assert_eq!(stored.timestamp, msg.timestamp);

        store.delete_message(&ctx, &msg.id).unwrap();
        assert!(matches!(
            store.get_message(&ctx, &msg.id),
            Err(ChatvaultError::NotFound { entity: "message", .. })
        ));
        assert!(matches!(
            store.delete_message(&ctx, &msg.id),
            Err(ChatvaultError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_sessions_filters_by_status() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let active = Session::new("active");
        let archived = Session::new("archived");
        store.create_session(&ctx, &active).unwrap();
        store.create_session(&ctx, &archived).unwrap();
        store.archive_session(&ctx, &archived.id).unwrap();

        let only_archived = store
            .list_sessions(&ctx, &ListOptions::default().with_status(SessionStatus::Archived))
            .unwrap();
        assert_eq!(only_archived.len(), 1);
        assert_eq!(only_archived[0].id, archived.id);
    }

    #[test]
    fn test_search_sessions_matches_name_and_id_prefix() {
        let (store, _dir) = create_test_store();
        let ctx = OpContext::background();
        let session = Session::new("API Development");
        store.create_session(&ctx, &session).unwrap();
        store.create_session(&ctx, &Session::new("Other")).unwrap();

        let by_name = store.search_sessions(&ctx, "develop", 10, 0).unwrap();
        assert_eq!(by_name.len(), 1);
        let by_id = store.search_sessions(&ctx, &session.id[..8], 10, 0).unwrap();
        assert_eq!(by_id[0].id, session.id);
        assert!(store.search_sessions(&ctx, "100%", 10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_import_rejects_foreign_messages() {
        let (store, _dir) = create_test_store();
        let session = Session::new("s");
        let export = SessionExport {
            messages: vec![Message::user("someone-else", "hi")],
            session,
        };
        assert!(matches!(
            store.import_session(&OpContext::background(), &export),
            Err(ChatvaultError::Validation(_))
        ));
    }
}
