//! Full-text search over message content
//!
//! The index is an FTS5 table kept row-for-row in step with `messages`. Writes
//! go through the free functions in this module, which take the caller's
//! transaction so the message row and its index row commit together. Queries
//! go through [`SearchIndex`].

pub mod query;

pub use query::{build_match_expression, parse_date_bound, DateBound};

use crate::context::OpContext;
use crate::error::{ChatvaultError, Result};
use crate::session::store::{MessageRow, MESSAGE_COLUMNS, MESSAGE_COLUMN_COUNT};
use crate::session::{Message, SessionStatus};
use crate::storage::{format_timestamp, like_pattern, Database, StorageResultExt};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;

/// Opening marker around a matched term in snippets
pub const HIGHLIGHT_OPEN: &str = "<mark>";
/// Closing marker around a matched term in snippets
pub const HIGHLIGHT_CLOSE: &str = "</mark>";

/// Page size used when a search asks for limit 0
pub const DEFAULT_SEARCH_LIMIT: i64 = 50;
/// Largest page a single search may request
pub const MAX_SEARCH_LIMIT: i64 = 1000;

/// Tokens of context on each side of a snippet match
const SNIPPET_TOKENS: i64 = 32;

/// Parameters of a full-text search
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    /// Free text; every word must match
    pub query: String,
    /// Page size; 0 means [`DEFAULT_SEARCH_LIMIT`]
    pub limit: i64,
    pub offset: i64,
    /// Inclusive lower bound on message timestamp
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on message timestamp
    pub date_to: Option<DateTime<Utc>>,
    /// Substring of the message model
    pub provider: Option<String>,
    /// Restrict matches to one session
    pub session_id: Option<String>,
}

impl SearchOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_date_range(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Check the options and resolve the effective page size
    pub fn validate(&self) -> Result<i64> {
        if self.query.trim().is_empty() {
            return Err(ChatvaultError::Validation(
                "search query cannot be empty".to_string(),
            ));
        }
        if self.limit < 0 || self.offset < 0 {
            return Err(ChatvaultError::Validation(
                "limit and offset cannot be negative".to_string(),
            ));
        }
        if self.limit > MAX_SEARCH_LIMIT {
            return Err(ChatvaultError::Validation(format!(
                "limit cannot exceed {MAX_SEARCH_LIMIT}"
            )));
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(ChatvaultError::Validation(
                    "date_from must not be after date_to".to_string(),
                ));
            }
        }
        Ok(if self.limit == 0 {
            DEFAULT_SEARCH_LIMIT
        } else {
            self.limit
        })
    }
}

/// One ranked hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub session_name: String,
    pub session_status: SessionStatus,
    pub message: Message,
    /// Negated BM25; higher is more relevant
    pub relevance_score: f64,
    /// Content excerpt with matches wrapped in `<mark>` markers
    pub snippet: String,
}

/// One page of ranked hits plus the unpaginated total
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResultSet {
    pub results: Vec<SearchResult>,
    pub total_count: i64,
    pub query: String,
    pub limit: i64,
    pub offset: i64,
}

impl SearchResultSet {
    fn empty(query: &str, limit: i64, offset: i64) -> Self {
        Self {
            results: Vec::new(),
            total_count: 0,
            query: query.to_string(),
            limit,
            offset,
        }
    }

    /// Whether matches exist beyond this page
    pub fn has_more(&self) -> bool {
        self.offset + (self.results.len() as i64) < self.total_count
    }
}

/// Query side of the message index
#[derive(Debug, Clone)]
pub struct SearchIndex {
    db: Database,
}

impl SearchIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Ranked search across every stored message
    pub fn search_all_messages(
        &self,
        ctx: &OpContext,
        opts: &SearchOptions,
    ) -> Result<SearchResultSet> {
        let limit = opts.validate()?;
        let Some(expression) = build_match_expression(&opts.query) else {
            tracing::debug!(query = %opts.query, "Search text has no indexable words");
            return Ok(SearchResultSet::empty(&opts.query, limit, opts.offset));
        };

        let (filters, mut values) = filter_clause(expression, opts);

        let count_sql = format!(
            "SELECT COUNT(*)
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.message_id
             WHERE messages_fts MATCH ?1{filters}"
        );
        let search_sql = format!(
            "SELECT {MESSAGE_COLUMNS}, s.name, s.status,
                    bm25(messages_fts) AS score,
                    snippet(messages_fts, 3, '{HIGHLIGHT_OPEN}', '{HIGHLIGHT_CLOSE}', '...', {SNIPPET_TOKENS})
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.message_id
             JOIN sessions s ON s.id = m.session_id
             WHERE messages_fts MATCH ?1{filters}
             ORDER BY score ASC, m.timestamp DESC, m.seq DESC
             LIMIT ?{} OFFSET ?{}",
            values.len() + 1,
            values.len() + 2
        );

        // One read transaction, so the total always describes this page's snapshot
        let (total_count, rows) = self.db.read(ctx, "search messages", |conn| {
            let total_count: i64 = conn
                .query_row(&count_sql, params_from_iter(values.iter()), |row| row.get(0))
                .storage_context("count search matches")?;

            ctx.check("search messages")?;

            values.push(Value::Integer(limit));
            values.push(Value::Integer(opts.offset));
            let mut stmt = conn
                .prepare(&search_sql)
                .storage_context("prepare search")?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    let base = MESSAGE_COLUMN_COUNT;
                    Ok((
                        MessageRow::read(row, 0)?,
                        row.get::<_, String>(base)?,
                        row.get::<_, String>(base + 1)?,
                        row.get::<_, f64>(base + 2)?,
                        row.get::<_, String>(base + 3)?,
                    ))
                })
                .storage_context("run search")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .storage_context("read search rows")?;
            Ok((total_count, rows))
        })?;

        let results = rows
            .into_iter()
            .map(|(message, session_name, status, rank, snippet)| {
                Ok(SearchResult {
                    session_name,
                    session_status: status
                        .parse()
                        .map_err(|e| ChatvaultError::storage("decode session status", e))?,
                    message: message.into_message()?,
                    relevance_score: -rank,
                    snippet,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            query = %opts.query,
            total = total_count,
            returned = results.len(),
            "Searched messages"
        );

        Ok(SearchResultSet {
            results,
            total_count,
            query: opts.query.clone(),
            limit,
            offset: opts.offset,
        })
    }

    /// Ranked search restricted to one session
    pub fn search_session_messages(
        &self,
        ctx: &OpContext,
        session_id: &str,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<SearchResultSet> {
        if session_id.trim().is_empty() {
            return Err(ChatvaultError::Validation(
                "session id cannot be empty".to_string(),
            ));
        }
        let opts = SearchOptions::new(query)
            .with_limit(limit)
            .with_offset(offset)
            .with_session(session_id);
        self.search_all_messages(ctx, &opts)
    }

    /// Re-derive every index row from the message table
    ///
    /// Returns the number of messages indexed.
    pub fn rebuild(&self, ctx: &OpContext) -> Result<usize> {
        let indexed = self.db.write(ctx, "rebuild search index", |tx| {
            tx.execute("DELETE FROM messages_fts", [])
                .storage_context("clear search index")?;
            ctx.check("rebuild search index")?;
            tx.execute(
                "INSERT INTO messages_fts (message_id, session_id, role, content)
                 SELECT id, session_id, role, content FROM messages",
                [],
            )
            .storage_context("repopulate search index")
        })?;
        tracing::info!(indexed, "Rebuilt search index");
        Ok(indexed)
    }

    /// Merge the index's internal b-trees
    pub fn optimize(&self, ctx: &OpContext) -> Result<()> {
        self.db.write(ctx, "optimize search index", |tx| {
            tx.execute(
                "INSERT INTO messages_fts (messages_fts) VALUES ('optimize')",
                [],
            )
            .storage_context("optimize search index")?;
            Ok(())
        })?;
        tracing::debug!("Optimized search index");
        Ok(())
    }
}

/// Extra WHERE conditions and their bound values; `?1` is the match expression
fn filter_clause(expression: String, opts: &SearchOptions) -> (String, Vec<Value>) {
    let mut clause = String::new();
    let mut values = vec![Value::Text(expression)];

    if let Some(from) = opts.date_from {
        values.push(Value::Text(format_timestamp(&from)));
        clause.push_str(&format!(" AND m.timestamp >= ?{}", values.len()));
    }
    if let Some(to) = opts.date_to {
        values.push(Value::Text(format_timestamp(&to)));
        clause.push_str(&format!(" AND m.timestamp <= ?{}", values.len()));
    }
    if let Some(provider) = opts.provider.as_deref().filter(|p| !p.trim().is_empty()) {
        values.push(Value::Text(like_pattern(provider.trim())));
        clause.push_str(&format!(" AND m.model LIKE ?{} ESCAPE '\\'", values.len()));
    }
    if let Some(session_id) = opts.session_id.as_deref() {
        values.push(Value::Text(session_id.to_string()));
        clause.push_str(&format!(" AND m.session_id = ?{}", values.len()));
    }

    (clause, values)
}

/// Add or replace the index row for a message
pub(crate) fn index_message(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "DELETE FROM messages_fts WHERE message_id = ?1",
        params![message.id],
    )
    .storage_context("clear message index row")?;
    conn.execute(
        "INSERT INTO messages_fts (message_id, session_id, role, content)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            message.id,
            message.session_id,
            message.role.as_str(),
            message.content
        ],
    )
    .storage_context("index message")?;
    Ok(())
}

/// Drop the index row for one message
pub(crate) fn remove_message(conn: &Connection, message_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM messages_fts WHERE message_id = ?1",
        params![message_id],
    )
    .storage_context("remove message from index")?;
    Ok(())
}

/// Drop every index row belonging to a session
pub(crate) fn remove_session(conn: &Connection, session_id: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM messages_fts WHERE session_id = ?1",
        params![session_id],
    )
    .storage_context("remove session from index")
}
