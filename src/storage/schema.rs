//! Versioned schema migrations
//!
//! Migrations are applied in order, each in its own transaction, and recorded
//! in `schema_migrations` so reopening a database only runs what is new.

use super::StorageResultExt;
use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, Connection};

/// One forward-only schema change
pub(crate) struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_sessions_and_messages",
        sql: "
            CREATE TABLE IF NOT EXISTS sessions (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'active'
                            CHECK (status IN ('active', 'archived', 'deleted_pending')),
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                model       TEXT,
                temperature REAL,
                max_tokens  INTEGER,
                settings    TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

            -- seq is the insertion sequence; AUTOINCREMENT never hands out a
            -- value twice, even after deletes.
            CREATE TABLE IF NOT EXISTS messages (
                seq           INTEGER PRIMARY KEY AUTOINCREMENT,
                id            TEXT NOT NULL UNIQUE,
                session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role          TEXT NOT NULL
                              CHECK (role IN ('user', 'assistant', 'system', 'tool')),
                content       TEXT NOT NULL,
                timestamp     TEXT NOT NULL,
                parent_id     TEXT,
                tokens_used   INTEGER,
                model         TEXT,
                finish_reason TEXT,
                metadata      TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_id, timestamp, seq);
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_model ON messages(model);
        ",
    },
    Migration {
        version: 2,
        name: "create_messages_fts",
        sql: "
            CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                message_id UNINDEXED,
                session_id UNINDEXED,
                role UNINDEXED,
                content,
                tokenize = 'porter unicode61'
            );

            INSERT INTO messages_fts (message_id, session_id, role, content)
                SELECT id, session_id, role, content FROM messages;
        ",
    },
];

/// Apply every migration newer than the database's current version
pub(crate) fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .storage_context("create migration table")?;

    let current = current_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn
            .transaction()
            .storage_context("begin migration transaction")?;

        tx.execute_batch(migration.sql)
            .storage_context(&format!("apply migration {}", migration.name))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.name,
                super::format_timestamp(&Utc::now())
            ],
        )
        .storage_context("record migration")?;

        tx.commit().storage_context("commit migration")?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied schema migration"
        );
    }

    Ok(())
}

/// Highest applied migration version, 0 for a fresh database
pub(crate) fn current_version(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .storage_context("read schema version")
}
