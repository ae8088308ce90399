use chatvault::export::ExporterOptions;
use chatvault::session::{Message, Session};
use chatvault::storage::Database;
use chatvault::{OpContext, SessionManager};
use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn create_temp_database() -> (Database, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let db_path = tmp.path().join("sessions.db");
    let db = Database::new_with_path(db_path).expect("failed to create database with path");
    (db, tmp)
}

#[allow(dead_code)]
pub fn create_temp_manager() -> (SessionManager, TempDir) {
    let (db, tmp) = create_temp_database();
    (SessionManager::new(db, ExporterOptions::default()), tmp)
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Fixed UTC timestamp for deterministic ordering
#[allow(dead_code)]
pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
        .single()
        .expect("valid timestamp")
}

/// Create a session and append alternating user/assistant messages one
/// minute apart; `model` is stamped on the session and every message
#[allow(dead_code)]
pub fn seed_session(
    manager: &SessionManager,
    name: &str,
    model: Option<&str>,
    start: DateTime<Utc>,
    contents: &[&str],
) -> (Session, Vec<Message>) {
    let ctx = OpContext::background();
    let mut session = Session::new(name);
    if let Some(model) = model {
        session = session.with_model(model);
    }
    manager
        .store()
        .create_session(&ctx, &session)
        .expect("create session");

    let mut messages = Vec::new();
    for (i, content) in contents.iter().enumerate() {
        let base = if i % 2 == 0 {
            Message::user(&session.id, *content)
        } else {
            Message::assistant(&session.id, *content).with_tokens(10)
        };
        let mut message = base.with_timestamp(start + chrono::Duration::minutes(i as i64));
        if let Some(model) = model {
            message = message.with_model(model);
        }
        manager.add_message(&ctx, &message).expect("add message");
        messages.push(message);
    }
    (session, messages)
}
