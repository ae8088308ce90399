//! Chatvault - embedded store for AI conversation sessions
//!
//! This library persists multi-turn conversations with AI assistants in a
//! local SQLite database, indexes every message for BM25-ranked full-text
//! search and renders sessions to JSON, Markdown, HTML or a custom template.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `storage`: Database location, connections, schema and transactions
//! - `session`: Session and message types and the transactional store
//! - `search`: FTS5 index maintenance and ranked, filtered search
//! - `export`: JSON, Markdown, HTML and template rendering
//! - `manager`: The `SessionManager` facade used by the CLI
//! - `context`: Cancellation and deadlines for every operation
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use chatvault::manager::CreateSessionRequest;
//! use chatvault::{Config, OpContext, SessionManager};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let manager = SessionManager::open(&config)?;
//!     let created = manager.create_session(
//!         &OpContext::background(),
//!         &CreateSessionRequest {
//!             title: "Bug Investigation".to_string(),
//!             ..Default::default()
//!         },
//!     )?;
//!     println!("created {}", created.session.id);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod manager;
pub mod search;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use context::OpContext;
pub use error::{ChatvaultError, Result};
pub use export::{ExportFormat, Exporter, ExporterOptions};
pub use manager::SessionManager;
pub use search::{SearchIndex, SearchOptions, SearchResult, SearchResultSet};
pub use session::{Message, MessageRole, Session, SessionStatus, SessionStore};
pub use storage::Database;
