//! Command-line interface definition for Chatvault
//!
//! This module defines the CLI structure using clap's derive API,
//! providing the `session` command family.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Chatvault - local store for AI conversation sessions
///
/// Persist, search and export multi-turn conversations in an embedded
/// SQLite database.
#[derive(Parser, Debug, Clone)]
#[command(name = "chatvault")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Session database path (overrides config and CHATVAULT_DB)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Per-command deadline in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Chatvault
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Manage conversation sessions
    Session {
        /// Session subcommand
        #[command(subcommand)]
        command: SessionCommand,
    },
}

/// Session management subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SessionCommand {
    /// Create a new session
    Create {
        /// Session title
        #[arg(short, long)]
        title: String,

        /// Comma-separated list of tags
        #[arg(long)]
        tags: Option<String>,

        /// AI provider name (anthropic, openai, azure, bedrock, gemini, ollama, meta)
        #[arg(short, long)]
        provider: Option<String>,

        /// Model name (overrides the provider as the session model)
        #[arg(short, long)]
        model: Option<String>,

        /// JSON object stored in the session settings
        #[arg(long)]
        metadata: Option<String>,

        /// Do not activate the session after creation
        #[arg(long)]
        no_activate: bool,
    },

    /// List sessions, newest first
    List {
        /// List all sessions
        #[arg(short, long)]
        all: bool,

        /// Maximum number of sessions to display
        #[arg(short = 'n', long)]
        limit: Option<i64>,

        /// Only sessions with this status (active, archived)
        #[arg(long)]
        status: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a session and its messages
    Show {
        /// Session ID
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Permanently delete a session and all its messages
    Delete {
        /// Session ID
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Export a session to a file
    Export {
        /// Session ID
        id: String,

        /// Export format: json, markdown, html
        #[arg(short, long)]
        format: Option<String>,

        /// Output file path (default: session-<id>.<format>)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Custom template file
        #[arg(short, long)]
        template: Option<PathBuf>,
    },

    /// Full-text search across all messages
    Search {
        /// Search terms
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        /// Maximum number of results to return
        #[arg(short, long)]
        limit: Option<i64>,

        /// Number of results to skip
        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// Only messages from this date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        date_from: Option<String>,

        /// Only messages until this date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        date_to: Option<String>,

        /// Filter by provider/model substring (e.g. 'claude', 'gpt')
        #[arg(short, long)]
        provider: Option<String>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Import a session from a JSON export ("-" reads stdin)
    Import {
        /// Path to the JSON export
        file: PathBuf,
    },

    /// Archive a session so it accepts no new messages
    Archive {
        /// Session ID
        id: String,
    },

    /// Rebuild the full-text search index
    Reindex,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            db: None,
            timeout: None,
            verbose: false,
            command: Commands::Session {
                command: SessionCommand::List {
                    all: false,
                    limit: None,
                    status: None,
                    json: false,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_command(args: &[&str]) -> SessionCommand {
        let mut argv = vec!["chatvault", "session"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).expect("parse").command {
            Commands::Session { command } => command,
        }
    }

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert_eq!(cli.config, Some("config/config.yaml".to_string()));
        assert!(!cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Session {
                command: SessionCommand::List { all: false, .. }
            }
        ));
    }

    #[test]
    fn test_cli_parse_create() {
        let cmd = session_command(&[
            "create",
            "--title",
            "Code Review",
            "--tags",
            "go,review",
            "-p",
            "anthropic",
            "--no-activate",
        ]);
        if let SessionCommand::Create {
            title,
            tags,
            provider,
            model,
            metadata,
            no_activate,
        } = cmd
        {
            assert_eq!(title, "Code Review");
            assert_eq!(tags.as_deref(), Some("go,review"));
            assert_eq!(provider.as_deref(), Some("anthropic"));
            assert_eq!(model, None);
            assert_eq!(metadata, None);
            assert!(no_activate);
        } else {
            panic!("Expected Create command");
        }
    }

    #[test]
    fn test_cli_create_requires_title() {
        assert!(Cli::try_parse_from(["chatvault", "session", "create"]).is_err());
    }

    #[test]
    fn test_cli_parse_search_joins_terms() {
        let cmd = session_command(&[
            "search",
            "database",
            "connection",
            "--date-from",
            "2026-01-01",
            "-l",
            "10",
        ]);
        if let SessionCommand::Search {
            query,
            limit,
            offset,
            date_from,
            ..
        } = cmd
        {
            assert_eq!(query.join(" "), "database connection");
            assert_eq!(limit, Some(10));
            assert_eq!(offset, 0);
            assert_eq!(date_from.as_deref(), Some("2026-01-01"));
        } else {
            panic!("Expected Search command");
        }
    }

    #[test]
    fn test_cli_parse_export() {
        let cmd = session_command(&["export", "abc", "-f", "md", "-o", "out/s.md"]);
        if let SessionCommand::Export {
            id,
            format,
            output,
            template,
        } = cmd
        {
            assert_eq!(id, "abc");
            assert_eq!(format.as_deref(), Some("md"));
            assert_eq!(output, Some(PathBuf::from("out/s.md")));
            assert_eq!(template, None);
        } else {
            panic!("Expected Export command");
        }
    }

    #[test]
    fn test_cli_parse_delete_with_yes() {
        let cmd = session_command(&["delete", "abc", "--yes"]);
        assert!(matches!(cmd, SessionCommand::Delete { yes: true, .. }));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "chatvault", "session", "reindex", "--db", "/tmp/x.db", "--timeout", "5", "-v",
        ])
        .expect("parse");
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(cli.timeout, Some(5));
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_unknown_subcommand_fails() {
        assert!(Cli::try_parse_from(["chatvault", "session", "frobnicate"]).is_err());
    }
}
