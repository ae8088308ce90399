//! Configuration management for Chatvault
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{ChatvaultError, Result};
use crate::export::ExportFormat;
use crate::search::MAX_SEARCH_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound for `operation_timeout_seconds`
pub const MAX_OPERATION_TIMEOUT_SECONDS: u64 = 86_400;

/// Upper bound for `busy_timeout_ms`
pub const MAX_BUSY_TIMEOUT_MS: u64 = 86_400_000;

/// Main configuration structure for Chatvault
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Database location and locking behavior
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Per-operation limits for session commands
    #[serde(default)]
    pub session: SessionConfig,
    /// Search defaults
    #[serde(default)]
    pub search: SearchConfig,
    /// Export defaults
    #[serde(default)]
    pub export: ExportConfig,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the session database; unset means the platform data directory
    #[serde(default)]
    pub path: Option<String>,

    /// How long a connection waits on a locked database (milliseconds)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Session command configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deadline applied to every command (seconds)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_seconds: u64,

    /// Sessions shown by `session list` without `--all`
    #[serde(default = "default_list_limit")]
    pub list_limit: i64,
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_list_limit() -> i64 {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout_seconds: default_operation_timeout(),
            list_limit: default_list_limit(),
        }
    }
}

/// Search configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results per page when `--limit` is not given
    #[serde(default = "default_search_limit")]
    pub default_limit: i64,
}

fn default_search_limit() -> i64 {
    50
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
        }
    }
}

/// Export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Format used when `--format` is not given: json, markdown or html
    #[serde(default = "default_export_format")]
    pub default_format: String,

    /// Indent JSON exports
    #[serde(default = "default_pretty_json")]
    pub pretty_json: bool,
}

fn default_export_format() -> String {
    "json".to_string()
}

fn default_pretty_json() -> bool {
    true
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            default_format: default_export_format(),
            pretty_json: default_pretty_json(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error; defaults are used and a warning is
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ChatvaultError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ChatvaultError::Config(format!("Failed to parse config: {}", e)))
    }

    fn apply_env_vars(&mut self) {
        if let Ok(path) = std::env::var(crate::storage::DB_PATH_ENV) {
            self.database.path = Some(path);
        }

        if let Ok(busy) = std::env::var("CHATVAULT_BUSY_TIMEOUT_MS") {
            if let Ok(value) = busy.parse() {
                self.database.busy_timeout_ms = value;
            } else {
                tracing::warn!("Invalid CHATVAULT_BUSY_TIMEOUT_MS: {}", busy);
            }
        }

        if let Ok(timeout) = std::env::var("CHATVAULT_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.session.operation_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid CHATVAULT_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(limit) = std::env::var("CHATVAULT_LIST_LIMIT") {
            if let Ok(value) = limit.parse() {
                self.session.list_limit = value;
            } else {
                tracing::warn!("Invalid CHATVAULT_LIST_LIMIT: {}", limit);
            }
        }

        if let Ok(limit) = std::env::var("CHATVAULT_SEARCH_LIMIT") {
            if let Ok(value) = limit.parse() {
                self.search.default_limit = value;
            } else {
                tracing::warn!("Invalid CHATVAULT_SEARCH_LIMIT: {}", limit);
            }
        }

        if let Ok(format) = std::env::var("CHATVAULT_EXPORT_FORMAT") {
            self.export.default_format = format;
        }

        if let Ok(pretty) = std::env::var("CHATVAULT_PRETTY_JSON") {
            match pretty.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.export.pretty_json = true,
                "0" | "false" | "no" => self.export.pretty_json = false,
                _ => tracing::warn!("Invalid CHATVAULT_PRETTY_JSON: {}", pretty),
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(db) = &cli.db {
            tracing::debug!("Using database override from CLI: {}", db.display());
            self.database.path = Some(db.to_string_lossy().into_owned());
        }

        if let Some(timeout) = cli.timeout {
            self.session.operation_timeout_seconds = timeout;
        }

        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any value is out of range
    pub fn validate(&self) -> Result<()> {
        if self.database.busy_timeout_ms == 0
            || self.database.busy_timeout_ms > MAX_BUSY_TIMEOUT_MS
        {
            return Err(ChatvaultError::Config(format!(
                "database.busy_timeout_ms must be between 1 and {MAX_BUSY_TIMEOUT_MS}"
            )));
        }

        if self.session.operation_timeout_seconds == 0
            || self.session.operation_timeout_seconds > MAX_OPERATION_TIMEOUT_SECONDS
        {
            return Err(ChatvaultError::Config(format!(
                "session.operation_timeout_seconds must be between 1 and {MAX_OPERATION_TIMEOUT_SECONDS}"
            )));
        }

        if self.session.list_limit < 0 {
            return Err(ChatvaultError::Config(
                "session.list_limit cannot be negative".to_string(),
            ));
        }

        if self.search.default_limit <= 0 || self.search.default_limit > MAX_SEARCH_LIMIT {
            return Err(ChatvaultError::Config(format!(
                "search.default_limit must be between 1 and {}",
                MAX_SEARCH_LIMIT
            )));
        }

        self.export
            .default_format
            .parse::<ExportFormat>()
            .map_err(|_| {
                ChatvaultError::Config(format!(
                    "Invalid export.default_format: {}. Must be one of: json, markdown, html",
                    self.export.default_format
                ))
            })?;

        Ok(())
    }

    /// Parsed `export.default_format`
    pub fn default_export_format(&self) -> Result<ExportFormat> {
        self.export.default_format.parse()
    }
}
