use crate::error::ChatvaultError;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Free-form key/value settings attached to a session or message
pub type Settings = Map<String, Value>;

/// Current time at the precision the store persists (microseconds)
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fresh random identifier (UUID v4)
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepts new messages
    Active,
    /// Read-only; refuses new messages until re-activated
    Archived,
    /// Only ever seen inside a hard-delete transaction
    DeletedPending,
}

impl SessionStatus {
    /// Column value for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::DeletedPending => "deleted_pending",
        }
    }

    /// Whether a caller may create or update a session into this status
    pub fn is_assignable(&self) -> bool {
        !matches!(self, Self::DeletedPending)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ChatvaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "deleted_pending" => Ok(Self::DeletedPending),
            other => Err(ChatvaultError::Validation(format!(
                "invalid session status: {other}"
            ))),
        }
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    /// Column value for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    /// Human-readable label ("User", "Assistant", ...)
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::System => "System",
            Self::Tool => "Tool",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = ChatvaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(ChatvaultError::Validation(format!(
                "invalid message role: {other}"
            ))),
        }
    }
}

/// A stored conversation
///
/// # Examples
///
/// ```
/// use chatvault::session::{Session, SessionStatus};
///
/// let session = Session::new("Bug Investigation").with_model("claude-3-5-sonnet");
/// assert_eq!(session.status, SessionStatus::Active);
/// assert_eq!(session.id.len(), 36);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier (UUID v4), immutable
    pub id: String,
    /// Human-readable title
    pub name: String,
    /// Lifecycle state
    pub status: SessionStatus,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the session row was last mutated
    pub updated_at: DateTime<Utc>,
    /// Provider/model identifier
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling temperature in [0, 2]
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Response token cap, positive
    #[serde(default)]
    pub max_tokens: Option<i64>,
    /// Tags, provider and caller metadata
    #[serde(default)]
    pub settings: Option<Settings>,
}

impl Session {
    /// New active session with a fresh id and current timestamps
    pub fn new(name: impl Into<String>) -> Self {
        let ts = now();
        Self {
            id: new_id(),
            name: name.into(),
            status: SessionStatus::Active,
            created_at: ts,
            updated_at: ts,
            model: None,
            temperature: None,
            max_tokens: None,
            settings: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Tags stored under `settings.tags`
    pub fn tags(&self) -> Vec<String> {
        self.settings
            .as_ref()
            .and_then(|s| s.get("tags"))
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Provider stored under `settings.provider`
    pub fn provider(&self) -> Option<&str> {
        self.settings
            .as_ref()
            .and_then(|s| s.get("provider"))
            .and_then(Value::as_str)
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, immutable
    pub id: String,
    /// Owning session
    pub session_id: String,
    /// Author
    pub role: MessageRole,
    /// Opaque UTF-8 text
    pub content: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Message this one replies to
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub metadata: Option<Settings>,
}

impl Message {
    /// New message stamped with the current time and a fresh id
    pub fn new(session_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: now(),
            parent_id: None,
            tokens_used: None,
            model: None,
            finish_reason: None,
            metadata: None,
        }
    }

    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::User, content)
    }

    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::Assistant, content)
    }

    pub fn system(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::System, content)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(6);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tokens(mut self, tokens_used: i64) -> Self {
        self.tokens_used = Some(tokens_used);
        self
    }

    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Settings) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A session together with its message statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    pub message_count: i64,
    pub total_tokens: i64,
}

/// Options for listing sessions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    /// Maximum number of sessions; 0 returns all
    pub limit: i64,
    /// Number of sessions to skip
    pub offset: i64,
    /// Only sessions in this state
    pub status: Option<SessionStatus>,
}

impl ListOptions {
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Full-fidelity document written by the JSON exporter and read by import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExport {
    pub session: Session,
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_new_defaults() {
        let session = Session::new("Title");
        assert_eq!(session.name, "Title");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.created_at, session.updated_at);
        assert!(Uuid::parse_str(&session.id).is_ok());
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(Session::new("a").id, Session::new("a").id);
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Archived,
            SessionStatus::DeletedPending,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_deleted_pending_is_not_assignable() {
        assert!(SessionStatus::Active.is_assignable());
        assert!(SessionStatus::Archived.is_assignable());
        assert!(!SessionStatus::DeletedPending.is_assignable());
    }

    #[test]
    fn test_role_parse_and_label() {
        assert_eq!("tool".parse::<MessageRole>().unwrap(), MessageRole::Tool);
        assert_eq!(MessageRole::Assistant.label(), "Assistant");
        assert!(matches!(
            "robot".parse::<MessageRole>(),
            Err(ChatvaultError::Validation(_))
        ));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&MessageRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_session_tags_and_provider_from_settings() {
        let settings = json!({"tags": ["go", "api"], "provider": "anthropic"})
            .as_object()
            .cloned()
            .unwrap();
        let session = Session::new("t").with_settings(settings);
        assert_eq!(session.tags(), vec!["go".to_string(), "api".to_string()]);
        assert_eq!(session.provider(), Some("anthropic"));
    }

    #[test]
    fn test_message_timestamp_truncated_to_micros() {
        let ts = Utc::now();
        let msg = Message::user("s", "hi").with_timestamp(ts);
        assert_eq!(msg.timestamp.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_summary_serializes_flattened() {
        let summary = SessionSummary {
            session: Session::new("x"),
            message_count: 3,
            total_tokens: 10,
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["name"], "x");
        assert_eq!(value["message_count"], 3);
    }
}
