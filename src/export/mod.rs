//! Session export to JSON, Markdown, HTML and custom templates
//!
//! Markdown, HTML and user templates are rendered with `tera`. Every template
//! sees the same context: `session`, `messages` and `metadata`
//! (see [`ExportMetadata`]). Templates whose name ends in `.html` or `.htm`
//! are HTML-escaped automatically.

use crate::error::{ChatvaultError, Result};
use crate::session::{Message, MessageRole, Session, SessionExport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use tera::{Context, Tera, Value};

const MARKDOWN_TEMPLATE_NAME: &str = "markdown.md";
const MARKDOWN_TEMPLATE: &str = include_str!("templates/markdown.md");
const HTML_TEMPLATE_NAME: &str = "session.html";
const HTML_TEMPLATE: &str = include_str!("templates/session.html");

/// Name recorded in export metadata
pub const EXPORTER_NAME: &str = "chatvault";

/// Built-in export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Markdown,
    Html,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "markdown",
            Self::Html => "html",
        }
    }

    /// File extension for default output names (`session-<id>.<ext>`)
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = ChatvaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            "html" | "htm" => Ok(Self::Html),
            other => Err(ChatvaultError::Validation(format!(
                "unsupported export format: {other} (expected json, markdown or html)"
            ))),
        }
    }
}

/// Exporter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterOptions {
    /// Indent JSON output
    pub pretty_json: bool,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self { pretty_json: true }
    }
}

/// Figures derived from the session at export time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportMetadata {
    pub exported_at: DateTime<Utc>,
    pub exporter_name: String,
    pub exporter_version: String,
    pub message_count: usize,
    pub total_tokens: i64,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// `settings.provider`, when set
    pub provider: Option<String>,
    /// `settings.tags`, possibly empty
    pub tags: Vec<String>,
}

impl ExportMetadata {
    pub fn collect(session: &Session, messages: &[Message]) -> Self {
        Self {
            exported_at: Utc::now(),
            exporter_name: EXPORTER_NAME.to_string(),
            exporter_version: env!("CARGO_PKG_VERSION").to_string(),
            message_count: messages.len(),
            total_tokens: messages.iter().filter_map(|m| m.tokens_used).sum(),
            first_message_at: messages.first().map(|m| m.timestamp),
            last_message_at: messages.last().map(|m| m.timestamp),
            provider: session.provider().map(str::to_string),
            tags: session.tags(),
        }
    }
}

/// Template rendering context
#[derive(Debug, Serialize)]
pub struct ExportData<'a> {
    pub session: &'a Session,
    pub messages: &'a [Message],
    pub metadata: ExportMetadata,
}

/// Serializes sessions into the built-in formats or a custom template
#[derive(Debug, Clone, Default)]
pub struct Exporter {
    options: ExporterOptions,
}

impl Exporter {
    pub fn new(options: ExporterOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExporterOptions {
        &self.options
    }

    /// Write a session in one of the built-in formats
    pub fn export<W: Write>(
        &self,
        writer: W,
        format: ExportFormat,
        session: &Session,
        messages: &[Message],
    ) -> Result<()> {
        match format {
            ExportFormat::Json => self.export_to_json(writer, session, messages),
            ExportFormat::Markdown => self.export_to_markdown(writer, session, messages),
            ExportFormat::Html => self.export_to_html(writer, session, messages),
        }
    }

    /// Full-fidelity `{"session": ..., "messages": [...]}` document
    ///
    /// The output can be read back with `SessionManager::import_session`.
    pub fn export_to_json<W: Write>(
        &self,
        mut writer: W,
        session: &Session,
        messages: &[Message],
    ) -> Result<()> {
        let document = SessionExport {
            session: session.clone(),
            messages: messages.to_vec(),
        };

        let encoded = if self.options.pretty_json {
            serde_json::to_writer_pretty(&mut writer, &document)
        } else {
            serde_json::to_writer(&mut writer, &document)
        };
        encoded.map_err(|e| ChatvaultError::export("failed to encode JSON export", e))?;

        writeln!(writer).map_err(|e| ChatvaultError::export("failed to write JSON export", e))?;
        writer
            .flush()
            .map_err(|e| ChatvaultError::export("failed to flush JSON export", e))
    }

    /// Markdown transcript; message content is emitted verbatim
    pub fn export_to_markdown<W: Write>(
        &self,
        writer: W,
        session: &Session,
        messages: &[Message],
    ) -> Result<()> {
        let tera = build_tera(MARKDOWN_TEMPLATE_NAME, MARKDOWN_TEMPLATE)?;
        render(&tera, MARKDOWN_TEMPLATE_NAME, writer, session, messages)
    }

    /// Self-contained HTML page; message content is escaped
    pub fn export_to_html<W: Write>(
        &self,
        writer: W,
        session: &Session,
        messages: &[Message],
    ) -> Result<()> {
        let tera = build_tera(HTML_TEMPLATE_NAME, HTML_TEMPLATE)?;
        render(&tera, HTML_TEMPLATE_NAME, writer, session, messages)
    }

    /// Render a user-supplied tera template
    ///
    /// An empty path renders the built-in Markdown template.
    ///
    /// # Errors
    ///
    /// `Export` when the file cannot be read, does not parse, or fails to
    /// render.
    pub fn export_with_template<W: Write>(
        &self,
        writer: W,
        template_path: &Path,
        session: &Session,
        messages: &[Message],
    ) -> Result<()> {
        if template_path.as_os_str().is_empty() {
            return self.export_to_markdown(writer, session, messages);
        }

        let source = std::fs::read_to_string(template_path).map_err(|e| {
            ChatvaultError::export(
                format!("failed to read template {}", template_path.display()),
                e,
            )
        })?;
        let name = template_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "custom".to_string());

        tracing::debug!(template = %template_path.display(), "Rendering custom export template");
        let tera = build_tera(&name, &source)?;
        render(&tera, &name, writer, session, messages)
    }
}

fn build_tera(name: &str, source: &str) -> Result<Tera> {
    let mut tera = Tera::default();
    tera.autoescape_on(vec![".html", ".htm"]);
    tera.register_filter("role_label", role_label_filter);
    tera.register_filter("format_time", format_time_filter);
    tera.add_raw_template(name, source).map_err(|e| {
        ChatvaultError::export(
            format!("invalid template {name}: {}", error_chain(&e)),
            e,
        )
    })?;
    Ok(tera)
}

fn render<W: Write>(
    tera: &Tera,
    name: &str,
    writer: W,
    session: &Session,
    messages: &[Message],
) -> Result<()> {
    let data = ExportData {
        session,
        messages,
        metadata: ExportMetadata::collect(session, messages),
    };
    let context = Context::from_serialize(&data)
        .map_err(|e| ChatvaultError::export("failed to build template context", e))?;

    tera.render_to(name, &context, writer).map_err(|e| {
        ChatvaultError::export(
            format!("failed to render template {name}: {}", error_chain(&e)),
            e,
        )
    })
}

/// tera keeps the useful detail in the source chain
fn error_chain(err: &tera::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}

/// `{{ message.role | role_label }}` renders "User", "Assistant", ...
fn role_label_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let raw = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("role_label expects a string"))?;
    let label = raw
        .parse::<MessageRole>()
        .map(|role| role.label().to_string())
        .unwrap_or_else(|_| raw.to_string());
    Ok(Value::String(label))
}

/// `{{ ts | format_time }}` or `{{ ts | format_time(format="%Y-%m-%d") }}`
fn format_time_filter(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let Some(raw) = value.as_str() else {
        return Ok(value.clone());
    };
    let format = args
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or("%Y-%m-%d %H:%M:%S UTC");

    let Ok(ts) = DateTime::parse_from_rfc3339(raw) else {
        return Ok(value.clone());
    };

    let mut rendered = String::new();
    write!(rendered, "{}", ts.with_timezone(&Utc).format(format))
        .map_err(|_| tera::Error::msg(format!("format_time: invalid time format {format:?}")))?;
    Ok(Value::String(rendered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample() -> (Session, Vec<Message>) {
        let settings = json!({"provider": "anthropic", "tags": ["go", "debugging"]})
            .as_object()
            .cloned()
            .unwrap();
        let session = Session::new("Bug <Investigation>")
            .with_model("claude-3-5-sonnet")
            .with_temperature(0.7)
            .with_max_tokens(4096)
            .with_settings(settings);
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 10, 30, 0).unwrap();
        let messages = vec![
            Message::user(&session.id, "Why does `main` panic?").with_timestamp(t0),
            Message::assistant(&session.id, "Because <script>alert(1)</script> ran.")
                .with_timestamp(t0 + chrono::Duration::seconds(5))
                .with_model("claude-3-5-sonnet")
                .with_tokens(42),
        ];
        (session, messages)
    }

    fn render_to_string(
        f: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> String {
        let mut buf = Vec::new();
        f(&mut buf).expect("export failed");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn test_format_parsing_accepts_aliases() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("md".parse::<ExportFormat>().unwrap(), ExportFormat::Markdown);
        assert_eq!("htm".parse::<ExportFormat>().unwrap(), ExportFormat::Html);
        assert!(matches!(
            "pdf".parse::<ExportFormat>(),
            Err(ChatvaultError::Validation(_))
        ));
        assert_eq!(ExportFormat::Markdown.extension(), "markdown");
    }

    #[test]
    fn test_json_export_roundtrips() {
        let (session, messages) = sample();
        let out = render_to_string(|w| Exporter::default().export_to_json(w, &session, &messages));
        let parsed: SessionExport = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.session, session);
        assert_eq!(parsed.messages, messages);
        assert!(out.contains("\n  \"session\""));
    }

    #[test]
    fn test_compact_json_has_no_indentation() {
        let (session, messages) = sample();
        let exporter = Exporter::new(ExporterOptions { pretty_json: false });
        let out = render_to_string(|w| exporter.export_to_json(w, &session, &messages));
        assert_eq!(out.lines().count(), 1);
    }

    #[test]
    fn test_markdown_export_layout() {
        let (session, messages) = sample();
        let out =
            render_to_string(|w| Exporter::default().export_to_markdown(w, &session, &messages));

        assert!(out.starts_with("# Bug <Investigation>\n"));
        assert!(out.contains("- **Temperature:** 0.7"));
        assert!(out.contains("- **Max Tokens:** 4096"));
        assert!(out.contains("- **Provider:** anthropic"));
        assert!(out.contains("- **Tags:** go, debugging"));
        assert!(out.contains("- **Tokens used:** 42"));
        assert!(out.contains("## USER (2026-01-05 10:30:00 UTC)"));
        assert!(out.contains("## ASSISTANT (2026-01-05 10:30:05 UTC)"));
        assert!(out.contains("Because <script>alert(1)</script> ran."));
    }

    #[test]
    fn test_markdown_omits_absent_settings() {
        let session = Session::new("Plain");
        let out = render_to_string(|w| Exporter::default().export_to_markdown(w, &session, &[]));
        assert!(!out.contains("Temperature"));
        assert!(!out.contains("Provider"));
        assert!(out.contains("- **Messages:** 0"));
    }

    #[test]
    fn test_html_export_escapes_content() {
        let (session, messages) = sample();
        let out = render_to_string(|w| Exporter::default().export_to_html(w, &session, &messages));

        assert!(out.starts_with("<!DOCTYPE html>"));
        assert!(out.contains("<style>"));
        assert!(out.contains("class=\"message message-user\""));
        assert!(out.contains("class=\"message message-assistant\""));
        assert!(out.contains("&lt;script&gt;"));
        assert!(!out.contains("<script>alert"));
        assert!(out.contains("Bug &lt;Investigation&gt;"));
        assert!(out.contains(">Assistant</span>"));
    }

    #[test]
    fn test_custom_template_sees_context() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(
            &path,
            "{{ session.name }}|{{ metadata.message_count }}|{% for m in messages %}{{ m.role | role_label }};{% endfor %}\n",
        )
        .unwrap();

        let (session, messages) = sample();
        let out = render_to_string(|w| {
            Exporter::default().export_with_template(w, &path, &session, &messages)
        });
        assert_eq!(out.trim_end(), "Bug <Investigation>|2|User;Assistant;");
    }

    #[test]
    fn test_empty_template_path_uses_markdown() {
        let (session, messages) = sample();
        let out = render_to_string(|w| {
            Exporter::default().export_with_template(w, Path::new(""), &session, &messages)
        });
        assert!(out.starts_with("# Bug <Investigation>"));
    }

    #[test]
    fn test_template_errors_surface_as_export_errors() {
        let dir = tempdir().unwrap();
        let (session, messages) = sample();

        let missing = dir.path().join("missing.tera");
        let err = Exporter::default()
            .export_with_template(Vec::new(), &missing, &session, &messages)
            .unwrap_err();
        assert!(matches!(err, ChatvaultError::Export { .. }));

        let broken = dir.path().join("broken.tera");
        std::fs::write(&broken, "{% for m in messages %}unterminated").unwrap();
        let err = Exporter::default()
            .export_with_template(Vec::new(), &broken, &session, &messages)
            .unwrap_err();
        assert!(matches!(err, ChatvaultError::Export { .. }));

        let bad_field = dir.path().join("bad.tera");
        std::fs::write(&bad_field, "{{ session.nonexistent.deeper }}").unwrap();
        let err = Exporter::default()
            .export_with_template(Vec::new(), &bad_field, &session, &messages)
            .unwrap_err();
        assert!(matches!(err, ChatvaultError::Export { .. }));
    }

    #[test]
    fn test_metadata_collects_totals() {
        let (session, messages) = sample();
        let meta = ExportMetadata::collect(&session, &messages);
        assert_eq!(meta.message_count, 2);
        assert_eq!(meta.total_tokens, 42);
        assert_eq!(meta.first_message_at, Some(messages[0].timestamp));
        assert_eq!(meta.last_message_at, Some(messages[1].timestamp));
        assert_eq!(meta.provider.as_deref(), Some("anthropic"));
        assert_eq!(meta.exporter_name, EXPORTER_NAME);
    }

    #[test]
    fn test_format_time_filter_custom_format() {
        let mut args = HashMap::new();
        args.insert("format".to_string(), Value::String("%Y-%m-%d".to_string()));
        let out = format_time_filter(&Value::String("2026-01-05T10:30:00Z".into()), &args).unwrap();
        assert_eq!(out, Value::String("2026-01-05".into()));
    }

    #[test]
    fn test_invalid_time_format_is_render_error() {
        let mut args = HashMap::new();
        args.insert("format".to_string(), Value::String("%Q".to_string()));
        let err = format_time_filter(&Value::String("2026-01-05T10:30:00Z".into()), &args)
            .unwrap_err();
        assert!(err.to_string().contains("%Q"));

        let dir = tempdir().unwrap();
        let path = dir.path().join("bad_time.txt");
        std::fs::write(
            &path,
            r#"{{ session.created_at | format_time(format="%Q") }}"#,
        )
        .unwrap();
        let (session, messages) = sample();
        let err = Exporter::default()
            .export_with_template(Vec::new(), &path, &session, &messages)
            .unwrap_err();
        assert!(matches!(err, ChatvaultError::Export { .. }));
    }

    struct FailingWriter;

    impl std::io::Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("sink closed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sink_failure_is_export_error() {
        let (session, messages) = sample();
        for format in [ExportFormat::Json, ExportFormat::Markdown, ExportFormat::Html] {
            let err = Exporter::default()
                .export(FailingWriter, format, &session, &messages)
                .unwrap_err();
            assert!(matches!(err, ChatvaultError::Export { .. }), "{format}");
        }
    }
}
