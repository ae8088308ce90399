mod common;

use chatvault::export::ExportFormat;
use chatvault::manager::ExportRequest;
use chatvault::session::SessionExport;
use chatvault::{ChatvaultError, OpContext};
use common::{at, create_temp_manager, seed_session};
use std::fs;

#[test]
fn test_json_export_contains_every_message() {
    let (manager, tmp) = create_temp_manager();
    let (session, messages) = seed_session(
        &manager,
        "Three turns",
        Some("claude-3-5-sonnet"),
        at(2026, 7, 1, 9, 0),
        &["question one", "answer one", "question two"],
    );
    let output = tmp.path().join("exports").join("three.json");

    let report = manager
        .export_session(
            &OpContext::background(),
            &ExportRequest {
                session_id: session.id.clone(),
                format: ExportFormat::Json,
                output: Some(output.clone()),
                template: None,
            },
        )
        .unwrap();

    assert_eq!(report.path, output);
    assert_eq!(report.message_count, 3);
    assert_eq!(report.total_tokens, 10);
    assert!(report.bytes_written > 0);

    let document: SessionExport =
        serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(document.session, session);
    assert_eq!(document.messages.len(), 3);
    for (exported, stored) in document.messages.iter().zip(&messages) {
        assert_eq!(exported.content, stored.content);
        assert_eq!(exported.id, stored.id);
    }
}

#[test]
fn test_export_then_import_into_fresh_database() {
    let (source, tmp) = create_temp_manager();
    let (session, _) = seed_session(
        &source,
        "Portable",
        None,
        at(2026, 7, 2, 9, 0),
        &["portable question", "portable answer"],
    );
    let ctx = OpContext::background();
    let output = tmp.path().join("portable.json");
    source
        .export_session(
            &ctx,
            &ExportRequest {
                session_id: session.id.clone(),
                format: ExportFormat::Json,
                output: Some(output.clone()),
                template: None,
            },
        )
        .unwrap();

    let (target, _tmp2) = create_temp_manager();
    let imported = target
        .import_session(&ctx, fs::File::open(&output).unwrap())
        .unwrap();
    assert_eq!(imported, session);
    assert_eq!(
        target.store().get_messages(&ctx, &session.id).unwrap(),
        source.store().get_messages(&ctx, &session.id).unwrap()
    );

    // Imported messages are searchable
    let hits = target
        .index()
        .search_all_messages(&ctx, &chatvault::SearchOptions::new("portable"))
        .unwrap();
    assert_eq!(hits.total_count, 2);

    // A second import of the same document collides
    assert!(matches!(
        target.import_session(&ctx, fs::File::open(&output).unwrap()),
        Err(ChatvaultError::Conflict { .. })
    ));
}

#[test]
fn test_markdown_export_keeps_content_verbatim() {
    let (manager, _tmp) = create_temp_manager();
    let (session, _) = seed_session(
        &manager,
        "Markdown",
        None,
        at(2026, 7, 3, 9, 0),
        &["show me `code` & <tags>", "```rust\nfn main() {}\n```"],
    );

    let mut buf = Vec::new();
    manager
        .export_session_to(
            &OpContext::background(),
            &session.id,
            ExportFormat::Markdown,
            None,
            &mut buf,
        )
        .unwrap();
    let text = String::from_utf8(buf).unwrap();

    assert!(text.starts_with("# Markdown"));
    assert!(text.contains("show me `code` & <tags>"));
    assert!(text.contains("```rust\nfn main() {}\n```"));
    assert!(text.contains("## USER ("));
    assert!(text.contains("## ASSISTANT ("));
}

#[test]
fn test_html_export_escapes_content() {
    let (manager, _tmp) = create_temp_manager();
    let (session, _) = seed_session(
        &manager,
        "Escaping <b>",
        None,
        at(2026, 7, 4, 9, 0),
        &["<script>alert(1)</script>"],
    );

    let mut buf = Vec::new();
    manager
        .export_session_to(
            &OpContext::background(),
            &session.id,
            ExportFormat::Html,
            None,
            &mut buf,
        )
        .unwrap();
    let page = String::from_utf8(buf).unwrap();

    assert!(page.starts_with("<!DOCTYPE html>"));
    assert!(page.contains("&lt;script&gt;"));
    assert!(!page.contains("<script>"));
    assert!(page.contains("Escaping &lt;b&gt;"));
    assert!(page.contains("message-user"));
}

#[test]
fn test_custom_template_overrides_format() {
    let (manager, tmp) = create_temp_manager();
    let (session, _) = seed_session(
        &manager,
        "Templated",
        None,
        at(2026, 7, 5, 9, 0),
        &["hello", "hi there"],
    );
    let template = tmp.path().join("summary.txt");
    fs::write(
        &template,
        r#"{{ session.name }}: {{ metadata.message_count }} messages
{% for m in messages %}{{ m.role | role_label }}> {{ m.content }}
{% endfor %}"#,
    )
    .unwrap();
    let output = tmp.path().join("summary.out");

    let report = manager
        .export_session(
            &OpContext::background(),
            &ExportRequest {
                session_id: session.id.clone(),
                format: ExportFormat::Json,
                output: Some(output.clone()),
                template: Some(template.clone()),
            },
        )
        .unwrap();
    assert_eq!(report.template, Some(template));

    let text = fs::read_to_string(&output).unwrap();
    assert!(text.starts_with("Templated: 2 messages"));
    assert!(text.contains("User> hello"));
    assert!(text.contains("Assistant> hi there"));
}

#[test]
fn test_template_errors_are_export_errors() {
    let (manager, tmp) = create_temp_manager();
    let (session, _) = seed_session(&manager, "t", None, at(2026, 7, 6, 9, 0), &["x"]);
    let ctx = OpContext::background();

    let missing = tmp.path().join("does-not-exist.tera");
    let err = manager
        .export_session_to(
            &ctx,
            &session.id,
            ExportFormat::Markdown,
            Some(&missing),
            Vec::new(),
        )
        .unwrap_err();
    assert!(matches!(err, ChatvaultError::Export { .. }));

    let unparsable = tmp.path().join("bad.tera");
    fs::write(&unparsable, "{% for m in messages %}never closed").unwrap();
    let err = manager
        .export_session_to(
            &ctx,
            &session.id,
            ExportFormat::Markdown,
            Some(&unparsable),
            Vec::new(),
        )
        .unwrap_err();
    assert!(matches!(err, ChatvaultError::Export { .. }));
}

#[test]
fn test_export_unknown_session() {
    let (manager, tmp) = create_temp_manager();
    let output = tmp.path().join("ghost.json");
    let err = manager
        .export_session(
            &OpContext::background(),
            &ExportRequest {
                session_id: "ghost".to_string(),
                format: ExportFormat::Json,
                output: Some(output.clone()),
                template: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, ChatvaultError::NotFound { .. }));
    assert!(!output.exists());
}

#[test]
fn test_export_empty_session() {
    let (manager, _tmp) = create_temp_manager();
    let ctx = OpContext::background();
    let session = chatvault::Session::new("Empty");
    manager.store().create_session(&ctx, &session).unwrap();

    let mut buf = Vec::new();
    manager
        .export_session_to(&ctx, &session.id, ExportFormat::Json, None, &mut buf)
        .unwrap();
    let document: SessionExport = serde_json::from_slice(&buf).unwrap();
    assert!(document.messages.is_empty());
    assert_eq!(document.session.name, "Empty");
}
