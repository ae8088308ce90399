use crate::cli::SessionCommand;
use crate::commands::CommandContext;
use crate::config::Config;
use crate::error::{ChatvaultError, Result};
use crate::export::ExportFormat;
use crate::manager::{
    CreateSessionRequest, DeleteOutcome, DeleteRequest, DeletionPreview, ExportRequest,
    ListRequest, SearchRequest, SessionManager,
};
use crate::search::{SearchResultSet, HIGHLIGHT_CLOSE, HIGHLIGHT_OPEN};
use crate::session::{Session, SessionStatus};
use colored::Colorize;
use prettytable::{format, Table};
use std::io::{BufRead, Write};
use std::path::Path;
use std::str::FromStr;

const TITLE_WIDTH: usize = 40;

/// Handle `chatvault session ...` commands
pub fn handle_session(
    manager: &SessionManager,
    config: &Config,
    cmd: &CommandContext,
    command: SessionCommand,
) -> Result<()> {
    match command {
        SessionCommand::Create {
            title,
            tags,
            provider,
            model,
            metadata,
            no_activate,
        } => {
            let created = manager.create_session(
                &cmd.op(),
                &CreateSessionRequest {
                    title,
                    tags,
                    provider,
                    model,
                    metadata_json: metadata,
                    no_activate,
                },
            )?;

            let session = &created.session;
            println!("{} {}", "Created session".green(), session.id.cyan());
            println!("  Title:    {}", session.name);
            if let Some(provider) = session.provider() {
                println!("  Provider: {}", provider);
            }
            if let Some(model) = &session.model {
                println!("  Model:    {}", model);
            }
            if !created.tags.is_empty() {
                println!("  Tags:     {}", created.tags.join(", "));
            }
            if created.activated {
                println!("  Status:   {}", "active".green());
            } else {
                println!(
                    "  Status:   {} (not activated; use the session ID to continue it)",
                    session.status
                );
            }
        }

        SessionCommand::List {
            all,
            limit,
            status,
            json,
        } => {
            let status = status
                .as_deref()
                .map(SessionStatus::from_str)
                .transpose()?;
            let ctx = cmd.op();
            let sessions = manager.list_sessions(
                &ctx,
                &ListRequest {
                    all,
                    limit: limit.unwrap_or(config.session.list_limit),
                    status,
                },
            )?;

            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
                return Ok(());
            }

            if sessions.is_empty() {
                println!("{}", "No sessions found.".yellow());
                return Ok(());
            }

            let mut table = Table::new();
            table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
            table.add_row(prettytable::row![
                "ID".bold(),
                "Title".bold(),
                "Status".bold(),
                "Model".bold(),
                "Messages".bold(),
                "Last Updated".bold()
            ]);

            for session in &sessions {
                let count = manager
                    .store()
                    .get_session_message_count(&ctx, &session.id)?;
                table.add_row(prettytable::row![
                    short_id(&session.id).cyan(),
                    truncate(&session.name, TITLE_WIDTH),
                    status_label(session.status),
                    session.model.as_deref().unwrap_or("-"),
                    count,
                    session.updated_at.format("%Y-%m-%d %H:%M").to_string()
                ]);
            }

            println!("\nSessions:");
            table.printstd();
            println!();
            println!(
                "Use {} to view a session.",
                "chatvault session show <ID>".cyan()
            );
            println!();
        }

        SessionCommand::Show { id, json } => {
            let details = manager.show_session(&cmd.op(), &id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&details)?);
                return Ok(());
            }

            let session = &details.summary.session;
            println!();
            println!("{}", session.name.bold());
            println!("  ID:       {}", session.id.cyan());
            println!("  Status:   {}", status_label(session.status));
            println!("  Created:  {}", session.created_at.format("%Y-%m-%d %H:%M:%S"));
            println!("  Updated:  {}", session.updated_at.format("%Y-%m-%d %H:%M:%S"));
            if let Some(model) = &session.model {
                println!("  Model:    {}", model);
            }
            let tags = session.tags();
            if !tags.is_empty() {
                println!("  Tags:     {}", tags.join(", "));
            }
            println!(
                "  Messages: {}  Tokens: {}",
                details.summary.message_count, details.summary.total_tokens
            );
            println!();

            for message in &details.messages {
                println!(
                    "{} {}",
                    format!("[{}]", message.role.label()).bold(),
                    message.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
                );
                println!("{}", message.content);
                println!();
            }
        }

        SessionCommand::Delete { id, yes } => {
            let preview = manager.deletion_preview(&cmd.op(), &id)?;
            let confirmed = yes || confirm_deletion(&preview)?;

            match manager.delete_session(
                &cmd.op(),
                &DeleteRequest {
                    session_id: id,
                    confirmed,
                },
            )? {
                DeleteOutcome::Deleted(preview) => {
                    println!(
                        "{}",
                        format!(
                            "Deleted session {} ({} messages)",
                            preview.id, preview.message_count
                        )
                        .green()
                    );
                }
                DeleteOutcome::NotConfirmed(_) => {
                    println!("{}", "Deletion cancelled.".yellow());
                }
            }
        }

        SessionCommand::Export {
            id,
            format,
            output,
            template,
        } => {
            let format = match format.as_deref() {
                Some(raw) => ExportFormat::from_str(raw)?,
                None => config.default_export_format()?,
            };
            let report = manager.export_session(
                &cmd.op(),
                &ExportRequest {
                    session_id: id,
                    format,
                    output,
                    template,
                },
            )?;

            let rendered_as = match &report.template {
                Some(template) => format!("template {}", template.display()),
                None => report.format.to_string(),
            };
            println!(
                "{} {} to {}",
                "Exported".green(),
                report.session_name,
                report.path.display().to_string().cyan()
            );
            println!(
                "  {} messages, {} tokens, {} bytes ({})",
                report.message_count, report.total_tokens, report.bytes_written, rendered_as
            );
        }

        SessionCommand::Search {
            query,
            limit,
            offset,
            date_from,
            date_to,
            provider,
            json,
        } => {
            let results = manager.search(
                &cmd.op(),
                &SearchRequest {
                    query: query.join(" "),
                    limit: limit.unwrap_or(config.search.default_limit),
                    offset,
                    date_from,
                    date_to,
                    provider,
                },
            )?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_search_results(&results);
            }
        }

        SessionCommand::Import { file } => {
            let session = import_from(manager, cmd, &file)?;
            println!(
                "{} {} ({})",
                "Imported session".green(),
                session.id.cyan(),
                session.name
            );
        }

        SessionCommand::Archive { id } => {
            manager.archive_session(&cmd.op(), &id)?;
            println!("{}", format!("Archived session {}", id).green());
        }

        SessionCommand::Reindex => {
            let indexed = manager.rebuild_search_index(&cmd.op())?;
            println!(
                "{}",
                format!("Rebuilt search index ({} messages)", indexed).green()
            );
        }
    }

    Ok(())
}

fn import_from(manager: &SessionManager, cmd: &CommandContext, file: &Path) -> Result<Session> {
    if file.as_os_str() == "-" {
        return manager.import_session(&cmd.op(), std::io::stdin().lock());
    }
    let reader = std::fs::File::open(file).map_err(|e| {
        ChatvaultError::Validation(format!("cannot open {}: {}", file.display(), e))
    })?;
    manager.import_session(&cmd.op(), std::io::BufReader::new(reader))
}

/// Ask on stdin whether to delete; only `y` or `yes` confirms
fn confirm_deletion(preview: &DeletionPreview) -> Result<bool> {
    println!(
        "About to permanently delete session {} \"{}\"",
        preview.id.cyan(),
        preview.name
    );
    println!(
        "  Status: {}  Created: {}  Messages: {}",
        preview.status,
        preview.created_at.format("%Y-%m-%d %H:%M"),
        preview.message_count
    );
    print!("{} ", "Delete this session? [y/N]".bold());
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(is_affirmative(&answer))
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn print_search_results(set: &SearchResultSet) {
    if set.results.is_empty() {
        println!(
            "{}",
            format!("No messages matched \"{}\".", set.query).yellow()
        );
        return;
    }

    println!(
        "\nFound {} result(s) for \"{}\" (showing {}-{}):\n",
        set.total_count,
        set.query,
        set.offset + 1,
        set.offset + set.results.len() as i64
    );

    for (i, hit) in set.results.iter().enumerate() {
        println!(
            "{} {} {} {} {}",
            format!("[{}]", set.offset + i as i64 + 1).bold(),
            hit.session_name.bold(),
            format!("({})", short_id(&hit.message.session_id)).cyan(),
            hit.message.role.label(),
            hit.message
                .timestamp
                .format("%Y-%m-%d %H:%M")
                .to_string()
                .dimmed()
        );
        println!("    {}", highlight(&hit.snippet));
        println!("    {}", format!("score {:.3}", hit.relevance_score).dimmed());
        println!();
    }

    if set.has_more() {
        println!(
            "More results available; use {} to see the next page.",
            format!("--offset {}", set.offset + set.results.len() as i64).cyan()
        );
    }
}

/// Turn `<mark>` markers into terminal highlighting
fn highlight(snippet: &str) -> String {
    let mut out = String::with_capacity(snippet.len());
    let mut rest = snippet;
    while let Some(start) = rest.find(HIGHLIGHT_OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + HIGHLIGHT_OPEN.len()..];
        match after_open.find(HIGHLIGHT_CLOSE) {
            Some(end) => {
                out.push_str(&after_open[..end].yellow().bold().to_string());
                rest = &after_open[end + HIGHLIGHT_CLOSE.len()..];
            }
            None => {
                out.push_str(after_open);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.replace('\n', " ")
}

fn status_label(status: SessionStatus) -> colored::ColoredString {
    match status {
        SessionStatus::Active => status.as_str().green(),
        SessionStatus::Archived => status.as_str().yellow(),
        SessionStatus::DeletedPending => status.as_str().red(),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let head: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
