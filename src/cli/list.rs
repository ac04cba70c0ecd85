//! List command implementation

use anyhow::Result;

use super::{print_json, truncate_line, Target};
use crate::model::PageRequest;

pub async fn run(target: &Target<'_>, project: &str, page: PageRequest, json: bool) -> Result<()> {
    let page = target
        .provider
        .list_sessions_paginated(project, &page, target.remote())
        .await?;

    if json {
        return print_json(&page);
    }

    if page.sessions.is_empty() {
        println!("No {} sessions found for {}.", target.provider.name(), project);
        return Ok(());
    }

    println!(
        "{:<12} {:<38} {:>6} {:>10} {}",
        "Modified", "ID", "Msgs", "Tokens", "Title"
    );
    println!("{}", "-".repeat(100));

    for session in &page.sessions {
        let tokens = match (session.input_tokens, session.output_tokens) {
            (None, None) => "-".to_string(),
            (input, output) => (input.unwrap_or(0) + output.unwrap_or(0)).to_string(),
        };
        let title = session
            .session_name
            .as_deref()
            .unwrap_or(&session.first_message_preview);

        println!(
            "{:<12} {:<38} {:>6} {:>10} {}",
            session.modified_at.format("%m-%d %H:%M"),
            session.session_id,
            session.message_count,
            tokens,
            truncate_line(title, 40),
        );
    }

    if let Some(cursor) = &page.next_cursor {
        println!("\nMore sessions available: --cursor {}", cursor);
    }

    Ok(())
}
