//! Read and path command implementations

use anyhow::Result;

use super::{print_json, Target};
use crate::model::MessageWindow;

pub async fn run(target: &Target<'_>, session_id: &str, window: MessageWindow, json: bool) -> Result<()> {
    let page = target
        .provider
        .read_session_messages(session_id, window, target.remote())
        .await?;

    if json {
        return print_json(&page);
    }

    if page.total == 0 {
        println!("Session '{}' not found or empty.", session_id);
        return Ok(());
    }

    println!("\n{}", "=".repeat(80));
    println!("Session: {} | Agent: {}", session_id, target.provider.name());
    println!(
        "Showing {} of {} messages{}",
        page.messages.len(),
        page.total,
        if page.has_more { " (older messages available)" } else { "" }
    );
    println!("{}", "=".repeat(80));

    for msg in &page.messages {
        let timestamp = msg
            .timestamp
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("\n[{}] {} ({})", msg.role.as_str().to_uppercase(), msg.uuid, timestamp);
        if !msg.content.is_empty() {
            println!("{}", msg.content);
        }
        for tool in &msg.tool_uses {
            println!("  🔧 [Tool: {}]", tool.name);
        }
        println!("{}", "-".repeat(40));
    }

    Ok(())
}

pub async fn path(target: &Target<'_>, session_id: &str, json: bool) -> Result<()> {
    let path = target
        .provider
        .get_session_path(session_id, target.remote())
        .await?;

    if json {
        return print_json(&path);
    }

    match path {
        Some(path) => println!("{}", path.display()),
        None => println!("No single file backs session '{}'.", session_id),
    }
    Ok(())
}
