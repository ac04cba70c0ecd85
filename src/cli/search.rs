//! Search command implementation

use anyhow::Result;

use super::{print_json, truncate_line, Target};
use crate::model::SearchMode;

pub async fn run(
    target: &Target<'_>,
    project: &str,
    query: &str,
    mode: SearchMode,
    json: bool,
) -> Result<()> {
    let hits = target
        .provider
        .search_sessions(project, query, mode, target.remote())
        .await?;

    if json {
        return print_json(&hits);
    }

    if hits.is_empty() {
        println!("No sessions match '{}'.", query);
        return Ok(());
    }

    println!("{:<38} {:<10} {:>6} {}", "ID", "Match", "Count", "Preview");
    println!("{}", "-".repeat(100));
    for hit in &hits {
        println!(
            "{:<38} {:<10} {:>6} {}",
            hit.session.session_id,
            format!("{:?}", hit.match_type).to_lowercase(),
            hit.match_count,
            truncate_line(&hit.preview, 60),
        );
    }
    Ok(())
}
