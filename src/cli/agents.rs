//! Agents command implementation

use anyhow::Result;
use serde::Serialize;

use super::print_json;
use crate::access::RemoteHost;
use crate::provider::ProviderRegistry;

#[derive(Serialize)]
struct AgentRow<'a> {
    id: &'a str,
    name: &'a str,
    description: &'a str,
    available: bool,
}

pub async fn run(registry: &ProviderRegistry, remote: Option<&RemoteHost>, json: bool) -> Result<()> {
    let available: Vec<&str> = registry
        .available(remote)
        .await
        .iter()
        .map(|p| p.id())
        .collect();

    let rows: Vec<AgentRow> = registry
        .all()
        .into_iter()
        .map(|p| AgentRow {
            id: p.id(),
            name: p.name(),
            description: p.description(),
            available: available.contains(&p.id()),
        })
        .collect();

    if json {
        return print_json(&rows);
    }

    println!("{:<10} {:<14} {:<10} {}", "ID", "Name", "Available", "Description");
    println!("{}", "-".repeat(80));
    for row in rows {
        println!(
            "{:<10} {:<14} {:<10} {}",
            row.id,
            row.name,
            if row.available { "yes" } else { "no" },
            row.description
        );
    }
    Ok(())
}
