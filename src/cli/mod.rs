//! Subcommand implementations for the `sessionvault` binary

pub mod agents;
pub mod delete;
pub mod list;
pub mod read;
pub mod search;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::access::RemoteHost;
use crate::provider::{ProviderRegistry, SessionProvider};

/// Provider and host a subcommand runs against
pub struct Target<'a> {
    pub provider: &'a dyn SessionProvider,
    pub remote: Option<RemoteHost>,
}

impl<'a> Target<'a> {
    pub fn resolve(
        registry: &'a ProviderRegistry,
        agent: &str,
        remote: Option<RemoteHost>,
    ) -> Result<Self> {
        let provider = registry.get(agent).ok_or_else(|| {
            let known: Vec<&str> = registry.all().iter().map(|p| p.id()).collect();
            anyhow!("Unknown or disabled agent '{}' (known: {})", agent, known.join(", "))
        })?;
        Ok(Self { provider, remote })
    }

    pub fn remote(&self) -> Option<&RemoteHost> {
        self.remote.as_ref()
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// First line of `text`, cut to `max` characters
pub(crate) fn truncate_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}
