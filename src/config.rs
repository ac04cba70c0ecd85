//! Configuration management with YAML support

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::access::{RemoteHost, RemoteShell, SshShell};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-agent settings keyed by provider id (`claude`, `codex`, `gemini`, `opencode`)
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub remote: RemoteConfig,

    /// Named remote hosts, selected with `--host <alias>`
    #[serde(default)]
    pub hosts: HashMap<String, RemoteHost>,
}

/// Individual provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Overrides the agent's data root; only honoured for local access
    #[serde(default)]
    pub base_path: Option<String>,
}

/// Remote transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

// Default value functions
fn default_enabled() -> bool {
    true
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./sessionvault.yaml (current directory)
    /// 3. ~/.config/sessionvault/sessionvault.yaml
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut search_paths = vec![];
        if let Some(path) = path {
            let explicit = shellexpand::tilde(path).to_string();
            if !Path::new(&explicit).exists() {
                anyhow::bail!("Config file not found: {}", explicit);
            }
            search_paths.push(explicit);
        }
        search_paths.push("sessionvault.yaml".to_string());
        search_paths.push(shellexpand::tilde("~/.config/sessionvault/sessionvault.yaml").to_string());

        for search_path in &search_paths {
            if Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)
                    .with_context(|| format!("Failed to read config {}", search_path))?;
                let config: Config = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config {}", search_path))?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Providers are enabled unless explicitly disabled
    pub fn is_provider_enabled(&self, provider_id: &str) -> bool {
        self.providers.get(provider_id).map_or(true, |p| p.enabled)
    }

    /// Get the base path for a provider, if configured
    pub fn provider_path(&self, provider_id: &str) -> Option<PathBuf> {
        self.providers
            .get(provider_id)
            .and_then(|p| p.base_path.as_ref())
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
    }

    /// Look up a named host; an unknown alias is treated as a bare hostname
    pub fn host(&self, alias: &str) -> RemoteHost {
        self.hosts
            .get(alias)
            .cloned()
            .unwrap_or_else(|| RemoteHost::new(alias))
    }

    pub fn remote_shell(&self) -> Arc<dyn RemoteShell> {
        Arc::new(SshShell {
            binary: self.remote.ssh_binary.clone(),
            connect_timeout: Duration::from_secs(self.remote.connect_timeout_secs),
        })
    }
}
