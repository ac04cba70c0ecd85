//! Codex provider
//!
//! Data format: JSONL rollouts in ~/.codex/sessions/YYYY/MM/DD/rollout-<timestamp>-<uuid>.jsonl.
//! Rollouts do not record a project path worth trusting, so a session belongs to a
//! project when its recorded git remote matches the project's `origin`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{
    digest_uuid, file_stem, join_lines, json_u64, not_found_message, parse_timestamp,
    resolve_root, LoadedSession, SessionProvider,
};
use crate::access::{Access, DirEntry, SessionFs};
use crate::error::{Result, StorageError};
use crate::git::{normalize_remote_url, origin_remote};
use crate::model::{EntryRole, Part, SessionRecord, TokenUsage, TranscriptEntry};
use crate::mutation::plan_deletion;

const HOME_ROOT: &str = ".codex/sessions";
const ROLLOUT_GLOB: &str = "rollout-*.jsonl";
/// sessions/YYYY/MM/DD/<file>
const TREE_DEPTH: usize = 4;

/// Injected context the CLI sends as user-role messages
const CONTEXT_PREFIXES: &[&str] = &["<environment_context>", "<user_instructions>"];

#[derive(Debug, Clone, Default, Deserialize)]
struct SessionMeta {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    git: Option<GitInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GitInfo {
    #[serde(default)]
    repository_url: Option<String>,
}

impl SessionMeta {
    /// First line is either `{type:"session_meta", payload:{...}}` or the bare payload
    fn from_line(line: &str) -> Option<Self> {
        let json: Value = serde_json::from_str(line).ok()?;
        let payload = match json.get("type").and_then(|v| v.as_str()) {
            Some("session_meta") => json.get("payload")?.clone(),
            Some(_) => return None,
            None if json.get("id").is_some() => json,
            None => return None,
        };
        serde_json::from_value(payload).ok()
    }

    fn normalized_remote(&self) -> Option<String> {
        self.git
            .as_ref()
            .and_then(|git| git.repository_url.as_deref())
            .map(normalize_remote_url)
    }
}

pub struct CodexProvider {
    base_path: Option<PathBuf>,
    access: Access,
}

impl CodexProvider {
    pub fn new(custom_path: Option<PathBuf>, access: Access) -> Self {
        Self {
            base_path: custom_path,
            access,
        }
    }

    async fn root(&self, fs: &dyn SessionFs) -> Result<PathBuf> {
        resolve_root(fs, self.base_path.as_deref(), HOME_ROOT).await
    }

    async fn rollouts(&self, fs: &dyn SessionFs) -> Result<Vec<DirEntry>> {
        let root = self.root(fs).await?;
        let pattern = Pattern::new(ROLLOUT_GLOB).map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(fs
            .walk_files(&root, TREE_DEPTH, ".jsonl")
            .await?
            .into_iter()
            .filter(|e| pattern.matches(&e.name))
            .collect())
    }

    async fn find_rollout(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<(DirEntry, Rollout)>> {
        let suffix = format!("{}.jsonl", session_id);
        for file in self.rollouts(fs).await? {
            if !file.name.ends_with(&suffix) {
                continue;
            }
            let content = fs.read_to_string(&file.path).await?;
            let rollout = Rollout::parse(&content);
            if rollout.session_id(&file.path) == session_id {
                return Ok(Some((file, rollout)));
            }
        }
        Ok(None)
    }

    fn to_loaded(file: &DirEntry, rollout: Rollout, project_path: &str) -> LoadedSession {
        let session_id = rollout.session_id(&file.path);
        let fallback_time = rollout
            .started_at()
            .or(file.modified)
            .unwrap_or_default();
        let project = rollout
            .meta
            .as_ref()
            .and_then(|m| m.cwd.clone())
            .unwrap_or_else(|| project_path.to_string());

        let record = SessionRecord::from_transcript(
            session_id,
            project,
            &rollout.entries,
            file.size,
            fallback_time,
        );
        LoadedSession {
            record,
            entries: rollout.entries,
        }
    }
}

/// Parsed rollout. `entry_lines[i]` is the line index of `entries[i]`.
#[derive(Debug, Default)]
struct Rollout {
    meta: Option<SessionMeta>,
    lines: Vec<String>,
    entries: Vec<TranscriptEntry>,
    entry_lines: Vec<usize>,
}

impl Rollout {
    fn parse(content: &str) -> Self {
        let mut rollout = Rollout::default();

        for raw in content.lines() {
            if raw.trim().is_empty() {
                continue;
            }
            let line_idx = rollout.lines.len();
            rollout.lines.push(raw.to_string());

            if line_idx == 0 {
                if let Some(meta) = SessionMeta::from_line(raw) {
                    rollout.meta = Some(meta);
                    continue;
                }
            }

            let json: Value = match serde_json::from_str(raw) {
                Ok(v) => v,
                Err(err) => {
                    debug!(line = line_idx, error = %err, "skipping malformed rollout line");
                    continue;
                }
            };

            if let Some(entry) = parse_event(&json, raw) {
                rollout.entries.push(entry);
                rollout.entry_lines.push(line_idx);
            }
        }

        rollout
    }

    /// Recorded id, else the trailing uuid of `rollout-<timestamp>-<uuid>.jsonl`
    fn session_id(&self, path: &Path) -> String {
        if let Some(id) = self.meta.as_ref().and_then(|m| m.id.clone()) {
            return id;
        }
        let stem = file_stem(path).unwrap_or_default();
        let chars: Vec<char> = stem.chars().collect();
        if chars.len() > 36 {
            chars[chars.len() - 36..].iter().collect()
        } else {
            stem
        }
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        let ts = self.meta.as_ref()?.timestamp.as_deref()?;
        DateTime::parse_from_rfc3339(ts)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Decode one event line; wrapped (`response_item` / `event_msg`) or bare payloads
fn parse_event(json: &Value, raw: &str) -> Option<TranscriptEntry> {
    let (kind, payload) = match json.get("type").and_then(|v| v.as_str())? {
        "response_item" => ("response_item", json.get("payload")?),
        "event_msg" => ("event_msg", json.get("payload")?),
        "session_meta" | "turn_context" => return None,
        _ => ("response_item", json),
    };
    let payload_type = payload.get("type").and_then(|v| v.as_str())?;

    let mut entry = match (kind, payload_type) {
        ("event_msg", "token_count") => {
            let usage = payload.get("info")?.get("last_token_usage")?;
            let mut entry = TranscriptEntry::new(digest_uuid(raw), EntryRole::Other);
            entry.usage = Some(TokenUsage {
                input: json_u64(usage, "input_tokens"),
                output: json_u64(usage, "output_tokens"),
                cache_read: json_u64(usage, "cached_input_tokens"),
                cache_creation: 0,
            });
            entry
        }
        // user_message / agent_message events duplicate the response items
        ("event_msg", _) => return None,
        (_, "message") => parse_message(payload, raw)?,
        (_, "reasoning") => {
            let mut entry = TranscriptEntry::new(digest_uuid(raw), EntryRole::Assistant);
            let summary = payload
                .get("summary")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            if !summary.is_empty() {
                entry.parts.push(Part::Reasoning { text: summary });
            }
            entry
        }
        (_, "function_call") | (_, "custom_tool_call") => {
            let call_id = payload.get("call_id").and_then(|v| v.as_str())?;
            let input = payload
                .get("arguments")
                .or_else(|| payload.get("input"))
                .map(|v| match v.as_str() {
                    Some(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())),
                    None => v.clone(),
                });
            let mut entry = TranscriptEntry::new(digest_uuid(raw), EntryRole::Assistant);
            entry.parts.push(Part::ToolCall {
                call_id: call_id.to_string(),
                name: payload
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                input,
            });
            entry
        }
        (_, "function_call_output") | (_, "custom_tool_call_output") => {
            let call_id = payload.get("call_id").and_then(|v| v.as_str())?;
            let output = match payload.get("output") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Object(o)) => o
                    .get("output")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            };
            let mut entry = TranscriptEntry::new(digest_uuid(raw), EntryRole::Other);
            entry.parts.push(Part::ToolResult {
                call_id: call_id.to_string(),
                output,
                is_error: false,
            });
            entry
        }
        _ => return None,
    };

    entry.timestamp = parse_timestamp(json.get("timestamp"));
    Some(entry)
}

fn parse_message(payload: &Value, raw: &str) -> Option<TranscriptEntry> {
    let text = payload
        .get("content")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter(|item| {
                    matches!(
                        item.get("type").and_then(|t| t.as_str()),
                        Some("input_text" | "output_text" | "text")
                    )
                })
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let role = match payload.get("role").and_then(|v| v.as_str())? {
        "user" if !CONTEXT_PREFIXES.iter().any(|p| text.trim_start().starts_with(p)) => {
            EntryRole::User
        }
        "assistant" => EntryRole::Assistant,
        _ => EntryRole::Other,
    };

    let mut entry = TranscriptEntry::new(digest_uuid(raw), role);
    entry.parts.push(Part::Text { text });
    Some(entry)
}

#[async_trait]
impl SessionProvider for CodexProvider {
    fn id(&self) -> &str {
        "codex"
    }

    fn name(&self) -> &str {
        "Codex"
    }

    fn description(&self) -> &str {
        "Codex CLI (OpenAI)"
    }

    fn access(&self) -> &Access {
        &self.access
    }

    async fn is_available(&self, fs: &dyn SessionFs) -> bool {
        match self.root(fs).await {
            Ok(root) => fs.exists(&root).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn scan_project(
        &self,
        fs: &dyn SessionFs,
        project_path: &str,
    ) -> Result<Vec<LoadedSession>> {
        let Some(project_remote) = origin_remote(fs, Path::new(project_path)).await? else {
            debug!(project = project_path, "no origin remote, no codex sessions can match");
            return Ok(vec![]);
        };

        let mut sessions = vec![];
        for file in self.rollouts(fs).await? {
            let content = match fs.read_to_string(&file.path).await {
                Ok(content) => content,
                Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                Err(err) => {
                    warn!(file = %file.path.display(), error = %err, "skipping unreadable rollout");
                    continue;
                }
            };

            // Cheap membership check on the first line before parsing the rest
            let first_line = content.lines().next().unwrap_or_default();
            let matches = SessionMeta::from_line(first_line)
                .and_then(|meta| meta.normalized_remote())
                .is_some_and(|remote| remote == project_remote);
            if !matches {
                continue;
            }

            let loaded = Self::to_loaded(&file, Rollout::parse(&content), project_path);
            if loaded.record.message_count > 0 {
                sessions.push(loaded);
            }
        }
        Ok(sessions)
    }

    async fn load_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<LoadedSession>> {
        Ok(self
            .find_rollout(fs, session_id)
            .await?
            .map(|(file, rollout)| Self::to_loaded(&file, rollout, "")))
    }

    async fn locate_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<PathBuf>> {
        Ok(self
            .find_rollout(fs, session_id)
            .await?
            .map(|(file, _)| file.path))
    }

    async fn remove_exchange(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
        user_message_uuid: &str,
        fallback_content: Option<&str>,
    ) -> Result<usize> {
        let (file, rollout) = self
            .find_rollout(fs, session_id)
            .await?
            .ok_or_else(not_found_message)?;
        let plan = plan_deletion(&rollout.entries, user_message_uuid, fallback_content)
            .ok_or_else(not_found_message)?;

        // Each call or output is its own line, so orphans always go whole
        let drop_lines: HashSet<usize> = plan
            .span
            .clone()
            .chain(plan.orphans.keys().copied())
            .map(|idx| rollout.entry_lines[idx])
            .collect();

        let kept: Vec<String> = rollout
            .lines
            .iter()
            .enumerate()
            .filter(|(idx, _)| !drop_lines.contains(idx))
            .map(|(_, line)| line.clone())
            .collect();

        fs.write_atomic(&file.path, &join_lines(&kept)).await?;
        Ok(plan.span.len() + plan.orphan_part_count())
    }
}
