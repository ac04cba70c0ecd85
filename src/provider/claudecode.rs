//! Claude Code provider
//!
//! Data format: JSONL files in ~/.claude/projects/<encoded_project_path>/<session_id>.jsonl
//! where the project path has every `/` and `.` replaced by `-`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{
    digest_uuid, file_stem, join_lines, json_u64, not_found_message, parse_timestamp,
    path_matches, resolve_root, LoadedSession, SessionProvider,
};
use crate::access::{Access, DirEntry, SessionFs};
use crate::error::{Result, StorageError};
use crate::model::{EntryRole, Part, SessionOrigin, SessionRecord, TokenUsage, TranscriptEntry};
use crate::mutation::plan_deletion;

const HOME_ROOT: &str = ".claude/projects";

pub struct ClaudeCodeProvider {
    base_path: Option<PathBuf>,
    access: Access,
}

impl ClaudeCodeProvider {
    pub fn new(custom_path: Option<PathBuf>, access: Access) -> Self {
        Self {
            base_path: custom_path,
            access,
        }
    }

    async fn root(&self, fs: &dyn SessionFs) -> Result<PathBuf> {
        resolve_root(fs, self.base_path.as_deref(), HOME_ROOT).await
    }

    async fn read_log(&self, fs: &dyn SessionFs, file: &DirEntry) -> Result<ClaudeLog> {
        let content = fs.read_to_string(&file.path).await?;
        Ok(ClaudeLog::parse(&content))
    }

    fn to_loaded(file: &DirEntry, log: ClaudeLog, project_path: &str) -> Option<LoadedSession> {
        let session_id = file_stem(&file.path)?;
        let fallback_time = file.modified.unwrap_or_default();
        let project = log.cwd.clone().unwrap_or_else(|| project_path.to_string());

        let mut record = SessionRecord::from_transcript(
            session_id,
            project,
            &log.entries,
            file.size,
            fallback_time,
        );
        record.session_name = log.session_name.clone();
        record.origin = log.origin;

        Some(LoadedSession {
            record,
            entries: log.entries,
        })
    }

    /// Session logs directly inside one project directory
    async fn session_files(fs: &dyn SessionFs, dir: &Path) -> Result<Vec<DirEntry>> {
        Ok(fs
            .list_dir(dir)
            .await?
            .into_iter()
            .filter(|e| !e.is_dir && is_session_file(&e.name))
            .collect())
    }

    async fn find_session_file(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<DirEntry>> {
        let root = self.root(fs).await?;
        let file_name = format!("{}.jsonl", session_id);
        Ok(fs
            .walk_files(&root, 2, &file_name)
            .await?
            .into_iter()
            .find(|e| e.name == file_name))
    }
}

/// Top-level session logs; sidechain `agent-*` logs belong to a parent session
fn is_session_file(name: &str) -> bool {
    name.ends_with(".jsonl") && !name.starts_with("agent-")
}

/// `/home/u/my.app` -> `-home-u-my-app`
pub fn encode_project_dir(project_path: &str) -> String {
    project_path
        .trim_end_matches('/')
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect()
}

/// One parsed session log. `entry_lines[i]` is the line index of `entries[i]`.
#[derive(Debug, Default)]
struct ClaudeLog {
    lines: Vec<String>,
    entries: Vec<TranscriptEntry>,
    entry_lines: Vec<usize>,
    cwd: Option<String>,
    session_name: Option<String>,
    origin: Option<SessionOrigin>,
}

impl ClaudeLog {
    fn parse(content: &str) -> Self {
        let mut log = ClaudeLog::default();
        let mut custom_title: Option<String> = None;
        let mut summary: Option<String> = None;
        // Streamed replies repeat the same usage on every line of one API message
        let mut usage_seen: HashSet<String> = HashSet::new();

        for raw in content.lines() {
            if raw.trim().is_empty() {
                continue;
            }
            let line_idx = log.lines.len();
            log.lines.push(raw.to_string());

            let json: Value = match serde_json::from_str(raw) {
                Ok(v) => v,
                Err(err) => {
                    debug!(line = line_idx, error = %err, "skipping malformed log line");
                    continue;
                }
            };

            let line_type = json.get("type").and_then(|v| v.as_str()).unwrap_or("");
            match line_type {
                "custom-title" => {
                    if let Some(title) = json.get("customTitle").and_then(|v| v.as_str()) {
                        custom_title = Some(title.to_string());
                    }
                    continue;
                }
                "summary" => {
                    if let Some(text) = json.get("summary").and_then(|v| v.as_str()) {
                        summary = Some(text.to_string());
                    }
                    continue;
                }
                "user" | "assistant" | "system" => {}
                _ => continue,
            }

            if log.cwd.is_none() {
                log.cwd = json.get("cwd").and_then(|v| v.as_str()).map(String::from);
            }

            let is_meta = json.get("isMeta").and_then(|v| v.as_bool()).unwrap_or(false);
            let role = match line_type {
                "user" if !is_meta => EntryRole::User,
                "assistant" if !is_meta => EntryRole::Assistant,
                _ => EntryRole::Other,
            };

            if line_type == "user" && log.origin.is_none() && !is_meta {
                let automated = json
                    .get("entrypoint")
                    .and_then(|v| v.as_str())
                    .is_some_and(|e| e.starts_with("sdk"));
                log.origin = Some(if automated {
                    SessionOrigin::Auto
                } else {
                    SessionOrigin::User
                });
            }

            let uuid = json
                .get("uuid")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| digest_uuid(raw));
            let mut entry = TranscriptEntry::new(uuid, role);
            entry.timestamp = parse_timestamp(json.get("timestamp"));
            entry.cost_usd = json.get("costUSD").and_then(|v| v.as_f64());

            let message = json.get("message");
            if let Some(content) = message.and_then(|m| m.get("content")) {
                entry.parts = parse_content(content);
            }

            if let Some(usage) = message.and_then(|m| m.get("usage")) {
                let api_id = message
                    .and_then(|m| m.get("id"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let first_sighting = api_id.map_or(true, |id| usage_seen.insert(id));
                if first_sighting {
                    entry.usage = Some(TokenUsage {
                        input: json_u64(usage, "input_tokens"),
                        output: json_u64(usage, "output_tokens"),
                        cache_read: json_u64(usage, "cache_read_input_tokens"),
                        cache_creation: json_u64(usage, "cache_creation_input_tokens"),
                    });
                }
            }

            log.entries.push(entry);
            log.entry_lines.push(line_idx);
        }

        log.session_name = custom_title.or(summary);
        log
    }
}

fn parse_content(content: &Value) -> Vec<Part> {
    if let Some(text) = content.as_str() {
        return vec![Part::Text {
            text: text.to_string(),
        }];
    }

    let Some(blocks) = content.as_array() else {
        return vec![];
    };

    blocks
        .iter()
        .filter_map(|block| {
            let str_field = |key: &str| block.get(key).and_then(|v| v.as_str()).map(String::from);
            match block.get("type").and_then(|t| t.as_str())? {
                "text" => Some(Part::Text {
                    text: str_field("text")?,
                }),
                "thinking" => Some(Part::Reasoning {
                    text: str_field("thinking")?,
                }),
                "tool_use" => Some(Part::ToolCall {
                    call_id: str_field("id")?,
                    name: str_field("name").unwrap_or_else(|| "unknown".to_string()),
                    input: block.get("input").cloned(),
                }),
                "tool_result" => Some(Part::ToolResult {
                    call_id: str_field("tool_use_id")?,
                    output: tool_result_text(block.get("content")),
                    is_error: block
                        .get("is_error")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                }),
                _ => None,
            }
        })
        .collect()
}

/// `tool_result.content` is a string or an array of text blocks
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// A log line after its call blocks were removed
#[derive(Debug, PartialEq)]
enum StrippedLine {
    /// The content array held nothing else
    Emptied,
    Kept(String),
}

/// Drop content blocks that declare or answer one of `calls`. `None` when the
/// line has no content array to edit.
fn strip_call_blocks(raw: &str, calls: &HashSet<String>) -> Option<StrippedLine> {
    let mut json: Value = serde_json::from_str(raw).ok()?;
    let blocks = json
        .get_mut("message")
        .and_then(|m| m.get_mut("content"))
        .and_then(|c| c.as_array_mut())?;

    blocks.retain(|block| {
        let id = match block.get("type").and_then(|t| t.as_str()) {
            Some("tool_use") => block.get("id"),
            Some("tool_result") => block.get("tool_use_id"),
            _ => None,
        };
        !id.and_then(|v| v.as_str()).is_some_and(|id| calls.contains(id))
    });
    if blocks.is_empty() {
        return Some(StrippedLine::Emptied);
    }
    serde_json::to_string(&json).ok().map(StrippedLine::Kept)
}

#[async_trait]
impl SessionProvider for ClaudeCodeProvider {
    fn id(&self) -> &str {
        "claude"
    }

    fn name(&self) -> &str {
        "Claude Code"
    }

    fn description(&self) -> &str {
        "Claude Code CLI (Anthropic)"
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
        let root = self.root(fs).await?;
        let project_dir = root.join(encode_project_dir(project_path));

        // Without the encoded directory, check every project's recorded cwd
        let (files, check_cwd) = match fs.stat(&project_dir).await? {
            Some(entry) if entry.is_dir => (Self::session_files(fs, &project_dir).await?, false),
            _ => {
                debug!(project = project_path, "encoded project dir missing, scanning by cwd");
                let mut files = vec![];
                for dir in fs.list_dir(&root).await?.into_iter().filter(|e| e.is_dir) {
                    files.extend(Self::session_files(fs, &dir.path).await?);
                }
                (files, true)
            }
        };

        let mut sessions = vec![];
        for file in files {
            let log = match self.read_log(fs, &file).await {
                Ok(log) => log,
                Err(err) if err.is_not_found() => continue,
                Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                Err(err) => {
                    warn!(file = %file.path.display(), error = %err, "skipping unreadable session log");
                    continue;
                }
            };
            if check_cwd
                && !log
                    .cwd
                    .as_deref()
                    .is_some_and(|cwd| path_matches(cwd, project_path))
            {
                continue;
            }
            if let Some(session) = Self::to_loaded(&file, log, project_path) {
                // Logs holding only summaries or snapshots are not conversations
                if session.record.message_count > 0 {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn load_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<LoadedSession>> {
        let Some(file) = self.find_session_file(fs, session_id).await? else {
            return Ok(None);
        };
        let log = self.read_log(fs, &file).await?;
        Ok(Self::to_loaded(&file, log, ""))
    }

    async fn locate_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<PathBuf>> {
        Ok(self
            .find_session_file(fs, session_id)
            .await?
            .map(|file| file.path))
    }

    async fn remove_exchange(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
        user_message_uuid: &str,
        fallback_content: Option<&str>,
    ) -> Result<usize> {
        let file = self
            .find_session_file(fs, session_id)
            .await?
            .ok_or_else(not_found_message)?;
        let log = self.read_log(fs, &file).await?;
        let plan = plan_deletion(&log.entries, user_message_uuid, fallback_content)
            .ok_or_else(not_found_message)?;

        let mut drop_lines: HashSet<usize> = plan
            .span
            .clone()
            .map(|idx| log.entry_lines[idx])
            .collect();
        let mut rewritten: Vec<(usize, String)> = vec![];
        for &idx in plan.orphans.keys() {
            let line = log.entry_lines[idx];
            // blocks the parser skips (images, documents) still keep a line alive
            match strip_call_blocks(&log.lines[line], &plan.deleted_calls) {
                Some(StrippedLine::Kept(stripped)) => rewritten.push((line, stripped)),
                Some(StrippedLine::Emptied) => {
                    drop_lines.insert(line);
                }
                None if plan.orphan_empties_entry(&log.entries, idx) => {
                    drop_lines.insert(line);
                }
                None => {}
            }
        }

        let mut lines = log.lines.clone();
        for (line, content) in rewritten {
            lines[line] = content;
        }
        let kept: Vec<String> = lines
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !drop_lines.contains(idx))
            .map(|(_, line)| line)
            .collect();

        fs.write_atomic(&file.path, &join_lines(&kept)).await?;
        Ok(plan.span.len() + plan.orphan_part_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::testing::{loopback_access, loopback_host};
    use crate::model::{MessageWindow, SearchMode};
    use tempfile::TempDir;

    const SESSION: &str = r#"{"type":"summary","summary":"Parser work","leafUuid":"a2"}
{"type":"user","uuid":"u1","timestamp":"2025-01-01T10:00:00Z","cwd":"/work/app","entrypoint":"cli","message":{"role":"user","content":"Fix the parser"}}
{"type":"assistant","uuid":"a1","timestamp":"2025-01-01T10:00:05Z","cwd":"/work/app","message":{"id":"msg_1","role":"assistant","content":[{"type":"thinking","thinking":"look first"},{"type":"tool_use","id":"toolu_1","name":"Read","input":{"file":"parser.rs"}}],"usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":3}}}
{"type":"user","uuid":"r1","timestamp":"2025-01-01T10:00:06Z","cwd":"/work/app","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"fn parse()"}]}}
{"type":"assistant","uuid":"a2","timestamp":"2025-01-01T10:00:09Z","cwd":"/work/app","message":{"id":"msg_2","role":"assistant","content":[{"type":"text","text":"Fixed the parser"}],"usage":{"input_tokens":20,"output_tokens":7}}}
not json at all
{"type":"user","uuid":"u2","timestamp":"2025-01-01T10:01:00Z","cwd":"/work/app","message":{"role":"user","content":"Thanks"}}
{"type":"assistant","uuid":"a3","timestamp":"2025-01-01T10:01:30Z","cwd":"/work/app","message":{"id":"msg_3","role":"assistant","content":[{"type":"text","text":"Welcome"}]}}
"#;

    fn setup() -> (TempDir, ClaudeCodeProvider) {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(encode_project_dir("/work/app"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sess-1.jsonl"), SESSION).unwrap();
        let provider = ClaudeCodeProvider::new(Some(temp.path().to_path_buf()), Access::default());
        (temp, provider)
    }

    #[test]
    fn test_encode_project_dir() {
        assert_eq!(encode_project_dir("/home/u/my.app"), "-home-u-my-app");
        assert_eq!(encode_project_dir("/work/app/"), "-work-app");
    }

    #[test]
    fn test_parse_log() {
        let log = ClaudeLog::parse(SESSION);
        // summary and the malformed line are kept as raw lines but are not entries
        assert_eq!(log.lines.len(), 8);
        assert_eq!(log.entries.len(), 6);
        assert_eq!(log.session_name.as_deref(), Some("Parser work"));
        assert_eq!(log.origin, Some(SessionOrigin::User));
        assert_eq!(log.cwd.as_deref(), Some("/work/app"));
        assert!(matches!(log.entries[1].parts[0], Part::Reasoning { .. }));
        assert_eq!(log.entries[1].usage.unwrap().cache_read, 3);
    }

    #[test]
    fn test_custom_title_wins_and_sdk_origin() {
        let content = r#"{"type":"summary","summary":"old"}
{"type":"custom-title","customTitle":"Renamed"}
{"type":"user","uuid":"u1","entrypoint":"sdk-ts","message":{"role":"user","content":"go"}}
"#;
        let log = ClaudeLog::parse(content);
        assert_eq!(log.session_name.as_deref(), Some("Renamed"));
        assert_eq!(log.origin, Some(SessionOrigin::Auto));
    }

    #[tokio::test]
    async fn test_list_and_read() {
        let (_temp, provider) = setup();
        let sessions = provider.list_sessions("/work/app", None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.session_id, "sess-1");
        // the tool-result carrier line is a user record too
        assert_eq!(s.message_count, 6);
        assert_eq!(s.first_message_preview, "Fix the parser");
        assert_eq!(s.input_tokens, Some(30));
        assert_eq!(s.duration_seconds, Some(90));

        let page = provider
            .read_session_messages("sess-1", MessageWindow { offset: 0, limit: 2 }, None)
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert!(page.has_more);
        assert_eq!(page.messages[0].uuid, "u2");

        let all = provider
            .read_session_messages("sess-1", MessageWindow::default(), None)
            .await
            .unwrap();
        assert_eq!(all.messages[1].tool_uses[0].output.as_deref(), Some("fn parse()"));
    }

    #[tokio::test]
    async fn test_cwd_fallback_when_encoded_dir_missing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("-renamed-dir");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sess-1.jsonl"), SESSION).unwrap();
        let provider = ClaudeCodeProvider::new(Some(temp.path().to_path_buf()), Access::default());

        assert_eq!(provider.list_sessions("/work/app", None).await.unwrap().len(), 1);
        assert!(provider.list_sessions("/work/other", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_exchange_removes_tool_results() {
        let (temp, provider) = setup();
        let outcome = provider.delete_message_pair("sess-1", "u1", None, None).await;
        assert!(outcome.success);
        assert_eq!(outcome.records_removed, Some(4));

        let file = temp.path().join("-work-app/sess-1.jsonl");
        let content = std::fs::read_to_string(&file).unwrap();
        assert!(!content.contains("toolu_1"));
        assert!(content.contains("\"u2\""));
        assert!(content.contains("not json at all"));

        let again = provider.delete_message_pair("sess-1", "u1", None, None).await;
        assert!(!again.success);
        assert_eq!(again.error.as_deref(), Some("User message not found"));

        let hits = provider
            .search_sessions("/work/app", "parser", SearchMode::All, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_strip_call_blocks_keeps_other_blocks() {
        let raw = r#"{"type":"user","uuid":"r","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"x"},{"type":"text","text":"keep"}]}}"#;
        let calls: HashSet<String> = ["t1".to_string()].into();
        let Some(StrippedLine::Kept(stripped)) = strip_call_blocks(raw, &calls) else {
            panic!("line should survive");
        };
        assert!(!stripped.contains("t1"));
        assert!(stripped.contains("keep"));

        let only_result = r#"{"type":"user","uuid":"r","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"x"}]}}"#;
        assert_eq!(strip_call_blocks(only_result, &calls), Some(StrippedLine::Emptied));
    }

    #[tokio::test]
    async fn test_orphan_line_keeps_unparsed_blocks() {
        let content = r#"{"type":"user","uuid":"u1","timestamp":"2025-01-01T10:00:00Z","cwd":"/work/app","message":{"role":"user","content":"Check the screenshot"}}
{"type":"assistant","uuid":"a1","timestamp":"2025-01-01T10:00:05Z","cwd":"/work/app","message":{"id":"msg_1","role":"assistant","content":[{"type":"tool_use","id":"toolu_9","name":"Screenshot","input":{}}]}}
{"type":"user","uuid":"u2","timestamp":"2025-01-01T10:01:00Z","cwd":"/work/app","message":{"role":"user","content":"Next step"}}
{"type":"user","uuid":"r2","timestamp":"2025-01-01T10:01:05Z","cwd":"/work/app","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_9","content":"late"},{"type":"image","source":{"type":"base64","media_type":"image/png","data":"iVBORw0KGgo"}}]}}
"#;
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(encode_project_dir("/work/app"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sess-img.jsonl"), content).unwrap();
        let provider = ClaudeCodeProvider::new(Some(temp.path().to_path_buf()), Access::default());

        let outcome = provider.delete_message_pair("sess-img", "u1", None, None).await;
        assert!(outcome.success);
        // u1, a1 and the orphaned tool result
        assert_eq!(outcome.records_removed, Some(3));

        let rewritten = std::fs::read_to_string(dir.join("sess-img.jsonl")).unwrap();
        assert!(!rewritten.contains("toolu_9"));
        assert!(rewritten.contains("\"r2\""));
        assert!(rewritten.contains("iVBORw0KGgo"));
    }

    #[tokio::test]
    async fn test_remote_list_read_and_delete() {
        let home = TempDir::new().unwrap();
        let dir = home.path().join(HOME_ROOT).join(encode_project_dir("/work/app"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sess-1.jsonl"), SESSION).unwrap();
        // a custom base path is a local-machine setting and must not leak to the host
        let provider = ClaudeCodeProvider::new(
            Some(PathBuf::from("/nonexistent/local/root")),
            loopback_access(home.path()),
        );
        let host = loopback_host();

        let sessions = provider.list_sessions("/work/app", Some(&host)).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].message_count, 6);
        assert_eq!(sessions[0].input_tokens, Some(30));

        let page = provider
            .read_session_messages("sess-1", MessageWindow::default(), Some(&host))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.messages[1].tool_uses[0].output.as_deref(), Some("fn parse()"));

        let path = provider.get_session_path("sess-1", Some(&host)).await.unwrap();
        assert_eq!(path, Some(dir.join("sess-1.jsonl")));

        let outcome = provider.delete_message_pair("sess-1", "u1", None, Some(&host)).await;
        assert!(outcome.success);
        assert_eq!(outcome.records_removed, Some(4));
        let content = std::fs::read_to_string(dir.join("sess-1.jsonl")).unwrap();
        assert!(!content.contains("toolu_1"));
        assert!(content.contains("not json at all"));
    }
}
