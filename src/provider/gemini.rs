//! Gemini CLI provider
//!
//! Data format: one JSON document per session in
//! ~/.gemini/history/<project_key>/session-<timestamp>-<session_id>.json

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{
    digest_uuid, json_u64, not_found_message, parse_timestamp, resolve_root, LoadedSession,
    SessionProvider,
};
use crate::access::{Access, DirEntry, SessionFs};
use crate::error::{Result, StorageError};
use crate::model::{
    truncate_preview, EntryRole, Part, SessionRecord, TokenUsage, TranscriptEntry,
};
use crate::mutation::plan_deletion;

const HOME_ROOT: &str = ".gemini/history";
const PROJECT_ROOT_MARKER: &str = ".project_root";

/// The CLI's native project key: SHA-256 of the absolute project path
pub fn project_hash(project_path: &str) -> String {
    hex::encode(Sha256::digest(project_path.trim_end_matches('/').as_bytes()))
}

fn is_session_file(name: &str) -> bool {
    name.starts_with("session-") && name.ends_with(".json")
}

fn short_id(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}

pub struct GeminiProvider {
    base_path: Option<PathBuf>,
    access: Access,
}

impl GeminiProvider {
    pub fn new(custom_path: Option<PathBuf>, access: Access) -> Self {
        Self {
            base_path: custom_path,
            access,
        }
    }

    async fn root(&self, fs: &dyn SessionFs) -> Result<PathBuf> {
        resolve_root(fs, self.base_path.as_deref(), HOME_ROOT).await
    }

    /// Basename directory, then the hashed key, then a `.project_root` marker scan
    async fn project_dir(&self, fs: &dyn SessionFs, project_path: &str) -> Result<Option<PathBuf>> {
        let root = self.root(fs).await?;
        let project = project_path.trim_end_matches('/');

        let basename = Path::new(project)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let mut candidates = vec![];
        if let Some(basename) = basename {
            candidates.push(root.join(basename));
        }
        candidates.push(root.join(project_hash(project)));

        for candidate in candidates {
            if fs.stat(&candidate).await?.is_some_and(|e| e.is_dir) {
                return Ok(Some(candidate));
            }
        }

        for dir in fs.list_dir(&root).await?.into_iter().filter(|e| e.is_dir) {
            let marker = dir.path.join(PROJECT_ROOT_MARKER);
            match fs.read_to_string(&marker).await {
                Ok(recorded) if recorded.trim().trim_end_matches('/') == project => {
                    debug!(dir = %dir.path.display(), "project resolved through marker file");
                    return Ok(Some(dir.path));
                }
                Ok(_) => {}
                Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                Err(_) => {}
            }
        }
        Ok(None)
    }

    async fn read_document(fs: &dyn SessionFs, file: &DirEntry) -> Result<GeminiDocument> {
        let content = fs.read_to_string(&file.path).await?;
        GeminiDocument::parse(&content)
    }

    async fn find_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<(DirEntry, GeminiDocument)>> {
        let root = self.root(fs).await?;
        let short = short_id(session_id);
        let files = fs.walk_files(&root, 2, ".json").await?;

        for file in files
            .into_iter()
            .filter(|f| is_session_file(&f.name) && f.name.contains(&short))
        {
            match Self::read_document(fs, &file).await {
                Ok(doc) if doc.session_id(&file.path) == session_id => return Ok(Some((file, doc))),
                Ok(_) => {}
                Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                Err(err) => debug!(file = %file.path.display(), error = %err, "skipping session document"),
            }
        }
        Ok(None)
    }

    fn to_loaded(file: &DirEntry, doc: GeminiDocument, project_path: &str) -> LoadedSession {
        let session_id = doc.session_id(&file.path);
        let fallback_time = file.modified.unwrap_or_default();

        let mut record = SessionRecord::from_transcript(
            session_id.clone(),
            project_path,
            &doc.entries,
            file.size,
            fallback_time,
        );
        if let Some(start) = parse_timestamp(doc.raw.get("startTime")) {
            record.created_at = start;
        }
        if let Some(updated) = parse_timestamp(doc.raw.get("lastUpdated")) {
            record.modified_at = updated;
        }
        if let Some(summary) = doc.raw.get("summary").and_then(|v| v.as_str()) {
            if !summary.trim().is_empty() {
                record.first_message_preview = truncate_preview(summary);
            }
        }
        if record.first_message_preview.is_empty() {
            record.first_message_preview = format!("Session {}", short_id(&session_id));
        }

        LoadedSession {
            record,
            entries: doc.entries,
        }
    }
}

/// A session document with `entries[i]` decoded from `messages[i]`
#[derive(Debug)]
struct GeminiDocument {
    raw: Value,
    entries: Vec<TranscriptEntry>,
}

impl GeminiDocument {
    fn parse(content: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(content)?;
        let messages = raw
            .get("messages")
            .and_then(|v| v.as_array())
            .ok_or_else(|| StorageError::Parse("session document has no messages array".into()))?;

        let entries = messages
            .iter()
            .map(parse_message)
            .collect();
        Ok(Self { raw, entries })
    }

    fn session_id(&self, path: &Path) -> String {
        self.raw
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| super::file_stem(path))
            .unwrap_or_default()
    }
}

/// Every array element becomes an entry so indexes line up for deletion
fn parse_message(message: &Value) -> TranscriptEntry {
    let role = match message.get("type").and_then(|v| v.as_str()) {
        Some("user") => EntryRole::User,
        Some("gemini") | Some("model") => EntryRole::Assistant,
        _ => EntryRole::Other,
    };
    let uuid = message
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| digest_uuid(&message.to_string()));

    let mut entry = TranscriptEntry::new(uuid, role);
    entry.timestamp = parse_timestamp(message.get("timestamp"));

    for thought in message
        .get("thoughts")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let subject = thought.get("subject").and_then(|v| v.as_str()).unwrap_or("");
        let description = thought
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let text = [subject, description]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(": ");
        if !text.is_empty() {
            entry.parts.push(Part::Reasoning { text });
        }
    }

    match message.get("content") {
        Some(Value::String(text)) => entry.parts.push(Part::Text { text: text.clone() }),
        Some(Value::Array(items)) => {
            for text in items.iter().filter_map(|i| i.get("text").and_then(|t| t.as_str())) {
                entry.parts.push(Part::Text {
                    text: text.to_string(),
                });
            }
        }
        _ => {}
    }

    for call in message
        .get("toolCalls")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let Some(call_id) = call.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        entry.parts.push(Part::ToolCall {
            call_id: call_id.to_string(),
            name: call
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            input: call.get("args").cloned(),
        });
        if let Some(output) = tool_output(call) {
            entry.parts.push(Part::ToolResult {
                call_id: call_id.to_string(),
                output,
                is_error: call.get("status").and_then(|v| v.as_str()) == Some("error"),
            });
        }
    }

    if let Some(tokens) = message.get("tokens") {
        entry.usage = Some(TokenUsage {
            input: json_u64(tokens, "input"),
            output: json_u64(tokens, "output"),
            cache_read: json_u64(tokens, "cached"),
            cache_creation: 0,
        });
    }

    entry
}

/// `resultDisplay` when present, else the first function response's output
fn tool_output(call: &Value) -> Option<String> {
    if let Some(display) = call.get("resultDisplay").and_then(|v| v.as_str()) {
        return Some(display.to_string());
    }
    let response = call
        .get("result")?
        .as_array()?
        .first()?
        .get("functionResponse")?
        .get("response")?;
    Some(match response.get("output") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => response.to_string(),
    })
}

#[async_trait]
impl SessionProvider for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
    }

    fn name(&self) -> &str {
        "Gemini CLI"
    }

    fn description(&self) -> &str {
        "Gemini CLI (Google)"
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
        let Some(dir) = self.project_dir(fs, project_path).await? else {
            return Ok(vec![]);
        };

        let mut sessions = vec![];
        for file in fs
            .list_dir(&dir)
            .await?
            .into_iter()
            .filter(|e| !e.is_dir && is_session_file(&e.name))
        {
            match Self::read_document(fs, &file).await {
                Ok(doc) => sessions.push(Self::to_loaded(&file, doc, project_path)),
                Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                Err(err) => {
                    warn!(file = %file.path.display(), error = %err, "skipping session document")
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
        Ok(self
            .find_session(fs, session_id)
            .await?
            .map(|(file, doc)| Self::to_loaded(&file, doc, "")))
    }

    async fn locate_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<PathBuf>> {
        Ok(self
            .find_session(fs, session_id)
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
        let (file, doc) = self
            .find_session(fs, session_id)
            .await?
            .ok_or_else(not_found_message)?;
        let plan = plan_deletion(&doc.entries, user_message_uuid, fallback_content)
            .ok_or_else(not_found_message)?;

        let mut dropped: HashSet<usize> = plan.span.clone().collect();
        let mut strip: HashSet<usize> = HashSet::new();
        for &idx in plan.orphans.keys() {
            if plan.orphan_empties_entry(&doc.entries, idx) {
                dropped.insert(idx);
            } else {
                strip.insert(idx);
            }
        }

        let mut raw = doc.raw;
        let messages = raw
            .get_mut("messages")
            .and_then(|v| v.as_array_mut())
            .ok_or_else(|| StorageError::Parse("session document has no messages array".into()))?;

        let kept: Vec<Value> = std::mem::take(messages)
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !dropped.contains(idx))
            .map(|(idx, mut message)| {
                if strip.contains(&idx) {
                    if let Some(calls) = message.get_mut("toolCalls").and_then(|v| v.as_array_mut()) {
                        calls.retain(|call| {
                            !call
                                .get("id")
                                .and_then(|v| v.as_str())
                                .is_some_and(|id| plan.deleted_calls.contains(id))
                        });
                    }
                }
                message
            })
            .collect();
        *messages = kept;

        fs.write_atomic(&file.path, &serde_json::to_string_pretty(&raw)?)
            .await?;
        Ok(plan.span.len() + plan.orphan_part_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageWindow, SearchMode};
    use serde_json::json;
    use tempfile::TempDir;

    fn document() -> Value {
        json!({
            "sessionId": "3b44bc68-1111-2222-3333-444455556666",
            "startTime": "2025-03-01T08:00:00Z",
            "lastUpdated": "2025-03-01T08:05:00Z",
            "messages": [
                {"id": "m1", "type": "user", "timestamp": "2025-03-01T08:00:00Z", "content": "Explain the cache"},
                {"id": "m2", "type": "gemini", "timestamp": "2025-03-01T08:00:10Z", "content": "The cache stores pages",
                 "thoughts": [{"subject": "Reading", "description": "cache.rs"}],
                 "toolCalls": [{"id": "read-1", "name": "read_file", "args": {"path": "cache.rs"}, "resultDisplay": "struct Cache"}],
                 "tokens": {"input": 120, "output": 30, "cached": 40}},
                {"id": "m3", "type": "info", "timestamp": "2025-03-01T08:00:20Z", "content": "Model switched"},
                {"id": "m4", "type": "user", "timestamp": "2025-03-01T08:01:00Z", "content": "And eviction?"},
                {"id": "m5", "type": "gemini", "timestamp": "2025-03-01T08:01:30Z", "content": "LRU eviction"}
            ]
        })
    }

    fn write_session(dir: &Path, doc: &Value) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("session-2025-03-01T08-00-3b44bc68.json"),
            serde_json::to_string_pretty(doc).unwrap(),
        )
        .unwrap();
    }

    fn provider(temp: &TempDir) -> GeminiProvider {
        GeminiProvider::new(Some(temp.path().to_path_buf()), Access::default())
    }

    #[test]
    fn test_project_hash_is_sha256_hex() {
        let hash = project_hash("/work/app");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, project_hash("/work/app/"));
    }

    #[tokio::test]
    async fn test_project_key_resolution_order() {
        let temp = TempDir::new().unwrap();
        let provider = provider(&temp);

        write_session(&temp.path().join(project_hash("/work/app")), &document());
        let dir = provider.project_dir(&crate::access::LocalFs, "/work/app").await.unwrap();
        assert_eq!(dir, Some(temp.path().join(project_hash("/work/app"))));

        let marked = temp.path().join("renamed");
        std::fs::create_dir_all(&marked).unwrap();
        std::fs::write(marked.join(PROJECT_ROOT_MARKER), "/work/other\n").unwrap();
        let dir = provider.project_dir(&crate::access::LocalFs, "/work/other").await.unwrap();
        assert_eq!(dir, Some(marked));

        std::fs::create_dir_all(temp.path().join("app")).unwrap();
        let dir = provider.project_dir(&crate::access::LocalFs, "/work/app").await.unwrap();
        assert_eq!(dir, Some(temp.path().join("app")));

        let dir = provider.project_dir(&crate::access::LocalFs, "/work/none").await.unwrap();
        assert!(dir.is_none());
    }

    #[tokio::test]
    async fn test_list_read_search() {
        let temp = TempDir::new().unwrap();
        write_session(&temp.path().join("app"), &document());
        let provider = provider(&temp);

        let sessions = provider.list_sessions("/work/app", None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.message_count, 4);
        assert_eq!(s.first_message_preview, "Explain the cache");
        assert_eq!(s.input_tokens, Some(120));
        assert_eq!(s.cache_read_tokens, Some(40));
        assert_eq!(s.modified_at.to_rfc3339(), "2025-03-01T08:05:00+00:00");

        let page = provider
            .read_session_messages(&s.session_id, MessageWindow::default(), None)
            .await
            .unwrap();
        assert_eq!(page.messages[1].tool_uses[0].output.as_deref(), Some("struct Cache"));

        let hits = provider
            .search_sessions("/work/app", "eviction", SearchMode::Assistant, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].match_count, 1);
    }

    #[tokio::test]
    async fn test_preview_prefers_summary_then_placeholder() {
        let temp = TempDir::new().unwrap();
        let mut doc = document();
        doc["summary"] = json!("Cache walkthrough");
        write_session(&temp.path().join("app"), &doc);
        let provider = provider(&temp);
        let sessions = provider.list_sessions("/work/app", None).await.unwrap();
        assert_eq!(sessions[0].first_message_preview, "Cache walkthrough");

        let empty = json!({"sessionId": "abcdef123456", "messages": []});
        let dir = temp.path().join("empty");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("session-x-abcdef12.json"), empty.to_string()).unwrap();
        let sessions = provider.list_sessions("/work/empty", None).await.unwrap();
        assert_eq!(sessions[0].first_message_preview, "Session abcdef12");
    }

    #[tokio::test]
    async fn test_delete_exchange_rewrites_document() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("app");
        write_session(&dir, &document());
        let provider = provider(&temp);
        let id = "3b44bc68-1111-2222-3333-444455556666";

        let outcome = provider.delete_message_pair(id, "m1", None, None).await;
        assert!(outcome.success);
        assert_eq!(outcome.records_removed, Some(3));

        let doc: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.join("session-2025-03-01T08-00-3b44bc68.json")).unwrap(),
        )
        .unwrap();
        let ids: Vec<&str> = doc["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["m4", "m5"]);

        let missing = provider.delete_message_pair(id, "missing-uuid", None, None).await;
        assert!(!missing.success);
        assert_eq!(missing.error.as_deref(), Some("User message not found"));
    }

    #[tokio::test]
    async fn test_messages_without_ids_keep_their_ids_across_deletes() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("app");
        let mut doc = document();
        for message in doc["messages"].as_array_mut().unwrap() {
            message.as_object_mut().unwrap().remove("id");
        }
        write_session(&dir, &doc);
        let provider = provider(&temp);
        let id = "3b44bc68-1111-2222-3333-444455556666";

        let before = provider
            .read_session_messages(id, MessageWindow::default(), None)
            .await
            .unwrap();
        let first_user = before.messages[0].uuid.clone();
        let later: Vec<String> = before.messages[2..].iter().map(|m| m.uuid.clone()).collect();
        assert!(!first_user.starts_with("message-"));

        let outcome = provider.delete_message_pair(id, &first_user, None, None).await;
        assert!(outcome.success);

        let after = provider
            .read_session_messages(id, MessageWindow::default(), None)
            .await
            .unwrap();
        let remaining: Vec<String> = after.messages.iter().map(|m| m.uuid.clone()).collect();
        assert_eq!(remaining, later);
    }
}
