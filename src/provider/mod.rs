//! Session provider contract and registry
//!
//! One provider per agent family:
//! - `claude`: Claude Code JSONL logs, one directory per project
//! - `codex`: Codex rollout JSONL logs in a dated tree, matched by git remote
//! - `gemini`: Gemini CLI JSON documents, one directory per project
//! - `opencode`: OpenCode SQLite database with the legacy per-entity JSON tree as fallback

mod claudecode;
mod codex;
mod gemini;
mod opencode;

pub use claudecode::{encode_project_dir, ClaudeCodeProvider};
pub use codex::CodexProvider;
pub use gemini::{project_hash, GeminiProvider};
pub use opencode::OpenCodeProvider;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::access::{Access, RemoteHost, SessionFs};
use crate::error::{Result, StorageError};
use crate::model::{
    build_messages, DeleteOutcome, Message, MessagePage, MessageWindow, PageRequest, SearchHit,
    SearchMode, SessionPage, SessionRecord, TranscriptEntry,
};
use crate::mutation::USER_MESSAGE_NOT_FOUND;
use crate::reconcile::sort_newest_first;
use crate::{search, Config};

/// A session decoded from storage: its summary record and every underlying entry
#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub record: SessionRecord,
    pub entries: Vec<TranscriptEntry>,
}

/// Storage backend every agent family implements.
///
/// Adapters implement the `scan_*` / `load_*` / `remove_*` primitives against a
/// [`SessionFs`]; the caller-facing operations (`list_sessions`,
/// `read_session_messages`, ...) are provided on top of them and apply the
/// shared error policy: missing or malformed data degrades to empty results,
/// remote transport failures surface as errors.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Registry key: "claude", "codex", "gemini", "opencode"
    fn id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn access(&self) -> &Access;

    /// Check if this provider's data root exists
    async fn is_available(&self, fs: &dyn SessionFs) -> bool;

    /// Every session belonging to `project_path`, fully decoded
    async fn scan_project(
        &self,
        fs: &dyn SessionFs,
        project_path: &str,
    ) -> Result<Vec<LoadedSession>>;

    /// One session by id, or `None` when no such session exists
    async fn load_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<LoadedSession>>;

    /// On-disk locator, `None` when no single file backs the session
    async fn locate_session(&self, fs: &dyn SessionFs, session_id: &str)
        -> Result<Option<PathBuf>>;

    /// Remove an exchange; returns the number of underlying records removed
    async fn remove_exchange(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
        user_message_uuid: &str,
        fallback_content: Option<&str>,
    ) -> Result<usize>;

    // ============================================
    // CALLER-FACING CONTRACT
    // ============================================

    /// Sessions of a project, newest first
    async fn list_sessions(
        &self,
        project_path: &str,
        remote: Option<&RemoteHost>,
    ) -> Result<Vec<SessionRecord>> {
        let fs = self.access().for_host(remote);
        let sessions = degrade(self.id(), "list", self.scan_project(fs.as_ref(), project_path).await)?;

        let mut records: Vec<SessionRecord> = sessions.into_iter().map(|s| s.record).collect();
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn list_sessions_paginated(
        &self,
        project_path: &str,
        page: &PageRequest,
        remote: Option<&RemoteHost>,
    ) -> Result<SessionPage> {
        let sessions = self.list_sessions(project_path, remote).await?;
        Ok(paginate(sessions, page))
    }

    /// Tail-relative window of a session's messages
    async fn read_session_messages(
        &self,
        session_id: &str,
        window: MessageWindow,
        remote: Option<&RemoteHost>,
    ) -> Result<MessagePage> {
        let fs = self.access().for_host(remote);
        let loaded = degrade(self.id(), "read", self.load_session(fs.as_ref(), session_id).await)?;

        Ok(match loaded {
            Some(session) => tail_window(build_messages(&session.entries), window),
            None => MessagePage::default(),
        })
    }

    async fn search_sessions(
        &self,
        project_path: &str,
        query: &str,
        mode: SearchMode,
        remote: Option<&RemoteHost>,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(vec![]);
        }
        let fs = self.access().for_host(remote);
        let sessions =
            degrade(self.id(), "search", self.scan_project(fs.as_ref(), project_path).await)?;

        let mut hits: Vec<SearchHit> = sessions
            .iter()
            .filter_map(|session| {
                let messages = build_messages(&session.entries);
                search::match_session(&session.record, &messages, query, mode)
            })
            .collect();
        search::rank(&mut hits);
        Ok(hits)
    }

    async fn get_session_path(
        &self,
        session_id: &str,
        remote: Option<&RemoteHost>,
    ) -> Result<Option<PathBuf>> {
        let fs = self.access().for_host(remote);
        degrade(self.id(), "locate", self.locate_session(fs.as_ref(), session_id).await)
    }

    /// Delete a user message and every reply up to the next user message
    async fn delete_message_pair(
        &self,
        session_id: &str,
        user_message_uuid: &str,
        fallback_content: Option<&str>,
        remote: Option<&RemoteHost>,
    ) -> DeleteOutcome {
        let fs = self.access().for_host(remote);
        match self
            .remove_exchange(fs.as_ref(), session_id, user_message_uuid, fallback_content)
            .await
        {
            Ok(count) => DeleteOutcome::removed(count),
            Err(err) => {
                warn!(provider = self.id(), session_id, error = %err, "delete failed");
                DeleteOutcome::failed(err.to_string())
            }
        }
    }
}

/// Apply the read-path error policy: transport errors propagate, anything else
/// is logged and replaced by an empty value
fn degrade<T: Default>(provider: &str, op: &str, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err @ StorageError::RemoteTransport(_)) => Err(err),
        Err(err) if err.is_not_found() => {
            debug!(provider, op, error = %err, "nothing to read");
            Ok(T::default())
        }
        Err(err) => {
            warn!(provider, op, error = %err, "read degraded to empty result");
            Ok(T::default())
        }
    }
}

/// Slice a newest-first listing after the cursor session
pub fn paginate(sessions: Vec<SessionRecord>, page: &PageRequest) -> SessionPage {
    let start = match &page.cursor {
        Some(cursor) => match sessions.iter().position(|s| &s.session_id == cursor) {
            Some(idx) => idx + 1,
            None => {
                debug!(cursor, "cursor session no longer listed, restarting from the top");
                0
            }
        },
        None => 0,
    };

    let limit = page.limit.max(1);
    let start = start.min(sessions.len());
    let end = (start + limit).min(sessions.len());
    let has_more = end < sessions.len();
    let slice: Vec<SessionRecord> = sessions[start..end].to_vec();
    let next_cursor = if has_more {
        slice.last().map(|s| s.session_id.clone())
    } else {
        None
    };

    SessionPage {
        sessions: slice,
        has_more,
        next_cursor,
    }
}

/// Window counted back from the newest message
pub fn tail_window(messages: Vec<Message>, window: MessageWindow) -> MessagePage {
    let total = messages.len();
    let end = total.saturating_sub(window.offset);
    let start = end.saturating_sub(window.limit);

    MessagePage {
        messages: messages[start..end].to_vec(),
        total,
        has_more: start > 0,
    }
}

/// A recorded working directory belongs to a project when it is the project
/// directory itself or a subdirectory of it
pub fn path_matches(recorded: &str, project_path: &str) -> bool {
    let recorded = recorded.trim_end_matches('/');
    let project = project_path.trim_end_matches('/');
    if project.is_empty() {
        return recorded.is_empty();
    }
    recorded == project
        || recorded
            .strip_prefix(project)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Data root of a provider: the configured override for local access, else
/// `$HOME/<home_relative>` on whichever host `fs` points at
pub(crate) async fn resolve_root(
    fs: &dyn SessionFs,
    custom: Option<&Path>,
    home_relative: &str,
) -> Result<PathBuf> {
    if fs.is_local() {
        if let Some(custom) = custom {
            return Ok(custom.to_path_buf());
        }
    }
    Ok(fs.home_dir().await?.join(home_relative))
}

pub(crate) fn not_found_message() -> StorageError {
    StorageError::NotFound(USER_MESSAGE_NOT_FOUND.to_string())
}

/// RFC 3339 string or epoch milliseconds
pub(crate) fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Deterministic id for records that carry none: a digest of the raw record
pub(crate) fn digest_uuid(raw: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.trim().as_bytes()).to_string()
}

/// Re-join kept lines of a line-delimited log
pub(crate) fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Number from a JSON field as u64, tolerating floats and absent keys
pub(crate) fn json_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
        .unwrap_or(0)
}

/// File stem of a session file, which is the session id for the log formats
pub(crate) fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Registry of providers keyed by agent id
pub struct ProviderRegistry {
    providers: Vec<Box<dyn SessionProvider>>,
}

impl ProviderRegistry {
    pub fn new(config: &Config) -> Self {
        let access = Access::new(config.remote_shell());
        let mut registry = Self { providers: vec![] };

        if config.is_provider_enabled("claude") {
            registry.register(Box::new(ClaudeCodeProvider::new(
                config.provider_path("claude"),
                access.clone(),
            )));
        }

        if config.is_provider_enabled("codex") {
            registry.register(Box::new(CodexProvider::new(
                config.provider_path("codex"),
                access.clone(),
            )));
        }

        if config.is_provider_enabled("gemini") {
            registry.register(Box::new(GeminiProvider::new(
                config.provider_path("gemini"),
                access.clone(),
            )));
        }

        if config.is_provider_enabled("opencode") {
            registry.register(Box::new(OpenCodeProvider::new(
                config.provider_path("opencode"),
                access,
            )));
        }

        registry
    }

    pub fn register(&mut self, provider: Box<dyn SessionProvider>) {
        self.providers.push(provider);
    }

    pub fn get(&self, id: &str) -> Option<&dyn SessionProvider> {
        self.providers
            .iter()
            .find(|p| p.id() == id)
            .map(|p| p.as_ref())
    }

    pub fn all(&self) -> Vec<&dyn SessionProvider> {
        self.providers.iter().map(|p| p.as_ref()).collect()
    }

    /// Providers whose data root exists on the given host
    pub async fn available(&self, remote: Option<&RemoteHost>) -> Vec<&dyn SessionProvider> {
        let mut available = vec![];
        for provider in &self.providers {
            let fs = provider.access().for_host(remote);
            if provider.is_available(fs.as_ref()).await {
                available.push(provider.as_ref());
            }
        }
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(id: &str, secs: i64) -> SessionRecord {
        let ts = Utc.timestamp_opt(secs, 0).unwrap();
        SessionRecord {
            session_id: id.to_string(),
            project_path: "/p".to_string(),
            created_at: ts,
            modified_at: ts,
            first_message_preview: String::new(),
            message_count: 0,
            size_bytes: 0,
            cost_usd: None,
            input_tokens: None,
            output_tokens: None,
            cache_read_tokens: None,
            cache_creation_tokens: None,
            duration_seconds: None,
            session_name: None,
            origin: None,
        }
    }

    fn message(n: usize) -> Message {
        Message {
            uuid: format!("m{n}"),
            role: crate::model::MessageRole::User,
            content: format!("message {n}"),
            timestamp: None,
            tool_uses: vec![],
        }
    }

    #[test]
    fn test_pages_concatenate_to_full_listing() {
        let listing: Vec<SessionRecord> = (0..7).map(|i| record(&format!("s{i}"), 100 - i)).collect();

        let mut collected = vec![];
        let mut cursor = None;
        loop {
            let page = paginate(
                listing.clone(),
                &PageRequest {
                    cursor: cursor.clone(),
                    limit: 3,
                },
            );
            collected.extend(page.sessions.iter().map(|s| s.session_id.clone()));
            if !page.has_more {
                assert!(page.next_cursor.is_none());
                break;
            }
            cursor = page.next_cursor;
        }

        let expected: Vec<String> = listing.iter().map(|s| s.session_id.clone()).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn test_tail_window() {
        let messages: Vec<Message> = (0..10).map(message).collect();

        let newest = tail_window(messages.clone(), MessageWindow { offset: 0, limit: 4 });
        assert_eq!(newest.total, 10);
        assert!(newest.has_more);
        assert_eq!(newest.messages.first().unwrap().uuid, "m6");
        assert_eq!(newest.messages.last().unwrap().uuid, "m9");

        let older = tail_window(messages.clone(), MessageWindow { offset: 8, limit: 4 });
        assert!(!older.has_more);
        assert_eq!(older.messages.len(), 2);
        assert_eq!(older.messages[0].uuid, "m0");

        let past_end = tail_window(messages, MessageWindow { offset: 20, limit: 4 });
        assert!(past_end.messages.is_empty());
        assert!(!past_end.has_more);
    }

    #[test]
    fn test_path_matches() {
        assert!(path_matches("/work/app", "/work/app"));
        assert!(path_matches("/work/app/src", "/work/app/"));
        assert!(!path_matches("/work/application", "/work/app"));
        assert!(!path_matches("/work", "/work/app"));
    }
}
