//! OpenCode provider
//!
//! OpenCode migrated mid-lifecycle from a tree of per-entity JSON files to an
//! embedded SQLite database, and both generations may hold sessions for the
//! same project:
//!   - ~/.local/share/opencode/opencode.db - tables project, session, message, part
//!   - ~/.local/share/opencode/storage/
//!     - project/{project_id}.json - Project worktree
//!     - session/{project_id}/ses_*.json - Session metadata
//!     - message/{session_id}/msg_*.json - Message metadata
//!     - part/{message_id}/prt_*.json - Message content parts
//!
//! The database is authoritative. Listings merge both generations by id.

mod db;
mod legacy;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;

use super::{resolve_root, LoadedSession, SessionProvider};
use crate::access::{Access, SessionFs};
use crate::error::{Result, StorageError};
use crate::model::{EntryRole, Part, SessionRecord, TokenUsage, TranscriptEntry};
use crate::reconcile::merge_by_id;
use legacy::LegacyStore;

const HOME_ROOT: &str = ".local/share/opencode";
const DB_FILE: &str = "opencode.db";
const STORAGE_DIR: &str = "storage";

// ============================================
// SHARED RECORD SHAPES
// ============================================

/// Message metadata: a `message.data` column or a legacy message file
#[derive(Debug, Default, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    time: Option<MessageTime>,
    #[serde(default)]
    tokens: Option<TokenInfo>,
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageTime {
    created: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    input: u64,
    #[serde(default)]
    output: u64,
    #[serde(default)]
    cache: Option<CacheInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct CacheInfo {
    #[serde(default)]
    read: u64,
    #[serde(default)]
    write: u64,
}

/// Content part: a `part.data` column or a legacy part file
#[derive(Debug, Default, Deserialize)]
struct PartInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    part_type: String,
    #[serde(default)]
    text: Option<String>,
    /// Injected by the client rather than typed by the user
    #[serde(default)]
    synthetic: bool,
    #[serde(default)]
    tool: Option<String>,
    #[serde(rename = "callID", default)]
    call_id: Option<String>,
    #[serde(default)]
    state: Option<ToolState>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolState {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

impl PartInfo {
    fn parts(&self) -> Vec<Part> {
        match self.part_type.as_str() {
            "text" if !self.synthetic => self
                .text
                .clone()
                .map(|text| vec![Part::Text { text }])
                .unwrap_or_default(),
            "reasoning" => self
                .text
                .clone()
                .map(|text| vec![Part::Reasoning { text }])
                .unwrap_or_default(),
            "tool" => {
                let Some(call_id) = self.call_id.clone() else {
                    return vec![];
                };
                let state = self.state.as_ref();
                let mut parts = vec![Part::ToolCall {
                    call_id: call_id.clone(),
                    name: self.tool.clone().unwrap_or_else(|| "unknown".to_string()),
                    input: state.and_then(|s| s.input.clone()),
                }];
                match state.and_then(|s| s.status.as_deref()) {
                    Some("completed") => parts.push(Part::ToolResult {
                        call_id,
                        output: state.and_then(|s| s.output.clone()).unwrap_or_default(),
                        is_error: false,
                    }),
                    Some("error") => parts.push(Part::ToolResult {
                        call_id,
                        output: state.and_then(|s| s.error.clone()).unwrap_or_default(),
                        is_error: true,
                    }),
                    _ => {}
                }
                parts
            }
            _ => vec![],
        }
    }
}

/// One message and its parts as a transcript entry
fn decode_entry(message_id: &str, info: &MessageInfo, parts: &[PartInfo]) -> TranscriptEntry {
    let role = match info.role.as_deref() {
        Some("user") => EntryRole::User,
        Some("assistant") => EntryRole::Assistant,
        _ => EntryRole::Other,
    };
    let mut entry = TranscriptEntry::new(message_id, role);
    entry.timestamp = info
        .time
        .as_ref()
        .and_then(|t| t.created)
        .and_then(ms_to_datetime);
    entry.parts = parts.iter().flat_map(PartInfo::parts).collect();
    entry.usage = info.tokens.as_ref().map(|t| TokenUsage {
        input: t.input,
        output: t.output,
        cache_read: t.cache.as_ref().map_or(0, |c| c.read),
        cache_creation: t.cache.as_ref().map_or(0, |c| c.write),
    });
    entry.cost_usd = info.cost;
    entry
}

/// Session-level fields both generations carry
#[derive(Debug, Clone, Default)]
struct SessionHeader {
    id: String,
    directory: Option<String>,
    created: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
}

impl SessionHeader {
    fn into_loaded(
        self,
        entries: Vec<TranscriptEntry>,
        size_bytes: u64,
        project_path: &str,
    ) -> LoadedSession {
        let fallback_time = self.updated.or(self.created).unwrap_or_default();
        let project = self
            .directory
            .clone()
            .unwrap_or_else(|| project_path.to_string());

        let mut record: SessionRecord =
            SessionRecord::from_transcript(self.id, project, &entries, size_bytes, fallback_time);
        if let Some(created) = self.created {
            record.created_at = created;
        }
        if let Some(updated) = self.updated {
            record.modified_at = updated;
        }
        LoadedSession { record, entries }
    }
}

// ============================================
// PROVIDER
// ============================================

pub struct OpenCodeProvider {
    base_path: Option<PathBuf>,
    access: Access,
}

impl OpenCodeProvider {
    pub fn new(custom_path: Option<PathBuf>, access: Access) -> Self {
        Self {
            base_path: custom_path,
            access,
        }
    }

    async fn root(&self, fs: &dyn SessionFs) -> Result<PathBuf> {
        resolve_root(fs, self.base_path.as_deref(), HOME_ROOT).await
    }

    async fn legacy(&self, fs: &dyn SessionFs) -> Result<LegacyStore> {
        Ok(LegacyStore::new(self.root(fs).await?.join(STORAGE_DIR)))
    }

    /// Database sessions, or an empty listing when the database cannot serve
    async fn database_sessions(
        &self,
        fs: &dyn SessionFs,
        project_path: &str,
    ) -> Result<Vec<LoadedSession>> {
        let db_path = self.root(fs).await?.join(DB_FILE);
        fallback_on_db_error(db::scan_project(fs, &db_path, project_path).await)
    }
}

/// Missing database, missing tables and unreadable files all mean "use the legacy tree"
fn fallback_on_db_error<T: Default>(result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err @ StorageError::RemoteTransport(_)) => Err(err),
        Err(err) => {
            debug!(error = %err, "database unavailable, using legacy storage");
            Ok(T::default())
        }
    }
}

#[async_trait]
impl SessionProvider for OpenCodeProvider {
    fn id(&self) -> &str {
        "opencode"
    }

    fn name(&self) -> &str {
        "OpenCode"
    }

    fn description(&self) -> &str {
        "OpenCode CLI (multi-provider)"
    }

    fn access(&self) -> &Access {
        &self.access
    }

    async fn is_available(&self, fs: &dyn SessionFs) -> bool {
        let Ok(root) = self.root(fs).await else {
            return false;
        };
        fs.exists(&root.join(DB_FILE)).await.unwrap_or(false)
            || fs.exists(&root.join(STORAGE_DIR)).await.unwrap_or(false)
    }

    async fn scan_project(
        &self,
        fs: &dyn SessionFs,
        project_path: &str,
    ) -> Result<Vec<LoadedSession>> {
        let database = self.database_sessions(fs, project_path).await?;
        let legacy = self.legacy(fs).await?.scan_project(fs, project_path).await?;

        if database.is_empty() {
            return Ok(legacy.into_iter().map(|s| s.loaded).collect());
        }
        debug!(
            database = database.len(),
            legacy = legacy.len(),
            "merging database and legacy sessions"
        );
        let legacy: Vec<LoadedSession> = legacy.into_iter().map(|s| s.loaded).collect();
        Ok(merge_by_id(database, legacy, |s| s.record.session_id.as_str()))
    }

    async fn load_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<LoadedSession>> {
        let db_path = self.root(fs).await?.join(DB_FILE);
        if let Some(session) =
            fallback_on_db_error(db::load_session(fs, &db_path, session_id).await)?
        {
            return Ok(Some(session));
        }
        Ok(self
            .legacy(fs)
            .await?
            .load_session(fs, session_id)
            .await?
            .map(|s| s.loaded))
    }

    async fn locate_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<PathBuf>> {
        // A database-backed session has no file of its own
        let db_path = self.root(fs).await?.join(DB_FILE);
        if fallback_on_db_error(db::load_session(fs, &db_path, session_id).await)?.is_some() {
            return Ok(None);
        }
        Ok(self
            .legacy(fs)
            .await?
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
        let db_path = self.root(fs).await?.join(DB_FILE);
        if fallback_on_db_error(db::load_session(fs, &db_path, session_id).await)?.is_some() {
            return Err(StorageError::UnsupportedOperation(
                "Deleting messages from database-backed OpenCode sessions is not supported"
                    .to_string(),
            ));
        }
        self.legacy(fs)
            .await?
            .delete_exchange(fs, session_id, user_message_uuid, fallback_content)
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{create_database, create_legacy};
    use super::*;
    use crate::access::testing::{has_binary, loopback_access, loopback_host, LocalShell};
    use crate::model::MessageWindow;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn provider(temp: &TempDir) -> OpenCodeProvider {
        OpenCodeProvider::new(Some(temp.path().to_path_buf()), Access::default())
    }

    #[tokio::test]
    async fn test_database_session_totals() {
        let temp = TempDir::new().unwrap();
        create_database(temp.path());

        let sessions = provider(&temp).list_sessions("/test/project", None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.session_id, "ses_001");
        assert_eq!(s.input_tokens, Some(100));
        assert_eq!(s.output_tokens, Some(500));
        assert_eq!(s.cost_usd, Some(0.01));
        assert_eq!(s.message_count, 2);
        assert_eq!(s.duration_seconds, Some(60));
    }

    #[tokio::test]
    async fn test_token_only_messages_still_count() {
        let temp = TempDir::new().unwrap();
        create_database(temp.path());
        rusqlite::Connection::open(temp.path().join("opencode.db"))
            .unwrap()
            .execute_batch("DELETE FROM part")
            .unwrap();

        let sessions = provider(&temp).list_sessions("/test/project", None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.message_count, 2);
        assert_eq!(s.duration_seconds, Some(60));
        assert_eq!(s.input_tokens, Some(100));
        assert_eq!(s.output_tokens, Some(500));
        assert_eq!(s.cost_usd, Some(0.01));
    }

    #[tokio::test]
    async fn test_merge_prefers_database_values() {
        let temp = TempDir::new().unwrap();
        create_database(temp.path());
        create_legacy(temp.path());

        let sessions = provider(&temp).list_sessions("/test/project", None).await.unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["ses_001", "ses_legacy"]);
        assert_eq!(sessions[0].input_tokens, Some(100));
        assert_eq!(sessions[0].first_message_preview, "What's in the project?");
    }

    #[tokio::test]
    async fn test_legacy_only_without_database() {
        let temp = TempDir::new().unwrap();
        create_legacy(temp.path());
        let provider = provider(&temp);

        let sessions = provider.list_sessions("/test/project", None).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(provider.list_sessions("/elsewhere", None).await.unwrap().is_empty());

        let path = provider.get_session_path("ses_legacy", None).await.unwrap();
        assert!(path.unwrap().ends_with("session/proj_abc/ses_legacy.json"));
    }

    #[tokio::test]
    async fn test_database_without_tables_falls_back() {
        let temp = TempDir::new().unwrap();
        create_legacy(temp.path());
        rusqlite::Connection::open(temp.path().join("opencode.db"))
            .unwrap()
            .execute_batch("CREATE TABLE unrelated (x INTEGER)")
            .unwrap();

        let sessions = provider(&temp).list_sessions("/test/project", None).await.unwrap();
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_database_session_path_and_delete_refused() {
        let temp = TempDir::new().unwrap();
        create_database(temp.path());
        let provider = provider(&temp);

        assert_eq!(provider.get_session_path("ses_001", None).await.unwrap(), None);
        let page = provider
            .read_session_messages("ses_001", MessageWindow::default(), None)
            .await
            .unwrap();
        assert_eq!(page.total, 2);

        let outcome = provider.delete_message_pair("ses_001", "msg_001", None, None).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not supported"));
    }

    /// A `$PATH` holding the shell tools remote access needs, and no `sqlite3`
    fn path_without_sqlite3(dir: &Path) -> PathBuf {
        let bin = dir.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let search = std::env::var_os("PATH").unwrap_or_default();
        for tool in ["find", "cat", "mv", "rm"] {
            let found = std::env::split_paths(&search)
                .map(|p| p.join(tool))
                .find(|p| p.is_file())
                .unwrap();
            std::os::unix::fs::symlink(found, bin.join(tool)).unwrap();
        }
        bin
    }

    #[tokio::test]
    async fn test_remote_legacy_list_and_delete() {
        let home = TempDir::new().unwrap();
        let root = home.path().join(HOME_ROOT);
        create_legacy(&root);
        let provider = OpenCodeProvider::new(None, loopback_access(home.path()));
        let host = loopback_host();

        let sessions = provider.list_sessions("/test/project", Some(&host)).await.unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["ses_legacy", "ses_001"]);

        let outcome = provider
            .delete_message_pair("ses_legacy", "msg_a1", None, Some(&host))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.records_removed, Some(3));
        let storage = root.join(STORAGE_DIR);
        assert!(!storage.join("message/ses_legacy/msg_a1.json").exists());
        assert!(!storage.join("part/msg_a4/prt_a6.json").exists());
        assert!(storage.join("part/msg_a4/prt_a5.json").exists());
    }

    #[tokio::test]
    async fn test_remote_without_sqlite3_uses_legacy_tree() {
        let home = TempDir::new().unwrap();
        let root = home.path().join(HOME_ROOT);
        create_database(&root);
        create_legacy(&root);
        let shell = LocalShell {
            home: home.path().to_path_buf(),
            path: Some(path_without_sqlite3(home.path())),
        };
        let provider = OpenCodeProvider::new(None, Access::new(Arc::new(shell)));

        let sessions = provider
            .list_sessions("/test/project", Some(&loopback_host()))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 2);
        // the stale legacy copy, since the database could not be queried
        let ses_001 = sessions.iter().find(|s| s.session_id == "ses_001").unwrap();
        assert_eq!(ses_001.input_tokens, Some(9999));
    }

    #[tokio::test]
    async fn test_remote_database_listing() {
        if !has_binary("sqlite3") {
            return;
        }
        let home = TempDir::new().unwrap();
        create_database(&home.path().join(HOME_ROOT));
        let provider = OpenCodeProvider::new(None, loopback_access(home.path()));
        let host = loopback_host();

        let sessions = provider.list_sessions("/test/project", Some(&host)).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "ses_001");
        assert_eq!(sessions[0].input_tokens, Some(100));
        assert_eq!(sessions[0].message_count, 2);

        let page = provider
            .read_session_messages("ses_001", MessageWindow::default(), Some(&host))
            .await
            .unwrap();
        assert_eq!(page.total, 2);
    }
}
