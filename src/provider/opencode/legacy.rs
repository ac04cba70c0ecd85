//! Legacy generation: per-entity JSON files under `storage/`

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{decode_entry, ms_to_datetime, MessageInfo, PartInfo, SessionHeader};
use crate::access::{DirEntry, SessionFs};
use crate::error::{Result, StorageError};
use crate::mutation::plan_deletion;
use crate::provider::{file_stem, not_found_message, path_matches, LoadedSession};

#[derive(Debug, Deserialize)]
struct ProjectFile {
    id: String,
    #[serde(default)]
    worktree: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionFile {
    id: String,
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    time: Option<SessionTime>,
}

#[derive(Debug, Deserialize)]
struct SessionTime {
    created: Option<i64>,
    updated: Option<i64>,
}

/// A message file and the part files beneath it
#[derive(Debug)]
struct MessageFiles {
    id: String,
    path: PathBuf,
    /// Part file paths with the tool-call id each carries
    parts: Vec<(PathBuf, Option<String>)>,
}

/// Loaded session plus the files backing each entry; `messages[i]` backs `loaded.entries[i]`
#[derive(Debug)]
pub(super) struct LegacySession {
    pub loaded: LoadedSession,
    messages: Vec<MessageFiles>,
}

pub(super) struct LegacyStore {
    storage: PathBuf,
}

impl LegacyStore {
    pub fn new(storage: PathBuf) -> Self {
        Self { storage }
    }

    fn project_dir(&self) -> PathBuf {
        self.storage.join("project")
    }

    fn session_dir(&self) -> PathBuf {
        self.storage.join("session")
    }

    fn message_dir(&self) -> PathBuf {
        self.storage.join("message")
    }

    fn part_dir(&self) -> PathBuf {
        self.storage.join("part")
    }

    /// Ids of projects whose worktree is `project_path`
    async fn project_ids(&self, fs: &dyn SessionFs, project_path: &str) -> Result<Vec<String>> {
        let mut ids = vec![];
        for file in json_files(fs, &self.project_dir()).await? {
            let project: ProjectFile = match read_json(fs, &file.path).await {
                Ok(project) => project,
                Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                Err(err) => {
                    debug!(file = %file.path.display(), error = %err, "skipping project file");
                    continue;
                }
            };
            if project
                .worktree
                .as_deref()
                .is_some_and(|w| w.trim_end_matches('/') == project_path.trim_end_matches('/'))
            {
                ids.push(project.id);
            }
        }
        Ok(ids)
    }

    pub async fn scan_project(
        &self,
        fs: &dyn SessionFs,
        project_path: &str,
    ) -> Result<Vec<LegacySession>> {
        let project_ids = self.project_ids(fs, project_path).await?;
        let mut sessions = vec![];

        for project_id in &project_ids {
            for file in json_files(fs, &self.session_dir().join(project_id)).await? {
                match self.load_session_file(fs, &file, project_path).await {
                    Ok(session) => sessions.push(session),
                    Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                    Err(err) => {
                        warn!(file = %file.path.display(), error = %err, "skipping session file")
                    }
                }
            }
        }

        // Sessions not tied to a project row, matched by recorded directory
        for file in json_files(fs, &self.session_dir().join("global")).await? {
            match self.load_session_file(fs, &file, project_path).await {
                Ok(session)
                    if path_matches(&session.loaded.record.project_path, project_path) =>
                {
                    sessions.push(session)
                }
                Ok(_) => {}
                Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                Err(err) => debug!(file = %file.path.display(), error = %err, "skipping session file"),
            }
        }

        Ok(sessions)
    }

    pub async fn find_session_file(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<DirEntry>> {
        let file_name = format!("{}.json", session_id);
        Ok(fs
            .walk_files(&self.session_dir(), 2, &file_name)
            .await?
            .into_iter()
            .find(|e| e.name == file_name))
    }

    pub async fn load_session(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
    ) -> Result<Option<LegacySession>> {
        match self.find_session_file(fs, session_id).await? {
            Some(file) => Ok(Some(self.load_session_file(fs, &file, "").await?)),
            None => Ok(None),
        }
    }

    async fn load_session_file(
        &self,
        fs: &dyn SessionFs,
        file: &DirEntry,
        project_path: &str,
    ) -> Result<LegacySession> {
        let session: SessionFile = read_json(fs, &file.path).await?;
        let mut size_bytes = file.size;

        let mut loaded_messages = vec![];
        for message_file in json_files(fs, &self.message_dir().join(&session.id)).await? {
            let info: MessageInfo = match read_json(fs, &message_file.path).await {
                Ok(info) => info,
                Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                Err(err) => {
                    debug!(file = %message_file.path.display(), error = %err, "skipping message file");
                    continue;
                }
            };
            size_bytes += message_file.size;
            let message_id = info
                .id
                .clone()
                .or_else(|| file_stem(&message_file.path))
                .unwrap_or_default();

            let mut parts: Vec<(PartInfo, DirEntry)> = vec![];
            for part_file in json_files(fs, &self.part_dir().join(&message_id)).await? {
                match read_json::<PartInfo>(fs, &part_file.path).await {
                    Ok(part) => {
                        size_bytes += part_file.size;
                        parts.push((part, part_file));
                    }
                    Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
                    Err(err) => {
                        debug!(file = %part_file.path.display(), error = %err, "skipping part file")
                    }
                }
            }
            // Part ids sort in creation order
            parts.sort_by(|(a, a_file), (b, b_file)| {
                a.id.as_deref()
                    .unwrap_or(&a_file.name)
                    .cmp(b.id.as_deref().unwrap_or(&b_file.name))
            });

            loaded_messages.push((message_id, message_file.path, info, parts));
        }

        loaded_messages.sort_by(|a, b| {
            let created = |info: &MessageInfo| info.time.as_ref().and_then(|t| t.created);
            created(&a.2).cmp(&created(&b.2)).then_with(|| a.0.cmp(&b.0))
        });

        let mut entries = Vec::with_capacity(loaded_messages.len());
        let mut messages = Vec::with_capacity(loaded_messages.len());
        for (message_id, path, info, parts) in loaded_messages {
            let (infos, files): (Vec<PartInfo>, Vec<DirEntry>) = parts.into_iter().unzip();
            entries.push(decode_entry(&message_id, &info, &infos));
            messages.push(MessageFiles {
                id: message_id,
                path,
                parts: files
                    .into_iter()
                    .zip(infos.into_iter().map(|part| part.call_id))
                    .map(|(file, call_id)| (file.path, call_id))
                    .collect(),
            });
        }

        let header = SessionHeader {
            id: session.id,
            directory: session.directory,
            created: session
                .time
                .as_ref()
                .and_then(|t| t.created)
                .and_then(ms_to_datetime),
            updated: session
                .time
                .as_ref()
                .and_then(|t| t.updated)
                .and_then(ms_to_datetime),
        };

        Ok(LegacySession {
            loaded: header.into_loaded(entries, size_bytes, project_path),
            messages,
        })
    }

    /// Remove the exchange's message files with their part trees, then every
    /// part file elsewhere that answers one of the exchange's tool calls.
    /// Returns message files plus orphaned part files removed.
    pub async fn delete_exchange(
        &self,
        fs: &dyn SessionFs,
        session_id: &str,
        user_message_uuid: &str,
        fallback_content: Option<&str>,
    ) -> Result<usize> {
        let session = self
            .load_session(fs, session_id)
            .await?
            .ok_or_else(not_found_message)?;
        let plan = plan_deletion(&session.loaded.entries, user_message_uuid, fallback_content)
            .ok_or_else(not_found_message)?;

        let mut removed = 0;
        for message in &session.messages[plan.span.clone()] {
            if fs.remove_file(&message.path).await? {
                removed += 1;
            }
            for (part_path, _) in &message.parts {
                fs.remove_file(part_path).await?;
            }
            fs.remove_dir_all(&self.part_dir().join(&message.id)).await?;
        }

        let orphaned: HashSet<usize> = plan.orphans.keys().copied().collect();
        for idx in orphaned {
            for (part_path, call_id) in &session.messages[idx].parts {
                let orphan = call_id
                    .as_deref()
                    .is_some_and(|id| plan.deleted_calls.contains(id));
                if orphan && fs.remove_file(part_path).await? {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

/// `*.json` files directly inside `dir`, sorted by name; a missing dir is empty
async fn json_files(fs: &dyn SessionFs, dir: &Path) -> Result<Vec<DirEntry>> {
    let mut files: Vec<DirEntry> = fs
        .list_dir(dir)
        .await?
        .into_iter()
        .filter(|e| !e.is_dir && e.name.ends_with(".json"))
        .collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

async fn read_json<T: serde::de::DeserializeOwned>(fs: &dyn SessionFs, path: &Path) -> Result<T> {
    let content = fs.read_to_string(path).await?;
    serde_json::from_str(&content).map_err(|e| StorageError::Parse(format!("{}: {}", path.display(), e)))
}
