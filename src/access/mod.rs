//! Filesystem access for providers
//!
//! Every provider operation goes through [`SessionFs`]. Local access uses tokio
//! file I/O and a read-only SQLite handle; remote access (see [`remote`]) issues
//! shell commands on the target host and feeds the output to the same parsers.

pub mod remote;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::error::{Result, StorageError};
pub use remote::{RemoteFs, RemoteHost, RemoteShell, SshShell};

/// One row of a SQLite query, keyed by column name
pub type SqlRow = serde_json::Map<String, Value>;

/// File or directory as seen by a directory listing
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl DirEntry {
    fn new(path: PathBuf, is_dir: bool, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            is_dir,
            size,
            modified,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait SessionFs: Send + Sync {
    /// Whether calls reach this machine's filesystem directly
    fn is_local(&self) -> bool;

    /// Home directory of the user owning the agent data
    async fn home_dir(&self) -> Result<PathBuf>;

    /// Immediate children of `dir`; a missing directory lists as empty
    async fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>>;

    /// Regular files below `dir` (up to `max_depth`) whose name ends with `suffix`
    async fn walk_files(&self, dir: &Path, max_depth: usize, suffix: &str)
        -> Result<Vec<DirEntry>>;

    /// `None` when the path does not exist
    async fn stat(&self, path: &Path) -> Result<Option<DirEntry>>;

    async fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Replace a file's content through a temporary sibling and a rename
    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<()>;

    /// Returns whether a file was actually removed
    async fn remove_file(&self, path: &Path) -> Result<bool>;

    async fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Run a program in `cwd` on the host this filesystem belongs to
    async fn run(&self, cwd: &Path, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run read-only queries against a SQLite file, one connection for the batch
    async fn query_sqlite(&self, db_path: &Path, queries: Vec<String>) -> Result<Vec<Vec<SqlRow>>>;

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }
}

/// Hands out the right [`SessionFs`] for an optional remote host
#[derive(Clone)]
pub struct Access {
    shell: Arc<dyn RemoteShell>,
}

impl Access {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell }
    }

    pub fn for_host(&self, remote: Option<&RemoteHost>) -> Box<dyn SessionFs> {
        match remote {
            Some(host) => Box::new(RemoteFs::new(host.clone(), Arc::clone(&self.shell))),
            None => Box::new(LocalFs),
        }
    }
}

impl Default for Access {
    fn default() -> Self {
        Self::new(Arc::new(SshShell::default()))
    }
}

/// Direct access to this machine's filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

fn system_time_to_utc(time: std::time::SystemTime) -> Option<DateTime<Utc>> {
    let millis = time.duration_since(UNIX_EPOCH).ok()?.as_millis() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

fn join_error(err: tokio::task::JoinError) -> StorageError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}

#[async_trait]
impl SessionFs for LocalFs {
    fn is_local(&self) -> bool {
        true
    }

    async fn home_dir(&self) -> Result<PathBuf> {
        dirs::home_dir().ok_or_else(|| StorageError::not_found("home directory not found"))
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };

        let mut entries = vec![];
        while let Some(entry) = reader.next_entry().await? {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            entries.push(DirEntry::new(
                entry.path(),
                metadata.is_dir(),
                metadata.len(),
                metadata.modified().ok().and_then(system_time_to_utc),
            ));
        }
        Ok(entries)
    }

    async fn walk_files(
        &self,
        dir: &Path,
        max_depth: usize,
        suffix: &str,
    ) -> Result<Vec<DirEntry>> {
        let dir = dir.to_path_buf();
        let suffix = suffix.to_string();

        tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .max_depth(max_depth)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| e.file_name().to_string_lossy().ends_with(&suffix))
                .filter_map(|e| {
                    let metadata = e.metadata().ok()?;
                    Some(DirEntry::new(
                        e.into_path(),
                        false,
                        metadata.len(),
                        metadata.modified().ok().and_then(system_time_to_utc),
                    ))
                })
                .collect()
        })
        .await
        .map_err(join_error)
    }

    async fn stat(&self, path: &Path) -> Result<Option<DirEntry>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(DirEntry::new(
                path.to_path_buf(),
                metadata.is_dir(),
                metadata.len(),
                metadata.modified().ok().and_then(system_time_to_utc),
            ))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StorageError::not_found(format!("{} not found", path.display()))
            } else {
                err.into()
            }
        })
    }

    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        let tmp = temp_sibling(path);
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn run(&self, cwd: &Path, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .output()
            .await?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn query_sqlite(&self, db_path: &Path, queries: Vec<String>) -> Result<Vec<Vec<SqlRow>>> {
        if !db_path.exists() {
            return Err(StorageError::not_found(format!(
                "{} not found",
                db_path.display()
            )));
        }
        let db_path = db_path.to_path_buf();

        // The connection lives only inside this closure
        tokio::task::spawn_blocking(move || {
            let conn = open_db_readonly(&db_path)?;
            queries
                .iter()
                .map(|sql| query_rows(&conn, sql))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(join_error)?
    }
}

/// Open database in read-only mode
pub fn open_db_readonly(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let _ = conn.busy_timeout(Duration::from_millis(250));
    Ok(conn)
}

fn query_rows(conn: &Connection, sql: &str) -> Result<Vec<SqlRow>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;

    let mut out = vec![];
    while let Some(row) = rows.next()? {
        let mut map = SqlRow::new();
        for (idx, column) in columns.iter().enumerate() {
            let value = match row.get_ref(idx)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(n) => Value::from(n),
                ValueRef::Real(f) => serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                    Value::String(String::from_utf8_lossy(bytes).into_owned())
                }
            };
            map.insert(column.clone(), value);
        }
        out.push(map);
    }
    Ok(out)
}

pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}
