//! Remote filesystem access over a remote-shell capability
//!
//! The transport itself is abstracted as [`RemoteShell`]; [`SshShell`] drives the
//! system `ssh` binary. [`RemoteFs`] turns filesystem calls into POSIX shell
//! commands (`find -printf`, `cat`, `rm`, `sqlite3 -json`) so one round trip
//! lists a whole directory.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{temp_sibling, CommandOutput, DirEntry, SessionFs, SqlRow};
use crate::error::{Result, StorageError};

/// Remote host descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    /// Private key passed to the transport (`ssh -i`)
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

impl RemoteHost {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            user: None,
            identity_file: None,
        }
    }

    /// `user@host` or `host`
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// "Run a command on a remote host, get back stdout/stderr/exit code"
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(
        &self,
        host: &RemoteHost,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput>;
}

/// [`RemoteShell`] backed by the OpenSSH client
#[derive(Debug, Clone)]
pub struct SshShell {
    pub binary: String,
    pub connect_timeout: Duration,
}

impl Default for SshShell {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SshShell {
    fn args(&self, host: &RemoteHost, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(port) = host.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &host.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        args.push(host.destination());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(
        &self,
        host: &RemoteHost,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput> {
        debug!(host = %host.host, command, "ssh exec");

        let mut child = tokio::process::Command::new(&self.binary)
            .args(self.args(host, command))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                StorageError::RemoteTransport(format!("failed to spawn {}: {}", self.binary, e))
            })?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)
                .await
                .map_err(|e| StorageError::RemoteTransport(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StorageError::RemoteTransport(e.to_string()))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        // ssh reserves 255 for its own connection failures
        if exit_code == 255 {
            return Err(StorageError::RemoteTransport(format!(
                "ssh to {} failed: {}",
                host.destination(),
                stderr.trim()
            )));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code,
        })
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Filesystem on a remote host
pub struct RemoteFs {
    host: RemoteHost,
    shell: Arc<dyn RemoteShell>,
}

impl RemoteFs {
    pub fn new(host: RemoteHost, shell: Arc<dyn RemoteShell>) -> Self {
        Self { host, shell }
    }

    async fn sh(&self, command: &str) -> Result<CommandOutput> {
        self.shell.exec(&self.host, command, None).await
    }

    /// Run and require a zero exit code
    async fn sh_ok(&self, command: &str) -> Result<String> {
        let output = self.sh(command).await?;
        if !output.success() {
            return Err(StorageError::RemoteTransport(format!(
                "`{}` exited with {}: {}",
                command,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn find(&self, command: &str) -> Result<Vec<DirEntry>> {
        let stdout = self.sh_ok(command).await?;
        Ok(stdout.lines().filter_map(parse_find_line).collect())
    }
}

/// `find -printf` format shared by every listing command
const FIND_FORMAT: &str = r"'%y\t%s\t%T@\t%p\n'";

/// Parse a `%y\t%s\t%T@\t%p` line
fn parse_find_line(line: &str) -> Option<DirEntry> {
    let mut fields = line.splitn(4, '\t');
    let kind = fields.next()?;
    let size = fields.next()?.parse::<u64>().ok()?;
    let mtime = fields.next()?.parse::<f64>().ok();
    let path = fields.next()?;
    if path.is_empty() {
        return None;
    }

    let modified = mtime.and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single());
    Some(DirEntry::new(
        PathBuf::from(path),
        kind == "d",
        size,
        modified,
    ))
}

#[async_trait]
impl SessionFs for RemoteFs {
    fn is_local(&self) -> bool {
        false
    }

    async fn home_dir(&self) -> Result<PathBuf> {
        let stdout = self.sh_ok("printf '%s' \"$HOME\"").await?;
        let home = stdout.trim();
        if home.is_empty() {
            return Err(StorageError::not_found(format!(
                "home directory not found on {}",
                self.host.host
            )));
        }
        Ok(PathBuf::from(home))
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let dir = quote_path(dir);
        self.find(&format!(
            "if [ -d {dir} ]; then find {dir} -mindepth 1 -maxdepth 1 -printf {FIND_FORMAT}; fi"
        ))
        .await
    }

    async fn walk_files(
        &self,
        dir: &Path,
        max_depth: usize,
        suffix: &str,
    ) -> Result<Vec<DirEntry>> {
        let dir = quote_path(dir);
        let pattern = shell_quote(&format!("*{suffix}"));
        self.find(&format!(
            "if [ -d {dir} ]; then find {dir} -maxdepth {max_depth} -type f -name {pattern} -printf {FIND_FORMAT}; fi"
        ))
        .await
    }

    async fn stat(&self, path: &Path) -> Result<Option<DirEntry>> {
        let path = quote_path(path);
        let entries = self
            .find(&format!(
                "if [ -e {path} ]; then find {path} -maxdepth 0 -printf {FIND_FORMAT}; fi"
            ))
            .await?;
        Ok(entries.into_iter().next())
    }

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        let quoted = quote_path(path);
        let output = self
            .sh(&format!("if [ -f {quoted} ]; then cat {quoted}; else exit 3; fi"))
            .await?;
        match output.exit_code {
            0 => Ok(output.stdout),
            3 => Err(StorageError::not_found(format!(
                "{}:{} not found",
                self.host.host,
                path.display()
            ))),
            code => Err(StorageError::RemoteTransport(format!(
                "reading {} exited with {}: {}",
                path.display(),
                code,
                output.stderr.trim()
            ))),
        }
    }

    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        let tmp = quote_path(&temp_sibling(path));
        let command = format!("cat > {tmp} && mv -f {tmp} {}", quote_path(path));
        let output = self
            .shell
            .exec(&self.host, &command, Some(contents.as_bytes()))
            .await?;
        if !output.success() {
            return Err(StorageError::RemoteTransport(format!(
                "writing {} failed: {}",
                path.display(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<bool> {
        let path = quote_path(path);
        let stdout = self
            .sh_ok(&format!(
                "if [ -f {path} ]; then rm -f {path} && printf removed; fi"
            ))
            .await?;
        Ok(stdout.trim() == "removed")
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.sh_ok(&format!("rm -rf {}", quote_path(path))).await?;
        Ok(())
    }

    async fn run(&self, cwd: &Path, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut command = format!("cd {} && {}", quote_path(cwd), shell_quote(program));
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        self.sh(&command).await
    }

    async fn query_sqlite(&self, db_path: &Path, queries: Vec<String>) -> Result<Vec<Vec<SqlRow>>> {
        let db = quote_path(db_path);
        let mut results = Vec::with_capacity(queries.len());

        for sql in queries {
            let output = self
                .sh(&format!(
                    "if [ -f {db} ]; then sqlite3 -readonly -json {db} {}; else exit 3; fi",
                    shell_quote(&sql)
                ))
                .await?;
            match output.exit_code {
                0 => {}
                3 => {
                    return Err(StorageError::not_found(format!(
                        "{}:{} not found",
                        self.host.host,
                        db_path.display()
                    )))
                }
                // the shell reports a missing binary as 127
                127 => {
                    return Err(StorageError::not_found(format!(
                        "sqlite3 is not available on {}: {}",
                        self.host.host,
                        output.stderr.trim()
                    )))
                }
                // ssh failures never get here: the shell maps 255 to RemoteTransport
                code => {
                    return Err(StorageError::SchemaMismatch(format!(
                        "sqlite3 exited with {}: {}",
                        code,
                        output.stderr.trim()
                    )))
                }
            }

            // sqlite3 prints nothing at all for an empty result set
            let stdout = output.stdout.trim();
            let rows: Vec<SqlRow> = if stdout.is_empty() {
                vec![]
            } else {
                serde_json::from_str(stdout)?
            };
            results.push(rows);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::testing::LocalShell;
    use tempfile::TempDir;

    fn remote_fs(temp: &TempDir) -> RemoteFs {
        RemoteFs::new(
            RemoteHost::new("devbox"),
            Arc::new(LocalShell::new(temp.path())),
        )
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_ssh_args() {
        let host = RemoteHost {
            host: "example.org".to_string(),
            port: Some(2222),
            user: Some("dev".to_string()),
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
        };
        let args = SshShell::default().args(&host, "true");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_ed25519"));
        assert_eq!(args[args.len() - 2], "dev@example.org");
        assert_eq!(args[args.len() - 1], "true");
    }

    #[test]
    fn test_parse_find_line() {
        let entry = parse_find_line("f\t42\t1700000000.5000000000\t/a/b/c.json").unwrap();
        assert_eq!(entry.name, "c.json");
        assert_eq!(entry.size, 42);
        assert!(!entry.is_dir);
        assert_eq!(entry.modified.unwrap().timestamp_millis(), 1_700_000_000_500);
        assert!(parse_find_line("garbage").is_none());
    }

    #[tokio::test]
    async fn test_remote_listing_and_reads() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("data dir");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("it's.json"), "{\"ok\":true}").unwrap();

        let fs = remote_fs(&temp);
        assert_eq!(fs.home_dir().await.unwrap(), temp.path());

        let mut entries = fs.list_dir(&dir).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "it's.json");
        assert!(entries[1].is_dir);

        let content = fs.read_to_string(&dir.join("it's.json")).await.unwrap();
        assert_eq!(content, "{\"ok\":true}");
        assert!(fs
            .read_to_string(&dir.join("missing.json"))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(fs.list_dir(&temp.path().join("nope")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_write_and_remove() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.json");
        let fs = remote_fs(&temp);

        fs.write_atomic(&path, "line1\nline2\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line1\nline2\n");
        assert!(fs.stat(&path).await.unwrap().is_some());
        assert!(fs.remove_file(&path).await.unwrap());
        assert!(!fs.remove_file(&path).await.unwrap());
        assert!(fs.stat(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_sqlite3_is_not_a_transport_error() {
        let temp = TempDir::new().unwrap();
        let empty_bin = temp.path().join("bin");
        std::fs::create_dir_all(&empty_bin).unwrap();
        let db = temp.path().join("opencode.db");
        std::fs::write(&db, b"").unwrap();

        let fs = RemoteFs::new(
            RemoteHost::new("devbox"),
            Arc::new(LocalShell {
                home: temp.path().to_path_buf(),
                path: Some(empty_bin),
            }),
        );
        let err = fs
            .query_sqlite(&db, vec!["SELECT 1".to_string()])
            .await
            .unwrap_err();
        assert!(!matches!(err, StorageError::RemoteTransport(_)));
        assert!(err.is_not_found());
    }
}
