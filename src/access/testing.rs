//! Remote access stand-in for tests: commands run through the local `/bin/sh`

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use super::{Access, CommandOutput, RemoteHost, RemoteShell};
use crate::error::Result;

/// Executes remote commands on this machine with `$HOME` pinned to a temp dir
pub struct LocalShell {
    pub home: PathBuf,
    /// Replaces `$PATH` for the spawned shell when set
    pub path: Option<PathBuf>,
}

impl LocalShell {
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            path: None,
        }
    }
}

#[async_trait]
impl RemoteShell for LocalShell {
    async fn exec(
        &self,
        _host: &RemoteHost,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(command).env("HOME", &self.home);
        if let Some(path) = &self.path {
            cmd.env("PATH", path);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut pipe) = child.stdin.take() {
            if let Some(data) = stdin {
                pipe.write_all(data).await?;
            }
        }
        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// [`Access`] whose remote side is this machine, rooted at `home`
pub fn loopback_access(home: &Path) -> Access {
    Access::new(Arc::new(LocalShell::new(home)))
}

pub fn loopback_host() -> RemoteHost {
    RemoteHost::new("devbox")
}

/// Whether a binary resolves on this machine's `$PATH`
pub fn has_binary(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}
