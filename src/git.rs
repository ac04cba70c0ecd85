//! Git remote identity for log formats that record a repository URL instead of a path

use std::path::Path;
use tracing::debug;

use crate::access::SessionFs;
use crate::error::{Result, StorageError};

/// Normalize a remote URL so SSH and HTTPS spellings of one repository compare equal
///
/// - strips a trailing `/` and `.git`
/// - rewrites `git@host:owner/repo` and `ssh://git@host/owner/repo` to `https://host/owner/repo`
/// - lowercases the result
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = url.strip_suffix(".git") {
        url = stripped.to_string();
    }

    if let Some(rest) = url.strip_prefix("ssh://") {
        let rest = rest.split_once('@').map(|(_, r)| r).unwrap_or(rest);
        // ssh://host:port/path drops the port
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        let host = host.split(':').next().unwrap_or(host);
        url = format!("https://{}/{}", host, path);
    } else if !url.contains("://") {
        if let Some((user_host, path)) = url.split_once(':') {
            let host = user_host.split_once('@').map(|(_, h)| h).unwrap_or(user_host);
            url = format!("https://{}/{}", host, path.trim_start_matches('/'));
        }
    } else if let Some(rest) = url.strip_prefix("http://") {
        url = format!("https://{}", rest);
    }

    url.trim_end_matches('/').to_lowercase()
}

/// `git remote get-url origin` for a project, normalized; `None` when the
/// directory is not a repository or has no origin
pub async fn origin_remote(fs: &dyn SessionFs, project_path: &Path) -> Result<Option<String>> {
    let output = match fs
        .run(project_path, "git", &["remote", "get-url", "origin"])
        .await
    {
        Ok(output) => output,
        Err(err @ StorageError::RemoteTransport(_)) => return Err(err),
        Err(err) => {
            debug!(project = %project_path.display(), error = %err, "git remote lookup failed");
            return Ok(None);
        }
    };

    if !output.success() {
        debug!(
            project = %project_path.display(),
            stderr = output.stderr.trim(),
            "project has no origin remote"
        );
        return Ok(None);
    }

    let url = output.stdout.trim();
    Ok((!url.is_empty()).then(|| normalize_remote_url(url)))
}
