//! Database generation: `opencode.db`
//!
//! Every call opens its own read-only connection (or `sqlite3` process on a
//! remote host) through [`SessionFs::query_sqlite`] and drops it before returning.

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use super::{decode_entry, MessageInfo, PartInfo, SessionHeader};
use crate::access::{SessionFs, SqlRow};
use crate::error::{Result, StorageError};
use crate::provider::{parse_timestamp, LoadedSession};

const REQUIRED_TABLES: [&str; 4] = ["project", "session", "message", "part"];

/// SQL string literal; `'` doubled
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Fail with `SchemaMismatch` unless every table this module queries exists
async fn check_schema(fs: &dyn SessionFs, db_path: &Path) -> Result<()> {
    let names = REQUIRED_TABLES
        .iter()
        .map(|t| sql_literal(t))
        .collect::<Vec<_>>()
        .join(", ");
    let query = format!("SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ({names})");

    let rows = fs
        .query_sqlite(db_path, vec![query])
        .await?
        .into_iter()
        .next()
        .unwrap_or_default();
    let present: Vec<&str> = rows
        .iter()
        .filter_map(|row| row.get("name").and_then(|v| v.as_str()))
        .collect();

    match REQUIRED_TABLES.iter().find(|t| !present.contains(*t)) {
        Some(missing) => Err(StorageError::SchemaMismatch(missing.to_string())),
        None => Ok(()),
    }
}

/// Sessions of a project: those of its `project` row, plus any recorded in its directory
pub(super) async fn scan_project(
    fs: &dyn SessionFs,
    db_path: &Path,
    project_path: &str,
) -> Result<Vec<LoadedSession>> {
    let project = sql_literal(project_path.trim_end_matches('/'));
    let filter = format!(
        "project_id IN (SELECT id FROM project WHERE worktree = {project}) OR directory = {project}"
    );
    load_where(fs, db_path, &filter, project_path).await
}

pub(super) async fn load_session(
    fs: &dyn SessionFs,
    db_path: &Path,
    session_id: &str,
) -> Result<Option<LoadedSession>> {
    let filter = format!("id = {}", sql_literal(session_id));
    Ok(load_where(fs, db_path, &filter, "").await?.into_iter().next())
}

/// Load every session matching a `session` table predicate with messages and parts
async fn load_where(
    fs: &dyn SessionFs,
    db_path: &Path,
    session_filter: &str,
    project_path: &str,
) -> Result<Vec<LoadedSession>> {
    check_schema(fs, db_path).await?;

    let queries = vec![
        format!(
            "SELECT id, directory, time_created, time_updated FROM session WHERE {session_filter}"
        ),
        format!(
            "SELECT id, session_id, data FROM message \
             WHERE session_id IN (SELECT id FROM session WHERE {session_filter}) \
             ORDER BY time_created, id"
        ),
        format!(
            "SELECT part.message_id AS message_id, part.data AS data FROM part \
             JOIN message ON message.id = part.message_id \
             WHERE message.session_id IN (SELECT id FROM session WHERE {session_filter}) \
             ORDER BY part.id"
        ),
    ];
    let mut results = fs.query_sqlite(db_path, queries).await?.into_iter();
    let sessions = results.next().unwrap_or_default();
    let messages = results.next().unwrap_or_default();
    let parts = results.next().unwrap_or_default();
    debug!(
        sessions = sessions.len(),
        messages = messages.len(),
        parts = parts.len(),
        "loaded sessions from database"
    );

    let mut parts_by_message: HashMap<String, Vec<PartInfo>> = HashMap::new();
    let mut bytes_by_message: HashMap<String, u64> = HashMap::new();
    for row in &parts {
        let (Some(message_id), Some(data)) = (text(row, "message_id"), text(row, "data")) else {
            continue;
        };
        *bytes_by_message.entry(message_id.to_string()).or_default() += data.len() as u64;
        match serde_json::from_str::<PartInfo>(data) {
            Ok(part) => parts_by_message
                .entry(message_id.to_string())
                .or_default()
                .push(part),
            Err(err) => debug!(message_id, error = %err, "skipping malformed part row"),
        }
    }

    let mut entries_by_session: HashMap<String, Vec<_>> = HashMap::new();
    let mut bytes_by_session: HashMap<String, u64> = HashMap::new();
    for row in &messages {
        let (Some(id), Some(session_id), Some(data)) =
            (text(row, "id"), text(row, "session_id"), text(row, "data"))
        else {
            continue;
        };
        let info: MessageInfo = match serde_json::from_str(data) {
            Ok(info) => info,
            Err(err) => {
                debug!(message_id = id, error = %err, "skipping malformed message row");
                continue;
            }
        };
        let parts = parts_by_message.remove(id).unwrap_or_default();
        *bytes_by_session.entry(session_id.to_string()).or_default() +=
            data.len() as u64 + bytes_by_message.get(id).copied().unwrap_or(0);
        entries_by_session
            .entry(session_id.to_string())
            .or_default()
            .push(decode_entry(id, &info, &parts));
    }

    Ok(sessions
        .iter()
        .filter_map(|row| {
            let id = text(row, "id")?.to_string();
            let header = SessionHeader {
                directory: text(row, "directory").map(String::from),
                created: parse_timestamp(row.get("time_created")),
                updated: parse_timestamp(row.get("time_updated")),
                id: id.clone(),
            };
            let entries = entries_by_session.remove(&id).unwrap_or_default();
            let size = bytes_by_session.get(&id).copied().unwrap_or(0);
            Some(header.into_loaded(entries, size, project_path))
        })
        .collect())
}

fn text<'a>(row: &'a SqlRow, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::create_database;
    use super::*;
    use crate::access::LocalFs;
    use tempfile::TempDir;

    #[test]
    fn test_sql_literal_doubles_quotes() {
        assert_eq!(sql_literal("/a/it's"), "'/a/it''s'");
    }

    #[tokio::test]
    async fn test_scan_project_reads_nested_json() {
        let temp = TempDir::new().unwrap();
        create_database(temp.path());
        let db = temp.path().join("opencode.db");

        let sessions = scan_project(&LocalFs, &db, "/test/project/").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entries.len(), 2);
        assert_eq!(sessions[0].entries[0].text(), "What's in the project?");
        assert!(sessions[0].record.size_bytes > 0);

        assert!(scan_project(&LocalFs, &db, "/other").await.unwrap().is_empty());
        assert!(load_session(&LocalFs, &db, "ses_001").await.unwrap().is_some());
        assert!(load_session(&LocalFs, &db, "ses_404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_tables_is_schema_mismatch() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("opencode.db");
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch("CREATE TABLE project (id TEXT, worktree TEXT)")
            .unwrap();

        let err = scan_project(&LocalFs, &db, "/test/project").await.unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch(ref t) if t == "session"));
    }
}
