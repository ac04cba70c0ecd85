//! Merging of database-sourced and legacy-file-sourced sessions
//!
//! The database listing is authoritative: any id present in both keeps the
//! database record. Ids are assumed stable across the migration; a legacy
//! session re-imported under a different id would appear twice.

use std::collections::HashSet;

use crate::model::SessionRecord;

/// Every database item plus the legacy items whose id the database lacks
pub fn merge_by_id<T, F>(database: Vec<T>, legacy: Vec<T>, id: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let known: HashSet<String> = database.iter().map(|item| id(item).to_string()).collect();

    let mut merged = database;
    merged.extend(legacy.into_iter().filter(|item| !known.contains(id(item))));
    merged
}

/// Sort by `modified_at` descending; ties broken by id so pagination is stable
pub fn sort_newest_first(sessions: &mut [SessionRecord]) {
    sessions.sort_by(|a, b| {
        b.modified_at
            .cmp(&a.modified_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
}
