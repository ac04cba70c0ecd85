//! Deletion planning for a user/assistant exchange
//!
//! Providers decode a session into [`TranscriptEntry`] records that map 1:1 to
//! their underlying storage records, ask [`plan_deletion`] what to remove, and
//! then apply the plan to their own format. The index built here lives only for
//! the duration of one delete call.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use crate::model::TranscriptEntry;

pub const USER_MESSAGE_NOT_FOUND: &str = "User message not found";

#[derive(Debug, Clone, PartialEq)]
pub struct DeletionPlan {
    /// Entry indexes removed outright: the user message and its replies
    pub span: Range<usize>,
    /// Tool-call ids declared inside the span
    pub deleted_calls: HashSet<String>,
    /// Entries outside the span whose parts reference a deleted call,
    /// mapped to the offending part indexes
    pub orphans: BTreeMap<usize, Vec<usize>>,
}

impl DeletionPlan {
    /// True when every part of an orphan entry goes away, so the whole entry should
    pub fn orphan_empties_entry(&self, entries: &[TranscriptEntry], idx: usize) -> bool {
        self.orphans
            .get(&idx)
            .is_some_and(|parts| parts.len() == entries[idx].parts.len())
    }

    pub fn orphan_part_count(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Find the target user message: exact uuid first, then (newest first) the
/// user message whose normalized text equals the normalized fallback
pub fn locate_user_message(
    entries: &[TranscriptEntry],
    uuid: &str,
    fallback_content: Option<&str>,
) -> Option<usize> {
    if let Some(idx) = entries
        .iter()
        .position(|e| e.uuid == uuid && e.is_user_message())
    {
        return Some(idx);
    }

    let wanted = normalize(fallback_content?);
    if wanted.is_empty() {
        return None;
    }
    entries
        .iter()
        .rposition(|e| e.is_user_message() && normalize(&e.text()) == wanted)
}

/// Compute what deleting the exchange started by `uuid` removes
pub fn plan_deletion(
    entries: &[TranscriptEntry],
    uuid: &str,
    fallback_content: Option<&str>,
) -> Option<DeletionPlan> {
    let start = locate_user_message(entries, uuid, fallback_content)?;
    let end = entries[start + 1..]
        .iter()
        .position(TranscriptEntry::is_user_message)
        .map(|offset| start + 1 + offset)
        .unwrap_or(entries.len());

    let deleted_calls: HashSet<String> = entries[start..end]
        .iter()
        .flat_map(|e| e.parts.iter())
        .filter_map(|part| match part {
            crate::model::Part::ToolCall { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();

    let mut orphans = BTreeMap::new();
    if !deleted_calls.is_empty() {
        for (idx, entry) in entries.iter().enumerate() {
            if (start..end).contains(&idx) {
                continue;
            }
            let hits: Vec<usize> = entry
                .parts
                .iter()
                .enumerate()
                .filter(|(_, part)| {
                    part.call_id()
                        .is_some_and(|id| deleted_calls.contains(id))
                })
                .map(|(i, _)| i)
                .collect();
            if !hits.is_empty() {
                orphans.insert(idx, hits);
            }
        }
    }

    Some(DeletionPlan {
        span: start..end,
        deleted_calls,
        orphans,
    })
}
