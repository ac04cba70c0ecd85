//! Normalized session records shared by every provider

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Longest first-message preview kept on a [`SessionRecord`]
pub const PREVIEW_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Whether a session was started by a person or by an automated trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOrigin {
    User,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub first_message_preview: String,
    pub message_count: usize,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<SessionOrigin>,
}

impl SessionRecord {
    /// Build a record from a parsed transcript, filling every derived field
    pub fn from_transcript(
        session_id: impl Into<String>,
        project_path: impl Into<String>,
        entries: &[TranscriptEntry],
        size_bytes: u64,
        fallback_time: DateTime<Utc>,
    ) -> Self {
        let stats = TranscriptStats::collect(entries);
        let created_at = stats.first_timestamp.unwrap_or(fallback_time);
        let modified_at = stats.last_timestamp.unwrap_or(fallback_time);
        let duration_seconds = stats.duration_seconds();

        Self {
            session_id: session_id.into(),
            project_path: project_path.into(),
            created_at,
            modified_at,
            first_message_preview: stats.preview.unwrap_or_default(),
            message_count: stats.message_count,
            size_bytes,
            cost_usd: stats.cost_usd,
            input_tokens: stats.usage.map(|u| u.input),
            output_tokens: stats.usage.map(|u| u.output),
            cache_read_tokens: stats.usage.map(|u| u.cache_read),
            cache_creation_tokens: stats.usage.map(|u| u.cache_creation),
            duration_seconds,
            session_name: None,
            origin: None,
        }
    }
}

/// A tool invocation attached to an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub uuid: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<ToolUse>,
}

/// Atomic content unit of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        input: Option<Value>,
    },
    ToolResult {
        call_id: String,
        output: String,
        is_error: bool,
    },
}

impl Part {
    /// Tool-call id this part either declares or answers
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Part::ToolCall { call_id, .. } | Part::ToolResult { call_id, .. } => {
                Some(call_id.as_str())
            }
            Part::Text { .. } | Part::Reasoning { .. } => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_creation += other.cache_creation;
    }
}

/// Role of a raw record before filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRole {
    User,
    Assistant,
    /// System, info, warning, summary and other bookkeeping records
    Other,
}

/// One underlying record of a session (log line, array element or message file),
/// decoded into parts. Every provider produces these; messages, statistics,
/// search and deletion are all computed from them.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub uuid: String,
    pub role: EntryRole,
    pub timestamp: Option<DateTime<Utc>>,
    pub parts: Vec<Part>,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
}

impl TranscriptEntry {
    pub fn new(uuid: impl Into<String>, role: EntryRole) -> Self {
        Self {
            uuid: uuid.into(),
            role,
            timestamp: None,
            parts: Vec::new(),
            usage: None,
            cost_usd: None,
        }
    }

    /// Text parts joined the way messages are displayed
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::text)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// A user record that carries an actual utterance, not only tool results
    pub fn is_user_message(&self) -> bool {
        self.role == EntryRole::User && !self.text().is_empty()
    }

    /// Convert to the caller-facing message, or `None` for records that are
    /// not user/assistant messages (system entries, tool-result carriers, empty records)
    pub fn to_message(&self) -> Option<Message> {
        let role = match self.role {
            EntryRole::User => MessageRole::User,
            EntryRole::Assistant => MessageRole::Assistant,
            EntryRole::Other => return None,
        };

        let content = self.text();
        let tool_uses: Vec<ToolUse> = self
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall {
                    call_id,
                    name,
                    input,
                } => Some(ToolUse {
                    id: call_id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    output: None,
                }),
                _ => None,
            })
            .collect();

        if content.is_empty() && (role == MessageRole::User || tool_uses.is_empty()) {
            return None;
        }

        Some(Message {
            uuid: self.uuid.clone(),
            role,
            content,
            timestamp: self.timestamp,
            tool_uses,
        })
    }
}

/// Flatten a transcript into messages, attaching tool results to their calls
pub fn build_messages(entries: &[TranscriptEntry]) -> Vec<Message> {
    // First result wins when a call id is answered more than once
    let mut outputs: HashMap<&str, &str> = HashMap::new();
    for part in entries.iter().flat_map(|e| e.parts.iter()) {
        if let Part::ToolResult {
            call_id, output, ..
        } = part
        {
            outputs.entry(call_id.as_str()).or_insert(output.as_str());
        }
    }

    entries
        .iter()
        .filter_map(TranscriptEntry::to_message)
        .map(|mut message| {
            for tool in &mut message.tool_uses {
                if tool.output.is_none() {
                    tool.output = outputs.get(tool.id.as_str()).map(|o| o.to_string());
                }
            }
            message
        })
        .collect()
}

/// Aggregates derived from a transcript
#[derive(Debug, Default)]
pub struct TranscriptStats {
    pub message_count: usize,
    pub preview: Option<String>,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl TranscriptStats {
    pub fn collect(entries: &[TranscriptEntry]) -> Self {
        let mut stats = TranscriptStats::default();

        for entry in entries {
            if let Some(usage) = &entry.usage {
                stats.usage.get_or_insert_with(TokenUsage::default).add(usage);
            }
            if let Some(cost) = entry.cost_usd {
                *stats.cost_usd.get_or_insert(0.0) += cost;
            }

            // Every user or assistant record counts, content or not
            if entry.role == EntryRole::Other {
                continue;
            }
            stats.message_count += 1;

            if stats.preview.is_none() && entry.is_user_message() {
                stats.preview = Some(truncate_preview(&entry.text()));
            }

            if let Some(ts) = entry.timestamp {
                if stats.first_timestamp.map_or(true, |first| ts < first) {
                    stats.first_timestamp = Some(ts);
                }
                if stats.last_timestamp.map_or(true, |last| ts > last) {
                    stats.last_timestamp = Some(ts);
                }
            }
        }

        stats
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => Some((last - first).num_seconds().max(0)),
            _ => None,
        }
    }
}

/// Collapse whitespace and cut to [`PREVIEW_MAX_CHARS`]
pub fn truncate_preview(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= PREVIEW_MAX_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(PREVIEW_MAX_CHARS - 3).collect();
    format!("{}...", cut.trim_end())
}

// ============================================
// PAGINATION
// ============================================

#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    /// Session id of the last record of the previous page
    pub cursor: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    pub sessions: Vec<SessionRecord>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Tail-relative message window: `offset` counts back from the newest message
#[derive(Debug, Clone, Copy)]
pub struct MessageWindow {
    pub offset: usize,
    pub limit: usize,
}

impl Default for MessageWindow {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub total: usize,
    pub has_more: bool,
}

// ============================================
// SEARCH & MUTATION RESULTS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Title,
    User,
    Assistant,
    All,
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "title" => Ok(SearchMode::Title),
            "user" => Ok(SearchMode::User),
            "assistant" => Ok(SearchMode::Assistant),
            "all" => Ok(SearchMode::All),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMatchType {
    Title,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub session: SessionRecord,
    pub match_type: SearchMatchType,
    pub match_count: usize,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_removed: Option<usize>,
}

impl DeleteOutcome {
    pub fn removed(count: usize) -> Self {
        Self {
            success: true,
            error: None,
            records_removed: Some(count),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            records_removed: None,
        }
    }
}
