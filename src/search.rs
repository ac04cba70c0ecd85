//! Full-text search over a project's messages

use crate::model::{Message, MessageRole, SearchHit, SearchMatchType, SearchMode, SessionRecord};

/// Characters of context kept on each side of the first hit
pub const CONTEXT_CHARS: usize = 60;

/// Lowercase char-by-char so indexes stay aligned with the original text
fn fold(text: &str) -> Vec<char> {
    text.chars()
        .map(|c| c.to_lowercase().next().unwrap_or(c))
        .collect()
}

/// Char index of the first case-insensitive occurrence of `needle`
fn find_folded(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Excerpt around a hit, with `...` where the text was cut
pub fn context_preview(text: &str, hit: usize, hit_len: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = hit.saturating_sub(CONTEXT_CHARS);
    let end = (hit + hit_len + CONTEXT_CHARS).min(chars.len());

    let mut preview = String::new();
    if start > 0 {
        preview.push_str("...");
    }
    preview.extend(chars[start..end].iter().map(|&c| if c == '\n' { ' ' } else { c }));
    if end < chars.len() {
        preview.push_str("...");
    }
    preview
}

struct RoleHits<'a> {
    count: usize,
    first: Option<(&'a Message, usize)>,
}

impl<'a> RoleHits<'a> {
    fn new() -> Self {
        Self {
            count: 0,
            first: None,
        }
    }

    fn record(&mut self, message: &'a Message, at: usize) {
        self.count += 1;
        if self.first.is_none() {
            self.first = Some((message, at));
        }
    }
}

/// Classify one session's matches; `None` when it does not qualify for `mode`
pub fn match_session(
    session: &SessionRecord,
    messages: &[Message],
    query: &str,
    mode: SearchMode,
) -> Option<SearchHit> {
    let needle = fold(query.trim());
    if needle.is_empty() {
        return None;
    }

    let mut user = RoleHits::new();
    let mut assistant = RoleHits::new();

    for message in messages {
        let Some(at) = find_folded(&fold(&message.content), &needle) else {
            continue;
        };
        match message.role {
            MessageRole::User => user.record(message, at),
            MessageRole::Assistant => assistant.record(message, at),
        }
    }

    // The first matching user utterance stands in for the session title
    let title_hit = user.count > 0;
    let (match_type, count, first) = match mode {
        SearchMode::Title => (SearchMatchType::Title, user.count, user.first),
        SearchMode::User => (SearchMatchType::User, user.count, user.first),
        SearchMode::Assistant => (SearchMatchType::Assistant, assistant.count, assistant.first),
        SearchMode::All => {
            let total = user.count + assistant.count;
            if title_hit {
                (SearchMatchType::Title, total, user.first)
            } else {
                (SearchMatchType::Assistant, total, assistant.first)
            }
        }
    };

    let (message, at) = first?;
    if count == 0 {
        return None;
    }

    Some(SearchHit {
        session: session.clone(),
        match_type,
        match_count: count,
        preview: context_preview(&message.content, at, needle.len()),
    })
}

/// Order hits by match type (title, user, assistant), then count, then recency
pub fn rank(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        a.match_type
            .cmp(&b.match_type)
            .then_with(|| b.match_count.cmp(&a.match_count))
            .then_with(|| b.session.modified_at.cmp(&a.session.modified_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn session(id: &str) -> SessionRecord {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        SessionRecord {
            session_id: id.to_string(),
            project_path: "/p".to_string(),
            created_at: ts,
            modified_at: ts,
            first_message_preview: String::new(),
            message_count: 0,
            size_bytes: 0,
            cost_usd: None,
            input_tokens: None,
            output_tokens: None,
            cache_read_tokens: None,
            cache_creation_tokens: None,
            duration_seconds: None,
            session_name: None,
            origin: None,
        }
    }

    fn msg(role: MessageRole, content: &str) -> Message {
        Message {
            uuid: content.to_string(),
            role,
            content: content.to_string(),
            timestamp: None,
            tool_uses: vec![],
        }
    }

    #[test]
    fn test_user_mode_counts_matching_user_messages() {
        let messages = vec![
            msg(MessageRole::User, "Fix the Parser please"),
            msg(MessageRole::Assistant, "The parser is fixed"),
            msg(MessageRole::User, "parser again; PARSER twice"),
            msg(MessageRole::User, "unrelated"),
        ];
        let hit = match_session(&session("s"), &messages, "parser", SearchMode::User).unwrap();
        assert_eq!(hit.match_type, SearchMatchType::User);
        assert_eq!(hit.match_count, 2);
        assert_eq!(hit.preview, "Fix the Parser please");
    }

    #[test]
    fn test_assistant_mode_requires_assistant_hit() {
        let messages = vec![msg(MessageRole::User, "needle here")];
        assert!(match_session(&session("s"), &messages, "needle", SearchMode::Assistant).is_none());
        assert!(match_session(&session("s"), &messages, "needle", SearchMode::Title).is_some());
    }

    #[test]
    fn test_all_mode_precedence() {
        let first_user = vec![
            msg(MessageRole::User, "needle first"),
            msg(MessageRole::Assistant, "needle reply"),
        ];
        let hit = match_session(&session("a"), &first_user, "NEEDLE", SearchMode::All).unwrap();
        assert_eq!(hit.match_type, SearchMatchType::Title);
        assert_eq!(hit.match_count, 2);

        let later_user = vec![
            msg(MessageRole::User, "hello"),
            msg(MessageRole::User, "a needle later"),
        ];
        // Title and All agree when only a later user message matches
        let hit = match_session(&session("b"), &later_user, "needle", SearchMode::All).unwrap();
        assert_eq!(hit.match_type, SearchMatchType::Title);
        assert_eq!(hit.preview, "a needle later");
        let titled =
            match_session(&session("b"), &later_user, "needle", SearchMode::Title).unwrap();
        assert_eq!(titled.match_type, hit.match_type);
        assert_eq!(titled.match_count, 1);

        let assistant_only = vec![
            msg(MessageRole::User, "hello"),
            msg(MessageRole::Assistant, "needle"),
        ];
        let hit =
            match_session(&session("c"), &assistant_only, "needle", SearchMode::All).unwrap();
        assert_eq!(hit.match_type, SearchMatchType::Assistant);
    }

    #[test]
    fn test_context_preview_truncates_with_ellipsis() {
        let text = format!("{}needle{}", "a".repeat(100), "b".repeat(100));
        let preview = context_preview(&text, 100, 6);
        assert!(preview.starts_with("..."));
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 3 + 60 + 6 + 60 + 3);
    }

    #[test]
    fn test_rank_orders_by_match_type() {
        let mut hits = vec![
            SearchHit {
                session: session("x"),
                match_type: SearchMatchType::Assistant,
                match_count: 5,
                preview: String::new(),
            },
            SearchHit {
                session: session("y"),
                match_type: SearchMatchType::Title,
                match_count: 1,
                preview: String::new(),
            },
        ];
        rank(&mut hits);
        assert_eq!(hits[0].session.session_id, "y");
    }
}
