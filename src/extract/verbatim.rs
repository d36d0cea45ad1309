//! Verbatim grounding: locating exact quotes in the source conversation.
//!
//! The LLM returns verbatim quotes with its own whitespace; the source has
//! the original's. Matching happens in a whitespace-collapsed projection of
//! both, then the match offsets are mapped back to original character
//! positions so spans index the real text.

use crate::graph::{TextSpan, VerbatimSpan};
use crate::parser::Conversation;

/// Collapse runs of whitespace to single spaces, recording for each
/// character of the projection its offset in the original.
fn normalize_with_map(text: &str) -> (String, Vec<usize>) {
    let mut normalized = String::with_capacity(text.len());
    let mut map: Vec<usize> = Vec::with_capacity(text.len());
    let mut pending_space = false;

    for (offset, ch) in text.char_indices() {
        if ch.is_whitespace() {
            pending_space = !normalized.is_empty();
            continue;
        }
        if pending_space {
            normalized.push(' ');
            map.push(offset);
            pending_space = false;
        }
        normalized.push(ch);
        for _ in 0..ch.len_utf8() {
            map.push(offset);
        }
    }
    (normalized, map)
}

/// Find `verbatim` in the conversation's full text, returning a span with
/// original character offsets. `turn_hint` is trusted when supplied;
/// otherwise the containing message is located by offset.
pub fn find_text_span(
    conversation: &Conversation,
    verbatim: &str,
    turn_hint: Option<i64>,
) -> Option<VerbatimSpan> {
    if verbatim.trim().is_empty() {
        return None;
    }

    let full_text = conversation.full_text();
    let (norm_source, map) = normalize_with_map(&full_text);
    let (norm_needle, _) = normalize_with_map(verbatim);

    let found = norm_source.to_lowercase().find(&norm_needle.to_lowercase())?;
    let end_norm = found + norm_needle.len();

    let start = *map.get(found)?;
    let end = match map.get(end_norm.saturating_sub(1)) {
        Some(&last) => {
            // Step past the final character of the match.
            let ch_len = full_text[last..].chars().next().map_or(1, char::len_utf8);
            last + ch_len
        }
        None => full_text.len(),
    };

    let turn_index = match turn_hint {
        Some(t) if t >= 0 => Some(t as usize),
        _ => locate_turn(conversation, start),
    };

    Some(VerbatimSpan {
        text: verbatim.to_string(),
        span: TextSpan {
            start,
            end,
            turn_index,
        },
    })
}

/// Which message contains character offset `start` of the full text.
fn locate_turn(conversation: &Conversation, start: usize) -> Option<usize> {
    let mut pos = 0usize;
    for (i, msg) in conversation.messages.iter().enumerate() {
        let rendered = format!("{}: {}", msg.role.as_str(), msg.content);
        let end = pos + rendered.len();
        if start >= pos && start < end {
            return Some(i);
        }
        pos = end + 2; // joining "\n\n"
    }
    None
}
