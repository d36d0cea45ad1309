//! Structured conversation types built from JSONL log events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One tool invocation from an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name (Bash, Edit, Read, Write, Glob, Grep, ...)
    pub name: String,
    /// Full parameter map as supplied to the tool.
    pub input: Map<String, Value>,
    /// ID correlating tool_use and tool_result blocks.
    pub tool_use_id: String,
    /// Raw text returned by the tool, matched from the following user turn.
    pub result: Option<String>,
}

impl ToolCall {
    /// One-line summary of the most important input parameter.
    pub fn params_summary(&self, max_len: usize) -> String {
        let preferred = ["command", "file_path", "path", "pattern", "query"];
        let value = preferred
            .iter()
            .find_map(|key| self.input.get(*key))
            .or_else(|| self.input.values().next());

        match value {
            Some(v) => truncate_chars(&value_to_text(v), max_len),
            None => String::new(),
        }
    }

    /// File paths referenced in this tool call's input.
    ///
    /// Ground-truth file references used downstream to create AFFECTS
    /// edges without fuzzy matching.
    pub fn file_paths(&self) -> Vec<String> {
        ["file_path", "path", "notebook_path"]
            .iter()
            .filter_map(|key| self.input.get(*key))
            .filter_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Unknown,
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

/// One turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Human-readable text; tool calls render as `[Tool: Name(summary)]`.
    pub content: String,
    /// ISO-8601 timestamp from the log entry.
    pub timestamp: Option<String>,
    /// Structured tool calls for assistant turns.
    pub tool_calls: Vec<ToolCall>,
    /// Raw extended-thinking text. The model's internal deliberation and
    /// the highest-fidelity rationale source; stripped from user-visible
    /// output but preserved here.
    pub thinking: Option<String>,
    /// Zero-based sequential index within the conversation.
    pub turn_index: usize,
}

impl Message {
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty() && self.thinking.is_none()
    }
}

/// An ordered sequence of messages from one log file segment.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub messages: Vec<Message>,
    /// Source log file.
    pub file_path: String,
    /// Optional grouping tag extracted from the log directory layout.
    pub project_name: String,
    /// When this conversation was ingested.
    pub ingested_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(messages: Vec<Message>, file_path: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            messages,
            file_path: file_path.into(),
            project_name: project_name.into(),
            ingested_at: Utc::now(),
        }
    }

    /// Flat `role: content` text of the whole conversation.
    pub fn full_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// First ~`max_chars` of the flat text, for listings.
    pub fn preview(&self, max_chars: usize) -> String {
        let full = self.full_text();
        if full.chars().count() <= max_chars {
            full
        } else {
            let cut: String = full.chars().take(max_chars).collect();
            format!("{cut}...")
        }
    }
}

/// Truncate to `max_len` characters, appending an ellipsis when cut.
pub(crate) fn truncate_chars(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len).collect();
        format!("{cut}…")
    }
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            input: input.as_object().cloned().unwrap_or_default(),
            tool_use_id: "tu_1".to_string(),
            result: None,
        }
    }

    #[test]
    fn test_params_summary_prefers_path_keys() {
        let tc = tool_call(
            "Edit",
            json!({"new_string": "xyz", "file_path": "src/main.rs"}),
        );
        assert_eq!(tc.params_summary(120), "src/main.rs");
    }

    #[test]
    fn test_params_summary_truncates() {
        let long = "x".repeat(200);
        let tc = tool_call("Bash", json!({ "command": long }));
        let summary = tc.params_summary(120);
        assert_eq!(summary.chars().count(), 121); // 120 + ellipsis
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn test_file_paths_extraction() {
        let tc = tool_call(
            "Write",
            json!({"file_path": "src/lib.rs", "content": "..."}),
        );
        assert_eq!(tc.file_paths(), vec!["src/lib.rs".to_string()]);

        let tc = tool_call("Bash", json!({"command": "ls"}));
        assert!(tc.file_paths().is_empty());
    }

    #[test]
    fn test_conversation_preview() {
        let conv = Conversation::new(
            vec![Message {
                role: Role::User,
                content: "a".repeat(600),
                timestamp: None,
                tool_calls: vec![],
                thinking: None,
                turn_index: 0,
            }],
            "log.jsonl",
            "proj",
        );
        let preview = conv.preview(500);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 503);
    }
}
