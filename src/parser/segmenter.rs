//! Episode segmentation: splitting a conversation into decision arcs.
//!
//! Extracting per-episode rather than per-conversation keeps the context
//! window small, avoids mixing decisions from different arcs, and lets the
//! arc label travel with the extracted decision.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::conversation::{truncate_chars, Message, Role};

const EXPLORATION_TOOLS: [&str; 6] = ["Read", "Glob", "Grep", "Bash", "WebFetch", "WebSearch"];
const WRITE_TOOLS: [&str; 3] = ["Edit", "Write", "NotebookEdit"];
const BOUNDARY_PHRASES: [&str; 12] = [
    "done",
    "looks good",
    "perfect",
    "let's move on",
    "next step",
    "lgtm",
    "approved",
    "thank you",
    "thanks",
    "great",
    "ship it",
    "moving on",
];

/// Shape of an episode, classified from its tool-call pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcLabel {
    /// Problem statement / task definition
    Setup,
    /// Reading files, running commands, gathering info
    Exploration,
    /// Change of approach after a dead end
    Pivot,
    /// Writing / editing code
    Implementation,
    /// Running tests, confirming results
    Verification,
    Unknown,
}

impl ArcLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Exploration => "exploration",
            Self::Pivot => "pivot",
            Self::Implementation => "implementation",
            Self::Verification => "verification",
            Self::Unknown => "unknown",
        }
    }
}

/// A contiguous cluster of messages representing one decision arc.
#[derive(Debug, Clone)]
pub struct Episode {
    pub messages: Vec<Message>,
    /// Conversation-local index of the first message.
    pub turn_start: usize,
    pub arc_label: ArcLabel,
}

impl Episode {
    /// Flat `role: content` text for LLM prompts.
    pub fn text_content(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Rich representation for the extraction pipeline: per turn, the
    /// thinking block, each tool call with a parameter summary and a
    /// truncated result, then the visible response text.
    pub fn structured_text(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.messages.len());
        for msg in &self.messages {
            let mut sections = vec![format!("[Turn {} | {}]", msg.turn_index, msg.role.as_str())];

            if let Some(thinking) = &msg.thinking {
                sections.push(format!("<thinking>\n{thinking}\n</thinking>"));
            }

            for tc in &msg.tool_calls {
                let params = tc.params_summary(120);
                let line = format!("Tool: {}({params})", tc.name);
                match &tc.result {
                    Some(result) => {
                        sections.push(format!("{line}\nResult: {}", truncate_chars(result, 500)));
                    }
                    None => sections.push(line),
                }
            }

            if !msg.content.is_empty() {
                sections.push(format!("Response: {}", msg.content));
            }

            parts.push(sections.join("\n"));
        }
        parts.join("\n\n")
    }

    /// Concatenated thinking blocks across the episode.
    pub fn thinking_text(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| m.thinking.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Union of file paths referenced by tool calls in this episode.
    pub fn tool_file_paths(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .flat_map(|tc| tc.file_paths())
            .collect();
        set.into_iter().collect()
    }
}

fn is_exploration(tool: &str) -> bool {
    EXPLORATION_TOOLS.contains(&tool)
}

fn is_write(tool: &str) -> bool {
    WRITE_TOOLS.contains(&tool)
}

/// Boundary heuristic for the message at the end of the current cluster.
///
/// Signals: a write tool following ≥2 exploration calls; a timestamp gap
/// over `gap_minutes`; a user turn after ≥3 assistant tool calls; a user
/// turn containing a done/moving-on phrase.
fn is_episode_boundary(
    msg: &Message,
    next_msg: Option<&Message>,
    cluster_tools: &[String],
    gap_minutes: f64,
) -> bool {
    let explore_count = cluster_tools.iter().filter(|t| is_exploration(t)).count();
    let has_write = cluster_tools.iter().any(|t| is_write(t));
    if has_write && explore_count >= 2 {
        return true;
    }

    if let Some(next) = next_msg {
        if let (Some(t1), Some(t2)) = (msg.parsed_timestamp(), next.parsed_timestamp()) {
            let gap = (t2 - t1).num_seconds() as f64 / 60.0;
            if gap > gap_minutes {
                return true;
            }
        }
    }

    if msg.role == Role::User && cluster_tools.len() >= 3 {
        return true;
    }

    if msg.role == Role::User {
        let lower = msg.content.to_lowercase();
        if BOUNDARY_PHRASES.iter().any(|p| lower.contains(p)) {
            return true;
        }
    }

    false
}

/// Classify an episode's arc from its tool-call pattern.
fn classify_arc(messages: &[Message]) -> ArcLabel {
    let tools: Vec<&str> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .map(|tc| tc.name.as_str())
        .collect();

    let has_write = tools.iter().any(|t| is_write(t));
    let has_explore = tools.iter().any(|t| is_exploration(t));

    if tools.is_empty() {
        return if messages.len() <= 2 {
            ArcLabel::Setup
        } else {
            ArcLabel::Verification
        };
    }
    match (has_write, has_explore) {
        (true, false) => ArcLabel::Implementation,
        (true, true) => ArcLabel::Pivot,
        (false, true) => ArcLabel::Exploration,
        (false, false) => ArcLabel::Unknown,
    }
}

/// Split a conversation's messages into decision episodes.
///
/// Only clusters of ≥2 messages are emitted at boundaries; a conversation
/// that never hits a boundary yields one episode covering everything.
pub fn segment_into_episodes(messages: &[Message], gap_minutes: f64) -> Vec<Episode> {
    if messages.is_empty() {
        return Vec::new();
    }

    let mut episodes: Vec<Episode> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut cluster_tools: Vec<String> = Vec::new();
    let mut turn_start = 0usize;

    for (i, msg) in messages.iter().enumerate() {
        current.push(msg.clone());
        for tc in &msg.tool_calls {
            cluster_tools.push(tc.name.clone());
        }

        let next_msg = messages.get(i + 1);
        if is_episode_boundary(msg, next_msg, &cluster_tools, gap_minutes) {
            if current.len() >= 2 {
                episodes.push(Episode {
                    arc_label: classify_arc(&current),
                    messages: std::mem::take(&mut current),
                    turn_start,
                });
            } else {
                current.clear();
            }
            turn_start = i + 1;
            cluster_tools.clear();
        }
    }

    if !current.is_empty() {
        episodes.push(Episode {
            arc_label: classify_arc(&current),
            messages: current,
            turn_start,
        });
    }

    if episodes.is_empty() {
        episodes.push(Episode {
            arc_label: classify_arc(messages),
            messages: messages.to_vec(),
            turn_start: 0,
        });
    }

    episodes
}
