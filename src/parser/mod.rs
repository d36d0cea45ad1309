//! JSONL conversation-log parsing and episode segmentation.
//!
//! Log files are append-only line-delimited JSON. Each line is either a
//! message event (`{"type":"message","message":{...},"timestamp":...}`,
//! where content is a string or a list of typed blocks) or a
//! `conversation_end` boundary marker. Unrecognized lines are skipped.

mod conversation;
mod segmenter;

pub use conversation::{Conversation, Message, Role, ToolCall};
pub use segmenter::{segment_into_episodes, ArcLabel, Episode};

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Summary of one project directory under the logs root.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    /// Directory name as it appears on disk.
    pub dir: String,
    /// Decoded project name.
    pub name: String,
    /// Number of log files.
    pub files: usize,
    /// Absolute directory path.
    pub path: PathBuf,
}

/// Parser for JSONL conversation logs with in-process file dedup.
pub struct LogParser {
    logs_root: PathBuf,
    /// SHA-256 hashes of files already parsed this process.
    processed_hashes: HashSet<String>,
}

impl LogParser {
    pub fn new(logs_root: impl Into<PathBuf>) -> Self {
        Self {
            logs_root: logs_root.into(),
            processed_hashes: HashSet::new(),
        }
    }

    pub fn logs_root(&self) -> &Path {
        &self.logs_root
    }

    fn file_hash(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    /// Record a file's content hash; returns true when it was already
    /// processed this run. Lets callers that drive their own file loop
    /// (the ingestion coordinator) share the dedup set.
    pub fn seen_before(&mut self, bytes: &[u8]) -> bool {
        !self.processed_hashes.insert(Self::file_hash(bytes))
    }

    /// Decode a project name from the log directory layout.
    ///
    /// Directories encode absolute paths with dashes
    /// (`-home-user-myproject`); everything past the user segment is the
    /// project name.
    pub fn extract_project_name(&self, file_path: &Path) -> String {
        let Some(relative) = file_path.strip_prefix(&self.logs_root).ok() else {
            return "unknown".to_string();
        };
        let Some(project_dir) = relative.components().next() else {
            return "unknown".to_string();
        };
        let dir = project_dir.as_os_str().to_string_lossy();
        let parts: Vec<&str> = dir.split('-').collect();
        if parts.len() > 3 {
            parts[3..].join("-")
        } else if parts.len() > 2 {
            parts.last().copied().unwrap_or("unknown").to_string()
        } else {
            dir.to_string()
        }
    }

    /// List project directories under the logs root with file counts.
    pub fn available_projects(&self) -> Vec<ProjectInfo> {
        let mut projects: HashMap<String, ProjectInfo> = HashMap::new();
        for path in self.log_files() {
            if path.to_string_lossy().contains("subagents") {
                continue;
            }
            let name = self.extract_project_name(&path);
            let parent = path.parent().unwrap_or(&self.logs_root);
            let dir = parent
                .file_name()
                .map(|d| d.to_string_lossy().into_owned())
                .unwrap_or_default();
            projects
                .entry(dir.clone())
                .or_insert_with(|| ProjectInfo {
                    dir,
                    name,
                    files: 0,
                    path: parent.to_path_buf(),
                })
                .files += 1;
        }
        let mut list: Vec<ProjectInfo> = projects.into_values().collect();
        list.sort_by(|a, b| a.dir.cmp(&b.dir));
        list
    }

    /// All `.jsonl` files under the logs root.
    pub fn log_files(&self) -> Vec<PathBuf> {
        let pattern = format!("{}/**/*.jsonl", self.logs_root.to_string_lossy());
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .map(|paths| paths.filter_map(std::result::Result::ok).collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    /// Parse one log file into conversations.
    pub async fn parse_file(&self, file_path: &Path) -> Result<Vec<Conversation>> {
        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|e| Error::Ingest(format!("cannot read {}: {e}", file_path.display())))?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(self.parse_text(&text, file_path))
    }

    /// Parse all logs, skipping files whose content hash was already seen.
    ///
    /// Yields `(file, conversations)` pairs; `project_filter` is a
    /// case-insensitive substring match on the decoded project name.
    pub async fn parse_all_logs(
        &mut self,
        project_filter: Option<&str>,
    ) -> Result<Vec<(PathBuf, Vec<Conversation>)>> {
        let mut results = Vec::new();
        for path in self.log_files() {
            if let Some(filter) = project_filter {
                let project = self.extract_project_name(&path);
                if !project.to_lowercase().contains(&filter.to_lowercase()) {
                    continue;
                }
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable log file");
                    continue;
                }
            };
            let hash = Self::file_hash(&bytes);
            if !self.processed_hashes.insert(hash) {
                debug!(file = %path.display(), "skipping already-processed file");
                continue;
            }

            let text = String::from_utf8_lossy(&bytes);
            let conversations = self.parse_text(&text, &path);
            results.push((path, conversations));
        }
        Ok(results)
    }

    /// Parse raw JSONL text into conversations.
    pub fn parse_text(&self, text: &str, file_path: &Path) -> Vec<Conversation> {
        let project_name = self.extract_project_name(file_path);
        let mut conversations: Vec<Conversation> = Vec::new();
        let mut current: Vec<Message> = Vec::new();
        // tool_use_id -> result text, populated by tool_result blocks so
        // the matching ToolCall can receive its result.
        let mut pending_results: HashMap<String, String> = HashMap::new();
        let mut turn_index = 0usize;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };

            if let Some(raw_msg) = entry.get("message") {
                let role = Role::parse(raw_msg.get("role").and_then(|v| v.as_str()).unwrap_or(""));
                let timestamp = entry
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let message = parse_structured_message(
                    role,
                    raw_msg.get("content"),
                    timestamp,
                    turn_index,
                    &mut pending_results,
                );

                // Results in user turns belong to the previous assistant
                // message's tool calls.
                if role == Role::User && !pending_results.is_empty() {
                    if let Some(last_assistant) = current
                        .iter_mut()
                        .rev()
                        .find(|m| m.role == Role::Assistant)
                    {
                        for tc in &mut last_assistant.tool_calls {
                            if let Some(result) = pending_results.remove(&tc.tool_use_id) {
                                tc.result = Some(result);
                            }
                        }
                    }
                }

                if !message.is_empty() {
                    current.push(message);
                    turn_index += 1;
                }
            }

            if entry.get("type").and_then(|v| v.as_str()) == Some("conversation_end")
                && !current.is_empty()
            {
                conversations.push(Conversation::new(
                    std::mem::take(&mut current),
                    file_path.to_string_lossy(),
                    project_name.clone(),
                ));
                pending_results.clear();
                turn_index = 0;
            }
        }

        if !current.is_empty() {
            conversations.push(Conversation::new(
                current,
                file_path.to_string_lossy(),
                project_name,
            ));
        }

        conversations
    }
}

/// Extract visible text from a content-blocks list.
///
/// `tool_use` blocks render as compact `[Tool: Name(param)]` markers;
/// thinking and tool_result blocks are handled at the structured layer.
fn extract_text_from_blocks(blocks: &[serde_json::Value]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for block in blocks {
        if let Some(s) = block.as_str() {
            parts.push(s.to_string());
            continue;
        }
        let Some(obj) = block.as_object() else {
            continue;
        };
        match obj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        parts.push(text.to_string());
                    }
                }
            }
            "tool_use" => {
                let name = obj.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
                let input = obj.get("input").and_then(|v| v.as_object());
                let summary = input.and_then(|inp| {
                    ["command", "file_path", "path", "pattern", "query"]
                        .iter()
                        .find_map(|key| inp.get(*key))
                        .and_then(|v| v.as_str())
                        .map(|s| s.chars().take(80).collect::<String>())
                });
                match summary {
                    Some(s) => parts.push(format!("[Tool: {name}({s})]")),
                    None => parts.push(format!("[Tool: {name}]")),
                }
            }
            _ => {}
        }
    }
    parts.join("")
}

fn parse_structured_message(
    role: Role,
    raw_content: Option<&serde_json::Value>,
    timestamp: Option<String>,
    turn_index: usize,
    pending_results: &mut HashMap<String, String>,
) -> Message {
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut thinking_parts: Vec<String> = Vec::new();
    let mut content = String::new();

    match raw_content {
        Some(serde_json::Value::String(s)) => content = s.clone(),
        Some(serde_json::Value::Array(blocks)) => {
            content = extract_text_from_blocks(blocks);
            for block in blocks {
                let Some(obj) = block.as_object() else {
                    continue;
                };
                match obj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "thinking" => {
                        let text = obj
                            .get("thinking")
                            .or_else(|| obj.get("text"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if !text.is_empty() {
                            thinking_parts.push(text.to_string());
                        }
                    }
                    "tool_use" => {
                        let mut tc = ToolCall {
                            name: obj
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("unknown")
                                .to_string(),
                            input: obj
                                .get("input")
                                .and_then(|v| v.as_object())
                                .cloned()
                                .unwrap_or_default(),
                            tool_use_id: obj
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            result: None,
                        };
                        // Same-turn result, if already collected.
                        if !tc.tool_use_id.is_empty() {
                            tc.result = pending_results.remove(&tc.tool_use_id);
                        }
                        tool_calls.push(tc);
                    }
                    "tool_result" => {
                        let id = obj
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if id.is_empty() {
                            continue;
                        }
                        let result_text = match obj.get("content") {
                            Some(serde_json::Value::String(s)) => s.clone(),
                            Some(serde_json::Value::Array(inner)) => inner
                                .iter()
                                .filter_map(|b| b.as_object())
                                .filter(|b| {
                                    b.get("type").and_then(|v| v.as_str()) == Some("text")
                                })
                                .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
                                .collect::<Vec<_>>()
                                .join(""),
                            Some(other) => other.to_string(),
                            None => String::new(),
                        };
                        pending_results.insert(id.to_string(), result_text);
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    Message {
        role,
        content,
        timestamp,
        tool_calls,
        thinking: if thinking_parts.is_empty() {
            None
        } else {
            Some(thinking_parts.join("\n\n"))
        },
        turn_index,
    }
}
