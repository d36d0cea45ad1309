//! Repository file index for code-entity resolution.
//!
//! Tool-call paths are ground truth and become code entities directly.
//! Natural-language file mentions ("the parser module") go through the
//! index, which is built by globbing a real repository and matched with
//! the file-type fuzzy threshold.

use chrono::Utc;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::graph::CodeEntity;
use crate::ontology::EntityType;
use crate::resolve::token_sort_ratio;

/// Infer a language label from a file extension.
pub fn language_from_extension(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("rs") => "rust",
        Some("py") => "python",
        Some("js") | Some("mjs") | Some("cjs") => "javascript",
        Some("ts") | Some("tsx") => "typescript",
        Some("jsx") => "javascript",
        Some("go") => "go",
        Some("java") => "java",
        Some("kt") => "kotlin",
        Some("rb") => "ruby",
        Some("c") | Some("h") => "c",
        Some("cpp") | Some("cc") | Some("hpp") => "cpp",
        Some("cs") => "csharp",
        Some("swift") => "swift",
        Some("sh") | Some("bash") => "shell",
        Some("sql") => "sql",
        Some("md") => "markdown",
        Some("toml") => "toml",
        Some("yaml") | Some("yml") => "yaml",
        Some("json") => "json",
        Some("html") => "html",
        Some("css") => "css",
        _ => "unknown",
    }
}

/// Build a code entity from a bare path, without touching disk.
pub fn code_entity_from_path(path: &str, user_id: Option<&str>) -> CodeEntity {
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    CodeEntity {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.map(String::from),
        file_path: path.to_string(),
        file_stem: stem,
        language: language_from_extension(path).to_string(),
        line_count: None,
        size_bytes: None,
        created_at: Utc::now(),
    }
}

/// One indexed repository file.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    /// Repo-relative path.
    pub path: String,
    pub stem: String,
    pub language: String,
    pub line_count: i64,
    pub size_bytes: i64,
}

/// In-memory index of a repository's files.
pub struct RepoIndex {
    root: PathBuf,
    files: Vec<IndexedFile>,
}

impl RepoIndex {
    /// Index every source file under `root`.
    pub fn build(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let pattern = format!("{}/**/*", root.to_string_lossy());
        let mut files = Vec::new();

        for entry in glob::glob(&pattern).into_iter().flatten().flatten() {
            if !entry.is_file() {
                continue;
            }
            let path_str = entry.to_string_lossy();
            if path_str.contains("/.git/")
                || path_str.contains("/target/")
                || path_str.contains("/node_modules/")
            {
                continue;
            }
            let relative = entry
                .strip_prefix(&root)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| path_str.into_owned());
            let (line_count, size_bytes) = match std::fs::read_to_string(&entry) {
                Ok(content) => (content.lines().count() as i64, content.len() as i64),
                Err(_) => (0, entry.metadata().map(|m| m.len() as i64).unwrap_or(0)),
            };
            files.push(IndexedFile {
                stem: Path::new(&relative)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                language: language_from_extension(&relative).to_string(),
                path: relative,
                line_count,
                size_bytes,
            });
        }

        Self { root, files }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Resolve a natural-language file mention to an indexed file.
    ///
    /// Exact path or stem matches win; otherwise fuzzy at the file-type
    /// threshold. Returns the match with its score (< 1.0 for fuzzy).
    pub fn resolve_mention(&self, mention: &str) -> Option<(&IndexedFile, f64)> {
        let needle = mention.trim();
        if needle.is_empty() {
            return None;
        }

        if let Some(file) = self
            .files
            .iter()
            .find(|f| f.path == needle || f.path.ends_with(&format!("/{needle}")))
        {
            return Some((file, 1.0));
        }
        if let Some(file) = self
            .files
            .iter()
            .find(|f| f.stem.eq_ignore_ascii_case(needle))
        {
            return Some((file, 0.99));
        }

        let threshold = EntityType::File.fuzzy_threshold();
        self.files
            .iter()
            .map(|f| (f, token_sort_ratio(&f.stem, needle)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Full code entity for an indexed file.
    pub fn to_code_entity(&self, file: &IndexedFile, user_id: Option<&str>) -> CodeEntity {
        CodeEntity {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.map(String::from),
            file_path: file.path.clone(),
            file_stem: file.stem.clone(),
            language: file.language.clone(),
            line_count: Some(file.line_count),
            size_bytes: Some(file.size_bytes),
            created_at: Utc::now(),
        }
    }
}
