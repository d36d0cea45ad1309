//! Ingestion coordinator: the background import job.
//!
//! One job runs at a time per process. Job state lives in the KV store
//! under `import:current_job` (hash map, 1 hour TTL) so any handler can
//! report progress; a separate `import:cancel` key (300 s TTL) is polled
//! between files and between conversations. Per-file errors accumulate
//! into the job record; the job then completes as `completed_with_errors`
//! rather than aborting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::extract::DecisionExtractor;
use crate::graph::GraphWriter;
use crate::kv::KvStore;
use crate::parser::LogParser;
use crate::resolve::EntityResolver;

const JOB_KEY: &str = "import:current_job";
const CANCEL_KEY: &str = "import:cancel";
const JOB_TTL_SECS: u64 = 3600;
const CANCEL_TTL_SECS: u64 = 300;

/// Lifecycle of the import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Starting,
    Running,
    Completed,
    CompletedWithErrors,
    Cancelled,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "starting" => Self::Starting,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "completed_with_errors" => Self::CompletedWithErrors,
            "cancelled" => Self::Cancelled,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

/// Progress record for the current (or last) import job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub total_files: u64,
    pub processed_files: u64,
    pub current_file: String,
    pub decisions_extracted: u64,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobState {
    fn new(job_id: String, total_files: u64) -> Self {
        Self {
            job_id,
            status: JobStatus::Starting,
            total_files,
            processed_files: 0,
            current_file: String::new(),
            decisions_extracted: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("job_id".into(), self.job_id.clone());
        fields.insert("status".into(), self.status.as_str().to_string());
        fields.insert("total_files".into(), self.total_files.to_string());
        fields.insert("processed_files".into(), self.processed_files.to_string());
        fields.insert("current_file".into(), self.current_file.clone());
        fields.insert(
            "decisions_extracted".into(),
            self.decisions_extracted.to_string(),
        );
        fields.insert(
            "errors".into(),
            serde_json::to_string(&self.errors).unwrap_or_else(|_| "[]".into()),
        );
        fields.insert("started_at".into(), self.started_at.to_rfc3339());
        fields.insert(
            "completed_at".into(),
            self.completed_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        );
        fields
    }

    fn from_fields(fields: &HashMap<String, String>) -> Self {
        let get = |key: &str| fields.get(key).cloned().unwrap_or_default();
        Self {
            job_id: get("job_id"),
            status: JobStatus::parse(&get("status")),
            total_files: get("total_files").parse().unwrap_or(0),
            processed_files: get("processed_files").parse().unwrap_or(0),
            current_file: get("current_file"),
            decisions_extracted: get("decisions_extracted").parse().unwrap_or(0),
            errors: serde_json::from_str(&get("errors")).unwrap_or_default(),
            started_at: DateTime::parse_from_rfc3339(&get("started_at"))
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            completed_at: DateTime::parse_from_rfc3339(&get("completed_at"))
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// What to import.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Case-insensitive substring filter on the decoded project name.
    pub project_filter: Option<String>,
    /// Project names to include (empty = all).
    pub include_projects: Vec<String>,
    /// Project names to exclude.
    pub exclude_projects: Vec<String>,
    /// Explicit files to import instead of discovery. Paths outside the
    /// logs root are rejected.
    pub selected_files: Vec<PathBuf>,
}

/// Runs import jobs over the log tree.
pub struct IngestCoordinator {
    parser: Mutex<LogParser>,
    extractor: Arc<DecisionExtractor>,
    writer: Arc<GraphWriter>,
    resolver: Arc<EntityResolver>,
    kv: Arc<dyn KvStore>,
    episode_gap_minutes: f64,
}

impl IngestCoordinator {
    pub fn new(
        parser: LogParser,
        extractor: Arc<DecisionExtractor>,
        writer: Arc<GraphWriter>,
        resolver: Arc<EntityResolver>,
        kv: Arc<dyn KvStore>,
        episode_gap_minutes: f64,
    ) -> Self {
        Self {
            parser: Mutex::new(parser),
            extractor,
            writer,
            resolver,
            kv,
            episode_gap_minutes,
        }
    }

    /// Current job state, if any job ran within the state TTL.
    pub async fn progress(&self) -> Result<Option<JobState>> {
        Ok(self
            .kv
            .hgetall(JOB_KEY)
            .await?
            .map(|fields| JobState::from_fields(&fields)))
    }

    /// Request cancellation of the running job. Takes effect between
    /// files / conversations; returns whether a job was running.
    pub async fn cancel(&self) -> Result<bool> {
        let running = matches!(
            self.progress().await?.map(|s| s.status),
            Some(JobStatus::Running | JobStatus::Starting)
        );
        if running {
            self.kv.set(CANCEL_KEY, "1", Some(CANCEL_TTL_SECS)).await?;
        }
        Ok(running)
    }

    async fn cancelled(&self) -> bool {
        matches!(self.kv.get(CANCEL_KEY).await, Ok(Some(_)))
    }

    async fn write_state(&self, state: &JobState) -> Result<()> {
        self.kv.hset_all(JOB_KEY, &state.to_fields()).await?;
        self.kv.expire(JOB_KEY, JOB_TTL_SECS).await
    }

    fn project_passes(options: &ImportOptions, project: &str) -> bool {
        if let Some(filter) = &options.project_filter {
            if !project.to_lowercase().contains(&filter.to_lowercase()) {
                return false;
            }
        }
        if !options.include_projects.is_empty()
            && !options.include_projects.iter().any(|p| p == project)
        {
            return false;
        }
        if options.exclude_projects.iter().any(|p| p == project) {
            return false;
        }
        true
    }

    /// Files the job would import, after filters and the traversal guard.
    pub async fn discover_files(&self, options: &ImportOptions) -> Result<Vec<PathBuf>> {
        let parser = self.parser.lock().await;
        let logs_root = parser.logs_root().to_path_buf();

        if !options.selected_files.is_empty() {
            let mut accepted = Vec::new();
            for file in &options.selected_files {
                if !is_under_root(&logs_root, file) {
                    return Err(Error::Ingest(format!(
                        "path outside logs root rejected: {}",
                        file.display()
                    )));
                }
                accepted.push(file.clone());
            }
            return Ok(accepted);
        }

        Ok(parser
            .log_files()
            .into_iter()
            .filter(|path| {
                Self::project_passes(options, &parser.extract_project_name(path))
            })
            .collect())
    }

    /// Run an import job to completion. Fails fast with a conflict when a
    /// job is already running in this process.
    pub async fn run_import(&self, options: ImportOptions) -> Result<JobState> {
        if let Some(existing) = self.progress().await? {
            if matches!(existing.status, JobStatus::Running | JobStatus::Starting) {
                return Err(Error::JobConflict(format!(
                    "import job {} is already running",
                    existing.job_id
                )));
            }
        }
        let files = self.discover_files(&options).await?;
        let mut state = JobState::new(Uuid::new_v4().to_string(), files.len() as u64);
        self.write_state(&state).await?;
        info!(job_id = %state.job_id, files = files.len(), "import job starting");

        state.status = JobStatus::Running;
        self.write_state(&state).await?;

        let mut cancelled = false;
        'files: for file in &files {
            if self.cancelled().await {
                cancelled = true;
                break;
            }
            state.current_file = file.display().to_string();
            self.write_state(&state).await?;

            let bytes = match tokio::fs::read(file).await {
                Ok(b) => b,
                Err(e) => {
                    state
                        .errors
                        .push(format!("{}: read failed: {e}", file.display()));
                    state.processed_files += 1;
                    continue;
                }
            };
            {
                let mut parser = self.parser.lock().await;
                if parser.seen_before(&bytes) {
                    state.processed_files += 1;
                    continue;
                }
            }

            let conversations = {
                let parser = self.parser.lock().await;
                parser.parse_text(&String::from_utf8_lossy(&bytes), file)
            };

            for conversation in &conversations {
                if self.cancelled().await {
                    cancelled = true;
                    break 'files;
                }
                let traces = match self
                    .extractor
                    .extract_by_episode(conversation, self.episode_gap_minutes)
                    .await
                {
                    Ok(t) => t,
                    Err(e) => {
                        state
                            .errors
                            .push(format!("{}: extraction failed: {e}", file.display()));
                        continue;
                    }
                };
                for trace in traces {
                    match self.writer.save_decision(trace, None).await {
                        Ok(_) => state.decisions_extracted += 1,
                        Err(e) => state
                            .errors
                            .push(format!("{}: save failed: {e}", file.display())),
                    }
                }
            }

            state.processed_files += 1;
            self.write_state(&state).await?;
        }

        state.status = if cancelled {
            JobStatus::Cancelled
        } else if state.errors.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithErrors
        };
        state.completed_at = Some(Utc::now());
        state.current_file = String::new();
        self.write_state(&state).await?;
        let _ = self.kv.delete(CANCEL_KEY).await;

        // Import changed the entity set; stale resolution and agent
        // caches would serve pre-import answers.
        if let Err(e) = self.resolver.invalidate_cache().await {
            warn!(error = %e, "entity cache invalidation failed");
        }
        let _ = self
            .kv
            .delete_prefix(&format!("cache:agent:{}:", self.writer.user_id()))
            .await;

        info!(
            job_id = %state.job_id,
            status = state.status.as_str(),
            files = state.processed_files,
            decisions = state.decisions_extracted,
            errors = state.errors.len(),
            "import job finished"
        );
        Ok(state)
    }
}

/// Path traversal guard: `file` must resolve under `root` lexically.
fn is_under_root(root: &Path, file: &Path) -> bool {
    let mut normalized = PathBuf::new();
    for component in file.components() {
        match component {
            std::path::Component::ParentDir => {
                if !normalized.pop() {
                    return false;
                }
            }
            std::path::Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::graph::GraphStore;
    use crate::kv::MemoryKvStore;
    use crate::llm::testing::{StaticEmbedder, StaticProvider};
    use crate::llm::{LlmService, ResponseCache};
    use pretty_assertions::assert_eq;

    fn coordinator(
        logs_root: &Path,
        provider: StaticProvider,
    ) -> (IngestCoordinator, Arc<GraphStore>, Arc<MemoryKvStore>) {
        let store = Arc::new(GraphStore::in_memory().unwrap());
        let kv = Arc::new(MemoryKvStore::new());
        let embedder = Arc::new(StaticEmbedder::new());
        let llm = Arc::new(LlmService::new(
            Arc::new(provider),
            kv.clone(),
            CoreConfig::default(),
        ));
        let extractor = Arc::new(DecisionExtractor::new(
            llm,
            ResponseCache::new(kv.clone(), "v5", 3600),
        ));
        let resolver = Arc::new(EntityResolver::new(
            store.clone(),
            embedder.clone(),
            kv.clone(),
            "u1",
        ));
        let writer = Arc::new(GraphWriter::new(
            store.clone(),
            resolver.clone(),
            extractor.clone(),
            embedder,
            "u1",
            0.7,
            0.85,
        ));
        let coordinator = IngestCoordinator::new(
            LogParser::new(logs_root),
            extractor,
            writer,
            resolver,
            kv.clone(),
            10.0,
        );
        (coordinator, store, kv)
    }

    fn write_log(root: &Path, project: &str, name: &str, lines: &[&str]) -> PathBuf {
        let dir = root.join(format!("-home-u-{project}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    const EXTRACTION: &str = r#"[{
        "trigger": "Need to pick a database for the project data",
        "context": "Relational data with SQL-savvy team members",
        "options": ["PostgreSQL", "MongoDB"],
        "decision": "Use PostgreSQL as the primary database",
        "rationale": "Relational fit and existing team knowledge",
        "confidence": 0.95
    }]"#;

    #[tokio::test]
    async fn test_full_import_writes_decisions() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "demo",
            "a.jsonl",
            &[r#"{"type":"message","message":{"role":"user","content":"Let us use PostgreSQL over MongoDB"}}"#],
        );

        // Responses: type detection, extraction, entity extraction.
        let (coordinator, store, _kv) = coordinator(
            dir.path(),
            StaticProvider::new(vec![
                "technology",
                EXTRACTION,
                r#"{"entities": [{"name": "PostgreSQL", "type": "technology", "confidence": 0.95}]}"#,
            ]),
        );

        let state = coordinator.run_import(ImportOptions::default()).await.unwrap();
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.total_files, 1);
        assert_eq!(state.processed_files, 1);
        assert_eq!(state.decisions_extracted, 1);
        assert_eq!(store.count_decisions("u1").unwrap(), 1);

        // Progress hash is readable after completion.
        let progress = coordinator.progress().await.unwrap().unwrap();
        assert_eq!(progress.status, JobStatus::Completed);
        assert!(progress.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_conflict_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _store, kv) = coordinator(dir.path(), StaticProvider::new(vec![]));

        // Simulate a running job left by another handler.
        let running = JobState {
            status: JobStatus::Running,
            ..JobState::new("other-job".into(), 3)
        };
        kv.hset_all(JOB_KEY, &running.to_fields()).await.unwrap();

        let err = coordinator
            .run_import(ImportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobConflict(_)));
    }

    #[tokio::test]
    async fn test_cancellation_between_files() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "demo",
            "a.jsonl",
            &[r#"{"type":"message","message":{"role":"user","content":"conversation one"}}"#],
        );
        let (coordinator, _store, kv) = coordinator(
            dir.path(),
            StaticProvider::new(vec!["general", "[]"]),
        );

        // Pre-set the cancel flag: the job must stop before any file.
        kv.set(CANCEL_KEY, "1", Some(300)).await.unwrap();
        let state = coordinator.run_import(ImportOptions::default()).await.unwrap();
        assert_eq!(state.status, JobStatus::Cancelled);
        assert_eq!(state.processed_files, 0);
    }

    #[tokio::test]
    async fn test_dedup_skips_identical_second_file() {
        let dir = tempfile::tempdir().unwrap();
        let line = r#"{"type":"message","message":{"role":"user","content":"Pick PostgreSQL please"}}"#;
        write_log(dir.path(), "demo", "a.jsonl", &[line]);
        write_log(dir.path(), "demo", "b.jsonl", &[line]);

        let (coordinator, _store, _kv) = coordinator(
            dir.path(),
            StaticProvider::new(vec!["technology", EXTRACTION, "{\"entities\": []}"]),
        );
        let state = coordinator.run_import(ImportOptions::default()).await.unwrap();
        // Both files counted as processed, second one skipped by hash.
        assert_eq!(state.processed_files, 2);
        assert_eq!(state.decisions_extracted, 1);
    }

    #[tokio::test]
    async fn test_project_filter_and_traversal_guard() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), "alpha", "a.jsonl", &["{}"]);
        write_log(dir.path(), "beta", "b.jsonl", &["{}"]);
        let (coordinator, _store, _kv) = coordinator(dir.path(), StaticProvider::new(vec![]));

        let files = coordinator
            .discover_files(&ImportOptions {
                project_filter: Some("alpha".into()),
                ..ImportOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(files.len(), 1);

        let err = coordinator
            .discover_files(&ImportOptions {
                selected_files: vec![dir.path().join("../outside.jsonl")],
                ..ImportOptions::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ingest(_)));
    }
}
