//! # dkg-core
//!
//! A personal decision knowledge graph: ingests developer conversation
//! logs, extracts structured decision records with a cached, validated,
//! self-correcting LLM pipeline, resolves the entities they involve
//! through a multi-stage cascade, links everything into a bi-temporal
//! typed graph, and serves it back through hybrid retrieval and an
//! agent-facing context API.
//!
//! ## Core Components
//!
//! - **Parser**: JSONL log files → conversations → decision episodes
//! - **Extractor**: episodes → calibrated, verbatim-grounded decision traces
//! - **Resolver**: entity mentions → deduplicated graph entities
//! - **Graph**: SQLite-backed node/edge store and the write pipeline
//! - **Analysis**: supersession, contradiction, cycles, staleness, dormancy
//! - **Retrieve**: lexical + semantic fusion with graph expansion
//! - **Agent**: summary / focused-context / prior-art / remember
//!
//! ## Example
//!
//! ```rust,ignore
//! use dkg_core::{
//!     CoreConfig, DecisionExtractor, GraphStore, GraphWriter, LogParser,
//! };
//!
//! let store = GraphStore::open("graph.db")?;
//! let parser = LogParser::new(config.logs_root.clone());
//! for (file, conversations) in parser.parse_all_logs(None).await? {
//!     for conversation in &conversations {
//!         let traces = extractor.extract_by_episode(conversation, 10.0).await?;
//!         for trace in traces {
//!             writer.save_decision(trace, None).await?;
//!         }
//!     }
//! }
//! ```

pub mod agent;
pub mod analysis;
pub mod config;
pub mod error;
pub mod extract;
pub mod graph;
pub mod ingest;
pub mod kv;
pub mod llm;
pub mod notify;
pub mod ontology;
pub mod parser;
pub mod relational;
pub mod repo;
pub mod resolve;
pub mod retrieve;

// Re-exports for convenience
pub use agent::{
    AgentContextService, AgentSummary, ContextDecision, EntityContext, FocusedContext,
    KnowledgeGap, RememberOutcome, RememberRequest,
};
pub use analysis::{
    contradictions_for_decision, decision_evolution, detect_all_cycles, detect_cycles,
    find_dormant_alternatives, find_stale_decisions, mark_reviewed, AssumptionMonitor,
    AssumptionViolation, CrossUserScanner, CyclePath, DecisionEvolution, DormantAlternative,
    GraphValidator, IssueSeverity, IssueType, PairAnalyzer, PairRelation, PairVerdict,
    StaleDecision, ValidationIssue,
};
pub use config::{CalibrationMethod, CoreConfig, DormantWeights};
pub use error::{Error, Result};
pub use extract::{
    calibrate_composite, calibrate_temperature, completeness_score, detect_rationale_author,
    extract_json, extract_json_list, find_text_span, validate_decision, DecisionExtractor,
    DecisionType, ExtractedEntity, ExtractedRelationship, RawDecision,
};
pub use graph::{
    AnalyticsEvents, CandidateDecision, CodeEntity, CommitNode, DecisionSource, DecisionTrace,
    DecisionUpdate, Edge, Entity, GraphPage, GraphStats, GraphStore, GraphWriter, NodeKind,
    Provenance, RationaleAuthor, SaveListener, SaveOutcome, TextSpan, VerbatimSpan,
};
pub use ingest::{ImportOptions, IngestCoordinator, JobState, JobStatus};
pub use kv::{KvStore, MemoryKvStore};
pub use llm::{
    cosine_similarity, estimate_tokens, sanitize_prompt, strip_thinking_tags, ChatMessage,
    ChatRole, CompletionRequest, CompletionResponse, EmbeddingInputType, EmbeddingProvider,
    EmbeddingRequest, EmbeddingResponse, GenerateOptions, LlmProvider, LlmService, NimClient,
    ProviderConfig, RateLimiter, ResponseCache, RiskLevel, ThinkTagFilter, TokenUsage,
};
pub use notify::{
    ConnectionRegistry, Notification, NotificationKind, NotificationSink, NotificationStore,
    Notifier,
};
pub use ontology::{
    get_canonical_name, normalize_entity_name, validate_entity_relationship, EntityType,
    RelationType, Scope, ValidatedRelation,
};
pub use parser::{
    segment_into_episodes, ArcLabel, Conversation, Episode, LogParser, Message, ProjectInfo,
    Role, ToolCall,
};
pub use relational::{CaptureSession, CaptureStore, SessionMessage, SessionStatus};
pub use repo::{code_entity_from_path, language_from_extension, IndexedFile, RepoIndex};
pub use resolve::{
    merge_duplicate_entities, token_sort_ratio, EntityResolver, MatchMethod, MergeReport,
    RegistryLookup, ResolvedEntity,
};
pub use retrieve::{HybridQuery, HybridRetriever, NimReranker, Reranker, RetrievalHit};
