//! Node and edge types for the decision knowledge graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ontology::{EntityType, RelationType, Scope};

/// Character-offset span into the original conversation text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    /// Inclusive start offset in the full conversation text.
    pub start: usize,
    /// Exclusive end offset.
    pub end: usize,
    /// Turn containing the span start.
    pub turn_index: Option<usize>,
}

/// An exact source quote plus its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerbatimSpan {
    pub text: String,
    pub span: TextSpan,
}

/// Where a decision record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    ClaudeLogs,
    Interview,
    Manual,
    Unknown,
    /// Created programmatically by a named AI agent.
    #[serde(untagged)]
    Agent(String),
}

impl DecisionSource {
    pub fn as_string(&self) -> String {
        match self {
            Self::ClaudeLogs => "claude_logs".to_string(),
            Self::Interview => "interview".to_string(),
            Self::Manual => "manual".to_string(),
            Self::Unknown => "unknown".to_string(),
            Self::Agent(name) => format!("agent:{name}"),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "claude_logs" => Self::ClaudeLogs,
            "interview" => Self::Interview,
            "manual" => Self::Manual,
            "unknown" => Self::Unknown,
            other => match other.strip_prefix("agent:") {
                Some(name) => Self::Agent(name.to_string()),
                None => Self::Unknown,
            },
        }
    }
}

/// Who supplied the rationale text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RationaleAuthor {
    /// From an extended-thinking block; highest fidelity.
    Thinking,
    /// Stated by the user in their own words.
    User,
    /// Paraphrased by the assistant.
    Assistant,
}

impl RationaleAuthor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "thinking" => Self::Thinking,
            "user" => Self::User,
            _ => Self::Assistant,
        }
    }

    /// Source-fidelity factor for confidence calibration.
    pub fn fidelity(&self) -> f64 {
        match self {
            Self::Thinking => 1.0,
            Self::User => 0.85,
            Self::Assistant => 0.6,
        }
    }
}

/// How and from where a record was created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// A structured record of a single decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// Lower-case UUID.
    pub id: String,
    /// Owning user; `None` is legacy data visible to any user.
    pub user_id: Option<String>,
    pub project_name: Option<String>,

    /// What prompted the decision.
    pub trigger: String,
    /// Situation and constraints.
    pub context: String,
    /// Alternatives considered, in order; the chosen one included.
    pub options: Vec<String>,
    /// The choice made.
    pub agent_decision: String,
    /// Why it was made.
    pub agent_rationale: String,

    /// Calibrated confidence in [0, 1].
    pub confidence: f64,
    /// Pre-calibration score as returned by the extractor.
    pub raw_confidence: f64,
    pub scope: Scope,
    pub source: DecisionSource,

    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub edit_count: i64,
    /// Set when a newer decision supersedes this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reviewed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbatim_trigger: Option<VerbatimSpan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbatim_decision: Option<VerbatimSpan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbatim_rationale: Option<VerbatimSpan>,

    /// Episode thinking-block text; highest-fidelity rationale source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_rationale: Option<String>,
    pub rationale_author: RationaleAuthor,
    /// Explicit assumptions the decision rests on.
    pub assumptions: Vec<String>,

    /// Conversation-local position, for FOLLOWS/PRECEDES ordering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<i64>,

    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,

    /// Tool-call file paths from the source episode; consumed by the
    /// writer to create ground-truth AFFECTS edges, not persisted on the
    /// node itself.
    #[serde(skip)]
    pub tool_file_paths: Vec<String>,
}

impl DecisionTrace {
    /// New trace with generated id and timestamps, ready to fill in.
    pub fn new(trigger: impl Into<String>, agent_decision: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: None,
            project_name: None,
            trigger: trigger.into(),
            context: String::new(),
            options: Vec::new(),
            agent_decision: agent_decision.into(),
            agent_rationale: String::new(),
            confidence: 0.5,
            raw_confidence: 0.5,
            scope: Scope::Unknown,
            source: DecisionSource::Unknown,
            created_at: Utc::now(),
            edited_at: None,
            edit_count: 0,
            expired_at: None,
            last_reviewed_at: None,
            verbatim_trigger: None,
            verbatim_decision: None,
            verbatim_rationale: None,
            raw_rationale: None,
            rationale_author: RationaleAuthor::Assistant,
            assumptions: Vec::new(),
            turn_index: None,
            embedding: None,
            provenance: None,
            tool_file_paths: Vec::new(),
        }
    }

    /// Text fed to the embedding model for this decision.
    pub fn embedding_text(&self) -> String {
        format!(
            "{} | {} | {} | {} | {}",
            self.trigger,
            self.context,
            self.options.join(", "),
            self.agent_decision,
            self.agent_rationale
        )
    }

    /// Rejected options: everything in `options` other than the choice.
    pub fn rejected_options(&self) -> Vec<&str> {
        let chosen = self.agent_decision.to_lowercase();
        self.options
            .iter()
            .filter(|o| {
                let lower = o.to_lowercase();
                lower != chosen && !chosen.contains(&lower)
            })
            .map(String::as_str)
            .collect()
    }

    /// Anchor date for staleness: last review, else creation.
    pub fn staleness_anchor(&self) -> DateTime<Utc> {
        self.last_reviewed_at.unwrap_or(self.created_at)
    }
}

/// A named thing a decision touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: None,
            name: name.into(),
            entity_type,
            aliases: Vec::new(),
            embedding: None,
            created_at: Utc::now(),
        }
    }

    /// Text fed to the embedding model: type-prefixed name.
    pub fn embedding_text(&self) -> String {
        format!("{}: {}", self.entity_type, self.name)
    }
}

/// A rejected alternative, kept for dormant-alternative scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateDecision {
    pub id: String,
    pub user_id: Option<String>,
    pub text: String,
    pub rejected_at: DateTime<Utc>,
    pub rejected_by_decision_id: String,
}

/// A file path in a real repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeEntity {
    pub id: String,
    pub user_id: Option<String>,
    /// Repo-relative path.
    pub file_path: String,
    pub file_stem: String,
    /// Inferred from the extension.
    pub language: String,
    pub line_count: Option<i64>,
    pub size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A git commit linked to decisions and the files it touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitNode {
    pub id: String,
    pub user_id: Option<String>,
    pub commit_hash: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Node kind discriminator stored on edge endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Decision,
    Entity,
    Candidate,
    Code,
    Commit,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Entity => "entity",
            Self::Candidate => "candidate",
            Self::Code => "code",
            Self::Commit => "commit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decision" => Some(Self::Decision),
            "entity" => Some(Self::Entity),
            "candidate" => Some(Self::Candidate),
            "code" => Some(Self::Code),
            "commit" => Some(Self::Commit),
            _ => None,
        }
    }
}

/// A typed, directed edge with bi-temporal validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub src_id: String,
    pub src_kind: NodeKind,
    pub dst_id: String,
    pub dst_kind: NodeKind,
    pub relation: RelationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// When the relationship became true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<DateTime<Utc>>,
    /// When it ceased to be true (set by supersession).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<DateTime<Utc>>,
    /// Extra annotations (similarity tier, shared-entity count, ...).
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(
        src_id: impl Into<String>,
        src_kind: NodeKind,
        dst_id: impl Into<String>,
        dst_kind: NodeKind,
        relation: RelationType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            src_id: src_id.into(),
            src_kind,
            dst_id: dst_id.into(),
            dst_kind,
            relation,
            confidence: None,
            weight: None,
            reasoning: None,
            valid_at: None,
            invalid_at: None,
            properties: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_valid_at(mut self, at: DateTime<Utc>) -> Self {
        self.valid_at = Some(at);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Fields a caller may change on a stored decision.
///
/// Everything else on the node is immutable after save; updates bump
/// `edited_at`/`edit_count` and invalidate caches.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionUpdate {
    pub trigger: Option<String>,
    pub context: Option<String>,
    pub options: Option<Vec<String>>,
    pub agent_decision: Option<String>,
    pub agent_rationale: Option<String>,
    pub confidence: Option<f64>,
    pub scope: Option<Scope>,
    pub project_name: Option<String>,
    pub assumptions: Option<Vec<String>>,
}

impl DecisionUpdate {
    pub fn is_empty(&self) -> bool {
        self.trigger.is_none()
            && self.context.is_none()
            && self.options.is_none()
            && self.agent_decision.is_none()
            && self.agent_rationale.is_none()
            && self.confidence.is_none()
            && self.scope.is_none()
            && self.project_name.is_none()
            && self.assumptions.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_roundtrip() {
        assert_eq!(DecisionSource::parse("claude_logs"), DecisionSource::ClaudeLogs);
        assert_eq!(
            DecisionSource::parse("agent:planner").as_string(),
            "agent:planner"
        );
        assert_eq!(DecisionSource::parse("bogus"), DecisionSource::Unknown);
    }

    #[test]
    fn test_rejected_options_exclude_choice() {
        let mut d = DecisionTrace::new("pick db", "Use PostgreSQL");
        d.options = vec!["PostgreSQL".to_string(), "MongoDB".to_string()];
        assert_eq!(d.rejected_options(), vec!["MongoDB"]);
    }

    #[test]
    fn test_embedding_text_concatenates_fields() {
        let mut d = DecisionTrace::new("pick db", "PostgreSQL");
        d.context = "relational data".to_string();
        d.options = vec!["PostgreSQL".to_string(), "MongoDB".to_string()];
        d.agent_rationale = "team knows SQL".to_string();
        let text = d.embedding_text();
        assert!(text.contains("pick db"));
        assert!(text.contains("PostgreSQL, MongoDB"));
        assert!(text.contains("team knows SQL"));
    }

    #[test]
    fn test_staleness_anchor_prefers_review() {
        let mut d = DecisionTrace::new("t", "d");
        assert_eq!(d.staleness_anchor(), d.created_at);
        let reviewed = Utc::now();
        d.last_reviewed_at = Some(reviewed);
        assert_eq!(d.staleness_anchor(), reviewed);
    }
}
