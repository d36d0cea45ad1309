//! The decision knowledge graph: node/edge types, the SQLite-backed
//! store, and the write pipeline.

mod schema;
mod store;
mod types;
mod writer;

pub use schema::{initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::{GraphPage, GraphStats, GraphStore, NeighborEntry};
pub use types::{
    CandidateDecision, CodeEntity, CommitNode, DecisionSource, DecisionTrace, DecisionUpdate,
    Edge, Entity, NodeKind, Provenance, RationaleAuthor, TextSpan, VerbatimSpan,
};
pub use writer::{AnalyticsEvents, GraphWriter, SaveListener, SaveOutcome};
