//! SQLite-backed graph store.
//!
//! Nodes live in typed tables (decisions, entities, candidates, code
//! entities, commits); edges share one table with a uniqueness constraint
//! on `(src, dst, type)` so repeated writes behave like MERGE. Every read
//! is scoped with `(user_id = ? OR user_id IS NULL)`; null-owner rows are
//! legacy data visible to all users. Embeddings are stored as
//! little-endian f32 blobs and compared with an in-memory cosine scan.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::cosine_similarity;
use crate::ontology::{EntityType, RelationType, Scope};

use super::schema::{initialize_schema, is_initialized};
use super::types::{
    CandidateDecision, CodeEntity, CommitNode, DecisionSource, DecisionTrace, DecisionUpdate,
    Edge, Entity, NodeKind, Provenance, RationaleAuthor, VerbatimSpan,
};

const DECISION_COLS: &str = r#"id, user_id, project_name, "trigger", context, decision, rationale,
    options, confidence, raw_confidence, scope, source, created_at, edited_at, edit_count,
    expired_at, last_reviewed_at, verbatim, raw_rationale, rationale_author, assumptions,
    turn_index, embedding, provenance"#;

const ENTITY_COLS: &str =
    "id, user_id, name, name_norm, entity_type, aliases, embedding, created_at";

const EDGE_COLS: &str = "id, src_id, src_kind, dst_id, dst_kind, rel_type, confidence, weight,
    reasoning, valid_at, invalid_at, properties, created_at";

/// Aggregate counts over a user's slice of the graph.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GraphStats {
    pub decisions: u64,
    pub entities: u64,
    pub candidates: u64,
    pub code_entities: u64,
    pub edges: u64,
    pub edges_by_type: HashMap<String, u64>,
}

/// One neighbor of a node, with the connecting edge.
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub edge: Edge,
    pub other_id: String,
    pub other_kind: NodeKind,
    /// True when the edge points away from the queried node.
    pub outgoing: bool,
}

/// A page of the graph for UI rendering.
#[derive(Debug, Clone)]
pub struct GraphPage {
    pub decisions: Vec<DecisionTrace>,
    pub entities: Vec<Entity>,
    pub edges: Vec<Edge>,
    pub page: u64,
    pub page_size: u64,
    pub total_nodes: u64,
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

fn opt_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().map(parse_ts)
}

fn json_or_default<T: serde::de::DeserializeOwned + Default>(value: Option<String>) -> T {
    value
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct VerbatimColumn {
    #[serde(skip_serializing_if = "Option::is_none")]
    trigger: Option<VerbatimSpan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decision: Option<VerbatimSpan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rationale: Option<VerbatimSpan>,
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<DecisionTrace> {
    let verbatim: VerbatimColumn = json_or_default(row.get::<_, Option<String>>(17)?);
    let provenance: Option<Provenance> = row
        .get::<_, Option<String>>(23)?
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok());

    Ok(DecisionTrace {
        id: row.get(0)?,
        user_id: row.get(1)?,
        project_name: row.get(2)?,
        trigger: row.get(3)?,
        context: row.get(4)?,
        agent_decision: row.get(5)?,
        agent_rationale: row.get(6)?,
        options: json_or_default(row.get::<_, Option<String>>(7)?),
        confidence: row.get(8)?,
        raw_confidence: row.get(9)?,
        scope: Scope::parse(&row.get::<_, String>(10)?),
        source: DecisionSource::parse(&row.get::<_, String>(11)?),
        created_at: parse_ts(&row.get::<_, String>(12)?),
        edited_at: opt_ts(row.get(13)?),
        edit_count: row.get(14)?,
        expired_at: opt_ts(row.get(15)?),
        last_reviewed_at: opt_ts(row.get(16)?),
        verbatim_trigger: verbatim.trigger,
        verbatim_decision: verbatim.decision,
        verbatim_rationale: verbatim.rationale,
        raw_rationale: row.get(18)?,
        rationale_author: RationaleAuthor::parse(&row.get::<_, String>(19)?),
        assumptions: json_or_default(row.get::<_, Option<String>>(20)?),
        turn_index: row.get(21)?,
        embedding: row
            .get::<_, Option<Vec<u8>>>(22)?
            .map(|b| decode_embedding(&b)),
        provenance,
        tool_file_paths: Vec::new(),
    })
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        entity_type: EntityType::parse(&row.get::<_, String>(4)?)
            .unwrap_or(EntityType::Concept),
        aliases: json_or_default(row.get::<_, Option<String>>(5)?),
        embedding: row
            .get::<_, Option<Vec<u8>>>(6)?
            .map(|b| decode_embedding(&b)),
        created_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        id: row.get(0)?,
        src_id: row.get(1)?,
        src_kind: NodeKind::parse(&row.get::<_, String>(2)?).unwrap_or(NodeKind::Entity),
        dst_id: row.get(3)?,
        dst_kind: NodeKind::parse(&row.get::<_, String>(4)?).unwrap_or(NodeKind::Entity),
        relation: RelationType::parse(&row.get::<_, String>(5)?)
            .unwrap_or(RelationType::RelatedTo),
        confidence: row.get(6)?,
        weight: row.get(7)?,
        reasoning: row.get(8)?,
        valid_at: opt_ts(row.get(9)?),
        invalid_at: opt_ts(row.get(10)?),
        properties: json_or_default(row.get::<_, Option<String>>(11)?),
        created_at: parse_ts(&row.get::<_, String>(12)?),
    })
}

/// Build an FTS5 query: quoted terms joined by OR.
fn fts_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// SQLite-backed graph store.
pub struct GraphStore {
    conn: Arc<Mutex<Connection>>,
}

impl GraphStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        if !is_initialized(&conn) {
            initialize_schema(&conn)?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(Error::from)
    }

    // ==================== Decisions ====================

    /// Insert a decision node and its full-text row.
    pub fn insert_decision(&self, d: &DecisionTrace) -> Result<()> {
        let verbatim = VerbatimColumn {
            trigger: d.verbatim_trigger.clone(),
            decision: d.verbatim_decision.clone(),
            rationale: d.verbatim_rationale.clone(),
        };
        let verbatim_json = serde_json::to_string(&verbatim)?;
        let provenance_json = d
            .provenance
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO decisions ({DECISION_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                             ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)"
                ),
                params![
                    d.id,
                    d.user_id,
                    d.project_name,
                    d.trigger,
                    d.context,
                    d.agent_decision,
                    d.agent_rationale,
                    serde_json::to_string(&d.options).unwrap_or_else(|_| "[]".into()),
                    d.confidence,
                    d.raw_confidence,
                    d.scope.as_str(),
                    d.source.as_string(),
                    d.created_at.to_rfc3339(),
                    d.edited_at.map(|t| t.to_rfc3339()),
                    d.edit_count,
                    d.expired_at.map(|t| t.to_rfc3339()),
                    d.last_reviewed_at.map(|t| t.to_rfc3339()),
                    verbatim_json,
                    d.raw_rationale,
                    d.rationale_author.as_str(),
                    serde_json::to_string(&d.assumptions).unwrap_or_else(|_| "[]".into()),
                    d.turn_index,
                    d.embedding.as_deref().map(encode_embedding),
                    provenance_json,
                ],
            )?;
            conn.execute(
                r#"INSERT INTO decisions_fts (id, "trigger", context, decision, rationale)
                   VALUES (?1, ?2, ?3, ?4, ?5)"#,
                params![d.id, d.trigger, d.context, d.agent_decision, d.agent_rationale],
            )?;
            Ok(())
        })
    }

    pub fn get_decision(&self, user_id: &str, id: &str) -> Result<Option<DecisionTrace>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {DECISION_COLS} FROM decisions
                     WHERE id = ?1 AND (user_id = ?2 OR user_id IS NULL)"
                ),
                params![id, user_id],
                decision_from_row,
            )
            .optional()
        })
    }

    pub fn list_decisions(
        &self,
        user_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<DecisionTrace>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DECISION_COLS} FROM decisions
                 WHERE (user_id = ?1 OR user_id IS NULL)
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(params![user_id, limit, offset], decision_from_row)?;
            rows.collect()
        })
    }

    /// Every decision visible to the user, oldest first.
    pub fn all_decisions(&self, user_id: &str) -> Result<Vec<DecisionTrace>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DECISION_COLS} FROM decisions
                 WHERE (user_id = ?1 OR user_id IS NULL)
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map(params![user_id], decision_from_row)?;
            rows.collect()
        })
    }

    pub fn count_decisions(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM decisions WHERE (user_id = ?1 OR user_id IS NULL)",
                params![user_id],
                |r| r.get(0),
            )
        })
    }

    /// Apply an allow-listed partial update, bumping the edit metadata.
    pub fn update_decision(
        &self,
        user_id: &str,
        id: &str,
        update: &DecisionUpdate,
    ) -> Result<DecisionTrace> {
        let Some(mut d) = self.get_decision(user_id, id)? else {
            return Err(Error::NotFound(format!("decision {id}")));
        };
        if update.is_empty() {
            return Ok(d);
        }

        if let Some(v) = &update.trigger {
            d.trigger = v.clone();
        }
        if let Some(v) = &update.context {
            d.context = v.clone();
        }
        if let Some(v) = &update.options {
            d.options = v.clone();
        }
        if let Some(v) = &update.agent_decision {
            d.agent_decision = v.clone();
        }
        if let Some(v) = &update.agent_rationale {
            d.agent_rationale = v.clone();
        }
        if let Some(v) = update.confidence {
            d.confidence = v.clamp(0.0, 1.0);
        }
        if let Some(v) = update.scope {
            d.scope = v;
        }
        if let Some(v) = &update.project_name {
            d.project_name = Some(v.clone());
        }
        if let Some(v) = &update.assumptions {
            d.assumptions = v.clone();
        }
        d.edited_at = Some(Utc::now());
        d.edit_count += 1;

        self.with_conn(|conn| {
            conn.execute(
                r#"UPDATE decisions SET "trigger" = ?1, context = ?2, options = ?3,
                       decision = ?4, rationale = ?5, confidence = ?6, scope = ?7,
                       project_name = ?8, assumptions = ?9, edited_at = ?10, edit_count = ?11
                   WHERE id = ?12"#,
                params![
                    d.trigger,
                    d.context,
                    serde_json::to_string(&d.options).unwrap_or_else(|_| "[]".into()),
                    d.agent_decision,
                    d.agent_rationale,
                    d.confidence,
                    d.scope.as_str(),
                    d.project_name,
                    serde_json::to_string(&d.assumptions).unwrap_or_else(|_| "[]".into()),
                    d.edited_at.map(|t| t.to_rfc3339()),
                    d.edit_count,
                    d.id,
                ],
            )?;
            conn.execute("DELETE FROM decisions_fts WHERE id = ?1", params![d.id])?;
            conn.execute(
                r#"INSERT INTO decisions_fts (id, "trigger", context, decision, rationale)
                   VALUES (?1, ?2, ?3, ?4, ?5)"#,
                params![d.id, d.trigger, d.context, d.agent_decision, d.agent_rationale],
            )?;
            Ok(())
        })?;
        Ok(d)
    }

    /// Delete a decision, its candidates, and every touching edge.
    pub fn delete_decision(&self, user_id: &str, id: &str) -> Result<bool> {
        if self.get_decision(user_id, id)?.is_none() {
            return Ok(false);
        }
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM candidate_decisions WHERE rejected_by_decision_id = ?1",
                params![id],
            )?;
            conn.execute(
                "DELETE FROM edges WHERE src_id = ?1 OR dst_id = ?1",
                params![id],
            )?;
            conn.execute("DELETE FROM decisions_fts WHERE id = ?1", params![id])?;
            conn.execute("DELETE FROM decisions WHERE id = ?1", params![id])?;
            Ok(true)
        })
    }

    pub fn decisions_for_project(
        &self,
        user_id: &str,
        project: &str,
    ) -> Result<Vec<DecisionTrace>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DECISION_COLS} FROM decisions
                 WHERE (user_id = ?1 OR user_id IS NULL) AND project_name = ?2
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map(params![user_id, project], decision_from_row)?;
            rows.collect()
        })
    }

    /// Most recent decisions of *other* users in the same project.
    pub fn recent_decisions_of_other_users(
        &self,
        project: &str,
        exclude_user: &str,
        limit: u64,
    ) -> Result<Vec<DecisionTrace>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DECISION_COLS} FROM decisions
                 WHERE project_name = ?1 AND user_id IS NOT NULL AND user_id != ?2
                 ORDER BY created_at DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![project, exclude_user, limit], decision_from_row)?;
            rows.collect()
        })
    }

    /// Stamp the superseded decision with its expiry.
    pub fn set_decision_expired(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE decisions SET expired_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id],
            )?;
            Ok(())
        })
    }

    /// Bi-temporal stamping: close the superseded decision's INVOLVES
    /// edges so point-in-time queries see the old world before `at`.
    pub fn invalidate_involves(&self, decision_id: &str, at: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE edges SET invalid_at = ?1
                 WHERE src_id = ?2 AND rel_type = 'INVOLVES' AND invalid_at IS NULL",
                params![at.to_rfc3339(), decision_id],
            )?;
            Ok(n as u64)
        })
    }

    pub fn mark_reviewed(&self, user_id: &str, id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE decisions SET last_reviewed_at = ?1
                 WHERE id = ?2 AND (user_id = ?3 OR user_id IS NULL)",
                params![at.to_rfc3339(), id, user_id],
            )?;
            Ok(n > 0)
        })
    }

    /// Same-project decisions with a strictly lower turn index.
    pub fn earlier_decisions_in_project(
        &self,
        user_id: &str,
        project: &str,
        turn_index: i64,
    ) -> Result<Vec<DecisionTrace>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DECISION_COLS} FROM decisions
                 WHERE (user_id = ?1 OR user_id IS NULL) AND project_name = ?2
                   AND turn_index IS NOT NULL AND turn_index < ?3
                 ORDER BY turn_index ASC"
            ))?;
            let rows = stmt.query_map(params![user_id, project, turn_index], decision_from_row)?;
            rows.collect()
        })
    }

    /// Full-text search over decisions. Returns the raw BM25-derived
    /// score (higher is better) alongside each hit.
    pub fn fulltext_decisions(
        &self,
        user_id: &str,
        query: &str,
        limit: u64,
    ) -> Result<Vec<(DecisionTrace, f64)>> {
        let fts = fts_query(query);
        if fts.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT decisions.*, -bm25(decisions_fts) AS score
                 FROM decisions_fts
                 JOIN decisions ON decisions.id = decisions_fts.id
                 WHERE decisions_fts MATCH ?1
                   AND (decisions.user_id = ?2 OR decisions.user_id IS NULL)
                 ORDER BY score DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![fts, user_id, limit], |row| {
                Ok((decision_from_row(row)?, row.get::<_, f64>(24)?))
            })?;
            rows.collect()
        })
    }

    /// Decisions with embeddings, for similarity scans.
    pub fn decisions_with_embeddings(&self, user_id: &str) -> Result<Vec<DecisionTrace>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DECISION_COLS} FROM decisions
                 WHERE (user_id = ?1 OR user_id IS NULL) AND embedding IS NOT NULL"
            ))?;
            let rows = stmt.query_map(params![user_id], decision_from_row)?;
            rows.collect()
        })
    }

    /// Cosine scan over decision embeddings; the manual fallback for
    /// stores without a native vector index.
    pub fn similar_decisions(
        &self,
        user_id: &str,
        embedding: &[f32],
        threshold: f64,
        limit: usize,
        exclude_id: Option<&str>,
    ) -> Result<Vec<(DecisionTrace, f64)>> {
        let candidates = self.decisions_with_embeddings(user_id)?;
        let mut scored: Vec<(DecisionTrace, f64)> = candidates
            .into_iter()
            .filter(|d| exclude_id != Some(d.id.as_str()))
            .filter_map(|d| {
                let score = d
                    .embedding
                    .as_deref()
                    .map(|e| cosine_similarity(embedding, e))?;
                (score >= threshold).then_some((d, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    // ==================== Entities ====================

    pub fn insert_entity(&self, e: &Entity) -> Result<()> {
        let norm = crate::ontology::normalize_entity_name(&e.name);
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO entities ({ENTITY_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    e.id,
                    e.user_id,
                    e.name,
                    norm,
                    e.entity_type.as_str(),
                    serde_json::to_string(&e.aliases).unwrap_or_else(|_| "[]".into()),
                    e.embedding.as_deref().map(encode_embedding),
                    e.created_at.to_rfc3339(),
                ],
            )?;
            conn.execute(
                "INSERT INTO entities_fts (id, name, aliases) VALUES (?1, ?2, ?3)",
                params![e.id, e.name, e.aliases.join(" ")],
            )?;
            Ok(())
        })
    }

    pub fn get_entity(&self, user_id: &str, id: &str) -> Result<Option<Entity>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {ENTITY_COLS} FROM entities
                     WHERE id = ?1 AND (user_id = ?2 OR user_id IS NULL)"
                ),
                params![id, user_id],
                entity_from_row,
            )
            .optional()
        })
    }

    /// Exact normalized-name match. `user_scoped` restricts to the user's
    /// own entities; otherwise any visible entity matches.
    pub fn find_entity_exact(
        &self,
        user_id: &str,
        name_norm: &str,
        user_scoped: bool,
    ) -> Result<Option<Entity>> {
        self.with_conn(|conn| {
            let sql = if user_scoped {
                format!(
                    "SELECT {ENTITY_COLS} FROM entities
                     WHERE name_norm = ?1 AND user_id = ?2 LIMIT 1"
                )
            } else {
                format!(
                    "SELECT {ENTITY_COLS} FROM entities
                     WHERE name_norm = ?1 AND (user_id = ?2 OR user_id IS NULL) LIMIT 1"
                )
            };
            conn.query_row(&sql, params![name_norm, user_id], entity_from_row)
                .optional()
        })
    }

    /// Match against the aliases sets of visible entities.
    pub fn find_entity_by_alias(&self, user_id: &str, name_norm: &str) -> Result<Option<Entity>> {
        let entities = self.all_entities(user_id)?;
        Ok(entities.into_iter().find(|e| {
            e.aliases
                .iter()
                .any(|a| crate::ontology::normalize_entity_name(a) == name_norm)
        }))
    }

    /// Full-text prefix candidates for fuzzy matching.
    pub fn entity_candidates_fulltext(
        &self,
        user_id: &str,
        name: &str,
        limit: u64,
    ) -> Result<Vec<Entity>> {
        let Some(first) = name.split_whitespace().next() else {
            return Ok(Vec::new());
        };
        let prefix: String = first.chars().filter(|c| c.is_alphanumeric()).collect();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entities.* FROM entities_fts
                 JOIN entities ON entities.id = entities_fts.id
                 WHERE entities_fts MATCH ?1
                   AND (entities.user_id = ?2 OR entities.user_id IS NULL)
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![format!("{prefix}*"), user_id, limit], |row| {
                entity_from_row(row)
            })?;
            rows.collect()
        })
    }

    /// Paged scan fallback when full-text finds nothing.
    pub fn entities_page(&self, user_id: &str, offset: u64, limit: u64) -> Result<Vec<Entity>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTITY_COLS} FROM entities
                 WHERE (user_id = ?1 OR user_id IS NULL)
                 ORDER BY name_norm LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(params![user_id, limit, offset], entity_from_row)?;
            rows.collect()
        })
    }

    pub fn all_entities(&self, user_id: &str) -> Result<Vec<Entity>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTITY_COLS} FROM entities
                 WHERE (user_id = ?1 OR user_id IS NULL)
                 ORDER BY name_norm"
            ))?;
            let rows = stmt.query_map(params![user_id], entity_from_row)?;
            rows.collect()
        })
    }

    pub fn entities_with_embeddings(&self, user_id: &str) -> Result<Vec<Entity>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTITY_COLS} FROM entities
                 WHERE (user_id = ?1 OR user_id IS NULL) AND embedding IS NOT NULL"
            ))?;
            let rows = stmt.query_map(params![user_id], entity_from_row)?;
            rows.collect()
        })
    }

    pub fn count_entities(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM entities WHERE (user_id = ?1 OR user_id IS NULL)",
                params![user_id],
                |r| r.get(0),
            )
        })
    }

    pub fn add_entity_alias(&self, entity_id: &str, alias: &str) -> Result<()> {
        self.with_conn(|conn| {
            let aliases_json: Option<String> = conn
                .query_row(
                    "SELECT aliases FROM entities WHERE id = ?1",
                    params![entity_id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(aliases_json) = aliases_json else {
                return Ok(());
            };
            let mut aliases: Vec<String> =
                serde_json::from_str(&aliases_json).unwrap_or_default();
            if !aliases.iter().any(|a| a.eq_ignore_ascii_case(alias)) {
                aliases.push(alias.to_string());
                conn.execute(
                    "UPDATE entities SET aliases = ?1 WHERE id = ?2",
                    params![
                        serde_json::to_string(&aliases).unwrap_or_else(|_| "[]".into()),
                        entity_id
                    ],
                )?;
                conn.execute(
                    "UPDATE entities_fts SET aliases = ?1 WHERE id = ?2",
                    params![aliases.join(" "), entity_id],
                )?;
            }
            Ok(())
        })
    }

    /// Delete an entity and its edges. With `force` false, refuses when
    /// INVOLVES edges still reference it.
    pub fn delete_entity(&self, user_id: &str, id: &str, force: bool) -> Result<bool> {
        if self.get_entity(user_id, id)?.is_none() {
            return Ok(false);
        }
        if !force {
            let involved: u64 = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM edges WHERE dst_id = ?1 AND rel_type = 'INVOLVES'",
                    params![id],
                    |r| r.get(0),
                )
            })?;
            if involved > 0 {
                return Err(Error::GraphStorage(format!(
                    "entity {id} still referenced by {involved} decisions"
                )));
            }
        }
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM edges WHERE src_id = ?1 OR dst_id = ?1",
                params![id],
            )?;
            conn.execute("DELETE FROM entities_fts WHERE id = ?1", params![id])?;
            conn.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
            Ok(true)
        })
    }

    /// Visible entities ranked by how many decisions involve them.
    pub fn entities_by_decision_count(
        &self,
        user_id: &str,
        limit: u64,
    ) -> Result<Vec<(Entity, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entities.*, COUNT(e.id) AS n
                 FROM entities
                 JOIN edges e ON e.dst_id = entities.id AND e.rel_type = 'INVOLVES'
                 WHERE (entities.user_id = ?1 OR entities.user_id IS NULL)
                 GROUP BY entities.id ORDER BY n DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit], |row| {
                Ok((entity_from_row(row)?, row.get::<_, u64>(8)?))
            })?;
            rows.collect()
        })
    }

    /// Full-text search over entity names/aliases with raw scores.
    pub fn fulltext_entities(
        &self,
        user_id: &str,
        query: &str,
        limit: u64,
    ) -> Result<Vec<(Entity, f64)>> {
        let fts = fts_query(query);
        if fts.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entities.*, -bm25(entities_fts) AS score
                 FROM entities_fts
                 JOIN entities ON entities.id = entities_fts.id
                 WHERE entities_fts MATCH ?1
                   AND (entities.user_id = ?2 OR entities.user_id IS NULL)
                 ORDER BY score DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![fts, user_id, limit], |row| {
                Ok((entity_from_row(row)?, row.get::<_, f64>(8)?))
            })?;
            rows.collect()
        })
    }

    // ==================== Candidates / code / commits ====================

    pub fn insert_candidate(&self, c: &CandidateDecision) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO candidate_decisions
                     (id, user_id, text, rejected_at, rejected_by_decision_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    c.id,
                    c.user_id,
                    c.text,
                    c.rejected_at.to_rfc3339(),
                    c.rejected_by_decision_id
                ],
            )?;
            Ok(())
        })
    }

    pub fn candidates_for_user(&self, user_id: &str) -> Result<Vec<CandidateDecision>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, text, rejected_at, rejected_by_decision_id
                 FROM candidate_decisions
                 WHERE (user_id = ?1 OR user_id IS NULL)
                 ORDER BY rejected_at ASC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok(CandidateDecision {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    text: row.get(2)?,
                    rejected_at: parse_ts(&row.get::<_, String>(3)?),
                    rejected_by_decision_id: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Insert-or-fetch a code entity by `(user, path)`. Returns its id.
    pub fn upsert_code_entity(&self, c: &CodeEntity) -> Result<String> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM code_entities
                     WHERE file_path = ?1 AND (user_id = ?2 OR (user_id IS NULL AND ?2 IS NULL))",
                    params![c.file_path, c.user_id],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
            conn.execute(
                "INSERT INTO code_entities
                     (id, user_id, file_path, file_stem, language, line_count, size_bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    c.id,
                    c.user_id,
                    c.file_path,
                    c.file_stem,
                    c.language,
                    c.line_count,
                    c.size_bytes,
                    c.created_at.to_rfc3339(),
                ],
            )?;
            Ok(c.id.clone())
        })
    }

    pub fn upsert_commit(&self, c: &CommitNode) -> Result<String> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM commits
                     WHERE commit_hash = ?1 AND (user_id = ?2 OR (user_id IS NULL AND ?2 IS NULL))",
                    params![c.commit_hash, c.user_id],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
            conn.execute(
                "INSERT INTO commits (id, user_id, commit_hash, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    c.id,
                    c.user_id,
                    c.commit_hash,
                    c.message,
                    c.created_at.to_rfc3339()
                ],
            )?;
            Ok(c.id.clone())
        })
    }

    // ==================== Edges ====================

    /// MERGE an edge: create it, or refresh the mutable attributes of the
    /// existing `(src, dst, type)` row. Idempotent by construction.
    pub fn merge_edge(&self, edge: &Edge) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO edges (id, src_id, src_kind, dst_id, dst_kind, rel_type,
                     confidence, weight, reasoning, valid_at, invalid_at, properties, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(src_id, dst_id, rel_type) DO UPDATE SET
                     confidence = excluded.confidence,
                     weight = excluded.weight,
                     reasoning = excluded.reasoning,
                     valid_at = COALESCE(edges.valid_at, excluded.valid_at),
                     invalid_at = COALESCE(excluded.invalid_at, edges.invalid_at),
                     properties = excluded.properties",
                params![
                    edge.id,
                    edge.src_id,
                    edge.src_kind.as_str(),
                    edge.dst_id,
                    edge.dst_kind.as_str(),
                    edge.relation.as_str(),
                    edge.confidence,
                    edge.weight,
                    edge.reasoning,
                    edge.valid_at.map(|t| t.to_rfc3339()),
                    edge.invalid_at.map(|t| t.to_rfc3339()),
                    serde_json::to_string(&edge.properties).unwrap_or_else(|_| "{}".into()),
                    edge.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn edges_from(
        &self,
        src_id: &str,
        relations: Option<&[RelationType]>,
    ) -> Result<Vec<Edge>> {
        self.edges_matching("src_id", src_id, relations)
    }

    pub fn edges_to(&self, dst_id: &str, relations: Option<&[RelationType]>) -> Result<Vec<Edge>> {
        self.edges_matching("dst_id", dst_id, relations)
    }

    fn edges_matching(
        &self,
        column: &str,
        id: &str,
        relations: Option<&[RelationType]>,
    ) -> Result<Vec<Edge>> {
        let rel_filter = match relations {
            Some(rels) if !rels.is_empty() => {
                let list = rels
                    .iter()
                    .map(|r| format!("'{}'", r.as_str()))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("AND rel_type IN ({list})")
            }
            _ => String::new(),
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EDGE_COLS} FROM edges WHERE {column} = ?1 {rel_filter}"
            ))?;
            let rows = stmt.query_map(params![id], edge_from_row)?;
            rows.collect()
        })
    }

    /// All edges touching a node, annotated with direction.
    pub fn neighbors(
        &self,
        node_id: &str,
        relations: Option<&[RelationType]>,
        limit: usize,
    ) -> Result<Vec<NeighborEntry>> {
        let mut entries: Vec<NeighborEntry> = Vec::new();
        for edge in self.edges_from(node_id, relations)? {
            entries.push(NeighborEntry {
                other_id: edge.dst_id.clone(),
                other_kind: edge.dst_kind,
                outgoing: true,
                edge,
            });
        }
        for edge in self.edges_to(node_id, relations)? {
            entries.push(NeighborEntry {
                other_id: edge.src_id.clone(),
                other_kind: edge.src_kind,
                outgoing: false,
                edge,
            });
        }
        entries.truncate(limit);
        Ok(entries)
    }

    pub fn all_edges(&self) -> Result<Vec<Edge>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {EDGE_COLS} FROM edges"))?;
            let rows = stmt.query_map([], edge_from_row)?;
            rows.collect()
        })
    }

    /// Adjacency map over one entity-entity relationship type, restricted
    /// to the user's visible entities. Input for cycle detection.
    pub fn entity_adjacency(
        &self,
        user_id: &str,
        relation: RelationType,
    ) -> Result<HashMap<String, Vec<String>>> {
        let visible: HashSet<String> = self
            .all_entities(user_id)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT src_id, dst_id FROM edges
                 WHERE rel_type = ?1 AND src_kind = 'entity' AND dst_kind = 'entity'",
            )?;
            let rows = stmt.query_map(params![relation.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (src, dst) = row?;
                if visible.contains(&src) && visible.contains(&dst) {
                    adjacency.entry(src).or_default().push(dst);
                }
            }
            Ok(())
        })?;
        Ok(adjacency)
    }

    /// Move every edge touching `from_id` onto `to_id` (both directions),
    /// skipping rows that would collide with an existing edge or become
    /// self-referential. Used by duplicate merging.
    pub fn transfer_edges(&self, from_id: &str, to_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let mut moved = 0u64;
            // OR IGNORE drops collisions with existing (src, dst, type) rows.
            moved += conn.execute(
                "UPDATE OR IGNORE edges SET src_id = ?1 WHERE src_id = ?2 AND dst_id != ?1",
                params![to_id, from_id],
            )? as u64;
            moved += conn.execute(
                "UPDATE OR IGNORE edges SET dst_id = ?1 WHERE dst_id = ?2 AND src_id != ?1",
                params![to_id, from_id],
            )? as u64;
            // Whatever still references the duplicate was a collision or a
            // would-be self edge; drop it.
            conn.execute(
                "DELETE FROM edges WHERE src_id = ?1 OR dst_id = ?1",
                params![from_id],
            )?;
            Ok(moved)
        })
    }

    /// Decision ids that have a superseder.
    pub fn superseded_decision_ids(&self) -> Result<HashSet<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT dst_id FROM edges WHERE rel_type = 'SUPERSEDES'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
    }

    /// CONTRADICTS pairs among the user's visible decisions.
    pub fn contradiction_pairs(&self, user_id: &str) -> Result<Vec<(String, String)>> {
        let visible: HashSet<String> = self
            .all_decisions(user_id)?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let pairs = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT src_id, dst_id FROM edges WHERE rel_type = 'CONTRADICTS'")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(pairs
            .into_iter()
            .filter(|(a, b)| visible.contains(a) && visible.contains(b))
            .collect())
    }

    /// Entities a decision INVOLVES.
    pub fn entities_of_decision(&self, decision_id: &str) -> Result<Vec<Entity>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entities.* FROM entities
                 JOIN edges e ON e.dst_id = entities.id
                 WHERE e.src_id = ?1 AND e.rel_type = 'INVOLVES'
                 ORDER BY entities.name_norm",
            )?;
            let rows = stmt.query_map(params![decision_id], entity_from_row)?;
            rows.collect()
        })
    }

    /// Decisions that INVOLVE an entity, newest first.
    pub fn decisions_involving_entity(
        &self,
        user_id: &str,
        entity_id: &str,
    ) -> Result<Vec<DecisionTrace>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT decisions.* FROM decisions
                 JOIN edges e ON e.src_id = decisions.id
                 WHERE e.dst_id = ?1 AND e.rel_type = 'INVOLVES'
                   AND (decisions.user_id = ?2 OR decisions.user_id IS NULL)
                 ORDER BY decisions.created_at DESC",
            )?;
            let rows = stmt.query_map(params![entity_id, user_id], decision_from_row)?;
            rows.collect()
        })
    }

    /// Other decisions sharing at least `min_shared` INVOLVES entities.
    pub fn decisions_sharing_entities(
        &self,
        user_id: &str,
        decision_id: &str,
        min_shared: u64,
    ) -> Result<Vec<(String, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e2.src_id, COUNT(DISTINCT e1.dst_id) AS shared
                 FROM edges e1
                 JOIN edges e2 ON e2.dst_id = e1.dst_id
                     AND e2.rel_type = 'INVOLVES' AND e2.src_id != e1.src_id
                 JOIN decisions d ON d.id = e2.src_id
                 WHERE e1.src_id = ?1 AND e1.rel_type = 'INVOLVES'
                   AND (d.user_id = ?2 OR d.user_id IS NULL)
                 GROUP BY e2.src_id
                 HAVING shared >= ?3",
            )?;
            let rows = stmt.query_map(params![decision_id, user_id, min_shared], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            rows.collect()
        })
    }

    // ==================== Aggregates ====================

    pub fn stats(&self, user_id: &str) -> Result<GraphStats> {
        let mut stats = GraphStats {
            decisions: self.count_decisions(user_id)?,
            entities: self.count_entities(user_id)?,
            ..GraphStats::default()
        };
        self.with_conn(|conn| {
            stats.candidates = conn.query_row(
                "SELECT COUNT(*) FROM candidate_decisions WHERE (user_id = ?1 OR user_id IS NULL)",
                params![user_id],
                |r| r.get(0),
            )?;
            stats.code_entities = conn.query_row(
                "SELECT COUNT(*) FROM code_entities WHERE (user_id = ?1 OR user_id IS NULL)",
                params![user_id],
                |r| r.get(0),
            )?;
            stats.edges = conn.query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))?;
            let mut stmt =
                conn.prepare("SELECT rel_type, COUNT(*) FROM edges GROUP BY rel_type")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (rel, n) = row?;
                stats.edges_by_type.insert(rel, n);
            }
            Ok(())
        })?;
        Ok(stats)
    }

    /// Distinct project names with decision counts.
    pub fn projects(&self, user_id: &str) -> Result<Vec<(String, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT project_name, COUNT(*) FROM decisions
                 WHERE (user_id = ?1 OR user_id IS NULL) AND project_name IS NOT NULL
                 GROUP BY project_name ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            rows.collect()
        })
    }

    /// Distinct sources with decision counts.
    pub fn sources(&self, user_id: &str) -> Result<Vec<(String, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source, COUNT(*) FROM decisions
                 WHERE (user_id = ?1 OR user_id IS NULL)
                 GROUP BY source ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            rows.collect()
        })
    }

    /// One page of the user's graph: nodes first, then edges whose both
    /// endpoints landed in the page.
    pub fn graph_page(&self, user_id: &str, page: u64, page_size: u64) -> Result<GraphPage> {
        let offset = page.saturating_sub(1) * page_size;
        let decisions = self.list_decisions(user_id, page_size, offset)?;
        let entities = self.entities_page(user_id, offset, page_size)?;

        let ids: HashSet<&str> = decisions
            .iter()
            .map(|d| d.id.as_str())
            .chain(entities.iter().map(|e| e.id.as_str()))
            .collect();
        let edges = self
            .all_edges()?
            .into_iter()
            .filter(|e| ids.contains(e.src_id.as_str()) && ids.contains(e.dst_id.as_str()))
            .collect();

        let total_nodes = self.count_decisions(user_id)? + self.count_entities(user_id)?;
        Ok(GraphPage {
            decisions,
            entities,
            edges,
            page: page.max(1),
            page_size,
            total_nodes,
        })
    }

    /// Remove everything owned by the user. Returns (nodes, edges) removed.
    pub fn reset(&self, user_id: &str) -> Result<(u64, u64)> {
        let decision_ids: Vec<String> = self
            .all_decisions(user_id)?
            .into_iter()
            .filter(|d| d.user_id.as_deref() == Some(user_id))
            .map(|d| d.id)
            .collect();
        let entity_ids: Vec<String> = self
            .all_entities(user_id)?
            .into_iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .map(|e| e.id)
            .collect();

        let mut edges_removed = 0u64;
        let mut nodes_removed = 0u64;
        self.with_conn(|conn| {
            for id in decision_ids.iter().chain(entity_ids.iter()) {
                edges_removed += conn.execute(
                    "DELETE FROM edges WHERE src_id = ?1 OR dst_id = ?1",
                    params![id],
                )? as u64;
            }
            nodes_removed += conn.execute(
                "DELETE FROM candidate_decisions WHERE user_id = ?1",
                params![user_id],
            )? as u64;
            nodes_removed += conn.execute(
                "DELETE FROM code_entities WHERE user_id = ?1",
                params![user_id],
            )? as u64;
            conn.execute(
                "DELETE FROM decisions_fts WHERE id IN
                     (SELECT id FROM decisions WHERE user_id = ?1)",
                params![user_id],
            )?;
            nodes_removed +=
                conn.execute("DELETE FROM decisions WHERE user_id = ?1", params![user_id])? as u64;
            conn.execute(
                "DELETE FROM entities_fts WHERE id IN
                     (SELECT id FROM entities WHERE user_id = ?1)",
                params![user_id],
            )?;
            nodes_removed +=
                conn.execute("DELETE FROM entities WHERE user_id = ?1", params![user_id])? as u64;
            Ok(())
        })?;
        debug!(user_id, nodes_removed, edges_removed, "graph reset");
        Ok((nodes_removed, edges_removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::DecisionTrace;
    use pretty_assertions::assert_eq;

    fn store() -> GraphStore {
        GraphStore::in_memory().unwrap()
    }

    fn decision(user: &str, trigger: &str, choice: &str) -> DecisionTrace {
        let mut d = DecisionTrace::new(trigger, choice);
        d.user_id = Some(user.to_string());
        d
    }

    #[test]
    fn test_decision_roundtrip() {
        let store = store();
        let mut d = decision("u1", "Need a database", "Use PostgreSQL");
        d.options = vec!["PostgreSQL".into(), "MongoDB".into()];
        d.assumptions = vec!["data stays relational".into()];
        d.embedding = Some(vec![0.1, 0.2, 0.3]);
        store.insert_decision(&d).unwrap();

        let loaded = store.get_decision("u1", &d.id).unwrap().unwrap();
        assert_eq!(loaded.trigger, "Need a database");
        assert_eq!(loaded.options, d.options);
        assert_eq!(loaded.assumptions, d.assumptions);
        assert_eq!(loaded.embedding, Some(vec![0.1, 0.2, 0.3]));
    }

    #[test]
    fn test_user_isolation_reports_not_found() {
        let store = store();
        let d = decision("u1", "t", "c");
        store.insert_decision(&d).unwrap();
        // Another user cannot see it.
        assert!(store.get_decision("u2", &d.id).unwrap().is_none());

        // Legacy rows with no owner are visible to everyone.
        let mut legacy = DecisionTrace::new("legacy", "c");
        legacy.user_id = None;
        store.insert_decision(&legacy).unwrap();
        assert!(store.get_decision("u2", &legacy.id).unwrap().is_some());
    }

    #[test]
    fn test_update_bumps_edit_metadata() {
        let store = store();
        let d = decision("u1", "t", "c");
        store.insert_decision(&d).unwrap();

        let update = DecisionUpdate {
            context: Some("new context".into()),
            ..DecisionUpdate::default()
        };
        let updated = store.update_decision("u1", &d.id, &update).unwrap();
        assert_eq!(updated.context, "new context");
        assert_eq!(updated.edit_count, 1);
        assert!(updated.edited_at.is_some());
    }

    #[test]
    fn test_delete_cascades_candidates_and_edges() {
        let store = store();
        let d = decision("u1", "t", "c");
        store.insert_decision(&d).unwrap();
        let candidate = CandidateDecision {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: Some("u1".into()),
            text: "MongoDB".into(),
            rejected_at: Utc::now(),
            rejected_by_decision_id: d.id.clone(),
        };
        store.insert_candidate(&candidate).unwrap();
        store
            .merge_edge(&Edge::new(
                candidate.id.clone(),
                NodeKind::Candidate,
                d.id.clone(),
                NodeKind::Decision,
                RelationType::RejectedBy,
            ))
            .unwrap();

        assert!(store.delete_decision("u1", &d.id).unwrap());
        assert!(store.candidates_for_user("u1").unwrap().is_empty());
        assert!(store.all_edges().unwrap().is_empty());
    }

    #[test]
    fn test_merge_edge_is_idempotent_with_latest_score() {
        let store = store();
        let a = decision("u1", "a", "x");
        let b = decision("u1", "b", "y");
        store.insert_decision(&a).unwrap();
        store.insert_decision(&b).unwrap();

        let edge = Edge::new(
            a.id.clone(),
            NodeKind::Decision,
            b.id.clone(),
            NodeKind::Decision,
            RelationType::SimilarTo,
        )
        .with_confidence(0.75);
        store.merge_edge(&edge).unwrap();

        let edge2 = Edge::new(
            a.id.clone(),
            NodeKind::Decision,
            b.id.clone(),
            NodeKind::Decision,
            RelationType::SimilarTo,
        )
        .with_confidence(0.9);
        store.merge_edge(&edge2).unwrap();

        let edges = store.all_edges().unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].confidence, Some(0.9));
        // The original row id survives the merge.
        assert_eq!(edges[0].id, edge.id);
    }

    #[test]
    fn test_fulltext_decisions() {
        let store = store();
        let mut d = decision("u1", "Need to choose a message broker", "Use Kafka");
        d.agent_rationale = "durable replayable log".into();
        store.insert_decision(&d).unwrap();
        let other = decision("u1", "Frontend framework", "React");
        store.insert_decision(&other).unwrap();

        let hits = store.fulltext_decisions("u1", "message broker", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, d.id);
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn test_similar_decisions_threshold_and_order() {
        let store = store();
        let mut a = decision("u1", "a", "x");
        a.embedding = Some(vec![1.0, 0.0]);
        let mut b = decision("u1", "b", "y");
        b.embedding = Some(vec![0.9, 0.1]);
        let mut c = decision("u1", "c", "z");
        c.embedding = Some(vec![0.0, 1.0]);
        for d in [&a, &b, &c] {
            store.insert_decision(d).unwrap();
        }

        let similar = store
            .similar_decisions("u1", &[1.0, 0.0], 0.7, 5, Some(&a.id))
            .unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].0.id, b.id);
    }

    #[test]
    fn test_invalidate_involves_stamps_only_open_edges() {
        let store = store();
        let d = decision("u1", "t", "c");
        store.insert_decision(&d).unwrap();
        let e = Entity::new("PostgreSQL", EntityType::Technology);
        store.insert_entity(&e).unwrap();
        store
            .merge_edge(&Edge::new(
                d.id.clone(),
                NodeKind::Decision,
                e.id.clone(),
                NodeKind::Entity,
                RelationType::Involves,
            ))
            .unwrap();

        let at = Utc::now();
        assert_eq!(store.invalidate_involves(&d.id, at).unwrap(), 1);
        // Second pass finds nothing open.
        assert_eq!(store.invalidate_involves(&d.id, at).unwrap(), 0);
        let edges = store.edges_from(&d.id, None).unwrap();
        assert!(edges[0].invalid_at.is_some());
    }

    #[test]
    fn test_entity_alias_and_exact_lookup() {
        let store = store();
        let mut e = Entity::new("PostgreSQL", EntityType::Technology);
        e.user_id = Some("u1".into());
        store.insert_entity(&e).unwrap();
        store.add_entity_alias(&e.id, "postgres").unwrap();
        store.add_entity_alias(&e.id, "postgres").unwrap();

        let found = store.find_entity_exact("u1", "postgresql", true).unwrap();
        assert_eq!(found.unwrap().id, e.id);

        let by_alias = store.find_entity_by_alias("u1", "postgres").unwrap();
        assert_eq!(by_alias.as_ref().map(|e| e.aliases.len()), Some(1));
    }

    #[test]
    fn test_decisions_sharing_entities() {
        let store = store();
        let a = decision("u1", "a", "x");
        let b = decision("u1", "b", "y");
        store.insert_decision(&a).unwrap();
        store.insert_decision(&b).unwrap();
        for name in ["Redis", "Kafka"] {
            let e = Entity::new(name, EntityType::Technology);
            store.insert_entity(&e).unwrap();
            for d in [&a, &b] {
                store
                    .merge_edge(&Edge::new(
                        d.id.clone(),
                        NodeKind::Decision,
                        e.id.clone(),
                        NodeKind::Entity,
                        RelationType::Involves,
                    ))
                    .unwrap();
            }
        }

        let sharing = store.decisions_sharing_entities("u1", &a.id, 2).unwrap();
        assert_eq!(sharing, vec![(b.id.clone(), 2)]);
    }

    #[test]
    fn test_transfer_edges_for_merge() {
        let store = store();
        let d = decision("u1", "t", "c");
        store.insert_decision(&d).unwrap();
        let keep = Entity::new("PostgreSQL", EntityType::Technology);
        let dup = Entity::new("postgre sql", EntityType::Technology);
        store.insert_entity(&keep).unwrap();
        store.insert_entity(&dup).unwrap();
        store
            .merge_edge(&Edge::new(
                d.id.clone(),
                NodeKind::Decision,
                dup.id.clone(),
                NodeKind::Entity,
                RelationType::Involves,
            ))
            .unwrap();

        store.transfer_edges(&dup.id, &keep.id).unwrap();
        let edges = store.edges_to(&keep.id, None).unwrap();
        assert_eq!(edges.len(), 1);
        assert!(store.edges_to(&dup.id, None).unwrap().is_empty());
    }

    #[test]
    fn test_reset_removes_only_owned_rows() {
        let store = store();
        let mine = decision("u1", "mine", "c");
        let theirs = decision("u2", "theirs", "c");
        store.insert_decision(&mine).unwrap();
        store.insert_decision(&theirs).unwrap();

        store.reset("u1").unwrap();
        assert_eq!(store.count_decisions("u2").unwrap(), 1);
        assert!(store.get_decision("u1", &mine.id).unwrap().is_none());
    }

    #[test]
    fn test_stats_and_projects() {
        let store = store();
        let mut d = decision("u1", "t", "c");
        d.project_name = Some("alpha".into());
        store.insert_decision(&d).unwrap();
        let e = Entity::new("Redis", EntityType::Technology);
        store.insert_entity(&e).unwrap();
        store
            .merge_edge(&Edge::new(
                d.id.clone(),
                NodeKind::Decision,
                e.id.clone(),
                NodeKind::Entity,
                RelationType::Involves,
            ))
            .unwrap();

        let stats = store.stats("u1").unwrap();
        assert_eq!(stats.decisions, 1);
        assert_eq!(stats.entities, 1);
        assert_eq!(stats.edges_by_type.get("INVOLVES"), Some(&1));

        assert_eq!(store.projects("u1").unwrap(), vec![("alpha".into(), 1)]);
    }
}
