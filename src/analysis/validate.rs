//! Graph integrity validation.
//!
//! A validation sweep reports circular dependencies, orphan entities,
//! low-confidence edges, near-duplicate entities, missing embeddings,
//! self-referential edges, and relationship types applied to the wrong
//! node kinds. Issues are reports, not mutations; fixing is a separate
//! decision.

use serde::Serialize;
use std::collections::HashSet;

use crate::error::Result;
use crate::graph::{GraphStore, NodeKind};
use crate::ontology::RelationType;
use crate::resolve::token_sort_ratio;

use super::cycles::{detect_cycles, CyclePath, DEFAULT_MAX_DEPTH};

/// How bad an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

/// What kind of defect was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    CircularDependency,
    OrphanEntity,
    LowConfidenceRelationship,
    DuplicateEntity,
    MissingEmbedding,
    SelfReferentialEdge,
    MistypedRelationship,
}

/// One finding from a validation sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub message: String,
    pub affected_nodes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

fn cycle_issue(cycle: &CyclePath) -> ValidationIssue {
    let severity = if cycle.relation == RelationType::RelatedTo {
        IssueSeverity::Warning
    } else {
        IssueSeverity::Error
    };
    ValidationIssue {
        issue_type: IssueType::CircularDependency,
        severity,
        message: format!(
            "circular {} chain of length {}: {}",
            cycle.relation,
            cycle.length,
            cycle.format_path()
        ),
        affected_nodes: cycle.node_ids.clone(),
        suggestion: Some(match cycle.relation {
            RelationType::DependsOn | RelationType::Requires => {
                "break the cycle by inverting or removing one dependency".to_string()
            }
            RelationType::IsA | RelationType::PartOf => {
                "taxonomies must be acyclic; one edge points the wrong way".to_string()
            }
            _ => "review the weakest-confidence edge in the cycle".to_string(),
        }),
    }
}

/// Runs every integrity check for one user's slice of the graph.
pub struct GraphValidator<'a> {
    store: &'a GraphStore,
    user_id: &'a str,
}

impl<'a> GraphValidator<'a> {
    pub fn new(store: &'a GraphStore, user_id: &'a str) -> Self {
        Self { store, user_id }
    }

    /// All checks, errors first.
    pub fn validate_all(&self) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        issues.extend(self.check_circular_dependencies(DEFAULT_MAX_DEPTH)?);
        issues.extend(self.check_orphan_entities()?);
        issues.extend(self.check_low_confidence_edges(0.5)?);
        issues.extend(self.check_duplicate_entities()?);
        issues.extend(self.check_missing_embeddings()?);
        issues.extend(self.check_self_referential_edges()?);
        issues.extend(self.check_mistyped_relationships()?);
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        Ok(issues)
    }

    pub fn check_circular_dependencies(&self, max_depth: usize) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        for relation in RelationType::CYCLE_SENSITIVE {
            for cycle in detect_cycles(self.store, self.user_id, relation, max_depth)? {
                issues.push(cycle_issue(&cycle));
            }
        }
        Ok(issues)
    }

    /// Entities reachable by the user but with no edges at all.
    pub fn check_orphan_entities(&self) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        for entity in self.store.all_entities(self.user_id)? {
            let touching = self.store.neighbors(&entity.id, None, 1)?;
            if touching.is_empty() {
                issues.push(ValidationIssue {
                    issue_type: IssueType::OrphanEntity,
                    severity: IssueSeverity::Warning,
                    message: format!("entity '{}' has no relationships", entity.name),
                    affected_nodes: vec![entity.id],
                    suggestion: Some("delete it or link it to a decision".to_string()),
                });
            }
        }
        Ok(issues)
    }

    pub fn check_low_confidence_edges(&self, threshold: f64) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        for edge in self.store.all_edges()? {
            if let Some(confidence) = edge.confidence {
                if confidence < threshold {
                    issues.push(ValidationIssue {
                        issue_type: IssueType::LowConfidenceRelationship,
                        severity: IssueSeverity::Info,
                        message: format!(
                            "{} edge at confidence {confidence:.2}",
                            edge.relation
                        ),
                        affected_nodes: vec![edge.src_id, edge.dst_id],
                        suggestion: None,
                    });
                }
            }
        }
        Ok(issues)
    }

    /// Same-type entity pairs that fuzzy-match but are not identical.
    pub fn check_duplicate_entities(&self) -> Result<Vec<ValidationIssue>> {
        let entities = self.store.all_entities(self.user_id)?;
        let mut issues = Vec::new();
        for i in 0..entities.len() {
            for j in (i + 1)..entities.len() {
                if entities[i].entity_type != entities[j].entity_type {
                    continue;
                }
                let ratio = token_sort_ratio(&entities[i].name, &entities[j].name);
                if ratio >= 0.85 && ratio < 1.0 {
                    issues.push(ValidationIssue {
                        issue_type: IssueType::DuplicateEntity,
                        severity: IssueSeverity::Warning,
                        message: format!(
                            "'{}' and '{}' look like duplicates (ratio {ratio:.2})",
                            entities[i].name, entities[j].name
                        ),
                        affected_nodes: vec![entities[i].id.clone(), entities[j].id.clone()],
                        suggestion: Some("run duplicate merging".to_string()),
                    });
                }
            }
        }
        Ok(issues)
    }

    pub fn check_missing_embeddings(&self) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        let embedded: HashSet<String> = self
            .store
            .entities_with_embeddings(self.user_id)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        for entity in self.store.all_entities(self.user_id)? {
            if !embedded.contains(&entity.id) {
                issues.push(ValidationIssue {
                    issue_type: IssueType::MissingEmbedding,
                    severity: IssueSeverity::Info,
                    message: format!("entity '{}' has no embedding", entity.name),
                    affected_nodes: vec![entity.id],
                    suggestion: Some("re-run embedding backfill".to_string()),
                });
            }
        }
        for decision in self.store.all_decisions(self.user_id)? {
            if decision.embedding.is_none() {
                issues.push(ValidationIssue {
                    issue_type: IssueType::MissingEmbedding,
                    severity: IssueSeverity::Info,
                    message: format!("decision '{}' has no embedding", decision.trigger),
                    affected_nodes: vec![decision.id],
                    suggestion: Some("re-run embedding backfill".to_string()),
                });
            }
        }
        Ok(issues)
    }

    pub fn check_self_referential_edges(&self) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        for edge in self.store.all_edges()? {
            if edge.src_id == edge.dst_id {
                issues.push(ValidationIssue {
                    issue_type: IssueType::SelfReferentialEdge,
                    severity: IssueSeverity::Error,
                    message: format!("{} edge from a node to itself", edge.relation),
                    affected_nodes: vec![edge.src_id],
                    suggestion: Some("delete the edge".to_string()),
                });
            }
        }
        Ok(issues)
    }

    /// Entity-only relationships between decisions and vice versa.
    pub fn check_mistyped_relationships(&self) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        for edge in self.store.all_edges()? {
            let decision_pair =
                edge.src_kind == NodeKind::Decision && edge.dst_kind == NodeKind::Decision;
            let entity_pair =
                edge.src_kind == NodeKind::Entity && edge.dst_kind == NodeKind::Entity;

            let mistyped = (edge.relation.is_entity_only() && decision_pair)
                || (edge.relation.is_decision_only() && entity_pair);
            if mistyped {
                issues.push(ValidationIssue {
                    issue_type: IssueType::MistypedRelationship,
                    severity: IssueSeverity::Error,
                    message: format!(
                        "{} edge between {} nodes",
                        edge.relation,
                        edge.src_kind.as_str()
                    ),
                    affected_nodes: vec![edge.src_id, edge.dst_id],
                    suggestion: Some("delete or retype the edge".to_string()),
                });
            }
        }
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DecisionTrace, Edge, Entity};
    use crate::ontology::EntityType;
    use pretty_assertions::assert_eq;

    fn entity(store: &GraphStore, name: &str, embedding: Option<Vec<f32>>) -> Entity {
        let mut e = Entity::new(name, EntityType::Technology);
        e.user_id = Some("u1".into());
        e.embedding = embedding;
        store.insert_entity(&e).unwrap();
        e
    }

    #[test]
    fn test_cycle_scenario_exact_report() {
        let store = GraphStore::in_memory().unwrap();
        let a = entity(&store, "A", Some(vec![0.1]));
        let b = entity(&store, "B", Some(vec![0.1]));
        let c = entity(&store, "C", Some(vec![0.1]));
        for (from, to) in [(&a, &b), (&b, &c), (&c, &a)] {
            store
                .merge_edge(
                    &Edge::new(
                        from.id.clone(),
                        NodeKind::Entity,
                        to.id.clone(),
                        NodeKind::Entity,
                        RelationType::DependsOn,
                    )
                    .with_confidence(0.9),
                )
                .unwrap();
        }

        let validator = GraphValidator::new(&store, "u1");
        let cycles = validator.check_circular_dependencies(20).unwrap();
        assert_eq!(cycles.len(), 1);
        let issue = &cycles[0];
        assert_eq!(issue.issue_type, IssueType::CircularDependency);
        assert_eq!(issue.severity, IssueSeverity::Error);
        let affected: std::collections::BTreeSet<&str> =
            issue.affected_nodes.iter().map(String::as_str).collect();
        assert_eq!(
            affected,
            [a.id.as_str(), b.id.as_str(), c.id.as_str()].into_iter().collect()
        );

        // Re-running yields the same single issue.
        let again = validator.check_circular_dependencies(20).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_orphan_and_duplicate_detection() {
        let store = GraphStore::in_memory().unwrap();
        entity(&store, "Lonely", Some(vec![0.1]));
        entity(&store, "PostgreSQL", Some(vec![0.1]));
        entity(&store, "PostgresSQL", Some(vec![0.1]));

        let validator = GraphValidator::new(&store, "u1");
        let issues = validator.validate_all().unwrap();

        let orphans = issues
            .iter()
            .filter(|i| i.issue_type == IssueType::OrphanEntity)
            .count();
        assert_eq!(orphans, 3);

        let duplicates: Vec<_> = issues
            .iter()
            .filter(|i| i.issue_type == IssueType::DuplicateEntity)
            .collect();
        assert_eq!(duplicates.len(), 1);
        assert!(duplicates[0].message.contains("PostgreSQL"));
    }

    #[test]
    fn test_mistyped_and_self_edges() {
        let store = GraphStore::in_memory().unwrap();
        let mut d1 = DecisionTrace::new("t1", "first decision text");
        d1.user_id = Some("u1".into());
        let mut d2 = DecisionTrace::new("t2", "second decision text");
        d2.user_id = Some("u1".into());
        store.insert_decision(&d1).unwrap();
        store.insert_decision(&d2).unwrap();

        // DEPENDS_ON is entity-only; between decisions it is mistyped.
        store
            .merge_edge(&Edge::new(
                d1.id.clone(),
                NodeKind::Decision,
                d2.id.clone(),
                NodeKind::Decision,
                RelationType::DependsOn,
            ))
            .unwrap();
        store
            .merge_edge(&Edge::new(
                d1.id.clone(),
                NodeKind::Decision,
                d1.id.clone(),
                NodeKind::Decision,
                RelationType::SimilarTo,
            ))
            .unwrap();

        let validator = GraphValidator::new(&store, "u1");
        let issues = validator.validate_all().unwrap();
        assert!(issues
            .iter()
            .any(|i| i.issue_type == IssueType::MistypedRelationship));
        assert!(issues
            .iter()
            .any(|i| i.issue_type == IssueType::SelfReferentialEdge));
        // Errors sort before warnings and infos.
        assert_eq!(issues[0].severity, IssueSeverity::Error);
    }
}
