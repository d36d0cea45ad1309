//! Duplicate-entity merging.
//!
//! Groups same-type entities whose pairwise token-sort ratio reaches the
//! merge threshold, elects a representative (canonical names win), moves
//! every edge onto it, folds the duplicates' names and aliases into its
//! alias set, and deletes the duplicates. The caller flushes the
//! resolution cache afterwards.

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::graph::{Entity, GraphStore};
use crate::ontology::is_canonical_name;

use super::fuzzy::token_sort_ratio;

const MERGE_THRESHOLD: f64 = 0.85;

/// Outcome of a merge sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    /// Number of duplicate groups found.
    pub groups: usize,
    /// Number of entities deleted into their representatives.
    pub merged: usize,
    /// Representative name per group, with the names folded into it.
    pub details: Vec<(String, Vec<String>)>,
}

fn elect_representative(group: &[Entity]) -> usize {
    group
        .iter()
        .position(|e| is_canonical_name(&e.name))
        .unwrap_or_else(|| {
            // Otherwise prefer the entity with the richest alias set.
            group
                .iter()
                .enumerate()
                .max_by_key(|(_, e)| e.aliases.len())
                .map(|(i, _)| i)
                .unwrap_or(0)
        })
}

/// Merge duplicate entities for one user. Returns what was merged.
pub fn merge_duplicate_entities(store: &GraphStore, user_id: &str) -> Result<MergeReport> {
    let entities = store.all_entities(user_id)?;
    let mut assigned = vec![false; entities.len()];
    let mut report = MergeReport::default();

    for i in 0..entities.len() {
        if assigned[i] {
            continue;
        }
        let mut group: Vec<Entity> = vec![entities[i].clone()];
        assigned[i] = true;
        for j in (i + 1)..entities.len() {
            if assigned[j] || entities[j].entity_type != entities[i].entity_type {
                continue;
            }
            let ratio = token_sort_ratio(&entities[i].name, &entities[j].name);
            // ratio == 1.0 with identical names cannot happen here (exact
            // resolution would have deduplicated), but same-norm variants do.
            if ratio >= MERGE_THRESHOLD {
                group.push(entities[j].clone());
                assigned[j] = true;
            }
        }
        if group.len() < 2 {
            continue;
        }

        let rep_idx = elect_representative(&group);
        let representative = group[rep_idx].clone();
        let mut folded: Vec<String> = Vec::new();

        for (idx, duplicate) in group.iter().enumerate() {
            if idx == rep_idx {
                continue;
            }
            store.transfer_edges(&duplicate.id, &representative.id)?;
            store.add_entity_alias(&representative.id, &duplicate.name)?;
            for alias in &duplicate.aliases {
                store.add_entity_alias(&representative.id, alias)?;
            }
            store.delete_entity(user_id, &duplicate.id, true)?;
            folded.push(duplicate.name.clone());
            report.merged += 1;
        }

        report.groups += 1;
        report.details.push((representative.name.clone(), folded));
    }

    if report.merged > 0 {
        info!(
            groups = report.groups,
            merged = report.merged,
            "merged duplicate entities"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DecisionTrace, Edge, NodeKind};
    use crate::ontology::{EntityType, RelationType};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn seeded_store() -> Arc<GraphStore> {
        Arc::new(GraphStore::in_memory().unwrap())
    }

    fn entity(store: &GraphStore, name: &str, entity_type: EntityType) -> Entity {
        let mut e = Entity::new(name, entity_type);
        e.user_id = Some("u1".into());
        store.insert_entity(&e).unwrap();
        e
    }

    #[test]
    fn test_merge_groups_and_transfers_edges() {
        let store = seeded_store();
        let keep = entity(&store, "PostgreSQL", EntityType::Technology);
        let dup = entity(&store, "postgre sql", EntityType::Technology);
        let unrelated = entity(&store, "React", EntityType::Technology);

        let mut d = DecisionTrace::new("pick a db", "Use PostgreSQL");
        d.user_id = Some("u1".into());
        store.insert_decision(&d).unwrap();
        store
            .merge_edge(&Edge::new(
                d.id.clone(),
                NodeKind::Decision,
                dup.id.clone(),
                NodeKind::Entity,
                RelationType::Involves,
            ))
            .unwrap();

        let report = merge_duplicate_entities(&store, "u1").unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(report.merged, 1);
        // Canonical name elected representative.
        assert_eq!(report.details[0].0, "PostgreSQL");

        // The INVOLVES edge moved to the representative.
        assert_eq!(store.edges_to(&keep.id, None).unwrap().len(), 1);
        assert!(store.get_entity("u1", &dup.id).unwrap().is_none());
        // The duplicate's name became an alias.
        let kept = store.get_entity("u1", &keep.id).unwrap().unwrap();
        assert!(kept.aliases.iter().any(|a| a == "postgre sql"));
        // Unrelated entity untouched.
        assert!(store.get_entity("u1", &unrelated.id).unwrap().is_some());
    }

    #[test]
    fn test_different_types_never_merge() {
        let store = seeded_store();
        entity(&store, "gateway", EntityType::System);
        entity(&store, "gateway", EntityType::Concept);

        let report = merge_duplicate_entities(&store, "u1").unwrap();
        assert_eq!(report.groups, 0);
        assert_eq!(store.count_entities("u1").unwrap(), 2);
    }

    #[test]
    fn test_no_duplicates_is_noop() {
        let store = seeded_store();
        entity(&store, "Redis", EntityType::Technology);
        entity(&store, "Kafka", EntityType::Technology);
        let report = merge_duplicate_entities(&store, "u1").unwrap();
        assert_eq!(report.merged, 0);
    }
}
