use serde_json::Value as JsonValue;
use std::collections::HashMap;

use modelgraph_core::{EntityId, EntityRelations, NodeId, RelationshipId};

use crate::ontology::OntologyGraph;
use crate::relationship::{EdgeKey, RelationType, Relationship};

/// Relationship rules applied to every element node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceRule {
    /// Containing level, LOCATED_IN the level's spatial node.
    Level,
    /// Hosting entity, HOSTED_BY the host's element node.
    Host,
    /// Containing room or space, LOCATED_IN its spatial node.
    Room,
}

impl InferenceRule {
    pub const ALL: [InferenceRule; 3] = [InferenceRule::Level, InferenceRule::Host, InferenceRule::Room];

    pub fn relation_type(&self) -> RelationType {
        match self {
            InferenceRule::Level | InferenceRule::Room => RelationType::LocatedIn,
            InferenceRule::Host => RelationType::HostedBy,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InferenceRule::Level => "level",
            InferenceRule::Host => "host",
            InferenceRule::Room => "room",
        }
    }

    fn reference(&self, relations: &EntityRelations) -> Option<EntityId> {
        match self {
            InferenceRule::Level => relations.level,
            InferenceRule::Host => relations.host,
            InferenceRule::Room => relations.room,
        }
    }

    fn resolve(&self, graph: &OntologyGraph, entity: EntityId) -> Option<NodeId> {
        let index = match self {
            InferenceRule::Level | InferenceRule::Room => &graph.spatial_index,
            InferenceRule::Host => &graph.entity_index,
        };
        index.get(&entity).copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferenceOutcome {
    pub created: usize,
    pub removed: usize,
}

impl OntologyGraph {
    /// Bring the node's inferred out-edges in line with its current host
    /// references. Inferred edges whose rule no longer applies are removed,
    /// missing ones are created, and edges created through
    /// [`relate`](OntologyGraph::relate) are left alone.
    pub fn infer_relationships(&mut self, node_id: NodeId) -> InferenceOutcome {
        let mut outcome = InferenceOutcome::default();
        let Some(relations) = self
            .nodes
            .get(&node_id)
            .and_then(|n| n.as_element())
            .map(|e| e.relations)
        else {
            return outcome;
        };

        let desired: HashMap<EdgeKey, InferenceRule> = InferenceRule::ALL
            .iter()
            .filter_map(|rule| {
                let entity = rule.reference(&relations)?;
                let target = rule.resolve(self, entity)?;
                (target != node_id).then_some(((node_id, target, rule.relation_type()), *rule))
            })
            .collect();

        let stale: Vec<RelationshipId> = self
            .outgoing
            .get(&node_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        self.relationships
                            .get(id)
                            .is_some_and(|r| r.inferred && !desired.contains_key(&r.key()))
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        for id in stale {
            if self.remove_edge(id, true).is_some() {
                outcome.removed += 1;
            }
        }

        for (key, rule) in desired {
            if self.edge_keys.contains_key(&key) {
                continue;
            }
            let (source, target, relation_type) = key;
            let rel = Relationship::new(source, target, relation_type)
                .with_property("rule", JsonValue::from(rule.name()))
                .inferred();
            self.add_edge(rel);
            outcome.created += 1;
        }

        outcome
    }
}
