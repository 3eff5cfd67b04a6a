use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

use modelgraph_core::{
    CapturedBatch, EntityCapture, EntityId, GraphConfig, ModelGraphError, NodeId,
    RelationshipId, Result, SpatialUnit,
};

use crate::node::{GraphNode, NodeKind, NodeVariant};
use crate::relationship::{EdgeKey, RelationType, Relationship};
use crate::sync::SyncOp;

/// Counts describing one incremental update or rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphUpdate {
    pub nodes_added: usize,
    pub nodes_modified: usize,
    pub nodes_deleted: usize,
    /// Edges created or removed, including edges cascaded by node deletion.
    pub relationships_touched: usize,
    pub timestamp: DateTime<Utc>,
}

impl GraphUpdate {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            nodes_added: 0,
            nodes_modified: 0,
            nodes_deleted: 0,
            relationships_touched: 0,
            timestamp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes_added + self.nodes_modified + self.nodes_deleted + self.relationships_touched
            == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_relationships: usize,
    pub element_nodes: usize,
    pub spatial_nodes: usize,
    pub task_nodes: usize,
    pub cost_nodes: usize,
    pub document_nodes: usize,
    pub relationships_by_type: BTreeMap<RelationType, usize>,
}

/// Entities without a category, or in an excluded category, never become
/// nodes.
#[derive(Debug, Clone)]
pub struct CategoryFilter {
    excluded: HashSet<String>,
}

impl CategoryFilter {
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            excluded: excluded
                .into_iter()
                .map(|c| c.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn is_eligible(&self, capture: &EntityCapture) -> bool {
        match capture.category() {
            Some(category) => !self.excluded.contains(&category.to_lowercase()),
            None => false,
        }
    }
}

impl Default for CategoryFilter {
    fn default() -> Self {
        Self::from(&GraphConfig::default())
    }
}

impl From<&GraphConfig> for CategoryFilter {
    fn from(config: &GraphConfig) -> Self {
        Self::new(&config.excluded_categories)
    }
}

/// In-memory typed graph of one document.
///
/// `entity_index` maps host entity ids to element nodes, `spatial_index`
/// maps them to spatial nodes. Both are derived from `nodes` and are
/// rebuilt from scratch by [`rebuild`](Self::rebuild).
#[derive(Debug, Default)]
pub struct OntologyGraph {
    pub(crate) nodes: HashMap<NodeId, GraphNode>,
    pub(crate) relationships: HashMap<RelationshipId, Relationship>,
    pub(crate) edge_keys: HashMap<EdgeKey, RelationshipId>,
    pub(crate) outgoing: HashMap<NodeId, HashSet<RelationshipId>>,
    pub(crate) incoming: HashMap<NodeId, HashSet<RelationshipId>>,
    pub(crate) entity_index: HashMap<EntityId, NodeId>,
    pub(crate) spatial_index: HashMap<EntityId, NodeId>,
    filter: CategoryFilter,
    sync_tracking: bool,
    outbox: Vec<SyncOp>,
}

impl OntologyGraph {
    pub fn new(filter: CategoryFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    /// Record a [`SyncOp`] for every mutation, to be collected with
    /// [`drain_sync_ops`](Self::drain_sync_ops).
    pub fn set_sync_tracking(&mut self, enabled: bool) {
        self.sync_tracking = enabled;
        if !enabled {
            self.outbox.clear();
        }
    }

    pub fn drain_sync_ops(&mut self) -> Vec<SyncOp> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn record(&mut self, op: SyncOp) {
        if self.sync_tracking {
            self.outbox.push(op);
        }
    }

    pub fn filter(&self) -> &CategoryFilter {
        &self.filter
    }

    pub fn clear(&mut self) {
        if self.sync_tracking {
            let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
            self.outbox.extend(ids.into_iter().map(SyncOp::DeleteNode));
        }
        self.nodes.clear();
        self.relationships.clear();
        self.edge_keys.clear();
        self.outgoing.clear();
        self.incoming.clear();
        self.entity_index.clear();
        self.spatial_index.clear();
    }

    /// Replace the whole graph: element nodes for every eligible entity,
    /// spatial nodes for every unit, then inference over all elements.
    pub fn rebuild(&mut self, entities: &[EntityCapture], spatial_units: &[SpatialUnit]) -> GraphUpdate {
        let start_time = Instant::now();
        self.clear();

        let mut update = GraphUpdate::new(Utc::now());
        let eligible: Vec<GraphNode> = entities
            .iter()
            .filter(|c| self.filter.is_eligible(c))
            .map(GraphNode::element)
            .collect();
        for node in eligible {
            self.insert_node(node);
            update.nodes_added += 1;
        }
        for unit in spatial_units {
            self.insert_node(GraphNode::spatial(unit));
            update.nodes_added += 1;
        }

        let elements: Vec<NodeId> = self.entity_index.values().copied().collect();
        for node_id in elements {
            let outcome = self.infer_relationships(node_id);
            update.relationships_touched += outcome.created + outcome.removed;
        }

        info!(
            target: "modelgraph::graph",
            nodes = self.nodes.len(),
            relationships = self.relationships.len(),
            skipped = entities.len() + spatial_units.len() - update.nodes_added,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Graph rebuilt"
        );
        update
    }

    /// Apply one batch in the order added, modified, deleted, then re-run
    /// inference for the surviving added and modified nodes.
    ///
    /// An added entity that already has a node is refreshed in place and
    /// counted as modified. A modified entity without a node is skipped.
    pub fn apply_batch(&mut self, batch: &CapturedBatch) -> GraphUpdate {
        let start_time = Instant::now();
        let mut update = GraphUpdate::new(batch.timestamp);
        let mut touched: Vec<NodeId> = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();

        for capture in &batch.added {
            if !self.filter.is_eligible(capture) {
                debug!(entity = %capture.id, "Entity not eligible for graph");
                continue;
            }
            let node_id = match self.entity_index.get(&capture.id).copied() {
                Some(node_id) => {
                    self.refresh_element(node_id, capture);
                    update.nodes_modified += 1;
                    node_id
                }
                None => {
                    update.nodes_added += 1;
                    self.insert_node(GraphNode::element(capture))
                }
            };
            if seen.insert(node_id) {
                touched.push(node_id);
            }
        }

        for capture in &batch.modified {
            match self.entity_index.get(&capture.id).copied() {
                Some(node_id) => {
                    self.refresh_element(node_id, capture);
                    update.nodes_modified += 1;
                    if seen.insert(node_id) {
                        touched.push(node_id);
                    }
                }
                None if self.filter.is_eligible(capture) => {
                    warn!(entity = %capture.id, "Modified entity has no graph node, skipping")
                }
                None => debug!(entity = %capture.id, "Modified entity not eligible for graph"),
            }
        }

        for entity_id in &batch.deleted {
            let node_id = self
                .entity_index
                .get(entity_id)
                .or_else(|| self.spatial_index.get(entity_id))
                .copied();
            match node_id.and_then(|id| self.remove_node(id)) {
                Some((_, cascaded)) => {
                    update.nodes_deleted += 1;
                    update.relationships_touched += cascaded;
                }
                None => debug!(entity = %entity_id, "Deleted entity had no graph node"),
            }
        }

        for node_id in touched {
            if self.nodes.contains_key(&node_id) {
                let outcome = self.infer_relationships(node_id);
                update.relationships_touched += outcome.created + outcome.removed;
            }
        }

        debug!(
            target: "modelgraph::graph",
            added = update.nodes_added,
            modified = update.nodes_modified,
            deleted = update.nodes_deleted,
            relationships = update.relationships_touched,
            elapsed_us = start_time.elapsed().as_micros() as u64,
            "Graph batch applied"
        );
        update
    }

    fn refresh_element(&mut self, node_id: NodeId, capture: &EntityCapture) {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        node.refresh_element(capture);
        let snapshot = node.clone();
        self.record(SyncOp::UpsertNode(snapshot));
    }

    /// Insert or replace a node. Element and spatial nodes are indexed by
    /// their host entity id.
    pub fn insert_node(&mut self, node: GraphNode) -> NodeId {
        let id = node.id;
        match &node.kind {
            NodeKind::Element(e) => {
                if let Some(previous) = self.entity_index.insert(e.entity_id, id) {
                    if previous != id {
                        warn!(entity = %e.entity_id, "Entity index entry replaced");
                    }
                }
            }
            NodeKind::Spatial(s) => {
                self.spatial_index.insert(s.entity_id, id);
            }
            _ => {}
        }
        self.record(SyncOp::UpsertNode(node.clone()));
        self.nodes.insert(id, node);
        id
    }

    /// Create a relationship between two existing nodes. Relating the same
    /// pair with the same type again merges the properties into the existing
    /// edge and returns its id.
    pub fn relate(
        &mut self,
        source: NodeId,
        target: NodeId,
        relation_type: RelationType,
        properties: Map<String, JsonValue>,
    ) -> Result<RelationshipId> {
        for endpoint in [source, target] {
            if !self.nodes.contains_key(&endpoint) {
                return Err(ModelGraphError::NodeNotFound(endpoint.to_string()));
            }
        }

        if let Some(&existing) = self.edge_keys.get(&(source, target, relation_type)) {
            if let Some(rel) = self.relationships.get_mut(&existing) {
                rel.properties.extend(properties);
                let snapshot = rel.clone();
                self.record(SyncOp::CreateRelationship(snapshot));
            }
            return Ok(existing);
        }

        let mut rel = Relationship::new(source, target, relation_type);
        rel.properties = properties;
        Ok(self.add_edge(rel))
    }

    pub fn unrelate(&mut self, source: NodeId, target: NodeId, relation_type: RelationType) -> bool {
        match self.edge_keys.get(&(source, target, relation_type)).copied() {
            Some(id) => self.remove_edge(id, true).is_some(),
            None => false,
        }
    }

    /// Insert a relationship whose endpoints were already validated and
    /// whose key is free.
    pub(crate) fn add_edge(&mut self, rel: Relationship) -> RelationshipId {
        let id = rel.id;
        self.edge_keys.insert(rel.key(), id);
        self.outgoing.entry(rel.source).or_default().insert(id);
        self.incoming.entry(rel.target).or_default().insert(id);
        self.record(SyncOp::CreateRelationship(rel.clone()));
        self.relationships.insert(id, rel);
        id
    }

    pub(crate) fn remove_edge(&mut self, id: RelationshipId, record: bool) -> Option<Relationship> {
        let rel = self.relationships.remove(&id)?;
        self.edge_keys.remove(&rel.key());
        if let Some(ids) = self.outgoing.get_mut(&rel.source) {
            ids.remove(&id);
        }
        if let Some(ids) = self.incoming.get_mut(&rel.target) {
            ids.remove(&id);
        }
        if record {
            self.record(SyncOp::DeleteRelationship {
                source: rel.source,
                target: rel.target,
                relation_type: rel.relation_type,
            });
        }
        Some(rel)
    }

    /// Remove a node and every relationship naming it. Returns the node and
    /// the number of relationships removed with it.
    pub fn remove_node(&mut self, id: NodeId) -> Option<(GraphNode, usize)> {
        let node = self.nodes.remove(&id)?;

        let mut edges = self.outgoing.remove(&id).unwrap_or_default();
        edges.extend(self.incoming.remove(&id).unwrap_or_default());
        let mut cascaded = 0;
        for rel_id in edges {
            if self.remove_edge(rel_id, false).is_some() {
                cascaded += 1;
            }
        }

        let index = match &node.kind {
            NodeKind::Element(_) => Some(&mut self.entity_index),
            NodeKind::Spatial(_) => Some(&mut self.spatial_index),
            _ => None,
        };
        if let (Some(index), Some(entity_id)) = (index, node.entity_id()) {
            if index.get(&entity_id) == Some(&id) {
                index.remove(&entity_id);
            }
        }

        self.record(SyncOp::DeleteNode(id));
        debug!(node = %id, cascaded, "Node removed");
        Some((node, cascaded))
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    /// Element node for a host entity, falling back to a spatial node.
    pub fn node_by_entity(&self, entity_id: EntityId) -> Option<&GraphNode> {
        self.entity_index
            .get(&entity_id)
            .or_else(|| self.spatial_index.get(&entity_id))
            .and_then(|id| self.nodes.get(id))
    }

    pub fn spatial_by_entity(&self, entity_id: EntityId) -> Option<&GraphNode> {
        self.spatial_index
            .get(&entity_id)
            .and_then(|id| self.nodes.get(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn nodes_of(&self, variant: NodeVariant) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values().filter(move |n| n.variant() == variant)
    }

    pub fn relationship(&self, id: RelationshipId) -> Option<&Relationship> {
        self.relationships.get(&id)
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    pub fn outgoing(&self, node: NodeId) -> Vec<&Relationship> {
        self.edges_in(self.outgoing.get(&node))
    }

    pub fn incoming(&self, node: NodeId) -> Vec<&Relationship> {
        self.edges_in(self.incoming.get(&node))
    }

    /// Relationships naming `node` as source or target.
    pub fn relationships_of(&self, node: NodeId) -> Vec<&Relationship> {
        let mut rels = self.outgoing(node);
        rels.extend(
            self.incoming(node)
                .into_iter()
                .filter(|r| r.source != node),
        );
        rels
    }

    fn edges_in(&self, ids: Option<&HashSet<RelationshipId>>) -> Vec<&Relationship> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.relationships.get(id))
                .collect()
        })
        .unwrap_or_default()
    }

    /// Linear scan over every node.
    pub fn query<F>(&self, predicate: F) -> Vec<&GraphNode>
    where
        F: Fn(&GraphNode) -> bool,
    {
        self.nodes.values().filter(|n| predicate(n)).collect()
    }

    /// Element nodes with a LOCATED_IN edge to `spatial`.
    pub fn elements_in_spatial(&self, spatial: NodeId) -> Vec<&GraphNode> {
        self.incoming(spatial)
            .into_iter()
            .filter(|r| r.relation_type == RelationType::LocatedIn)
            .filter_map(|r| self.nodes.get(&r.source))
            .filter(|n| n.variant() == NodeVariant::Element)
            .collect()
    }

    /// Task nodes the element is ASSIGNED_TO.
    pub fn tasks_for_element(&self, element: NodeId) -> Vec<&GraphNode> {
        self.targets_of(element, RelationType::AssignedTo, NodeVariant::Task)
    }

    /// Cost nodes reached through HAS_COST.
    pub fn costs_for_element(&self, element: NodeId) -> Vec<&GraphNode> {
        self.targets_of(element, RelationType::HasCost, NodeVariant::Cost)
    }

    fn targets_of(&self, source: NodeId, relation_type: RelationType, variant: NodeVariant) -> Vec<&GraphNode> {
        self.outgoing(source)
            .into_iter()
            .filter(|r| r.relation_type == relation_type)
            .filter_map(|r| self.nodes.get(&r.target))
            .filter(|n| n.variant() == variant)
            .collect()
    }

    pub fn statistics(&self) -> GraphStatistics {
        let mut stats = GraphStatistics {
            total_nodes: self.nodes.len(),
            total_relationships: self.relationships.len(),
            ..Default::default()
        };
        for node in self.nodes.values() {
            match node.variant() {
                NodeVariant::Element => stats.element_nodes += 1,
                NodeVariant::Spatial => stats.spatial_nodes += 1,
                NodeVariant::Task => stats.task_nodes += 1,
                NodeVariant::Cost => stats.cost_nodes += 1,
                NodeVariant::Document => stats.document_nodes += 1,
            }
        }
        for rel in self.relationships.values() {
            *stats.relationships_by_type.entry(rel.relation_type).or_default() += 1;
        }
        stats
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
