use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use modelgraph_core::{NodeId, RelationshipId};

/// Fixed relationship vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    LocatedIn,
    Contains,
    AdjacentTo,
    Above,
    Below,
    HostedBy,
    Hosts,
    ConnectedTo,
    PartOf,
    AssignedTo,
    HasCost,
    DependsOn,
    ReferencedBy,
    Precedes,
    Follows,
    ConcurrentWith,
}

impl RelationType {
    pub const ALL: [RelationType; 16] = [
        RelationType::LocatedIn,
        RelationType::Contains,
        RelationType::AdjacentTo,
        RelationType::Above,
        RelationType::Below,
        RelationType::HostedBy,
        RelationType::Hosts,
        RelationType::ConnectedTo,
        RelationType::PartOf,
        RelationType::AssignedTo,
        RelationType::HasCost,
        RelationType::DependsOn,
        RelationType::ReferencedBy,
        RelationType::Precedes,
        RelationType::Follows,
        RelationType::ConcurrentWith,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::LocatedIn => "LOCATED_IN",
            RelationType::Contains => "CONTAINS",
            RelationType::AdjacentTo => "ADJACENT_TO",
            RelationType::Above => "ABOVE",
            RelationType::Below => "BELOW",
            RelationType::HostedBy => "HOSTED_BY",
            RelationType::Hosts => "HOSTS",
            RelationType::ConnectedTo => "CONNECTED_TO",
            RelationType::PartOf => "PART_OF",
            RelationType::AssignedTo => "ASSIGNED_TO",
            RelationType::HasCost => "HAS_COST",
            RelationType::DependsOn => "DEPENDS_ON",
            RelationType::ReferencedBy => "REFERENCED_BY",
            RelationType::Precedes => "PRECEDES",
            RelationType::Follows => "FOLLOWS",
            RelationType::ConcurrentWith => "CONCURRENT_WITH",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        RelationType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown relation type: {}", s))
    }
}

/// Directed, typed edge between two graph nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub source: NodeId,
    pub target: NodeId,
    pub relation_type: RelationType,
    #[serde(default)]
    pub properties: Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    /// Created by the inference rules rather than by a caller.
    #[serde(default)]
    pub inferred: bool,
}

impl Relationship {
    pub fn new(source: NodeId, target: NodeId, relation_type: RelationType) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            target,
            relation_type,
            properties: Map::new(),
            created_at: Utc::now(),
            inferred: false,
        }
    }

    pub fn with_property<K: Into<String>>(mut self, key: K, value: JsonValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub(crate) fn inferred(mut self) -> Self {
        self.inferred = true;
        self
    }

    pub fn key(&self) -> EdgeKey {
        (self.source, self.target, self.relation_type)
    }

    pub fn touches(&self, node: NodeId) -> bool {
        self.source == node || self.target == node
    }
}

/// Natural key of a relationship. At most one edge exists per key.
pub type EdgeKey = (NodeId, NodeId, RelationType);
