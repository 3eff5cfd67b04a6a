use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use uuid::Uuid;

use modelgraph_core::{
    EntityCapture, EntityId, EntityRelations, NodeId, Point3, SpatialKind, SpatialUnit, UNKNOWN,
};

pub const DEFAULT_CURRENCY: &str = "KRW";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeVariant {
    Element,
    Spatial,
    Task,
    Cost,
    Document,
}

impl fmt::Display for NodeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeVariant::Element => "Element",
            NodeVariant::Spatial => "Spatial",
            NodeVariant::Task => "Task",
            NodeVariant::Cost => "Cost",
            NodeVariant::Document => "Document",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    pub entity_id: EntityId,
    pub unique_id: Option<String>,
    pub category: String,
    pub family: String,
    pub type_name: String,
    pub location: Option<Point3>,
    /// Host references consumed by relationship inference.
    #[serde(default)]
    pub relations: EntityRelations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialNode {
    pub entity_id: EntityId,
    pub kind: SpatialKind,
    pub number: Option<String>,
    pub area: Option<f64>,
    pub volume: Option<f64>,
    pub level_name: Option<String>,
    pub elevation: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Delayed,
    OnHold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub wbs_code: String,
    pub task_name: String,
    pub planned_start: Option<DateTime<Utc>>,
    pub planned_end: Option<DateTime<Utc>>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    /// 0.0 to 100.0
    pub progress: f64,
    pub status: TaskStatus,
    pub parent_task: Option<NodeId>,
}

impl TaskNode {
    pub fn new(wbs_code: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            wbs_code: wbs_code.into(),
            task_name: task_name.into(),
            planned_start: None,
            planned_end: None,
            actual_start: None,
            actual_end: None,
            progress: 0.0,
            status: TaskStatus::default(),
            parent_task: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostNode {
    pub cbs_code: String,
    pub cost_category: String,
    pub unit_cost: f64,
    pub quantity: f64,
    pub unit: String,
    pub total_cost: f64,
    pub currency: String,
    pub parent_cost: Option<NodeId>,
}

impl CostNode {
    pub fn new(cbs_code: impl Into<String>, unit_cost: f64, quantity: f64) -> Self {
        Self {
            cbs_code: cbs_code.into(),
            cost_category: String::new(),
            unit_cost,
            quantity,
            unit: String::new(),
            total_cost: unit_cost * quantity,
            currency: DEFAULT_CURRENCY.to_string(),
            parent_cost: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentNode {
    pub document_type: String,
    pub file_path: Option<String>,
    pub version: Option<String>,
    pub issue_date: Option<DateTime<Utc>>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant")]
pub enum NodeKind {
    Element(ElementNode),
    Spatial(SpatialNode),
    Task(TaskNode),
    Cost(CostNode),
    Document(DocumentNode),
}

impl NodeKind {
    pub fn variant(&self) -> NodeVariant {
        match self {
            NodeKind::Element(_) => NodeVariant::Element,
            NodeKind::Spatial(_) => NodeVariant::Spatial,
            NodeKind::Task(_) => NodeVariant::Task,
            NodeKind::Cost(_) => NodeVariant::Cost,
            NodeKind::Document(_) => NodeVariant::Document,
        }
    }
}

/// Shared envelope around every node variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub label: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub properties: Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl GraphNode {
    pub fn new(label: impl Into<String>, kind: NodeKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            kind,
            properties: Map::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Element node for a capture. Attributes are copied into the property
    /// map.
    pub fn element(capture: &EntityCapture) -> Self {
        let class = capture.classification.clone();
        let element = ElementNode {
            entity_id: capture.id,
            unique_id: capture.unique_id.clone(),
            category: class
                .as_ref()
                .map(|c| c.category.clone())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            family: class
                .as_ref()
                .map(|c| c.family.clone())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            type_name: class
                .map(|c| c.type_name)
                .unwrap_or_else(|| UNKNOWN.to_string()),
            location: capture.anchor(),
            relations: capture.relations,
        };

        let mut node = Self::new(element_label(capture), NodeKind::Element(element));
        for (name, value) in &capture.attributes {
            node.properties.insert(name.clone(), value.to_json());
        }
        node
    }

    pub fn spatial(unit: &SpatialUnit) -> Self {
        let mut node = Self::new(
            unit.name.clone(),
            NodeKind::Spatial(SpatialNode {
                entity_id: unit.id,
                kind: unit.kind,
                number: unit.number.clone(),
                area: unit.area,
                volume: unit.volume,
                level_name: unit.level_name.clone(),
                elevation: unit.elevation,
            }),
        );
        if let Some(elevation) = unit.elevation {
            node.properties
                .insert("Elevation".to_string(), JsonValue::from(elevation));
        }
        node
    }

    pub fn task(task: TaskNode) -> Self {
        Self::new(task.task_name.clone(), NodeKind::Task(task))
    }

    pub fn cost(label: impl Into<String>, cost: CostNode) -> Self {
        Self::new(label, NodeKind::Cost(cost))
    }

    pub fn document(label: impl Into<String>, document: DocumentNode) -> Self {
        Self::new(label, NodeKind::Document(document))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn variant(&self) -> NodeVariant {
        self.kind.variant()
    }

    pub fn as_element(&self) -> Option<&ElementNode> {
        match &self.kind {
            NodeKind::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_spatial(&self) -> Option<&SpatialNode> {
        match &self.kind {
            NodeKind::Spatial(s) => Some(s),
            _ => None,
        }
    }

    /// Host entity behind an element or spatial node.
    pub fn entity_id(&self) -> Option<EntityId> {
        match &self.kind {
            NodeKind::Element(e) => Some(e.entity_id),
            NodeKind::Spatial(s) => Some(s.entity_id),
            _ => None,
        }
    }

    /// Refresh an element node from a newer capture, keeping its identity.
    /// Fields the capture could not read keep their previous values.
    pub(crate) fn refresh_element(&mut self, capture: &EntityCapture) {
        let NodeKind::Element(element) = &mut self.kind else {
            return;
        };
        if let Some(class) = &capture.classification {
            element.category = class.category.clone();
            element.family = class.family.clone();
            element.type_name = class.type_name.clone();
        }
        if let Some(anchor) = capture.anchor() {
            element.location = Some(anchor);
        }
        if capture.unique_id.is_some() {
            element.unique_id = capture.unique_id.clone();
        }
        let unread = capture.unread_relations;
        if !unread.level {
            element.relations.level = capture.relations.level;
        }
        if !unread.host {
            element.relations.host = capture.relations.host;
        }
        if !unread.room {
            element.relations.room = capture.relations.room;
        }
        if capture.name.is_some() || capture.classification.is_some() {
            self.label = element_label(capture);
        }
        self.modified_at = Utc::now();
    }
}

fn element_label(capture: &EntityCapture) -> String {
    match (&capture.name, capture.category()) {
        (Some(name), _) if !name.is_empty() => name.clone(),
        (_, Some(category)) => format!("{} {}", category, capture.id),
        _ => format!("Entity {}", capture.id),
    }
}
