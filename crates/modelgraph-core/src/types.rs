use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type NodeId = Uuid;
pub type RelationshipId = Uuid;

pub const UNKNOWN: &str = "Unknown";

/// Identifier the host document assigns to one of its entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId(value)
    }
}

/// Opaque identity of a tracked document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Stable path first, then title, then a generated id.
    ///
    /// The generated fallback has no identity across sessions: a document
    /// with neither path nor title is a new document every time it is
    /// started.
    pub fn derive(path: Option<&str>, title: Option<&str>) -> Self {
        fn non_empty(s: Option<&str>) -> Option<&str> {
            s.map(str::trim).filter(|s| !s.is_empty())
        }
        if let Some(path) = non_empty(path) {
            return Self::new(path);
        }
        if let Some(title) = non_empty(title) {
            return Self::new(title);
        }
        Self::new(format!("generated:{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_generated(&self) -> bool {
        self.0.starts_with("generated:")
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const ORIGIN: Point3 = Point3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// True when every axis differs by at most `tolerance`.
    pub fn approx_eq(&self, other: &Point3, tolerance: f64) -> bool {
        (self.x - other.x).abs() <= tolerance
            && (self.y - other.y).abs() <= tolerance
            && (self.z - other.z).abs() <= tolerance
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Placement of an entity: a single point or the two ends of a curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Point { point: Point3 },
    Curve { start: Point3, end: Point3 },
}

impl Location {
    pub fn point(x: f64, y: f64, z: f64) -> Self {
        Location::Point {
            point: Point3::new(x, y, z),
        }
    }

    pub fn curve(start: Point3, end: Point3) -> Self {
        Location::Curve { start, end }
    }

    /// Point used for graph coordinates and diff comparison. Curves anchor
    /// at their start point.
    pub fn anchor(&self) -> Point3 {
        match self {
            Location::Point { point } => *point,
            Location::Curve { start, .. } => *start,
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            Location::Point { point } => point.is_finite(),
            Location::Curve { start, end } => start.is_finite() && end.is_finite(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub family: String,
    pub type_name: String,
}

impl Classification {
    pub fn new(
        category: impl Into<String>,
        family: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            family: family.into(),
            type_name: type_name.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN, UNKNOWN)
    }
}

/// Type-tagged attribute value read from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    String(String),
    Integer(i64),
    Double(f64),
    Reference(EntityId),
}

impl AttributeValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::String(s) => serde_json::Value::from(s.as_str()),
            AttributeValue::Integer(i) => serde_json::Value::from(*i),
            AttributeValue::Double(d) => serde_json::Value::from(*d),
            AttributeValue::Reference(id) => serde_json::Value::from(id.0),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Integer(i) => write!(f, "{}", i),
            AttributeValue::Double(d) => write!(f, "{}", d),
            AttributeValue::Reference(id) => write!(f, "#{}", id),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<EntityId> for AttributeValue {
    fn from(value: EntityId) -> Self {
        AttributeValue::Reference(value)
    }
}

pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Containment and hosting references of an entity, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityRelations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<EntityId>,
}

/// Relation reads that failed during a lenient capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnreadRelations {
    pub level: bool,
    pub host: bool,
    pub room: bool,
}

impl UnreadRelations {
    pub fn any(&self) -> bool {
        self.level || self.host || self.room
    }
}

/// Best-effort capture of one entity. Fields the host failed to provide are
/// left empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCapture {
    pub id: EntityId,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub attributes: AttributeMap,
    #[serde(default)]
    pub relations: EntityRelations,
    /// Not persisted; only meaningful for captures fresh from the host.
    #[serde(skip)]
    pub unread_relations: UnreadRelations,
}

impl EntityCapture {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            unique_id: None,
            name: None,
            classification: None,
            location: None,
            attributes: AttributeMap::new(),
            relations: EntityRelations::default(),
            unread_relations: UnreadRelations::default(),
        }
    }

    pub fn category(&self) -> Option<&str> {
        self.classification.as_ref().map(|c| c.category.as_str())
    }

    pub fn anchor(&self) -> Option<Point3> {
        self.location.as_ref().map(Location::anchor)
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialKind {
    Level,
    Room,
    Space,
    Zone,
}

impl fmt::Display for SpatialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpatialKind::Level => "Level",
            SpatialKind::Room => "Room",
            SpatialKind::Space => "Space",
            SpatialKind::Zone => "Zone",
        };
        f.write_str(s)
    }
}

/// A level, room or other spatial container exposed by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialUnit {
    pub id: EntityId,
    pub kind: SpatialKind,
    pub name: String,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub level_name: Option<String>,
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub elevation: Option<f64>,
}

impl SpatialUnit {
    pub fn level(id: EntityId, name: impl Into<String>, elevation: f64) -> Self {
        Self {
            id,
            kind: SpatialKind::Level,
            name: name.into(),
            number: None,
            level_name: None,
            area: None,
            volume: None,
            elevation: Some(elevation),
        }
    }

    pub fn room(
        id: EntityId,
        name: impl Into<String>,
        number: impl Into<String>,
        level_name: Option<String>,
    ) -> Self {
        Self {
            id,
            kind: SpatialKind::Room,
            name: name.into(),
            number: Some(number.into()),
            level_name,
            area: None,
            volume: None,
            elevation: None,
        }
    }
}

/// One host read shared by the change log and the graph for a single batch.
#[derive(Debug, Clone)]
pub struct CapturedBatch {
    pub timestamp: DateTime<Utc>,
    pub added: Vec<EntityCapture>,
    pub modified: Vec<EntityCapture>,
    pub deleted: Vec<EntityId>,
}

impl CapturedBatch {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            added: Vec::new(),
            modified: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}
