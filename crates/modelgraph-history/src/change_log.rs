use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use modelgraph_core::{
    AttributeMap, AttributeValue, CapturedBatch, DocumentKey, EntityCapture, EntityId, Location,
    UNKNOWN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One immutable entry of a document's change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub entity_id: EntityId,
    pub unique_id: Option<String>,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
    pub document_key: DocumentKey,
    pub category: String,
    pub family: String,
    pub type_name: String,
    /// Present for created and modified entities only.
    pub state: Option<AttributeMap>,
}

impl ChangeRecord {
    pub fn from_capture(
        document_key: &DocumentKey,
        kind: ChangeKind,
        capture: &EntityCapture,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (category, family, type_name) = match &capture.classification {
            Some(c) => (c.category.clone(), c.family.clone(), c.type_name.clone()),
            None => (UNKNOWN.to_string(), UNKNOWN.to_string(), UNKNOWN.to_string()),
        };

        Self {
            id: Uuid::new_v4(),
            entity_id: capture.id,
            unique_id: capture.unique_id.clone(),
            kind,
            timestamp,
            document_key: document_key.clone(),
            category,
            family,
            type_name,
            state: Some(captured_state(capture)),
        }
    }

    pub fn deleted(document_key: &DocumentKey, entity_id: EntityId, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            unique_id: None,
            kind: ChangeKind::Deleted,
            timestamp,
            document_key: document_key.clone(),
            category: UNKNOWN.to_string(),
            family: UNKNOWN.to_string(),
            type_name: UNKNOWN.to_string(),
            state: None,
        }
    }
}

/// Flatten a capture into the scalar map stored on change records.
fn captured_state(capture: &EntityCapture) -> AttributeMap {
    let mut state = AttributeMap::new();

    if let Some(name) = &capture.name {
        state.insert("name".to_string(), AttributeValue::from(name.as_str()));
    }
    if let Some(category) = capture.category() {
        state.insert("category".to_string(), AttributeValue::from(category));
    }

    match capture.location {
        Some(Location::Point { point }) => {
            state.insert("location.x".to_string(), point.x.into());
            state.insert("location.y".to_string(), point.y.into());
            state.insert("location.z".to_string(), point.z.into());
        }
        Some(Location::Curve { start, end }) => {
            state.insert("start.x".to_string(), start.x.into());
            state.insert("start.y".to_string(), start.y.into());
            state.insert("start.z".to_string(), start.z.into());
            state.insert("end.x".to_string(), end.x.into());
            state.insert("end.y".to_string(), end.y.into());
            state.insert("end.z".to_string(), end.z.into());
        }
        None => {}
    }

    for (name, value) in &capture.attributes {
        state.insert(format!("param.{}", name), value.clone());
    }

    state
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl ChangeSummary {
    pub fn total(&self) -> usize {
        self.created + self.modified + self.deleted
    }
}

/// Append-only change history of one document.
///
/// Records are appended in batch order and every record of a batch shares
/// the batch timestamp, so append order is chronological.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    document_key: DocumentKey,
    records: Vec<ChangeRecord>,
}

impl ChangeLog {
    pub fn new(document_key: DocumentKey) -> Self {
        Self {
            document_key,
            records: Vec::new(),
        }
    }

    pub fn document_key(&self) -> &DocumentKey {
        &self.document_key
    }

    pub fn append(&mut self, record: ChangeRecord) {
        self.records.push(record);
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = ChangeRecord>) {
        self.records.extend(records);
    }

    /// Append one record per entity in the batch and return how many were
    /// written.
    pub fn record_batch(&mut self, batch: &CapturedBatch) -> usize {
        let before = self.records.len();
        let key = &self.document_key;

        self.records.extend(
            batch
                .added
                .iter()
                .map(|c| ChangeRecord::from_capture(key, ChangeKind::Created, c, batch.timestamp)),
        );
        self.records.extend(
            batch
                .modified
                .iter()
                .map(|c| ChangeRecord::from_capture(key, ChangeKind::Modified, c, batch.timestamp)),
        );
        self.records.extend(
            batch
                .deleted
                .iter()
                .map(|&id| ChangeRecord::deleted(key, id, batch.timestamp)),
        );

        let written = self.records.len() - before;
        debug!(document = %self.document_key, written, "Recorded change batch");
        written
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Records with `from <= timestamp <= to`, in append order.
    pub fn records_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = &ChangeRecord> {
        self.records
            .iter()
            .filter(move |r| r.timestamp >= from && r.timestamp <= to)
    }

    pub fn records_for(&self, entity_id: EntityId) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter().filter(move |r| r.entity_id == entity_id)
    }

    pub fn summary(&self) -> ChangeSummary {
        self.records
            .iter()
            .fold(ChangeSummary::default(), |mut acc, r| {
                match r.kind {
                    ChangeKind::Created => acc.created += 1,
                    ChangeKind::Modified => acc.modified += 1,
                    ChangeKind::Deleted => acc.deleted += 1,
                }
                acc
            })
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
