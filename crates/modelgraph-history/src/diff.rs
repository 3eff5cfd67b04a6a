use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

use modelgraph_core::{EntityCapture, EntityId, EqualityMode, HistoryConfig, Point3};

use crate::checkpoint::Checkpoint;

/// Decides whether two captures of the same entity count as unchanged.
///
/// The shallow mode compares classification exactly, the anchor point per
/// axis within `tolerance`, and only the number of attributes. Two captures
/// with the same attribute count but different values are equal under it.
/// A missing anchor compares as the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityComparator {
    pub mode: EqualityMode,
    pub tolerance: f64,
}

impl Default for EntityComparator {
    fn default() -> Self {
        Self {
            mode: EqualityMode::Shallow,
            tolerance: 0.001,
        }
    }
}

impl From<&HistoryConfig> for EntityComparator {
    fn from(config: &HistoryConfig) -> Self {
        Self {
            mode: config.equality,
            tolerance: config.coordinate_tolerance,
        }
    }
}

impl EntityComparator {
    pub fn deep(tolerance: f64) -> Self {
        Self {
            mode: EqualityMode::Deep,
            tolerance,
        }
    }

    pub fn equal(&self, a: &EntityCapture, b: &EntityCapture) -> bool {
        let shallow = a.classification == b.classification
            && a.anchor()
                .unwrap_or(Point3::ORIGIN)
                .approx_eq(&b.anchor().unwrap_or(Point3::ORIGIN), self.tolerance)
            && a.attributes.len() == b.attributes.len();

        match self.mode {
            EqualityMode::Shallow => shallow,
            EqualityMode::Deep => {
                shallow
                    && a.name == b.name
                    && a.attributes == b.attributes
                    && a.relations == b.relations
                    && self.locations_equal(a, b)
            }
        }
    }

    fn locations_equal(&self, a: &EntityCapture, b: &EntityCapture) -> bool {
        use modelgraph_core::Location;
        match (&a.location, &b.location) {
            (None, None) => true,
            (Some(Location::Point { point: p }), Some(Location::Point { point: q })) => {
                p.approx_eq(q, self.tolerance)
            }
            (
                Some(Location::Curve { start: s1, end: e1 }),
                Some(Location::Curve { start: s2, end: e2 }),
            ) => s1.approx_eq(s2, self.tolerance) && e1.approx_eq(e2, self.tolerance),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityModification {
    pub entity_id: EntityId,
    pub before: EntityCapture,
    pub after: EntityCapture,
}

/// Structural difference between an older and a newer checkpoint. Each
/// list is ordered by entity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    pub older_timestamp: DateTime<Utc>,
    pub newer_timestamp: DateTime<Utc>,
    pub added: Vec<EntityCapture>,
    pub deleted: Vec<EntityCapture>,
    pub modified: Vec<EntityModification>,
}

impl CheckpointDiff {
    pub fn total_changes(&self) -> usize {
        self.added.len() + self.deleted.len() + self.modified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_changes() == 0
    }
}

fn build_entity_map(entities: &[EntityCapture]) -> HashMap<EntityId, &EntityCapture> {
    entities.iter().map(|e| (e.id, e)).collect()
}

pub fn diff_checkpoints(
    older: &Checkpoint,
    newer: &Checkpoint,
    comparator: &EntityComparator,
) -> CheckpointDiff {
    let start_time = Instant::now();
    let older_map = build_entity_map(&older.entities);
    let newer_map = build_entity_map(&newer.entities);

    let mut added = Vec::new();
    let mut deleted = Vec::new();
    let mut modified = Vec::new();

    for (id, before) in &older_map {
        match newer_map.get(id) {
            None => {
                debug!(entity = %id, "Entity deleted");
                deleted.push((*before).clone());
            }
            Some(after) => {
                if !comparator.equal(before, after) {
                    debug!(entity = %id, "Entity modified");
                    modified.push(EntityModification {
                        entity_id: *id,
                        before: (*before).clone(),
                        after: (*after).clone(),
                    });
                }
            }
        }
    }

    for (id, after) in &newer_map {
        if !older_map.contains_key(id) {
            debug!(entity = %id, "Entity added");
            added.push((*after).clone());
        }
    }

    added.sort_by_key(|e| e.id);
    deleted.sort_by_key(|e| e.id);
    modified.sort_by_key(|m| m.entity_id);

    let diff = CheckpointDiff {
        older_timestamp: older.timestamp,
        newer_timestamp: newer.timestamp,
        added,
        deleted,
        modified,
    };

    info!(
        added = diff.added.len(),
        deleted = diff.deleted.len(),
        modified = diff.modified.len(),
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "Checkpoint diff computed"
    );
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgraph_core::{AttributeValue, Classification, DocumentKey, Location};

    fn entity(id: i64, x: f64) -> EntityCapture {
        EntityCapture::new(EntityId(id))
            .with_classification(Classification::new("Furniture", "Desk", "1600"))
            .with_location(Location::point(x, 0.0, 0.0))
            .with_attribute("Mark", AttributeValue::from("A"))
    }

    fn checkpoint(entities: Vec<EntityCapture>) -> Checkpoint {
        Checkpoint::new(DocumentKey::new("doc"), "test", Utc::now(), entities)
    }

    #[test]
    fn identical_checkpoints_have_empty_diff() {
        let a = checkpoint(vec![entity(1, 0.0), entity(2, 5.0)]);
        let diff = diff_checkpoints(&a, &a, &EntityComparator::default());
        assert!(diff.is_empty());
    }

    #[test]
    fn one_new_entity_is_added() {
        let a = checkpoint(vec![entity(1, 0.0)]);
        let b = checkpoint(vec![entity(1, 0.0), entity(2, 1.0)]);
        let diff = diff_checkpoints(&a, &b, &EntityComparator::default());

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, EntityId(2));
        assert!(diff.deleted.is_empty());
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn removed_entity_is_deleted() {
        let a = checkpoint(vec![entity(1, 0.0), entity(2, 1.0)]);
        let b = checkpoint(vec![entity(2, 1.0)]);
        let diff = diff_checkpoints(&a, &b, &EntityComparator::default());
        assert_eq!(diff.deleted[0].id, EntityId(1));
        assert_eq!(diff.total_changes(), 1);
    }

    #[test]
    fn anchor_moves_below_tolerance_are_ignored() {
        let a = checkpoint(vec![entity(1, 0.0)]);
        let b = checkpoint(vec![entity(1, 0.0005)]);
        let diff = diff_checkpoints(&a, &b, &EntityComparator::default());
        assert!(diff.modified.is_empty());

        let c = checkpoint(vec![entity(1, 0.01)]);
        let diff = diff_checkpoints(&a, &c, &EntityComparator::default());
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].before.anchor().unwrap().x, 0.0);
        assert_eq!(diff.modified[0].after.anchor().unwrap().x, 0.01);
    }

    #[test]
    fn move_of_exactly_the_tolerance_is_unchanged() {
        let a = checkpoint(vec![entity(1, 0.0)]);
        let at_boundary = checkpoint(vec![entity(1, 0.001)]);
        let diff = diff_checkpoints(&a, &at_boundary, &EntityComparator::default());
        assert!(diff.modified.is_empty());

        let past_boundary = checkpoint(vec![entity(1, 0.0011)]);
        let diff = diff_checkpoints(&a, &past_boundary, &EntityComparator::default());
        assert_eq!(diff.modified.len(), 1);
    }

    #[test]
    fn shallow_mode_ignores_attribute_values() {
        let a = checkpoint(vec![entity(1, 0.0)]);
        let b = checkpoint(vec![
            entity(1, 0.0).with_attribute("Mark", AttributeValue::from("B"))
        ]);
        assert!(diff_checkpoints(&a, &b, &EntityComparator::default()).is_empty());

        let diff = diff_checkpoints(&a, &b, &EntityComparator::deep(0.001));
        assert_eq!(diff.modified.len(), 1);
    }

    #[test]
    fn attribute_count_change_is_modified() {
        let a = checkpoint(vec![entity(1, 0.0)]);
        let b = checkpoint(vec![
            entity(1, 0.0).with_attribute("Comments", AttributeValue::from("x"))
        ]);
        assert_eq!(
            diff_checkpoints(&a, &b, &EntityComparator::default())
                .modified
                .len(),
            1
        );
    }

    #[test]
    fn missing_anchor_compares_as_origin() {
        let mut unplaced = entity(1, 0.0);
        unplaced.location = None;
        let a = checkpoint(vec![unplaced]);
        let b = checkpoint(vec![entity(1, 0.0)]);
        assert!(diff_checkpoints(&a, &b, &EntityComparator::default()).is_empty());
    }

    #[test]
    fn classification_change_is_modified() {
        let a = checkpoint(vec![entity(1, 0.0)]);
        let mut retyped = entity(1, 0.0);
        retyped.classification = Some(Classification::new("Furniture", "Desk", "1800"));
        let b = checkpoint(vec![retyped]);
        assert_eq!(
            diff_checkpoints(&a, &b, &EntityComparator::default())
                .modified
                .len(),
            1
        );
    }
}
