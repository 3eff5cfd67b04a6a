//! Read-only accessor contract for the host document model.
//!
//! Every read may fail for a single entity. The capture functions in this
//! module absorb those failures: a lenient capture keeps whatever fields
//! were readable, a strict capture drops the entity altogether.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{HostError, HostResult};
use crate::types::{
    AttributeMap, AttributeValue, CapturedBatch, Classification, EntityCapture, EntityId,
    EntityRelations, Location, SpatialUnit, UnreadRelations, UNKNOWN,
};

pub trait HostEntity: Send + Sync {
    fn id(&self) -> EntityId;

    fn unique_id(&self) -> HostResult<String>;

    fn name(&self) -> HostResult<String>;

    /// `Ok(None)` means the entity has no category at all.
    fn category(&self) -> HostResult<Option<String>>;

    fn family_name(&self) -> HostResult<Option<String>>;

    fn type_name(&self) -> HostResult<Option<String>>;

    fn location(&self) -> HostResult<Option<Location>>;

    fn attributes(&self) -> HostResult<AttributeMap>;

    fn level_id(&self) -> HostResult<Option<EntityId>> {
        Ok(None)
    }

    fn host_id(&self) -> HostResult<Option<EntityId>> {
        Ok(None)
    }

    fn room_id(&self) -> HostResult<Option<EntityId>> {
        Ok(None)
    }
}

pub trait HostDocument: Send + Sync {
    fn path(&self) -> Option<String>;

    fn title(&self) -> Option<String>;

    fn entities(&self) -> HostResult<Vec<Arc<dyn HostEntity>>>;

    fn entity(&self, id: EntityId) -> HostResult<Option<Arc<dyn HostEntity>>>;

    fn spatial_units(&self) -> HostResult<Vec<SpatialUnit>>;
}

fn or_warn<T>(entity: EntityId, field: &'static str, read: HostResult<T>) -> Option<T> {
    match read {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(entity = %entity, field, error = %e, "Partial capture: host read failed");
            None
        }
    }
}

fn relations_lenient(entity: &dyn HostEntity) -> (EntityRelations, UnreadRelations) {
    let id = entity.id();
    let level = or_warn(id, "level", entity.level_id());
    let host = or_warn(id, "host", entity.host_id());
    let room = or_warn(id, "room", entity.room_id());
    let unread = UnreadRelations {
        level: level.is_none(),
        host: host.is_none(),
        room: room.is_none(),
    };
    let relations = EntityRelations {
        level: level.flatten(),
        host: host.flatten(),
        room: room.flatten(),
    };
    (relations, unread)
}

/// Capture every field that can be read. A missing category leaves the
/// classification empty; a missing family or type falls back to "Unknown".
pub fn capture_entity(entity: &dyn HostEntity) -> EntityCapture {
    let id = entity.id();
    let classification = or_warn(id, "category", entity.category())
        .flatten()
        .map(|category| {
            let family = or_warn(id, "family", entity.family_name())
                .flatten()
                .unwrap_or_else(|| UNKNOWN.to_string());
            let type_name = or_warn(id, "type", entity.type_name())
                .flatten()
                .unwrap_or_else(|| UNKNOWN.to_string());
            Classification::new(category, family, type_name)
        });
    let (relations, unread_relations) = relations_lenient(entity);

    EntityCapture {
        id,
        unique_id: or_warn(id, "unique_id", entity.unique_id()),
        name: or_warn(id, "name", entity.name()),
        classification,
        location: or_warn(id, "location", entity.location()).flatten(),
        attributes: or_warn(id, "attributes", entity.attributes()).unwrap_or_default(),
        relations,
        unread_relations,
    }
}

/// Capture an entity or fail on the first unreadable field.
pub fn try_capture_entity(entity: &dyn HostEntity) -> HostResult<EntityCapture> {
    let classification = match entity.category()? {
        Some(category) => Some(Classification::new(
            category,
            entity.family_name()?.unwrap_or_else(|| UNKNOWN.to_string()),
            entity.type_name()?.unwrap_or_else(|| UNKNOWN.to_string()),
        )),
        None => None,
    };

    let capture = EntityCapture {
        id: entity.id(),
        unique_id: Some(entity.unique_id()?),
        name: Some(entity.name()?),
        classification,
        location: entity.location()?,
        attributes: entity.attributes()?,
        relations: EntityRelations {
            level: entity.level_id()?,
            host: entity.host_id()?,
            room: entity.room_id()?,
        },
        unread_relations: UnreadRelations::default(),
    };
    ensure_finite(&capture)?;
    Ok(capture)
}

/// Checkpoint JSON has no encoding for NaN or infinity.
fn ensure_finite(capture: &EntityCapture) -> HostResult<()> {
    if capture.location.as_ref().is_some_and(|l| !l.is_finite()) {
        return Err(HostError::new(format!(
            "non-finite value in location of entity {}",
            capture.id
        )));
    }
    for (name, value) in &capture.attributes {
        if let AttributeValue::Double(d) = value {
            if !d.is_finite() {
                return Err(HostError::new(format!(
                    "non-finite value in attribute {} of entity {}",
                    name, capture.id
                )));
            }
        }
    }
    Ok(())
}

/// Full-document pass used by checkpoints. Entities that fail to capture
/// are omitted. Fails only if the document itself cannot be enumerated.
pub fn capture_document(document: &dyn HostDocument) -> HostResult<Vec<EntityCapture>> {
    let entities = document.entities()?;
    let total = entities.len();
    let mut captures = Vec::with_capacity(total);

    for entity in entities {
        match try_capture_entity(entity.as_ref()) {
            Ok(capture) => captures.push(capture),
            Err(e) => {
                warn!(entity = %entity.id(), error = %e, "Entity omitted from capture");
            }
        }
    }

    captures.sort_by_key(|c| c.id);
    debug!(captured = captures.len(), total, "Captured document entities");
    Ok(captures)
}

fn capture_ids(document: &dyn HostDocument, ids: &[EntityId], into: &mut Vec<EntityCapture>) {
    for &id in ids {
        match document.entity(id) {
            Ok(Some(entity)) => into.push(capture_entity(entity.as_ref())),
            Ok(None) => debug!(entity = %id, "Entity no longer present in host, skipping"),
            Err(e) => warn!(entity = %id, error = %e, "Failed to fetch entity from host"),
        }
    }
}

/// Read the host once for a batch of notifications.
///
/// Added and modified ids are fetched and captured leniently; ids the host
/// can no longer resolve are skipped. Deleted ids are carried through as-is.
pub fn capture_batch(
    document: &dyn HostDocument,
    timestamp: DateTime<Utc>,
    added: &[EntityId],
    modified: &[EntityId],
    deleted: &[EntityId],
) -> CapturedBatch {
    let mut batch = CapturedBatch::new(timestamp);
    capture_ids(document, added, &mut batch.added);
    capture_ids(document, modified, &mut batch.modified);
    batch.deleted = deleted.to_vec();
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EntityField, InMemoryDocument, InMemoryEntity};
    use crate::types::{AttributeValue, Point3};

    fn wall(id: i64) -> InMemoryEntity {
        InMemoryEntity::new(
            EntityCapture::new(EntityId(id))
                .with_name(format!("Wall {}", id))
                .with_classification(Classification::new("Walls", "Basic Wall", "Generic 200"))
                .with_location(Location::curve(
                    Point3::new(0.0, 0.0, 0.0),
                    Point3::new(10.0, 0.0, 0.0),
                ))
                .with_attribute("Length", AttributeValue::Double(10.0)),
        )
    }

    #[test]
    fn lenient_capture_keeps_readable_fields() {
        let entity = wall(1)
            .failing(EntityField::Location)
            .failing(EntityField::Family);
        let capture = capture_entity(&entity);

        assert!(capture.location.is_none());
        let class = capture.classification.unwrap();
        assert_eq!(class.category, "Walls");
        assert_eq!(class.family, UNKNOWN);
        assert_eq!(class.type_name, "Generic 200");
        assert_eq!(capture.attributes.len(), 1);
    }

    #[test]
    fn lenient_capture_marks_unread_relations() {
        let mut hosted = wall(1);
        hosted.state_mut().relations.level = Some(EntityId(100));
        assert!(!capture_entity(&hosted).unread_relations.any());

        let capture = capture_entity(&hosted.failing(EntityField::Relations));
        assert!(capture.relations.level.is_none());
        assert!(capture.unread_relations.level);
        assert!(capture.unread_relations.host);
    }

    #[test]
    fn failed_category_leaves_classification_empty() {
        let entity = wall(1).failing(EntityField::Category);
        assert!(capture_entity(&entity).classification.is_none());
    }

    #[test]
    fn document_capture_omits_failing_entities() {
        let doc = InMemoryDocument::new(Some("a.rvt"), Some("A"));
        doc.insert(wall(1));
        doc.insert(wall(2).failing(EntityField::Attributes));
        doc.insert(wall(3));

        let captures = capture_document(&doc).unwrap();
        let ids: Vec<_> = captures.iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn strict_capture_rejects_non_finite_numbers() {
        let nan_attr = InMemoryEntity::new(
            EntityCapture::new(EntityId(1)).with_attribute("Length", AttributeValue::Double(f64::NAN)),
        );
        let err = try_capture_entity(&nan_attr).unwrap_err();
        assert!(err.to_string().contains("Length"));

        let open_curve = InMemoryEntity::new(EntityCapture::new(EntityId(2)).with_location(
            Location::curve(Point3::ORIGIN, Point3::new(f64::INFINITY, 0.0, 0.0)),
        ));
        assert!(try_capture_entity(&open_curve).is_err());

        // Lenient capture still records the entity for the change log.
        assert!(capture_entity(&nan_attr).attributes.contains_key("Length"));
    }

    #[test]
    fn document_capture_omits_non_finite_entities() {
        let doc = InMemoryDocument::new(Some("a.rvt"), Some("A"));
        doc.insert(wall(1));
        doc.insert(InMemoryEntity::new(
            EntityCapture::new(EntityId(2)).with_location(Location::point(f64::NAN, 0.0, 0.0)),
        ));

        let ids: Vec<_> = capture_document(&doc).unwrap().iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn batch_capture_skips_unresolvable_ids() {
        let doc = InMemoryDocument::new(Some("a.rvt"), None);
        doc.insert(wall(1));

        let batch = capture_batch(
            &doc,
            Utc::now(),
            &[EntityId(1), EntityId(99)],
            &[],
            &[EntityId(5)],
        );
        assert_eq!(batch.added.len(), 1);
        assert_eq!(batch.deleted, vec![EntityId(5)]);
    }
}
