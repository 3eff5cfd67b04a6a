//! In-memory host document used by tests and the CLI demo paths.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{HostError, HostResult};
use crate::host::{HostDocument, HostEntity};
use crate::types::{AttributeMap, EntityCapture, EntityId, Location, SpatialUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityField {
    UniqueId,
    Name,
    Category,
    Family,
    Type,
    Location,
    Attributes,
    Relations,
}

/// An entity whose state is a plain [`EntityCapture`]. Individual fields can
/// be made to fail to simulate host read errors.
#[derive(Debug, Clone)]
pub struct InMemoryEntity {
    state: EntityCapture,
    failing: HashSet<EntityField>,
}

impl InMemoryEntity {
    pub fn new(state: EntityCapture) -> Self {
        Self {
            state,
            failing: HashSet::new(),
        }
    }

    pub fn failing(mut self, field: EntityField) -> Self {
        self.failing.insert(field);
        self
    }

    pub fn state(&self) -> &EntityCapture {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EntityCapture {
        &mut self.state
    }

    fn read<T>(&self, field: EntityField, value: impl FnOnce() -> T) -> HostResult<T> {
        if self.failing.contains(&field) {
            Err(HostError::new(format!(
                "{:?} unavailable on entity {}",
                field, self.state.id
            )))
        } else {
            Ok(value())
        }
    }
}

impl HostEntity for InMemoryEntity {
    fn id(&self) -> EntityId {
        self.state.id
    }

    fn unique_id(&self) -> HostResult<String> {
        self.read(EntityField::UniqueId, || {
            self.state
                .unique_id
                .clone()
                .unwrap_or_else(|| format!("uid-{}", self.state.id))
        })
    }

    fn name(&self) -> HostResult<String> {
        self.read(EntityField::Name, || self.state.name.clone().unwrap_or_default())
    }

    fn category(&self) -> HostResult<Option<String>> {
        self.read(EntityField::Category, || {
            self.state.classification.as_ref().map(|c| c.category.clone())
        })
    }

    fn family_name(&self) -> HostResult<Option<String>> {
        self.read(EntityField::Family, || {
            self.state.classification.as_ref().map(|c| c.family.clone())
        })
    }

    fn type_name(&self) -> HostResult<Option<String>> {
        self.read(EntityField::Type, || {
            self.state
                .classification
                .as_ref()
                .map(|c| c.type_name.clone())
        })
    }

    fn location(&self) -> HostResult<Option<Location>> {
        self.read(EntityField::Location, || self.state.location)
    }

    fn attributes(&self) -> HostResult<AttributeMap> {
        self.read(EntityField::Attributes, || self.state.attributes.clone())
    }

    fn level_id(&self) -> HostResult<Option<EntityId>> {
        self.read(EntityField::Relations, || self.state.relations.level)
    }

    fn host_id(&self) -> HostResult<Option<EntityId>> {
        self.read(EntityField::Relations, || self.state.relations.host)
    }

    fn room_id(&self) -> HostResult<Option<EntityId>> {
        self.read(EntityField::Relations, || self.state.relations.room)
    }
}

#[derive(Default)]
pub struct InMemoryDocument {
    path: Option<String>,
    title: Option<String>,
    entities: RwLock<BTreeMap<EntityId, Arc<InMemoryEntity>>>,
    spatial_units: RwLock<Vec<SpatialUnit>>,
    unavailable: AtomicBool,
}

impl InMemoryDocument {
    pub fn new(path: Option<&str>, title: Option<&str>) -> Self {
        Self {
            path: path.map(str::to_string),
            title: title.map(str::to_string),
            ..Default::default()
        }
    }

    /// Insert or replace an entity.
    pub fn insert(&self, entity: InMemoryEntity) {
        self.entities
            .write()
            .insert(entity.state.id, Arc::new(entity));
    }

    pub fn remove(&self, id: EntityId) -> bool {
        self.entities.write().remove(&id).is_some()
    }

    /// Apply `f` to a copy of the entity and store the result.
    pub fn update(&self, id: EntityId, f: impl FnOnce(&mut InMemoryEntity)) -> bool {
        let mut entities = self.entities.write();
        match entities.get(&id) {
            Some(existing) => {
                let mut next = existing.as_ref().clone();
                f(&mut next);
                entities.insert(id, Arc::new(next));
                true
            }
            None => false,
        }
    }

    pub fn add_spatial_unit(&self, unit: SpatialUnit) {
        self.spatial_units.write().push(unit);
    }

    /// Make whole-document reads fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    fn check_available(&self) -> HostResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(HostError::new("document unavailable"))
        } else {
            Ok(())
        }
    }
}

impl HostDocument for InMemoryDocument {
    fn path(&self) -> Option<String> {
        self.path.clone()
    }

    fn title(&self) -> Option<String> {
        self.title.clone()
    }

    fn entities(&self) -> HostResult<Vec<Arc<dyn HostEntity>>> {
        self.check_available()?;
        Ok(self
            .entities
            .read()
            .values()
            .map(|e| e.clone() as Arc<dyn HostEntity>)
            .collect())
    }

    fn entity(&self, id: EntityId) -> HostResult<Option<Arc<dyn HostEntity>>> {
        self.check_available()?;
        Ok(self
            .entities
            .read()
            .get(&id)
            .map(|e| e.clone() as Arc<dyn HostEntity>))
    }

    fn spatial_units(&self) -> HostResult<Vec<SpatialUnit>> {
        self.check_available()?;
        Ok(self.spatial_units.read().clone())
    }
}
