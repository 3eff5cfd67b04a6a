use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{DocumentKey, EntityId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitiesChanged {
    pub document: DocumentKey,
    pub added: Vec<EntityId>,
    pub modified: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointCreated {
    pub document: DocumentKey,
    pub path: PathBuf,
    pub description: String,
    pub entity_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphUpdated {
    pub document: DocumentKey,
    pub nodes_added: usize,
    pub nodes_modified: usize,
    pub nodes_deleted: usize,
    pub relationships_touched: usize,
    pub timestamp: DateTime<Utc>,
}

/// Notifications published to UI and other collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    EntitiesChanged(EntitiesChanged),
    CheckpointCreated(CheckpointCreated),
    GraphUpdated(GraphUpdated),
}

impl TrackerEvent {
    pub fn document(&self) -> &DocumentKey {
        match self {
            TrackerEvent::EntitiesChanged(e) => &e.document,
            TrackerEvent::CheckpointCreated(e) => &e.document,
            TrackerEvent::GraphUpdated(e) => &e.document,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TrackerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: TrackerEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("No subscribers for tracker event");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
