//! Explicitly constructed tracking context.
//!
//! A [`ModelTracker`] owns the document registry, the snapshot engine, the
//! sync dispatcher and the notification bus. Host integrations construct one
//! and pass it to whatever delivers document events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use modelgraph_core::{
    capture_batch, capture_entity, CapturedBatch, DocumentKey, EntitiesChanged, EntityCapture,
    EntityId, EventBus, GraphUpdated, HostDocument, ModelGraphConfig, Result, TrackerEvent,
};
use modelgraph_graph::{
    CategoryFilter, GraphSink, GraphStatistics, GraphUpdate, OntologyGraph, SyncDispatcher,
};
use modelgraph_history::{
    ChangeRecord, ChangeSummary, CheckpointDiff, CheckpointInfo, SnapshotEngine,
    SnapshotSettings, DOCUMENT_CLOSE, MANUAL_SAVE,
};

use crate::registry::{DocumentRegistry, DocumentTracking};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub records_appended: usize,
    pub graph: GraphUpdate,
}

#[derive(Clone)]
pub struct ModelTracker {
    config: Arc<ModelGraphConfig>,
    registry: DocumentRegistry,
    snapshots: SnapshotEngine,
    sync: SyncDispatcher,
    events: EventBus,
}

impl ModelTracker {
    /// Tracker without an external graph store.
    pub fn new(config: ModelGraphConfig) -> Self {
        Self::with_dispatcher(config, SyncDispatcher::disabled())
    }

    /// Tracker pushing graph mutations to `sink`. Must be called inside a
    /// tokio runtime unless sync is disabled in the configuration.
    pub fn with_sink(config: ModelGraphConfig, sink: Arc<dyn GraphSink>) -> Self {
        let dispatcher = if config.graph.sync_enabled {
            SyncDispatcher::spawn(sink, config.graph.sync_queue_warn_threshold)
        } else {
            info!("Graph sync disabled by configuration");
            SyncDispatcher::disabled()
        };
        Self::with_dispatcher(config, dispatcher)
    }

    fn with_dispatcher(config: ModelGraphConfig, sync: SyncDispatcher) -> Self {
        let events = EventBus::new(config.events.channel_capacity);
        let snapshots = SnapshotEngine::new(SnapshotSettings::from(&config.history), events.clone());
        Self {
            config: Arc::new(config),
            registry: DocumentRegistry::new(),
            snapshots,
            sync,
            events,
        }
    }

    pub fn config(&self) -> &ModelGraphConfig {
        &self.config
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn snapshots(&self) -> &SnapshotEngine {
        &self.snapshots
    }

    pub fn sync(&self) -> &SyncDispatcher {
        &self.sync
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Start tracking a document: build its graph and initialize its
    /// checkpoints. Returns the key to use for every later call.
    pub async fn start(&self, document: Arc<dyn HostDocument>) -> Result<DocumentKey> {
        self.start_inner(document, true).await
    }

    /// Start tracking without a checkpoint directory or timer.
    pub async fn start_without_checkpoints(
        &self,
        document: Arc<dyn HostDocument>,
    ) -> Result<DocumentKey> {
        self.start_inner(document, false).await
    }

    async fn start_inner(
        &self,
        document: Arc<dyn HostDocument>,
        checkpoints: bool,
    ) -> Result<DocumentKey> {
        let key = DocumentKey::derive(document.path().as_deref(), document.title().as_deref());
        let filter = CategoryFilter::from(&self.config.graph);

        let Some(tracking) =
            self.registry
                .start(key.clone(), document.clone(), filter, self.sync.is_enabled())
        else {
            return Ok(key);
        };

        let update = {
            let tracking = tracking.clone();
            tokio::task::spawn_blocking(move || {
                let _guard = tracking.lock_batches();
                rebuild_tracking(&tracking)
            })
            .await
            .map_err(|e| {
                modelgraph_core::ModelGraphError::InvalidOperation(format!(
                    "graph build task failed: {}",
                    e
                ))
            })?
        };

        // stop() may have run while the graph was being built.
        if !self.is_current(&key, &tracking) {
            warn!(document = %key, "Document stopped during start, skipping checkpoints");
            return Ok(key);
        }
        self.after_graph_change(&tracking, update);

        if checkpoints {
            if let Err(e) = self.snapshots.initialize_document(key.clone(), document).await {
                error!(document = %key, error = %e, "Session start checkpoint failed");
            }
            if !self.is_current(&key, &tracking)
                && self.snapshots.is_tracking(&key)
                && self.snapshots.stop_document(&key)
            {
                warn!(document = %key, "Document stopped during start, timer cancelled");
                return Ok(key);
            }
        }

        info!(
            target: "modelgraph::tracker",
            document = %key,
            nodes = update.nodes_added,
            relationships = update.relationships_touched,
            "Tracking started"
        );
        Ok(key)
    }

    fn is_current(&self, key: &DocumentKey, tracking: &Arc<DocumentTracking>) -> bool {
        self.registry
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(&current, tracking))
    }

    /// Stop tracking. The timer is cancelled before this returns; the change
    /// log and graph are discarded.
    pub fn stop(&self, key: &DocumentKey) -> bool {
        let had_snapshots = self.snapshots.is_tracking(key) && self.snapshots.stop_document(key);
        let had_tracking = self.registry.stop(key).is_some();
        if had_tracking || had_snapshots {
            info!(target: "modelgraph::tracker", document = %key, "Tracking stopped");
        }
        had_tracking
    }

    /// Handle one notification batch. The host is read once; the change log
    /// and the graph both consume that read.
    pub fn process_batch(
        &self,
        key: &DocumentKey,
        added: &[EntityId],
        modified: &[EntityId],
        deleted: &[EntityId],
    ) -> Option<BatchOutcome> {
        let tracking = self.tracking(key)?;
        let _guard = tracking.lock_batches();
        let batch = capture_batch(
            tracking.document.as_ref(),
            Utc::now(),
            added,
            modified,
            deleted,
        );
        Some(self.apply_locked(&tracking, &batch))
    }

    /// Apply a batch that was captured elsewhere.
    pub fn apply_captured(&self, key: &DocumentKey, batch: &CapturedBatch) -> Option<BatchOutcome> {
        let tracking = self.tracking(key)?;
        let _guard = tracking.lock_batches();
        Some(self.apply_locked(&tracking, batch))
    }

    fn apply_locked(&self, tracking: &DocumentTracking, batch: &CapturedBatch) -> BatchOutcome {
        let records_appended = tracking.change_log.lock().record_batch(batch);
        let (update, ops) = {
            let mut graph = tracking.graph.write();
            let update = graph.apply_batch(batch);
            (update, graph.drain_sync_ops())
        };
        self.sync.submit_all(ops);

        self.events
            .publish(TrackerEvent::EntitiesChanged(EntitiesChanged {
                document: tracking.key.clone(),
                added: batch.added.iter().map(|c| c.id).collect(),
                modified: batch.modified.iter().map(|c| c.id).collect(),
                deleted: batch.deleted.clone(),
                timestamp: batch.timestamp,
            }));
        self.publish_graph_updated(&tracking.key, &update);

        debug!(
            target: "modelgraph::tracker",
            document = %tracking.key,
            records = records_appended,
            "Batch processed"
        );
        BatchOutcome {
            records_appended,
            graph: update,
        }
    }

    fn tracking(&self, key: &DocumentKey) -> Option<Arc<DocumentTracking>> {
        let tracking = self.registry.get(key);
        if tracking.is_none() {
            warn!(document = %key, "Document not tracked, ignoring");
        }
        tracking
    }

    fn publish_graph_updated(&self, key: &DocumentKey, update: &GraphUpdate) {
        self.events.publish(TrackerEvent::GraphUpdated(GraphUpdated {
            document: key.clone(),
            nodes_added: update.nodes_added,
            nodes_modified: update.nodes_modified,
            nodes_deleted: update.nodes_deleted,
            relationships_touched: update.relationships_touched,
            timestamp: update.timestamp,
        }));
    }

    fn after_graph_change(&self, tracking: &DocumentTracking, update: GraphUpdate) {
        let ops = tracking.graph.write().drain_sync_ops();
        self.sync.submit_all(ops);
        self.publish_graph_updated(&tracking.key, &update);
    }

    pub fn changes(&self, key: &DocumentKey) -> Vec<ChangeRecord> {
        self.tracking(key)
            .map(|t| t.change_log.lock().records().to_vec())
            .unwrap_or_default()
    }

    /// Records with `from <= timestamp <= to`, in append order.
    pub fn changes_between(
        &self,
        key: &DocumentKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<ChangeRecord> {
        self.tracking(key)
            .map(|t| t.change_log.lock().records_between(from, to).cloned().collect())
            .unwrap_or_default()
    }

    pub fn change_summary(&self, key: &DocumentKey) -> Option<ChangeSummary> {
        self.tracking(key).map(|t| t.change_log.lock().summary())
    }

    pub fn clear_history(&self, key: &DocumentKey) -> bool {
        match self.tracking(key) {
            Some(tracking) => {
                tracking.change_log.lock().clear();
                info!(target: "modelgraph::tracker", document = %key, "Change history cleared");
                true
            }
            None => false,
        }
    }

    /// Full rescan of the host and rebuild of the document's graph.
    pub fn rebuild_graph(&self, key: &DocumentKey) -> Option<GraphUpdate> {
        let tracking = self.tracking(key)?;
        let _guard = tracking.lock_batches();
        let update = rebuild_tracking(&tracking);
        self.after_graph_change(&tracking, update);
        Some(update)
    }

    pub fn with_graph<R>(&self, key: &DocumentKey, f: impl FnOnce(&OntologyGraph) -> R) -> Option<R> {
        self.tracking(key).map(|t| f(&t.graph.read()))
    }

    /// Mutate the graph directly, e.g. to attach task or cost nodes. The
    /// resulting changes are pushed to the graph store.
    pub fn update_graph<R>(
        &self,
        key: &DocumentKey,
        f: impl FnOnce(&mut OntologyGraph) -> R,
    ) -> Option<R> {
        let tracking = self.tracking(key)?;
        let _guard = tracking.lock_batches();
        let (result, ops) = {
            let mut graph = tracking.graph.write();
            let result = f(&mut graph);
            (result, graph.drain_sync_ops())
        };
        self.sync.submit_all(ops);
        Some(result)
    }

    pub fn graph_statistics(&self, key: &DocumentKey) -> Option<GraphStatistics> {
        self.with_graph(key, OntologyGraph::statistics)
    }

    pub async fn checkpoint(
        &self,
        key: &DocumentKey,
        description: &str,
    ) -> Result<Option<CheckpointInfo>> {
        self.snapshots.checkpoint(key, description).await
    }

    pub async fn on_document_saved(&self, key: &DocumentKey) -> Result<Option<CheckpointInfo>> {
        self.checkpoint(key, MANUAL_SAVE).await
    }

    /// Take a closing checkpoint, then stop tracking.
    pub async fn on_document_closing(&self, key: &DocumentKey) -> Result<Option<CheckpointInfo>> {
        let result = self.checkpoint(key, DOCUMENT_CLOSE).await;
        if let Err(e) = &result {
            error!(document = %key, error = %e, "Closing checkpoint failed");
        }
        self.stop(key);
        result
    }

    pub fn list_checkpoints(&self, key: &DocumentKey) -> Result<Vec<CheckpointInfo>> {
        self.snapshots.list_checkpoints(key)
    }

    pub fn diff_checkpoints(&self, older: &Path, newer: &Path) -> Result<CheckpointDiff> {
        self.snapshots.diff(older, newer)
    }

    /// Stop every document and drain the sync queue.
    pub async fn shutdown(&self) {
        for key in self.registry.keys() {
            self.stop(&key);
        }
        self.snapshots.shutdown();
        self.sync.shutdown().await;
    }
}

/// Rescan the host document leniently and rebuild the graph. A document
/// that cannot be enumerated leaves the graph empty.
fn rebuild_tracking(tracking: &DocumentTracking) -> GraphUpdate {
    let document = tracking.document.as_ref();
    let entities: Vec<EntityCapture> = match document.entities() {
        Ok(entities) => entities.iter().map(|e| capture_entity(e.as_ref())).collect(),
        Err(e) => {
            warn!(document = %tracking.key, error = %e, "Cannot enumerate entities for graph build");
            Vec::new()
        }
    };
    let spatial_units = document.spatial_units().unwrap_or_else(|e| {
        warn!(document = %tracking.key, error = %e, "Cannot read spatial units for graph build");
        Vec::new()
    });

    tracking.graph.write().rebuild(&entities, &spatial_units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgraph_core::memory::{EntityField, InMemoryDocument, InMemoryEntity};
    use modelgraph_core::{Classification, EntityRelations, Location, SpatialUnit};
    use modelgraph_graph::RelationType;
    use modelgraph_history::ChangeKind;

    fn wall(id: i64) -> InMemoryEntity {
        let mut capture = EntityCapture::new(EntityId(id))
            .with_name(format!("Wall {}", id))
            .with_classification(Classification::new("Walls", "Basic Wall", "Generic 200"))
            .with_location(Location::point(0.0, 0.0, 0.0));
        capture.relations.level = Some(EntityId(100));
        InMemoryEntity::new(capture)
    }

    fn door(id: i64, host: i64) -> InMemoryEntity {
        let mut capture = EntityCapture::new(EntityId(id))
            .with_name("Door")
            .with_classification(Classification::new("Doors", "Single", "900x2100"))
            .with_location(Location::point(2.0, 0.0, 0.0));
        capture.relations = EntityRelations {
            level: Some(EntityId(100)),
            host: Some(EntityId(host)),
            room: None,
        };
        InMemoryEntity::new(capture)
    }

    fn document() -> Arc<InMemoryDocument> {
        let doc = Arc::new(InMemoryDocument::new(Some("/models/house.rvt"), Some("House")));
        doc.add_spatial_unit(SpatialUnit::level(EntityId(100), "Level 1", 0.0));
        doc.insert(wall(10));
        doc
    }

    #[tokio::test]
    async fn start_builds_graph_from_document() {
        let tracker = ModelTracker::new(ModelGraphConfig::default());
        let key = tracker.start_without_checkpoints(document()).await.unwrap();

        assert_eq!(key.as_str(), "/models/house.rvt");
        let stats = tracker.graph_statistics(&key).unwrap();
        assert_eq!(stats.element_nodes, 1);
        assert_eq!(stats.spatial_nodes, 1);
        assert_eq!(stats.total_relationships, 1);
        assert!(tracker.changes(&key).is_empty());
    }

    #[tokio::test]
    async fn door_is_hosted_once_across_repeated_modifications() {
        let tracker = ModelTracker::new(ModelGraphConfig::default());
        let doc = document();
        let key = tracker.start_without_checkpoints(doc.clone()).await.unwrap();

        doc.insert(door(1, 10));
        let outcome = tracker.process_batch(&key, &[EntityId(1)], &[], &[]).unwrap();
        assert_eq!(outcome.records_appended, 1);
        assert_eq!(outcome.graph.nodes_added, 1);
        assert_eq!(outcome.graph.relationships_touched, 2);

        doc.update(EntityId(1), |d| d.state_mut().name = Some("Door A".into()));
        tracker.process_batch(&key, &[], &[EntityId(1)], &[]).unwrap();
        tracker.process_batch(&key, &[], &[EntityId(1)], &[]).unwrap();

        let hosted = tracker
            .with_graph(&key, |graph| {
                graph
                    .relationships()
                    .filter(|r| r.relation_type == RelationType::HostedBy)
                    .count()
            })
            .unwrap();
        assert_eq!(hosted, 1);

        let kinds: Vec<ChangeKind> = tracker.changes(&key).iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Created, ChangeKind::Modified, ChangeKind::Modified]
        );
    }

    #[tokio::test]
    async fn deleting_host_cascades_edges() {
        let tracker = ModelTracker::new(ModelGraphConfig::default());
        let doc = document();
        let key = tracker.start_without_checkpoints(doc.clone()).await.unwrap();
        doc.insert(door(1, 10));
        tracker.process_batch(&key, &[EntityId(1)], &[], &[]);

        doc.remove(EntityId(10));
        let outcome = tracker.process_batch(&key, &[], &[], &[EntityId(10)]).unwrap();
        assert_eq!(outcome.graph.nodes_deleted, 1);
        assert_eq!(outcome.graph.relationships_touched, 2);

        let last = tracker.changes(&key).pop().unwrap();
        assert_eq!(last.kind, ChangeKind::Deleted);
        assert!(last.state.is_none());
    }

    #[tokio::test]
    async fn untracked_documents_are_ignored() {
        let tracker = ModelTracker::new(ModelGraphConfig::default());
        let key = DocumentKey::new("nowhere.rvt");

        assert!(tracker.process_batch(&key, &[EntityId(1)], &[], &[]).is_none());
        assert!(tracker.changes(&key).is_empty());
        assert!(tracker.graph_statistics(&key).is_none());
        assert!(!tracker.clear_history(&key));
        assert!(!tracker.stop(&key));
    }

    #[tokio::test]
    async fn restart_begins_with_empty_state() {
        let tracker = ModelTracker::new(ModelGraphConfig::default());
        let doc = document();
        let key = tracker.start_without_checkpoints(doc.clone()).await.unwrap();
        doc.insert(door(1, 10));
        tracker.process_batch(&key, &[EntityId(1)], &[], &[]);
        assert_eq!(tracker.changes(&key).len(), 1);

        assert!(tracker.stop(&key));
        let again = tracker.start_without_checkpoints(doc).await.unwrap();
        assert_eq!(again, key);
        assert!(tracker.changes(&key).is_empty());
        assert_eq!(tracker.graph_statistics(&key).unwrap().element_nodes, 2);
    }

    #[tokio::test]
    async fn partial_reads_still_record_changes() {
        let tracker = ModelTracker::new(ModelGraphConfig::default());
        let doc = document();
        let key = tracker.start_without_checkpoints(doc.clone()).await.unwrap();

        doc.insert(door(2, 10).failing(EntityField::Family).failing(EntityField::Relations));
        tracker.process_batch(&key, &[EntityId(2)], &[], &[]);

        let record = &tracker.changes(&key)[0];
        assert_eq!(record.family, modelgraph_core::UNKNOWN);
        assert_eq!(record.category, "Doors");
        let node_edges = tracker
            .with_graph(&key, |graph| {
                let node = graph.node_by_entity(EntityId(2)).unwrap().id;
                graph.outgoing(node).len()
            })
            .unwrap();
        assert_eq!(node_edges, 0);
    }

    #[tokio::test]
    async fn failed_relation_read_keeps_inferred_edges() {
        let tracker = ModelTracker::new(ModelGraphConfig::default());
        let doc = document();
        let key = tracker.start_without_checkpoints(doc.clone()).await.unwrap();
        doc.insert(door(1, 10));
        tracker.process_batch(&key, &[EntityId(1)], &[], &[]);

        doc.insert(door(1, 10).failing(EntityField::Relations));
        let outcome = tracker.process_batch(&key, &[], &[EntityId(1)], &[]).unwrap();
        assert_eq!(outcome.graph.relationships_touched, 0);

        let edges = tracker
            .with_graph(&key, |graph| {
                let node = graph.node_by_entity(EntityId(1)).unwrap().id;
                graph.outgoing(node).len()
            })
            .unwrap();
        assert_eq!(edges, 2);
    }

    #[tokio::test]
    async fn clear_history_keeps_graph() {
        let tracker = ModelTracker::new(ModelGraphConfig::default());
        let doc = document();
        let key = tracker.start_without_checkpoints(doc.clone()).await.unwrap();
        doc.insert(door(1, 10));
        tracker.process_batch(&key, &[EntityId(1)], &[], &[]);

        assert!(tracker.clear_history(&key));
        assert!(tracker.changes(&key).is_empty());
        assert_eq!(tracker.graph_statistics(&key).unwrap().element_nodes, 2);
        assert_eq!(tracker.change_summary(&key).unwrap().total(), 0);
    }
}
