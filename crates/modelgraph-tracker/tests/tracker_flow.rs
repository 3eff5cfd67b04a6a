use std::sync::Arc;
use std::time::Duration;

use modelgraph_core::memory::{InMemoryDocument, InMemoryEntity};
use modelgraph_core::{
    Classification, DocumentKey, EntityCapture, EntityId, HostDocument, HostEntity, HostResult,
    Location, ModelGraphConfig, SpatialUnit, TrackerEvent,
};
use modelgraph_graph::{MemoryGraphSink, RelationType};
use modelgraph_history::{
    document_dir_name, list_checkpoints, DOCUMENT_CLOSE, MANUAL_SAVE, SESSION_START,
};
use modelgraph_tracker::ModelTracker;

fn chair(id: i64, x: f64) -> InMemoryEntity {
    let mut capture = EntityCapture::new(EntityId(id))
        .with_name(format!("Chair {}", id))
        .with_classification(Classification::new("Furniture", "Chair", "Task"))
        .with_location(Location::point(x, 0.0, 0.0));
    capture.relations.level = Some(EntityId(100));
    InMemoryEntity::new(capture)
}

fn office(path: &str) -> Arc<InMemoryDocument> {
    let doc = Arc::new(InMemoryDocument::new(Some(path), Some("Office")));
    doc.add_spatial_unit(SpatialUnit::level(EntityId(100), "Level 1", 0.0));
    doc.insert(chair(1, 0.0));
    doc.insert(chair(2, 1.0));
    doc
}

/// Host whose full scan stalls after reading, like a large model.
struct SlowDocument {
    inner: Arc<InMemoryDocument>,
    scan_delay: Duration,
}

impl HostDocument for SlowDocument {
    fn path(&self) -> Option<String> {
        self.inner.path()
    }

    fn title(&self) -> Option<String> {
        self.inner.title()
    }

    fn entities(&self) -> HostResult<Vec<Arc<dyn HostEntity>>> {
        let entities = self.inner.entities();
        std::thread::sleep(self.scan_delay);
        entities
    }

    fn entity(&self, id: EntityId) -> HostResult<Option<Arc<dyn HostEntity>>> {
        self.inner.entity(id)
    }

    fn spatial_units(&self) -> HostResult<Vec<SpatialUnit>> {
        self.inner.spatial_units()
    }
}

fn slow_office(path: &str) -> (Arc<InMemoryDocument>, Arc<SlowDocument>) {
    let inner = office(path);
    let slow = Arc::new(SlowDocument {
        inner: inner.clone(),
        scan_delay: Duration::from_millis(400),
    });
    (inner, slow)
}

fn config(root: &std::path::Path) -> ModelGraphConfig {
    let mut config = ModelGraphConfig::default();
    config.history.checkpoint_root = root.to_path_buf();
    config
}

#[tokio::test]
async fn checkpoints_follow_document_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = ModelTracker::new(config(dir.path()));
    let doc = office("/models/office-a.rvt");

    let key = tracker.start(doc.clone()).await.unwrap();
    let storage = tracker.snapshots().storage_dir(&key).unwrap();
    let session = tracker.list_checkpoints(&key).unwrap();
    assert_eq!(session.len(), 1);
    assert_eq!(session[0].description, SESSION_START);
    assert_eq!(session[0].entity_count, 2);

    doc.update(EntityId(1), |c| {
        c.state_mut().location = Some(Location::point(5.0, 0.0, 0.0))
    });
    doc.insert(chair(3, 2.0));
    let saved = tracker.on_document_saved(&key).await.unwrap().unwrap();
    assert_eq!(saved.description, MANUAL_SAVE);

    let diff = tracker
        .diff_checkpoints(&session[0].path, &saved.path)
        .unwrap();
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.modified.len(), 1);
    assert_eq!(diff.modified[0].entity_id, EntityId(1));
    assert!(diff.deleted.is_empty());

    let closed = tracker.on_document_closing(&key).await.unwrap().unwrap();
    assert_eq!(closed.description, DOCUMENT_CLOSE);
    assert!(!tracker.registry().contains(&key));
    assert!(!tracker.snapshots().is_tracking(&key));

    let on_disk = list_checkpoints(&storage).unwrap();
    assert_eq!(on_disk.len(), 3);
    assert_eq!(on_disk[0].description, DOCUMENT_CLOSE);

    assert!(tracker.checkpoint(&key, "late").await.unwrap().is_none());
}

#[tokio::test]
async fn batches_publish_notifications() {
    let tracker = ModelTracker::new(ModelGraphConfig::default());
    let mut events = tracker.subscribe();
    let doc = office("/models/office-b.rvt");
    let key = tracker.start_without_checkpoints(doc.clone()).await.unwrap();

    match events.recv().await.unwrap() {
        TrackerEvent::GraphUpdated(update) => assert_eq!(update.nodes_added, 3),
        other => panic!("unexpected event {:?}", other),
    }

    doc.insert(chair(3, 2.0));
    tracker.process_batch(&key, &[EntityId(3)], &[], &[EntityId(2)]);

    match events.recv().await.unwrap() {
        TrackerEvent::EntitiesChanged(changed) => {
            assert_eq!(changed.document, key);
            assert_eq!(changed.added, vec![EntityId(3)]);
            assert_eq!(changed.deleted, vec![EntityId(2)]);
        }
        other => panic!("unexpected event {:?}", other),
    }
    match events.recv().await.unwrap() {
        TrackerEvent::GraphUpdated(update) => {
            assert_eq!(update.nodes_added, 1);
            assert_eq!(update.nodes_deleted, 1);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn documents_are_tracked_independently() {
    let tracker = ModelTracker::new(ModelGraphConfig::default());
    let first = office("/models/first.rvt");
    let second = office("/models/second.rvt");
    let first_key = tracker.start_without_checkpoints(first.clone()).await.unwrap();
    let second_key = tracker.start_without_checkpoints(second.clone()).await.unwrap();

    let mut handles = Vec::new();
    for (doc, key, base) in [(first, first_key.clone(), 10), (second, second_key.clone(), 1000)] {
        let tracker = tracker.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            for i in 0..50 {
                let id = base + i;
                doc.insert(chair(id, i as f64));
                tracker.process_batch(&key, &[EntityId(id)], &[], &[]);
            }
        }));
    }
    for result in futures::future::join_all(handles).await {
        result.unwrap();
    }

    for key in [&first_key, &second_key] {
        assert_eq!(tracker.changes(key).len(), 50);
        assert!(tracker.changes(key).iter().all(|r| &r.document_key == key));
        let stats = tracker.graph_statistics(key).unwrap();
        assert_eq!(stats.element_nodes, 52);
        assert_eq!(stats.relationships_by_type[&RelationType::LocatedIn], 52);
    }
    tracker.shutdown().await;
    assert!(tracker.registry().is_empty());
}

#[tokio::test]
async fn graph_store_mirrors_tracked_graph() {
    let sink = Arc::new(MemoryGraphSink::new());
    let tracker = ModelTracker::with_sink(ModelGraphConfig::default(), sink.clone());
    let doc = office("/models/office-c.rvt");
    let key = tracker.start_without_checkpoints(doc.clone()).await.unwrap();

    doc.insert(chair(3, 2.0));
    tracker.process_batch(&key, &[EntityId(3)], &[], &[EntityId(1)]);
    tracker.sync().flush().await;

    let (nodes, relationships) = tracker
        .with_graph(&key, |g| (g.node_count(), g.relationship_count()))
        .unwrap();
    assert_eq!(sink.node_count(), nodes);
    assert_eq!(sink.relationship_count(), relationships);
    assert_eq!(tracker.sync().failures(), 0);

    tracker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_during_start_leaves_no_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = ModelTracker::new(config(dir.path()));
    let (_, doc) = slow_office("/models/slow-a.rvt");
    let key = DocumentKey::derive(Some("/models/slow-a.rvt"), Some("Office"));

    let start = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.start(doc).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tracker.stop(&key));

    assert_eq!(start.await.unwrap().unwrap(), key);
    assert!(!tracker.registry().contains(&key));
    assert!(!tracker.snapshots().is_tracking(&key));

    let storage = dir.path().join(document_dir_name(&key, Some("Office")));
    assert!(list_checkpoints(&storage).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batches_wait_for_the_initial_graph_build() {
    let tracker = ModelTracker::new(ModelGraphConfig::default());
    let (inner, doc) = slow_office("/models/slow-b.rvt");
    let key = DocumentKey::derive(Some("/models/slow-b.rvt"), Some("Office"));

    let start = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.start_without_checkpoints(doc).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    inner.insert(chair(3, 2.0));
    let batch = tokio::task::spawn_blocking({
        let tracker = tracker.clone();
        let key = key.clone();
        move || tracker.process_batch(&key, &[EntityId(3)], &[], &[])
    });

    start.await.unwrap().unwrap();
    let outcome = batch.await.unwrap().unwrap();
    assert_eq!(outcome.records_appended, 1);

    let stats = tracker.graph_statistics(&key).unwrap();
    assert_eq!(stats.element_nodes, 3);
    assert_eq!(tracker.changes(&key).len(), 1);
}
