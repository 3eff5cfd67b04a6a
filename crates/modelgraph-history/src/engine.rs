//! Per-document checkpoint scheduling and persistence.
//!
//! Each tracked document owns a storage directory, a recurring timer task and
//! a write gate. Every checkpoint holds the gate while it writes. Stopping a
//! document removes it from the registry, aborts its timer and then takes the
//! gate to mark it stopped. A write already in progress therefore finishes,
//! and no checkpoint can start once `stop_document` has returned.

use chrono::{DateTime, Local, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use modelgraph_core::{
    capture_document, CheckpointCreated, DocumentKey, EventBus, HistoryConfig, HostDocument,
    ModelGraphError, Result, TrackerEvent,
};

use crate::checkpoint::{self, document_dir_name, Checkpoint, CheckpointInfo};
use crate::diff::{diff_checkpoints, CheckpointDiff, EntityComparator};
use crate::retention::RetentionPolicy;

pub const SESSION_START: &str = "Session Start";
pub const MANUAL_SAVE: &str = "Manual Save";
pub const DOCUMENT_CLOSE: &str = "Document Close";

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub root: PathBuf,
    /// Zero disables scheduled checkpoints.
    pub interval: Duration,
    pub retention: RetentionPolicy,
    pub comparator: EntityComparator,
    pub max_checkpoints_per_day: u32,
}

impl SnapshotSettings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from(&HistoryConfig {
            checkpoint_root: root.into(),
            ..HistoryConfig::default()
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_comparator(mut self, comparator: EntityComparator) -> Self {
        self.comparator = comparator;
        self
    }
}

impl From<&HistoryConfig> for SnapshotSettings {
    fn from(config: &HistoryConfig) -> Self {
        Self {
            root: config.checkpoint_root.clone(),
            interval: config.interval(),
            retention: RetentionPolicy::new(config.retention()),
            comparator: EntityComparator::from(config),
            max_checkpoints_per_day: config.max_checkpoints_per_day,
        }
    }
}

/// Bookkeeping for a document's checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCheckpointState {
    pub storage_dir: PathBuf,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub last_checkpoint_path: Option<PathBuf>,
    pub checkpoint_count: u64,
    pub checkpoints_today: u32,
    pub current_day: Option<NaiveDate>,
}

impl DocumentCheckpointState {
    fn new(storage_dir: PathBuf) -> Self {
        Self {
            storage_dir,
            last_checkpoint_at: None,
            last_checkpoint_path: None,
            checkpoint_count: 0,
            checkpoints_today: 0,
            current_day: None,
        }
    }

    fn record(&mut self, timestamp: DateTime<Utc>, path: PathBuf) {
        let day = timestamp.date_naive();
        if self.current_day != Some(day) {
            self.current_day = Some(day);
            self.checkpoints_today = 0;
        }
        self.checkpoints_today += 1;
        self.checkpoint_count += 1;
        self.last_checkpoint_at = Some(timestamp);
        self.last_checkpoint_path = Some(path);
    }
}

struct DocumentSnapshots {
    key: DocumentKey,
    document: Arc<dyn HostDocument>,
    state: Mutex<DocumentCheckpointState>,
    /// `true` once the document has been stopped.
    write_gate: Mutex<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SnapshotEngine {
    settings: Arc<SnapshotSettings>,
    documents: Arc<DashMap<DocumentKey, Arc<DocumentSnapshots>>>,
    events: EventBus,
}

impl SnapshotEngine {
    pub fn new(settings: SnapshotSettings, events: EventBus) -> Self {
        Self {
            settings: Arc::new(settings),
            documents: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn settings(&self) -> &SnapshotSettings {
        &self.settings
    }

    /// Create the document's storage directory, arm its timer and take the
    /// "Session Start" checkpoint. Initializing an already tracked document
    /// only logs a warning.
    pub async fn initialize_document(
        &self,
        key: DocumentKey,
        document: Arc<dyn HostDocument>,
    ) -> Result<Option<CheckpointInfo>> {
        let storage_dir = self
            .settings
            .root
            .join(document_dir_name(&key, document.title().as_deref()));
        tokio::fs::create_dir_all(&storage_dir).await?;

        let tracked = Arc::new(DocumentSnapshots {
            key: key.clone(),
            document,
            state: Mutex::new(DocumentCheckpointState::new(storage_dir.clone())),
            write_gate: Mutex::new(false),
            timer: Mutex::new(None),
        });

        match self.documents.entry(key.clone()) {
            Entry::Occupied(_) => {
                warn!(document = %key, "Snapshots already initialized for document");
                return Ok(None);
            }
            Entry::Vacant(slot) => {
                slot.insert(tracked.clone());
            }
        }

        *tracked.timer.lock() = self.spawn_timer(key.clone());

        info!(
            target: "modelgraph::snapshot",
            document = %key,
            dir = %storage_dir.display(),
            interval_secs = self.settings.interval.as_secs(),
            "Snapshot tracking started"
        );

        self.checkpoint(&key, SESSION_START).await
    }

    fn spawn_timer(&self, key: DocumentKey) -> Option<JoinHandle<()>> {
        let period = self.settings.interval;
        if period.is_zero() {
            debug!(document = %key, "Scheduled checkpoints disabled");
            return None;
        }

        let engine = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let description = format!("Scheduled Checkpoint - {}", Local::now().format("%H:%M"));
                let worker = engine.clone();
                let doc_key = key.clone();

                let outcome = tokio::task::spawn_blocking(move || {
                    worker.checkpoint_blocking(&doc_key, &description)
                })
                .await;

                match outcome {
                    Ok(Ok(Some(info))) => {
                        debug!(document = %key, path = %info.path.display(), "Scheduled checkpoint taken")
                    }
                    Ok(Ok(None)) => {
                        debug!(document = %key, "Document no longer tracked, timer exiting");
                        break;
                    }
                    Ok(Err(e)) => {
                        error!(document = %key, error = %e, "Scheduled checkpoint failed")
                    }
                    Err(e) => {
                        error!(document = %key, error = %e, "Scheduled checkpoint task aborted")
                    }
                }
            }
        }))
    }

    /// Take a checkpoint on the blocking pool.
    pub async fn checkpoint(
        &self,
        key: &DocumentKey,
        description: &str,
    ) -> Result<Option<CheckpointInfo>> {
        let engine = self.clone();
        let key = key.clone();
        let description = description.to_string();
        tokio::task::spawn_blocking(move || engine.checkpoint_blocking(&key, &description))
            .await
            .map_err(|e| ModelGraphError::InvalidOperation(format!("checkpoint task failed: {}", e)))?
    }

    /// Capture every entity of the document and persist the result.
    ///
    /// Returns `Ok(None)` when the document is not tracked or has been
    /// stopped. Blocks for the duration of the host scan and file write.
    pub fn checkpoint_blocking(
        &self,
        key: &DocumentKey,
        description: &str,
    ) -> Result<Option<CheckpointInfo>> {
        let Some(tracked) = self.documents.get(key).map(|d| d.value().clone()) else {
            warn!(document = %key, "Checkpoint requested for untracked document");
            return Ok(None);
        };

        let gate = tracked.write_gate.lock();
        if *gate {
            debug!(document = %key, "Document stopped, skipping checkpoint");
            return Ok(None);
        }

        let info = self.write_checkpoint(&tracked, description)?;
        drop(gate);

        self.events
            .publish(TrackerEvent::CheckpointCreated(CheckpointCreated {
                document: key.clone(),
                path: info.path.clone(),
                description: info.description.clone(),
                entity_count: info.entity_count,
                timestamp: info.timestamp,
            }));

        let storage_dir = tracked.state.lock().storage_dir.clone();
        if let Err(e) = self.settings.retention.sweep(&storage_dir, Utc::now()) {
            warn!(document = %key, error = %e, "Retention sweep failed");
        }

        Ok(Some(info))
    }

    fn write_checkpoint(
        &self,
        tracked: &DocumentSnapshots,
        description: &str,
    ) -> Result<CheckpointInfo> {
        let key = &tracked.key;
        let entities = capture_document(tracked.document.as_ref()).map_err(|e| {
            error!(document = %key, error = %e, "Cannot enumerate document entities");
            ModelGraphError::from(e)
        })?;

        let timestamp = Utc::now();
        let checkpoint = Checkpoint::new(key.clone(), description, timestamp, entities)
            .with_document(tracked.document.path(), tracked.document.title());

        let storage_dir = tracked.state.lock().storage_dir.clone();
        let path = checkpoint.write_to_dir(&storage_dir).map_err(|e| {
            error!(document = %key, dir = %storage_dir.display(), error = %e, "Checkpoint write failed");
            e
        })?;

        let mut state = tracked.state.lock();
        state.record(timestamp, path.clone());
        if state.checkpoints_today > self.settings.max_checkpoints_per_day {
            warn!(
                document = %key,
                today = state.checkpoints_today,
                advisory_limit = self.settings.max_checkpoints_per_day,
                "Daily checkpoint count above advisory limit"
            );
        }
        drop(state);

        info!(
            target: "modelgraph::snapshot",
            document = %key,
            path = %path.display(),
            entities = checkpoint.entities.len(),
            description,
            "Checkpoint created"
        );
        Ok(checkpoint.info(path))
    }

    /// Stop tracking: cancel the timer and forget the document. Returns
    /// `false` if the document was not tracked.
    pub fn stop_document(&self, key: &DocumentKey) -> bool {
        let Some((_, tracked)) = self.documents.remove(key) else {
            warn!(document = %key, "Stop requested for untracked document");
            return false;
        };

        if let Some(handle) = tracked.timer.lock().take() {
            handle.abort();
        }
        *tracked.write_gate.lock() = true;

        info!(target: "modelgraph::snapshot", document = %key, "Snapshot tracking stopped");
        true
    }

    pub fn shutdown(&self) {
        let keys: Vec<DocumentKey> = self.documents.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.stop_document(&key);
        }
    }

    pub fn is_tracking(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn tracked_documents(&self) -> Vec<DocumentKey> {
        self.documents.iter().map(|e| e.key().clone()).collect()
    }

    pub fn state(&self, key: &DocumentKey) -> Option<DocumentCheckpointState> {
        self.documents.get(key).map(|d| d.state.lock().clone())
    }

    pub fn storage_dir(&self, key: &DocumentKey) -> Option<PathBuf> {
        self.documents
            .get(key)
            .map(|d| d.state.lock().storage_dir.clone())
    }

    /// Checkpoints of a tracked document, newest first. Untracked documents
    /// have none.
    pub fn list_checkpoints(&self, key: &DocumentKey) -> Result<Vec<CheckpointInfo>> {
        match self.storage_dir(key) {
            Some(dir) => checkpoint::list_checkpoints(&dir),
            None => {
                warn!(document = %key, "Listing checkpoints of untracked document");
                Ok(Vec::new())
            }
        }
    }

    pub fn latest_checkpoint(&self, key: &DocumentKey) -> Result<Option<CheckpointInfo>> {
        Ok(self.list_checkpoints(key)?.into_iter().next())
    }

    pub fn load_checkpoint(&self, path: &Path) -> Result<Checkpoint> {
        Checkpoint::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load checkpoint");
            e
        })
    }

    /// Compare two checkpoint files with the configured comparator.
    pub fn diff(&self, older: &Path, newer: &Path) -> Result<CheckpointDiff> {
        self.diff_with(older, newer, &self.settings.comparator)
    }

    pub fn diff_with(
        &self,
        older: &Path,
        newer: &Path,
        comparator: &EntityComparator,
    ) -> Result<CheckpointDiff> {
        let older = self.load_checkpoint(older)?;
        let newer = self.load_checkpoint(newer)?;
        Ok(diff_checkpoints(&older, &newer, comparator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgraph_core::memory::{EntityField, InMemoryDocument, InMemoryEntity};
    use modelgraph_core::{Classification, EntityCapture, EntityId, Location};

    fn desk(id: i64, x: f64) -> InMemoryEntity {
        InMemoryEntity::new(
            EntityCapture::new(EntityId(id))
                .with_name("Desk")
                .with_classification(Classification::new("Furniture", "Desk", "1600"))
                .with_location(Location::point(x, 0.0, 0.0)),
        )
    }

    fn document() -> Arc<InMemoryDocument> {
        let doc = Arc::new(InMemoryDocument::new(Some("/models/office.rvt"), Some("Office")));
        doc.insert(desk(1, 0.0));
        doc.insert(desk(2, 4.0));
        doc
    }

    fn engine(root: &Path) -> SnapshotEngine {
        SnapshotEngine::new(
            SnapshotSettings::new(root).with_interval(Duration::ZERO),
            EventBus::new(16),
        )
    }

    #[tokio::test]
    async fn initialize_takes_session_start_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = DocumentKey::new("/models/office.rvt");

        let info = engine
            .initialize_document(key.clone(), document())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(info.description, SESSION_START);
        assert_eq!(info.entity_count, 2);
        assert!(info.path.starts_with(dir.path()));

        let state = engine.state(&key).unwrap();
        assert_eq!(state.checkpoint_count, 1);
        assert_eq!(state.last_checkpoint_path, Some(info.path));
    }

    #[tokio::test]
    async fn second_initialize_is_a_warning_noop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = DocumentKey::new("k");
        let doc = document();

        engine.initialize_document(key.clone(), doc.clone()).await.unwrap();
        let again = engine.initialize_document(key.clone(), doc).await.unwrap();
        assert!(again.is_none());
        assert_eq!(engine.list_checkpoints(&key).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_entity_is_omitted_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = DocumentKey::new("k");
        let doc = document();
        doc.insert(desk(3, 8.0).failing(EntityField::Location));

        let info = engine
            .initialize_document(key, doc)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.entity_count, 2);
    }

    #[tokio::test]
    async fn checkpoint_event_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut rx = engine.events.subscribe();
        let key = DocumentKey::new("k");

        engine.initialize_document(key.clone(), document()).await.unwrap();

        match rx.recv().await.unwrap() {
            TrackerEvent::CheckpointCreated(event) => {
                assert_eq!(event.document, key);
                assert_eq!(event.description, SESSION_START);
                assert_eq!(event.entity_count, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn untracked_and_stopped_documents_do_not_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = DocumentKey::new("k");

        assert!(engine.checkpoint(&key, "nothing").await.unwrap().is_none());

        engine.initialize_document(key.clone(), document()).await.unwrap();
        let storage = engine.storage_dir(&key).unwrap();
        assert!(engine.stop_document(&key));
        assert!(!engine.stop_document(&key));

        assert!(engine.checkpoint(&key, "after stop").await.unwrap().is_none());
        assert_eq!(checkpoint::list_checkpoints(&storage).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn host_failure_aborts_only_that_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = DocumentKey::new("k");
        let doc = document();
        engine.initialize_document(key.clone(), doc.clone()).await.unwrap();

        doc.set_unavailable(true);
        assert!(engine.checkpoint(&key, "Manual Save").await.is_err());

        doc.set_unavailable(false);
        assert!(engine.checkpoint(&key, MANUAL_SAVE).await.unwrap().is_some());
        assert_eq!(engine.list_checkpoints(&key).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn diff_between_checkpoints_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = DocumentKey::new("k");
        let doc = document();

        let first = engine
            .initialize_document(key.clone(), doc.clone())
            .await
            .unwrap()
            .unwrap();
        doc.insert(desk(9, 1.0));
        doc.update(EntityId(2), |e| {
            e.state_mut().location = Some(Location::point(4.5, 0.0, 0.0))
        });
        let second = engine.checkpoint(&key, "edit").await.unwrap().unwrap();

        let same = engine.diff(&first.path, &first.path).unwrap();
        assert!(same.is_empty());

        let diff = engine.diff(&first.path, &second.path).unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, EntityId(9));
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].entity_id, EntityId(2));
        assert!(diff.deleted.is_empty());

        let listed = engine.list_checkpoints(&key).unwrap();
        assert_eq!(listed[0].path, second.path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_keeps_running_after_failures_and_stops_with_document() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SnapshotEngine::new(
            SnapshotSettings::new(dir.path()).with_interval(Duration::from_millis(40)),
            EventBus::new(64),
        );
        let key = DocumentKey::new("k");
        let doc = document();
        engine.initialize_document(key.clone(), doc.clone()).await.unwrap();
        let storage = engine.storage_dir(&key).unwrap();

        doc.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        doc.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let scheduled = engine
            .list_checkpoints(&key)
            .unwrap()
            .into_iter()
            .filter(|c| c.description.starts_with("Scheduled Checkpoint - "))
            .count();
        assert!(scheduled >= 1);

        engine.stop_document(&key);
        let after_stop = checkpoint::list_checkpoints(&storage).unwrap().len();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(checkpoint::list_checkpoints(&storage).unwrap().len(), after_stop);
    }
}
