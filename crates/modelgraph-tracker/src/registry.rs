use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::Arc;
use tracing::{info, warn};

use modelgraph_core::{DocumentKey, HostDocument};
use modelgraph_graph::{CategoryFilter, OntologyGraph};
use modelgraph_history::ChangeLog;

/// Everything tracked for one document. Owned by the registry and never
/// shared with another document.
pub struct DocumentTracking {
    pub key: DocumentKey,
    pub path: Option<String>,
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    pub(crate) document: Arc<dyn HostDocument>,
    pub(crate) change_log: Mutex<ChangeLog>,
    pub(crate) graph: RwLock<OntologyGraph>,
    batch_lock: Mutex<()>,
}

impl DocumentTracking {
    fn new(key: DocumentKey, document: Arc<dyn HostDocument>, graph: OntologyGraph) -> Self {
        Self {
            path: document.path(),
            title: document.title(),
            started_at: Utc::now(),
            change_log: Mutex::new(ChangeLog::new(key.clone())),
            graph: RwLock::new(graph),
            batch_lock: Mutex::new(()),
            document,
            key,
        }
    }

    pub fn document(&self) -> &Arc<dyn HostDocument> {
        &self.document
    }

    /// Serializes batch application and rebuilds for this document.
    pub(crate) fn lock_batches(&self) -> MutexGuard<'_, ()> {
        self.batch_lock.lock()
    }
}

/// Maps document keys to their tracking state. Safe for concurrent use
/// across documents.
#[derive(Clone, Default)]
pub struct DocumentRegistry {
    documents: Arc<DashMap<DocumentKey, Arc<DocumentTracking>>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document. Returns `None` with a warning if it is already
    /// tracked.
    pub fn start(
        &self,
        key: DocumentKey,
        document: Arc<dyn HostDocument>,
        filter: CategoryFilter,
        sync_tracking: bool,
    ) -> Option<Arc<DocumentTracking>> {
        match self.documents.entry(key.clone()) {
            Entry::Occupied(_) => {
                warn!(target: "modelgraph::registry", document = %key, "Document already tracked");
                None
            }
            Entry::Vacant(slot) => {
                if key.is_generated() {
                    warn!(
                        target: "modelgraph::registry",
                        document = %key,
                        "Document has neither path nor title; its history will not carry over to another session"
                    );
                }
                let mut graph = OntologyGraph::new(filter);
                graph.set_sync_tracking(sync_tracking);
                let tracking = Arc::new(DocumentTracking::new(key.clone(), document, graph));
                slot.insert(tracking.clone());
                info!(target: "modelgraph::registry", document = %key, "Document tracking started");
                Some(tracking)
            }
        }
    }

    /// Forget a document. Its change log and graph are discarded.
    pub fn stop(&self, key: &DocumentKey) -> Option<Arc<DocumentTracking>> {
        match self.documents.remove(key) {
            Some((_, tracking)) => {
                info!(target: "modelgraph::registry", document = %key, "Document tracking stopped");
                Some(tracking)
            }
            None => {
                warn!(target: "modelgraph::registry", document = %key, "Stop requested for untracked document");
                None
            }
        }
    }

    pub fn get(&self, key: &DocumentKey) -> Option<Arc<DocumentTracking>> {
        self.documents.get(key).map(|t| t.value().clone())
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn keys(&self) -> Vec<DocumentKey> {
        self.documents.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}
