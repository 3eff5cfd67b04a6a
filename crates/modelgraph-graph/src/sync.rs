//! Best-effort push of graph mutations to an external graph store.
//!
//! Mutations are queued on an unbounded channel and applied by a background
//! task, so submitting never blocks or fails. Sink errors are logged and
//! dropped. The in-memory graph is never affected by them.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value as JsonValue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use modelgraph_core::{ModelGraphError, NodeId, Result};

use crate::node::{GraphNode, NodeVariant};
use crate::relationship::{EdgeKey, RelationType, Relationship};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOp {
    UpsertNode(GraphNode),
    DeleteNode(NodeId),
    CreateRelationship(Relationship),
    DeleteRelationship {
        source: NodeId,
        target: NodeId,
        relation_type: RelationType,
    },
}

impl SyncOp {
    pub fn describe(&self) -> String {
        match self {
            SyncOp::UpsertNode(n) => format!("upsert {} node {}", n.variant(), n.id),
            SyncOp::DeleteNode(id) => format!("delete node {}", id),
            SyncOp::CreateRelationship(r) => {
                format!("create {} {} -> {}", r.relation_type, r.source, r.target)
            }
            SyncOp::DeleteRelationship {
                source,
                target,
                relation_type,
            } => format!("delete {} {} -> {}", relation_type, source, target),
        }
    }
}

/// External graph store. Upserts are idempotent by id, relationships are
/// keyed by (source, target, type).
#[async_trait]
pub trait GraphSink: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn upsert_node(&self, node: &GraphNode) -> Result<()>;

    async fn delete_node(&self, id: NodeId) -> Result<()>;

    async fn create_relationship(&self, relationship: &Relationship) -> Result<()>;

    async fn delete_relationship(
        &self,
        source: NodeId,
        target: NodeId,
        relation_type: RelationType,
    ) -> Result<()>;

    /// Read-only query in the store's own language.
    async fn query(&self, statement: &str, params: &Map<String, JsonValue>)
        -> Result<Vec<JsonValue>>;
}

async fn apply_op(sink: &dyn GraphSink, op: &SyncOp) -> Result<()> {
    match op {
        SyncOp::UpsertNode(node) => sink.upsert_node(node).await,
        SyncOp::DeleteNode(id) => sink.delete_node(*id).await,
        SyncOp::CreateRelationship(rel) => sink.create_relationship(rel).await,
        SyncOp::DeleteRelationship {
            source,
            target,
            relation_type,
        } => {
            sink.delete_relationship(*source, *target, *relation_type)
                .await
        }
    }
}

enum Message {
    Op(SyncOp),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Clone)]
pub struct SyncDispatcher {
    tx: Option<mpsc::UnboundedSender<Message>>,
    pending: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    warn_threshold: usize,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncDispatcher {
    /// Start the background task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn GraphSink>, warn_threshold: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let pending = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker_failures = failures.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Op(op) => {
                        worker_pending.fetch_sub(1, Ordering::SeqCst);
                        if !sink.is_connected().await {
                            worker_failures.fetch_add(1, Ordering::SeqCst);
                            warn!(target: "modelgraph::sync", op = %op.describe(), "Graph store unavailable, dropping operation");
                            continue;
                        }
                        if let Err(e) = apply_op(sink.as_ref(), &op).await {
                            worker_failures.fetch_add(1, Ordering::SeqCst);
                            warn!(target: "modelgraph::sync", op = %op.describe(), error = %e, "Graph sync failed");
                        }
                    }
                    Message::Flush(done) => {
                        let _ = done.send(());
                    }
                    Message::Shutdown => break,
                }
            }
            debug!(target: "modelgraph::sync", "Sync worker stopped");
        });

        Self {
            tx: Some(tx),
            pending,
            failures,
            warn_threshold,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// A dispatcher that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            pending: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(AtomicUsize::new(0)),
            warn_threshold: usize::MAX,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn submit(&self, op: SyncOp) {
        let Some(tx) = &self.tx else {
            return;
        };
        let queued = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if queued == self.warn_threshold {
            warn!(target: "modelgraph::sync", queued, "Graph sync queue is backing up");
        }
        if tx.send(Message::Op(op)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            debug!(target: "modelgraph::sync", "Sync worker gone, operation dropped");
        }
    }

    pub fn submit_all(&self, ops: impl IntoIterator<Item = SyncOp>) {
        for op in ops {
            self.submit(op);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Operations the sink rejected or that were dropped while it was
    /// disconnected.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Wait until everything submitted so far has been handed to the sink.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drain queued operations and stop the worker.
    pub async fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Message::Shutdown);
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(_) => info!(target: "modelgraph::sync", "Sync dispatcher stopped"),
                Err(_) => warn!(target: "modelgraph::sync", "Sync dispatcher shutdown timed out"),
            }
        }
    }
}

/// Sink that mirrors the graph in memory. Reference adapter for tests and
/// offline runs.
pub struct MemoryGraphSink {
    nodes: DashMap<NodeId, GraphNode>,
    relationships: DashMap<EdgeKey, Relationship>,
    connected: AtomicBool,
}

impl Default for MemoryGraphSink {
    fn default() -> Self {
        Self {
            nodes: DashMap::new(),
            relationships: DashMap::new(),
            connected: AtomicBool::new(true),
        }
    }
}

impl MemoryGraphSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn node(&self, id: NodeId) -> Option<GraphNode> {
        self.nodes.get(&id).map(|n| n.clone())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn has_relationship(&self, source: NodeId, target: NodeId, relation_type: RelationType) -> bool {
        self.relationships
            .contains_key(&(source, target, relation_type))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ModelGraphError::Sync("memory sink disconnected".to_string()))
        }
    }
}

#[async_trait]
impl GraphSink for MemoryGraphSink {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn upsert_node(&self, node: &GraphNode) -> Result<()> {
        self.ensure_connected()?;
        self.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn delete_node(&self, id: NodeId) -> Result<()> {
        self.ensure_connected()?;
        self.nodes.remove(&id);
        self.relationships
            .retain(|(source, target, _), _| *source != id && *target != id);
        Ok(())
    }

    async fn create_relationship(&self, relationship: &Relationship) -> Result<()> {
        self.ensure_connected()?;
        if !self.nodes.contains_key(&relationship.source)
            || !self.nodes.contains_key(&relationship.target)
        {
            return Err(ModelGraphError::NodeNotFound(format!(
                "{} -> {}",
                relationship.source, relationship.target
            )));
        }
        self.relationships
            .insert(relationship.key(), relationship.clone());
        Ok(())
    }

    async fn delete_relationship(
        &self,
        source: NodeId,
        target: NodeId,
        relation_type: RelationType,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.relationships.remove(&(source, target, relation_type));
        Ok(())
    }

    /// `statement` is a node variant name (`Element`, `Spatial`, ...) or `*`.
    /// A `label` parameter filters by exact node label.
    async fn query(
        &self,
        statement: &str,
        params: &Map<String, JsonValue>,
    ) -> Result<Vec<JsonValue>> {
        self.ensure_connected()?;
        let statement = statement.trim();
        let label = params.get("label").and_then(JsonValue::as_str);

        let matches_variant = |variant: NodeVariant| statement == "*" || statement == variant.to_string();

        let mut rows = Vec::new();
        for entry in self.nodes.iter() {
            let node = entry.value();
            if !matches_variant(node.variant()) {
                continue;
            }
            if label.is_some_and(|l| l != node.label) {
                continue;
            }
            rows.push(serde_json::to_value(node)?);
        }
        Ok(rows)
    }
}
