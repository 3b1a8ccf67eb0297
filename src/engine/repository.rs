//! Remote persistence collaborator.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::RepositoryError;
use crate::tree::{Node, NodeId, Properties};

/// Where a moved node lands relative to the anchor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MovePosition {
    /// First child of the anchor.
    FirstChild,
    /// Next sibling of the anchor.
    Right,
    /// Previous sibling of the anchor; only used before the very first root.
    Left,
}

impl MovePosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovePosition::FirstChild => "first-child",
            MovePosition::Right => "right",
            MovePosition::Left => "left",
        }
    }
}

/// Backend that persists the resource tree.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Persist a new node and return its permanent id.
    async fn create(&self, attributes: &Properties, parent_id: Option<&NodeId>) -> Result<NodeId, RepositoryError>;

    async fn remove(&self, node: &Node) -> Result<(), RepositoryError>;

    async fn edit(&self, node_id: &NodeId, attributes: &Properties) -> Result<(), RepositoryError>;

    async fn move_node(&self, drag_id: &NodeId, drop_id: &NodeId, position: MovePosition) -> Result<(), RepositoryError>;
}

/// Operation kinds, used for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryOp {
    Create,
    Remove,
    Edit,
    Move,
}

/// A call received by [`InMemoryRepository`].
#[derive(Debug, Clone, PartialEq)]
pub enum RepositoryCall {
    Create { attributes: Properties, parent: Option<NodeId> },
    Remove { id: NodeId },
    Edit { id: NodeId, attributes: Properties },
    Move { drag: NodeId, drop: NodeId, position: MovePosition },
}

/// Repository that hands out integer ids and records every call.
///
/// Latency, scripted failures and a manual gate make the optimistic paths
/// of the engine observable.
#[derive(Debug)]
pub struct InMemoryRepository {
    next_id: AtomicU64,
    latency: Duration,
    failures: Mutex<HashMap<RepositoryOp, VecDeque<RepositoryError>>>,
    calls: Mutex<Vec<RepositoryCall>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InMemoryRepository {
    /// Create a repository whose first issued id is `first_id`.
    pub fn new(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
            latency: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    /// Delay every answer by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next call of kind `op` fail with a rejection (stacks).
    pub fn fail_next(&self, op: RepositoryOp) {
        self.fail_next_with(op, RepositoryError::Rejected(format!("{:?} refused", op)));
    }

    /// Make the next call of kind `op` fail with `error`; queued per kind.
    pub fn fail_next_with(&self, op: RepositoryOp, error: RepositoryError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.entry(op).or_default().push_back(error);
        }
    }

    /// Hold every answer until the returned gate is notified once per call.
    pub fn hold(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        if let Ok(mut gate) = self.gate.lock() {
            *gate = Some(notify.clone());
        }
        notify
    }

    /// Stop holding answers.
    pub fn release(&self) {
        if let Ok(mut gate) = self.gate.lock() {
            if let Some(notify) = gate.take() {
                notify.notify_waiters();
            }
        }
    }

    /// Calls received so far, in arrival order.
    pub fn calls(&self) -> Vec<RepositoryCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn answer(&self, op: RepositoryOp, call: RepositoryCall) -> Result<(), RepositoryError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let gate = self.gate.lock().ok().and_then(|g| g.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let failure = self
            .failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.get_mut(&op).and_then(VecDeque::pop_front));
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NodeRepository for InMemoryRepository {
    async fn create(&self, attributes: &Properties, parent_id: Option<&NodeId>) -> Result<NodeId, RepositoryError> {
        self.answer(
            RepositoryOp::Create,
            RepositoryCall::Create {
                attributes: attributes.clone(),
                parent: parent_id.cloned(),
            },
        )
        .await?;
        Ok(NodeId::from(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    async fn remove(&self, node: &Node) -> Result<(), RepositoryError> {
        self.answer(RepositoryOp::Remove, RepositoryCall::Remove { id: node.id.clone() })
            .await
    }

    async fn edit(&self, node_id: &NodeId, attributes: &Properties) -> Result<(), RepositoryError> {
        self.answer(
            RepositoryOp::Edit,
            RepositoryCall::Edit {
                id: node_id.clone(),
                attributes: attributes.clone(),
            },
        )
        .await
    }

    async fn move_node(&self, drag_id: &NodeId, drop_id: &NodeId, position: MovePosition) -> Result<(), RepositoryError> {
        self.answer(
            RepositoryOp::Move,
            RepositoryCall::Move {
                drag: drag_id.clone(),
                drop: drop_id.clone(),
                position,
            },
        )
        .await
    }
}
