//! Remote-backed, optimistic mutations.
//!
//! Each operation applies its change locally first, releases the engine
//! lock, awaits the repository and then settles: a confirmation is spliced
//! in, a rejection is rolled back or reconciled according to the engine's
//! [`RollbackPolicy`]. Version stamps taken at apply time keep a late
//! rollback from clobbering a newer local change.
//!
//! A node whose create call is still in flight only has a provisional id.
//! Repository calls naming such a node wait for the create to settle and
//! go out under the permanent id instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, MutexGuard};

use crate::engine::mutation::{Removed, RollbackPolicy, TreeEngine};
use crate::engine::reorder::{DropEvent, DropPlan, Placement};
use crate::engine::repository::NodeRepository;
use crate::error::{MapTreeError, Result};
use crate::tree::{Forest, Node, NodeId, Properties};

/// State of a create call, keyed by the provisional id.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Creation {
    Pending,
    Confirmed(NodeId),
    Failed,
}

type Creations = Arc<std::sync::Mutex<HashMap<NodeId, watch::Sender<Creation>>>>;

/// Shared handle on one [`TreeEngine`] plus its repository.
///
/// Clones share the same engine, repository, pending creates and closed flag.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Mutex<TreeEngine>>,
    repo: Arc<dyn NodeRepository>,
    creations: Creations,
    closed: Arc<AtomicBool>,
}

impl EngineHandle {
    pub fn new(engine: TreeEngine, repo: Arc<dyn NodeRepository>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            repo,
            creations: Arc::new(std::sync::Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop accepting intents; answers still in flight are discarded.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("engine closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Lock the engine for direct (local) access.
    pub async fn engine(&self) -> MutexGuard<'_, TreeEngine> {
        self.engine.lock().await
    }

    /// Copy of the current primary tree.
    pub async fn snapshot(&self) -> Forest {
        self.engine.lock().await.forest().clone()
    }

    /// Replace the tree; calls waiting on a pending create give up with `Stale`.
    pub async fn reload(&self, forest: Forest) -> Result<()> {
        self.ensure_open()?;
        self.engine.lock().await.reload(forest);
        if let Ok(mut creations) = self.creations.lock() {
            creations.clear();
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(MapTreeError::Closed)
        } else {
            Ok(())
        }
    }

    /// Re-acquire the engine after a repository await, unless closed meanwhile.
    async fn resume(&self, id: &NodeId) -> Result<MutexGuard<'_, TreeEngine>> {
        let engine = self.engine.lock().await;
        if self.is_closed() {
            tracing::debug!(%id, "discarding answer after close");
            return Err(MapTreeError::Closed);
        }
        Ok(engine)
    }

    fn begin_create(&self, id: &NodeId) {
        if let Ok(mut creations) = self.creations.lock() {
            creations.insert(id.clone(), watch::channel(Creation::Pending).0);
        }
    }

    fn finish_create(&self, id: &NodeId, outcome: Creation) {
        if let Ok(creations) = self.creations.lock() {
            if let Some(tx) = creations.get(id) {
                tx.send_replace(outcome);
            }
        }
    }

    /// Mark a create that ended without an answer as failed.
    fn abandon_create(&self, id: &NodeId) {
        if let Ok(creations) = self.creations.lock() {
            if let Some(tx) = creations.get(id) {
                tx.send_if_modified(|state| {
                    if *state == Creation::Pending {
                        *state = Creation::Failed;
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }

    /// Id the repository knows `id` by, waiting for its create to settle.
    ///
    /// A node whose create failed has no remote counterpart: `Stale`.
    async fn remote_id(&self, id: &NodeId) -> Result<NodeId> {
        let rx = match self.creations.lock() {
            Ok(creations) => creations.get(id).map(|tx| tx.subscribe()),
            Err(_) => None,
        };
        let Some(mut rx) = rx else {
            return Ok(id.clone());
        };
        let outcome = rx
            .wait_for(|state| *state != Creation::Pending)
            .await
            .map(|state| (*state).clone())
            .unwrap_or(Creation::Failed);
        match outcome {
            Creation::Confirmed(permanent) => Ok(permanent),
            _ => Err(MapTreeError::Stale(id.clone())),
        }
    }

    /// Current local id of `id`: its permanent id once its create confirmed.
    fn current_id(&self, id: &NodeId) -> NodeId {
        let confirmed = self.creations.lock().ok().and_then(|creations| {
            creations.get(id).and_then(|tx| match &*tx.borrow() {
                Creation::Confirmed(permanent) => Some(permanent.clone()),
                _ => None,
            })
        });
        confirmed.unwrap_or_else(|| id.clone())
    }

    /// Create a node optimistically and re-key it once the repository answers.
    pub async fn add_node(&self, parent: Option<&NodeId>, attributes: &Properties, is_group: bool) -> Result<Node> {
        self.ensure_open()?;
        let (node, version) = {
            let mut engine = self.engine.lock().await;
            let node = engine.add_node(parent, attributes, is_group)?;
            let version = engine.version(&node.id);
            self.begin_create(&node.id);
            (node, version)
        };

        let result = self.create_remote(&node, parent, version).await;
        self.abandon_create(&node.id);
        result
    }

    async fn create_remote(&self, node: &Node, parent: Option<&NodeId>, version: Option<u64>) -> Result<Node> {
        let remote_parent = match parent {
            Some(pid) => self.remote_id(pid).await.map(Some),
            None => Ok(None),
        };
        let answer = match remote_parent {
            Ok(remote_parent) => self
                .repo
                .create(&node.attributes(), remote_parent.as_ref())
                .await
                .map_err(|source| MapTreeError::remote("create", &node.id, source)),
            Err(e) => Err(e),
        };

        let mut engine = self.resume(&node.id).await?;
        match answer {
            Ok(permanent) => {
                if !engine.forest().contains(&node.id) {
                    // Pending calls on the removed node still need the remote id.
                    self.finish_create(&node.id, Creation::Confirmed(permanent.clone()));
                    tracing::warn!(id = %node.id, %permanent, "provisional node vanished before confirmation");
                    return Err(MapTreeError::Stale(node.id.clone()));
                }
                engine.confirm_id(&node.id, &permanent)?;
                self.finish_create(&node.id, Creation::Confirmed(permanent.clone()));
                engine
                    .find(&permanent)
                    .cloned()
                    .ok_or(MapTreeError::NodeNotFound(permanent))
            }
            Err(e) => {
                settle(&mut engine, &node.id, version, "create", |engine| {
                    engine.remove_node(&node.id).map(|_| ())
                });
                Err(e)
            }
        }
    }

    /// Remove a node optimistically, then ask the repository to remove it.
    pub async fn remove_node(&self, id: &NodeId) -> Result<Node> {
        self.ensure_open()?;
        let (removed, version) = {
            let mut engine = self.engine.lock().await;
            let removed = engine.remove_node(id)?;
            let version = engine.version(id);
            (removed, version)
        };

        let answer = match self.remote_id(id).await {
            Ok(remote) => {
                let target = with_id(&removed.node, &remote);
                self.repo
                    .remove(&target)
                    .await
                    .map_err(|source| MapTreeError::remote("remove", &remote, source))
            }
            Err(_) => {
                tracing::debug!(%id, "node was never created remotely");
                Ok(())
            }
        };

        let mut engine = self.resume(id).await?;
        match answer {
            Ok(()) => Ok(removed.node),
            Err(e) => {
                let removed = self.rebase_removed(removed);
                settle(&mut engine, id, version, "remove", |engine| {
                    engine.restore_removed(removed)
                });
                Err(e)
            }
        }
    }

    /// Merge attributes optimistically, then send the merged set to the repository.
    pub async fn edit_node(&self, id: &NodeId, attributes: &Properties) -> Result<Properties> {
        self.ensure_open()?;
        let (mut snapshot, merged, version) = {
            let mut engine = self.engine.lock().await;
            let (snapshot, merged) = engine.edit_node(id, attributes)?;
            let version = engine.version(id);
            (snapshot, merged, version)
        };

        let answer = match self.remote_id(id).await {
            Ok(remote) => self
                .repo
                .edit(&remote, &merged)
                .await
                .map_err(|source| MapTreeError::remote("edit", &remote, source)),
            Err(e) => Err(e),
        };

        let id = self.current_id(id);
        let mut engine = self.resume(&id).await?;
        match answer {
            Ok(()) => Ok(merged),
            Err(e) => {
                snapshot.id = id.clone();
                settle(&mut engine, &id, version, "edit", |engine| {
                    engine.restore_edit(snapshot)
                });
                Err(e)
            }
        }
    }

    /// Apply a drop locally, then report the move to the repository.
    pub async fn drop_node(&self, event: &DropEvent) -> Result<DropPlan> {
        self.ensure_open()?;
        let (plan, version) = {
            let mut engine = self.engine.lock().await;
            let plan = engine.drop_node(event)?;
            let version = engine.version(&plan.drag_id);
            (plan, version)
        };

        let answer = match self.remote_pair(&plan.drag_id, &plan.anchor).await {
            Ok((drag, anchor)) => self
                .repo
                .move_node(&drag, &anchor, plan.position)
                .await
                .map_err(|source| MapTreeError::remote("move", &drag, source)),
            Err(e) => Err(e),
        };

        let plan = self.rebase_plan(plan);
        let mut engine = self.resume(&plan.drag_id).await?;
        match answer {
            Ok(()) => Ok(plan),
            Err(e) => {
                settle(&mut engine, &plan.drag_id, version, "move", |engine| {
                    engine.revert_drop(&plan)
                });
                Err(e)
            }
        }
    }

    async fn remote_pair(&self, drag: &NodeId, anchor: &NodeId) -> Result<(NodeId, NodeId)> {
        let drag = self.remote_id(drag).await?;
        let anchor = self.remote_id(anchor).await?;
        Ok((drag, anchor))
    }

    /// Rewrite a plan whose nodes were re-keyed while the move was in flight.
    fn rebase_plan(&self, mut plan: DropPlan) -> DropPlan {
        plan.drag_id = self.current_id(&plan.drag_id);
        plan.anchor = self.current_id(&plan.anchor);
        plan.old_parent = plan.old_parent.map(|p| self.current_id(&p));
        plan.new_parent = plan.new_parent.map(|p| self.current_id(&p));
        plan
    }

    fn rebase_removed(&self, mut removed: Removed) -> Removed {
        let id = self.current_id(&removed.node.id);
        if id != removed.node.id {
            removed.node = with_id(&removed.node, &id);
            removed.layer = None;
        }
        removed.parent = removed.parent.map(|p| self.current_id(&p));
        removed
    }

    /// Move `drag` before, after or into `target`.
    pub async fn move_to(&self, drag: &NodeId, target: &NodeId, placement: Placement) -> Result<DropPlan> {
        let event = {
            let engine = self.engine.lock().await;
            DropEvent::for_placement(engine.forest(), drag, target, placement)?
        };
        self.drop_node(&event).await
    }

    pub async fn check(&self, id: &NodeId, checked: bool) -> Result<Vec<NodeId>> {
        self.ensure_open()?;
        self.engine.lock().await.check(id, checked)
    }

    pub async fn select(&self, ids: &[NodeId]) -> Result<Vec<NodeId>> {
        self.ensure_open()?;
        Ok(self.engine.lock().await.select(ids))
    }
}

/// Copy of `node` carrying `id`, with its children pointing at it.
fn with_id(node: &Node, id: &NodeId) -> Node {
    let mut node = node.clone();
    node.id = id.clone();
    for child in node.children.iter_mut() {
        child.parent_id = Some(id.clone());
    }
    node
}

/// Apply the rollback policy to a rejected mutation.
///
/// A skipped rollback leaves the node flagged unconfirmed, same as reconcile.
fn settle<F>(engine: &mut TreeEngine, id: &NodeId, version: Option<u64>, op: &'static str, undo: F)
where
    F: FnOnce(&mut TreeEngine) -> Result<()>,
{
    match engine.policy() {
        RollbackPolicy::Reconcile => {
            engine.mark_unconfirmed(id);
            tracing::warn!(%id, op, "remote rejected, keeping local change unconfirmed");
        }
        RollbackPolicy::Rollback => {
            if engine.version(id) != version {
                if engine.forest().contains(id) {
                    engine.mark_unconfirmed(id);
                }
                tracing::warn!(%id, op, "remote rejected, node changed since; rollback skipped");
                return;
            }
            match undo(engine) {
                Ok(()) => tracing::warn!(%id, op, "remote rejected, local change rolled back"),
                Err(e) => tracing::warn!(%id, op, error = %e, "remote rejected, rollback failed"),
            }
        }
    }
}
