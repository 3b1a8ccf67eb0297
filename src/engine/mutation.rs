//! Local (synchronous) mutation engine.
//!
//! `TreeEngine` owns the primary tree, its presentation mirror and the
//! selection state for one view. Every mutation is applied to both trees
//! before it returns, and hands back what is needed to undo it so the
//! remote-backed layer can roll back a rejected change.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::engine::reorder::{self, DropEvent, DropPlan};
use crate::engine::selection::{SelectionSink, SelectionState, TracingSelectionSink};
use crate::error::{MapTreeError, Result};
use crate::mirror::{project_node, Mirror, PresentationNode, RenderEvent, Renderer, TracingRenderer};
use crate::tree::{Forest, Node, NodeId, NodeKind, Properties};

/// What happens to an optimistic change when the repository rejects it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    /// Undo the local change.
    #[default]
    Rollback,
    /// Keep the local change, flag the node unconfirmed until the next reload.
    Reconcile,
}

impl RollbackPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "rollback" => Some(RollbackPolicy::Rollback),
            "reconcile" => Some(RollbackPolicy::Reconcile),
            _ => None,
        }
    }
}

/// A subtree taken out of both trees, with enough context to put it back.
#[derive(Debug, Clone)]
pub struct Removed {
    pub node: Node,
    pub parent: Option<NodeId>,
    pub index: usize,
    pub layer: Option<PresentationNode>,
}

/// Node state captured before an edit.
#[derive(Debug, Clone)]
pub struct EditSnapshot {
    pub id: NodeId,
    pub title: String,
    pub kind: NodeKind,
    pub properties: Properties,
    pub layer_properties: Option<Properties>,
}

fn subtree_ids(node: &Node) -> Vec<NodeId> {
    let mut out = vec![node.id.clone()];
    for child in &node.children {
        out.extend(subtree_ids(child));
    }
    out
}

fn added_event(node: &Node, parent: Option<&NodeId>, index: usize) -> RenderEvent {
    let key = node.id.clone();
    let parent = parent.cloned();
    if node.is_leaf() {
        RenderEvent::LeafAdded { key, parent, index }
    } else {
        RenderEvent::GroupAdded { key, parent, index }
    }
}

/// Per-view tree context: primary tree, mirror, selection and collaborators.
pub struct TreeEngine {
    forest: Forest,
    mirror: Mirror,
    selection: SelectionState,
    renderer: Box<dyn Renderer>,
    sink: Box<dyn SelectionSink>,
    /// Last local mutation stamp per node.
    versions: HashMap<NodeId, u64>,
    clock: u64,
    unconfirmed: HashSet<NodeId>,
    policy: RollbackPolicy,
}

impl TreeEngine {
    /// Create an engine that reports to tracing-only collaborators.
    pub fn new(forest: Forest) -> Self {
        Self::with_collaborators(forest, Box::new(TracingRenderer), Box::new(TracingSelectionSink))
    }

    pub fn with_collaborators(forest: Forest, renderer: Box<dyn Renderer>, sink: Box<dyn SelectionSink>) -> Self {
        let mirror = Mirror::project(&forest);
        let mut engine = Self {
            forest,
            mirror,
            selection: SelectionState::default(),
            renderer,
            sink,
            versions: HashMap::new(),
            clock: 0,
            unconfirmed: HashSet::new(),
            policy: RollbackPolicy::default(),
        };
        engine.renderer.notify(&RenderEvent::Rebuilt {
            layers: engine.mirror.len(),
        });
        engine.refresh_checked();
        engine
    }

    pub fn with_policy(mut self, policy: RollbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn policy(&self) -> RollbackPolicy {
        self.policy
    }

    pub fn find(&self, id: &NodeId) -> Option<&Node> {
        self.forest.find(id)
    }

    /// Stamp of the last local mutation that touched `id`.
    pub fn version(&self, id: &NodeId) -> Option<u64> {
        self.versions.get(id).copied()
    }

    pub fn is_unconfirmed(&self, id: &NodeId) -> bool {
        self.unconfirmed.contains(id)
    }

    pub fn mark_unconfirmed(&mut self, id: &NodeId) {
        self.unconfirmed.insert(id.clone());
    }

    fn touch(&mut self, id: &NodeId) -> u64 {
        self.clock += 1;
        self.versions.insert(id.clone(), self.clock);
        self.clock
    }

    fn refresh_checked(&mut self) {
        self.selection.set_checked(self.mirror.visible_keys());
        self.sink.checked(self.selection.checked());
    }

    /// Rebuild the mirror from the primary tree.
    ///
    /// Layers that survive the rebuild keep their visibility flags; new ones
    /// take the projected default.
    pub fn resync(&mut self) {
        let flags = self.mirror.visibility_flags();
        self.rebuild();
        for (key, visible) in flags {
            self.mirror.set_visible(&key, visible);
        }
        self.refresh_checked();
    }

    fn rebuild(&mut self) {
        self.mirror = Mirror::project(&self.forest);
        self.renderer.notify(&RenderEvent::Rebuilt {
            layers: self.mirror.len(),
        });
    }

    /// Replace the primary tree with a fresh copy from the backend.
    ///
    /// Pending remote mutations lose their version stamps, so their late
    /// rollbacks become no-ops.
    pub fn reload(&mut self, forest: Forest) {
        self.forest = forest;
        self.versions.clear();
        self.unconfirmed.clear();
        self.selection.prune(&self.forest);
        tracing::info!(nodes = self.forest.len(), "tree reloaded");
        self.rebuild();
        self.refresh_checked();
    }

    /// Temporary id for the next child of `parent`: `"<parentId>-<childIndex>"`.
    ///
    /// Roots use `root` as the parent part; a `~n` suffix is added on collision.
    pub fn provisional_id(&self, parent: Option<&NodeId>) -> Result<NodeId> {
        let (base, count) = match parent {
            Some(pid) => {
                let node = self
                    .forest
                    .find(pid)
                    .ok_or_else(|| MapTreeError::NodeNotFound(pid.clone()))?;
                (pid.to_string(), node.children.len())
            }
            None => ("root".to_string(), self.forest.roots.len()),
        };
        let mut candidate = NodeId::from(format!("{}-{}", base, count));
        let mut n = 1;
        while self.forest.contains(&candidate) || self.mirror.contains(&candidate) {
            candidate = NodeId::from(format!("{}-{}~{}", base, count, n));
            n += 1;
        }
        Ok(candidate)
    }

    /// Append a new node under `parent` with a provisional id.
    pub fn add_node(&mut self, parent: Option<&NodeId>, attributes: &Properties, is_group: bool) -> Result<Node> {
        let id = self.provisional_id(parent)?;
        let node = Node::from_attributes(id.clone(), parent.cloned(), attributes, is_group);
        self.forest.add_child(parent, node.clone())?;

        let index = self
            .forest
            .siblings(parent)
            .map(|s| s.len().saturating_sub(1))
            .unwrap_or(0);
        let layer = project_node(&node, parent.cloned());
        if let Err(e) = self.mirror.insert_into(parent, index, layer) {
            self.forest.remove_node(&id);
            return Err(e);
        }

        self.renderer.notify(&added_event(&node, parent, index));
        self.touch(&id);
        self.refresh_checked();
        tracing::debug!(%id, parent = ?parent, "node added");
        Ok(node)
    }

    /// Put a provisional node under its permanent id in every structure.
    pub fn confirm_id(&mut self, provisional: &NodeId, permanent: &NodeId) -> Result<()> {
        self.forest.rekey(provisional, permanent)?;
        if let Err(e) = self.mirror.rekey(provisional, permanent) {
            tracing::warn!(%provisional, %permanent, error = %e, "mirror out of step, rebuilding");
            self.resync();
        }
        self.selection.rename(provisional, permanent);
        if let Some(v) = self.versions.remove(provisional) {
            self.versions.insert(permanent.clone(), v);
        }
        self.unconfirmed.remove(provisional);
        self.renderer.notify(&RenderEvent::Rekeyed {
            old: provisional.clone(),
            new: permanent.clone(),
        });
        tracing::debug!(%provisional, %permanent, "node confirmed");
        Ok(())
    }

    /// Remove a node (and its subtree) from both trees.
    pub fn remove_node(&mut self, id: &NodeId) -> Result<Removed> {
        let (parent, index) = self
            .forest
            .position_of(id)
            .ok_or_else(|| MapTreeError::NodeNotFound(id.clone()))?;
        let node = self
            .forest
            .remove_node(id)
            .ok_or_else(|| MapTreeError::NodeNotFound(id.clone()))?;
        let layer = self.mirror.remove_from(id);
        if layer.is_none() {
            tracing::warn!(%id, "removed node had no layer");
        }
        self.renderer.notify(&RenderEvent::Removed { key: id.clone() });

        for nid in subtree_ids(&node) {
            self.touch(&nid);
            self.unconfirmed.remove(&nid);
        }
        self.selection.prune(&self.forest);
        self.refresh_checked();
        tracing::debug!(%id, descendants = node.subtree_len() - 1, "node removed");
        Ok(Removed {
            node,
            parent,
            index,
            layer,
        })
    }

    /// Re-insert a removed subtree at its old place (or as a root if the old parent is gone).
    pub fn restore_removed(&mut self, removed: Removed) -> Result<()> {
        let parent = removed.parent.filter(|p| self.forest.contains(p));
        self.forest
            .insert_child_at(parent.as_ref(), removed.index, removed.node.clone())?;
        let index = self
            .forest
            .position_of(&removed.node.id)
            .map(|(_, i)| i)
            .unwrap_or(0);
        let layer = removed
            .layer
            .unwrap_or_else(|| project_node(&removed.node, parent.clone()));
        if let Err(e) = self.mirror.insert_into(parent.as_ref(), index, layer) {
            self.forest.remove_node(&removed.node.id);
            return Err(e);
        }

        self.renderer
            .notify(&added_event(&removed.node, parent.as_ref(), index));
        for nid in subtree_ids(&removed.node) {
            self.touch(&nid);
        }
        self.refresh_checked();
        tracing::debug!(id = %removed.node.id, "removal undone");
        Ok(())
    }

    /// Merge attributes into a node and its layer.
    ///
    /// Returns the pre-edit snapshot and the full merged attribute set.
    pub fn edit_node(&mut self, id: &NodeId, attributes: &Properties) -> Result<(EditSnapshot, Properties)> {
        let node = self
            .forest
            .find_mut(id)
            .ok_or_else(|| MapTreeError::NodeNotFound(id.clone()))?;
        let snapshot = EditSnapshot {
            id: id.clone(),
            title: node.title.clone(),
            kind: node.kind.clone(),
            properties: node.properties.clone(),
            layer_properties: self.mirror.find_by_key(id).map(|l| l.properties().clone()),
        };

        node.apply_attributes(attributes);
        let merged = node.attributes();
        let mut layer_props = node.properties.clone();
        layer_props.insert(
            "title".to_string(),
            serde_json::Value::String(node.title.clone()),
        );
        let source = match &node.kind {
            NodeKind::Leaf(source) => Some(source.clone()),
            NodeKind::Group => None,
        };

        self.mirror.merge_properties(id, &layer_props);
        if let Some(source) = &source {
            self.mirror.set_source(id, source);
        }
        self.renderer
            .notify(&RenderEvent::PropertiesChanged { key: id.clone() });
        self.touch(id);
        tracing::debug!(%id, "node edited");
        Ok((snapshot, merged))
    }

    /// Put a node back to its pre-edit state.
    pub fn restore_edit(&mut self, snapshot: EditSnapshot) -> Result<()> {
        let node = self
            .forest
            .find_mut(&snapshot.id)
            .ok_or_else(|| MapTreeError::NodeNotFound(snapshot.id.clone()))?;
        node.title = snapshot.title;
        node.kind = snapshot.kind.clone();
        node.properties = snapshot.properties;

        if let Some(props) = snapshot.layer_properties {
            self.mirror.replace_properties(&snapshot.id, props);
        }
        if let NodeKind::Leaf(source) = &snapshot.kind {
            self.mirror.set_source(&snapshot.id, source);
        }
        self.renderer.notify(&RenderEvent::PropertiesChanged {
            key: snapshot.id.clone(),
        });
        self.touch(&snapshot.id);
        tracing::debug!(id = %snapshot.id, "edit undone");
        Ok(())
    }

    /// Resolve a drop and move the dragged node in both trees.
    pub fn drop_node(&mut self, event: &DropEvent) -> Result<DropPlan> {
        let plan = reorder::resolve(&self.forest, event)?;
        self.apply_move(&plan.drag_id, plan.new_parent.as_ref(), plan.index)?;
        tracing::debug!(drag = %plan.drag_id, branch = ?plan.branch, index = plan.index, "node dropped");
        Ok(plan)
    }

    /// Move the dragged node back to where the plan found it.
    pub fn revert_drop(&mut self, plan: &DropPlan) -> Result<()> {
        let parent = plan
            .old_parent
            .as_ref()
            .filter(|p| self.forest.contains(p))
            .cloned();
        self.apply_move(&plan.drag_id, parent.as_ref(), plan.old_index)?;
        tracing::debug!(drag = %plan.drag_id, "drop undone");
        Ok(())
    }

    fn apply_move(&mut self, id: &NodeId, parent: Option<&NodeId>, index: usize) -> Result<()> {
        reorder::relocate(&mut self.forest, id, parent, index)?;
        let index = self
            .forest
            .position_of(id)
            .map(|(_, i)| i)
            .unwrap_or(index);

        let layer = match self.mirror.remove_from(id) {
            Some(layer) => layer,
            None => {
                let node = self
                    .forest
                    .find(id)
                    .ok_or_else(|| MapTreeError::NodeNotFound(id.clone()))?;
                project_node(node, parent.cloned())
            }
        };
        if let Err(e) = self.mirror.insert_into(parent, index, layer) {
            tracing::warn!(%id, error = %e, "mirror out of step, rebuilding");
            self.resync();
        } else {
            self.renderer.notify(&RenderEvent::Moved {
                key: id.clone(),
                parent: parent.cloned(),
                index,
            });
        }
        self.touch(id);
        Ok(())
    }

    /// Check or uncheck a node, cascading layer visibility.
    ///
    /// Returns the checked set afterwards.
    pub fn check(&mut self, id: &NodeId, checked: bool) -> Result<Vec<NodeId>> {
        if !self.forest.contains(id) {
            return Err(MapTreeError::NodeNotFound(id.clone()));
        }
        let changes = self.mirror.set_visibility(id, checked)?;
        for (key, visible) in changes {
            self.renderer
                .notify(&RenderEvent::VisibilityChanged { key, visible });
        }
        self.refresh_checked();
        Ok(self.selection.checked().to_vec())
    }

    /// Replace the selection and forward the selected nodes to the form sink.
    pub fn select(&mut self, ids: &[NodeId]) -> Vec<NodeId> {
        let selected = self.selection.select(ids, &self.forest).to_vec();
        let nodes: Vec<Node> = selected
            .iter()
            .filter_map(|id| self.forest.find(id).cloned())
            .collect();
        self.sink.selected(&nodes);
        selected
    }

    /// Verify that the mirror holds exactly one layer per node, in tree order,
    /// under the same parent.
    pub fn check_consistency(&self) -> Result<()> {
        let ids = self.forest.ids();
        let keys = self.mirror.keys();
        if ids != keys || self.mirror.len() != ids.len() {
            return Err(MapTreeError::StructuralViolation(format!(
                "mirror has {} layers for {} nodes",
                self.mirror.len(),
                ids.len()
            )));
        }
        for node in self.forest.flatten() {
            let expected = self.forest.find_parent(&node.id).map(|p| &p.id);
            if self.mirror.parent_of(&node.id) != expected {
                return Err(MapTreeError::StructuralViolation(format!(
                    "layer {} sits under the wrong group",
                    node.id
                )));
            }
            let layer = self
                .mirror
                .find_by_key(&node.id)
                .ok_or_else(|| MapTreeError::NodeNotFound(node.id.clone()))?;
            if layer.is_group() == node.is_leaf() {
                return Err(MapTreeError::StructuralViolation(format!(
                    "layer {} has the wrong kind",
                    node.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reorder::Placement;
    use crate::mirror::RecordingRenderer;
    use crate::tree::node::tests::sample_forest;
    use crate::tree::LeafSource;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        selected: Arc<Mutex<Vec<NodeId>>>,
    }

    impl SelectionSink for RecordingSink {
        fn selected(&mut self, nodes: &[Node]) {
            *self.selected.lock().unwrap() = nodes.iter().map(|n| n.id.clone()).collect();
        }

        fn checked(&mut self, _ids: &[NodeId]) {}
    }

    fn attrs(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    fn engine_with_recorder(forest: Forest) -> (TreeEngine, RecordingRenderer) {
        let recorder = RecordingRenderer::new();
        let engine = TreeEngine::with_collaborators(
            forest,
            Box::new(recorder.clone()),
            Box::new(TracingSelectionSink),
        );
        (engine, recorder)
    }

    #[test]
    fn add_uses_provisional_id_scheme() {
        let mut engine = TreeEngine::new(sample_forest());
        let node = engine
            .add_node(Some(&"C".into()), &attrs(json!({ "title": "Lakes" })), false)
            .unwrap();
        assert_eq!(node.id, NodeId::from("C-1"));
        assert_eq!(node.parent_id, Some(NodeId::from("C")));
        let root = engine.add_node(None, &attrs(json!({ "title": "New" })), true).unwrap();
        assert_eq!(root.id, NodeId::from("root-2"));
        engine.check_consistency().unwrap();
    }

    #[test]
    fn provisional_id_avoids_collisions() {
        let mut engine = TreeEngine::new(Forest::new(vec![Node::group("A", "a")
            .with_child(Node::leaf("A-1", "taken", LeafSource::default()))]));
        let node = engine
            .add_node(Some(&"A".into()), &attrs(json!({ "title": "x" })), false)
            .unwrap();
        assert_eq!(node.id, NodeId::from("A-1~1"));
    }

    #[test]
    fn add_under_leaf_is_violation_and_leaves_trees_alone() {
        let mut engine = TreeEngine::new(sample_forest());
        let err = engine
            .add_node(Some(&"B".into()), &attrs(json!({ "title": "x" })), false)
            .unwrap_err();
        assert!(matches!(err, MapTreeError::StructuralViolation(_)));
        assert_eq!(engine.forest().len(), 5);
        engine.check_consistency().unwrap();
    }

    #[test]
    fn add_notifies_renderer() {
        let (mut engine, recorder) = engine_with_recorder(sample_forest());
        recorder.clear();
        engine
            .add_node(Some(&"E".into()), &attrs(json!({ "title": "Parcels" })), false)
            .unwrap();
        assert_eq!(
            recorder.events(),
            vec![RenderEvent::LeafAdded {
                key: "E-0".into(),
                parent: Some("E".into()),
                index: 0
            }]
        );
    }

    #[test]
    fn remove_splices_both_trees_and_prunes_selection() {
        let mut engine = TreeEngine::new(sample_forest());
        engine.select(&[NodeId::from("D")]);
        let removed = engine.remove_node(&"C".into()).unwrap();
        assert_eq!(removed.parent, Some(NodeId::from("A")));
        assert_eq!(removed.index, 1);
        assert!(engine.mirror().find_by_key(&"D".into()).is_none());
        assert!(engine.selection().selected().is_empty());
        engine.check_consistency().unwrap();

        engine.restore_removed(removed).unwrap();
        assert_eq!(engine.forest().ids(), sample_forest().ids());
        engine.check_consistency().unwrap();
    }

    #[test]
    fn remove_root_uses_forest_as_container() {
        let mut engine = TreeEngine::new(sample_forest());
        engine.remove_node(&"E".into()).unwrap();
        assert_eq!(engine.mirror().roots().len(), 1);
        engine.check_consistency().unwrap();
    }

    #[test]
    fn edit_merges_into_layer_and_restores() {
        let mut engine = TreeEngine::new(sample_forest());
        let (snapshot, merged) = engine
            .edit_node(&"B".into(), &attrs(json!({ "title": "Roads", "opacity": 0.4, "format": "image/jpeg" })))
            .unwrap();
        assert_eq!(merged.get("title"), Some(&json!("Roads")));
        assert_eq!(merged.get("format"), Some(&json!("image/jpeg")));
        let layer = engine.mirror().find_by_key(&"B".into()).unwrap();
        assert_eq!(layer.properties().get("title"), Some(&json!("Roads")));
        assert_eq!(layer.properties().get("opacity"), Some(&json!(0.4)));
        match layer {
            PresentationNode::Leaf(l) => assert_eq!(l.source.format.as_deref(), Some("image/jpeg")),
            PresentationNode::Group(_) => panic!("expected leaf layer"),
        }

        engine.restore_edit(snapshot).unwrap();
        assert_eq!(engine.find(&"B".into()).unwrap().title, "Streets");
        let layer = engine.mirror().find_by_key(&"B".into()).unwrap();
        assert!(layer.properties().get("opacity").is_none());
    }

    #[test]
    fn drop_updates_both_trees() {
        let forest = Forest::new(vec![Node::group("A", "a")
            .with_child(Node::leaf("B", "b", LeafSource::default()))
            .with_child(Node::group("C", "c"))]);
        let mut engine = TreeEngine::new(forest);
        let event = DropEvent::for_placement(engine.forest(), &"B".into(), &"C".into(), Placement::Inside).unwrap();
        let plan = engine.drop_node(&event).unwrap();
        assert_eq!(engine.mirror().parent_of(&"B".into()), Some(&NodeId::from("C")));
        engine.check_consistency().unwrap();

        engine.revert_drop(&plan).unwrap();
        assert_eq!(engine.mirror().parent_of(&"B".into()), Some(&NodeId::from("A")));
        assert_eq!(engine.mirror().index_of(&"B".into()), Some(0));
        engine.check_consistency().unwrap();
    }

    #[test]
    fn check_cascades_and_updates_checked_set() {
        let (mut engine, recorder) = engine_with_recorder(sample_forest());
        recorder.clear();
        let checked = engine.check(&"A".into(), false).unwrap();
        assert_eq!(checked, vec![NodeId::from("E")]);
        assert!(recorder
            .events()
            .contains(&RenderEvent::VisibilityChanged { key: "D".into(), visible: false }));

        let checked = engine.check(&"D".into(), true).unwrap();
        assert_eq!(
            checked,
            vec![NodeId::from("A"), NodeId::from("C"), NodeId::from("D"), NodeId::from("E")]
        );
    }

    #[test]
    fn select_forwards_nodes_to_sink() {
        let sink = RecordingSink::default();
        let mut engine = TreeEngine::with_collaborators(
            sample_forest(),
            Box::new(TracingRenderer),
            Box::new(sink.clone()),
        );
        let selected = engine.select(&[NodeId::from("B"), NodeId::from("ghost")]);
        assert_eq!(selected, vec![NodeId::from("B")]);
        assert_eq!(*sink.selected.lock().unwrap(), vec![NodeId::from("B")]);
    }

    #[test]
    fn confirm_id_rekeys_everything() {
        let mut engine = TreeEngine::new(sample_forest());
        let node = engine
            .add_node(Some(&"E".into()), &attrs(json!({ "title": "g" })), true)
            .unwrap();
        engine
            .add_node(Some(&node.id), &attrs(json!({ "title": "leaf" })), false)
            .unwrap();
        engine.select(&[node.id.clone()]);
        engine.confirm_id(&node.id, &"500".into()).unwrap();

        assert!(!engine.forest().contains(&node.id));
        let child = engine.find(&"E-0-0".into()).unwrap();
        assert_eq!(child.parent_id, Some(NodeId::from("500")));
        assert_eq!(engine.mirror().parent_of(&"E-0-0".into()), Some(&NodeId::from("500")));
        assert_eq!(engine.selection().selected(), &[NodeId::from("500")]);
        assert!(engine.version(&"500".into()).is_some());
        engine.check_consistency().unwrap();
    }

    #[test]
    fn reload_clears_versions_and_rebuilds() {
        let (mut engine, recorder) = engine_with_recorder(sample_forest());
        engine.edit_node(&"B".into(), &attrs(json!({ "title": "x" }))).unwrap();
        engine.mark_unconfirmed(&"B".into());
        recorder.clear();
        engine.reload(sample_forest());
        assert!(engine.version(&"B".into()).is_none());
        assert!(!engine.is_unconfirmed(&"B".into()));
        assert_eq!(recorder.events(), vec![RenderEvent::Rebuilt { layers: 5 }]);
    }

    #[test]
    fn mirror_stays_consistent_over_mixed_sequence() {
        let mut engine = TreeEngine::new(sample_forest());
        let g = engine.add_node(None, &attrs(json!({ "title": "G" })), true).unwrap();
        let l = engine.add_node(Some(&g.id), &attrs(json!({ "title": "L" })), false).unwrap();
        engine.check_consistency().unwrap();

        let event = DropEvent::for_placement(engine.forest(), &"C".into(), &g.id, Placement::Inside).unwrap();
        engine.drop_node(&event).unwrap();
        engine.check_consistency().unwrap();

        let event = DropEvent::for_placement(engine.forest(), &"B".into(), &l.id, Placement::After).unwrap();
        engine.drop_node(&event).unwrap();
        engine.check_consistency().unwrap();

        engine.edit_node(&"D".into(), &attrs(json!({ "title": "Rivers 2" }))).unwrap();
        engine.remove_node(&"A".into()).unwrap();
        engine.check_consistency().unwrap();

        let ids: Vec<String> = engine.forest().ids().iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["E", "root-2", "C", "D", "root-2-0", "B"]);
    }

    #[test]
    fn resync_keeps_cascaded_visibility() {
        let mut engine = TreeEngine::new(sample_forest());
        engine.check(&"A".into(), false).unwrap();
        let checked = engine.selection().checked().to_vec();
        assert_eq!(checked, vec![NodeId::from("E")]);

        engine.resync();
        for key in ["A", "B", "C", "D"] {
            assert!(!engine.mirror().find_by_key(&key.into()).unwrap().visible(), "{} shown again", key);
        }
        assert_eq!(engine.selection().checked(), checked.as_slice());
        engine.check_consistency().unwrap();
    }

    #[test]
    fn reload_takes_visibility_from_fresh_tree() {
        let mut engine = TreeEngine::new(sample_forest());
        engine.check(&"A".into(), false).unwrap();
        engine.reload(sample_forest());
        assert_eq!(engine.selection().checked().len(), 5);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Add { parent: usize, group: bool },
        AddRoot,
        Remove(usize),
        Edit(usize),
        Drop { drag: usize, target: usize, placement: Placement, expanded: bool },
        Check(usize, bool),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (any::<usize>(), any::<bool>()).prop_map(|(parent, group)| Step::Add { parent, group }),
            Just(Step::AddRoot),
            any::<usize>().prop_map(Step::Remove),
            any::<usize>().prop_map(Step::Edit),
            (
                any::<usize>(),
                any::<usize>(),
                prop_oneof![Just(Placement::Before), Just(Placement::After), Just(Placement::Inside)],
                any::<bool>(),
            )
                .prop_map(|(drag, target, placement, expanded)| Step::Drop { drag, target, placement, expanded }),
            (any::<usize>(), any::<bool>()).prop_map(|(i, on)| Step::Check(i, on)),
        ]
    }

    fn pick(engine: &TreeEngine, i: usize) -> Option<NodeId> {
        let ids = engine.forest().ids();
        if ids.is_empty() {
            None
        } else {
            Some(ids[i % ids.len()].clone())
        }
    }

    proptest! {
        #[test]
        fn random_sequences_keep_trees_in_step(steps in proptest::collection::vec(step(), 1..40)) {
            let mut engine = TreeEngine::new(sample_forest());
            for step in steps {
                match step {
                    Step::Add { parent, group } => {
                        if let Some(pid) = pick(&engine, parent) {
                            let _ = engine.add_node(Some(&pid), &attrs(json!({ "title": "n" })), group);
                        }
                    }
                    Step::AddRoot => {
                        engine.add_node(None, &attrs(json!({ "title": "r" })), true).unwrap();
                    }
                    Step::Remove(i) => {
                        if let Some(id) = pick(&engine, i) {
                            engine.remove_node(&id).unwrap();
                        }
                    }
                    Step::Edit(i) => {
                        if let Some(id) = pick(&engine, i) {
                            engine.edit_node(&id, &attrs(json!({ "title": "e" }))).unwrap();
                        }
                    }
                    Step::Drop { drag, target, placement, expanded } => {
                        if let (Some(drag), Some(target)) = (pick(&engine, drag), pick(&engine, target)) {
                            let before = engine.forest().len();
                            let mut event = DropEvent::for_placement(engine.forest(), &drag, &target, placement).unwrap();
                            event.target_expanded = expanded;
                            let _ = engine.drop_node(&event);
                            prop_assert_eq!(engine.forest().len(), before);
                            prop_assert_eq!(engine.mirror().len(), before);
                        }
                    }
                    Step::Check(i, on) => {
                        if let Some(id) = pick(&engine, i) {
                            engine.check(&id, on).unwrap();
                        }
                    }
                }
                prop_assert!(engine.check_consistency().is_ok());
                let checked: HashSet<NodeId> = engine.selection().checked().iter().cloned().collect();
                let visible: HashSet<NodeId> = engine.mirror().visible_keys().into_iter().collect();
                prop_assert_eq!(checked, visible);
            }
        }
    }
}
