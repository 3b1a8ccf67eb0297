use crate::tree::{Forest, Node, NodeId};

/// Form-side collaborator told about selection and check changes.
pub trait SelectionSink: Send {
    fn selected(&mut self, nodes: &[Node]);
    fn checked(&mut self, ids: &[NodeId]);
}

/// Sink that only logs.
#[derive(Debug, Default)]
pub struct TracingSelectionSink;

impl SelectionSink for TracingSelectionSink {
    fn selected(&mut self, nodes: &[Node]) {
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        tracing::debug!(?ids, "selection changed");
    }

    fn checked(&mut self, ids: &[NodeId]) {
        tracing::debug!(count = ids.len(), "checked set changed");
    }
}

/// Selected and checked node ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    selected: Vec<NodeId>,
    checked: Vec<NodeId>,
}

impl SelectionState {
    pub fn selected(&self) -> &[NodeId] {
        &self.selected
    }

    pub fn checked(&self) -> &[NodeId] {
        &self.checked
    }

    pub fn is_selected(&self, id: &NodeId) -> bool {
        self.selected.contains(id)
    }

    pub fn is_checked(&self, id: &NodeId) -> bool {
        self.checked.contains(id)
    }

    /// Replace the selection, dropping ids that are not in `forest` and duplicates.
    pub fn select(&mut self, ids: &[NodeId], forest: &Forest) -> &[NodeId] {
        self.selected.clear();
        for id in ids {
            if forest.contains(id) && !self.selected.contains(id) {
                self.selected.push(id.clone());
            }
        }
        &self.selected
    }

    pub fn set_checked(&mut self, ids: Vec<NodeId>) {
        self.checked = ids;
    }

    /// Forget ids that no longer exist.
    pub fn prune(&mut self, forest: &Forest) {
        self.selected.retain(|id| forest.contains(id));
        self.checked.retain(|id| forest.contains(id));
    }

    pub fn rename(&mut self, old: &NodeId, new: &NodeId) {
        for id in self.selected.iter_mut().chain(self.checked.iter_mut()) {
            if id == old {
                *id = new.clone();
            }
        }
    }
}
