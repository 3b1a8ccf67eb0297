use crate::error::{MapTreeError, Result};
use crate::mirror::{Mirror, PresentationNode};
use crate::tree::NodeId;

fn cascade_down(layer: &mut PresentationNode, visible: bool, changed: &mut Vec<(NodeId, bool)>) {
    if layer.visible() != visible {
        layer.set_visible_flag(visible);
        changed.push((layer.key().clone(), visible));
    }
    if let PresentationNode::Group(g) = layer {
        for child in g.children.iter_mut() {
            cascade_down(child, visible, changed);
        }
    }
}

impl Mirror {
    /// Toggle a layer and propagate the change.
    ///
    /// Groups push the flag down to every descendant. Showing a leaf also
    /// shows every enclosing group up to the top level; hiding a leaf leaves
    /// its ancestors alone. Returns the flags that actually changed, in the
    /// order they were applied.
    pub fn set_visibility(&mut self, key: &NodeId, visible: bool) -> Result<Vec<(NodeId, bool)>> {
        let layer = self
            .find_by_key_mut(key)
            .ok_or_else(|| MapTreeError::NodeNotFound(key.clone()))?;

        let mut changed = Vec::new();
        let is_leaf = !layer.is_group();
        cascade_down(layer, visible, &mut changed);

        if is_leaf && visible {
            for ancestor in self.ancestors(key) {
                if let Some(group) = self.find_by_key_mut(&ancestor) {
                    if !group.visible() {
                        group.set_visible_flag(true);
                        changed.push((ancestor, true));
                    }
                }
            }
        }

        tracing::debug!(%key, visible, changed = changed.len(), "visibility cascade");
        Ok(changed)
    }

    /// Keys of every layer currently flagged visible, in pre-order.
    pub fn visible_keys(&self) -> Vec<NodeId> {
        fn walk(nodes: &[PresentationNode], out: &mut Vec<NodeId>) {
            for node in nodes {
                if node.visible() {
                    out.push(node.key().clone());
                }
                walk(node.children(), out);
            }
        }
        let mut out = Vec::new();
        walk(self.roots(), &mut out);
        out
    }

    /// Every layer's visibility flag, in pre-order.
    pub fn visibility_flags(&self) -> Vec<(NodeId, bool)> {
        fn walk(nodes: &[PresentationNode], out: &mut Vec<(NodeId, bool)>) {
            for node in nodes {
                out.push((node.key().clone(), node.visible()));
                walk(node.children(), out);
            }
        }
        let mut out = Vec::new();
        walk(self.roots(), &mut out);
        out
    }
}
