//! Presentation hierarchy mirrored from the primary resource tree.
//!
//! The renderer draws from this tree, so it must track the primary tree
//! through every add/remove/edit/move. Layers only link downward; the
//! `parents` side table answers upward queries without re-searching.

pub mod renderer;
pub mod visibility;

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{MapTreeError, Result};
use crate::tree::{Forest, LeafSource, Node, NodeId, NodeKind, Properties};

pub use renderer::{RecordingRenderer, RenderEvent, Renderer, TracingRenderer};

/// Renderable group of layers.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupLayer {
    pub key: NodeId,
    /// Key of the enclosing group, `None` at top level.
    pub parent: Option<NodeId>,
    pub visible: bool,
    pub properties: Properties,
    pub children: Vec<PresentationNode>,
}

/// Renderable leaf layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafLayer {
    pub key: NodeId,
    pub parent: Option<NodeId>,
    pub visible: bool,
    pub properties: Properties,
    pub source: LeafSource,
}

/// One entry of the presentation hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub enum PresentationNode {
    Group(GroupLayer),
    Leaf(LeafLayer),
}

impl PresentationNode {
    pub fn key(&self) -> &NodeId {
        match self {
            PresentationNode::Group(g) => &g.key,
            PresentationNode::Leaf(l) => &l.key,
        }
    }

    pub fn parent(&self) -> Option<&NodeId> {
        match self {
            PresentationNode::Group(g) => g.parent.as_ref(),
            PresentationNode::Leaf(l) => l.parent.as_ref(),
        }
    }

    fn set_parent(&mut self, parent: Option<NodeId>) {
        match self {
            PresentationNode::Group(g) => g.parent = parent,
            PresentationNode::Leaf(l) => l.parent = parent,
        }
    }

    pub fn visible(&self) -> bool {
        match self {
            PresentationNode::Group(g) => g.visible,
            PresentationNode::Leaf(l) => l.visible,
        }
    }

    pub(crate) fn set_visible_flag(&mut self, visible: bool) {
        match self {
            PresentationNode::Group(g) => g.visible = visible,
            PresentationNode::Leaf(l) => l.visible = visible,
        }
    }

    pub fn properties(&self) -> &Properties {
        match self {
            PresentationNode::Group(g) => &g.properties,
            PresentationNode::Leaf(l) => &l.properties,
        }
    }

    /// Ordered children; always empty for leaves.
    pub fn children(&self) -> &[PresentationNode] {
        match self {
            PresentationNode::Group(g) => &g.children,
            PresentationNode::Leaf(_) => &[],
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, PresentationNode::Group(_))
    }

    /// Whether this layer was projected from node `uid`.
    pub fn match_by_uid(&self, uid: &NodeId) -> bool {
        self.key() == uid
    }

    fn collect_keys(&self, out: &mut Vec<NodeId>) {
        out.push(self.key().clone());
        for child in self.children() {
            child.collect_keys(out);
        }
    }
}

fn layer_properties(node: &Node) -> Properties {
    let mut props = node.properties.clone();
    props.insert("title".to_string(), Value::String(node.title.clone()));
    props
}

fn initial_visibility(node: &Node) -> bool {
    node.properties
        .get("visible")
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

/// Build an empty group layer for `node`.
pub fn create_group(node: &Node, parent: Option<NodeId>) -> PresentationNode {
    PresentationNode::Group(GroupLayer {
        key: node.id.clone(),
        parent,
        visible: initial_visibility(node),
        properties: layer_properties(node),
        children: Vec::new(),
    })
}

/// Build a leaf layer for `node` with the given rendering parameters.
pub fn create_leaf(node: &Node, source: &LeafSource, parent: Option<NodeId>) -> PresentationNode {
    PresentationNode::Leaf(LeafLayer {
        key: node.id.clone(),
        parent,
        visible: initial_visibility(node),
        properties: layer_properties(node),
        source: source.clone(),
    })
}

/// Project a node and its whole subtree.
pub fn project_node(node: &Node, parent: Option<NodeId>) -> PresentationNode {
    match &node.kind {
        NodeKind::Leaf(source) => create_leaf(node, source, parent),
        NodeKind::Group => {
            let mut layer = create_group(node, parent);
            if let PresentationNode::Group(g) = &mut layer {
                g.children = node
                    .children
                    .iter()
                    .map(|child| project_node(child, Some(node.id.clone())))
                    .collect();
            }
            layer
        }
    }
}

fn collect_index(layer: &PresentationNode, parent: Option<NodeId>, out: &mut Vec<(NodeId, Option<NodeId>)>) {
    out.push((layer.key().clone(), parent));
    for child in layer.children() {
        collect_index(child, Some(layer.key().clone()), out);
    }
}

/// The presentation forest plus its `key -> parent key` index.
#[derive(Debug, Clone, Default)]
pub struct Mirror {
    roots: Vec<PresentationNode>,
    parents: HashMap<NodeId, Option<NodeId>>,
}

impl Mirror {
    /// Full rebuild from the primary tree.
    pub fn project(forest: &Forest) -> Self {
        let mut mirror = Mirror::default();
        for root in &forest.roots {
            let layer = project_node(root, None);
            mirror.index_subtree(&layer, None);
            mirror.roots.push(layer);
        }
        mirror
    }

    pub fn roots(&self) -> &[PresentationNode] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn contains(&self, key: &NodeId) -> bool {
        self.parents.contains_key(key)
    }

    /// All keys in pre-order.
    pub fn keys(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for root in &self.roots {
            root.collect_keys(&mut out);
        }
        out
    }

    /// Key of the group containing `key`; `None` for top-level or unknown keys.
    pub fn parent_of(&self, key: &NodeId) -> Option<&NodeId> {
        self.parents.get(key).and_then(Option::as_ref)
    }

    /// Chain of enclosing group keys from the direct parent up to the top level.
    pub fn ancestors(&self, key: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent_of(key);
        while let Some(parent) = current {
            out.push(parent.clone());
            current = self.parent_of(parent);
        }
        out
    }

    fn path_to(&self, key: &NodeId) -> Option<Vec<NodeId>> {
        if !self.contains(key) {
            return None;
        }
        let mut path = self.ancestors(key);
        path.reverse();
        path.push(key.clone());
        Some(path)
    }

    /// Find a layer by key.
    pub fn find_by_key(&self, key: &NodeId) -> Option<&PresentationNode> {
        let path = self.path_to(key)?;
        let mut level: &[PresentationNode] = &self.roots;
        let mut found = None;
        for step in &path {
            let node = level.iter().find(|n| n.match_by_uid(step))?;
            level = node.children();
            found = Some(node);
        }
        found
    }

    pub(crate) fn find_by_key_mut(&mut self, key: &NodeId) -> Option<&mut PresentationNode> {
        let path = self.path_to(key)?;
        let mut level: &mut Vec<PresentationNode> = &mut self.roots;
        let (last, parents) = path.split_last()?;
        for step in parents {
            let node = level.iter_mut().find(|n| n.match_by_uid(step))?;
            level = match node {
                PresentationNode::Group(g) => &mut g.children,
                PresentationNode::Leaf(_) => return None,
            };
        }
        level.iter_mut().find(|n| n.match_by_uid(last))
    }

    /// The group itself if `key` names a group, else the nearest enclosing group.
    pub fn find_enclosing_group(&self, key: &NodeId) -> Option<&PresentationNode> {
        let node = self.find_by_key(key)?;
        if node.is_group() {
            return Some(node);
        }
        self.find_by_key(self.parent_of(key)?)
    }

    /// Children of `group` (`None` = top level).
    pub fn children_of(&self, group: Option<&NodeId>) -> Option<&[PresentationNode]> {
        match group {
            None => Some(&self.roots),
            Some(key) => match self.find_by_key(key)? {
                PresentationNode::Group(g) => Some(&g.children),
                PresentationNode::Leaf(_) => None,
            },
        }
    }

    fn children_mut(&mut self, group: Option<&NodeId>) -> Result<&mut Vec<PresentationNode>> {
        match group {
            None => Ok(&mut self.roots),
            Some(key) => match self.find_by_key_mut(key) {
                Some(PresentationNode::Group(g)) => Ok(&mut g.children),
                Some(PresentationNode::Leaf(_)) => Err(MapTreeError::StructuralViolation(format!(
                    "layer {} is not a group",
                    key
                ))),
                None => Err(MapTreeError::NodeNotFound(key.clone())),
            },
        }
    }

    /// Insert `layer` into `group` at `index` (clamped).
    pub fn insert_into(&mut self, group: Option<&NodeId>, index: usize, mut layer: PresentationNode) -> Result<()> {
        let mut incoming = Vec::new();
        layer.collect_keys(&mut incoming);
        if let Some(dup) = incoming.iter().find(|k| self.contains(k)) {
            return Err(MapTreeError::StructuralViolation(format!(
                "layer {} already present",
                dup
            )));
        }
        let parent = group.cloned();
        layer.set_parent(parent.clone());
        let mut entries = Vec::new();
        collect_index(&layer, parent, &mut entries);

        let siblings = self.children_mut(group)?;
        let index = index.min(siblings.len());
        siblings.insert(index, layer);
        self.parents.extend(entries);
        Ok(())
    }

    /// Detach the layer `key` (with its subtree) from its containing group.
    pub fn remove_from(&mut self, key: &NodeId) -> Option<PresentationNode> {
        if !self.contains(key) {
            return None;
        }
        let container = self.parent_of(key).cloned();
        let siblings = self.children_mut(container.as_ref()).ok()?;
        let pos = siblings.iter().position(|n| n.key() == key)?;
        let removed = siblings.remove(pos);
        self.unindex_subtree(&removed);
        Some(removed)
    }

    /// Replace the children of `group` wholesale.
    pub fn set_children(&mut self, group: Option<&NodeId>, children: Vec<PresentationNode>) -> Result<()> {
        let old = std::mem::take(self.children_mut(group)?);
        for layer in &old {
            self.unindex_subtree(layer);
        }
        let parent = group.cloned();
        let mut children = children;
        for layer in children.iter_mut() {
            layer.set_parent(parent.clone());
            self.index_subtree(layer, parent.clone());
        }
        *self.children_mut(group)? = children;
        Ok(())
    }

    /// Index of `key` among its siblings.
    pub fn index_of(&self, key: &NodeId) -> Option<usize> {
        let siblings = self.children_of(self.parent_of(key))?;
        siblings.iter().position(|n| n.key() == key)
    }

    /// Merge attributes into a layer's properties in place.
    pub fn merge_properties(&mut self, key: &NodeId, attributes: &Properties) -> bool {
        let Some(layer) = self.find_by_key_mut(key) else {
            return false;
        };
        let props = match layer {
            PresentationNode::Group(g) => &mut g.properties,
            PresentationNode::Leaf(l) => &mut l.properties,
        };
        for (k, v) in attributes {
            props.insert(k.clone(), v.clone());
        }
        true
    }

    /// Overwrite a layer's properties wholesale.
    pub fn replace_properties(&mut self, key: &NodeId, properties: Properties) -> bool {
        match self.find_by_key_mut(key) {
            Some(PresentationNode::Group(g)) => {
                g.properties = properties;
                true
            }
            Some(PresentationNode::Leaf(l)) => {
                l.properties = properties;
                true
            }
            None => false,
        }
    }

    /// Replace a leaf's rendering parameters.
    pub fn set_source(&mut self, key: &NodeId, source: &LeafSource) -> bool {
        match self.find_by_key_mut(key) {
            Some(PresentationNode::Leaf(l)) => {
                l.source = source.clone();
                true
            }
            _ => false,
        }
    }

    /// Set a single layer's visibility flag without cascading.
    pub fn set_visible(&mut self, key: &NodeId, visible: bool) -> bool {
        match self.find_by_key_mut(key) {
            Some(layer) => {
                layer.set_visible_flag(visible);
                true
            }
            None => false,
        }
    }

    /// Give layer `old` the key `new`.
    pub fn rekey(&mut self, old: &NodeId, new: &NodeId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.contains(new) {
            return Err(MapTreeError::StructuralViolation(format!(
                "layer {} already present",
                new
            )));
        }
        let layer = self
            .find_by_key_mut(old)
            .ok_or_else(|| MapTreeError::NodeNotFound(old.clone()))?;
        let child_keys: Vec<NodeId> = match layer {
            PresentationNode::Group(g) => {
                g.key = new.clone();
                for child in g.children.iter_mut() {
                    child.set_parent(Some(new.clone()));
                }
                g.children.iter().map(|c| c.key().clone()).collect()
            }
            PresentationNode::Leaf(l) => {
                l.key = new.clone();
                Vec::new()
            }
        };
        let parent = self.parents.remove(old).flatten();
        self.parents.insert(new.clone(), parent);
        for child in child_keys {
            self.parents.insert(child, Some(new.clone()));
        }
        Ok(())
    }

    fn index_subtree(&mut self, layer: &PresentationNode, parent: Option<NodeId>) {
        let mut entries = Vec::new();
        collect_index(layer, parent, &mut entries);
        self.parents.extend(entries);
    }

    fn unindex_subtree(&mut self, layer: &PresentationNode) {
        self.parents.remove(layer.key());
        for child in layer.children() {
            self.unindex_subtree(child);
        }
    }
}
