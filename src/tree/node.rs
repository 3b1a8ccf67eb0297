use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{MapTreeError, Result};

/// Open attribute map carried by every node and sent to the repository.
pub type Properties = Map<String, Value>;

/// Opaque node key.
///
/// Backends hand out either strings or integers; both are normalized to their
/// decimal/string form so `7` and `"7"` name the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl From<u64> for NodeId {
    fn from(n: u64) -> Self {
        NodeId(n.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Str(s) => NodeId(s),
            Raw::Num(n) => NodeId(n.to_string()),
        })
    }
}

/// Rendering parameters of a leaf resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafSource {
    /// Addressable resource locator (service endpoint, tile template, ...).
    pub url: Option<String>,
    pub format: Option<String>,
    pub style: Option<String>,
    /// Server-side layer names.
    pub layers: Option<String>,
}

impl LeafSource {
    /// Lift the rendering keys out of an attribute map, leaving the rest in place.
    ///
    /// `source_url` takes precedence over `url`. Non-string values stay in the map.
    pub fn take_from(props: &mut Properties) -> Self {
        let mut take = |key: &str| {
            if !matches!(props.get(key), Some(Value::String(_))) {
                return None;
            }
            match props.remove(key) {
                Some(Value::String(s)) => Some(s),
                _ => None,
            }
        };
        let source_url = take("source_url");
        let url = take("url");
        LeafSource {
            url: source_url.or(url),
            format: take("format"),
            style: take("style"),
            layers: take("layers"),
        }
    }

    /// Write the rendering keys back into an attribute map.
    pub fn write_into(&self, props: &mut Properties) {
        let fields = [
            ("source_url", &self.url),
            ("format", &self.format),
            ("style", &self.style),
            ("layers", &self.layers),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                props.insert(key.to_string(), Value::String(v.clone()));
            }
        }
    }
}

/// What a node is: a nesting group or a renderable leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Leaf(LeafSource),
}

/// One entry of the primary resource tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// Protocol-level parent reference; traversal never relies on it.
    pub parent_id: Option<NodeId>,
    pub title: String,
    pub kind: NodeKind,
    pub properties: Properties,
    pub children: Vec<Node>,
}

impl Node {
    /// Create an empty group node.
    pub fn group(id: impl Into<NodeId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            kind: NodeKind::Group,
            properties: Properties::new(),
            children: Vec::new(),
        }
    }

    /// Create a leaf node.
    pub fn leaf(id: impl Into<NodeId>, title: impl Into<String>, source: LeafSource) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            kind: NodeKind::Leaf(source),
            properties: Properties::new(),
            children: Vec::new(),
        }
    }

    /// Build a node from a user or backend attribute map.
    ///
    /// `title` (or `name`) becomes the label; rendering keys of leaves are
    /// lifted into [`LeafSource`]; everything else stays in `properties`.
    pub fn from_attributes(id: NodeId, parent_id: Option<NodeId>, attributes: &Properties, is_group: bool) -> Self {
        let mut properties = attributes.clone();
        let title = match properties.remove("title").or_else(|| properties.remove("name")) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let kind = if is_group {
            NodeKind::Group
        } else {
            NodeKind::Leaf(LeafSource::take_from(&mut properties))
        };
        Self {
            id,
            parent_id,
            title,
            kind,
            properties,
            children: Vec::new(),
        }
    }

    /// Append a child, fixing its `parent_id`. Builder used for fixtures.
    pub fn with_child(mut self, mut child: Node) -> Self {
        child.parent_id = Some(self.id.clone());
        self.children.push(child);
        self
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    /// The full attribute set as the repository sees it.
    pub fn attributes(&self) -> Properties {
        let mut attrs = self.properties.clone();
        attrs.insert("title".to_string(), Value::String(self.title.clone()));
        attrs.insert("is_leaf".to_string(), Value::Bool(self.is_leaf()));
        if let NodeKind::Leaf(source) = &self.kind {
            source.write_into(&mut attrs);
        }
        attrs
    }

    /// Merge an attribute map into this node (title, leaf source, properties).
    pub fn apply_attributes(&mut self, attributes: &Properties) {
        let mut incoming = attributes.clone();
        incoming.remove("is_leaf");
        match incoming.remove("title").or_else(|| incoming.remove("name")) {
            Some(Value::String(s)) => self.title = s,
            Some(other) => self.title = other.to_string(),
            None => {}
        }
        if let NodeKind::Leaf(source) = &mut self.kind {
            let update = LeafSource::take_from(&mut incoming);
            if update.url.is_some() {
                source.url = update.url;
            }
            if update.format.is_some() {
                source.format = update.format;
            }
            if update.style.is_some() {
                source.style = update.style;
            }
            if update.layers.is_some() {
                source.layers = update.layers;
            }
        }
        for (key, value) in incoming {
            self.properties.insert(key, value);
        }
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(Node::subtree_len).sum::<usize>()
    }

    fn collect_ids(&self, out: &mut Vec<NodeId>) {
        out.push(self.id.clone());
        for child in &self.children {
            child.collect_ids(out);
        }
    }
}

/// An ordered set of root nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Forest {
    pub roots: Vec<Node>,
}

impl Forest {
    pub fn new(roots: Vec<Node>) -> Self {
        Self { roots }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        self.roots.iter().map(Node::subtree_len).sum()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.find(id).is_some()
    }

    /// Find a node by id.
    pub fn find(&self, id: &NodeId) -> Option<&Node> {
        fn walk<'a>(nodes: &'a [Node], id: &NodeId) -> Option<&'a Node> {
            for node in nodes {
                if &node.id == id {
                    return Some(node);
                }
                if let Some(found) = walk(&node.children, id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.roots, id)
    }

    /// Find a mutable reference to a node by id.
    pub fn find_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        fn walk<'a>(nodes: &'a mut [Node], id: &NodeId) -> Option<&'a mut Node> {
            for node in nodes.iter_mut() {
                if &node.id == id {
                    return Some(node);
                }
                if let Some(found) = walk(&mut node.children, id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&mut self.roots, id)
    }

    /// Find the node whose `children` contains `id`.
    ///
    /// Walks from every root testing membership; `parent_id` is not trusted.
    pub fn find_parent(&self, id: &NodeId) -> Option<&Node> {
        fn walk<'a>(nodes: &'a [Node], id: &NodeId) -> Option<&'a Node> {
            for node in nodes {
                if node.children.iter().any(|c| &c.id == id) {
                    return Some(node);
                }
                if let Some(found) = walk(&node.children, id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.roots, id)
    }

    /// Parent id (`None` for roots) and index among siblings.
    pub fn position_of(&self, id: &NodeId) -> Option<(Option<NodeId>, usize)> {
        if let Some(idx) = self.roots.iter().position(|n| &n.id == id) {
            return Some((None, idx));
        }
        let parent = self.find_parent(id)?;
        let idx = parent.children.iter().position(|c| &c.id == id)?;
        Some((Some(parent.id.clone()), idx))
    }

    /// Every node below `id` in pre-order, excluding `id` itself.
    pub fn find_all_descendants(&self, id: &NodeId) -> Vec<&Node> {
        fn walk<'a>(node: &'a Node, out: &mut Vec<&'a Node>) {
            for child in &node.children {
                out.push(child);
                walk(child, out);
            }
        }
        let mut out = Vec::new();
        if let Some(node) = self.find(id) {
            walk(node, &mut out);
        }
        out
    }

    /// Whether `candidate` lies strictly below `ancestor`.
    pub fn is_descendant(&self, ancestor: &NodeId, candidate: &NodeId) -> bool {
        self.find_all_descendants(ancestor)
            .iter()
            .any(|n| &n.id == candidate)
    }

    /// All nodes in pre-order.
    pub fn flatten(&self) -> Vec<&Node> {
        fn walk<'a>(nodes: &'a [Node], out: &mut Vec<&'a Node>) {
            for node in nodes {
                out.push(node);
                walk(&node.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.roots, &mut out);
        out
    }

    /// All ids in pre-order.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for root in &self.roots {
            root.collect_ids(&mut out);
        }
        out
    }

    /// The sibling list under `parent` (`None` = roots).
    pub fn siblings(&self, parent: Option<&NodeId>) -> Option<&Vec<Node>> {
        match parent {
            None => Some(&self.roots),
            Some(pid) => self.find(pid).map(|n| &n.children),
        }
    }

    /// Append `node` as the last child of `parent` (`None` = new root).
    pub fn add_child(&mut self, parent: Option<&NodeId>, node: Node) -> Result<()> {
        let end = match parent {
            None => self.roots.len(),
            Some(pid) => self
                .find(pid)
                .map(|n| n.children.len())
                .ok_or_else(|| MapTreeError::NodeNotFound(pid.clone()))?,
        };
        self.insert_child_at(parent, end, node)
    }

    /// Insert `node` at `index` under `parent`; the index is clamped to the sibling count.
    pub fn insert_child_at(&mut self, parent: Option<&NodeId>, index: usize, mut node: Node) -> Result<()> {
        let mut incoming = Vec::new();
        node.collect_ids(&mut incoming);
        let mut seen = HashSet::new();
        for id in &incoming {
            if !seen.insert(id) || self.contains(id) {
                return Err(MapTreeError::StructuralViolation(format!(
                    "duplicate node id {}",
                    id
                )));
            }
        }

        node.parent_id = parent.cloned();
        let siblings = match parent {
            None => &mut self.roots,
            Some(pid) => {
                let target = self
                    .find_mut(pid)
                    .ok_or_else(|| MapTreeError::NodeNotFound(pid.clone()))?;
                if target.is_leaf() {
                    return Err(MapTreeError::StructuralViolation(format!(
                        "cannot nest {} under leaf {}",
                        node.id, pid
                    )));
                }
                &mut target.children
            }
        };
        let index = index.min(siblings.len());
        siblings.insert(index, node);
        Ok(())
    }

    /// Detach the subtree rooted at `id` and return it.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        fn detach(nodes: &mut Vec<Node>, id: &NodeId) -> Option<Node> {
            if let Some(pos) = nodes.iter().position(|n| &n.id == id) {
                return Some(nodes.remove(pos));
            }
            for node in nodes.iter_mut() {
                if let Some(found) = detach(&mut node.children, id) {
                    return Some(found);
                }
            }
            None
        }
        detach(&mut self.roots, id)
    }

    /// Replace the children of group `id`, returning the previous list.
    pub fn replace_children(&mut self, id: &NodeId, children: Vec<Node>) -> Result<Vec<Node>> {
        let node = self
            .find(id)
            .ok_or_else(|| MapTreeError::NodeNotFound(id.clone()))?;
        if node.is_leaf() && !children.is_empty() {
            return Err(MapTreeError::StructuralViolation(format!(
                "leaf {} cannot have children",
                id
            )));
        }
        let outside: HashSet<NodeId> = {
            let inside: HashSet<NodeId> = self
                .find_all_descendants(id)
                .iter()
                .map(|n| n.id.clone())
                .collect();
            self.ids().into_iter().filter(|i| !inside.contains(i)).collect()
        };
        let mut incoming = Vec::new();
        for child in &children {
            child.collect_ids(&mut incoming);
        }
        let mut seen = HashSet::new();
        for nid in &incoming {
            if !seen.insert(nid) || outside.contains(nid) {
                return Err(MapTreeError::StructuralViolation(format!(
                    "duplicate node id {}",
                    nid
                )));
            }
        }

        let node = self
            .find_mut(id)
            .ok_or_else(|| MapTreeError::NodeNotFound(id.clone()))?;
        let mut children = children;
        for child in children.iter_mut() {
            child.parent_id = Some(id.clone());
        }
        Ok(std::mem::replace(&mut node.children, children))
    }

    /// Give node `old` the id `new`, updating its children's `parent_id`.
    pub fn rekey(&mut self, old: &NodeId, new: &NodeId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.contains(new) {
            return Err(MapTreeError::StructuralViolation(format!(
                "id {} is already taken",
                new
            )));
        }
        let node = self
            .find_mut(old)
            .ok_or_else(|| MapTreeError::NodeNotFound(old.clone()))?;
        node.id = new.clone();
        for child in node.children.iter_mut() {
            child.parent_id = Some(new.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// `A(group) -> [B(leaf), C(group) -> [D(leaf)]]`, plus a second root `E(group)`.
    pub(crate) fn sample_forest() -> Forest {
        let a = Node::group("A", "Base maps")
            .with_child(Node::leaf("B", "Streets", LeafSource::default()))
            .with_child(Node::group("C", "Overlays").with_child(Node::leaf(
                "D",
                "Rivers",
                LeafSource::default(),
            )));
        Forest::new(vec![a, Node::group("E", "Empty")])
    }

    #[test]
    fn node_id_from_number_and_string_agree() {
        let a: NodeId = serde_json::from_value(json!(7)).unwrap();
        let b: NodeId = serde_json::from_value(json!("7")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, NodeId::from(7u64));
    }

    #[test]
    fn find_and_find_parent() {
        let forest = sample_forest();
        assert_eq!(forest.find(&"D".into()).unwrap().title, "Rivers");
        assert_eq!(forest.find_parent(&"D".into()).unwrap().id, NodeId::from("C"));
        assert!(forest.find_parent(&"A".into()).is_none());
        assert!(forest.find(&"Z".into()).is_none());
    }

    #[test]
    fn position_of_roots_and_children() {
        let forest = sample_forest();
        assert_eq!(forest.position_of(&"E".into()), Some((None, 1)));
        assert_eq!(
            forest.position_of(&"C".into()),
            Some((Some(NodeId::from("A")), 1))
        );
    }

    #[test]
    fn find_all_descendants_is_preorder() {
        let forest = sample_forest();
        let ids: Vec<&str> = forest
            .find_all_descendants(&"A".into())
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(ids, vec!["B", "C", "D"]);
        assert!(forest.is_descendant(&"A".into(), &"D".into()));
        assert!(!forest.is_descendant(&"C".into(), &"B".into()));
    }

    #[test]
    fn add_child_sets_parent_id() {
        let mut forest = sample_forest();
        forest
            .add_child(Some(&"E".into()), Node::leaf("F", "Parcels", LeafSource::default()))
            .unwrap();
        let f = forest.find(&"F".into()).unwrap();
        assert_eq!(f.parent_id, Some(NodeId::from("E")));
        assert_eq!(forest.len(), 6);
    }

    #[test]
    fn add_child_under_leaf_is_violation() {
        let mut forest = sample_forest();
        let err = forest
            .add_child(Some(&"B".into()), Node::group("X", "x"))
            .unwrap_err();
        assert!(matches!(err, MapTreeError::StructuralViolation(_)));
    }

    #[test]
    fn add_duplicate_id_is_violation() {
        let mut forest = sample_forest();
        let err = forest.add_child(None, Node::group("D", "dup")).unwrap_err();
        assert!(matches!(err, MapTreeError::StructuralViolation(_)));
    }

    #[test]
    fn add_child_missing_parent() {
        let mut forest = sample_forest();
        let err = forest.add_child(Some(&"nope".into()), Node::group("X", "x")).unwrap_err();
        assert!(matches!(err, MapTreeError::NodeNotFound(_)));
    }

    #[test]
    fn remove_node_detaches_subtree() {
        let mut forest = sample_forest();
        let removed = forest.remove_node(&"C".into()).unwrap();
        assert_eq!(removed.children.len(), 1);
        assert!(!forest.contains(&"D".into()));
        assert_eq!(forest.len(), 3);
    }

    #[test]
    fn replace_children_swaps_list() {
        let mut forest = sample_forest();
        let old = forest
            .replace_children(&"E".into(), vec![Node::leaf("G", "g", LeafSource::default())])
            .unwrap();
        assert!(old.is_empty());
        assert_eq!(
            forest.find(&"G".into()).unwrap().parent_id,
            Some(NodeId::from("E"))
        );
    }

    #[test]
    fn replace_children_may_reuse_own_descendants() {
        let mut forest = sample_forest();
        let reversed: Vec<Node> = forest.find(&"A".into()).unwrap().children.iter().rev().cloned().collect();
        forest.replace_children(&"A".into(), reversed).unwrap();
        let ids: Vec<&str> = forest.roots[0].children.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["C", "B"]);
    }

    #[test]
    fn rekey_updates_children_parent_ids() {
        let mut forest = sample_forest();
        forest.rekey(&"C".into(), &"42".into()).unwrap();
        assert!(!forest.contains(&"C".into()));
        let d = forest.find(&"D".into()).unwrap();
        assert_eq!(d.parent_id, Some(NodeId::from("42")));
    }

    #[test]
    fn rekey_to_taken_id_fails() {
        let mut forest = sample_forest();
        assert!(forest.rekey(&"C".into(), &"B".into()).is_err());
    }

    #[test]
    fn from_attributes_lifts_leaf_source() {
        let attrs = json!({
            "title": "Roads",
            "source_url": "https://tiles.example/wms",
            "format": "image/png",
            "description": "road network",
        });
        let node = Node::from_attributes("1".into(), None, attrs.as_object().unwrap(), false);
        assert_eq!(node.title, "Roads");
        match &node.kind {
            NodeKind::Leaf(src) => {
                assert_eq!(src.url.as_deref(), Some("https://tiles.example/wms"));
                assert_eq!(src.format.as_deref(), Some("image/png"));
            }
            NodeKind::Group => panic!("expected leaf"),
        }
        assert_eq!(node.properties.get("description"), Some(&json!("road network")));
        assert!(!node.properties.contains_key("title"));
    }

    #[test]
    fn attributes_round_trip_title_and_source() {
        let mut node = Node::leaf(
            "1",
            "Roads",
            LeafSource {
                url: Some("u".into()),
                ..Default::default()
            },
        );
        node.apply_attributes(json!({"title": "Highways", "style": "bold"}).as_object().unwrap());
        let attrs = node.attributes();
        assert_eq!(attrs.get("title"), Some(&json!("Highways")));
        assert_eq!(attrs.get("source_url"), Some(&json!("u")));
        assert_eq!(attrs.get("style"), Some(&json!("bold")));
        assert_eq!(attrs.get("is_leaf"), Some(&json!(true)));
    }
}
