//! Nested-set (MPTT) decoding of the backend node list.
//!
//! The backend stores every tree as a flat list of records carrying
//! `(tree_id, left, right)` markers. Sorting by `(tree_id, left)` yields a
//! pre-order walk over all trees, so every parent is built before any of its
//! children and the forest can be assembled in a single pass.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MapTreeError, Result};
use crate::tree::node::{Forest, Node, NodeId, Properties};

/// What to do with a record whose parent is not part of the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Demote the record to a root and record a [`DecodeWarning`].
    #[default]
    Root,
    /// Fail with [`MapTreeError::DecodeAmbiguous`].
    Reject,
}

impl OrphanPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "root" => Some(OrphanPolicy::Root),
            "reject" => Some(OrphanPolicy::Reject),
            _ => None,
        }
    }
}

/// Reference to another resource inside a relationship.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResourceRef {
    pub id: NodeId,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Relationship {
    #[serde(default)]
    pub data: Option<ResourceRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Relationships {
    pub parent: Option<Relationship>,
    /// Other domain references (linked services, owners, ...), kept verbatim.
    #[serde(flatten)]
    pub other: Properties,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordAttributes {
    #[serde(alias = "name")]
    pub title: String,
    #[serde(alias = "lft")]
    pub left: i64,
    #[serde(alias = "rght")]
    pub right: i64,
    #[serde(alias = "treeId", alias = "tree")]
    pub tree_id: i64,
    pub level: i64,
    #[serde(alias = "isLeaf")]
    pub is_leaf: bool,
    #[serde(flatten)]
    pub extra: Properties,
}

/// One backend record.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeRecord {
    pub id: NodeId,
    #[serde(default)]
    pub attributes: RecordAttributes,
    #[serde(default)]
    pub relationships: Relationships,
}

impl NodeRecord {
    pub fn parent_id(&self) -> Option<&NodeId> {
        self.relationships
            .parent
            .as_ref()
            .and_then(|rel| rel.data.as_ref())
            .map(|data| &data.id)
    }

    fn into_node(self) -> Node {
        let parent = self.parent_id().cloned();
        let mut props = self.attributes.extra;
        props.insert("title".to_string(), Value::String(self.attributes.title));
        for (name, rel) in self.relationships.other {
            let data = rel.get("data").cloned().unwrap_or(Value::Null);
            props.entry(name).or_insert(data);
        }
        Node::from_attributes(self.id, parent, &props, !self.attributes.is_leaf)
    }
}

/// A record demoted to root because its parent was missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeWarning {
    pub id: NodeId,
    pub missing_parent: NodeId,
}

/// Result of decoding a node list.
#[derive(Debug, Clone, Default)]
pub struct Decoded {
    pub forest: Forest,
    pub warnings: Vec<DecodeWarning>,
}

/// Rebuild a forest from flat nested-set records.
pub fn decode(mut records: Vec<NodeRecord>, policy: OrphanPolicy) -> Result<Decoded> {
    records.sort_by_key(|r| (r.attributes.tree_id, r.attributes.left));

    let mut forest = Forest::default();
    let mut warnings = Vec::new();

    for record in records {
        let parent = record.parent_id().cloned();
        let id = record.id.clone();
        let mut node = record.into_node();

        match parent {
            Some(pid) if forest.contains(&pid) => forest.add_child(Some(&pid), node)?,
            Some(pid) => match policy {
                OrphanPolicy::Root => {
                    tracing::warn!(%id, parent = %pid, "parent missing from node list, decoding as root");
                    node.parent_id = None;
                    forest.add_child(None, node)?;
                    warnings.push(DecodeWarning {
                        id,
                        missing_parent: pid,
                    });
                }
                OrphanPolicy::Reject => {
                    return Err(MapTreeError::DecodeAmbiguous { id, parent: pid });
                }
            },
            None => forest.add_child(None, node)?,
        }
    }

    tracing::debug!(nodes = forest.len(), roots = forest.roots.len(), "decoded node list");
    Ok(Decoded { forest, warnings })
}

/// Decode a JSON document: either a bare record array or `{ "data": [...] }`.
pub fn decode_json(input: &str, policy: OrphanPolicy) -> Result<Decoded> {
    let doc: Value = serde_json::from_str(input)?;
    let list = match doc {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => match map.remove("data") {
            Some(data @ Value::Array(_)) => data,
            _ => {
                return Err(MapTreeError::InvalidInput(
                    "expected an array or an object with a \"data\" array".into(),
                ))
            }
        },
        _ => {
            return Err(MapTreeError::InvalidInput(
                "expected an array or an object with a \"data\" array".into(),
            ))
        }
    };
    let records: Vec<NodeRecord> = serde_json::from_value(list)?;
    decode(records, policy)
}

/// Derive nested-set records from a forest, one tree id per root (1-based).
pub fn encode(forest: &Forest) -> Vec<NodeRecord> {
    fn walk(node: &Node, tree_id: i64, level: i64, counter: &mut i64, out: &mut Vec<NodeRecord>) {
        let left = *counter;
        *counter += 1;
        let slot = out.len();

        let mut extra = node.attributes();
        extra.remove("title");
        extra.remove("is_leaf");
        out.push(NodeRecord {
            id: node.id.clone(),
            attributes: RecordAttributes {
                title: node.title.clone(),
                left,
                right: 0,
                tree_id,
                level,
                is_leaf: node.is_leaf(),
                extra,
            },
            relationships: Relationships {
                parent: Some(Relationship {
                    data: node.parent_id.clone().map(|id| ResourceRef { id, kind: None }),
                }),
                other: Properties::new(),
            },
        });

        for child in &node.children {
            walk(child, tree_id, level + 1, counter, out);
        }
        out[slot].attributes.right = *counter;
        *counter += 1;
    }

    let mut out = Vec::new();
    for (i, root) in forest.roots.iter().enumerate() {
        let mut counter = 1;
        walk(root, i as i64 + 1, 0, &mut counter, &mut out);
    }
    out
}
