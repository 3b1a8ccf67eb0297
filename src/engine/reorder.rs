//! Drag-and-drop repositioning.
//!
//! A drop is resolved against the primary tree into a [`DropPlan`]: the new
//! parent, the index among the new siblings (counted after the dragged node
//! has been detached) and the anchor/position pair the repository expects.

use serde::{Deserialize, Serialize};

use crate::engine::repository::MovePosition;
use crate::error::{MapTreeError, Result};
use crate::tree::{Forest, NodeId};

/// A drag-and-drop gesture as reported by the tree widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropEvent {
    pub drag_id: NodeId,
    pub target_id: NodeId,
    /// The drop landed in a gap between rows rather than on the target row.
    #[serde(default)]
    pub drop_to_gap: bool,
    /// Structural path of the target, e.g. `"0-1-2"`; the last segment is its sibling index.
    #[serde(default)]
    pub target_pos: String,
    /// Absolute drop position: sibling index of the target, minus one above it, plus one below.
    #[serde(default)]
    pub drop_position: i64,
    /// The target row is expanded in the widget.
    #[serde(default)]
    pub target_expanded: bool,
}

/// Simplified placement used by scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Before,
    After,
    Inside,
}

impl DropEvent {
    /// Drop position relative to the target: `-1` above, `0` on it, `+1` below.
    pub fn relative_position(&self) -> i64 {
        let last = self
            .target_pos
            .rsplit('-')
            .next()
            .and_then(|seg| seg.parse::<i64>().ok())
            .unwrap_or(0);
        self.drop_position - last
    }

    /// Build the event the widget would report for `placement`.
    pub fn for_placement(forest: &Forest, drag: &NodeId, target: &NodeId, placement: Placement) -> Result<Self> {
        let target_pos = tree_pos(forest, target).ok_or_else(|| MapTreeError::NodeNotFound(target.clone()))?;
        let (_, index) = forest
            .position_of(target)
            .ok_or_else(|| MapTreeError::NodeNotFound(target.clone()))?;
        let index = index as i64;
        let (drop_to_gap, drop_position) = match placement {
            Placement::Before => (true, index - 1),
            Placement::After => (true, index + 1),
            Placement::Inside => (false, index),
        };
        Ok(Self {
            drag_id: drag.clone(),
            target_id: target.clone(),
            drop_to_gap,
            target_pos,
            drop_position,
            target_expanded: false,
        })
    }
}

/// Widget-style structural path of `id`: `"0"` followed by each sibling index.
pub fn tree_pos(forest: &Forest, id: &NodeId) -> Option<String> {
    let mut segments = Vec::new();
    let mut current = id.clone();
    loop {
        let (parent, index) = forest.position_of(&current)?;
        segments.push(index.to_string());
        match parent {
            Some(p) => current = p,
            None => break,
        }
    }
    segments.push("0".to_string());
    segments.reverse();
    Some(segments.join("-"))
}

/// Which resolution rule applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropBranch {
    /// Dropped on the target row: first child of the target.
    IntoContent,
    /// Dropped in the gap below an expanded, non-empty target: first child of the target.
    IntoExpandedGap,
    Before,
    After,
}

/// Resolved outcome of a drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropPlan {
    pub drag_id: NodeId,
    pub branch: DropBranch,
    pub old_parent: Option<NodeId>,
    pub old_index: usize,
    pub new_parent: Option<NodeId>,
    /// Index among the new siblings once the dragged node is detached.
    pub index: usize,
    /// Anchor node for the repository move call.
    pub anchor: NodeId,
    pub position: MovePosition,
}

/// Resolve a drop against the current tree.
pub fn resolve(forest: &Forest, event: &DropEvent) -> Result<DropPlan> {
    let drag = &event.drag_id;
    let target_id = &event.target_id;
    let (old_parent, old_index) = forest
        .position_of(drag)
        .ok_or_else(|| MapTreeError::NodeNotFound(drag.clone()))?;
    let target = forest
        .find(target_id)
        .ok_or_else(|| MapTreeError::NodeNotFound(target_id.clone()))?;

    if drag == target_id {
        return Err(MapTreeError::StructuralViolation(format!(
            "cannot drop {} onto itself",
            drag
        )));
    }
    if forest.is_descendant(drag, target_id) {
        return Err(MapTreeError::StructuralViolation(format!(
            "cannot drop {} into its own descendant {}",
            drag, target_id
        )));
    }

    let relative = event.relative_position();

    if !event.drop_to_gap {
        if target.is_leaf() {
            return Err(MapTreeError::StructuralViolation(format!(
                "cannot drop {} into leaf {}",
                drag, target_id
            )));
        }
        return Ok(DropPlan {
            drag_id: drag.clone(),
            branch: DropBranch::IntoContent,
            old_parent,
            old_index,
            new_parent: Some(target_id.clone()),
            index: 0,
            anchor: target_id.clone(),
            position: MovePosition::FirstChild,
        });
    }

    if event.target_expanded && !target.children.is_empty() && relative == 1 {
        return Ok(DropPlan {
            drag_id: drag.clone(),
            branch: DropBranch::IntoExpandedGap,
            old_parent,
            old_index,
            new_parent: Some(target_id.clone()),
            index: 0,
            anchor: target_id.clone(),
            position: MovePosition::FirstChild,
        });
    }

    let (target_parent, _) = forest
        .position_of(target_id)
        .ok_or_else(|| MapTreeError::NodeNotFound(target_id.clone()))?;
    let remaining: Vec<&NodeId> = forest
        .siblings(target_parent.as_ref())
        .map(|list| list.iter().map(|n| &n.id).filter(|id| *id != drag).collect())
        .unwrap_or_default();
    let target_index = remaining
        .iter()
        .position(|id| *id == target_id)
        .ok_or_else(|| MapTreeError::NodeNotFound(target_id.clone()))?;

    let (branch, index) = if relative < 0 {
        (DropBranch::Before, target_index)
    } else {
        (DropBranch::After, target_index + 1)
    };

    let (anchor, position) = match branch {
        DropBranch::After => (target_id.clone(), MovePosition::Right),
        _ if index > 0 => (remaining[index - 1].clone(), MovePosition::Right),
        _ => match &target_parent {
            Some(parent) => (parent.clone(), MovePosition::FirstChild),
            None => (target_id.clone(), MovePosition::Left),
        },
    };

    Ok(DropPlan {
        drag_id: drag.clone(),
        branch,
        old_parent,
        old_index,
        new_parent: target_parent,
        index,
        anchor,
        position,
    })
}

/// Move the dragged node to its planned slot in the primary tree.
pub fn apply(forest: &mut Forest, plan: &DropPlan) -> Result<()> {
    relocate(forest, &plan.drag_id, plan.new_parent.as_ref(), plan.index)
}

/// Detach `id` and reinsert it under `parent` at `index`.
///
/// On failure the node is put back where it was.
pub fn relocate(forest: &mut Forest, id: &NodeId, parent: Option<&NodeId>, index: usize) -> Result<()> {
    let (old_parent, old_index) = forest
        .position_of(id)
        .ok_or_else(|| MapTreeError::NodeNotFound(id.clone()))?;
    let node = forest
        .remove_node(id)
        .ok_or_else(|| MapTreeError::NodeNotFound(id.clone()))?;
    if let Err(e) = forest.insert_child_at(parent, index, node.clone()) {
        forest.insert_child_at(old_parent.as_ref(), old_index, node)?;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{LeafSource, Node};
    use proptest::prelude::*;

    /// `A(group) -> [B(leaf), C(group, empty)]`
    fn abc() -> Forest {
        Forest::new(vec![Node::group("A", "a")
            .with_child(Node::leaf("B", "b", LeafSource::default()))
            .with_child(Node::group("C", "c"))])
    }

    fn child_ids(forest: &Forest, id: &str) -> Vec<String> {
        forest
            .find(&id.into())
            .unwrap()
            .children
            .iter()
            .map(|n| n.id.to_string())
            .collect()
    }

    #[test]
    fn tree_pos_matches_widget_paths() {
        let forest = abc();
        assert_eq!(tree_pos(&forest, &"A".into()).as_deref(), Some("0-0"));
        assert_eq!(tree_pos(&forest, &"C".into()).as_deref(), Some("0-0-1"));
    }

    #[test]
    fn drop_onto_content_nests_as_first_child() {
        let mut forest = abc();
        let event = DropEvent::for_placement(&forest, &"B".into(), &"C".into(), Placement::Inside).unwrap();
        let plan = resolve(&forest, &event).unwrap();
        assert_eq!(plan.branch, DropBranch::IntoContent);
        assert_eq!((plan.anchor.as_str(), plan.position), ("C", MovePosition::FirstChild));
        apply(&mut forest, &plan).unwrap();
        assert_eq!(child_ids(&forest, "A"), vec!["C"]);
        assert_eq!(child_ids(&forest, "C"), vec!["B"]);
        assert_eq!(forest.find(&"B".into()).unwrap().parent_id, Some(NodeId::from("C")));
    }

    #[test]
    fn drop_in_gap_after_collapsed_group_is_sibling() {
        let mut forest = abc();
        let event = DropEvent {
            drag_id: "B".into(),
            target_id: "C".into(),
            drop_to_gap: true,
            target_pos: "0-0-1".into(),
            drop_position: 2,
            target_expanded: false,
        };
        let plan = resolve(&forest, &event).unwrap();
        assert_eq!(plan.branch, DropBranch::After);
        assert_eq!((plan.anchor.as_str(), plan.position), ("C", MovePosition::Right));
        apply(&mut forest, &plan).unwrap();
        assert_eq!(child_ids(&forest, "A"), vec!["C", "B"]);
    }

    #[test]
    fn drop_in_bottom_gap_of_expanded_group_enters_it() {
        let mut forest = Forest::new(vec![Node::group("A", "a")
            .with_child(Node::group("G", "g").with_child(Node::leaf("X", "x", LeafSource::default())))
            .with_child(Node::leaf("B", "b", LeafSource::default()))]);
        let event = DropEvent {
            drag_id: "B".into(),
            target_id: "G".into(),
            drop_to_gap: true,
            target_pos: "0-0-0".into(),
            drop_position: 1,
            target_expanded: true,
        };
        let plan = resolve(&forest, &event).unwrap();
        assert_eq!(plan.branch, DropBranch::IntoExpandedGap);
        apply(&mut forest, &plan).unwrap();
        assert_eq!(child_ids(&forest, "G"), vec!["B", "X"]);
    }

    #[test]
    fn drop_before_first_child_anchors_on_parent() {
        let mut forest = abc();
        let event = DropEvent::for_placement(&forest, &"C".into(), &"B".into(), Placement::Before).unwrap();
        let plan = resolve(&forest, &event).unwrap();
        assert_eq!(plan.branch, DropBranch::Before);
        assert_eq!((plan.anchor.as_str(), plan.position), ("A", MovePosition::FirstChild));
        apply(&mut forest, &plan).unwrap();
        assert_eq!(child_ids(&forest, "A"), vec!["C", "B"]);
    }

    #[test]
    fn drop_before_later_sibling_anchors_on_previous() {
        let mut forest = Forest::new(vec![Node::group("A", "a")
            .with_child(Node::leaf("B", "b", LeafSource::default()))
            .with_child(Node::leaf("C", "c", LeafSource::default()))
            .with_child(Node::leaf("D", "d", LeafSource::default()))]);
        let event = DropEvent::for_placement(&forest, &"B".into(), &"D".into(), Placement::Before).unwrap();
        let plan = resolve(&forest, &event).unwrap();
        assert_eq!((plan.anchor.as_str(), plan.position), ("C", MovePosition::Right));
        apply(&mut forest, &plan).unwrap();
        assert_eq!(child_ids(&forest, "A"), vec!["C", "B", "D"]);
    }

    #[test]
    fn drop_before_first_root_uses_left() {
        let forest = Forest::new(vec![Node::group("A", "a"), Node::group("B", "b")]);
        let event = DropEvent::for_placement(&forest, &"B".into(), &"A".into(), Placement::Before).unwrap();
        let plan = resolve(&forest, &event).unwrap();
        assert_eq!((plan.anchor.as_str(), plan.position), ("A", MovePosition::Left));
        assert_eq!(plan.index, 0);
    }

    #[test]
    fn drop_into_leaf_is_violation() {
        let forest = abc();
        let event = DropEvent::for_placement(&forest, &"C".into(), &"B".into(), Placement::Inside).unwrap();
        assert!(matches!(resolve(&forest, &event), Err(MapTreeError::StructuralViolation(_))));
    }

    #[test]
    fn drop_into_own_descendant_is_violation() {
        let forest = Forest::new(vec![Node::group("A", "a").with_child(Node::group("B", "b"))]);
        let event = DropEvent::for_placement(&forest, &"A".into(), &"B".into(), Placement::Inside).unwrap();
        assert!(matches!(resolve(&forest, &event), Err(MapTreeError::StructuralViolation(_))));
        let onto_self = DropEvent::for_placement(&forest, &"A".into(), &"A".into(), Placement::Inside).unwrap();
        assert!(resolve(&forest, &onto_self).is_err());
    }

    #[test]
    fn relocate_restores_on_failure() {
        let mut forest = abc();
        let err = relocate(&mut forest, &"C".into(), Some(&"B".into()), 0).unwrap_err();
        assert!(matches!(err, MapTreeError::StructuralViolation(_)));
        assert_eq!(child_ids(&forest, "A"), vec!["B", "C"]);
    }

    fn wide_forest() -> Forest {
        let mut roots = Vec::new();
        for r in 0..3 {
            let mut group = Node::group(format!("g{}", r), "g");
            for c in 0..3 {
                let child = if c == 1 {
                    Node::group(format!("g{}_{}", r, c), "g")
                        .with_child(Node::leaf(format!("l{}_{}_x", r, c), "l", LeafSource::default()))
                } else {
                    Node::leaf(format!("l{}_{}", r, c), "l", LeafSource::default())
                };
                group = group.with_child(child);
            }
            roots.push(group);
        }
        Forest::new(roots)
    }

    proptest! {
        #[test]
        fn reorder_never_loses_nodes(
            drag in 0usize..18,
            target in 0usize..18,
            placement in prop_oneof![Just(Placement::Before), Just(Placement::After), Just(Placement::Inside)],
            expanded in any::<bool>(),
        ) {
            let mut forest = wide_forest();
            let ids = forest.ids();
            let before = forest.len();
            let drag = ids[drag % ids.len()].clone();
            let target = ids[target % ids.len()].clone();
            let mut event = DropEvent::for_placement(&forest, &drag, &target, placement).unwrap();
            event.target_expanded = expanded;
            if let Ok(plan) = resolve(&forest, &event) {
                apply(&mut forest, &plan).unwrap();
            }
            prop_assert_eq!(forest.len(), before);
            let count = forest.ids().iter().filter(|id| **id == drag).count();
            prop_assert_eq!(count, 1);
        }
    }
}
