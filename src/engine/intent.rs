//! UI-facing intents and script loading.
//!
//! An intent is one user gesture (add, remove, edit, drop, check, select).
//! Scripts are JSON arrays of intents tagged by `"op"`.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::engine::handle::EngineHandle;
use crate::engine::mutation::TreeEngine;
use crate::engine::reorder::{DropEvent, DropPlan, Placement};
use crate::error::{MapTreeError, Result};
use crate::tree::{Node, NodeId, Properties};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Intent {
    Add {
        #[serde(default)]
        parent: Option<NodeId>,
        #[serde(default)]
        attributes: Properties,
        #[serde(default)]
        group: bool,
    },
    Remove {
        id: NodeId,
    },
    Edit {
        id: NodeId,
        attributes: Properties,
    },
    /// Raw widget drop.
    Drop(DropEvent),
    /// Drop expressed as a placement relative to `target`.
    Move {
        drag: NodeId,
        target: NodeId,
        place: Placement,
    },
    Check {
        id: NodeId,
        #[serde(default = "default_checked")]
        checked: bool,
    },
    Select {
        ids: Vec<NodeId>,
    },
}

fn default_checked() -> bool {
    true
}

/// What a successfully applied intent produced.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    Added(Node),
    Removed(NodeId),
    Edited { id: NodeId, attributes: Properties },
    Dropped(DropPlan),
    Checked(Vec<NodeId>),
    Selected(Vec<NodeId>),
}

impl fmt::Display for IntentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentOutcome::Added(node) => write!(f, "added {} ({})", node.id, node.title),
            IntentOutcome::Removed(id) => write!(f, "removed {}", id),
            IntentOutcome::Edited { id, .. } => write!(f, "edited {}", id),
            IntentOutcome::Dropped(plan) => write!(
                f,
                "moved {} {} {}",
                plan.drag_id,
                plan.position.as_str(),
                plan.anchor
            ),
            IntentOutcome::Checked(ids) => write!(f, "{} checked", ids.len()),
            IntentOutcome::Selected(ids) => write!(f, "{} selected", ids.len()),
        }
    }
}

impl Intent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Add { .. } => "add",
            Intent::Remove { .. } => "remove",
            Intent::Edit { .. } => "edit",
            Intent::Drop(_) => "drop",
            Intent::Move { .. } => "move",
            Intent::Check { .. } => "check",
            Intent::Select { .. } => "select",
        }
    }

    /// Apply against the local engine only.
    pub fn apply_local(&self, engine: &mut TreeEngine) -> Result<IntentOutcome> {
        match self {
            Intent::Add {
                parent,
                attributes,
                group,
            } => engine
                .add_node(parent.as_ref(), attributes, *group)
                .map(IntentOutcome::Added),
            Intent::Remove { id } => engine
                .remove_node(id)
                .map(|removed| IntentOutcome::Removed(removed.node.id)),
            Intent::Edit { id, attributes } => {
                let (_, merged) = engine.edit_node(id, attributes)?;
                Ok(IntentOutcome::Edited {
                    id: id.clone(),
                    attributes: merged,
                })
            }
            Intent::Drop(event) => engine.drop_node(event).map(IntentOutcome::Dropped),
            Intent::Move {
                drag,
                target,
                place,
            } => {
                let event = DropEvent::for_placement(engine.forest(), drag, target, *place)?;
                engine.drop_node(&event).map(IntentOutcome::Dropped)
            }
            Intent::Check { id, checked } => engine.check(id, *checked).map(IntentOutcome::Checked),
            Intent::Select { ids } => Ok(IntentOutcome::Selected(engine.select(ids))),
        }
    }
}

impl EngineHandle {
    /// Run one intent through the remote-backed engine.
    pub async fn dispatch(&self, intent: &Intent) -> Result<IntentOutcome> {
        match intent {
            Intent::Add {
                parent,
                attributes,
                group,
            } => self
                .add_node(parent.as_ref(), attributes, *group)
                .await
                .map(IntentOutcome::Added),
            Intent::Remove { id } => self
                .remove_node(id)
                .await
                .map(|node| IntentOutcome::Removed(node.id)),
            Intent::Edit { id, attributes } => {
                let merged = self.edit_node(id, attributes).await?;
                Ok(IntentOutcome::Edited {
                    id: id.clone(),
                    attributes: merged,
                })
            }
            Intent::Drop(event) => self.drop_node(event).await.map(IntentOutcome::Dropped),
            Intent::Move {
                drag,
                target,
                place,
            } => self
                .move_to(drag, target, *place)
                .await
                .map(IntentOutcome::Dropped),
            Intent::Check { id, checked } => self.check(id, *checked).await.map(IntentOutcome::Checked),
            Intent::Select { ids } => self.select(ids).await.map(IntentOutcome::Selected),
        }
    }
}

/// Parse a script: a JSON array of intents.
pub fn parse_script(text: &str) -> Result<Vec<Intent>> {
    Ok(serde_json::from_str(text)?)
}

/// Read and parse a script file.
pub fn load_script(path: &Path) -> Result<Vec<Intent>> {
    let text = std::fs::read_to_string(path)?;
    parse_script(&text).map_err(|e| match e {
        MapTreeError::Json(err) => MapTreeError::InvalidInput(format!(
            "script {}: {}",
            path.display(),
            err
        )),
        other => other,
    })
}
