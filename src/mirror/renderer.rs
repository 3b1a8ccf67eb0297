use std::sync::{Arc, Mutex};

use crate::tree::NodeId;

/// Change notifications delivered to the map renderer after the mirror moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    /// The whole presentation hierarchy was rebuilt.
    Rebuilt { layers: usize },
    GroupAdded { key: NodeId, parent: Option<NodeId>, index: usize },
    LeafAdded { key: NodeId, parent: Option<NodeId>, index: usize },
    Removed { key: NodeId },
    /// A layer moved to a new group and/or position.
    Moved { key: NodeId, parent: Option<NodeId>, index: usize },
    Rekeyed { old: NodeId, new: NodeId },
    VisibilityChanged { key: NodeId, visible: bool },
    PropertiesChanged { key: NodeId },
}

/// Consumer of the presentation hierarchy.
///
/// The engine owns the mirror and only ever tells the renderer what changed;
/// the renderer never mutates either tree.
pub trait Renderer: Send {
    fn notify(&mut self, event: &RenderEvent);
}

/// Renderer that only logs what it would redraw.
#[derive(Debug, Default)]
pub struct TracingRenderer;

impl Renderer for TracingRenderer {
    fn notify(&mut self, event: &RenderEvent) {
        tracing::debug!(?event, "render");
    }
}

/// Renderer that keeps every event, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct RecordingRenderer {
    events: Arc<Mutex<Vec<RenderEvent>>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<RenderEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl Renderer for RecordingRenderer {
    fn notify(&mut self, event: &RenderEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
