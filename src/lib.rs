//! Hierarchical resource-tree synchronization engine.
//!
//! Keeps a locally held tree of nestable resource nodes, a remote node
//! repository and a presentation mirror (groups and leaves for a map
//! renderer) consistent while nodes are added, removed, edited, dragged,
//! checked and selected.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod mirror;
pub mod tree;

pub use error::{MapTreeError, RepositoryError, Result};
