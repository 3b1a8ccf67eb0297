pub mod decode;
pub mod node;

pub use decode::{decode, decode_json, encode, DecodeWarning, Decoded, NodeRecord, OrphanPolicy};
pub use node::{Forest, LeafSource, Node, NodeId, NodeKind, Properties};
