pub mod handle;
pub mod intent;
pub mod mutation;
pub mod reorder;
pub mod repository;
pub mod selection;

pub use handle::EngineHandle;
pub use intent::{load_script, parse_script, Intent, IntentOutcome};
pub use mutation::{EditSnapshot, Removed, RollbackPolicy, TreeEngine};
pub use reorder::{DropBranch, DropEvent, DropPlan, Placement};
pub use repository::{InMemoryRepository, MovePosition, NodeRepository, RepositoryCall, RepositoryOp};
pub use selection::{SelectionSink, SelectionState, TracingSelectionSink};
