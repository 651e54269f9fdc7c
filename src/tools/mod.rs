//! Model-facing tools that propose scene edits
//!
//! - **patch**: declarative DOM operations applied to a copy of the scene tree
//! - **dispatcher**: tool lookup, argument parsing and exactly-once execution

pub mod dispatcher;
pub mod patch;

pub use dispatcher::{
    SceneTool, ToolCallCollector, ToolDispatcher, ToolError, ToolInvocation, ToolName,
    ToolOutcome, TOOL_DONE,
};
pub use patch::{apply_script, MutationError, NodePath, PatchOperation, PatchScript, PathStep};
