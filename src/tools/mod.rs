//! Tools callable from task nodes through the `TOOL: <name> | QUERY: <text>` directive.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::{MEMORY_TOOL_NAMES, ToolRegistry};
pub use tool::*;
