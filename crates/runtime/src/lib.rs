//! The turn runtime: one round of `user → model → {tool calls}* →
//! assistant content`, with tool-visibility policy, auto-compaction on
//! context overflow, MCP auto-reload, and agent-result reporting.

pub mod compaction;
pub mod mcp;
pub mod policy;
pub mod report;
pub mod restart;
pub mod tools;
pub mod turn;

pub use compaction::Compactor;
pub use mcp::McpReloader;
pub use policy::ToolPolicy;
pub use restart::RestartSignal;
pub use tools::{Tool, ToolRegistry};
pub use turn::{SkillsIndex, TurnLoop, TurnOptions, TurnOutcome};
