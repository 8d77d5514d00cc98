//! The agent loop: binds channels, identity, inference, and tool
//! execution into the assistant's request/reply cycle.

pub mod runner;
pub mod tool_call;

pub use runner::AgentLoop;
pub use tool_call::{ParsedToolCall, TaggedJsonParser, ToolCallParser};
