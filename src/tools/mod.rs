//! Tool abstraction and registry.
//!
//! A tool is a capability set: metadata for the LLM (name, description,
//! JSON-schema parameters), a risk assessment, input validation, and an
//! async `execute`. Tools are registered by name in the [`ToolRegistry`];
//! the [`executor::ToolExecutor`] is the only caller that runs them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{RiskLevel, ToolInput, ToolOutput};

pub mod api;
pub mod code;
pub mod download;
pub mod executor;
pub mod git;
pub mod shell;
pub mod web;

// ---------------------------------------------------------------------------
// Definitions and errors
// ---------------------------------------------------------------------------

/// Tool metadata surfaced to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (matches registry registration).
    pub name: String,
    /// Description shown to the LLM.
    pub description: String,
    /// JSON Schema object for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Broad grouping used for display and policy defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    System,
    Development,
    Network,
    Files,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Development => f.write_str("development"),
            Self::Network => f.write_str("network"),
            Self::Files => f.write_str("files"),
        }
    }
}

/// Errors produced inside tool implementations.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Input missing or malformed; never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The tool refused the operation (policy or configuration gate).
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The operation ran but failed below the success threshold.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A single executable capability.
///
/// Implementations must be `Send + Sync`; they are shared across the agent
/// loop's tasks behind an [`Arc`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// One-line description for the LLM.
    fn description(&self) -> &str;

    /// Broad grouping.
    fn category(&self) -> ToolCategory;

    /// Risk before looking at a concrete invocation.
    fn base_risk(&self) -> RiskLevel;

    /// Metadata (name, description, JSON-schema parameters).
    fn definition(&self) -> ToolDefinition;

    /// Per-call risk refinement (e.g. `git push --force` is high even
    /// though `git status` is low). Defaults to the base risk.
    fn risk_for(&self, _input: &ToolInput) -> RiskLevel {
        self.base_risk()
    }

    /// Validate an input without side effects.
    ///
    /// # Errors
    ///
    /// [`ToolError::InvalidInput`] describing the first problem found.
    fn validate(&self, input: &ToolInput) -> Result<(), ToolError>;

    /// Run the tool. Infrastructure problems are `Err`; an operation that
    /// ran but failed (non-zero exit, HTTP error status) is
    /// `Ok(ToolOutput { success: false, .. })`.
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ToolError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name → tool map. Duplicate registration is last-write-wins.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("count", &self.count())
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name. Replacing an existing entry is
    /// allowed and logged.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_owned();
        if let Ok(mut map) = self.tools.write() {
            if map.insert(name.clone(), tool).is_some() {
                warn!(tool = %name, "tool re-registered, previous entry replaced");
            } else {
                debug!(tool = %name, "tool registered");
            }
        }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().ok().and_then(|map| map.get(name).cloned())
    }

    /// Definitions of all registered tools, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let Ok(map) = self.tools.read() else {
            return Vec::new();
        };
        let mut defs: Vec<ToolDefinition> = map.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.read().map(|m| m.len()).unwrap_or(0)
    }
}
