//! Persistence for per-user tool approval rules.
//!
//! Rules are keyed by user id and tool name and stored in a single YAML
//! file. Writes are atomic: serialize → write `<path>.tmp` → rename. The
//! in-memory copy is guarded by a read-write lock; every mutation persists
//! to disk under that lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Approval store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("approval store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The backing file exists but does not parse.
    #[error("approval store parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The in-memory lock was poisoned by a panicking writer.
    #[error("approval store lock poisoned")]
    Poisoned,
}

/// Stored rules for one tool under one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolRules {
    /// Every invocation of this tool is auto-approved.
    pub always_allow: bool,
    /// Command patterns that are auto-approved.
    pub allowed_patterns: Vec<String>,
    /// Command patterns that are hard-denied.
    pub denied_patterns: Vec<String>,
    /// Directories (absolute prefixes) where invocations are auto-approved.
    pub allowed_directories: Vec<String>,
    /// Directories where invocations are hard-denied.
    pub denied_directories: Vec<String>,
    /// Domains the tool may reach without approval.
    pub allowed_domains: Vec<String>,
}

/// All stored rules for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserApprovals {
    /// Owning user id (kept in the record for file readability).
    pub user_id: String,
    /// Rules keyed by tool name.
    pub tools: HashMap<String, ToolRules>,
}

/// YAML-backed store of [`UserApprovals`] keyed by user id.
#[derive(Debug)]
pub struct ApprovalStore {
    path: PathBuf,
    state: RwLock<HashMap<String, UserApprovals>>,
}

impl ApprovalStore {
    /// Open a store at `path`, loading existing rules.
    ///
    /// A missing file is not an error (empty state); a file that exists but
    /// fails to parse surfaces the parse error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Parse`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let loaded: HashMap<String, UserApprovals> = serde_yaml::from_str(&contents)?;
                info!(path = %path.display(), users = loaded.len(), "loaded approval rules");
                loaded
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no approval file, starting empty");
                HashMap::new()
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Rules for one user and tool, if any are stored.
    pub fn tool_rules(&self, user_id: &str, tool: &str) -> Option<ToolRules> {
        let state = self.state.read().ok()?;
        state.get(user_id).and_then(|u| u.tools.get(tool)).cloned()
    }

    /// Full rule set for one user, if any is stored.
    pub fn user_approvals(&self, user_id: &str) -> Option<UserApprovals> {
        let state = self.state.read().ok()?;
        state.get(user_id).cloned()
    }

    /// Mutate one user's rules for one tool, then persist.
    ///
    /// The entry is created on first use. The mutation and the disk write
    /// happen under the write lock, so concurrent updates serialize.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lock is poisoned or the write fails.
    pub fn update<F>(&self, user_id: &str, tool: &str, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ToolRules),
    {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let user = state
            .entry(user_id.to_owned())
            .or_insert_with(|| UserApprovals {
                user_id: user_id.to_owned(),
                tools: HashMap::new(),
            });
        let rules = user.tools.entry(tool.to_owned()).or_default();
        mutate(rules);
        Self::persist(&self.path, &state)
    }

    /// Force a persist of the current state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lock is poisoned or the write fails.
    pub fn save(&self) -> Result<(), StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Self::persist(&self.path, &state)
    }

    /// Atomic write: serialize → `<path>.tmp` → rename.
    ///
    /// On rename failure the temp file is removed before surfacing the error.
    fn persist(path: &Path, state: &HashMap<String, UserApprovals>) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755));
                }
            }
        }

        let serialized = serde_yaml::to_string(state)?;
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, serialized)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o644));
        }

        if let Err(e) = std::fs::rename(&tmp_path, path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(StoreError::Io(e));
        }
        Ok(())
    }
}
