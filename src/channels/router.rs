//! Channel router: adapter registry with uniform lifecycle control.
//!
//! Registers adapters by name, starts the enabled ones, and stops them all
//! on shutdown. Deliberately no fan-in multiplexing here — the agent loop
//! reads each adapter's `incoming()` stream individually so per-adapter
//! backpressure stays visible.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{error, info};

use super::{ChannelAdapter, ChannelError};

/// Name → adapter registry.
#[derive(Default)]
pub struct ChannelRouter {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl ChannelRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name.
    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.name().to_owned();
        if let Ok(mut map) = self.adapters.write() {
            info!(channel = %name, enabled = adapter.is_enabled(), "channel registered");
            map.insert(name, adapter);
        }
    }

    /// Look up an adapter.
    ///
    /// # Errors
    ///
    /// [`ChannelError::NotFound`] for unknown names.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
        self.adapters
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
            .ok_or_else(|| ChannelError::NotFound(name.to_owned()))
    }

    /// All registered adapters.
    pub fn all(&self) -> Vec<Arc<dyn ChannelAdapter>> {
        self.adapters
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Registered adapter names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .adapters
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Start every enabled adapter, surfacing the first start error.
    ///
    /// # Errors
    ///
    /// The first adapter start failure, verbatim.
    pub async fn start_all(&self) -> Result<(), ChannelError> {
        for adapter in self.all() {
            if !adapter.is_enabled() {
                info!(channel = adapter.name(), "skipping disabled channel");
                continue;
            }
            info!(channel = adapter.name(), "starting channel");
            adapter.start().await?;
        }
        Ok(())
    }

    /// Stop every adapter, aggregating errors instead of stopping early.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Aggregate`] listing every failure.
    pub async fn stop_all(&self) -> Result<(), ChannelError> {
        let mut failures: Vec<String> = Vec::new();
        for adapter in self.all() {
            if let Err(e) = adapter.stop().await {
                error!(channel = adapter.name(), error = %e, "channel stop failed");
                failures.push(format!("{}: {e}", adapter.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::Aggregate(failures.join("; ")))
        }
    }
}

impl std::fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("channels", &self.names())
            .finish()
    }
}
