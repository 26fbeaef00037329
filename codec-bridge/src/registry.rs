//! Process-wide bridge registry.
//!
//! Bridges are plain values; this is the opt-in place to keep named ones for
//! the life of a process, with explicit init and shutdown.

use std::sync::OnceLock;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::bridge::{AsyncCodecBridge, BridgeConfig};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("bridge '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct BridgeRegistry {
    bridges: DashMap<String, AsyncCodecBridge>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static BridgeRegistry {
        static GLOBAL: OnceLock<BridgeRegistry> = OnceLock::new();
        GLOBAL.get_or_init(BridgeRegistry::new)
    }

    /// Start a bridge under `name`. Must be called from within a tokio runtime.
    pub fn init(
        &self,
        name: impl Into<String>,
        config: BridgeConfig,
    ) -> Result<AsyncCodecBridge, RegistryError> {
        match self.bridges.entry(name.into()) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::info!(name = %entry.key(), "Registering codec bridge");
                let bridge = AsyncCodecBridge::new(config);
                entry.insert(bridge.clone());
                Ok(bridge)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<AsyncCodecBridge> {
        self.bridges.get(name).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bridges.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Remove and shut down one bridge. Returns false if no such bridge.
    pub async fn shutdown(&self, name: &str) -> bool {
        // Guard is released by `remove` before awaiting.
        let Some((_, bridge)) = self.bridges.remove(name) else {
            return false;
        };
        tracing::info!(name, "Shutting down codec bridge");
        bridge.shutdown().await;
        true
    }

    pub async fn shutdown_all(&self) {
        for name in self.names() {
            self.shutdown(&name).await;
        }
    }
}
