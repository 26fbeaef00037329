//! Observable bridge state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Readiness of the bridge's worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeState {
    /// No worker
    #[default]
    Unloaded,
    /// Worker spawned, codec module loading
    Loading,
    /// Module loaded, no job in flight
    Ready,
    /// One job in flight
    Busy,
    /// Worker crashed or failed to load; the next submit respawns
    Failed,
}

impl BridgeState {
    /// Whether a worker with a loaded module is attached.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a bridge, published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeSnapshot {
    pub state: BridgeState,
    /// Generation of the current (or last) worker; 0 before the first spawn.
    pub generation: u64,
    /// Completed module loads across all workers.
    pub module_loads: u64,
    /// Jobs settled with a result.
    pub jobs_completed: u64,
    /// Cancelled or timed-out jobs the current worker has not answered yet.
    /// Non-zero means the next submit replaces the worker.
    pub abandoned_jobs: usize,
    /// When the current worker became ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_since: Option<DateTime<Utc>>,
}
