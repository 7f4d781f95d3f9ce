//! Engine configuration options.

use crate::feed::ReconnectPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ticks older than this are never used to evaluate triggers.
    pub staleness_window_ms: u64,
    /// Buffered ticks per symbol channel.
    pub channel_capacity: usize,
    /// Buffered events per broadcast subscriber before it starts lagging.
    pub event_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staleness_window_ms: 5_000,
            channel_capacity: 1_024,
            event_capacity: 1_024,
            reconnect: ReconnectPolicy::default(),
        }
    }
}
