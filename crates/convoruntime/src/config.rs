use crate::streaming::StreamingConfig;
use convocore::FlowError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Deepest allowed sub-workflow nesting; the top-level run is depth 0.
    pub max_workflow_depth: usize,
    pub lock_ttl_secs: u64,
    pub lock_scope: String,
    pub purge_locks_on_start: bool,
    pub stream_channel_capacity: usize,
    pub event_buffer_size: usize,
    pub streaming: StreamingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workflow_depth: 16,
            lock_ttl_secs: 600,
            lock_scope: "default".to_string(),
            purge_locks_on_start: true,
            stream_channel_capacity: 64,
            event_buffer_size: 1000,
            streaming: StreamingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}
