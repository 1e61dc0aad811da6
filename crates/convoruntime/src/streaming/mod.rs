//! Token clean-up between a backend stream and the caller.

mod pipeline;
mod prefix;
mod reasoning;

pub use pipeline::StreamPipeline;
pub use prefix::PrefixStripper;
pub use reasoning::ReasoningFilter;

use serde::{Deserialize, Serialize};

/// Tag pair delimiting hidden model reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningTags {
    pub start: String,
    pub end: String,
}

impl Default for ReasoningTags {
    fn default() -> Self {
        Self {
            start: "<think>".to_string(),
            end: "</think>".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// `None` disables reasoning removal.
    pub reasoning: Option<ReasoningTags>,
    pub strip_prefixes: Vec<String>,
    /// Bytes held back while looking for a leading prefix.
    pub prefix_buffer_limit: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            reasoning: Some(ReasoningTags::default()),
            strip_prefixes: vec!["Assistant:".to_string()],
            prefix_buffer_limit: 64,
        }
    }
}
