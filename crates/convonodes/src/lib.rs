//! Standard node library
//!
//! The four canonical conversation nodes and an OpenAI-compatible backend
//! caller.

mod conditional;
mod llm;
mod lock;
pub mod openai;
mod workflow;

pub use conditional::{ConditionalBranchNode, ConditionalBranchNodeFactory, WORKFLOW_BRANCH};
pub use llm::{LlmGenerateNode, LlmGenerateNodeFactory, LLM_GENERATE};
pub use lock::{LockNode, LockNodeFactory, WORKFLOW_LOCK};
pub use openai::{EndpointConfig, OpenAiCompatibleCaller};
pub use workflow::{SubWorkflowNode, SubWorkflowNodeFactory, WORKFLOW_CALL};
use convoruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(llm::LlmGenerateNodeFactory));
    registry.register(Arc::new(workflow::SubWorkflowNodeFactory));
    registry.register(Arc::new(conditional::ConditionalBranchNodeFactory));
    registry.register(Arc::new(lock::LockNodeFactory));
}
