//! Contracts for the collaborators the engine calls out to.

use crate::{ChatMessage, FlowError, NodeContext, NodeError, NodeOutput, PromptTemplate, TokenStream, WorkflowDefinition};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A generate-text request for one backend endpoint.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Backend identifier, resolved from the node's configuration.
    pub endpoint: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
    pub cancellation: CancellationToken,
}

pub enum LlmResponse {
    Text(String),
    Stream(TokenStream),
}

/// Translates a generic request into a backend's wire format.
#[async_trait]
pub trait LlmCaller: Send + Sync {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, NodeError>;

    /// Turn wrapping used for the `templated_*` conversation variables.
    fn prompt_template(&self, _endpoint: &str) -> Option<PromptTemplate> {
        None
    }
}

#[async_trait]
pub trait WorkflowLoader: Send + Sync {
    async fn load(&self, name: &str) -> Result<Arc<WorkflowDefinition>, FlowError>;

    async fn list(&self) -> Result<Vec<String>, FlowError> {
        Ok(Vec::new())
    }
}

/// A nested run requested by a sub-workflow or branch node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubWorkflowCall {
    pub workflow: String,
    /// Becomes the child's agent inputs, in order.
    pub scoped_inputs: Vec<String>,
}

/// How nodes reach back into the processor for nested runs.
#[async_trait]
pub trait WorkflowInvoker: Send + Sync {
    /// Run the child to completion. Returns `Text` with the child's result or
    /// `TerminateEarly` when the child was cut short.
    async fn invoke(&self, parent: &NodeContext, call: SubWorkflowCall) -> Result<NodeOutput, FlowError>;
}
