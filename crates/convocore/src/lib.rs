//! Core abstractions for the conversation workflow engine
//!
//! This crate provides the types and traits every other component depends
//! on: workflow definitions, run contexts, the node contract, variable
//! resolution, the lock manager and the collaborator interfaces. It runs no
//! workflows itself.

mod context;
mod error;
pub mod events;
pub mod lock;
mod message;
mod node;
pub mod resolver;
pub mod services;
mod workflow;

pub use context::{
    AgentInputs, AgentOutputs, ExecutionContext, NodeAddress, RequestContext, RequestId,
    ResponderClaim, ResponderResult, ResponderSlot, ResponseChunk, RunState, RunStatus,
};
pub use error::{FlowError, LockError, NodeError, WorkflowError};
pub use events::*;
pub use lock::{InMemoryLockStore, Lock, LockAcquisition, LockKey, LockManager, LockStore, RunLocks};
pub use message::{ChatMessage, PromptTemplate, Role};
pub use node::{Node, NodeContext, NodeOutput, NodeRole, NodeServices, TokenStream};
pub use resolver::{FieldClass, TemplateMode};
pub use services::{LlmCaller, LlmRequest, LlmResponse, SubWorkflowCall, WorkflowInvoker, WorkflowLoader};
pub use workflow::{parse_flag, ConfigFlag, NodeSpec, WorkflowDefinition};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
