//! Workflow execution runtime
//!
//! This crate runs conversation workflows: it resolves node configuration,
//! elects the responder, drives nodes in order, cleans responder streams and
//! exposes the [`WorkflowManager`] entry point.

mod config;
mod loader;
mod manager;
mod processor;
mod registry;
pub mod streaming;

pub use config::RuntimeConfig;
pub use loader::{DirectoryWorkflowLoader, InMemoryWorkflowLoader};
pub use manager::{
    CancellationRegistry, ResponseStream, StreamingResponse, WorkflowManager, WorkflowRequest,
    WorkflowResponse,
};
pub use processor::{RunOutcome, WorkflowOutcome, WorkflowProcessor};
pub use registry::{FieldDefinition, NodeFactory, NodeMetadata, NodeRegistry, ResolvedNodeSpec};
pub use streaming::{ReasoningTags, StreamPipeline, StreamingConfig};
