use crate::events::EventEmitter;
use crate::lock::RunLocks;
use crate::resolver::{self, ContentVariables, FieldClass, TemplateMode};
use crate::services::{LlmCaller, WorkflowInvoker};
use crate::{ExecutionContext, NodeAddress, NodeError, PromptTemplate};
use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Raw tokens produced by a backend call. The end of the stream is the
/// terminal marker.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, NodeError>> + Send>>;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Type tag this handler was registered under (e.g. "llm.generate")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// What a node hands back to the processor.
pub enum NodeOutput {
    Text(String),
    /// Only legal for the elected responder of a streaming request.
    Stream(TokenStream),
    /// Stop the run; `last_output` is the best answer available so far.
    TerminateEarly { last_output: String },
}

impl NodeOutput {
    pub fn text(value: impl Into<String>) -> Self {
        NodeOutput::Text(value.into())
    }

    pub fn empty() -> Self {
        NodeOutput::Text(String::new())
    }
}

impl fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutput::Text(text) => f.debug_tuple("Text").field(text).finish(),
            NodeOutput::Stream(_) => f.write_str("Stream(..)"),
            NodeOutput::TerminateEarly { last_output } => f
                .debug_struct("TerminateEarly")
                .field("last_output", last_output)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// This node's output is the answer returned to the caller.
    Responder,
    Worker,
}

/// Collaborators reachable from node handlers.
#[derive(Clone)]
pub struct NodeServices {
    pub llm: Arc<dyn LlmCaller>,
    pub invoker: Arc<dyn WorkflowInvoker>,
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    /// 1-based position within the run
    pub position: usize,

    pub node_type: String,

    pub title: Option<String>,

    pub role: NodeRole,

    /// Snapshot of the run state: only outputs of earlier nodes are present.
    pub run: ExecutionContext,

    pub locks: RunLocks,

    pub services: NodeServices,

    /// Event emitter for real-time updates
    pub events: EventEmitter,
}

impl NodeContext {
    pub fn is_responder(&self) -> bool {
        self.role == NodeRole::Responder
    }

    /// A handler may return a stream only when this is true.
    pub fn may_stream(&self) -> bool {
        self.is_responder() && self.run.streaming_requested()
    }

    pub fn address(&self) -> NodeAddress {
        self.run.address(self.position)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.run.request.cancellation
    }

    /// Variable snapshot for this node's content fields.
    pub fn variables(&self, template: Option<&PromptTemplate>) -> ContentVariables {
        ContentVariables::collect(&self.run, template, chrono::Local::now().naive_local())
    }

    /// Resolve one content field with the default (untemplated) snapshot.
    pub fn resolve(&self, raw: &str, mode: TemplateMode) -> Result<String, NodeError> {
        resolver::resolve(raw, FieldClass::Content, mode, None, &self.run)
    }

    /// Output already elected for this request, if any.
    pub async fn elected_output(&self) -> Option<String> {
        self.run.request.responder.current_output().await
    }
}
