//! Per-request and per-run execution state.
//!
//! A [`RequestContext`] is shared by every run in one request's call tree
//! (top-level run plus nested sub-workflow runs). An [`ExecutionContext`]
//! belongs to exactly one run and is discarded when that run returns.

use crate::{ChatMessage, FlowError, WorkflowDefinition, WorkflowError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub type RequestId = String;

/// Item delivered to a streaming caller.
pub type ResponseChunk = Result<String, FlowError>;

/// State shared by every run serving one top-level request.
pub struct RequestContext {
    pub request_id: RequestId,
    pub discussion_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub cancellation: CancellationToken,
    pub responder: ResponderSlot,
}

impl RequestContext {
    pub fn new(request_id: impl Into<RequestId>, messages: Vec<ChatMessage>) -> Self {
        Self {
            request_id: request_id.into(),
            discussion_id: None,
            messages,
            stream: false,
            cancellation: CancellationToken::new(),
            responder: ResponderSlot::new(),
        }
    }

    pub fn with_discussion_id(mut self, discussion_id: impl Into<String>) -> Self {
        self.discussion_id = Some(discussion_id.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Mark the request as streaming; elected output is pushed into `sink`.
    pub fn with_stream_sink(mut self, sink: mpsc::Sender<ResponseChunk>) -> Self {
        self.stream = true;
        self.responder = ResponderSlot::with_sink(sink);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Completed,
    TerminatedEarly,
    Failed,
}

/// `Pending -> Running(index) -> Finished(status)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    /// 0-based index of the node executing.
    Running(usize),
    Finished(RunStatus),
}

/// Where a node sits in the call tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAddress {
    pub workflow: String,
    pub depth: usize,
    /// 1-based position within its workflow.
    pub position: usize,
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.workflow, self.position, self.depth)
    }
}

/// The single output surfaced to the original caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponderResult {
    pub node: NodeAddress,
    pub output: String,
}

/// How the current responder got its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderClaim {
    /// Last top-level node, chosen because nothing asked to respond.
    Default,
    /// A node with `returnToUser` set.
    Explicit,
}

#[derive(Default)]
struct ResponderState {
    claim: Option<ResponderClaim>,
    result: Option<ResponderResult>,
    streamed: bool,
}

/// Request-wide election of the responder node.
///
/// A default claim is tentative: an explicit claim replaces it as long as no
/// output was recorded yet. An explicit claim is final. The first recorded
/// result wins, so when a nested responder records its output the enclosing
/// sub-workflow node that forwards it does not replace the address.
pub struct ResponderSlot {
    state: Mutex<ResponderState>,
    sink: Option<mpsc::Sender<ResponseChunk>>,
}

impl ResponderSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ResponderState::default()),
            sink: None,
        }
    }

    pub fn with_sink(sink: mpsc::Sender<ResponseChunk>) -> Self {
        Self {
            state: Mutex::new(ResponderState::default()),
            sink: Some(sink),
        }
    }

    /// Returns true if this call won the election.
    pub async fn try_claim(&self, kind: ResponderClaim) -> bool {
        let mut state = self.state.lock().await;
        let won = match (state.claim, kind) {
            (None, _) => true,
            (Some(ResponderClaim::Default), ResponderClaim::Explicit) => state.result.is_none(),
            _ => false,
        };
        if won {
            state.claim = Some(kind);
        }
        won
    }

    pub async fn claim(&self) -> Option<ResponderClaim> {
        self.state.lock().await.claim
    }

    pub async fn record(&self, node: NodeAddress, output: &str) {
        let mut state = self.state.lock().await;
        state.claim.get_or_insert(ResponderClaim::Default);
        if state.result.is_none() {
            state.result = Some(ResponderResult {
                node,
                output: output.to_string(),
            });
        }
    }

    pub async fn result(&self) -> Option<ResponderResult> {
        self.state.lock().await.result.clone()
    }

    pub async fn current_output(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .result
            .as_ref()
            .map(|r| r.output.clone())
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }

    pub async fn has_streamed(&self) -> bool {
        self.state.lock().await.streamed
    }

    pub async fn mark_streamed(&self) {
        self.state.lock().await.streamed = true;
    }

    /// Push a chunk to the streaming caller. Returns false when there is no
    /// caller listening any more.
    pub async fn send(&self, chunk: ResponseChunk) -> bool {
        match &self.sink {
            Some(sink) => sink.send(chunk).await.is_ok(),
            None => false,
        }
    }
}

impl Default for ResponderSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Outputs produced by the nodes of one run, keyed by 1-based position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutputs(BTreeMap<usize, String>);

impl AgentOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, position: usize) -> Option<&str> {
        self.0.get(&position).map(String::as_str)
    }

    /// Record a node's output. Each position is written at most once.
    pub fn insert(&mut self, position: usize, output: String) -> Result<(), WorkflowError> {
        if self.0.contains_key(&position) {
            return Err(WorkflowError::OutputAlreadySet(position));
        }
        self.0.insert(position, output);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Values handed down positionally from a parent run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentInputs(Vec<String>);

impl AgentInputs {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    /// 1-based lookup.
    pub fn get(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|index| self.0.get(index))
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0
            .iter()
            .enumerate()
            .map(|(index, value)| (index + 1, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for AgentInputs {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}

/// Mutable state of one workflow run.
#[derive(Clone)]
pub struct ExecutionContext {
    pub request: Arc<RequestContext>,
    pub workflow: String,
    /// 0 for the top-level run.
    pub depth: usize,
    pub agent_inputs: AgentInputs,
    pub agent_outputs: AgentOutputs,
    pub static_variables: Arc<HashMap<String, String>>,
}

impl ExecutionContext {
    pub fn new(
        request: Arc<RequestContext>,
        definition: &WorkflowDefinition,
        depth: usize,
        agent_inputs: AgentInputs,
    ) -> Self {
        Self {
            request,
            workflow: definition.name.clone(),
            depth,
            agent_inputs,
            agent_outputs: AgentOutputs::new(),
            static_variables: Arc::clone(&definition.static_variables),
        }
    }

    pub fn conversation(&self) -> &[ChatMessage] {
        &self.request.messages
    }

    pub fn discussion_id(&self) -> Option<&str> {
        self.request.discussion_id.as_deref()
    }

    pub fn request_id(&self) -> &str {
        &self.request.request_id
    }

    pub fn streaming_requested(&self) -> bool {
        self.request.stream
    }

    pub fn address(&self, position: usize) -> NodeAddress {
        NodeAddress {
            workflow: self.workflow.clone(),
            depth: self.depth,
            position,
        }
    }
}
