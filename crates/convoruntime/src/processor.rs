use crate::config::RuntimeConfig;
use crate::registry::NodeRegistry;
use crate::streaming::StreamPipeline;
use async_trait::async_trait;
use chrono::Utc;
use convocore::resolver::ConfigurationScope;
use convocore::services::{LlmCaller, SubWorkflowCall, WorkflowInvoker, WorkflowLoader};
use convocore::{
    AgentInputs, AgentOutputs, EventBus, ExecutionContext, ExecutionEvent, ExecutionId, FlowError,
    LockManager, Node, NodeContext, NodeError, NodeOutput, NodeRole, NodeServices, RequestContext,
    ResponderClaim, ResponderResult, RunLocks, RunState, RunStatus, TokenStream, WorkflowDefinition,
    WorkflowError,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where a run sits in the call tree, as far as the election cares.
#[derive(Debug, Clone, Copy)]
struct RunFrame {
    depth: usize,
    /// Set when the node that started this run is the responder: this run
    /// supplies the answer under the same kind of claim.
    delegated: Option<ResponderClaim>,
}

impl RunFrame {
    fn top_level() -> Self {
        Self {
            depth: 0,
            delegated: None,
        }
    }
}

/// A handler built by the configuration pre-pass.
struct PlannedNode {
    node_type: String,
    title: Option<String>,
    return_to_user: bool,
    handler: Box<dyn Node>,
}

/// Result of a single run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// The run's own answer: its `returnToUser` node, else its last node. For
    /// an early stop, the best answer available when it stopped.
    pub output: String,
    pub agent_outputs: AgentOutputs,
}

/// Result of a top-level request.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub status: RunStatus,
    pub responder: Option<ResponderResult>,
    /// What the caller receives.
    pub answer: String,
    /// Outputs of the top-level run only.
    pub agent_outputs: AgentOutputs,
}

/// Runs workflows node by node, electing one responder per request.
pub struct WorkflowProcessor {
    registry: Arc<NodeRegistry>,
    loader: Arc<dyn WorkflowLoader>,
    llm: Arc<dyn LlmCaller>,
    locks: Arc<LockManager>,
    events: Arc<EventBus>,
    config: RuntimeConfig,
}

impl WorkflowProcessor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        loader: Arc<dyn WorkflowLoader>,
        llm: Arc<dyn LlmCaller>,
        locks: Arc<LockManager>,
        events: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            loader,
            llm,
            locks,
            events,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &Arc<dyn WorkflowLoader> {
        &self.loader
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Execute a top-level request and settle its answer.
    ///
    /// For streaming requests the answer is also pushed into the request's
    /// sink unless the responder already streamed it.
    pub async fn respond(
        self: &Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        request: Arc<RequestContext>,
    ) -> Result<WorkflowOutcome, FlowError> {
        let services = NodeServices {
            llm: self.llm.clone(),
            invoker: self.clone(),
        };

        let outcome = self
            .execute_run(
                definition,
                request.clone(),
                AgentInputs::default(),
                RunFrame::top_level(),
                services,
            )
            .await?;

        let slot = &request.responder;
        let responder = slot.result().await;
        let answer = match &responder {
            Some(result) => result.output.clone(),
            None => outcome.output.clone(),
        };

        if slot.is_streaming() && !slot.has_streamed().await {
            slot.mark_streamed().await;
            if !answer.is_empty() && !slot.send(Ok(answer.clone())).await {
                debug!("Request {} finished after its caller left", request.request_id);
            }
        }

        Ok(WorkflowOutcome {
            status: outcome.status,
            responder,
            answer,
            agent_outputs: outcome.agent_outputs,
        })
    }

    async fn execute_run(
        &self,
        definition: Arc<WorkflowDefinition>,
        request: Arc<RequestContext>,
        inputs: AgentInputs,
        frame: RunFrame,
        services: NodeServices,
    ) -> Result<RunOutcome, FlowError> {
        if frame.depth > self.config.max_workflow_depth {
            return Err(WorkflowError::RecursionLimit {
                workflow: definition.name.clone(),
                limit: self.config.max_workflow_depth,
            }
            .into());
        }

        let execution_id = ExecutionId::new_v4();
        let start_time = Instant::now();

        self.events.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow: definition.name.clone(),
            request_id: request.request_id.clone(),
            depth: frame.depth,
            timestamp: Utc::now(),
        });

        info!(
            "Starting workflow '{}' (request {}, depth {})",
            definition.name, request.request_id, frame.depth
        );

        let mut ctx = ExecutionContext::new(request, &definition, frame.depth, inputs);
        let locks = RunLocks::new(self.locks.clone());
        let mut state = RunState::Pending;

        let result = match self.plan(&definition, &ctx) {
            Ok(plan) => {
                self.execute_plan(execution_id, &plan, &mut ctx, &locks, frame, &services, &mut state)
                    .await
            }
            Err(e) => Err(e),
        };

        // Every exit path of the run passes here.
        locks.release_all().await;

        let status = match &result {
            Ok(outcome) => outcome.status,
            Err(_) => RunStatus::Failed,
        };
        state = RunState::Finished(status);
        let duration_ms = start_time.elapsed().as_millis() as u64;

        self.events.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            workflow: definition.name.clone(),
            status,
            duration_ms,
            timestamp: Utc::now(),
        });

        match &result {
            Ok(_) => info!(
                "Workflow '{}' finished in {}ms ({:?})",
                definition.name, duration_ms, state
            ),
            Err(e) => error!("Workflow '{}' failed: {}", definition.name, e),
        }

        result
    }

    /// Configuration pre-pass: resolve configuration fields and build every
    /// handler before the first node runs.
    fn plan(
        &self,
        definition: &WorkflowDefinition,
        ctx: &ExecutionContext,
    ) -> Result<Vec<PlannedNode>, FlowError> {
        definition.validate()?;
        let scope = ConfigurationScope::from_context(ctx);

        let mut plan = Vec::with_capacity(definition.nodes.len());
        for (index, spec) in definition.nodes.iter().enumerate() {
            let resolved = self.registry.resolve_spec(spec, &scope)?;
            debug!(
                "Planned node {} of '{}' as '{}'",
                index + 1,
                definition.name,
                resolved.node_type
            );
            let handler = self.registry.create_node(&resolved)?;
            plan.push(PlannedNode {
                node_type: resolved.node_type,
                title: resolved.title,
                return_to_user: resolved.return_to_user,
                handler,
            });
        }

        let marked = plan.iter().filter(|node| node.return_to_user).count();
        if marked > 1 {
            return Err(WorkflowError::Invalid(format!(
                "'{}' resolves {} nodes with returnToUser",
                definition.name, marked
            ))
            .into());
        }

        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_plan(
        &self,
        execution_id: ExecutionId,
        plan: &[PlannedNode],
        ctx: &mut ExecutionContext,
        locks: &RunLocks,
        frame: RunFrame,
        services: &NodeServices,
        state: &mut RunState,
    ) -> Result<RunOutcome, FlowError> {
        let local_responder = plan.iter().position(|node| node.return_to_user);
        let last_index = plan.len().checked_sub(1);
        let mut local_result: Option<String> = None;
        let mut last_output = String::new();

        for (index, planned) in plan.iter().enumerate() {
            *state = RunState::Running(index);
            if ctx.request.is_cancelled() {
                info!("Request {} cancelled before node {}", ctx.request_id(), index + 1);
                return Err(FlowError::Cancelled);
            }

            let position = index + 1;
            let role = self
                .elect(ctx, index, planned, local_responder, last_index, frame)
                .await;
            if role == NodeRole::Responder {
                debug!("Node {} elected responder", ctx.address(position));
                self.events.emit(ExecutionEvent::ResponderElected {
                    execution_id,
                    node: ctx.address(position),
                    timestamp: Utc::now(),
                });
            }

            let node_ctx = NodeContext {
                position,
                node_type: planned.node_type.clone(),
                title: planned.title.clone(),
                role,
                run: ctx.clone(),
                locks: locks.clone(),
                services: services.clone(),
                events: self.events.create_emitter(execution_id, position),
            };

            self.events.emit(ExecutionEvent::NodeStarted {
                execution_id,
                position,
                node_type: planned.node_type.clone(),
                responder: role == NodeRole::Responder,
                timestamp: Utc::now(),
            });
            info!(
                "Executing node {} ({}) of '{}'",
                position,
                planned.title.as_deref().unwrap_or(&planned.node_type),
                ctx.workflow
            );

            let start = Instant::now();
            let output = match planned.handler.execute(node_ctx).await {
                Ok(output) => output,
                Err(e) => return Err(self.node_failed(execution_id, ctx, position, e)),
            };

            let text = match output {
                NodeOutput::Text(text) => {
                    if role == NodeRole::Responder {
                        self.deliver_text(ctx, position, &text).await;
                    }
                    text
                }
                NodeOutput::Stream(stream) => {
                    if role != NodeRole::Responder {
                        let e = NodeError::StreamingNotAllowed { position };
                        return Err(self.node_failed(execution_id, ctx, position, e));
                    }
                    self.deliver_stream(execution_id, ctx, position, stream).await?
                }
                NodeOutput::TerminateEarly { last_output } => {
                    info!(
                        "Node {} of '{}' ended the run early",
                        position, ctx.workflow
                    );
                    return Ok(RunOutcome {
                        status: RunStatus::TerminatedEarly,
                        output: last_output,
                        agent_outputs: ctx.agent_outputs.clone(),
                    });
                }
            };

            let duration_ms = start.elapsed().as_millis() as u64;
            info!("Node {} completed in {}ms", position, duration_ms);
            self.events.emit(ExecutionEvent::NodeCompleted {
                execution_id,
                position,
                output: text.clone(),
                duration_ms,
                timestamp: Utc::now(),
            });

            ctx.agent_outputs.insert(position, text.clone())?;
            if local_responder == Some(index) {
                local_result = Some(text.clone());
            }
            last_output = text;
        }

        Ok(RunOutcome {
            status: RunStatus::Completed,
            output: local_result.unwrap_or(last_output),
            agent_outputs: ctx.agent_outputs.clone(),
        })
    }

    /// Decide the role of one node.
    ///
    /// A `returnToUser` node anywhere in the call tree takes the request-wide
    /// slot with an explicit claim. The last top-level node takes it with a
    /// default claim, which an explicit node may still replace until output is
    /// recorded. A delegated run answers for its parent: its own marked node,
    /// else its last node, responds under the inherited claim.
    async fn elect(
        &self,
        ctx: &ExecutionContext,
        index: usize,
        planned: &PlannedNode,
        local_responder: Option<usize>,
        last_index: Option<usize>,
        frame: RunFrame,
    ) -> NodeRole {
        let slot = &ctx.request.responder;

        if let Some(inherited) = frame.delegated {
            if local_responder.or(last_index) != Some(index) {
                return NodeRole::Worker;
            }
            let holds = match inherited {
                ResponderClaim::Explicit => true,
                ResponderClaim::Default if planned.return_to_user => {
                    slot.try_claim(ResponderClaim::Explicit).await
                }
                // Superseded if a marked node elsewhere claimed meanwhile.
                ResponderClaim::Default => slot.claim().await == Some(ResponderClaim::Default),
            };
            return if holds {
                NodeRole::Responder
            } else {
                debug!(
                    "Node {} gives up the inherited responder role",
                    ctx.address(index + 1)
                );
                NodeRole::Worker
            };
        }

        let kind = if planned.return_to_user {
            ResponderClaim::Explicit
        } else if frame.depth == 0 && last_index == Some(index) {
            ResponderClaim::Default
        } else {
            return NodeRole::Worker;
        };

        if slot.try_claim(kind).await {
            NodeRole::Responder
        } else {
            if kind == ResponderClaim::Explicit {
                warn!(
                    "Node {} asks to respond but another node already answers this request",
                    ctx.address(index + 1)
                );
            }
            NodeRole::Worker
        }
    }

    async fn deliver_text(&self, ctx: &ExecutionContext, position: usize, text: &str) {
        let slot = &ctx.request.responder;
        slot.record(ctx.address(position), text).await;

        if slot.is_streaming() && !slot.has_streamed().await {
            slot.mark_streamed().await;
            if !text.is_empty() && !slot.send(Ok(text.to_string())).await {
                warn!(
                    "Caller of request {} is gone; continuing without it",
                    ctx.request_id()
                );
            }
        }
    }

    /// Pump the responder's cleaned stream into the caller and return the
    /// full text once the last token has been produced.
    async fn deliver_stream(
        &self,
        execution_id: ExecutionId,
        ctx: &ExecutionContext,
        position: usize,
        raw: TokenStream,
    ) -> Result<String, FlowError> {
        let request = &ctx.request;
        let slot = &request.responder;
        let mut cleaned =
            StreamPipeline::new(&self.config.streaming, request.cancellation.clone()).process(raw);

        let mut client_connected = slot.is_streaming();
        if client_connected {
            slot.mark_streamed().await;
        }

        let mut full = String::new();
        let mut chunks = 0usize;
        while let Some(chunk) = cleaned.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Err(self.node_failed(execution_id, ctx, position, e)),
            };
            full.push_str(&chunk);
            chunks += 1;
            if client_connected && !slot.send(Ok(chunk)).await {
                warn!(
                    "Caller of request {} stopped reading; keeping {} bytes and finishing the run",
                    ctx.request_id(),
                    full.len()
                );
                client_connected = false;
                break;
            }
        }
        drop(cleaned);

        self.events.emit(ExecutionEvent::StreamDrained {
            execution_id,
            position,
            chunks,
            client_connected,
            timestamp: Utc::now(),
        });

        if request.is_cancelled() {
            info!("Request {} cancelled while streaming", ctx.request_id());
            return Err(FlowError::Cancelled);
        }

        slot.record(ctx.address(position), &full).await;
        debug!("Stream of node {} drained after {} chunks", ctx.address(position), chunks);
        Ok(full)
    }

    fn node_failed(
        &self,
        execution_id: ExecutionId,
        ctx: &ExecutionContext,
        position: usize,
        e: NodeError,
    ) -> FlowError {
        error!("Node {} failed: {}", ctx.address(position), e);
        self.events.emit(ExecutionEvent::NodeFailed {
            execution_id,
            position,
            error: e.to_string(),
            timestamp: Utc::now(),
        });
        e.into()
    }
}

#[async_trait]
impl WorkflowInvoker for WorkflowProcessor {
    async fn invoke(
        &self,
        parent: &NodeContext,
        call: SubWorkflowCall,
    ) -> Result<NodeOutput, FlowError> {
        let definition = self.loader.load(&call.workflow).await?;
        let delegated = if parent.is_responder() {
            parent.run.request.responder.claim().await
        } else {
            None
        };
        let frame = RunFrame {
            depth: parent.run.depth + 1,
            delegated,
        };
        debug!(
            "Node {} calls '{}' with {} scoped inputs",
            parent.address(),
            call.workflow,
            call.scoped_inputs.len()
        );

        let outcome = self
            .execute_run(
                definition,
                parent.run.request.clone(),
                AgentInputs::new(call.scoped_inputs),
                frame,
                parent.services.clone(),
            )
            .await?;

        Ok(match outcome.status {
            RunStatus::TerminatedEarly => NodeOutput::TerminateEarly {
                last_output: outcome.output,
            },
            _ => NodeOutput::Text(outcome.output),
        })
    }
}
