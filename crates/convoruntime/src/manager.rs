use crate::config::RuntimeConfig;
use crate::processor::{WorkflowOutcome, WorkflowProcessor};
use crate::registry::NodeRegistry;
use convocore::services::{LlmCaller, WorkflowLoader};
use convocore::{
    ChatMessage, EventBus, ExecutionEvent, FlowError, InMemoryLockStore, LockManager, LockStore,
    RequestContext, RequestId, ResponseChunk,
};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One incoming conversation request.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub workflow: String,
    pub messages: Vec<ChatMessage>,
    pub discussion_id: Option<String>,
    /// Generated when absent.
    pub request_id: Option<RequestId>,
    pub stream: bool,
}

impl WorkflowRequest {
    pub fn new(workflow: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            workflow: workflow.into(),
            messages,
            discussion_id: None,
            request_id: None,
            stream: false,
        }
    }

    pub fn with_discussion_id(mut self, discussion_id: impl Into<String>) -> Self {
        self.discussion_id = Some(discussion_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = ResponseChunk> + Send>>;

/// A streaming answer. Tokens arrive on `tokens`; `completion` resolves once
/// every node of the request has run. It yields `None` when the run failed,
/// in which case the error was the last item on `tokens`.
pub struct StreamingResponse {
    pub request_id: RequestId,
    pub tokens: ResponseStream,
    pub completion: JoinHandle<Option<WorkflowOutcome>>,
}

pub enum WorkflowResponse {
    Text(String),
    Stream(StreamingResponse),
}

/// Cancellation tokens of in-flight requests.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails when a request with the same id is still running.
    pub async fn register(&self, request_id: &str) -> Result<CancellationToken, FlowError> {
        let mut tokens = self.tokens.lock().await;
        if tokens.contains_key(request_id) {
            return Err(FlowError::DuplicateRequest(request_id.to_string()));
        }
        let token = CancellationToken::new();
        tokens.insert(request_id.to_string(), token.clone());
        Ok(token)
    }

    pub async fn unregister(&self, request_id: &str) {
        self.tokens.lock().await.remove(request_id);
    }

    /// Returns false if no such request is in flight.
    pub async fn cancel(&self, request_id: &str) -> bool {
        match self.tokens.lock().await.get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

}

/// Main entry point: loads the named workflow and runs it for one request.
pub struct WorkflowManager {
    processor: Arc<WorkflowProcessor>,
    locks: Arc<LockManager>,
    cancellations: Arc<CancellationRegistry>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
}

impl WorkflowManager {
    /// Create a manager backed by an in-process lock table
    pub fn new(
        registry: Arc<NodeRegistry>,
        loader: Arc<dyn WorkflowLoader>,
        llm: Arc<dyn LlmCaller>,
        config: RuntimeConfig,
    ) -> Self {
        Self::with_lock_store(registry, loader, llm, Arc::new(InMemoryLockStore::new()), config)
    }

    pub fn with_lock_store(
        registry: Arc<NodeRegistry>,
        loader: Arc<dyn WorkflowLoader>,
        llm: Arc<dyn LlmCaller>,
        lock_store: Arc<dyn LockStore>,
        config: RuntimeConfig,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let locks = Arc::new(LockManager::new(
            lock_store,
            config.lock_ttl(),
            config.lock_scope.clone(),
        ));
        let processor = Arc::new(WorkflowProcessor::new(
            registry,
            loader,
            llm,
            locks.clone(),
            event_bus.clone(),
            config.clone(),
        ));

        Self {
            processor,
            locks,
            cancellations: Arc::new(CancellationRegistry::new()),
            event_bus,
            config,
        }
    }

    /// Startup housekeeping: drops locks left behind by a previous process
    /// when `purge_locks_on_start` is set.
    pub async fn initialize(&self) -> Result<usize, FlowError> {
        if !self.config.purge_locks_on_start {
            return Ok(0);
        }
        let purged = self.locks.purge_default_scope().await?;
        if purged > 0 {
            info!(
                "Purged {} stale locks in scope '{}'",
                purged,
                self.locks.default_scope()
            );
        }
        Ok(purged)
    }

    pub fn processor(&self) -> &Arc<WorkflowProcessor> {
        &self.processor
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Signal cancellation for an in-flight request.
    pub async fn cancel(&self, request_id: &str) -> bool {
        let found = self.cancellations.cancel(request_id).await;
        if found {
            info!("Cancellation requested for {}", request_id);
        } else {
            debug!("Cancel for unknown request {}", request_id);
        }
        found
    }

    pub async fn run(&self, request: WorkflowRequest) -> Result<WorkflowResponse, FlowError> {
        if request.stream {
            Ok(WorkflowResponse::Stream(self.run_streaming(request).await?))
        } else {
            Ok(WorkflowResponse::Text(self.execute(request).await?.answer))
        }
    }

    /// Run a request to completion without streaming.
    pub async fn execute(&self, request: WorkflowRequest) -> Result<WorkflowOutcome, FlowError> {
        let definition = self.processor.loader().load(&request.workflow).await?;
        let request_id = request.request_id.clone().unwrap_or_else(new_request_id);
        let token = self.cancellations.register(&request_id).await?;

        let mut context = RequestContext::new(request_id.clone(), request.messages)
            .with_cancellation(token);
        if let Some(discussion_id) = request.discussion_id {
            context = context.with_discussion_id(discussion_id);
        }

        let result = self.processor.respond(definition, Arc::new(context)).await;
        self.cancellations.unregister(&request_id).await;
        result
    }

    /// Start a streaming request. Loading happens before this returns, so a
    /// missing workflow is reported directly.
    pub async fn run_streaming(
        &self,
        request: WorkflowRequest,
    ) -> Result<StreamingResponse, FlowError> {
        let definition = self.processor.loader().load(&request.workflow).await?;
        let request_id = request.request_id.clone().unwrap_or_else(new_request_id);
        let token = self.cancellations.register(&request_id).await?;

        let (sink, receiver) = mpsc::channel(self.config.stream_channel_capacity.max(1));
        let mut context = RequestContext::new(request_id.clone(), request.messages)
            .with_cancellation(token.clone())
            .with_stream_sink(sink);
        if let Some(discussion_id) = request.discussion_id {
            context = context.with_discussion_id(discussion_id);
        }
        let context = Arc::new(context);

        let processor = self.processor.clone();
        let cancellations = self.cancellations.clone();
        let task_request_id = request_id.clone();
        let completion = tokio::spawn(async move {
            let result = processor.respond(definition, context.clone()).await;
            cancellations.unregister(&task_request_id).await;
            match result {
                Ok(outcome) => Some(outcome),
                Err(FlowError::Cancelled) => {
                    debug!("Streaming request {} cancelled", task_request_id);
                    None
                }
                Err(e) => {
                    warn!("Streaming request {} failed: {}", task_request_id, e);
                    context.responder.send(Err(e)).await;
                    None
                }
            }
        });

        Ok(StreamingResponse {
            request_id,
            tokens: cancellable_tokens(receiver, token),
            completion,
        })
    }
}

fn new_request_id() -> RequestId {
    Uuid::new_v4().to_string()
}

/// Caller side of the stream: nothing is handed out once the request is
/// cancelled, even chunks already queued.
fn cancellable_tokens(
    mut receiver: mpsc::Receiver<ResponseChunk>,
    token: CancellationToken,
) -> ResponseStream {
    Box::pin(async_stream::stream! {
        while let Some(chunk) = receiver.recv().await {
            if token.is_cancelled() {
                break;
            }
            yield chunk;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_rejects_live_duplicates_and_allows_reuse() {
        let registry = CancellationRegistry::new();
        let first = registry.register("r1").await.unwrap();

        assert!(matches!(
            registry.register("r1").await,
            Err(FlowError::DuplicateRequest(_))
        ));
        assert!(registry.cancel("r1").await);
        assert!(first.is_cancelled());

        registry.unregister("r1").await;
        assert!(!registry.cancel("r1").await);
        let second = registry.register("r1").await.unwrap();
        assert!(!second.is_cancelled());
    }
}
