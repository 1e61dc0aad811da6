// crates/convonodes/tests/workflow_test.rs

use async_trait::async_trait;
use convocore::services::{LlmCaller, LlmRequest, LlmResponse};
use convocore::{
    ChatMessage, FlowError, NodeError, NodeSpec, Role, RunStatus, WorkflowDefinition,
};
use convonodes::register_all;
use convoruntime::{
    InMemoryWorkflowLoader, NodeRegistry, RuntimeConfig, WorkflowManager, WorkflowRequest,
    WorkflowResponse,
};
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Backend stand-in: fixed replies per endpoint, a gated "slow" endpoint and
/// a "feed" endpoint streaming whatever the test sends.
#[derive(Default)]
struct ScriptedLlm {
    replies: HashMap<String, Vec<String>>,
    calls: Mutex<Vec<LlmRequest>>,
    entered: Notify,
    gate: Notify,
    feed: Mutex<Option<mpsc::Receiver<Result<String, NodeError>>>>,
}

impl ScriptedLlm {
    fn new() -> Self {
        Self::default()
    }

    fn reply(mut self, endpoint: &str, tokens: &[&str]) -> Self {
        self.replies.insert(
            endpoint.to_string(),
            tokens.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    fn with_feed(self, receiver: mpsc::Receiver<Result<String, NodeError>>) -> Self {
        *self.feed.lock().unwrap() = Some(receiver);
        self
    }

    fn calls_to(&self, endpoint: &str) -> Vec<LlmRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.endpoint == endpoint)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LlmCaller for ScriptedLlm {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, NodeError> {
        self.calls.lock().unwrap().push(request.clone());

        if request.endpoint == "feed" {
            let receiver = self.feed.lock().unwrap().take();
            let receiver = receiver.ok_or_else(|| NodeError::backend("feed", "feed already used"))?;
            return Ok(LlmResponse::Stream(Box::pin(
                tokio_stream::wrappers::ReceiverStream::new(receiver),
            )));
        }
        if request.endpoint == "slow" {
            self.entered.notify_one();
            self.gate.notified().await;
        }

        let tokens = self
            .replies
            .get(&request.endpoint)
            .cloned()
            .ok_or_else(|| NodeError::backend(&request.endpoint, "connection refused"))?;
        if request.stream {
            let items: Vec<Result<String, NodeError>> = tokens.into_iter().map(Ok).collect();
            Ok(LlmResponse::Stream(Box::pin(futures::stream::iter(items))))
        } else {
            Ok(LlmResponse::Text(tokens.concat()))
        }
    }
}

fn manager(llm: Arc<ScriptedLlm>, workflows: Vec<WorkflowDefinition>) -> Arc<WorkflowManager> {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    let loader = workflows
        .into_iter()
        .fold(InMemoryWorkflowLoader::new(), |loader, wf| loader.with_workflow(wf));
    Arc::new(WorkflowManager::new(
        Arc::new(registry),
        Arc::new(loader),
        llm,
        RuntimeConfig::default(),
    ))
}

fn llm(endpoint: &str, prompt: &str) -> NodeSpec {
    NodeSpec::new("llm.generate")
        .with_config("endpoint", endpoint)
        .with_config("prompt", prompt)
}

fn lock(name: &str) -> NodeSpec {
    NodeSpec::new("workflow.lock").with_config("workflowLockId", name)
}

fn call(workflow: &str, scoped: serde_json::Value) -> NodeSpec {
    NodeSpec::new("workflow.call")
        .with_config("workflowName", workflow)
        .with_config("scoped_variables", scoped)
}

fn request(workflow: &str) -> WorkflowRequest {
    WorkflowRequest::new(
        workflow,
        vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ],
    )
}

#[tokio::test]
async fn two_node_run_answers_with_the_second_node() {
    let backend = Arc::new(ScriptedLlm::new().reply("a", &["A-text"]).reply("b", &["B-text"]));
    let manager = manager(
        backend.clone(),
        vec![WorkflowDefinition::new("main")
            .with_node(llm("a", "think about it"))
            .with_node(llm("b", "Summarize {agent1Output}"))],
    );

    let outcome = manager.execute(request("main")).await.unwrap();

    assert_eq!(outcome.answer, "B-text");
    let b_calls = backend.calls_to("b");
    assert_eq!(b_calls[0].messages, vec![ChatMessage::user("Summarize A-text")]);
}

#[tokio::test]
async fn marked_node_answers_while_side_effect_node_still_runs() {
    let backend = Arc::new(ScriptedLlm::new().reply("chat", &["Hello!"]).reply("memory", &[""]));
    let manager = manager(
        backend.clone(),
        vec![WorkflowDefinition::new("main")
            .with_node(llm("chat", "").returning_to_user())
            .with_node(llm("memory", "Remember: {agent1Output}"))],
    );

    let outcome = manager.execute(request("main")).await.unwrap();

    assert_eq!(outcome.answer, "Hello!");
    let memory_calls = backend.calls_to("memory");
    assert_eq!(memory_calls.len(), 1);
    assert_eq!(memory_calls[0].messages[0].content, "Remember: Hello!");
}

#[tokio::test]
async fn empty_prompt_sends_recent_turns_without_system_messages() {
    let backend = Arc::new(ScriptedLlm::new().reply("chat", &["ok"]));
    let manager = manager(
        backend.clone(),
        vec![WorkflowDefinition::new("main").with_node(
            NodeSpec::new("llm.generate")
                .with_config("endpoint", "chat")
                .with_config("systemPrompt", "Today is {todays_date_iso}")
                .with_config("lastMessagesToSendInsteadOfPrompt", 2),
        )],
    );

    manager.execute(request("main")).await.unwrap();

    let sent = &backend.calls_to("chat")[0];
    assert_eq!(
        sent.messages,
        vec![ChatMessage::assistant("reply"), ChatMessage::user("second")]
    );
    assert!(sent.messages.iter().all(|m| m.role != Role::System));
    assert!(sent.system_prompt.as_deref().unwrap().starts_with("Today is 20"));
}

#[tokio::test]
async fn second_run_stops_at_a_held_lock() {
    let backend = Arc::new(ScriptedLlm::new().reply("slow", &["A done"]));
    let manager = manager(
        backend.clone(),
        vec![WorkflowDefinition::new("memory")
            .with_node(lock("mem-lock"))
            .with_node(llm("slow", "work"))],
    );
    let key = manager.locks().key("mem-lock", None);

    let run_a = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute(request("memory")).await })
    };
    tokio::time::timeout(Duration::from_secs(5), backend.entered.notified())
        .await
        .expect("run A never reached the backend");
    assert!(manager.locks().is_locked(&key).await.unwrap());

    let run_b = manager.execute(request("memory")).await.unwrap();
    assert_eq!(run_b.status, RunStatus::TerminatedEarly);
    assert_eq!(run_b.answer, "");
    assert_eq!(backend.calls_to("slow").len(), 1);

    backend.gate.notify_one();
    let run_a = run_a.await.unwrap().unwrap();
    assert_eq!(run_a.status, RunStatus::Completed);
    assert_eq!(run_a.answer, "A done");
    assert!(!manager.locks().is_locked(&key).await.unwrap());
}

#[tokio::test]
async fn lock_is_released_when_the_run_fails() {
    let backend = Arc::new(ScriptedLlm::new());
    let manager = manager(
        backend,
        vec![WorkflowDefinition::new("main")
            .with_node(lock("fail-lock"))
            .with_node(llm("offline", "hi"))],
    );

    let err = manager.execute(request("main")).await.unwrap_err();
    assert!(matches!(err, FlowError::Node(NodeError::Backend { .. })));

    let key = manager.locks().key("fail-lock", None);
    assert!(!manager.locks().is_locked(&key).await.unwrap());
}

#[tokio::test]
async fn early_stop_in_a_child_stops_the_parent() {
    let backend = Arc::new(ScriptedLlm::new().reply("a", &["A"]).reply("b", &["B"]));
    let child = WorkflowDefinition::new("guarded")
        .with_node(lock("busy"))
        .with_node(llm("b", "never"));
    let manager = manager(
        backend.clone(),
        vec![
            child,
            WorkflowDefinition::new("main")
                .with_node(llm("a", "first").returning_to_user())
                .with_node(call("guarded", json!([])))
                .with_node(llm("b", "after")),
        ],
    );
    let key = manager.locks().key("busy", None);
    manager.locks().try_acquire(&key, uuid::Uuid::new_v4()).await.unwrap();

    let outcome = manager.execute(request("main")).await.unwrap();

    assert_eq!(outcome.status, RunStatus::TerminatedEarly);
    assert_eq!(outcome.answer, "A");
    assert!(backend.calls_to("b").is_empty());
}

#[tokio::test]
async fn branch_lookup_ignores_case() {
    let backend = Arc::new(
        ScriptedLlm::new()
            .reply("coder", &["code answer"])
            .reply("chatter", &["chat answer"]),
    );
    let router = WorkflowDefinition::from_json(
        "router",
        r#"{
            "nodes": [{
                "type": "workflow.branch",
                "conditionalKey": "{agent1Input}",
                "conditionalWorkflows": {"Python": "coding", "default": "chat"},
                "scoped_variables": ["{agent1Input}"]
            }]
        }"#,
    )
    .unwrap();
    let manager = manager(
        backend.clone(),
        vec![
            router,
            WorkflowDefinition::new("coding").with_node(llm("coder", "Help with {agent1Input}")),
            WorkflowDefinition::new("chat").with_node(llm("chatter", "Chat about {agent1Input}")),
            WorkflowDefinition::new("python").with_node(call("router", json!(["python"]))),
            WorkflowDefinition::new("other").with_node(call("router", json!(["gardening"]))),
        ],
    );

    let outcome = manager.execute(request("python")).await.unwrap();
    assert_eq!(outcome.answer, "code answer");
    assert_eq!(backend.calls_to("coder")[0].messages[0].content, "Help with python");

    let outcome = manager.execute(request("other")).await.unwrap();
    assert_eq!(outcome.answer, "chat answer");
}

#[tokio::test]
async fn branch_miss_prefers_fallback_content_then_fails_without_default() {
    let backend = Arc::new(ScriptedLlm::new());
    let branch = |fallback: Option<&str>| {
        let mut spec = NodeSpec::new("workflow.branch")
            .with_config("conditionalKey", "{topic}")
            .with_config("conditionalWorkflows", json!({"Python": "coding"}));
        if let Some(text) = fallback {
            spec = spec.with_config("fallbackContent", text);
        }
        spec
    };
    let manager = manager(
        backend,
        vec![
            WorkflowDefinition::new("with-fallback")
                .with_static("topic", "go")
                .with_node(branch(Some("No route for {topic}"))),
            WorkflowDefinition::new("no-fallback")
                .with_static("topic", "go")
                .with_node(branch(None)),
        ],
    );

    let outcome = manager.execute(request("with-fallback")).await.unwrap();
    assert_eq!(outcome.answer, "No route for go");

    let err = manager.execute(request("no-fallback")).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Node(NodeError::BranchNotFound { key }) if key == "go"
    ));
}

#[tokio::test]
async fn scoped_variables_become_child_inputs() {
    let backend = Arc::new(ScriptedLlm::new().reply("a", &["A-text"]).reply("echo", &["child said"]));
    let manager = manager(
        backend.clone(),
        vec![
            WorkflowDefinition::new("child")
                .with_node(llm("echo", "{agent1Input}/{agent2Input}/{agent1Output}")),
            WorkflowDefinition::new("main")
                .with_node(llm("a", "start"))
                .with_node(call("child", json!(["foo", "{agent1Output}"]))),
        ],
    );

    let outcome = manager.execute(request("main")).await.unwrap();

    assert_eq!(
        backend.calls_to("echo")[0].messages[0].content,
        "foo/A-text/{agent1Output}"
    );
    assert_eq!(outcome.answer, "child said");
    assert_eq!(outcome.agent_outputs.get(1), Some("A-text"));
    assert_eq!(outcome.agent_outputs.get(2), Some("child said"));
    assert_eq!(outcome.agent_outputs.len(), 2);
}

#[tokio::test]
async fn configuration_fields_use_static_variables() {
    let backend = Arc::new(ScriptedLlm::new().reply("fast-model", &["fast"]));
    let manager = manager(
        backend.clone(),
        vec![WorkflowDefinition::new("main")
            .with_static("backend", "fast-model")
            .with_node(llm("{backend}", "hi"))],
    );

    let outcome = manager.execute(request("main")).await.unwrap();
    assert_eq!(outcome.answer, "fast");
}

#[tokio::test]
async fn streaming_responder_is_cleaned_before_the_caller_sees_it() {
    let backend = Arc::new(
        ScriptedLlm::new()
            .reply("chat", &["<think>", "hidden", "</think>", "Assistant:", " Hi", " there"])
            .reply("memory", &["noted"]),
    );
    let manager = manager(
        backend.clone(),
        vec![WorkflowDefinition::new("main")
            .with_node(llm("chat", "").returning_to_user())
            .with_node(llm("memory", "{agent1Output}"))],
    );

    let response = match manager.run(request("main").streaming()).await.unwrap() {
        WorkflowResponse::Stream(response) => response,
        WorkflowResponse::Text(_) => panic!("expected a stream"),
    };
    let text: String = response.tokens.map(|c| c.unwrap()).collect::<Vec<_>>().await.concat();
    let outcome = response.completion.await.unwrap().unwrap();

    assert_eq!(text, "Hi there");
    assert!(backend.calls_to("chat")[0].stream);
    assert!(!backend.calls_to("memory")[0].stream);
    assert_eq!(backend.calls_to("memory")[0].messages[0].content, "Hi there");
    assert_eq!(outcome.answer, "Hi there");
}

#[tokio::test]
async fn cancelled_stream_stops_after_the_tokens_already_read() {
    let (feed, receiver) = mpsc::channel(16);
    let backend = Arc::new(
        ScriptedLlm::new()
            .reply("after", &["should not happen"])
            .with_feed(receiver),
    );
    let manager = manager(
        backend.clone(),
        vec![WorkflowDefinition::new("main")
            .with_node(lock("stream-lock"))
            .with_node(llm("feed", "").returning_to_user())
            .with_node(llm("after", "{agent2Output}"))],
    );

    let response = match manager
        .run(request("main").with_request_id("stream-1").streaming())
        .await
        .unwrap()
    {
        WorkflowResponse::Stream(response) => response,
        WorkflowResponse::Text(_) => panic!("expected a stream"),
    };
    let mut tokens = response.tokens;

    let mut seen = Vec::new();
    for i in 0..5 {
        feed.send(Ok(format!("tok{} ", i))).await.unwrap();
        seen.push(tokens.next().await.unwrap().unwrap());
    }
    assert!(manager.cancel("stream-1").await);
    let _ = feed.send(Ok("tok5 ".to_string())).await;

    assert!(tokens.next().await.is_none());
    assert_eq!(seen.len(), 5);
    assert!(response.completion.await.unwrap().is_none());
    assert!(backend.calls_to("after").is_empty());

    let key = manager.locks().key("stream-lock", None);
    assert!(!manager.locks().is_locked(&key).await.unwrap());
}

#[tokio::test]
async fn validate_reports_missing_required_fields() {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);

    let broken = WorkflowDefinition::new("broken").with_node(NodeSpec::new("workflow.lock"));
    assert!(registry.validate(&broken).is_err());

    let fine = WorkflowDefinition::new("fine").with_node(lock("x"));
    assert!(registry.validate(&fine).is_ok());
    assert_eq!(
        registry.list_node_types(),
        vec!["llm.generate", "workflow.branch", "workflow.call", "workflow.lock"]
    );
}
