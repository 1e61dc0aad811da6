//! LLM caller for OpenAI-compatible `/chat/completions` servers
//! (llama.cpp, vLLM, Ollama's compatibility API and the like).

use async_trait::async_trait;
use convocore::services::{LlmCaller, LlmRequest, LlmResponse};
use convocore::{ChatMessage, FlowError, NodeError, PromptTemplate, TokenStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One named backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub prompt_template: Option<PromptTemplate>,
}

pub struct OpenAiCompatibleCaller {
    client: reqwest::Client,
    endpoints: HashMap<String, EndpointConfig>,
}

impl OpenAiCompatibleCaller {
    pub fn new(endpoints: HashMap<String, EndpointConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    /// Parse a JSON object of `name -> EndpointConfig`.
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.keys().cloned().collect();
        names.sort();
        names
    }

    fn endpoint(&self, name: &str) -> Result<&EndpointConfig, NodeError> {
        self.endpoints
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Unknown endpoint: {}", name)))
    }
}

fn request_body(endpoint: &EndpointConfig, request: &LlmRequest) -> Value {
    let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system_prompt {
        messages.push(ChatMessage::system(system.clone()));
    }
    messages.extend(request.messages.iter().cloned());

    let mut body = json!({
        "model": endpoint.model,
        "messages": messages,
        "stream": request.stream,
    });
    if let Some(max_tokens) = request.max_tokens.or(endpoint.max_tokens) {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature.or(endpoint.temperature) {
        body["temperature"] = json!(temperature);
    }
    body
}

#[async_trait]
impl LlmCaller for OpenAiCompatibleCaller {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, NodeError> {
        let endpoint = self.endpoint(&request.endpoint)?;
        let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
        let body = request_body(endpoint, &request);
        debug!("POST {} (stream: {})", url, request.stream);

        let mut builder = self.client.post(&url).json(&body);
        if let Some(var) = &endpoint.api_key_env {
            if let Ok(key) = std::env::var(var) {
                builder = builder.bearer_auth(key);
            }
        }

        let sent = tokio::select! {
            biased;
            _ = request.cancellation.cancelled() => return Err(NodeError::Cancelled),
            response = builder.send() => response,
        };
        let response = sent
            .and_then(|r| r.error_for_status())
            .map_err(|e| NodeError::backend(&request.endpoint, e.to_string()))?;

        if request.stream {
            return Ok(LlmResponse::Stream(sse_tokens(
                response,
                request.endpoint.clone(),
                request.cancellation.clone(),
            )));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| NodeError::backend(&request.endpoint, format!("Failed to read response: {}", e)))?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| NodeError::backend(&request.endpoint, "response has no message content"))?;
        Ok(LlmResponse::Text(content.to_string()))
    }

    fn prompt_template(&self, endpoint: &str) -> Option<PromptTemplate> {
        self.endpoints
            .get(endpoint)
            .and_then(|e| e.prompt_template.clone())
    }
}

fn sse_tokens(
    response: reqwest::Response,
    endpoint: String,
    cancellation: CancellationToken,
) -> TokenStream {
    Box::pin(async_stream::stream! {
        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        'read: while let Some(chunk) = bytes.next().await {
            if cancellation.is_cancelled() {
                break;
            }
            match chunk {
                Ok(chunk) => {
                    for event in decoder.push(&chunk) {
                        match event {
                            SseEvent::Content(token) => yield Ok(token),
                            SseEvent::Done => break 'read,
                        }
                    }
                }
                Err(e) => {
                    yield Err(NodeError::backend(&endpoint, e.to_string()));
                    break;
                }
            }
        }
    })
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Content(String),
    Done,
}

/// Splits a server-sent-event byte stream into `data:` payloads. Lines may be
/// cut anywhere between network chunks, including inside a UTF-8 sequence.
#[derive(Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(event) = parse_line(String::from_utf8_lossy(&line).trim_end()) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let json: Value = serde_json::from_str(data).ok()?;
    json.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| SseEvent::Content(s.to_string()))
}
