use async_trait::async_trait;
use convocore::services::{LlmRequest, LlmResponse};
use convocore::{ChatMessage, Node, NodeContext, NodeError, NodeOutput, Role, TemplateMode};
use convoruntime::{FieldDefinition, NodeFactory, NodeMetadata, ResolvedNodeSpec};
use futures::StreamExt;
use tracing::debug;

pub const LLM_GENERATE: &str = "llm.generate";

const DEFAULT_LAST_MESSAGES: usize = 5;

/// Sends a prompt to a backend endpoint.
///
/// When `prompt` resolves to nothing, the last few conversation turns are
/// sent instead.
pub struct LlmGenerateNode {
    endpoint: String,
    system_prompt: Option<String>,
    prompt: Option<String>,
    last_messages: usize,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    mode: TemplateMode,
}

impl LlmGenerateNode {
    fn messages(&self, ctx: &NodeContext, prompt: String) -> Vec<ChatMessage> {
        if !prompt.trim().is_empty() {
            return vec![ChatMessage::user(prompt)];
        }
        let turns: Vec<&ChatMessage> = ctx
            .run
            .conversation()
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        let skip = turns.len().saturating_sub(self.last_messages);
        turns.into_iter().skip(skip).cloned().collect()
    }
}

#[async_trait]
impl Node for LlmGenerateNode {
    fn node_type(&self) -> &str {
        LLM_GENERATE
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let llm = ctx.services.llm.clone();
        let template = llm.prompt_template(&self.endpoint);
        let variables = ctx.variables(template.as_ref());

        let system_prompt = match &self.system_prompt {
            Some(raw) => Some(variables.render(raw, self.mode)?).filter(|s| !s.trim().is_empty()),
            None => None,
        };
        let prompt = match &self.prompt {
            Some(raw) => variables.render(raw, self.mode)?,
            None => String::new(),
        };

        let stream = ctx.may_stream();
        let request = LlmRequest {
            endpoint: self.endpoint.clone(),
            system_prompt,
            messages: self.messages(&ctx, prompt),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream,
            cancellation: ctx.cancellation().clone(),
        };

        ctx.events.info(format!(
            "Calling '{}' with {} messages{}",
            self.endpoint,
            request.messages.len(),
            if stream { " (streaming)" } else { "" }
        ));

        match llm.call(request).await? {
            LlmResponse::Text(text) => Ok(NodeOutput::Text(text)),
            LlmResponse::Stream(tokens) if stream => Ok(NodeOutput::Stream(tokens)),
            LlmResponse::Stream(mut tokens) => {
                debug!("'{}' streamed without being asked; collecting", self.endpoint);
                let mut text = String::new();
                while let Some(token) = tokens.next().await {
                    text.push_str(&token?);
                }
                Ok(NodeOutput::Text(text))
            }
        }
    }
}

pub struct LlmGenerateNodeFactory;

impl NodeFactory for LlmGenerateNodeFactory {
    fn create(&self, spec: &ResolvedNodeSpec) -> Result<Box<dyn Node>, NodeError> {
        let last_messages = spec
            .u64_field("lastMessagesToSendInsteadOfPrompt")?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_LAST_MESSAGES);
        let max_tokens = spec
            .u64_field("maxResponseSizeInTokens")?
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX));

        Ok(Box::new(LlmGenerateNode {
            endpoint: spec.require_str("endpoint")?.to_string(),
            system_prompt: spec.str_field("systemPrompt")?.map(str::to_string),
            prompt: spec.str_field("prompt")?.map(str::to_string),
            last_messages,
            max_tokens,
            temperature: spec.f64_field("temperature")?.map(|t| t as f32),
            mode: TemplateMode::from_flag(spec.bool_field("expressiveTemplating")?.unwrap_or(false)),
        }))
    }

    fn node_type(&self) -> &str {
        LLM_GENERATE
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Generate text with a language model backend".to_string(),
            category: "llm".to_string(),
            fields: vec![
                FieldDefinition::configuration("endpoint", "Backend endpoint name").required(),
                FieldDefinition::content("systemPrompt", "System prompt"),
                FieldDefinition::content("prompt", "User prompt; empty sends recent turns"),
                FieldDefinition::configuration(
                    "lastMessagesToSendInsteadOfPrompt",
                    "Turns sent when the prompt is empty",
                ),
                FieldDefinition::configuration("maxResponseSizeInTokens", "Response token cap"),
                FieldDefinition::configuration("temperature", "Sampling temperature"),
                FieldDefinition::configuration("expressiveTemplating", "Render prompts as templates"),
            ],
        }
    }
}
