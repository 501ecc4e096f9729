//! Streaming adapter over async-openai's chat completions.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionStreamOptions, ChatCompletionTool, ChatCompletionToolArgs,
    ChatCompletionToolType, CreateChatCompletionRequestArgs, CreateChatCompletionStreamResponse,
    FunctionCall, FunctionObjectArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::{DeltaStream, ModelDelta, ModelProvider, ModelRequest};
use crate::error::{Result, VoiceError};
use crate::items::{ChatMessage, Role, ToolCallDelta};
use crate::tool::ToolSpec;
use crate::usage::Usage;

/// OpenAI (or OpenAI-compatible) chat completion provider.
///
/// The model comes from each request's [`ModelParams::deployment_id`](crate::agent::ModelParams).
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAIProvider {
    /// Client configured from `OPENAI_API_KEY` / `OPENAI_BASE_URL`.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }

    fn convert_message(msg: &ChatMessage) -> Result<ChatCompletionRequestMessage> {
        let message = match msg.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(msg.content.clone())
                .build()?
                .into(),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(msg.content.clone())
                .build()?
                .into(),
            Role::Assistant => {
                let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                if !msg.content.is_empty() || msg.tool_calls.is_empty() {
                    builder.content(msg.content.clone());
                }
                if !msg.tool_calls.is_empty() {
                    let calls: Vec<_> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| ChatCompletionMessageToolCall {
                            id: tc.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.to_string(),
                            },
                        })
                        .collect();
                    builder.tool_calls(calls);
                }
                builder.build()?.into()
            }
            Role::Tool => ChatCompletionRequestToolMessageArgs::default()
                .content(msg.content.clone())
                .tool_call_id(msg.tool_call_id.clone().unwrap_or_default())
                .build()?
                .into(),
        };
        Ok(message)
    }

    fn convert_tools(tools: &[ToolSpec]) -> Result<Vec<ChatCompletionTool>> {
        tools
            .iter()
            .map(|spec| {
                let function = FunctionObjectArgs::default()
                    .name(spec.name.clone())
                    .description(spec.description.clone())
                    .parameters(spec.parameters.clone())
                    .build()?;
                Ok(ChatCompletionToolArgs::default()
                    .r#type(ChatCompletionToolType::Function)
                    .function(function)
                    .build()?)
            })
            .collect()
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OpenAIProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn stream(&self, request: ModelRequest) -> Result<DeltaStream> {
        let messages = request
            .messages
            .iter()
            .map(Self::convert_message)
            .collect::<Result<Vec<_>>>()?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(request.params.deployment_id.clone())
            .messages(messages)
            .stream(true)
            .stream_options(ChatCompletionStreamOptions {
                include_usage: true,
            });
        if !request.tools.is_empty() {
            args.tools(Self::convert_tools(&request.tools)?);
        }
        if let Some(t) = request.params.temperature {
            args.temperature(t);
        }
        if let Some(p) = request.params.top_p {
            args.top_p(p);
        }
        if let Some(max) = request.params.max_tokens {
            args.max_completion_tokens(max);
        }

        tracing::debug!(
            model = %request.params.deployment_id,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "opening completion stream"
        );
        let chunks = self.client.chat().create_stream(args.build()?).await?;

        let deltas = chunks.flat_map(|chunk| {
            let items: Vec<Result<ModelDelta>> = match chunk {
                Ok(chunk) => chunk_deltas(chunk).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(VoiceError::from(e))],
            };
            stream::iter(items)
        });
        Ok(deltas.boxed())
    }
}

fn chunk_deltas(chunk: CreateChatCompletionStreamResponse) -> Vec<ModelDelta> {
    let mut out = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                out.push(ModelDelta::Text(text));
            }
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            let mut delta = ToolCallDelta::new(call.index);
            delta.id = call.id;
            if let Some(function) = call.function {
                delta.name = function.name;
                delta.arguments = function.arguments;
            }
            out.push(ModelDelta::ToolCall(delta));
        }
    }
    if let Some(usage) = chunk.usage {
        out.push(ModelDelta::Usage(Usage::new(
            usage.prompt_tokens as usize,
            usage.completion_tokens as usize,
        )));
    }
    out
}
