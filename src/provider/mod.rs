//! Model provider abstraction
//!
//! A provider turns a [`ModelRequest`] into a stream of [`ModelDelta`]s: text
//! fragments, tool-call fragments keyed by stream index, and usage reports.
//! The streaming bridge owns everything after that (chunking, tool-call
//! assembly, timeouts, cancellation), so providers stay thin adapters.
//!
//! - [`OpenAIProvider`] adapts async-openai's chat completion stream.
//! - [`ScriptedProvider`] replays scripted deltas, one script per call, for
//!   tests and offline demos.

mod openai;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::agent::ModelParams;
use crate::error::{Result, VoiceError};
use crate::items::{ChatMessage, ToolCallDelta};
use crate::tool::ToolSpec;
use crate::usage::Usage;

pub use openai::OpenAIProvider;

/// One completion request: full message list, offered tools and sampling params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub params: ModelParams,
}

/// An increment of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDelta {
    Text(String),
    ToolCall(ToolCallDelta),
    Usage(Usage),
}

pub type DeltaStream = BoxStream<'static, Result<ModelDelta>>;

#[async_trait]
pub trait ModelProvider: Send + Sync + 'static {
    /// Opens a completion stream for `request`.
    async fn stream(&self, request: ModelRequest) -> Result<DeltaStream>;
}

/// A step in a scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Delta(ModelDelta),
    /// Sleep before the next step.
    Delay(Duration),
    /// Fail the stream with this message.
    Fail(String),
    /// Never yield again.
    Hang,
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptStep::Delta(ModelDelta::Text(text.into()))
    }

    pub fn tool(delta: ToolCallDelta) -> Self {
        ScriptStep::Delta(ModelDelta::ToolCall(delta))
    }

    pub fn usage(input_tokens: usize, output_tokens: usize) -> Self {
        ScriptStep::Delta(ModelDelta::Usage(Usage::new(input_tokens, output_tokens)))
    }

    /// A whole tool call in a single delta.
    pub fn tool_call(index: u32, id: &str, name: &str, arguments: &str) -> Self {
        ScriptStep::tool(
            ToolCallDelta::new(index)
                .id(id)
                .name(name)
                .arguments(arguments),
        )
    }
}

pub type Script = Vec<ScriptStep>;

#[derive(Default)]
struct ScriptState {
    scripts: VecDeque<Script>,
    fallback: Option<Script>,
    requests: Vec<ModelRequest>,
}

/// A provider that replays queued scripts, one per model call.
///
/// When the queue is empty the fallback script is replayed; without a
/// fallback the call fails.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedProvider {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        let provider = Self::default();
        provider.lock().scripts.extend(scripts);
        provider
    }

    /// Script replayed for every call once the queue is drained.
    pub fn with_fallback(self, script: Script) -> Self {
        self.set_fallback(script);
        self
    }

    pub fn set_fallback(&self, script: Script) {
        self.lock().fallback = Some(script);
    }

    pub fn push(&self, script: Script) {
        self.lock().scripts.push_back(script);
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock().requests.clone()
    }

    pub fn calls(&self) -> usize {
        self.lock().requests.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ScriptedProvider")
            .field("queued", &state.scripts.len())
            .field("calls", &state.requests.len())
            .finish()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn stream(&self, request: ModelRequest) -> Result<DeltaStream> {
        let script = {
            let mut state = self.lock();
            state.requests.push(request);
            match state.scripts.pop_front() {
                Some(script) => script,
                None => state
                    .fallback
                    .clone()
                    .ok_or_else(|| VoiceError::ProviderStream("no scripted response left".into()))?,
            }
        };

        let deltas = stream::iter(script).filter_map(|step| async move {
            match step {
                ScriptStep::Delta(delta) => Some(Ok(delta)),
                ScriptStep::Delay(d) => {
                    tokio::time::sleep(d).await;
                    None
                }
                ScriptStep::Fail(message) => Some(Err(VoiceError::ProviderStream(message))),
                ScriptStep::Hang => {
                    futures::future::pending::<()>().await;
                    None
                }
            }
        });
        Ok(deltas.boxed())
    }
}
