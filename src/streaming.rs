//! # Streaming bridge
//!
//! Runs one model call on a spawned producer task and drains it from the
//! caller through a bounded channel. The producer turns text deltas into
//! speech-sized sentence chunks and forwards tool-call fragments; the consumer
//! hands chunks to a callback in generation order, assembles tool calls by
//! stream index and enforces the timeouts:
//!
//! - `item_timeout`: the longest wait for the next message before checking
//!   whether the producer is still alive;
//! - `turn_timeout`: wall-clock limit for the whole call, after which the
//!   producer is aborted and [`VoiceError::StreamTimeout`] is returned.
//!
//! Closing the channel marks the end of the stream. Cancelling the token
//! aborts the producer task, which drops the provider stream and with it the
//! underlying HTTP request.
//!
//! ```rust
//! use tower_voice::streaming::SentenceChunker;
//!
//! let mut chunker = SentenceChunker::new(20, vec!['.', '!', '?']);
//! assert_eq!(chunker.push("Your balance is ready"), None);
//! assert_eq!(chunker.push(". It is"), Some("Your balance is ready.".to_string()));
//! assert_eq!(chunker.finish(), Some("It is".to_string()));
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::config::BridgeConfig;
use crate::error::{Result, VoiceError};
use crate::items::{ToolCall, ToolCallDelta};
use crate::provider::{ModelDelta, ModelProvider, ModelRequest};
use crate::usage::Usage;

/// Splits streamed text into sentence-sized chunks.
///
/// Once the buffer holds at least `min_chars` characters and a terminator,
/// everything up to and including the last terminator is emitted. Chunks are
/// trimmed; whitespace-only chunks are never emitted.
#[derive(Debug, Clone)]
pub struct SentenceChunker {
    buffer: String,
    min_chars: usize,
    terminators: Vec<char>,
}

impl SentenceChunker {
    pub fn new(min_chars: usize, terminators: Vec<char>) -> Self {
        Self {
            buffer: String::new(),
            min_chars,
            terminators,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.min_chunk_chars, config.sentence_terminators.clone())
    }

    pub fn push(&mut self, text: &str) -> Option<String> {
        self.buffer.push_str(text);
        if self.buffer.chars().count() < self.min_chars {
            return None;
        }
        let (idx, term) = self
            .buffer
            .char_indices()
            .rev()
            .find(|(_, c)| self.terminators.contains(c))?;
        let rest = self.buffer.split_off(idx + term.len_utf8());
        let chunk = std::mem::replace(&mut self.buffer, rest);
        non_blank(chunk)
    }

    /// Flushes whatever is left in the buffer.
    pub fn finish(&mut self) -> Option<String> {
        non_blank(std::mem::take(&mut self.buffer))
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

fn non_blank(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Default, Clone)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles tool calls from fragments keyed by stream index.
#[derive(Debug, Default, Clone)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            if call.id.is_empty() {
                call.id = id;
            }
        }
        if let Some(name) = delta.name {
            call.name.push_str(&name);
        }
        if let Some(fragment) = delta.arguments {
            call.arguments.push_str(&fragment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Returns `(valid, discarded)` in index order.
    ///
    /// A call is discarded when its name is empty or its arguments are not a
    /// JSON object.
    pub fn finish(self) -> (Vec<ToolCall>, Vec<ToolCall>) {
        let mut valid = Vec::new();
        let mut discarded = Vec::new();
        for (index, partial) in self.calls {
            let call = ToolCall::parse(partial.id, partial.name.trim(), partial.arguments);
            if call.name.is_empty() {
                warn!(index, raw_args = %call.raw_args, "discarding tool call without a name");
                discarded.push(call);
            } else if !call.resolved || !call.arguments.is_object() {
                warn!(index, tool = %call.name, raw_args = %call.raw_args, "discarding tool call with malformed arguments");
                discarded.push(call);
            } else {
                valid.push(call);
            }
        }
        (valid, discarded)
    }
}

/// Result of a model call that ran to completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeOutput {
    /// Full response text as generated.
    pub text: String,
    /// Chunks delivered to the callback, in order.
    pub chunks: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Malformed tool calls that were dropped.
    pub discarded: Vec<ToolCall>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(BridgeOutput),
    /// The cancellation token fired before the stream ended.
    Cancelled { partial_text: String },
}

#[derive(Debug)]
enum BridgeMessage {
    Text(String),
    Chunk(String),
    ToolCall(ToolCallDelta),
    Usage(Usage),
    Failed(VoiceError),
}

/// Bridges a [`ModelProvider`] stream onto the turn loop.
#[derive(Clone)]
pub struct StreamingBridge {
    provider: Arc<dyn ModelProvider>,
    config: BridgeConfig,
}

impl StreamingBridge {
    pub fn new(provider: Arc<dyn ModelProvider>, config: BridgeConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Streams one model call, passing each sentence chunk to `on_chunk`.
    ///
    /// Provider failures are reported after the channel drains, so chunks
    /// generated before the failure have already been delivered.
    #[instrument(skip_all, fields(model = %request.params.deployment_id, messages = request.messages.len()))]
    pub async fn stream<F, Fut>(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<StreamOutcome>
    where
        F: FnMut(String) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let producer = tokio::spawn(produce(
            self.provider.clone(),
            request,
            SentenceChunker::from_config(&self.config),
            tx,
        ));

        let turn_timeout = self.config.turn_timeout;
        let deadline = Instant::now() + turn_timeout;
        let mut text = String::new();
        let mut output = BridgeOutput::default();
        let mut accumulator = ToolCallAccumulator::new();
        let mut failure: Option<VoiceError> = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                producer.abort();
                warn!(?turn_timeout, "model call exceeded the turn timeout");
                return Err(VoiceError::StreamTimeout {
                    after: turn_timeout,
                });
            }
            let wait = self.config.item_timeout.min(remaining);

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    producer.abort();
                    debug!(partial_len = text.len(), "stream cancelled");
                    return Ok(StreamOutcome::Cancelled { partial_text: text });
                }
                next = tokio::time::timeout(wait, rx.recv()) => next,
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) => {
                    if producer.is_finished() {
                        debug!("producer finished without closing the channel");
                        break;
                    }
                    trace!(?wait, "no stream item yet; producer still running");
                    continue;
                }
            };

            match message {
                BridgeMessage::Text(delta) => text.push_str(&delta),
                BridgeMessage::Chunk(chunk) => {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    output.chunks.push(chunk.clone());
                    on_chunk(chunk).await;
                }
                BridgeMessage::ToolCall(delta) => accumulator.push(delta),
                BridgeMessage::Usage(usage) => output.usage.add_usage(&usage),
                BridgeMessage::Failed(e) => {
                    error_once(&mut failure, e);
                }
            }
        }

        if let Err(join) = producer.await {
            if join.is_panic() {
                error_once(
                    &mut failure,
                    VoiceError::ProviderStream("model stream producer panicked".into()),
                );
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let (tool_calls, discarded) = accumulator.finish();
        output.text = text;
        output.tool_calls = tool_calls;
        output.discarded = discarded;
        output.usage.request_count = 1;
        debug!(
            chars = output.text.len(),
            chunks = output.chunks.len(),
            tool_calls = output.tool_calls.len(),
            discarded = output.discarded.len(),
            "model call complete"
        );
        Ok(StreamOutcome::Completed(output))
    }
}

impl std::fmt::Debug for StreamingBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingBridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn error_once(slot: &mut Option<VoiceError>, e: VoiceError) {
    tracing::error!(error = %e, "model stream failed");
    slot.get_or_insert(e);
}

async fn produce(
    provider: Arc<dyn ModelProvider>,
    request: ModelRequest,
    mut chunker: SentenceChunker,
    tx: mpsc::Sender<BridgeMessage>,
) {
    let mut deltas = match provider.stream(request).await {
        Ok(deltas) => deltas,
        Err(e) => {
            let _ = tx.send(BridgeMessage::Failed(e)).await;
            return;
        }
    };

    while let Some(item) = deltas.next().await {
        let sent = match item {
            Ok(ModelDelta::Text(delta)) => {
                let chunk = chunker.push(&delta);
                if tx.send(BridgeMessage::Text(delta)).await.is_err() {
                    return;
                }
                match chunk {
                    Some(chunk) => tx.send(BridgeMessage::Chunk(chunk)).await,
                    None => Ok(()),
                }
            }
            Ok(ModelDelta::ToolCall(delta)) => tx.send(BridgeMessage::ToolCall(delta)).await,
            Ok(ModelDelta::Usage(usage)) => tx.send(BridgeMessage::Usage(usage)).await,
            Err(e) => {
                let _ = tx.send(BridgeMessage::Failed(e)).await;
                return;
            }
        };
        if sent.is_err() {
            return;
        }
    }

    if let Some(rest) = chunker.finish() {
        let _ = tx.send(BridgeMessage::Chunk(rest)).await;
    }
}
