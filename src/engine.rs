//! # Turn engine
//!
//! One [`TurnEngine`] per session processes recognized user utterances one at
//! a time. Each turn moves through these states:
//!
//! ```text
//! Idle -> Generating -> (ToolExecuting -> Generating)* -> (HandingOff -> Generating)? -> Idle
//!              \______________ Cancelled (barge-in) ______________/
//! ```
//!
//! - Model output streams through the [`StreamingBridge`]; sentence chunks go
//!   to the [`SpeechSink`] as they are produced.
//! - Business tool calls run sequentially in detection order, their results
//!   are appended to the history and the model is called again, up to
//!   `max_tool_iterations` model calls per turn.
//! - When a batch holds handoff calls, only the first runs. On a successful
//!   resolution the outgoing response is cancelled, the new agent's voice is
//!   applied, its greeting (if any) is spoken, and the new agent answers the
//!   original utterance with a fresh history.
//! - [`BargeIn::trigger`] cancels the turn: streaming stops, the producer is
//!   aborted and the result is marked interrupted.
//!
//! A turn works on a draft of the session state that is committed only when
//! the turn produces a response. Provider failures, cancellation and the
//! iteration cap leave the active agent and the history as they were.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentRegistry};
use crate::config::EngineConfig;
use crate::error::{Result, VoiceError};
use crate::greeting::{select_greeting, GreetingRequest};
use crate::handoff::{HandoffPayload, HandoffRequest, HandoffResolution, HandoffRouteTable, HandoffType};
use crate::items::{ChatMessage, ToolCall};
use crate::provider::{ModelProvider, ModelRequest};
use crate::sessions::{
    InMemorySessionStore, PendingHandoff, SessionState, SessionStore, SessionSynchronizer,
};
use crate::streaming::{StreamOutcome, StreamingBridge};
use crate::template;
use crate::tool::{is_success, ToolExecutor};
use crate::usage::Usage;

/// Where the engine is within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnState {
    Idle,
    Generating,
    ToolExecuting,
    HandingOff,
    Cancelled,
}

/// Receives speech output in generation order.
#[async_trait]
pub trait SpeechSink: Send + Sync {
    async fn send_chunk(&self, text: String);

    /// Stops playback of the current response.
    async fn cancel_response(&self);

    /// Applies an agent's voice settings.
    async fn apply_agent(&self, agent: &Agent);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl SpeechSink for NullSink {
    async fn send_chunk(&self, _text: String) {}
    async fn cancel_response(&self) {}
    async fn apply_agent(&self, _agent: &Agent) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Chunk(String),
    Cancel,
    ApplyAgent(String),
}

/// Records every sink call.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.lock().clone()
    }

    pub fn chunks(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Chunk(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SinkEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SpeechSink for CollectingSink {
    async fn send_chunk(&self, text: String) {
        self.lock().push(SinkEvent::Chunk(text));
    }

    async fn cancel_response(&self) {
        self.lock().push(SinkEvent::Cancel);
    }

    async fn apply_agent(&self, agent: &Agent) {
        self.lock().push(SinkEvent::ApplyAgent(agent.name.clone()));
    }
}

/// Cloneable barge-in trigger for the engine's current turn.
///
/// Each turn starts with a fresh token, so a trigger between turns has no
/// effect on the next one.
#[derive(Debug, Clone, Default)]
pub struct BargeIn {
    token: Arc<Mutex<CancellationToken>>,
}

impl BargeIn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        debug!("barge-in triggered");
        self.lock().cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.lock().is_cancelled()
    }

    fn arm(&self) -> CancellationToken {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of one processed utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub turn_id: String,
    pub turn_number: u64,
    /// Active agent once the turn finished.
    pub agent: String,
    pub response_text: String,
    /// Every tool call detected this turn, executed or not.
    pub tool_calls: Vec<ToolCall>,
    pub handoff: Option<HandoffResolution>,
    /// Last greeting spoken this turn.
    pub greeting: Option<String>,
    pub interrupted: bool,
    pub error: Option<String>,
    pub usage: Usage,
    pub model_calls: usize,
}

#[derive(Debug, Default)]
struct TurnProgress {
    tool_calls: Vec<ToolCall>,
    handoff: Option<HandoffResolution>,
    greeting: Option<String>,
    usage: Usage,
    model_calls: usize,
    handoffs: usize,
}

#[derive(Debug)]
enum TurnEnd {
    Responded(String),
    Interrupted,
    CapExceeded,
    Failed(VoiceError),
}

enum HandoffStep {
    Switched,
    Rejected,
    Interrupted,
}

/// Builder for [`TurnEngine`].
pub struct TurnEngineBuilder {
    agents: Arc<dyn AgentRegistry>,
    tools: Arc<dyn ToolExecutor>,
    provider: Arc<dyn ModelProvider>,
    routes: Option<HandoffRouteTable>,
    sink: Arc<dyn SpeechSink>,
    store: Option<Arc<dyn SessionStore>>,
    config: EngineConfig,
    session_id: Option<String>,
    initial_agent: Option<String>,
    system_vars: Map<String, Value>,
}

impl TurnEngineBuilder {
    /// Routes used for handoff resolution. Defaults to one wildcard route per
    /// agent handoff trigger.
    pub fn routes(mut self, routes: HandoffRouteTable) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn SpeechSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Session store; an in-memory store is used when unset.
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn initial_agent(mut self, agent: impl Into<String>) -> Self {
        self.initial_agent = Some(agent.into());
        self
    }

    pub fn system_vars(mut self, vars: Map<String, Value>) -> Self {
        self.system_vars.extend(vars);
        self
    }

    pub fn build(self) -> Result<TurnEngine> {
        let initial = match self.initial_agent {
            Some(name) => name,
            None => self
                .agents
                .list_names()
                .into_iter()
                .next()
                .ok_or_else(|| VoiceError::Config("agent registry is empty".into()))?,
        };
        if !self.agents.contains(&initial) {
            return Err(VoiceError::UnknownAgent(initial));
        }

        let routes = match self.routes {
            Some(routes) => routes,
            None => {
                let agents: Vec<Arc<Agent>> = self
                    .agents
                    .list_names()
                    .iter()
                    .filter_map(|name| self.agents.lookup(name))
                    .collect();
                HandoffRouteTable::from_agents(agents.iter().map(|a| a.as_ref()))
            }
        }
        .with_defaults(self.config.handoff_defaults);

        let session_id = self
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemorySessionStore::new()));

        Ok(TurnEngine {
            bridge: StreamingBridge::new(self.provider, self.config.bridge.clone()),
            agents: self.agents,
            tools: self.tools,
            routes,
            sink: self.sink,
            sync: SessionSynchronizer::new(store),
            state: SessionState::new(session_id, initial).with_system_vars(self.system_vars),
            barge_in: BargeIn::new(),
            turn_state: TurnState::Idle,
            config: self.config,
        })
    }
}

/// Per-session turn orchestrator.
pub struct TurnEngine {
    agents: Arc<dyn AgentRegistry>,
    tools: Arc<dyn ToolExecutor>,
    routes: HandoffRouteTable,
    bridge: StreamingBridge,
    sink: Arc<dyn SpeechSink>,
    sync: SessionSynchronizer,
    config: EngineConfig,
    state: SessionState,
    barge_in: BargeIn,
    turn_state: TurnState,
}

impl TurnEngine {
    pub fn builder(
        agents: Arc<dyn AgentRegistry>,
        tools: Arc<dyn ToolExecutor>,
        provider: Arc<dyn ModelProvider>,
    ) -> TurnEngineBuilder {
        TurnEngineBuilder {
            agents,
            tools,
            provider,
            routes: None,
            sink: Arc::new(NullSink),
            store: None,
            config: EngineConfig::default(),
            session_id: None,
            initial_agent: None,
            system_vars: Map::new(),
        }
    }

    pub fn active_agent(&self) -> &str {
        &self.state.active_agent
    }

    pub fn session(&self) -> &SessionState {
        &self.state
    }

    pub fn turn_state(&self) -> TurnState {
        self.turn_state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn routes(&self) -> &HandoffRouteTable {
        &self.routes
    }

    /// Handle for cancelling the running turn from another task.
    pub fn barge_in(&self) -> BargeIn {
        self.barge_in.clone()
    }

    /// Queues a handoff decided by application logic; it is applied when the
    /// next turn starts.
    pub async fn queue_handoff(&self, pending: PendingHandoff) -> Result<()> {
        self.sync
            .store()
            .set_pending_handoff(&self.state.session_id, pending)
            .await
    }

    /// Processes one recognized utterance.
    ///
    /// Turn-level failures are reported in [`TurnResult::error`]; `Err` is
    /// returned only when the session store fails.
    #[instrument(
        skip(self, user_text),
        fields(session_id = %self.state.session_id, turn = self.state.turn_count + 1)
    )]
    pub async fn process_turn(&mut self, user_text: &str) -> Result<TurnResult> {
        self.state.turn_count += 1;
        let turn_number = self.state.turn_count;
        let turn_id = Uuid::new_v4().to_string();
        let cancel = self.barge_in.arm();

        let pulled = self
            .sync
            .pull(&mut self.state, self.agents.as_ref(), self.config.handoff_defaults)
            .await?;
        let mut pulled_greeting = None;
        if let Some(activation) = pulled {
            pulled_greeting = self
                .activate(
                    &activation.resolution.target_agent,
                    activation.resolution.handoff_type,
                    activation.first_visit,
                    &self.state.system_vars,
                )
                .await;
            self.sync.push(&self.state).await?;
        }

        info!(agent = %self.state.active_agent, chars = user_text.len(), "turn started");
        let mut draft = self.state.clone();
        let mut progress = TurnProgress::default();
        self.transition(TurnState::Generating);
        let end = self
            .run_turn(&mut draft, user_text, &cancel, &mut progress)
            .await;

        let mut response_text = String::new();
        let mut interrupted = false;
        let mut error_text = None;
        let committed = match end {
            TurnEnd::Responded(text) => {
                response_text = text;
                self.state = draft;
                true
            }
            TurnEnd::Interrupted => {
                self.transition(TurnState::Cancelled);
                info!("turn interrupted by barge-in");
                self.sink.cancel_response().await;
                self.restore_voice(&draft).await;
                interrupted = true;
                false
            }
            TurnEnd::CapExceeded => {
                warn!(
                    max_tool_iterations = self.config.max_tool_iterations,
                    "tool loop hit the iteration cap; returning an empty response"
                );
                self.restore_voice(&draft).await;
                false
            }
            TurnEnd::Failed(e) => {
                error!(error = %e, "turn failed");
                self.restore_voice(&draft).await;
                response_text = self.config.apology_text.clone();
                self.sink.send_chunk(response_text.clone()).await;
                error_text = Some(e.to_string());
                false
            }
        };
        self.transition(TurnState::Idle);

        if committed {
            self.sync.push(&self.state).await?;
        }

        let result = TurnResult {
            turn_id,
            turn_number,
            agent: self.state.active_agent.clone(),
            response_text,
            tool_calls: progress.tool_calls,
            greeting: progress.greeting.or(pulled_greeting),
            handoff: progress.handoff,
            interrupted,
            error: error_text,
            usage: progress.usage,
            model_calls: progress.model_calls,
        };
        info!(
            agent = %result.agent,
            model_calls = result.model_calls,
            tool_calls = result.tool_calls.len(),
            interrupted = result.interrupted,
            failed = result.error.is_some(),
            "turn finished"
        );
        Ok(result)
    }

    async fn run_turn(
        &mut self,
        draft: &mut SessionState,
        user_text: &str,
        cancel: &CancellationToken,
        progress: &mut TurnProgress,
    ) -> TurnEnd {
        draft.history.push(ChatMessage::user(user_text));

        loop {
            if progress.model_calls >= self.config.max_tool_iterations {
                return TurnEnd::CapExceeded;
            }
            let Some(agent) = self.agents.lookup(&draft.active_agent) else {
                return TurnEnd::Failed(VoiceError::UnknownAgent(draft.active_agent.clone()));
            };

            self.transition(TurnState::Generating);
            let request = self.build_request(&agent, draft);
            progress.model_calls += 1;
            let sink = self.sink.clone();
            let streamed = self
                .bridge
                .stream(request, cancel, move |chunk| {
                    let sink = sink.clone();
                    async move { sink.send_chunk(chunk).await }
                })
                .await;

            let output = match streamed {
                Ok(StreamOutcome::Completed(output)) => output,
                Ok(StreamOutcome::Cancelled { .. }) => return TurnEnd::Interrupted,
                Err(e) => return TurnEnd::Failed(e),
            };
            progress.usage.add_usage(&output.usage);
            draft.usage.record(&agent.name, output.usage);
            if cancel.is_cancelled() {
                return TurnEnd::Interrupted;
            }

            if output.tool_calls.is_empty() {
                let text = output.text.trim().to_string();
                draft.history.push(ChatMessage::assistant(text.clone()));
                return TurnEnd::Responded(text);
            }

            self.transition(TurnState::ToolExecuting);
            let handoff_at = output
                .tool_calls
                .iter()
                .position(|call| self.tools.is_handoff_tool(&call.name));

            let Some(handoff_at) = handoff_at else {
                if progress.model_calls >= self.config.max_tool_iterations {
                    progress.tool_calls.extend(output.tool_calls);
                    return TurnEnd::CapExceeded;
                }
                draft.history.push(ChatMessage::assistant_with_tool_calls(
                    output.text.clone(),
                    output.tool_calls.clone(),
                ));
                for mut call in output.tool_calls {
                    if cancel.is_cancelled() {
                        return TurnEnd::Interrupted;
                    }
                    let result = self.run_business_tool(&call).await;
                    let content = Value::Object(result.clone()).to_string();
                    call.result = Some(Value::Object(result));
                    draft.history.push(ChatMessage::tool(call.id.clone(), content));
                    progress.tool_calls.push(call);
                }
                continue;
            };

            let mut calls = output.tool_calls;
            let call = calls.remove(handoff_at);
            if !calls.is_empty() {
                debug!(
                    handoff = %call.name,
                    ignored = calls.len(),
                    "only the first handoff call in a batch is executed"
                );
            }

            let pre_handoff_text = output.text.trim().to_string();
            if progress.handoffs >= self.config.max_handoffs_per_turn {
                warn!(
                    tool = %call.name,
                    max_handoffs_per_turn = self.config.max_handoffs_per_turn,
                    "handoff limit reached for this turn"
                );
                progress.tool_calls.push(call);
                progress.tool_calls.extend(calls);
                draft.history.push(ChatMessage::assistant(pre_handoff_text.clone()));
                return TurnEnd::Responded(pre_handoff_text);
            }

            self.transition(TurnState::HandingOff);
            let step = self
                .execute_handoff(draft, &agent, call, user_text, cancel, progress)
                .await;
            progress.tool_calls.extend(calls);
            match step {
                HandoffStep::Switched => continue,
                HandoffStep::Interrupted => return TurnEnd::Interrupted,
                HandoffStep::Rejected => {
                    if self.config.cancel_on_handoff && !pre_handoff_text.is_empty() {
                        self.sink.send_chunk(pre_handoff_text.clone()).await;
                    }
                    draft.history.push(ChatMessage::assistant(pre_handoff_text.clone()));
                    return TurnEnd::Responded(pre_handoff_text);
                }
            }
        }
    }

    #[instrument(skip_all, fields(tool = %call.name, from = %source.name))]
    async fn execute_handoff(
        &self,
        draft: &mut SessionState,
        source: &Agent,
        mut call: ToolCall,
        user_text: &str,
        cancel: &CancellationToken,
        progress: &mut TurnProgress,
    ) -> HandoffStep {
        if self.config.cancel_on_handoff {
            self.sink.cancel_response().await;
        }
        let arguments = call.argument_map();
        let payload = match self.tools.execute(&call.name, arguments.clone()).await {
            Ok(result) => {
                let refused = matches!(result.get("handoff"), Some(Value::Bool(false)));
                let payload = HandoffPayload::from_result(&result);
                let accepted = is_success(&result) && !refused;
                call.result = Some(Value::Object(result));
                if !accepted {
                    warn!(
                        message = payload.message.as_deref().unwrap_or_default(),
                        "handoff tool refused the transfer; keeping the current agent"
                    );
                    progress.tool_calls.push(call);
                    return HandoffStep::Rejected;
                }
                payload
            }
            Err(e) => {
                warn!(error = %e, "handoff tool failed; using call arguments as payload");
                call.result = Some(json!({"success": false, "message": e.to_string()}));
                HandoffPayload::from_arguments(&arguments)
            }
        };
        progress.tool_calls.push(call.clone());

        let request = HandoffRequest {
            tool_name: call.name.clone(),
            source_agent: source.name.clone(),
            payload,
            system_vars: draft.system_vars.clone(),
        };
        let resolution = self.routes.resolve(&request, self.agents.as_ref());
        if !resolution.success {
            warn!(
                error = resolution.error.as_deref().unwrap_or_default(),
                "handoff could not be resolved; keeping the current agent"
            );
            return HandoffStep::Rejected;
        }
        if cancel.is_cancelled() {
            return HandoffStep::Interrupted;
        }

        if !self.config.cancel_on_handoff && request.payload.should_interrupt_playback {
            self.sink.cancel_response().await;
        }
        let first_visit = draft.apply_resolution(&resolution);
        draft.history.push(ChatMessage::user(user_text));
        info!(
            to = %resolution.target_agent,
            handoff_type = ?resolution.handoff_type,
            share_context = resolution.share_context,
            first_visit,
            "handoff executed"
        );

        progress.greeting = self
            .activate(
                &resolution.target_agent,
                resolution.handoff_type,
                first_visit,
                &draft.system_vars,
            )
            .await
            .or(progress.greeting.take());
        progress.handoff = Some(resolution);
        progress.handoffs += 1;
        HandoffStep::Switched
    }

    /// Applies the agent's voice and speaks its greeting, if any.
    async fn activate(
        &self,
        agent_name: &str,
        handoff_type: HandoffType,
        first_visit: bool,
        system_vars: &Map<String, Value>,
    ) -> Option<String> {
        let agent = self.agents.lookup(agent_name)?;
        self.sink.apply_agent(&agent).await;
        let request =
            GreetingRequest::from_system_vars(&agent, handoff_type, first_visit, system_vars);
        let greeting = select_greeting(&request)?;
        debug!(agent = %agent.name, "speaking greeting");
        self.sink.send_chunk(greeting.clone()).await;
        Some(greeting)
    }

    async fn restore_voice(&self, draft: &SessionState) {
        if draft.active_agent == self.state.active_agent {
            return;
        }
        if let Some(agent) = self.agents.lookup(&self.state.active_agent) {
            self.sink.apply_agent(&agent).await;
        }
    }

    async fn run_business_tool(&self, call: &ToolCall) -> Map<String, Value> {
        match self.tools.execute(&call.name, call.argument_map()).await {
            Ok(result) => {
                if !is_success(&result) {
                    info!(tool = %call.name, "tool reported failure");
                }
                result
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool execution failed");
                let mut result = Map::new();
                result.insert("success".into(), Value::Bool(false));
                result.insert("message".into(), Value::String(e.to_string()));
                result
            }
        }
    }

    fn build_request(&self, agent: &Agent, state: &SessionState) -> ModelRequest {
        let mut context = state.system_vars.clone();
        context
            .entry("agent_name")
            .or_insert_with(|| Value::String(agent.name.clone()));
        let mut system = template::render_or_raw(&agent.prompt_template, &context);
        if let Some(summary) = state.system_vars.get("handoff_summary").and_then(Value::as_str) {
            system.push_str("\n\nHandoff summary: ");
            system.push_str(summary);
        }
        if let Some(handoff_context) = state.system_vars.get("handoff_context") {
            system.push_str("\n\nHandoff context: ");
            system.push_str(&handoff_context.to_string());
        }

        let mut messages = Vec::with_capacity(state.history.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(state.history.iter().cloned());
        ModelRequest {
            messages,
            tools: self.tools.specs(&agent.tools),
            params: agent.model.clone(),
        }
    }

    fn transition(&mut self, next: TurnState) {
        if self.turn_state != next {
            debug!(from = ?self.turn_state, to = ?next, "turn state");
            self.turn_state = next;
        }
    }
}

impl std::fmt::Debug for TurnEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnEngine")
            .field("session_id", &self.state.session_id)
            .field("active_agent", &self.state.active_agent)
            .field("turn_state", &self.turn_state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StaticAgentRegistry;
    use crate::provider::{ScriptStep, ScriptedProvider};
    use crate::tool::ToolRegistry;

    fn engine_with(provider: ScriptedProvider) -> TurnEngineBuilder {
        let agents = StaticAgentRegistry::new([
            Agent::new("Concierge", "You help {{ client_name | default('the caller') }}."),
            Agent::new("FraudAgent", "Fraud desk.").with_handoff_trigger("handoff_fraud"),
        ]);
        TurnEngine::builder(
            Arc::new(agents),
            Arc::new(ToolRegistry::new()),
            Arc::new(provider),
        )
    }

    #[test]
    fn builder_rejects_unknown_initial_agent() {
        let err = engine_with(ScriptedProvider::default())
            .initial_agent("Nobody")
            .build()
            .unwrap_err();
        assert!(matches!(err, VoiceError::UnknownAgent(name) if name == "Nobody"));
    }

    #[test]
    fn default_routes_come_from_handoff_triggers() {
        let engine = engine_with(ScriptedProvider::default())
            .initial_agent("Concierge")
            .build()
            .unwrap();
        assert_eq!(engine.routes().routes().len(), 1);
        assert_eq!(engine.routes().routes()[0].to_agent, "FraudAgent");
        assert_eq!(engine.turn_state(), TurnState::Idle);
    }

    #[test]
    fn barge_in_rearms_each_turn() {
        let barge = BargeIn::new();
        let first = barge.arm();
        barge.trigger();
        assert!(first.is_cancelled());
        let second = barge.arm();
        assert!(!second.is_cancelled());
        assert!(!barge.is_triggered());
    }

    #[tokio::test]
    async fn prompt_is_rendered_into_system_message() {
        let provider = ScriptedProvider::new([vec![ScriptStep::text("Hello Ada.")]]);
        let mut vars = Map::new();
        vars.insert("client_name".into(), json!("Ada"));
        let mut engine = engine_with(provider.clone())
            .initial_agent("Concierge")
            .system_vars(vars)
            .build()
            .unwrap();
        let result = engine.process_turn("hi").await.unwrap();
        assert_eq!(result.response_text, "Hello Ada.");
        assert_eq!(result.turn_number, 1);

        let request = &provider.requests()[0];
        assert_eq!(request.messages[0].content, "You help Ada.");
        assert_eq!(request.messages[1], ChatMessage::user("hi"));
        assert_eq!(engine.session().history.len(), 2);
    }
}
