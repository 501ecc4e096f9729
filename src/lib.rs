//! # tower-voice
//!
//! Per-turn orchestration for multi-agent voice assistants.
//!
//! A session is driven by one active agent at a time. For every recognized
//! utterance the [`TurnEngine`] streams the agent's model response to a
//! speech sink sentence by sentence, runs the tool calls the model emits,
//! transfers control to another agent when a handoff tool is called, and
//! stops immediately when the caller barges in.
//!
//! ## Core pieces
//!
//! - [`agent`]: immutable agent definitions and the registry they live in.
//! - [`tool`]: typed tool registry; tools are tower services tagged as
//!   business or handoff tools.
//! - [`streaming`]: bridges a streaming model call onto the turn loop.
//! - [`handoff`]: resolves which agent a handoff tool leads to, and how.
//! - [`greeting`]: decides what a newly activated agent says first.
//! - [`sessions`]: session state and its persistence between turns.
//! - [`engine`]: the turn state machine tying it all together.
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tower_voice::agent::{Agent, StaticAgentRegistry};
//! use tower_voice::engine::{CollectingSink, TurnEngine};
//! use tower_voice::provider::{ScriptStep, ScriptedProvider};
//! use tower_voice::tool::{ToolDef, ToolRegistry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tower_voice::Result<()> {
//! let agents = StaticAgentRegistry::new([
//!     Agent::new("Concierge", "You are the bank concierge.").with_tools(["handoff_fraud"]),
//!     Agent::new("FraudAgent", "You investigate card fraud.")
//!         .with_greeting("Fraud desk here, {{ client_name | default('there') }}."),
//! ]);
//! let tools = ToolRegistry::new().register(ToolDef::handoff(
//!     "handoff_fraud",
//!     "Transfer the caller to the fraud desk",
//!     "FraudAgent",
//! ));
//! let provider = ScriptedProvider::new([
//!     vec![ScriptStep::tool_call(0, "call_1", "handoff_fraud", r#"{"reason":"stolen card"}"#)],
//!     vec![ScriptStep::text("I've blocked the card.")],
//! ]);
//! let sink = Arc::new(CollectingSink::new());
//!
//! let mut engine = TurnEngine::builder(Arc::new(agents), Arc::new(tools), Arc::new(provider))
//!     .initial_agent("Concierge")
//!     .sink(sink.clone())
//!     .system_vars(json!({"client_name": "Ada"}).as_object().cloned().unwrap_or_default())
//!     .build()?;
//!
//! let result = engine.process_turn("someone stole my card").await?;
//! assert_eq!(result.agent, "FraudAgent");
//! assert_eq!(result.greeting.as_deref(), Some("Fraud desk here, Ada."));
//! assert_eq!(result.response_text, "I've blocked the card.");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod greeting;
pub mod handoff;
pub mod items;
pub mod observability;
pub mod provider;
pub mod sessions;
pub mod streaming;
pub mod template;
pub mod tool;
pub mod usage;

pub use agent::{Agent, AgentRegistry, ModelParams, StaticAgentRegistry, VoiceParams};
pub use config::{BridgeConfig, EngineConfig};
pub use engine::{BargeIn, CollectingSink, NullSink, SpeechSink, TurnEngine, TurnResult, TurnState};
pub use error::{Result, VoiceError};
pub use handoff::{
    HandoffPayload, HandoffResolution, HandoffRoute, HandoffRouteTable, HandoffType,
};
pub use items::{ChatMessage, Role, ToolCall};
pub use provider::{ModelProvider, OpenAIProvider, ScriptedProvider};
pub use sessions::{
    InMemorySessionStore, PendingHandoff, SessionState, SessionStore, SqliteSessionStore,
};
pub use streaming::StreamingBridge;
pub use tool::{tool_typed, ToolDef, ToolExecutor, ToolKind, ToolRegistry};
pub use usage::Usage;
