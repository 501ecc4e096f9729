//! Text-mode console for a two-agent banking assistant.
//!
//! Each stdin line is treated as a recognized utterance; response chunks are
//! printed as they stream. Uses OpenAI when `OPENAI_API_KEY` is set and an
//! offline echo model otherwise.
//!
//! Commands: `/barge` (interrupts the next turn shortly after it starts),
//! `/handoff <agent>` (queues an application-driven handoff), `/quit`.
//!
//! ```bash
//! RUST_LOG=tower_voice=debug cargo run --bin voice_console
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tower::BoxError;

use tower_voice::agent::{Agent, StaticAgentRegistry};
use tower_voice::engine::{SpeechSink, TurnEngine};
use tower_voice::items::Role;
use tower_voice::observability::init_tracing;
use tower_voice::provider::{DeltaStream, ModelDelta, ModelProvider, ModelRequest, OpenAIProvider};
use tower_voice::sessions::PendingHandoff;
use tower_voice::tool::{tool_typed, ToolDef, ToolRegistry};
use tower_voice::usage::Usage;
use tower_voice::{EngineConfig, Result};

struct ConsoleSink;

#[async_trait]
impl SpeechSink for ConsoleSink {
    async fn send_chunk(&self, text: String) {
        println!("  🔊 {}", text);
    }

    async fn cancel_response(&self) {
        println!("  ⏹  (playback cancelled)");
    }

    async fn apply_agent(&self, agent: &Agent) {
        let voice = agent.voice.voice_name.as_deref().unwrap_or("default");
        println!("  🎙  now speaking as {} (voice: {})", agent.name, voice);
    }
}

/// Offline model: echoes the last user message, and hands off to the fraud
/// desk when the caller mentions fraud.
struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    async fn stream(&self, request: ModelRequest) -> Result<DeltaStream> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let last_is_user = request.messages.last().map(|m| m.role) == Some(Role::User);
        let wants_fraud = last_is_user
            && last_user.to_lowercase().contains("fraud")
            && request.tools.iter().any(|t| t.name == "handoff_fraud");

        let deltas = if wants_fraud {
            vec![ModelDelta::ToolCall(
                tower_voice::items::ToolCallDelta::new(0)
                    .name("handoff_fraud")
                    .arguments(json!({"reason": last_user}).to_string()),
            )]
        } else {
            let reply = format!("You said: {}. Anything else I can help with?", last_user);
            reply
                .split_inclusive(' ')
                .map(|w| ModelDelta::Text(w.to_string()))
                .chain([ModelDelta::Usage(Usage::new(last_user.len() / 4, reply.len() / 4))])
                .collect()
        };
        Ok(stream::iter(deltas)
            .then(|d| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, tower_voice::VoiceError>(d)
            })
            .boxed())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BalanceArgs {
    /// Account identifier
    account_id: String,
}

fn tools() -> Result<ToolRegistry> {
    let balance = tool_typed("lookup_balance", "Look up an account balance", |args: BalanceArgs| async move {
        if args.account_id.is_empty() {
            return Ok::<_, BoxError>(json!({"success": false, "message": "not found"}));
        }
        Ok(json!({"success": true, "account_id": args.account_id, "balance": 1234.56}))
    })?;
    Ok(ToolRegistry::new()
        .register(balance.with_tags(["banking"]))
        .register(ToolDef::handoff(
            "handoff_fraud",
            "Transfer the caller to the fraud desk",
            "FraudAgent",
        ))
        .register(ToolDef::handoff(
            "handoff_concierge",
            "Return the caller to the concierge",
            "Concierge",
        )))
}

fn agents() -> StaticAgentRegistry {
    StaticAgentRegistry::new([
        Agent::new(
            "Concierge",
            "You are the voice concierge of a retail bank, speaking with {{ client_name | default('a caller') }}. Keep answers short.",
        )
        .with_description("General banking help")
        .with_tools(["lookup_balance", "handoff_fraud"])
        .with_greeting("Hi {{ client_name | default('there') }}, how can I help today?")
        .with_return_greeting("Back with the concierge. What else can I do?")
        .with_handoff_trigger("handoff_concierge"),
        Agent::new(
            "FraudAgent",
            "You are the fraud specialist. Reassure the caller and secure their account.",
        )
        .with_description("Card fraud and suspicious activity")
        .with_tools(["handoff_concierge"])
        .with_greeting("Fraud desk here. I understand: {{ handoff_summary | default('you need help') }}.")
        .with_handoff_trigger("handoff_fraud"),
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("tower_voice=info,warn");

    let provider: Arc<dyn ModelProvider> = if std::env::var("OPENAI_API_KEY").is_ok() {
        println!("Using OpenAI.");
        Arc::new(OpenAIProvider::new())
    } else {
        println!("OPENAI_API_KEY not set; using the offline echo model.");
        Arc::new(EchoProvider)
    };

    let mut engine = TurnEngine::builder(Arc::new(agents()), Arc::new(tools()?), provider)
        .initial_agent("Concierge")
        .config(EngineConfig::from_env()?)
        .sink(Arc::new(ConsoleSink))
        .system_vars(
            json!({"client_name": "Ada"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        )
        .build()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut barge_next = false;
    println!("Type to talk; /barge, /handoff <agent>, /quit.");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if line == "/barge" {
            barge_next = true;
            println!("(next turn will be interrupted)");
            continue;
        }
        if let Some(target) = line.strip_prefix("/handoff ") {
            engine.queue_handoff(PendingHandoff::new(target.trim())).await?;
            println!("(handoff to {} queued)", target.trim());
            continue;
        }

        if std::mem::take(&mut barge_next) {
            let barge = engine.barge_in();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                barge.trigger();
            });
        }

        println!("[{}] you: {}", engine.active_agent(), line);
        let result = engine.process_turn(line).await?;
        if result.interrupted {
            println!("[{}] (interrupted)", result.agent);
        } else if let Some(error) = &result.error {
            println!("[{}] error: {}", result.agent, error);
        } else {
            println!(
                "[{}] done: {} model call(s), {} tokens",
                result.agent, result.model_calls, result.usage.total_tokens
            );
        }
    }
    Ok(())
}
