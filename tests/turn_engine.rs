//! # Turn engine integration tests
//!
//! Drive a full engine with a scripted model, a real tool registry, a
//! collecting speech sink and an in-memory session store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tower::BoxError;

use tower_voice::agent::{Agent, StaticAgentRegistry, VoiceParams};
use tower_voice::config::EngineConfig;
use tower_voice::engine::{CollectingSink, SinkEvent, TurnEngine, TurnEngineBuilder};
use tower_voice::handoff::{HandoffRoute, HandoffRouteTable, HandoffType};
use tower_voice::items::Role;
use tower_voice::provider::{Script, ScriptStep, ScriptedProvider};
use tower_voice::sessions::{InMemorySessionStore, PendingHandoff, SessionStore};
use tower_voice::tool::{ToolDef, ToolKind, ToolRegistry};

struct Harness {
    engine: TurnEngine,
    provider: ScriptedProvider,
    sink: Arc<CollectingSink>,
    store: Arc<InMemorySessionStore>,
    balance_lookups: Arc<Mutex<Vec<String>>>,
}

fn agents() -> StaticAgentRegistry {
    StaticAgentRegistry::new([
        Agent::new("Concierge", "You are the bank concierge.")
            .with_tools([
                "lookup_balance",
                "handoff_fraud",
                "handoff_investments",
                "handoff_ghost",
            ])
            .with_greeting("Welcome to the bank."),
        Agent::new("FraudAgent", "You are the fraud specialist.")
            .with_tools(["lookup_balance"])
            .with_voice(VoiceParams {
                voice_name: Some("en-US-Fraud".into()),
                ..VoiceParams::default()
            })
            .with_greeting("Hi {{ client_name | default('there') }}, fraud desk here.")
            .with_return_greeting("Fraud desk again.")
            .with_handoff_trigger("handoff_fraud"),
        Agent::new("InvestmentAgent", "You manage investments.")
            .with_greeting("Investments here.")
            .with_handoff_trigger("handoff_investments"),
    ])
}

fn tools(lookups: Arc<Mutex<Vec<String>>>) -> ToolRegistry {
    let balance = ToolDef::from_fn(
        "lookup_balance",
        "Look up an account balance",
        json!({"type": "object", "properties": {"id": {"type": "string"}}}),
        move |args: Map<String, Value>| {
            let lookups = lookups.clone();
            async move {
                let id = args
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                lookups.lock().unwrap().push(id.clone());
                if id == "123" {
                    Ok::<Value, BoxError>(json!({"success": true, "balance": 42}))
                } else {
                    Ok(json!({"success": false, "message": "not found"}))
                }
            }
        },
    );
    ToolRegistry::new()
        .register(balance)
        .register(ToolDef::handoff("handoff_fraud", "Fraud desk", "FraudAgent"))
        .register(ToolDef::handoff(
            "handoff_investments",
            "Investments desk",
            "InvestmentAgent",
        ))
        .register(ToolDef::handoff("handoff_ghost", "Nobody", "GhostAgent"))
}

fn harness(scripts: Vec<Script>) -> Harness {
    harness_with(scripts, |builder| builder)
}

fn harness_with(
    scripts: Vec<Script>,
    customize: impl FnOnce(TurnEngineBuilder) -> TurnEngineBuilder,
) -> Harness {
    let provider = ScriptedProvider::new(scripts);
    let sink = Arc::new(CollectingSink::new());
    let store = Arc::new(InMemorySessionStore::new());
    let balance_lookups = Arc::new(Mutex::new(Vec::new()));
    let mut vars = Map::new();
    vars.insert("client_name".into(), json!("Ada"));

    let builder = TurnEngine::builder(
        Arc::new(agents()),
        Arc::new(tools(balance_lookups.clone())),
        Arc::new(provider.clone()),
    )
    .session_id("session-1")
    .initial_agent("Concierge")
    .sink(sink.clone())
    .store(store.clone())
    .system_vars(vars);
    let engine = customize(builder).build().unwrap();

    Harness {
        engine,
        provider,
        sink,
        store,
        balance_lookups,
    }
}

#[tokio::test]
async fn plain_response_is_streamed_and_recorded() {
    let mut h = harness(vec![vec![
        ScriptStep::text("Good morning, Ada. "),
        ScriptStep::text("How can I help you today?"),
        ScriptStep::usage(120, 9),
    ]]);
    let result = h.engine.process_turn("hello").await.unwrap();

    assert_eq!(result.response_text, "Good morning, Ada. How can I help you today?");
    assert_eq!(result.agent, "Concierge");
    assert_eq!(result.turn_number, 1);
    assert_eq!(result.model_calls, 1);
    assert_eq!(result.usage.total_tokens, 129);
    assert!(!result.interrupted);
    assert!(result.error.is_none());
    assert_eq!(
        h.sink.chunks(),
        vec!["Good morning, Ada. How can I help you today?".to_string()]
    );
    assert_eq!(h.engine.session().history.len(), 2);

    let saved = h.store.load("session-1").await.unwrap().unwrap();
    assert_eq!(saved.active_agent.as_deref(), Some("Concierge"));
}

#[tokio::test]
async fn business_tools_loop_back_into_the_model() {
    let mut h = harness(vec![
        vec![
            ScriptStep::text("Let me check that."),
            ScriptStep::tool_call(0, "call_1", "lookup_balance", r#"{"id":"123"}"#),
        ],
        vec![ScriptStep::text("Your balance is 42 dollars.")],
    ]);
    let result = h.engine.process_turn("what's my balance?").await.unwrap();

    assert_eq!(result.response_text, "Your balance is 42 dollars.");
    assert_eq!(result.model_calls, 2);
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.tool_calls[0].result.as_ref().unwrap()["balance"], 42);
    assert_eq!(*h.balance_lookups.lock().unwrap(), vec!["123".to_string()]);

    let follow_up = &h.provider.requests()[1].messages;
    let assistant = &follow_up[follow_up.len() - 2];
    assert_eq!(assistant.role, Role::Assistant);
    assert_eq!(assistant.tool_calls[0].id, "call_1");
    let tool = follow_up.last().unwrap();
    assert_eq!(tool.role, Role::Tool);
    assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));

    // user, assistant(tool call), tool, assistant
    assert_eq!(h.engine.session().history.len(), 4);
}

#[tokio::test]
async fn failed_tool_result_is_fed_back_not_raised() {
    let mut h = harness(vec![
        vec![ScriptStep::tool_call(0, "call_9", "lookup_balance", r#"{"id":"999"}"#)],
        vec![ScriptStep::text("I couldn't find that account.")],
    ]);
    let result = h.engine.process_turn("balance for 999").await.unwrap();

    assert!(result.error.is_none());
    assert_eq!(result.response_text, "I couldn't find that account.");
    assert_eq!(result.model_calls, 2);

    let tool_message = h.provider.requests()[1].messages.last().cloned().unwrap();
    assert_eq!(tool_message.role, Role::Tool);
    let content: Value = serde_json::from_str(&tool_message.content).unwrap();
    assert_eq!(content, json!({"success": false, "message": "not found"}));
}

#[tokio::test]
async fn tool_calls_run_in_detection_order() {
    let mut h = harness(vec![
        vec![
            ScriptStep::tool_call(0, "a", "lookup_balance", r#"{"id":"1"}"#),
            ScriptStep::tool_call(1, "b", "lookup_balance", r#"{"id":"2"}"#),
            ScriptStep::tool_call(2, "c", "lookup_balance", r#"{"id":"3"}"#),
        ],
        vec![ScriptStep::text("Done.")],
    ]);
    h.engine.process_turn("check all three").await.unwrap();
    assert_eq!(
        *h.balance_lookups.lock().unwrap(),
        vec!["1".to_string(), "2".to_string(), "3".to_string()]
    );
    let ids: Vec<_> = h.provider.requests()[1]
        .messages
        .iter()
        .filter_map(|m| m.tool_call_id.clone())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn barge_in_interrupts_without_touching_history() {
    let mut h = harness(vec![vec![
        ScriptStep::text("Your recent transactions are listed here. "),
        ScriptStep::Delay(Duration::from_secs(2)),
        ScriptStep::text("The first one is a coffee shop."),
    ]]);
    let barge = h.engine.barge_in();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        barge.trigger();
    });

    let result = h.engine.process_turn("read my transactions").await.unwrap();
    assert!(result.interrupted);
    assert_eq!(result.response_text, "");
    assert!(result.error.is_none());
    assert!(h.engine.session().history.is_empty());
    assert_eq!(h.engine.session().turn_count, 1);
    assert_eq!(h.sink.events().last(), Some(&SinkEvent::Cancel));
    assert!(h.store.load("session-1").await.unwrap().is_none());

    h.provider.push(vec![ScriptStep::text("Sure, go ahead.")]);
    let next = h.engine.process_turn("wait, one question").await.unwrap();
    assert!(!next.interrupted);
    assert_eq!(next.turn_number, 2);
}

#[tokio::test]
async fn handoff_switches_agent_in_order() {
    let mut h = harness(vec![
        vec![
            ScriptStep::text("Let me transfer you."),
            ScriptStep::tool_call(0, "call_h", "handoff_fraud", r#"{"reason":"card stolen"}"#),
        ],
        vec![ScriptStep::text("I have frozen your card.")],
    ]);
    let result = h.engine.process_turn("my card was stolen").await.unwrap();

    assert_eq!(result.agent, "FraudAgent");
    assert_eq!(result.response_text, "I have frozen your card.");
    assert_eq!(result.greeting.as_deref(), Some("Hi Ada, fraud desk here."));
    let handoff = result.handoff.as_ref().unwrap();
    assert!(handoff.success);
    assert_eq!(handoff.source_agent, "Concierge");
    assert_eq!(handoff.handoff_type, HandoffType::Announced);

    assert_eq!(
        h.sink.events(),
        vec![
            SinkEvent::Chunk("Let me transfer you.".into()),
            SinkEvent::Cancel,
            SinkEvent::ApplyAgent("FraudAgent".into()),
            SinkEvent::Chunk("Hi Ada, fraud desk here.".into()),
            SinkEvent::Chunk("I have frozen your card.".into()),
        ]
    );

    // The new agent starts from a fresh history holding only the utterance.
    let request = &h.provider.requests()[1];
    assert_eq!(request.messages.len(), 2);
    assert!(request.messages[0].content.starts_with("You are the fraud specialist."));
    assert!(request.messages[0].content.contains("card stolen"));
    assert_eq!(request.messages[1].content, "my card was stolen");

    let session = h.engine.session();
    assert!(session.visited_agents.contains("FraudAgent"));
    assert_eq!(session.system_vars["previous_agent"], "Concierge");
    assert_eq!(session.system_vars["handoff_summary"], "card stolen");
    assert_eq!(session.history.len(), 2);
    let saved = h.store.load("session-1").await.unwrap().unwrap();
    assert_eq!(saved.active_agent.as_deref(), Some("FraudAgent"));
}

#[tokio::test]
async fn only_the_first_handoff_in_a_batch_runs() {
    let mut h = harness(vec![
        vec![
            ScriptStep::tool_call(0, "c0", "handoff_investments", "{}"),
            ScriptStep::tool_call(1, "c1", "handoff_fraud", "{}"),
            ScriptStep::tool_call(2, "c2", "lookup_balance", r#"{"id":"123"}"#),
        ],
        vec![ScriptStep::text("Happy to review your portfolio.")],
    ]);
    let result = h.engine.process_turn("fraud and investments").await.unwrap();

    assert_eq!(result.agent, "InvestmentAgent");
    assert_eq!(result.tool_calls.len(), 3);
    let executed: Vec<_> = result
        .tool_calls
        .iter()
        .filter(|c| c.result.is_some())
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(executed, vec!["handoff_investments"]);
    assert!(h.balance_lookups.lock().unwrap().is_empty());
}

#[tokio::test]
async fn discrete_handoff_stays_silent() {
    let mut h = harness_with(
        vec![
            vec![ScriptStep::tool_call(0, "h", "handoff_fraud", "{}")],
            vec![ScriptStep::text("Let's secure your account.")],
        ],
        |b| {
            b.routes(HandoffRouteTable::new([HandoffRoute::new(
                "Concierge",
                "handoff_fraud",
                "FraudAgent",
            )
            .discrete()]))
        },
    );
    let result = h.engine.process_turn("suspicious charge").await.unwrap();

    assert_eq!(result.agent, "FraudAgent");
    assert_eq!(result.greeting, None);
    assert!(result.handoff.unwrap().is_discrete());
    assert_eq!(
        h.sink.events(),
        vec![
            SinkEvent::Cancel,
            SinkEvent::ApplyAgent("FraudAgent".into()),
            SinkEvent::Chunk("Let's secure your account.".into()),
        ]
    );
}

#[tokio::test]
async fn unshared_context_stays_out_of_the_prompt() {
    let mut h = harness_with(
        vec![
            vec![ScriptStep::tool_call(0, "h", "handoff_fraud", r#"{"reason":"secret"}"#)],
            vec![ScriptStep::text("Fraud desk, go ahead.")],
        ],
        |b| {
            b.routes(HandoffRouteTable::new([HandoffRoute::from_any(
                "handoff_fraud",
                "FraudAgent",
            )
            .with_share_context(false)]))
        },
    );
    h.engine.process_turn("help").await.unwrap();

    let system = &h.provider.requests()[1].messages[0].content;
    assert!(!system.contains("secret"));
    assert!(h.engine.session().system_vars.get("handoff_context").is_none());
    assert_eq!(h.engine.session().system_vars["client_name"], "Ada");
}

#[tokio::test]
async fn unresolvable_handoff_keeps_the_original_answer() {
    let mut h = harness(vec![vec![
        ScriptStep::text("One moment please, checking."),
        ScriptStep::tool_call(0, "g", "handoff_ghost", "{}"),
    ]]);
    let result = h.engine.process_turn("talk to a ghost").await.unwrap();

    assert_eq!(result.agent, "Concierge");
    assert_eq!(result.response_text, "One moment please, checking.");
    assert!(result.handoff.is_none());
    assert!(result.error.is_none());
    assert_eq!(result.model_calls, 1);
    // Playback is cut before the handoff runs, then the original answer is replayed.
    assert_eq!(
        h.sink.events(),
        vec![
            SinkEvent::Chunk("One moment please, checking.".into()),
            SinkEvent::Cancel,
            SinkEvent::Chunk("One moment please, checking.".into()),
        ]
    );
}

#[tokio::test]
async fn refused_handoff_keeps_the_original_agent() {
    let refusing = ToolDef::from_fn(
        "handoff_verified_fraud",
        "Fraud desk for verified callers",
        json!({"type": "object"}),
        |_args: Map<String, Value>| async move {
            Ok::<Value, BoxError>(json!({
                "success": false,
                "handoff": false,
                "target_agent": "FraudAgent",
                "message": "caller not verified"
            }))
        },
    )
    .with_kind(ToolKind::Handoff);
    let provider = ScriptedProvider::new([
        vec![
            ScriptStep::text("I need to verify you first."),
            ScriptStep::tool_call(0, "v", "handoff_verified_fraud", "{}"),
        ],
        vec![ScriptStep::text("Fraud desk.")],
    ]);
    let sink = Arc::new(CollectingSink::new());
    let mut engine = TurnEngine::builder(
        Arc::new(agents()),
        Arc::new(ToolRegistry::new().register(refusing)),
        Arc::new(provider.clone()),
    )
    .session_id("session-1")
    .initial_agent("Concierge")
    .sink(sink.clone())
    .routes(HandoffRouteTable::new([HandoffRoute::from_any(
        "handoff_verified_fraud",
        "FraudAgent",
    )]))
    .build()
    .unwrap();

    let result = engine.process_turn("my card was stolen").await.unwrap();

    assert_eq!(result.agent, "Concierge");
    assert_eq!(result.response_text, "I need to verify you first.");
    assert!(result.handoff.is_none());
    assert_eq!(result.model_calls, 1);
    assert_eq!(provider.calls(), 1);
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(
        result.tool_calls[0].result.as_ref().unwrap()["message"],
        "caller not verified"
    );
    assert!(!sink
        .events()
        .iter()
        .any(|e| matches!(e, SinkEvent::ApplyAgent(_))));
    assert!(!engine.session().visited_agents.contains("FraudAgent"));
}

#[tokio::test]
async fn tool_loop_stops_at_the_iteration_cap() {
    let provider_script = vec![ScriptStep::tool_call(0, "loop", "lookup_balance", r#"{"id":"123"}"#)];
    let mut h = harness_with(vec![], |b| {
        b.config(EngineConfig {
            max_tool_iterations: 3,
            ..EngineConfig::default()
        })
    });
    h.provider.set_fallback(provider_script);

    let result = h.engine.process_turn("loop forever").await.unwrap();
    assert_eq!(result.model_calls, 3);
    assert_eq!(h.provider.calls(), 3);
    assert_eq!(result.response_text, "");
    assert!(result.error.is_none());
    assert!(h.engine.session().history.is_empty());
    // The last batch is never run since no model call is left to read it.
    assert_eq!(h.balance_lookups.lock().unwrap().len(), 2);
    assert_eq!(result.tool_calls.len(), 3);
    assert!(result.tool_calls[2].result.is_none());
}

#[tokio::test]
async fn provider_failure_yields_apology_and_no_state_change() {
    let mut h = harness(vec![vec![
        ScriptStep::text("Partial"),
        ScriptStep::Fail("503 service unavailable".into()),
    ]]);
    let result = h.engine.process_turn("hello?").await.unwrap();

    let apology = EngineConfig::default().apology_text;
    assert_eq!(result.response_text, apology);
    assert!(result.error.as_deref().unwrap().contains("503"));
    assert_eq!(result.agent, "Concierge");
    assert!(h.engine.session().history.is_empty());
    assert_eq!(h.sink.chunks().last(), Some(&apology));
}

#[tokio::test]
async fn failure_after_handoff_restores_the_previous_agent() {
    let mut h = harness(vec![
        vec![ScriptStep::tool_call(0, "h", "handoff_fraud", "{}")],
        vec![ScriptStep::Fail("timeout".into())],
    ]);
    let result = h.engine.process_turn("fraud please").await.unwrap();

    assert_eq!(result.agent, "Concierge");
    assert!(result.error.is_some());
    assert_eq!(h.engine.active_agent(), "Concierge");
    assert!(!h.engine.session().visited_agents.contains("FraudAgent"));
    let events = h.sink.events();
    let restore = events
        .iter()
        .rposition(|e| e == &SinkEvent::ApplyAgent("Concierge".into()))
        .unwrap();
    assert_eq!(events[restore + 1], SinkEvent::Chunk(EngineConfig::default().apology_text));
}

#[tokio::test]
async fn queued_handoff_applies_at_next_turn_start() {
    let mut h = harness(vec![vec![ScriptStep::text("Fraud team listening.")]]);
    h.engine
        .queue_handoff(PendingHandoff::new("FraudAgent").with_greeting("Fraud team, go ahead."))
        .await
        .unwrap();

    let result = h.engine.process_turn("hi").await.unwrap();
    assert_eq!(result.agent, "FraudAgent");
    assert_eq!(result.greeting.as_deref(), Some("Fraud team, go ahead."));
    assert!(h.provider.requests()[0].messages[0]
        .content
        .starts_with("You are the fraud specialist."));
    assert_eq!(
        &h.sink.events()[..2],
        &[
            SinkEvent::ApplyAgent("FraudAgent".into()),
            SinkEvent::Chunk("Fraud team, go ahead.".into()),
        ]
    );

    let saved = h.store.load("session-1").await.unwrap().unwrap();
    assert!(saved.pending_handoff.is_none());
    assert_eq!(saved.active_agent.as_deref(), Some("FraudAgent"));
}

#[tokio::test]
async fn handoff_resets_target_usage_counters() {
    let mut h = harness(vec![
        vec![ScriptStep::text("Balance is fine."), ScriptStep::usage(100, 10)],
        vec![
            ScriptStep::tool_call(0, "h", "handoff_fraud", "{}"),
            ScriptStep::usage(50, 5),
        ],
        vec![ScriptStep::text("Fraud desk ready."), ScriptStep::usage(30, 3)],
    ]);
    h.engine.process_turn("balance").await.unwrap();
    let result = h.engine.process_turn("fraud").await.unwrap();

    assert_eq!(result.usage.total_tokens, 88);
    let usage = &h.engine.session().usage;
    assert_eq!(usage.for_agent("FraudAgent").total_tokens, 33);
    assert_eq!(usage.for_agent("Concierge").total_tokens, 165);
    assert_eq!(usage.total.total_tokens, 198);
}
