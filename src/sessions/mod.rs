//! # Session state and persistence
//!
//! A [`SessionState`] is owned by exactly one turn engine and mutated only by
//! it. Between turns the [`SessionSynchronizer`] reconciles that state with a
//! [`SessionStore`] keyed by session id:
//!
//! - `pull` (turn start) loads the active agent, visited agents and system
//!   vars, and applies a pending handoff queued by application logic;
//! - `push` (turn end) writes the updated values back.
//!
//! Stores must tolerate repeated identical writes. Saving never touches the
//! pending handoff, so a handoff queued while a turn is running survives the
//! turn's own save.

mod sqlite;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentRegistry;
use crate::error::Result;
use crate::handoff::{HandoffDefaults, HandoffPayload, HandoffRequest, HandoffResolution, HandoffType};
use crate::items::ChatMessage;
use crate::usage::UsageLedger;

pub use sqlite::SqliteSessionStore;

/// Tool name recorded on resolutions created from a pending handoff.
pub const PENDING_HANDOFF_TOOL: &str = "pending_handoff";

/// A handoff queued outside of an LLM tool call, applied at the next turn start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHandoff {
    pub target_agent: String,
    /// Falls back to the engine's default policy when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_type: Option<HandoffType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_context: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

impl PendingHandoff {
    pub fn new(target_agent: impl Into<String>) -> Self {
        Self {
            target_agent: target_agent.into(),
            handoff_type: None,
            share_context: None,
            reason: None,
            context: Map::new(),
            greeting: None,
        }
    }

    pub fn with_type(mut self, handoff_type: HandoffType) -> Self {
        self.handoff_type = Some(handoff_type);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    fn payload(&self) -> HandoffPayload {
        HandoffPayload {
            handoff: true,
            target_agent: Some(self.target_agent.clone()),
            handoff_summary: self.reason.clone(),
            handoff_context: Some(self.context.clone()),
            greeting: self.greeting.clone(),
            ..HandoffPayload::default()
        }
    }
}

/// What a store holds for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub active_agent: Option<String>,
    #[serde(default)]
    pub visited_agents: BTreeSet<String>,
    #[serde(default)]
    pub system_vars: Map<String, Value>,
    #[serde(default)]
    pub pending_handoff: Option<PendingHandoff>,
}

/// External session store contract.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `None` for a session never saved.
    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>>;

    async fn save(
        &self,
        session_id: &str,
        active_agent: &str,
        visited_agents: &BTreeSet<String>,
        system_vars: &Map<String, Value>,
    ) -> Result<()>;

    async fn set_pending_handoff(&self, session_id: &str, pending: PendingHandoff) -> Result<()>;

    async fn clear_pending_handoff(&self, session_id: &str) -> Result<()>;
}

/// Process-local store.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, SessionSnapshot>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn save(
        &self,
        session_id: &str,
        active_agent: &str,
        visited_agents: &BTreeSet<String>,
        system_vars: &Map<String, Value>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(session_id.to_string()).or_default();
        entry.active_agent = Some(active_agent.to_string());
        entry.visited_agents = visited_agents.clone();
        entry.system_vars = system_vars.clone();
        Ok(())
    }

    async fn set_pending_handoff(&self, session_id: &str, pending: PendingHandoff) -> Result<()> {
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .pending_handoff = Some(pending);
        Ok(())
    }

    async fn clear_pending_handoff(&self, session_id: &str) -> Result<()> {
        if let Some(snapshot) = self.sessions.lock().await.get_mut(session_id) {
            snapshot.pending_handoff = None;
        }
        Ok(())
    }
}

/// Per-session mutable state, owned by one turn engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub session_id: String,
    pub active_agent: String,
    pub visited_agents: BTreeSet<String>,
    pub turn_count: u64,
    pub system_vars: Map<String, Value>,
    pub history: Vec<ChatMessage>,
    pub usage: UsageLedger,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, initial_agent: impl Into<String>) -> Self {
        let active_agent = initial_agent.into();
        let mut system_vars = Map::new();
        system_vars.insert("active_agent".into(), Value::String(active_agent.clone()));
        Self {
            session_id: session_id.into(),
            visited_agents: BTreeSet::from([active_agent.clone()]),
            active_agent,
            system_vars,
            ..Self::default()
        }
    }

    pub fn with_system_vars(mut self, vars: Map<String, Value>) -> Self {
        self.system_vars.extend(vars);
        self
    }

    pub fn has_visited(&self, agent: &str) -> bool {
        self.visited_agents.contains(agent)
    }

    /// Activates the resolution's target. Returns whether this is the
    /// target's first visit in the session.
    ///
    /// The conversation history restarts and the target's usage counters
    /// reset. Failed resolutions change nothing and return `false`.
    pub fn apply_resolution(&mut self, resolution: &HandoffResolution) -> bool {
        if !resolution.success {
            return false;
        }
        let first_visit = self.visited_agents.insert(resolution.target_agent.clone());
        self.active_agent = resolution.target_agent.clone();
        self.system_vars = resolution.system_vars.clone();
        self.history.clear();
        self.usage.reset_agent(&resolution.target_agent);
        first_visit
    }
}

/// A handoff applied by [`SessionSynchronizer::pull`].
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub resolution: HandoffResolution,
    pub first_visit: bool,
}

/// Moves session state between a [`SessionStore`] and the engine.
#[derive(Clone)]
pub struct SessionSynchronizer {
    store: Arc<dyn SessionStore>,
}

impl SessionSynchronizer {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Refreshes `state` from the store and applies any pending handoff.
    ///
    /// A stored active agent missing from the registry is ignored. A pending
    /// handoff is cleared whether or not it resolves.
    #[instrument(skip_all, fields(session_id = %state.session_id))]
    pub async fn pull(
        &self,
        state: &mut SessionState,
        agents: &dyn AgentRegistry,
        defaults: HandoffDefaults,
    ) -> Result<Option<Activation>> {
        let Some(snapshot) = self.store.load(&state.session_id).await? else {
            debug!("no stored session; keeping local state");
            return Ok(None);
        };

        match snapshot.active_agent {
            Some(agent) if agents.contains(&agent) => state.active_agent = agent,
            Some(agent) => warn!(agent = %agent, "stored active agent is not registered; ignoring"),
            None => {}
        }
        state.visited_agents.extend(snapshot.visited_agents);
        state.visited_agents.insert(state.active_agent.clone());
        if !snapshot.system_vars.is_empty() {
            state.system_vars = snapshot.system_vars;
        }

        let Some(pending) = snapshot.pending_handoff else {
            return Ok(None);
        };
        self.store.clear_pending_handoff(&state.session_id).await?;

        let request = HandoffRequest {
            tool_name: PENDING_HANDOFF_TOOL.to_string(),
            source_agent: state.active_agent.clone(),
            payload: pending.payload(),
            system_vars: state.system_vars.clone(),
        };
        let resolution = HandoffResolution::direct(
            &request,
            &pending.target_agent,
            pending.handoff_type.unwrap_or(defaults.handoff_type),
            pending.share_context.unwrap_or(defaults.share_context),
            agents,
        );
        if !resolution.success {
            warn!(
                target = %pending.target_agent,
                error = resolution.error.as_deref().unwrap_or_default(),
                "dropping unresolvable pending handoff"
            );
            return Ok(None);
        }

        let first_visit = state.apply_resolution(&resolution);
        info!(
            from = %resolution.source_agent,
            to = %resolution.target_agent,
            first_visit,
            "applied pending handoff"
        );
        Ok(Some(Activation {
            resolution,
            first_visit,
        }))
    }

    #[instrument(skip_all, fields(session_id = %state.session_id, agent = %state.active_agent))]
    pub async fn push(&self, state: &SessionState) -> Result<()> {
        self.store
            .save(
                &state.session_id,
                &state.active_agent,
                &state.visited_agents,
                &state.system_vars,
            )
            .await
    }
}

impl std::fmt::Debug for SessionSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSynchronizer").finish_non_exhaustive()
    }
}
