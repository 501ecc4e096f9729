//! # Agent Handoff Resolution
//!
//! A handoff transfers conversational control from the active agent to
//! another agent. Handoffs are triggered by handoff-kind tools; which agent a
//! tool leads to, and how the transfer happens, is described by
//! [`HandoffRoute`]s collected in a [`HandoffRouteTable`].
//!
//! ## Resolution
//!
//! [`HandoffRouteTable::resolve`] is a pure function of the table, the
//! request and the agent registry. The first matching rule wins:
//!
//! 1. a route from the source agent with the calling tool name;
//! 2. a route from the source agent to the already-known target (the
//!    `target_agent` carried by the tool's payload);
//! 3. a route with the tool name from any source, wildcard routes first;
//! 4. the table's default policy, applied to the known target.
//!
//! Resolution fails when no target can be determined or the target is not a
//! registered agent. Failures are values, never panics: the caller keeps the
//! current agent.
//!
//! ## Context propagation
//!
//! A successful resolution carries the system vars the target agent renders
//! against: the caller's vars, then `previous_agent`/`active_agent`, then the
//! sanitized handoff context (when the route shares context), then explicit
//! overrides from the tool payload such as a scripted greeting.
//!
//! ```rust
//! use tower_voice::agent::{Agent, StaticAgentRegistry};
//! use tower_voice::handoff::{HandoffRoute, HandoffRouteTable};
//!
//! let agents = StaticAgentRegistry::new([
//!     Agent::new("Concierge", "..."),
//!     Agent::new("FraudAgent", "..."),
//! ]);
//! let table = HandoffRouteTable::new([HandoffRoute::new("Concierge", "handoff_fraud", "FraudAgent")]);
//!
//! let resolution = table.resolve_tool("handoff_fraud", "Concierge", &agents);
//! assert!(resolution.success);
//! assert_eq!(resolution.target_agent, "FraudAgent");
//! assert!(resolution.greet_on_switch);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::agent::{Agent, AgentRegistry};

/// Whether the incoming agent introduces itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffType {
    /// The new agent greets the caller.
    #[default]
    Announced,
    /// The new agent continues silently.
    Discrete,
}

impl HandoffType {
    pub fn greet_on_switch(self) -> bool {
        matches!(self, HandoffType::Announced)
    }
}

impl std::str::FromStr for HandoffType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "announced" => Ok(HandoffType::Announced),
            "discrete" => Ok(HandoffType::Discrete),
            other => Err(format!("unknown handoff type: {}", other)),
        }
    }
}

/// Policy applied when no route matches but the target is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffDefaults {
    pub handoff_type: HandoffType,
    pub share_context: bool,
}

impl Default for HandoffDefaults {
    fn default() -> Self {
        Self {
            handoff_type: HandoffType::Announced,
            share_context: true,
        }
    }
}

/// A directed edge between agents, triggered by a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRoute {
    /// Source agent; `None` matches any source.
    #[serde(default)]
    pub from_agent: Option<String>,
    pub to_agent: String,
    pub tool_name: String,
    #[serde(default)]
    pub handoff_type: HandoffType,
    #[serde(default = "default_share_context")]
    pub share_context: bool,
}

fn default_share_context() -> bool {
    true
}

impl HandoffRoute {
    /// Announced, context-sharing route from `from_agent`.
    pub fn new(
        from_agent: impl Into<String>,
        tool_name: impl Into<String>,
        to_agent: impl Into<String>,
    ) -> Self {
        Self {
            from_agent: Some(from_agent.into()),
            to_agent: to_agent.into(),
            tool_name: tool_name.into(),
            handoff_type: HandoffType::Announced,
            share_context: true,
        }
    }

    /// Announced, context-sharing route usable from any agent.
    pub fn from_any(tool_name: impl Into<String>, to_agent: impl Into<String>) -> Self {
        Self {
            from_agent: None,
            to_agent: to_agent.into(),
            tool_name: tool_name.into(),
            handoff_type: HandoffType::Announced,
            share_context: true,
        }
    }

    pub fn discrete(mut self) -> Self {
        self.handoff_type = HandoffType::Discrete;
        self
    }

    pub fn with_share_context(mut self, share: bool) -> Self {
        self.share_context = share;
        self
    }

    fn from_is(&self, agent: &str) -> bool {
        self.from_agent.as_deref() == Some(agent)
    }
}

/// What a handoff tool's result carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffPayload {
    #[serde(default)]
    pub handoff: bool,
    #[serde(default)]
    pub target_agent: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub handoff_summary: Option<String>,
    #[serde(default)]
    pub handoff_context: Option<Map<String, Value>>,
    #[serde(default)]
    pub should_interrupt_playback: bool,
    /// Explicit greeting for the target agent, spoken verbatim.
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub session_overrides: Option<Map<String, Value>>,
}

impl HandoffPayload {
    /// Reads a payload from a tool result. Malformed fields are ignored.
    pub fn from_result(result: &Map<String, Value>) -> Self {
        match serde_json::from_value(Value::Object(result.clone())) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "malformed handoff payload; using defaults");
                Self {
                    target_agent: result
                        .get("target_agent")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    ..Self::default()
                }
            }
        }
    }

    /// Payload built from the call arguments alone, used when the tool
    /// itself could not run.
    pub fn from_arguments(arguments: &Map<String, Value>) -> Self {
        Self {
            handoff: true,
            target_agent: arguments
                .get("target_agent")
                .and_then(Value::as_str)
                .map(str::to_string),
            handoff_summary: arguments
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            handoff_context: Some(arguments.clone()),
            ..Self::default()
        }
    }

    /// Explicit overrides to lay over the merged system vars.
    fn overrides(&self) -> Map<String, Value> {
        let mut out = Map::new();
        if let Some(greeting) = self.greeting.as_deref().filter(|g| !g.trim().is_empty()) {
            out.insert("greeting".into(), Value::String(greeting.to_string()));
        }
        if let Some(overrides) = self.session_overrides.as_ref().filter(|o| !o.is_empty()) {
            out.insert("session_overrides".into(), Value::Object(overrides.clone()));
        }
        out
    }
}

/// Input to [`HandoffRouteTable::resolve`].
#[derive(Debug, Clone, Default)]
pub struct HandoffRequest {
    pub tool_name: String,
    pub source_agent: String,
    pub payload: HandoffPayload,
    /// The caller's current system vars.
    pub system_vars: Map<String, Value>,
}

/// Typed outcome of a handoff resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffResolution {
    pub success: bool,
    /// Empty when resolution failed.
    pub target_agent: String,
    pub source_agent: String,
    pub tool_name: String,
    pub handoff_type: HandoffType,
    pub share_context: bool,
    pub greet_on_switch: bool,
    /// System vars for the target agent; empty when resolution failed.
    pub system_vars: Map<String, Value>,
    pub error: Option<String>,
}

impl HandoffResolution {
    fn failed(request: &HandoffRequest, error: String) -> Self {
        Self {
            success: false,
            target_agent: String::new(),
            source_agent: request.source_agent.clone(),
            tool_name: request.tool_name.clone(),
            handoff_type: HandoffType::default(),
            share_context: false,
            greet_on_switch: false,
            system_vars: Map::new(),
            error: Some(error),
        }
    }

    /// Resolution for a transfer decided by application logic rather than
    /// a route lookup.
    pub fn direct(
        request: &HandoffRequest,
        target: &str,
        handoff_type: HandoffType,
        share_context: bool,
        agents: &dyn AgentRegistry,
    ) -> Self {
        if !agents.contains(target) {
            return Self::failed(request, format!("target agent not registered: {}", target));
        }
        Self {
            success: true,
            target_agent: target.to_string(),
            source_agent: request.source_agent.clone(),
            tool_name: request.tool_name.clone(),
            handoff_type,
            share_context,
            greet_on_switch: handoff_type.greet_on_switch(),
            system_vars: build_handoff_system_vars(request, target, share_context),
            error: None,
        }
    }

    pub fn is_discrete(&self) -> bool {
        self.handoff_type == HandoffType::Discrete
    }
}

/// Ordered set of handoff routes plus the fallback policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffRouteTable {
    routes: Vec<HandoffRoute>,
    #[serde(default)]
    defaults: HandoffDefaults,
}

impl HandoffRouteTable {
    pub fn new(routes: impl IntoIterator<Item = HandoffRoute>) -> Self {
        Self {
            routes: routes.into_iter().collect(),
            defaults: HandoffDefaults::default(),
        }
    }

    /// Wildcard routes derived from each agent's handoff trigger tool.
    pub fn from_agents<'a>(agents: impl IntoIterator<Item = &'a Agent>) -> Self {
        Self::new(agents.into_iter().filter_map(|agent| {
            agent
                .handoff_trigger
                .as_ref()
                .map(|tool| HandoffRoute::from_any(tool.clone(), agent.name.clone()))
        }))
    }

    pub fn with_defaults(mut self, defaults: HandoffDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_route(mut self, route: HandoffRoute) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(&self) -> &[HandoffRoute] {
        &self.routes
    }

    pub fn defaults(&self) -> HandoffDefaults {
        self.defaults
    }

    /// Resolves a tool call with no payload and no caller vars.
    pub fn resolve_tool(
        &self,
        tool_name: &str,
        source_agent: &str,
        agents: &dyn AgentRegistry,
    ) -> HandoffResolution {
        self.resolve(
            &HandoffRequest {
                tool_name: tool_name.to_string(),
                source_agent: source_agent.to_string(),
                ..HandoffRequest::default()
            },
            agents,
        )
    }

    /// Resolves a handoff request. Never panics; failures are reported in
    /// the returned resolution.
    pub fn resolve(&self, request: &HandoffRequest, agents: &dyn AgentRegistry) -> HandoffResolution {
        let source = request.source_agent.as_str();
        let tool = request.tool_name.as_str();
        let known_target = request
            .payload
            .target_agent
            .as_deref()
            .filter(|t| !t.is_empty());

        let route = self
            .routes
            .iter()
            .find(|r| r.from_is(source) && r.tool_name == tool)
            .or_else(|| {
                known_target.and_then(|target| {
                    self.routes
                        .iter()
                        .find(|r| r.from_is(source) && r.to_agent == target)
                })
            })
            .or_else(|| {
                self.routes
                    .iter()
                    .find(|r| r.from_agent.is_none() && r.tool_name == tool)
            })
            .or_else(|| self.routes.iter().find(|r| r.tool_name == tool));

        let (target, handoff_type, share_context) = match (route, known_target) {
            (Some(route), _) => {
                debug!(tool, source, target = %route.to_agent, "handoff route matched");
                (route.to_agent.as_str(), route.handoff_type, route.share_context)
            }
            (None, Some(target)) => {
                debug!(tool, source, target, "no route; applying default handoff policy");
                (target, self.defaults.handoff_type, self.defaults.share_context)
            }
            (None, None) => {
                return HandoffResolution::failed(
                    request,
                    format!("no handoff target for tool '{}' from '{}'", tool, source),
                );
            }
        };

        HandoffResolution::direct(request, target, handoff_type, share_context, agents)
    }
}

/// Drops null, blank-string, `false` and empty-collection values, recursively,
/// so "not applicable" fields never reach templates.
pub fn sanitize_handoff_context(context: &Map<String, Value>) -> Map<String, Value> {
    context
        .iter()
        .filter_map(|(key, value)| sanitize_value(value).map(|v| (key.clone(), v)))
        .collect()
}

fn sanitize_value(value: &Value) -> Option<Value> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) => {
            let cleaned = sanitize_handoff_context(map);
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other.clone()),
    }
}

/// Merges the system vars the target agent renders against.
pub fn build_handoff_system_vars(
    request: &HandoffRequest,
    target_agent: &str,
    share_context: bool,
) -> Map<String, Value> {
    let mut vars = request.system_vars.clone();
    vars.insert(
        "previous_agent".into(),
        Value::String(request.source_agent.clone()),
    );
    vars.insert("active_agent".into(), Value::String(target_agent.to_string()));

    if share_context {
        let context = request
            .payload
            .handoff_context
            .as_ref()
            .map(sanitize_handoff_context)
            .unwrap_or_default();
        for (key, value) in &context {
            vars.insert(key.clone(), value.clone());
        }
        if !context.is_empty() {
            vars.insert("handoff_context".into(), Value::Object(context));
        }
        if let Some(summary) = request
            .payload
            .handoff_summary
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            vars.insert("handoff_summary".into(), Value::String(summary.to_string()));
        }
    } else {
        vars.remove("handoff_context");
        vars.remove("handoff_summary");
    }

    // A greeting from an earlier activation must not leak into this one.
    vars.remove("greeting");
    if let Some(Value::Object(overrides)) = vars.get_mut("session_overrides") {
        overrides.remove("greeting");
    }
    for (key, value) in request.payload.overrides() {
        vars.insert(key, value);
    }
    vars
}
