//! # Agents and the agent registry
//!
//! An [`Agent`] is an immutable definition: a name, a prompt template, the
//! tools it may call, model and voice parameters, and the greetings it speaks
//! when it becomes active. Definitions are loaded once and shared read-only by
//! every session through an [`AgentRegistry`].
//!
//! ```rust
//! use tower_voice::agent::{Agent, AgentRegistry, StaticAgentRegistry};
//!
//! let concierge = Agent::new("Concierge", "You are the bank concierge for {{ client_name }}.")
//!     .with_tools(["lookup_balance", "handoff_fraud"])
//!     .with_greeting("Hi {{ client_name | default('there') }}, how can I help?");
//! let fraud = Agent::new("FraudAgent", "You investigate suspicious activity.")
//!     .with_handoff_trigger("handoff_fraud");
//!
//! let registry = StaticAgentRegistry::new([concierge, fraud]);
//! assert!(registry.lookup("FraudAgent").is_some());
//! assert_eq!(registry.list_names(), vec!["Concierge", "FraudAgent"]);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Model parameters used for every completion the agent requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Deployment or model id passed to the provider (e.g. "gpt-4o").
    pub deployment_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            deployment_id: "gpt-4o".to_string(),
            temperature: Some(0.7),
            top_p: None,
            max_tokens: Some(512),
        }
    }
}

/// Voice parameters forwarded to the speech synthesizer when the agent
/// becomes active. The engine treats them as opaque.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<String>,
}

/// An immutable agent definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique key of the agent.
    pub name: String,

    /// Short description, surfaced in handoff tool descriptions.
    #[serde(default)]
    pub description: String,

    /// System prompt template rendered against the session's system vars.
    pub prompt_template: String,

    /// Names of the tools this agent may call, in the order they are offered.
    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default)]
    pub model: ModelParams,

    #[serde(default)]
    pub voice: VoiceParams,

    /// Spoken on the agent's first activation in a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,

    /// Spoken when the agent is activated again later in the same session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_greeting: Option<String>,

    /// Tool name other agents call to reach this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_trigger: Option<String>,
}

impl Agent {
    pub fn new(name: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            prompt_template: prompt_template.into(),
            tools: Vec::new(),
            model: ModelParams::default(),
            voice: VoiceParams::default(),
            greeting: None,
            return_greeting: None,
            handoff_trigger: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_model(mut self, model: ModelParams) -> Self {
        self.model = model;
        self
    }

    pub fn with_voice(mut self, voice: VoiceParams) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    pub fn with_return_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.return_greeting = Some(greeting.into());
        self
    }

    pub fn with_handoff_trigger(mut self, tool_name: impl Into<String>) -> Self {
        self.handoff_trigger = Some(tool_name.into());
        self
    }

    /// Greeting template for an activation: the first-visit greeting, or the
    /// return greeting (falling back to the first-visit one) on later visits.
    pub fn greeting_template(&self, first_visit: bool) -> Option<&str> {
        if first_visit {
            self.greeting.as_deref()
        } else {
            self.return_greeting.as_deref().or(self.greeting.as_deref())
        }
    }
}

/// Read-only lookup of agent definitions.
pub trait AgentRegistry: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<Agent>>;

    fn list_names(&self) -> Vec<String>;

    fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }
}

/// Registry built once at startup from a fixed set of agents.
#[derive(Debug, Clone, Default)]
pub struct StaticAgentRegistry {
    agents: BTreeMap<String, Arc<Agent>>,
}

impl StaticAgentRegistry {
    /// Later definitions replace earlier ones with the same name.
    pub fn new(agents: impl IntoIterator<Item = Agent>) -> Self {
        let agents = agents
            .into_iter()
            .map(|agent| (agent.name.clone(), Arc::new(agent)))
            .collect();
        Self { agents }
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<Agent>> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl AgentRegistry for StaticAgentRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.get(name).cloned()
    }

    fn list_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_template_selection() {
        let agent = Agent::new("A", "prompt").with_greeting("Hello");
        assert_eq!(agent.greeting_template(true), Some("Hello"));
        assert_eq!(agent.greeting_template(false), Some("Hello"));

        let agent = agent.with_return_greeting("Welcome back");
        assert_eq!(agent.greeting_template(false), Some("Welcome back"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StaticAgentRegistry::new([
            Agent::new("B", "b"),
            Agent::new("A", "a"),
            Agent::new("A", "replaced"),
        ]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list_names(), vec!["A", "B"]);
        assert_eq!(registry.lookup("A").unwrap().prompt_template, "replaced");
        assert!(!registry.contains("C"));
    }

    #[test]
    fn test_agent_deserializes_with_defaults() {
        let agent: Agent = serde_json::from_str(
            r#"{"name": "Concierge", "prompt_template": "Hi", "handoff_trigger": "handoff_concierge"}"#,
        )
        .unwrap();
        assert_eq!(agent.model, ModelParams::default());
        assert!(agent.tools.is_empty());
        assert_eq!(agent.handoff_trigger.as_deref(), Some("handoff_concierge"));
    }
}
