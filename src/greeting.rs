//! Chooses what a newly activated agent says first.
//!
//! First applicable rule wins:
//! 1. an explicit `greeting` in the system vars, or in their nested
//!    `session_overrides`, spoken verbatim;
//! 2. discrete activations stay silent;
//! 3. the agent's greeting template (first visit) or return-greeting template
//!    (later visits), rendered against system vars, then handoff context,
//!    then session profile, the first source holding a field winning.
//!
//! A template that fails to render is spoken as written.

use serde_json::{Map, Value};

use crate::agent::Agent;
use crate::handoff::HandoffType;
use crate::template;

/// Inputs for one activation.
#[derive(Debug, Clone, Copy)]
pub struct GreetingRequest<'a> {
    pub agent: &'a Agent,
    pub handoff_type: HandoffType,
    pub first_visit: bool,
    pub system_vars: &'a Map<String, Value>,
    pub handoff_context: Option<&'a Map<String, Value>>,
    pub session_profile: Option<&'a Map<String, Value>>,
}

impl<'a> GreetingRequest<'a> {
    /// Request reading `handoff_context` and `session_profile` out of the
    /// system vars themselves.
    pub fn from_system_vars(
        agent: &'a Agent,
        handoff_type: HandoffType,
        first_visit: bool,
        system_vars: &'a Map<String, Value>,
    ) -> Self {
        Self {
            agent,
            handoff_type,
            first_visit,
            system_vars,
            handoff_context: system_vars.get("handoff_context").and_then(Value::as_object),
            session_profile: system_vars.get("session_profile").and_then(Value::as_object),
        }
    }
}

pub fn select_greeting(request: &GreetingRequest<'_>) -> Option<String> {
    if let Some(explicit) = explicit_greeting(request.system_vars) {
        return Some(explicit);
    }
    if request.handoff_type == HandoffType::Discrete {
        return None;
    }
    let template_text = request.agent.greeting_template(request.first_visit)?;
    let context = greeting_context(request);
    let rendered = template::render_or_raw(template_text, &context);
    let rendered = rendered.trim();
    if rendered.is_empty() {
        None
    } else {
        Some(rendered.to_string())
    }
}

fn explicit_greeting(system_vars: &Map<String, Value>) -> Option<String> {
    let direct = system_vars.get("greeting");
    let nested = system_vars
        .get("session_overrides")
        .and_then(Value::as_object)
        .and_then(|o| o.get("greeting"));
    direct
        .into_iter()
        .chain(nested)
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|g| !g.is_empty())
        .map(str::to_string)
}

fn greeting_context(request: &GreetingRequest<'_>) -> Map<String, Value> {
    let mut context = Map::new();
    if let Some(profile) = request.session_profile {
        context.extend(profile.clone());
        context.insert("session_profile".into(), Value::Object(profile.clone()));
    }
    if let Some(handoff) = request.handoff_context {
        context.extend(handoff.clone());
        context.insert("handoff_context".into(), Value::Object(handoff.clone()));
    }
    context.extend(request.system_vars.clone());
    context
        .entry("agent_name")
        .or_insert_with(|| Value::String(request.agent.name.clone()));
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn fraud_agent() -> Agent {
        Agent::new("FraudAgent", "prompt")
            .with_greeting("Hi {{ client_name | default('there') }}, {{ agent_name }} here.")
            .with_return_greeting("Welcome back {{ client_name }}.")
    }

    #[test]
    fn explicit_greeting_wins() {
        let agent = fraud_agent();
        let vars = obj(json!({"session_overrides": {"greeting": "Scripted hello."}}));
        let req = GreetingRequest::from_system_vars(&agent, HandoffType::Announced, true, &vars);
        assert_eq!(select_greeting(&req).as_deref(), Some("Scripted hello."));

        let vars = obj(json!({"greeting": "Direct.", "session_overrides": {"greeting": "Nested."}}));
        let req = GreetingRequest::from_system_vars(&agent, HandoffType::Announced, true, &vars);
        assert_eq!(select_greeting(&req).as_deref(), Some("Direct."));
    }

    #[test]
    fn discrete_handoff_is_silent() {
        let agent = fraud_agent();
        let vars = obj(json!({"client_name": "Ada"}));
        let req = GreetingRequest::from_system_vars(&agent, HandoffType::Discrete, true, &vars);
        assert_eq!(select_greeting(&req), None);
    }

    #[test]
    fn first_and_return_visits_use_different_templates() {
        let agent = fraud_agent();
        let vars = obj(json!({"client_name": "Ada"}));
        let first = GreetingRequest::from_system_vars(&agent, HandoffType::Announced, true, &vars);
        assert_eq!(
            select_greeting(&first).as_deref(),
            Some("Hi Ada, FraudAgent here.")
        );
        let again = GreetingRequest::from_system_vars(&agent, HandoffType::Announced, false, &vars);
        assert_eq!(select_greeting(&again).as_deref(), Some("Welcome back Ada."));
    }

    #[test]
    fn direct_fields_win_over_nested_sources() {
        let agent = Agent::new("A", "p").with_greeting("{{ client_name }}/{{ tier }}/{{ topic }}");
        let vars = obj(json!({"client_name": "Direct"}));
        let handoff = obj(json!({"client_name": "Handoff", "topic": "fraud"}));
        let profile = obj(json!({"client_name": "Profile", "tier": "gold", "topic": "none"}));
        let req = GreetingRequest {
            agent: &agent,
            handoff_type: HandoffType::Announced,
            first_visit: true,
            system_vars: &vars,
            handoff_context: Some(&handoff),
            session_profile: Some(&profile),
        };
        assert_eq!(select_greeting(&req).as_deref(), Some("Direct/gold/fraud"));
    }

    #[test]
    fn broken_template_is_spoken_raw() {
        let agent = Agent::new("A", "p").with_greeting("Hello {{ name");
        let vars = Map::new();
        let req = GreetingRequest::from_system_vars(&agent, HandoffType::Announced, true, &vars);
        assert_eq!(select_greeting(&req).as_deref(), Some("Hello {{ name"));
    }

    #[test]
    fn agent_without_greeting_stays_silent() {
        let agent = Agent::new("A", "p");
        let vars = Map::new();
        let req = GreetingRequest::from_system_vars(&agent, HandoffType::Announced, true, &vars);
        assert_eq!(select_greeting(&req), None);
    }
}
