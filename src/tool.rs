//! # Tool registry
//!
//! Tools are tower services over [`ToolInvocation`] → [`ToolOutput`], stored
//! in a [`ToolRegistry`] keyed by name and built once at startup. Every tool
//! carries a [`ToolKind`]: business tools run inside the turn's tool loop,
//! handoff tools transfer control to another agent.
//!
//! The engine only sees the [`ToolExecutor`] contract: look up a tool's kind,
//! describe the tools an agent may call, and execute one call with a JSON
//! object of arguments, getting a JSON object back.
//!
//! ```rust
//! use tower_voice::tool::{ToolDef, ToolExecutor, ToolKind, ToolRegistry};
//! use serde_json::json;
//!
//! # async fn example() -> tower_voice::Result<()> {
//! let registry = ToolRegistry::new()
//!     .register(ToolDef::from_fn(
//!         "lookup_balance",
//!         "Look up an account balance",
//!         json!({"type": "object", "properties": {"id": {"type": "string"}}}),
//!         |args| async move { Ok::<_, tower::BoxError>(json!({"success": true, "balance": 42, "id": args["id"]})) },
//!     ))
//!     .register(ToolDef::handoff("handoff_fraud", "Transfer to fraud", "FraudAgent"));
//!
//! assert_eq!(registry.kind("handoff_fraud"), Some(ToolKind::Handoff));
//! let out = registry
//!     .execute("lookup_balance", json!({"id": "123"}).as_object().unwrap().clone())
//!     .await?;
//! assert_eq!(out["balance"], 42);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower::{util::BoxCloneSyncService, BoxError, Service, ServiceExt};
use tracing::debug;

use crate::error::{Result, VoiceError};

/// Whether a tool runs in the tool loop or transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Business,
    Handoff,
}

/// Uniform tool invocation passed to routed tool services.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Uniform tool output produced by tool services.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub id: String,
    pub result: Map<String, Value>,
}

/// Boxed tool service type alias.
pub type ToolSvc = BoxCloneSyncService<ToolInvocation, ToolOutput, BoxError>;

/// Provider-neutral function description offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Definition of a tool: function spec, kind, tags and service implementation.
#[derive(Clone)]
pub struct ToolDef {
    pub spec: ToolSpec,
    pub kind: ToolKind,
    pub tags: Vec<String>,
    pub service: ToolSvc,
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.spec.name)
            .field("kind", &self.kind)
            .field("tags", &self.tags)
            .finish()
    }
}

impl ToolDef {
    /// Business tool from an async handler taking JSON args and returning JSON.
    ///
    /// Non-object results are wrapped as `{"result": value}`.
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        let name = name.into();
        let routed_name = name.clone();
        let svc = tower::service_fn(move |inv: ToolInvocation| {
            let handler = handler.clone();
            let expected = routed_name.clone();
            async move {
                if inv.name != expected {
                    return Err::<ToolOutput, BoxError>(
                        format!("routed to wrong tool: expected={}, got={}", expected, inv.name)
                            .into(),
                    );
                }
                let result = match (handler)(inv.arguments).await? {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("result".to_string(), other);
                        map
                    }
                };
                Ok::<ToolOutput, BoxError>(ToolOutput { id: inv.id, result })
            }
        });
        Self {
            spec: ToolSpec {
                name,
                description: description.into(),
                parameters,
            },
            kind: ToolKind::Business,
            tags: Vec::new(),
            service: BoxCloneSyncService::new(svc),
        }
    }

    /// Handoff tool that always targets `target_agent`.
    ///
    /// The call's arguments become the handoff context, and a `reason`
    /// argument doubles as the handoff summary.
    pub fn handoff(
        name: impl Into<String>,
        description: impl Into<String>,
        target_agent: impl Into<String>,
    ) -> Self {
        let target_agent = target_agent.into();
        let parameters = json!({
            "type": "object",
            "properties": {
                "reason": {"type": "string", "description": "Why the caller needs the specialist"},
                "details": {"type": "object", "description": "Facts the next agent should know"}
            }
        });
        Self::from_fn(name, description, parameters, move |args| {
            let target_agent = target_agent.clone();
            async move {
                let reason = args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok::<Value, BoxError>(json!({
                    "handoff": true,
                    "target_agent": target_agent,
                    "message": "",
                    "handoff_summary": reason,
                    "handoff_context": Value::Object(args),
                    "should_interrupt_playback": true,
                }))
            }
        })
        .with_kind(ToolKind::Handoff)
    }

    pub fn with_kind(mut self, kind: ToolKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// DX sugar: create a business tool from a typed handler.
/// - `A` is the input args struct (Deserialize + JsonSchema)
/// - `R` is the output type (Serialize)
pub fn tool_typed<A, H, Fut, R>(
    name: impl Into<String>,
    description: impl Into<String>,
    handler: H,
) -> Result<ToolDef>
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: Serialize + Send + 'static,
    H: Fn(A) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
{
    let schema = schemars::schema_for!(A);
    let parameters = serde_json::to_value(schema.schema)?;
    Ok(ToolDef::from_fn(name, description, parameters, move |raw| {
        let handler = handler.clone();
        async move {
            let args: A = serde_json::from_value(Value::Object(raw))?;
            let out = handler(args).await?;
            Ok::<Value, BoxError>(serde_json::to_value(out)?)
        }
    }))
}

/// True unless the result explicitly says `"success": false`.
pub fn is_success(result: &Map<String, Value>) -> bool {
    !matches!(result.get("success"), Some(Value::Bool(false)))
}

/// The engine-facing tool contract.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Kind of the named tool, `None` when it is not registered.
    fn kind(&self, name: &str) -> Option<ToolKind>;

    fn is_handoff_tool(&self, name: &str) -> bool {
        self.kind(name) == Some(ToolKind::Handoff)
    }

    /// Specs for the given names, in order, skipping unknown names.
    fn specs(&self, names: &[String]) -> Vec<ToolSpec>;

    async fn execute(&self, name: &str, args: Map<String, Value>) -> Result<Map<String, Value>>;
}

/// Name-keyed registry of tool services.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool; a later registration under the same name replaces it.
    pub fn register(mut self, tool: ToolDef) -> Self {
        self.insert(tool);
        self
    }

    pub fn insert(&mut self, tool: ToolDef) {
        debug!(tool = %tool.spec.name, kind = ?tool.kind, "registering tool");
        self.tools.insert(tool.spec.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDef> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of all tools carrying `tag`, sorted.
    pub fn tagged(&self, tag: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|t| t.tags.iter().any(|t| t == tag))
            .map(|t| t.spec.name.clone())
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl Service<ToolInvocation> for ToolRegistry {
    type Response = ToolOutput;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        // Readiness is checked per selected service inside `call`.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let svc = self.tools.get(&req.name).map(|t| t.service.clone());
        Box::pin(async move {
            match svc {
                Some(svc) => svc.oneshot(req).await,
                None => Err(format!("unknown tool: {}", req.name).into()),
            }
        })
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn kind(&self, name: &str) -> Option<ToolKind> {
        self.tools.get(name).map(|t| t.kind)
    }

    fn specs(&self, names: &[String]) -> Vec<ToolSpec> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n).map(|t| t.spec.clone()))
            .collect()
    }

    async fn execute(&self, name: &str, args: Map<String, Value>) -> Result<Map<String, Value>> {
        if !self.tools.contains_key(name) {
            return Err(VoiceError::UnknownTool(name.to_string()));
        }
        let invocation = ToolInvocation {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            arguments: args,
        };
        let output = self
            .clone()
            .oneshot(invocation)
            .await
            .map_err(|e| VoiceError::tool(name, e))?;
        Ok(output.result)
    }
}
