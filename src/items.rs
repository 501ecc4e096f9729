//! Conversation items: chat messages, assembled tool calls and streamed
//! tool-call fragments.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }
}

/// A tool call assembled from the model stream.
///
/// `raw_args` keeps the exact argument text the model produced; `arguments`
/// holds the parsed value and is only meaningful when `resolved` is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub raw_args: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ToolCall {
    /// Builds a call from its raw parts, parsing the argument text.
    ///
    /// Blank argument text is read as an empty object, since providers omit
    /// arguments for parameterless functions.
    pub fn parse(id: impl Into<String>, name: impl Into<String>, raw_args: impl Into<String>) -> Self {
        let raw_args = raw_args.into();
        let text = if raw_args.trim().is_empty() {
            "{}"
        } else {
            raw_args.as_str()
        };
        let (arguments, resolved) = match serde_json::from_str::<Value>(text) {
            Ok(value) => (value, true),
            Err(_) => (Value::Null, false),
        };
        let mut id = id.into();
        if id.is_empty() {
            id = format!("call_{}", Uuid::new_v4().simple());
        }
        Self {
            id,
            name: name.into(),
            raw_args,
            arguments,
            resolved,
            result: None,
        }
    }

    /// Arguments as a JSON object map; non-object arguments yield an empty map.
    pub fn argument_map(&self) -> serde_json::Map<String, Value> {
        match &self.arguments {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}

/// One fragment of a streamed tool call, keyed by its stream index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ToolCallDelta {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn arguments(mut self, fragment: impl Into<String>) -> Self {
        self.arguments = Some(fragment.into());
        self
    }
}
