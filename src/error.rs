//! Error types for the voice turn engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, VoiceError>;

/// Main error type for turn orchestration
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Error from the OpenAI API
    #[error("OpenAI API error: {0}")]
    Provider(#[from] async_openai::error::OpenAIError),

    /// The model stream failed after it was opened
    #[error("Provider stream error: {0}")]
    ProviderStream(String),

    /// The model stream did not finish within the turn deadline
    #[error("Model stream timed out after {after:?}")]
    StreamTimeout { after: Duration },

    /// Tool execution error
    #[error("Tool execution error in {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    /// No tool is registered under this name
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// No agent is registered under this name
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// Raised by external session store implementations
    #[error("Session error: {0}")]
    Session(String),

    /// Template rendering error
    #[error("Template error: {0}")]
    Template(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Wraps a boxed tower error raised by the named tool.
    pub fn tool(tool: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: err.to_string(),
        }
    }
}
