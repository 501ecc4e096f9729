//! Configuration for the turn engine and streaming bridge.
//!
//! Every field has a default; deployments override them from JSON or from
//! `VOICE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};
use crate::handoff::{HandoffDefaults, HandoffType};

/// Streaming bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Minimum buffered characters before a sentence chunk is emitted.
    pub min_chunk_chars: usize,

    /// Longest wait for the next item before checking on the producer.
    #[serde(with = "duration_ms")]
    pub item_timeout: Duration,

    /// Wall-clock limit for one model call.
    #[serde(with = "duration_ms")]
    pub turn_timeout: Duration,

    /// Capacity of the producer → consumer channel.
    pub channel_capacity: usize,

    /// Characters that end a speakable sentence.
    pub sentence_terminators: Vec<char>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            min_chunk_chars: 20,
            item_timeout: Duration::from_secs(5),
            turn_timeout: Duration::from_secs(90),
            channel_capacity: 64,
            sentence_terminators: vec!['.', '!', '?'],
        }
    }
}

/// Turn engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bridge: BridgeConfig,

    /// Cap on model calls within one user turn.
    pub max_tool_iterations: usize,

    /// Spoken and returned when the model call fails.
    pub apology_text: String,

    /// Policy for handoffs with a known target but no matching route.
    pub handoff_defaults: HandoffDefaults,

    /// Cancel the outgoing agent's in-flight response before a handoff.
    pub cancel_on_handoff: bool,

    /// Chained handoffs allowed within one turn.
    pub max_handoffs_per_turn: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            max_tool_iterations: 5,
            apology_text: "I'm sorry, I ran into a problem. Could you say that again?".to_string(),
            handoff_defaults: HandoffDefaults::default(),
            cancel_on_handoff: true,
            max_handoffs_per_turn: 3,
        }
    }
}

impl EngineConfig {
    /// Loads a JSON document; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Default configuration with `VOICE_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from any key → value source.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VOICE_MIN_CHUNK_CHARS") {
            self.bridge.min_chunk_chars = parse("VOICE_MIN_CHUNK_CHARS", &v)?;
        }
        if let Some(v) = lookup("VOICE_ITEM_TIMEOUT_MS") {
            self.bridge.item_timeout = Duration::from_millis(parse("VOICE_ITEM_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("VOICE_TURN_TIMEOUT_MS") {
            self.bridge.turn_timeout = Duration::from_millis(parse("VOICE_TURN_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("VOICE_MAX_TOOL_ITERATIONS") {
            self.max_tool_iterations = parse("VOICE_MAX_TOOL_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("VOICE_DEFAULT_HANDOFF_TYPE") {
            self.handoff_defaults.handoff_type = v
                .parse::<HandoffType>()
                .map_err(|e| VoiceError::Config(format!("VOICE_DEFAULT_HANDOFF_TYPE: {}", e)))?;
        }
        if let Some(v) = lookup("VOICE_DEFAULT_SHARE_CONTEXT") {
            self.handoff_defaults.share_context = parse("VOICE_DEFAULT_SHARE_CONTEXT", &v)?;
        }
        Ok(self)
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| VoiceError::Config(format!("{}={:?}: {}", key, raw, e)))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
