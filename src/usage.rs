//! # Token Accounting
//!
//! Turn results report the tokens consumed by every model call made while
//! answering one utterance, and the session keeps a running ledger per agent.
//! When a handoff activates an agent, that agent's counters restart from zero
//! so each activation is measured on its own.
//!
//! ```rust
//! use tower_voice::usage::{Usage, UsageLedger};
//!
//! let mut ledger = UsageLedger::default();
//! ledger.record("Concierge", Usage::new(1200, 300));
//! ledger.record("Concierge", Usage::new(100, 20));
//! assert_eq!(ledger.for_agent("Concierge").total_tokens, 1620);
//!
//! ledger.reset_agent("Concierge");
//! assert_eq!(ledger.for_agent("Concierge").total_tokens, 0);
//! assert_eq!(ledger.total.total_tokens, 1620);
//! ```

use std::collections::HashMap;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// Token usage for one or more model calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// Tokens sent to the model.
    pub input_tokens: usize,

    /// Tokens generated by the model.
    pub output_tokens: usize,

    /// `input_tokens + output_tokens`.
    pub total_tokens: usize,

    /// Number of model calls folded into this value.
    pub request_count: usize,
}

impl Usage {
    /// Usage of a single model call.
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            request_count: 1,
        }
    }

    pub fn add_usage(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.request_count += other.request_count;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.request_count == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self.add_usage(&other);
        self
    }
}

/// Per-session usage: a lifetime total plus counters for each agent's
/// current activation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLedger {
    pub total: Usage,
    pub by_agent: HashMap<String, Usage>,
}

impl UsageLedger {
    pub fn record(&mut self, agent: &str, usage: Usage) {
        self.total.add_usage(&usage);
        self.by_agent
            .entry(agent.to_string())
            .or_default()
            .add_usage(&usage);
    }

    pub fn for_agent(&self, agent: &str) -> Usage {
        self.by_agent.get(agent).copied().unwrap_or_default()
    }

    /// Zeroes the counters for `agent`; the lifetime total is kept.
    pub fn reset_agent(&mut self, agent: &str) {
        self.by_agent.insert(agent.to_string(), Usage::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_addition() {
        let total = Usage::new(10, 5) + Usage::new(3, 2);
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.total_tokens, 20);
        assert_eq!(total.request_count, 2);
    }

    #[test]
    fn test_ledger_reset_keeps_total() {
        let mut ledger = UsageLedger::default();
        ledger.record("A", Usage::new(10, 10));
        ledger.record("B", Usage::new(1, 1));
        ledger.reset_agent("A");

        assert!(ledger.for_agent("A").is_empty());
        assert_eq!(ledger.for_agent("B").total_tokens, 2);
        assert_eq!(ledger.total.total_tokens, 22);
    }
}
