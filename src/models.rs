//! Shared domain types for the orchestration core.
//!
//! Everything that crosses a module boundary lives here: providers, requests,
//! responses, failure kinds, and the structured signals exchanged during
//! deliberation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// LLM provider families supported by the core.
///
/// Each maps to one concrete vendor API (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Reasoning-capable chat model (DeepSeek).
    Reasoner,
    /// Technical-analysis model (Qwen).
    Technical,
    /// Web-augmented research model (Perplexity).
    Research,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Reasoner, Provider::Technical, Provider::Research];

    /// Vendor identifier used in logs, cache keys, and metric filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Reasoner => "deepseek",
            Provider::Technical => "qwen",
            Provider::Research => "perplexity",
        }
    }

    /// Base environment variable carrying the provider's first API key.
    /// Additional keys use indexed variants (`_2`, `_3`, ...).
    pub fn env_key_name(&self) -> &'static str {
        match self {
            Provider::Reasoner => "DEEPSEEK_API_KEY",
            Provider::Technical => "QWEN_API_KEY",
            Provider::Research => "PERPLEXITY_API_KEY",
        }
    }

    /// Signal domain this provider's opinions are treated as during
    /// cross-validation.
    pub fn signal_type(&self) -> SignalType {
        match self {
            Provider::Reasoner => SignalType::Quantitative,
            Provider::Technical => SignalType::Technical,
            Provider::Research => SignalType::Sentiment,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel a response was produced through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentChannel {
    DirectApi,
    Stream,
    Cache,
}

/// Typed failure classification surfaced to callers.
///
/// The core never raises across its boundary; failed calls come back as an
/// [`AgentResponse`] with `success = false` and one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoUsableCredential,
    ProviderRateLimit,
    ProviderAuthFailure,
    ProviderClientError,
    ProviderServerError,
    NetworkError,
    CircuitOpen,
    ParseError,
    Cancelled,
}

impl FailureKind {
    /// Whether the caller may reasonably retry the request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::NoUsableCredential
                | FailureKind::ProviderRateLimit
                | FailureKind::ProviderServerError
                | FailureKind::NetworkError
                | FailureKind::CircuitOpen
        )
    }
}

/// Unified request to an AI agent.
///
/// Owned by the caller until dispatched, read-only afterwards. The prompt is
/// always run through the sanitizer before any provider sees it.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub provider: Provider,
    pub task_type: String,
    pub prompt: String,
    pub code: Option<String>,
    pub context: HashMap<String, serde_json::Value>,
    /// Opt into chain-of-thought reasoning (reasoner provider).
    pub thinking_mode: bool,
    /// Opt into guaranteed structured tool output (reasoner provider).
    pub strict_mode: bool,
    pub stream: bool,
}

impl AgentRequest {
    pub fn new(provider: Provider, task_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            provider,
            task_type: task_type.into(),
            prompt: prompt.into(),
            code: None,
            context: HashMap::new(),
            thinking_mode: false,
            strict_mode: false,
            stream: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_thinking(mut self, thinking: bool) -> Self {
        self.thinking_mode = thinking;
        self
    }
}

/// Token usage statistics from a provider response.
///
/// Includes the reasoner's context-caching metrics when available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub reasoning_tokens: u64,
    pub cost_usd: Option<f64>,
    pub cache_hit_tokens: u64,
    pub cache_miss_tokens: u64,
    pub cache_savings_pct: f64,
}

/// Unified response from an AI agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    pub content: String,
    pub channel: AgentChannel,
    pub credential_index: Option<usize>,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub timestamp: DateTime<Utc>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<Vec<serde_json::Value>>,
    pub tokens_used: Option<TokenUsage>,
    pub citations: Option<Vec<String>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl AgentResponse {
    pub fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            channel: AgentChannel::DirectApi,
            credential_index: None,
            latency_ms: 0.0,
            error: Some(error.into()),
            failure_kind: Some(kind),
            timestamp: Utc::now(),
            reasoning_content: None,
            tool_calls: None,
            tokens_used: None,
            citations: None,
            metadata: None,
        }
    }

    pub fn ok(content: impl Into<String>, channel: AgentChannel) -> Self {
        Self {
            success: true,
            content: content.into(),
            channel,
            credential_index: None,
            latency_ms: 0.0,
            error: None,
            failure_kind: None,
            timestamp: Utc::now(),
            reasoning_content: None,
            tool_calls: None,
            tokens_used: None,
            citations: None,
            metadata: None,
        }
    }
}

/// Market direction carried by a deliberation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Bullish => "bullish",
            Direction::Bearish => "bearish",
            Direction::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bullish" | "bull" | "up" | "long" => Some(Direction::Bullish),
            "bearish" | "bear" | "down" | "short" => Some(Direction::Bearish),
            "neutral" | "flat" | "sideways" => Some(Direction::Neutral),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal domain an agent speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Quantitative,
    Technical,
    Sentiment,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Quantitative => "quantitative",
            SignalType::Technical => "technical",
            SignalType::Sentiment => "sentiment",
        }
    }

    /// Priority used by weighted voting and conflict resolution:
    /// quantitative > technical > sentiment.
    pub fn priority(&self) -> u8 {
        match self {
            SignalType::Quantitative => 3,
            SignalType::Technical => 2,
            SignalType::Sentiment => 1,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured signal from one agent, the unit of deliberation and
/// cross-validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSignal {
    pub agent: String,
    pub signal_type: SignalType,
    pub direction: Direction,
    /// Confidence in [0.0, 1.0].
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AgentSignal {
    pub fn new(
        agent: impl Into<String>,
        signal_type: SignalType,
        direction: Direction,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            signal_type,
            direction,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            data: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Compact one-line form used in inter-agent prompts.
    pub fn to_compact(&self) -> String {
        let reasoning: String = self.reasoning.chars().take(120).collect();
        format!(
            "[{}] {} (conf={:.0}%): {}",
            self.agent,
            self.direction.as_str().to_uppercase(),
            self.confidence * 100.0,
            reasoning
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parse_aliases() {
        assert_eq!(Direction::parse("BULLISH"), Some(Direction::Bullish));
        assert_eq!(Direction::parse("down"), Some(Direction::Bearish));
        assert_eq!(Direction::parse("sideways"), Some(Direction::Neutral));
        assert_eq!(Direction::parse("sdfkj"), None);
    }

    #[test]
    fn signal_compact_truncates_reasoning() {
        let long = "x".repeat(500);
        let sig = AgentSignal::new("qwen", SignalType::Technical, Direction::Bullish, 0.75, long);
        let compact = sig.to_compact();
        assert!(compact.starts_with("[qwen] BULLISH (conf=75%)"));
        assert!(compact.len() < 160);
    }

    #[test]
    fn provider_signal_type_mapping() {
        assert_eq!(Provider::Reasoner.signal_type(), SignalType::Quantitative);
        assert_eq!(Provider::Technical.signal_type(), SignalType::Technical);
        assert_eq!(Provider::Research.signal_type(), SignalType::Sentiment);
    }
}
