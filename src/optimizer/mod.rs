//! Prompt sanitization and budget optimization.
//!
//! Cuts token spend before a request ever reaches a provider: injection
//! patterns are scrubbed, metrics are projected down to what each provider
//! actually uses, floats are quantized, identical prompts are served from a
//! short-TTL LRU cache, and thinking mode is only enabled for tasks complex
//! enough to pay for it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::models::{AgentRequest, Provider};

/// Replacement for scrubbed injection patterns. Chosen so it cannot itself
/// match any pattern, which makes the sanitizer idempotent.
pub const REDACTED: &str = "[REDACTED_UNSAFE_PATTERN]";

const UNSAFE_PATTERNS: [&str; 7] = [
    r"ignore\s+(all\s+)?previous\s+instructions",
    r"output\s+(all\s+)?(api\s+)?keys",
    r"execute\s+code",
    r"<script>",
    r"eval\(",
    r"forget\s+(all\s+)?previous",
    r"disregard\s+",
];

lazy_static! {
    static ref UNSAFE_REGEXES: Vec<Regex> = UNSAFE_PATTERNS
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .expect("unsafe pattern must compile")
        })
        .collect();
    static ref METRICS_BLOCK: Regex = RegexBuilder::new(
        r#"\{[^{}]*"(?:sharpe_ratio|net_profit|win_rate|total_trades)[^{}]*\}"#
    )
    .dot_matches_new_line(true)
    .build()
    .expect("metrics block pattern must compile");
}

/// Task complexity levels driving the thinking-mode decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskComplexity {
    /// Basic calculations and lookups; thinking is wasted here.
    Simple,
    /// Standard analysis; thinking optional.
    Moderate,
    /// Multi-step reasoning or pattern work; thinking pays off.
    Complex,
}

const COMPLEX_TASK_KEYWORDS: [&str; 17] = [
    "optimize",
    "compare",
    "analyze",
    "multi-timeframe",
    "pattern",
    "regime",
    "correlation",
    "drawdown_analysis",
    "strategy_evolution",
    "portfolio",
    "risk_assessment",
    "backtest_review",
    "deliberation",
    "consensus",
    "cross-validate",
    "monte_carlo",
    "walk_forward",
];

const SIMPLE_TASK_KEYWORDS: [&str; 16] = [
    "calculate",
    "get",
    "fetch",
    "lookup",
    "status",
    "health",
    "list",
    "count",
    "summarize",
    "format",
    "validate_basic",
    "rsi",
    "macd",
    "ema",
    "sma",
    "bollinger",
];

const DEFAULT_FLOAT_PRECISION: u32 = 3;

/// Metrics every provider always receives, regardless of its allow-list.
fn universal_metrics() -> HashSet<&'static str> {
    [
        "net_profit",
        "net_profit_pct",
        "total_trades",
        "win_rate",
        "max_drawdown_pct",
        "sharpe_ratio",
    ]
    .into_iter()
    .collect()
}

/// Per-provider metric allow-list. A pure projection: keys are kept or
/// dropped, never renamed or recomputed.
fn allowed_metrics(provider: Provider) -> HashSet<&'static str> {
    let specific: &[&str] = match provider {
        // Quantitative analyst: risk metrics & statistical validation.
        Provider::Reasoner => &[
            "sharpe_ratio",
            "sortino_ratio",
            "calmar_ratio",
            "var_95",
            "cvar_95",
            "max_drawdown",
            "max_drawdown_pct",
            "win_rate",
            "profit_factor",
            "expectancy",
            "ulcer_index",
            "total_trades",
            "net_profit",
            "net_profit_pct",
            "avg_trade_pnl",
            "avg_trade_pnl_pct",
            "risk_reward_ratio",
            "recovery_factor",
            "payoff_ratio",
        ],
        // Technical analyst: signal quality & indicator performance.
        Provider::Technical => &[
            "win_rate",
            "total_trades",
            "avg_trade_pnl",
            "avg_trade_pnl_pct",
            "avg_win",
            "avg_loss",
            "max_consecutive_wins",
            "max_consecutive_losses",
            "profit_factor",
            "net_profit",
            "net_profit_pct",
            "long_trades",
            "short_trades",
            "long_win_rate",
            "short_win_rate",
            "avg_holding_time",
            "max_drawdown_pct",
            "sharpe_ratio",
            "sortino_ratio",
            "expectancy",
        ],
        // Market researcher: high-level performance & context.
        Provider::Research => &[
            "net_profit",
            "net_profit_pct",
            "max_drawdown_pct",
            "win_rate",
            "total_trades",
            "sharpe_ratio",
            "profit_factor",
            "calmar_ratio",
            "avg_holding_time",
            "risk_reward_ratio",
        ],
    };
    let mut set = universal_metrics();
    set.extend(specific);
    set
}

fn precision_for(metric: &str) -> u32 {
    match metric {
        "net_profit" | "avg_trade_pnl" | "avg_win" | "avg_loss" | "win_rate" | "max_drawdown_pct"
        | "net_profit_pct" | "var_95" | "cvar_95" => 2,
        _ => DEFAULT_FLOAT_PRECISION,
    }
}

/// Optimization counters, exported with the orchestrator snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizationStats {
    pub total_calls: u64,
    pub cache_hits: u64,
    pub metrics_filtered: u64,
    pub floats_quantized: u64,
    pub thinking_mode_skipped: u64,
    /// Rough chars-to-tokens estimate of what filtering and quantization
    /// shaved off the metrics payloads.
    pub tokens_saved_estimate: u64,
}

struct ResponseCache {
    entries: HashMap<String, (String, Instant)>,
    order: VecDeque<String>,
    ttl: Duration,
    max_size: usize,
}

impl ResponseCache {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

/// Sanitizer and token-budget optimizer. One instance per orchestrator so
/// tests get a fresh cache and counters.
pub struct PromptOptimizer {
    cache: Mutex<ResponseCache>,
    stats: Mutex<OptimizationStats>,
}

impl PromptOptimizer {
    pub const CACHE_MAX_SIZE: usize = 256;
    pub const CACHE_TTL: Duration = Duration::from_secs(300);

    pub fn new() -> Self {
        Self::with_cache_config(Self::CACHE_TTL, Self::CACHE_MAX_SIZE)
    }

    pub fn with_cache_config(ttl: Duration, max_size: usize) -> Self {
        Self {
            cache: Mutex::new(ResponseCache {
                entries: HashMap::new(),
                order: VecDeque::new(),
                ttl,
                max_size,
            }),
            stats: Mutex::new(OptimizationStats::default()),
        }
    }

    // ------------------------------------------------------------------
    // Injection scrubbing
    // ------------------------------------------------------------------

    /// Scrub known prompt-injection patterns. Idempotent: the replacement
    /// string never matches any pattern.
    pub fn sanitize(&self, text: &str) -> String {
        let mut current = text.to_string();
        for regex in UNSAFE_REGEXES.iter() {
            if regex.is_match(&current) {
                warn!("Unsafe pattern sanitized: {}", regex.as_str());
                current = regex.replace_all(&current, REDACTED).into_owned();
            }
        }
        current
    }

    fn sanitize_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (self.sanitize(k), self.sanitize_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Compose the full user prompt for a request: task header, prompt body,
    /// optional code block, and sanitized context. The sanitizer runs per
    /// segment and once more over the final composition.
    pub fn compose_prompt(&self, request: &AgentRequest) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.push(format!("Task: {}", self.sanitize(&request.task_type)));
        parts.push(format!("\n{}", self.sanitize(&request.prompt)));

        if let Some(code) = &request.code {
            parts.push(format!("\n\nCode to analyze:\n```\n{}\n```", self.sanitize(code)));
        }

        if !request.context.is_empty() {
            let safe: Map<String, Value> = request
                .context
                .iter()
                .map(|(k, v)| (self.sanitize(k), self.sanitize_value(v)))
                .collect();
            let rendered = serde_json::to_string_pretty(&Value::Object(safe)).unwrap_or_default();
            parts.push(format!("\n\nContext: {rendered}"));
        }

        self.sanitize(&parts.join("\n"))
    }

    // ------------------------------------------------------------------
    // Metric filtering & quantization
    // ------------------------------------------------------------------

    /// Project a metrics map down to the keys the provider actually uses.
    pub fn filter_metrics(&self, provider: Provider, metrics: &Map<String, Value>) -> Map<String, Value> {
        let allowed = allowed_metrics(provider);
        let mut filtered = Map::new();
        let mut removed = 0u64;

        for (key, value) in metrics {
            if allowed.contains(key.as_str()) {
                filtered.insert(key.clone(), value.clone());
            } else {
                removed += 1;
            }
        }

        if removed > 0 {
            self.stats.lock().metrics_filtered += removed;
            debug!(
                "Filtered {} metrics for {} ({}/{} kept)",
                removed,
                provider,
                filtered.len(),
                metrics.len()
            );
        }
        filtered
    }

    /// Round float values recursively. Integers and strings pass through;
    /// per-metric precision overrides apply at the top level of each map.
    pub fn quantize_floats(&self, data: &Map<String, Value>, precision: Option<u32>) -> Map<String, Value> {
        let mut quantized = Map::new();
        for (key, value) in data {
            let p = precision.unwrap_or_else(|| precision_for(key));
            quantized.insert(key.clone(), self.quantize_value(value, p, precision));
        }
        quantized
    }

    fn quantize_value(&self, value: &Value, precision: u32, inherited: Option<u32>) -> Value {
        match value {
            Value::Number(n) => {
                if n.is_f64() {
                    let rounded = round_to(n.as_f64().unwrap_or(0.0), precision);
                    self.stats.lock().floats_quantized += 1;
                    serde_json::Number::from_f64(rounded)
                        .map(Value::Number)
                        .unwrap_or_else(|| value.clone())
                } else {
                    value.clone()
                }
            }
            Value::Object(map) => Value::Object(self.quantize_floats(map, inherited)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.quantize_value(v, inherited.unwrap_or(DEFAULT_FLOAT_PRECISION), inherited))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Complexity classification & thinking gate
    // ------------------------------------------------------------------

    /// Keyword-and-shape heuristic over a task description.
    pub fn classify_task_complexity(&self, task_description: &str) -> TaskComplexity {
        let text = task_description.to_lowercase();

        let complex_matches = COMPLEX_TASK_KEYWORDS.iter().filter(|kw| text.contains(*kw)).count();
        let simple_matches = SIMPLE_TASK_KEYWORDS.iter().filter(|kw| text.contains(*kw)).count();

        let multiple_questions = text.matches('?').count() > 1;
        let has_comparison = ["vs", "versus", "compare", "better"].iter().any(|w| text.contains(w));
        let length = task_description.len();

        if complex_matches >= 2 || has_comparison || multiple_questions {
            TaskComplexity::Complex
        } else if complex_matches == 1 && simple_matches == 0 {
            TaskComplexity::Moderate
        } else if simple_matches >= 1 || length < 100 {
            TaskComplexity::Simple
        } else if length > 500 {
            TaskComplexity::Complex
        } else {
            TaskComplexity::Moderate
        }
    }

    /// Whether the technical provider should run with thinking enabled.
    /// Gated by `QWEN_ENABLE_THINKING`; never enabled for other providers.
    pub fn should_enable_thinking(&self, provider: Provider, task_description: &str) -> bool {
        if provider != Provider::Technical {
            return false;
        }

        let allow = std::env::var("QWEN_ENABLE_THINKING")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !allow {
            self.stats.lock().thinking_mode_skipped += 1;
            debug!("Thinking mode blocked by QWEN_ENABLE_THINKING=false");
            return false;
        }

        match self.classify_task_complexity(task_description) {
            TaskComplexity::Simple => {
                self.stats.lock().thinking_mode_skipped += 1;
                false
            }
            TaskComplexity::Complex => true,
            TaskComplexity::Moderate => task_description.len() > 300,
        }
    }

    // ------------------------------------------------------------------
    // Response cache
    // ------------------------------------------------------------------

    fn prompt_hash(provider: Provider, prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(prompt.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    /// Return a recently cached response for an identical prompt, refreshing
    /// its LRU position.
    pub fn get_cached_response(&self, provider: Provider, prompt: &str) -> Option<String> {
        let key = Self::prompt_hash(provider, prompt);
        let mut cache = self.cache.lock();

        match cache.entries.get(&key) {
            Some((response, inserted)) if inserted.elapsed() < cache.ttl => {
                let response = response.clone();
                cache.touch(&key);
                self.stats.lock().cache_hits += 1;
                debug!("Cache HIT for {} prompt (hash={})", provider, key);
                Some(response)
            }
            Some(_) => {
                cache.entries.remove(&key);
                if let Some(pos) = cache.order.iter().position(|k| k == &key) {
                    cache.order.remove(pos);
                }
                None
            }
            None => None,
        }
    }

    pub fn cache_response(&self, provider: Provider, prompt: &str, response: &str) {
        let key = Self::prompt_hash(provider, prompt);
        let mut cache = self.cache.lock();
        cache.entries.insert(key.clone(), (response.to_string(), Instant::now()));
        cache.touch(&key);
        while cache.entries.len() > cache.max_size {
            if let Some(oldest) = cache.order.pop_front() {
                cache.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    /// Minimal JSON serialization (no extra whitespace).
    pub fn compact_json(&self, data: &Map<String, Value>) -> String {
        serde_json::to_string(&Value::Object(data.clone())).unwrap_or_default()
    }

    /// Full optimization pipeline: filter, quantize, compact-serialize, and
    /// substitute into the prompt where a metrics JSON block is detected
    /// (appended under a `Metrics:` heading otherwise).
    pub fn optimize_prompt(
        &self,
        provider: Provider,
        prompt: &str,
        metrics: Option<&Map<String, Value>>,
    ) -> String {
        self.stats.lock().total_calls += 1;

        let Some(metrics) = metrics else {
            return prompt.to_string();
        };

        let filtered = self.filter_metrics(provider, metrics);
        let quantized = self.quantize_floats(&filtered, None);
        let compact = self.compact_json(&quantized);

        let original = self.compact_json(metrics);
        let saved_chars = original.len().saturating_sub(compact.len());
        if saved_chars > 0 {
            self.stats.lock().tokens_saved_estimate += saved_chars as u64 / 4;
        }

        if METRICS_BLOCK.is_match(prompt) {
            METRICS_BLOCK.replace(prompt, compact.as_str()).into_owned()
        } else {
            format!("{prompt}\n\nMetrics:\n{compact}")
        }
    }

    pub fn stats(&self) -> OptimizationStats {
        self.stats.lock().clone()
    }
}

impl Default for PromptOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}
