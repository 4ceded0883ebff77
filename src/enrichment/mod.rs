//! Market-context enrichment through the research provider.
//!
//! Before the reasoning/technical agents analyze a strategy, the enricher
//! can attach a real-time market context payload (regime, sentiment, news,
//! risk factors). Calls route adaptively on task keywords to avoid paying
//! for web research when the task is pure backtest math, and results are
//! cached under a short TTL per (symbol, strategy_type).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::invoker::ProviderInvoker;
use crate::models::{AgentRequest, AgentSignal, Provider};

/// When to consult the research provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelevanceMode {
    /// Every deliberation.
    Always,
    /// Only when the market is volatile.
    HighVolatility,
    /// Strategy depends on macro events.
    NewsSensitive,
    /// Skip enrichment entirely (backtest-only mode).
    Never,
    /// Decide from task keywords.
    Auto,
}

impl RelevanceMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => RelevanceMode::Always,
            "high_volatility" => RelevanceMode::HighVolatility,
            "news_sensitive" => RelevanceMode::NewsSensitive,
            "never" => RelevanceMode::Never,
            _ => RelevanceMode::Auto,
        }
    }
}

/// Keywords indicating web context adds value.
const TRIGGER_KEYWORDS: [&str; 28] = [
    "sentiment",
    "news",
    "macro",
    "fed",
    "fomc",
    "regulation",
    "halving",
    "etf",
    "whale",
    "liquidation",
    "crash",
    "pump",
    "dump",
    "black swan",
    "event",
    "breaking",
    "announcement",
    "ban",
    "sec",
    "exchange",
    "hack",
    "exploit",
    "live",
    "current",
    "today",
    "real-time",
    "market conditions",
    "volatility regime",
];

/// Keywords where web context adds little value.
const SKIP_KEYWORDS: [&str; 9] = [
    "backtest",
    "historical",
    "calculate",
    "rsi",
    "macd",
    "optimize parameters",
    "sharpe ratio",
    "drawdown",
    "commission",
];

const ENRICHMENT_PROMPT_TEMPLATE: &str = r#"You are a market research analyst providing real-time context.

Symbol: {symbol}
Strategy Type: {strategy_type}
Timeframe: {timeframe}

Provide a structured market context update:

1. CURRENT MARKET REGIME: Is the market trending, ranging, or volatile?
2. KEY NEWS: Any significant events affecting {symbol} in the last 24-72 hours?
3. SENTIMENT: Overall market sentiment (bullish/bearish/neutral) with confidence.
4. RISK FACTORS: Active risk factors that could affect the strategy.
5. MACRO CONTEXT: Relevant macro events (FED, regulations, etc.)

Format your response as JSON:
{
    "regime": "trending|ranging|volatile",
    "trend_direction": "up|down|sideways",
    "key_news": ["headline1", "headline2"],
    "sentiment": {"direction": "bullish|bearish|neutral", "score": 0.0-1.0},
    "risk_factors": ["factor1", "factor2"],
    "macro_events": ["event1", "event2"],
    "volatility_assessment": "low|normal|high|extreme",
    "confidence": 0.0-1.0
}"#;

lazy_static! {
    static ref FENCED_JSON: Regex = RegexBuilder::new(r"```(?:json)?\s*(\{.*?\})\s*```")
        .dot_matches_new_line(true)
        .build()
        .expect("fenced json pattern must compile");
}

pub const ENRICH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentStats {
    pub consultations: u64,
    pub cache_hits: u64,
    pub calls_made: u64,
    pub calls_skipped: u64,
    pub enrichments: u64,
    pub errors: u64,
}

/// TTL-cached market-context enricher.
pub struct ContextEnricher {
    invoker: Arc<dyn ProviderInvoker>,
    cache: Mutex<HashMap<String, (Instant, Value)>>,
    ttl: Duration,
    relevance: RelevanceMode,
    stats: Mutex<EnrichmentStats>,
}

impl ContextEnricher {
    pub fn new(invoker: Arc<dyn ProviderInvoker>, ttl: Duration, relevance: RelevanceMode) -> Self {
        Self {
            invoker,
            cache: Mutex::new(HashMap::new()),
            ttl,
            relevance,
            stats: Mutex::new(EnrichmentStats::default()),
        }
    }

    /// Read TTL and relevance mode from the environment
    /// (`ENRICHMENT_CACHE_TTL` seconds, `ENRICHMENT_RELEVANCE`).
    pub fn from_env(invoker: Arc<dyn ProviderInvoker>) -> Self {
        let ttl = std::env::var("ENRICHMENT_CACHE_TTL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));
        let relevance = std::env::var("ENRICHMENT_RELEVANCE")
            .map(|v| RelevanceMode::parse(&v))
            .unwrap_or(RelevanceMode::Auto);
        Self::new(invoker, ttl, relevance)
    }

    // ------------------------------------------------------------------
    // Adaptive routing
    // ------------------------------------------------------------------

    /// Decide whether the research provider should be consulted for this
    /// task. Conservative by default: pure historical/calculation work is
    /// skipped unless a trigger keyword appears.
    pub fn should_consult(&self, task_description: &str) -> bool {
        match self.relevance {
            RelevanceMode::Always => return true,
            RelevanceMode::Never => return false,
            _ => {}
        }

        let text = task_description.to_lowercase();
        let skip_score = SKIP_KEYWORDS.iter().filter(|kw| text.contains(*kw)).count();
        let trigger_score = TRIGGER_KEYWORDS.iter().filter(|kw| text.contains(*kw)).count();

        if skip_score >= 2 && trigger_score == 0 {
            self.stats.lock().calls_skipped += 1;
            debug!("Enrichment skipped (skip={}, trigger={})", skip_score, trigger_score);
            return false;
        }
        if trigger_score >= 1 {
            return true;
        }

        self.stats.lock().calls_skipped += 1;
        false
    }

    // ------------------------------------------------------------------
    // Enrichment
    // ------------------------------------------------------------------

    /// Attach a market-context payload to `base_context`, serving from the
    /// TTL cache when possible. Timeouts and parse failures attach a status
    /// marker instead and are never cached.
    pub async fn enrich(
        &self,
        symbol: &str,
        strategy_type: &str,
        base_context: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut context = base_context.clone();
        self.stats.lock().consultations += 1;

        let cache_key = format!("{symbol}:{strategy_type}");
        if let Some((age, cached)) = self.cache_lookup(&cache_key) {
            self.stats.lock().cache_hits += 1;
            debug!(
                "Enrichment cache HIT for {} (age={:.0}s, ttl={}s)",
                cache_key,
                age.as_secs_f64(),
                self.ttl.as_secs()
            );
            context.insert("market_context".into(), cached);
            context.insert("enrichment_cache_hit".into(), json!(true));
            context.insert(
                "enrichment_cache_age_s".into(),
                json!((age.as_secs_f64() * 10.0).round() / 10.0),
            );
            return context;
        }

        let timeframe = context
            .get("timeframe")
            .and_then(Value::as_str)
            .unwrap_or("15m")
            .to_string();
        let prompt = ENRICHMENT_PROMPT_TEMPLATE
            .replace("{symbol}", symbol)
            .replace("{strategy_type}", strategy_type)
            .replace("{timeframe}", &timeframe);

        let request = AgentRequest::new(Provider::Research, "current", prompt);

        let response = match tokio::time::timeout(ENRICH_TIMEOUT, self.invoker.invoke(request)).await {
            Ok(response) => response,
            Err(_) => {
                self.stats.lock().errors += 1;
                warn!("Enrichment timeout for {}/{}", symbol, strategy_type);
                context.insert(
                    "market_context".into(),
                    json!({"status": "timeout", "error": "enrichment request timed out"}),
                );
                return context;
            }
        };

        self.stats.lock().calls_made += 1;

        if !response.success {
            self.stats.lock().errors += 1;
            context.insert(
                "market_context".into(),
                json!({
                    "status": "error",
                    "error": response.error.unwrap_or_else(|| "unknown".into()),
                }),
            );
            return context;
        }

        let (market_data, parse_ok) = parse_market_json(&response.content);
        if parse_ok {
            let mut cache = self.cache.lock();
            cache.insert(cache_key, (Instant::now(), market_data.clone()));
            let ttl = self.ttl;
            cache.retain(|_, entry| entry.0.elapsed() < ttl);
        }

        self.stats.lock().enrichments += 1;
        info!(
            "Context enriched for {}: regime={}, sentiment={}",
            symbol,
            market_data.get("regime").and_then(serde_json::Value::as_str).unwrap_or("?"),
            market_data
                .pointer("/sentiment/direction")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("?"),
        );

        context.insert("market_context".into(), market_data);
        context.insert("enrichment_cache_hit".into(), json!(false));
        context.insert("enrichment_latency_ms".into(), json!(response.latency_ms));
        if let Some(usage) = &response.tokens_used {
            context.insert("enrichment_tokens".into(), json!(usage.total_tokens));
        }
        context
    }

    fn cache_lookup(&self, key: &str) -> Option<(Duration, Value)> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some((inserted, value)) => {
                let age = inserted.elapsed();
                if age < self.ttl {
                    Some((age, value.clone()))
                } else {
                    cache.remove(key);
                    None
                }
            }
            None => None,
        }
    }

    /// Drop cached context. With a symbol, only that symbol's entries go;
    /// without, the whole cache. Returns the number of entries removed.
    pub fn invalidate(&self, symbol: Option<&str>) -> usize {
        let mut cache = self.cache.lock();
        match symbol {
            None => {
                let count = cache.len();
                cache.clear();
                info!("Enrichment cache cleared ({} entries)", count);
                count
            }
            Some(symbol) => {
                let prefix = format!("{symbol}:");
                let before = cache.len();
                cache.retain(|key, _| !key.starts_with(&prefix));
                let removed = before - cache.len();
                if removed > 0 {
                    info!("Enrichment cache invalidated for {} ({} entries)", symbol, removed);
                }
                removed
            }
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn stats(&self) -> EnrichmentStats {
        self.stats.lock().clone()
    }

    // ------------------------------------------------------------------
    // Prompt assembly for downstream agents
    // ------------------------------------------------------------------

    /// Append a formatted market-context block and compact peer signals to
    /// a base prompt.
    pub fn build_enriched_prompt(
        &self,
        provider: Provider,
        base_prompt: &str,
        market_context: Option<&Value>,
        peer_signals: &[AgentSignal],
    ) -> String {
        let mut parts = vec![base_prompt.to_string()];

        if let Some(ctx) = market_context {
            let available = ctx.get("status").and_then(Value::as_str) != Some("unavailable");
            if available {
                debug!("Attaching market context for {}", provider);
                parts.push(format!(
                    "\n\n--- Real-Time Market Context ---\n{}",
                    format_market_context(ctx)
                ));
            }
        }

        if !peer_signals.is_empty() {
            let signals_text: Vec<String> = peer_signals.iter().map(AgentSignal::to_compact).collect();
            parts.push(format!(
                "\n\n--- Peer Agent Signals (for cross-reference) ---\n{}\nConsider these signals in your analysis but form your own independent assessment.",
                signals_text.join("\n")
            ));
        }

        parts.join("\n")
    }
}

/// Parse the market-context JSON, tolerating a markdown code fence.
/// Returns `(payload, parse_ok)`; failures yield a raw-response marker.
fn parse_market_json(content: &str) -> (Value, bool) {
    if let Ok(value) = serde_json::from_str::<Value>(content) {
        if value.is_object() {
            return (value, true);
        }
    }

    if let Some(captures) = FENCED_JSON.captures(content) {
        if let Ok(value) = serde_json::from_str::<Value>(&captures[1]) {
            if value.is_object() {
                return (value, true);
            }
        }
    }

    (json!({"raw_response": content, "parse_error": true}), false)
}

fn format_market_context(context: &Value) -> String {
    let mut parts = Vec::new();

    let regime = context.get("regime").and_then(Value::as_str).unwrap_or("unknown");
    let direction = context
        .get("trend_direction")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    parts.push(format!("Market Regime: {regime} ({direction})"));

    if let Some(sentiment) = context.get("sentiment").and_then(Value::as_object) {
        let dir = sentiment.get("direction").and_then(Value::as_str).unwrap_or("?");
        let score = sentiment.get("score").and_then(Value::as_f64).unwrap_or(0.0);
        parts.push(format!("Sentiment: {dir} (score: {:.0}%)", score * 100.0));
    }

    let volatility = context
        .get("volatility_assessment")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    parts.push(format!("Volatility: {volatility}"));

    for (label, key) in [
        ("Key News", "key_news"),
        ("Risk Factors", "risk_factors"),
        ("Macro Events", "macro_events"),
    ] {
        if let Some(items) = context.get(key).and_then(Value::as_array) {
            let listed: Vec<&str> = items.iter().filter_map(Value::as_str).take(3).collect();
            if !listed.is_empty() {
                parts.push(format!("{label}: {}", listed.join("; ")));
            }
        }
    }

    parts.join("\n")
}
