//! End-to-end orchestration tests over a scripted provider transport.
//!
//! Exercises the public surface the way a caller would: construct the
//! orchestrator with explicit wiring, run requests/deliberations/enrichment,
//! and check pool health and snapshot counters afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use conclave::deliberation::{DeliberationOptions, VotingStrategy};
use conclave::keypool::{AuthProbe, ProbeOutcome};
use conclave::models::{AgentRequest, FailureKind, Provider};
use conclave::providers::{ChatPayload, ChunkCallback, ProviderError, ProviderTransport, StreamOutcome};
use conclave::secrets::StaticSecretStore;
use conclave::Orchestrator;

/// Transport that answers each provider with a fixed content string.
struct ScriptedTransport {
    replies: HashMap<Provider, String>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new(replies: Vec<(Provider, &str)>) -> Arc<Self> {
        Arc::new(Self {
            replies: replies.into_iter().map(|(p, r)| (p, r.to_string())).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderTransport for ScriptedTransport {
    async fn execute(
        &self,
        provider: Provider,
        _payload: &ChatPayload,
        api_key: &str,
        _strict_mode: bool,
    ) -> Result<Value, ProviderError> {
        assert!(!api_key.is_empty(), "dispatcher must resolve a real key");
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.replies.get(&provider) {
            Some(content) => Ok(json!({
                "choices": [{"message": {"content": content}}],
                "usage": {"prompt_tokens": 50, "completion_tokens": 20, "total_tokens": 70},
            })),
            None => Err(ProviderError::Server {
                status: 503,
                body: "no script".into(),
            }),
        }
    }

    async fn execute_stream(
        &self,
        provider: Provider,
        _payload: &ChatPayload,
        _api_key: &str,
        _on_reasoning: ChunkCallback<'_>,
        on_content: ChunkCallback<'_>,
    ) -> Result<StreamOutcome, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self.replies.get(&provider).cloned().unwrap_or_default();
        on_content(&content);
        Ok(StreamOutcome {
            reasoning: String::new(),
            content,
        })
    }
}

fn secrets() -> Arc<StaticSecretStore> {
    Arc::new(
        StaticSecretStore::new()
            .with_secret("DEEPSEEK_API_KEY", "sk-ds")
            .with_secret("QWEN_API_KEY", "sk-qw")
            .with_secret("PERPLEXITY_API_KEY", "sk-pp"),
    )
}

#[tokio::test]
async fn deliberation_end_to_end() {
    let transport = ScriptedTransport::new(vec![
        (
            Provider::Reasoner,
            "DIRECTION: bullish\nCONFIDENCE: 0.80\nPOSITION: expectancy positive\nREASONING: strong sharpe",
        ),
        (
            Provider::Technical,
            "DIRECTION: bullish\nCONFIDENCE: 0.85\nPOSITION: trend intact\nREASONING: higher lows",
        ),
        (
            Provider::Research,
            "DIRECTION: bullish\nCONFIDENCE: 0.90\nPOSITION: sentiment supportive\nREASONING: inflows continue",
        ),
    ]);
    let orchestrator = Orchestrator::with_parts(secrets(), transport.clone());

    let result = orchestrator
        .deliberate(
            "Should the momentum strategy stay long BTCUSDT?",
            &Provider::ALL,
            DeliberationOptions {
                voting_strategy: VotingStrategy::Weighted,
                ..Default::default()
            },
        )
        .await;

    assert_eq!(result.decision, "bullish");
    assert_eq!(result.rounds.len(), 1);
    assert!((result.confidence - 0.85).abs() < 1e-9);
    assert!(result.dissenting_opinions.is_empty());
    assert_eq!(transport.calls(), 3);

    let cross_validation = &result.metadata["cross_validation"];
    assert_eq!(cross_validation["agents_agree"], json!(true));

    let snapshot = orchestrator.get_snapshot();
    assert_eq!(snapshot.request_counters["deepseek"].succeeded, 1);
    assert_eq!(snapshot.request_counters["qwen"].succeeded, 1);
    assert_eq!(snapshot.request_counters["perplexity"].succeeded, 1);
    assert_eq!(snapshot.pools["deepseek"].total, 1);
    assert_eq!(snapshot.pools["deepseek"].healthy, 1);
    assert_eq!(snapshot.deliberation.total_deliberations, 1);
}

#[tokio::test]
async fn failing_provider_leaves_partial_panel() {
    // Research has no script and answers 503; its credential cools down
    // and the panel proceeds with two opinions.
    let transport = ScriptedTransport::new(vec![
        (Provider::Reasoner, "DIRECTION: bearish\nCONFIDENCE: 0.9\nPOSITION: cut\nREASONING: var"),
        (Provider::Technical, "DIRECTION: bearish\nCONFIDENCE: 0.8\nPOSITION: exit\nREASONING: breakdown"),
    ]);
    let orchestrator = Orchestrator::with_parts(secrets(), transport);

    let result = orchestrator
        .deliberate("Exit the position?", &Provider::ALL, DeliberationOptions::default())
        .await;

    assert_eq!(result.decision, "bearish");
    assert_eq!(result.final_votes.len(), 2);

    let snapshot = orchestrator.get_snapshot();
    assert_eq!(snapshot.pools["perplexity"].cooling, 1);
    assert_eq!(snapshot.request_counters["perplexity"].failed, 1);
    assert!(snapshot.pool_telemetry.cooldown_events >= 1);
}

#[tokio::test]
async fn enrichment_round_trips_through_cache() {
    let market = r#"{"regime": "ranging", "trend_direction": "sideways", "sentiment": {"direction": "neutral", "score": 0.5}, "volatility_assessment": "low", "confidence": 0.7}"#;
    let transport = ScriptedTransport::new(vec![(Provider::Research, market)]);
    let orchestrator = Orchestrator::with_parts(secrets(), transport.clone());

    let mut base = Map::new();
    base.insert("timeframe".into(), json!("15m"));

    let first = orchestrator.enrich("BTCUSDT", "rsi", &base).await;
    assert_eq!(first["market_context"]["regime"], json!("ranging"));
    assert_eq!(first["enrichment_cache_hit"], json!(false));
    assert_eq!(transport.calls(), 1);

    let second = orchestrator.enrich("BTCUSDT", "rsi", &base).await;
    assert_eq!(second["enrichment_cache_hit"], json!(true));
    assert_eq!(transport.calls(), 1);

    // After invalidation the enrichment layer misses again; the repeat
    // provider request is absorbed by the optimizer's prompt cache.
    assert_eq!(orchestrator.invalidate_enrichment(Some("BTCUSDT")), 1);
    let third = orchestrator.enrich("BTCUSDT", "rsi", &base).await;
    assert_eq!(third["enrichment_cache_hit"], json!(false));
    assert_eq!(third["market_context"]["regime"], json!("ranging"));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn single_request_and_prompt_cache() {
    let transport = ScriptedTransport::new(vec![(Provider::Technical, "the answer")]);
    let orchestrator = Orchestrator::with_parts(secrets(), transport.clone());

    let request = AgentRequest::new(Provider::Technical, "analyze", "What changed in the last run?");
    let response = orchestrator.send_request(&request).await;
    assert!(response.success);
    assert_eq!(response.content, "the answer");
    assert!(response.tokens_used.is_some());

    // Identical prompt is served from the optimizer cache.
    let cached = orchestrator.send_request(&request).await;
    assert!(cached.success);
    assert_eq!(transport.calls(), 1);

    let snapshot = orchestrator.get_snapshot();
    assert_eq!(snapshot.optimizer.cache_hits, 1);
}

struct IndexedProbe;

#[async_trait]
impl AuthProbe for IndexedProbe {
    async fn probe(&self, _provider: Provider, api_key: &str) -> ProbeOutcome {
        if api_key == "sk-qw" {
            ProbeOutcome::AuthFailed(401)
        } else {
            ProbeOutcome::Ok(200)
        }
    }
}

#[tokio::test]
async fn preflight_disables_invalid_keys() {
    let transport = ScriptedTransport::new(vec![]);
    let orchestrator = Orchestrator::with_parts(secrets(), transport);

    let results = orchestrator.preflight_validate_with(&IndexedProbe).await;
    assert_eq!(results[&Provider::Technical].disabled, 1);
    assert_eq!(results[&Provider::Reasoner].valid, 1);

    // The disabled key is out of rotation.
    let request = AgentRequest::new(Provider::Technical, "analyze", "anything");
    let response = orchestrator.send_request(&request).await;
    assert_eq!(response.failure_kind, Some(FailureKind::NoUsableCredential));
}
