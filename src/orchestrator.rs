//! Root orchestrator: owns the pools, the optimizer, the enricher, the
//! breakers, and the deliberation engine, and exposes the narrow surface
//! the rest of the system calls.
//!
//! Constructed once at startup and handed around by `Arc`; there are no
//! ambient singletons in the core.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::breaker::{BreakerSnapshot, CircuitBreakerSet};
use crate::deliberation::{DeliberationEngine, DeliberationOptions, DeliberationResult, DeliberationStats};
use crate::dispatch::{Dispatcher, OutcomeCounters};
use crate::enrichment::{ContextEnricher, EnrichmentStats};
use crate::invoker::ProviderInvoker;
use crate::keypool::{AlertCallback, AuthProbe, KeyPoolManager, PoolMetrics, PoolTelemetry, ProviderPreflight};
use crate::models::{AgentRequest, AgentResponse, Provider};
use crate::optimizer::{OptimizationStats, PromptOptimizer};
use crate::providers::{HttpAuthProbe, HttpTransport, ProviderTransport};
use crate::secrets::{EnvSecretStore, SecretStore};

/// Read-only observability snapshot across every subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorSnapshot {
    pub pools: HashMap<String, PoolMetrics>,
    pub pool_telemetry: PoolTelemetry,
    pub breakers: HashMap<String, BreakerSnapshot>,
    pub request_counters: HashMap<String, OutcomeCounters>,
    pub optimizer: OptimizationStats,
    pub enrichment: EnrichmentStats,
    pub deliberation: DeliberationStats,
}

pub struct Orchestrator {
    pool: Arc<KeyPoolManager>,
    optimizer: Arc<PromptOptimizer>,
    breakers: Arc<CircuitBreakerSet>,
    dispatcher: Arc<Dispatcher>,
    enricher: Arc<ContextEnricher>,
    engine: DeliberationEngine,
}

impl Orchestrator {
    /// Production wiring: env-backed secrets, reqwest transport, env knobs.
    pub fn from_env() -> Self {
        Self::with_parts(Arc::new(EnvSecretStore), Arc::new(HttpTransport::new()))
    }

    /// Explicit wiring seam used by tooling and tests.
    pub fn with_parts(secrets: Arc<dyn SecretStore>, transport: Arc<dyn ProviderTransport>) -> Self {
        let pool = Arc::new(KeyPoolManager::new(secrets));
        let optimizer = Arc::new(PromptOptimizer::new());
        let breakers = Arc::new(CircuitBreakerSet::default());

        let reasoning_log_dir = std::env::var("REASONING_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("logs/reasoning"));

        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            transport,
            optimizer.clone(),
            breakers.clone(),
            reasoning_log_dir,
        ));

        let invoker: Arc<dyn ProviderInvoker> = dispatcher.clone();
        let enricher = Arc::new(ContextEnricher::from_env(invoker.clone()));
        let engine = DeliberationEngine::new(invoker, enricher.clone());

        info!("Orchestrator initialized");
        Self {
            pool,
            optimizer,
            breakers,
            dispatcher,
            enricher,
            engine,
        }
    }

    // ------------------------------------------------------------------
    // Caller surface
    // ------------------------------------------------------------------

    pub async fn send_request(&self, request: &AgentRequest) -> AgentResponse {
        self.dispatcher.send_request(request).await
    }

    pub async fn stream_request<FR, FC>(
        &self,
        request: &AgentRequest,
        on_reasoning: FR,
        on_content: FC,
    ) -> AgentResponse
    where
        FR: FnMut(&str) + Send,
        FC: FnMut(&str) + Send,
    {
        self.dispatcher.stream_request(request, on_reasoning, on_content).await
    }

    pub async fn deliberate(
        &self,
        question: &str,
        agents: &[Provider],
        options: DeliberationOptions,
    ) -> DeliberationResult {
        self.engine.deliberate(question, agents, options).await
    }

    pub async fn enrich(
        &self,
        symbol: &str,
        strategy_type: &str,
        base_context: &Map<String, Value>,
    ) -> Map<String, Value> {
        self.enricher.enrich(symbol, strategy_type, base_context).await
    }

    /// Probe every registered credential against its provider and disable
    /// the ones that fail auth.
    pub async fn preflight_validate(&self) -> HashMap<Provider, ProviderPreflight> {
        self.pool.preflight_validate(&HttpAuthProbe::new()).await
    }

    pub async fn preflight_validate_with(&self, probe: &dyn AuthProbe) -> HashMap<Provider, ProviderPreflight> {
        self.pool.preflight_validate(probe).await
    }

    pub fn register_alert_callback(&self, callback: AlertCallback) {
        self.pool.register_alert_callback(callback);
    }

    pub fn invalidate_enrichment(&self, symbol: Option<&str>) -> usize {
        self.enricher.invalidate(symbol)
    }

    pub fn enricher(&self) -> &Arc<ContextEnricher> {
        &self.enricher
    }

    pub fn get_snapshot(&self) -> OrchestratorSnapshot {
        let pools = Provider::ALL
            .iter()
            .map(|p| (p.as_str().to_string(), self.pool.pool_metrics(*p)))
            .collect();

        OrchestratorSnapshot {
            pools,
            pool_telemetry: self.pool.telemetry(),
            breakers: self.breakers.snapshot_all(),
            request_counters: self.dispatcher.counters(),
            optimizer: self.optimizer.stats(),
            enrichment: self.enricher.stats(),
            deliberation: self.engine.stats(),
        }
    }
}

#[async_trait]
impl ProviderInvoker for Orchestrator {
    async fn invoke(&self, request: AgentRequest) -> AgentResponse {
        self.dispatcher.send_request(&request).await
    }
}
