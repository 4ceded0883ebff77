//! Dispatcher: the single entry point for provider requests.
//!
//! Binds a request to a credential, runs the sanitize/optimize pipeline,
//! gates on the circuit breaker, executes through the provider transport,
//! and folds the outcome back into pool health and breaker state. Callers
//! always get a structured response; provider failures are data, not
//! errors.

pub mod extract;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::breaker::{BreakerDecision, CircuitBreakerSet};
use crate::invoker::ProviderInvoker;
use crate::keypool::{CredentialLease, KeyPoolManager};
use crate::models::{AgentChannel, AgentRequest, AgentResponse, FailureKind, Provider};
use crate::optimizer::PromptOptimizer;
use crate::providers::{build_payload, PayloadOptions, ProviderError, ProviderTransport};

/// Per-provider request outcome counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OutcomeCounters {
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct Dispatcher {
    pool: Arc<KeyPoolManager>,
    transport: Arc<dyn ProviderTransport>,
    optimizer: Arc<PromptOptimizer>,
    breakers: Arc<CircuitBreakerSet>,
    counters: Mutex<HashMap<Provider, OutcomeCounters>>,
    reasoning_log_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<KeyPoolManager>,
        transport: Arc<dyn ProviderTransport>,
        optimizer: Arc<PromptOptimizer>,
        breakers: Arc<CircuitBreakerSet>,
        reasoning_log_dir: PathBuf,
    ) -> Self {
        Self {
            pool,
            transport,
            optimizer,
            breakers,
            counters: Mutex::new(HashMap::new()),
            reasoning_log_dir,
        }
    }

    /// Send a request and return a structured response.
    ///
    /// Streaming requests are routed through [`Self::stream_request`] with
    /// no-op chunk callbacks.
    pub async fn send_request(&self, request: &AgentRequest) -> AgentResponse {
        if request.stream {
            return self.stream_request(request, |_| (), |_| ()).await;
        }

        let start = Instant::now();
        let provider = request.provider;
        let user_prompt = self.prepare_prompt(request);

        if let Some(cached) = self.optimizer.get_cached_response(provider, &user_prompt) {
            let mut response = AgentResponse::ok(cached, AgentChannel::Cache);
            response.latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            let mut meta = serde_json::Map::new();
            meta.insert("cache_hit".into(), json!(true));
            response.metadata = Some(meta);
            return response;
        }

        let Some(lease) = self.pool.acquire(provider).await else {
            self.count_failed(provider);
            return AgentResponse::failure(
                FailureKind::NoUsableCredential,
                format!("no active {provider} credentials"),
            );
        };

        if let BreakerDecision::Reject { retry_in } = self.breakers.preflight(provider) {
            self.count_failed(provider);
            let mut response = AgentResponse::failure(FailureKind::CircuitOpen, "circuit_open");
            let mut meta = serde_json::Map::new();
            meta.insert("retry_in_s".into(), json!(retry_in));
            response.metadata = Some(meta);
            return response;
        }

        let api_key = match self.pool.resolve_key(&lease) {
            Ok(key) => key,
            Err(e) => {
                self.count_failed(provider);
                return AgentResponse::failure(
                    FailureKind::NoUsableCredential,
                    format!("credential not resolvable: {e}"),
                );
            }
        };

        let payload = build_payload(
            request,
            &PayloadOptions {
                user_prompt: &user_prompt,
                enable_thinking: self.thinking_decision(request),
            },
        );

        self.count_sent(provider);
        match self
            .transport
            .execute(provider, &payload, &api_key, request.strict_mode)
            .await
        {
            Ok(data) => self.finish_success(request, &lease, data, start, &user_prompt),
            Err(ProviderError::Parse { body }) => self.finish_unparseable(&lease, body, start),
            Err(err) => self.finish_failure(&lease, err, start),
        }
    }

    /// Stream a request, invoking the callbacks per incoming delta.
    /// Streaming is wired for the reasoner; other providers accept the
    /// call but return their full body as a single content chunk.
    pub async fn stream_request<FR, FC>(
        &self,
        request: &AgentRequest,
        mut on_reasoning: FR,
        mut on_content: FC,
    ) -> AgentResponse
    where
        FR: FnMut(&str) + Send,
        FC: FnMut(&str) + Send,
    {
        let start = Instant::now();
        let provider = request.provider;
        let user_prompt = self.prepare_prompt(request);

        let Some(lease) = self.pool.acquire(provider).await else {
            self.count_failed(provider);
            return AgentResponse::failure(
                FailureKind::NoUsableCredential,
                format!("no active {provider} credentials"),
            );
        };

        if let BreakerDecision::Reject { retry_in } = self.breakers.preflight(provider) {
            self.count_failed(provider);
            let mut response = AgentResponse::failure(FailureKind::CircuitOpen, "circuit_open");
            let mut meta = serde_json::Map::new();
            meta.insert("retry_in_s".into(), json!(retry_in));
            response.metadata = Some(meta);
            return response;
        }

        let api_key = match self.pool.resolve_key(&lease) {
            Ok(key) => key,
            Err(e) => {
                self.count_failed(provider);
                return AgentResponse::failure(
                    FailureKind::NoUsableCredential,
                    format!("credential not resolvable: {e}"),
                );
            }
        };

        let mut payload = build_payload(
            request,
            &PayloadOptions {
                user_prompt: &user_prompt,
                enable_thinking: self.thinking_decision(request),
            },
        );
        payload.stream = Some(true);

        self.count_sent(provider);
        let outcome = self
            .transport
            .execute_stream(provider, &payload, &api_key, &mut on_reasoning, &mut on_content)
            .await;

        match outcome {
            Ok(stream) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.pool.mark_success(&lease);
                self.breakers.record_success(provider);
                self.count_succeeded(provider);

                let reasoning = (!stream.reasoning.is_empty()).then_some(stream.reasoning);
                if let Some(reasoning) = &reasoning {
                    if let Err(e) = extract::save_reasoning_log(&self.reasoning_log_dir, reasoning) {
                        warn!("Failed to save reasoning log: {e:#}");
                    }
                }

                info!(
                    "Streaming completed in {:.0}ms (content: {} chars)",
                    latency_ms,
                    stream.content.len()
                );

                let mut response = AgentResponse::ok(stream.content, AgentChannel::Stream);
                response.credential_index = Some(lease.index);
                response.latency_ms = latency_ms;
                response.reasoning_content = reasoning;
                response
            }
            Err(ProviderError::Parse { body }) => self.finish_unparseable(&lease, body, start),
            Err(err) => self.finish_failure(&lease, err, start),
        }
    }

    pub fn counters(&self) -> HashMap<String, OutcomeCounters> {
        self.counters
            .lock()
            .iter()
            .map(|(p, c)| (p.as_str().to_string(), *c))
            .collect()
    }

    // ------------------------------------------------------------------
    // Pipeline pieces
    // ------------------------------------------------------------------

    /// Compose the sanitized prompt and run the budget-optimizer pipeline
    /// over any metrics supplied in the request context.
    fn prepare_prompt(&self, request: &AgentRequest) -> String {
        let composed = self.optimizer.compose_prompt(request);
        let metrics = request.context.get("metrics").and_then(Value::as_object);
        self.optimizer.optimize_prompt(request.provider, &composed, metrics)
    }

    fn thinking_decision(&self, request: &AgentRequest) -> bool {
        if request.provider != Provider::Technical {
            return false;
        }
        let snippet: String = request.prompt.chars().take(200).collect();
        let task_desc = format!("{} {}", request.task_type, snippet);
        self.optimizer.should_enable_thinking(Provider::Technical, &task_desc)
    }

    fn finish_success(
        &self,
        request: &AgentRequest,
        lease: &CredentialLease,
        data: Value,
        start: Instant,
        user_prompt: &str,
    ) -> AgentResponse {
        let provider = request.provider;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        // Credential state moves before the response is constructed.
        self.pool.mark_success(lease);
        self.breakers.record_success(provider);

        let Some(content) = extract::extract_content(&data) else {
            self.count_failed(provider);
            warn!("No content found in any known field, returning JSON dump");
            let mut response = AgentResponse::failure(FailureKind::ParseError, "parse_error");
            response.content = serde_json::to_string_pretty(&data).unwrap_or_default();
            response.credential_index = Some(lease.index);
            response.latency_ms = latency_ms;
            return response;
        };

        self.count_succeeded(provider);

        let reasoning = if provider == Provider::Reasoner {
            let reasoning = extract::extract_reasoning_content(&data);
            if let Some(reasoning) = &reasoning {
                if let Err(e) = extract::save_reasoning_log(&self.reasoning_log_dir, reasoning) {
                    warn!("Failed to save reasoning log: {e:#}");
                }
            }
            reasoning
        } else {
            None
        };

        self.optimizer.cache_response(provider, user_prompt, &content);

        let mut response = AgentResponse::ok(content, AgentChannel::DirectApi);
        response.credential_index = Some(lease.index);
        response.latency_ms = latency_ms;
        response.reasoning_content = reasoning;
        response.citations = extract::extract_citations(&data, provider);
        response.tool_calls = extract::extract_tool_calls(&data);
        response.tokens_used = extract::extract_token_usage(&data, provider);
        response
    }

    /// HTTP succeeded but the body was not parseable: the provider is
    /// healthy, so the credential is marked good and the raw dump is
    /// returned with a parse_error marker.
    fn finish_unparseable(&self, lease: &CredentialLease, body: String, start: Instant) -> AgentResponse {
        self.pool.mark_success(lease);
        self.breakers.record_success(lease.provider);
        self.count_failed(lease.provider);

        let mut response = AgentResponse::failure(FailureKind::ParseError, "parse_error");
        response.content = body;
        response.credential_index = Some(lease.index);
        response.latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        response
    }

    fn finish_failure(&self, lease: &CredentialLease, err: ProviderError, start: Instant) -> AgentResponse {
        let provider = lease.provider;
        self.count_failed(provider);

        let kind = match &err {
            ProviderError::RateLimit { retry_after, .. } => {
                self.pool.mark_rate_limit(lease, *retry_after);
                self.breakers.record_failure(provider);
                FailureKind::ProviderRateLimit
            }
            ProviderError::Auth { .. } => {
                self.pool.mark_auth_error(lease);
                FailureKind::ProviderAuthFailure
            }
            ProviderError::Client { .. } => {
                self.pool.mark_client_error(lease);
                FailureKind::ProviderClientError
            }
            ProviderError::Server { .. } => {
                self.pool.mark_rate_limit(lease, None);
                self.breakers.record_failure(provider);
                FailureKind::ProviderServerError
            }
            ProviderError::Network(_) => {
                self.pool.mark_network_error(lease);
                self.breakers.record_failure(provider);
                FailureKind::NetworkError
            }
            ProviderError::Parse { .. } => FailureKind::ParseError,
        };

        let mut response = AgentResponse::failure(kind, err.to_string());
        response.credential_index = Some(lease.index);
        response.latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        response
    }

    fn count_sent(&self, provider: Provider) {
        self.counters.lock().entry(provider).or_default().sent += 1;
    }

    fn count_succeeded(&self, provider: Provider) {
        self.counters.lock().entry(provider).or_default().succeeded += 1;
    }

    fn count_failed(&self, provider: Provider) {
        self.counters.lock().entry(provider).or_default().failed += 1;
    }
}

#[async_trait]
impl ProviderInvoker for Dispatcher {
    async fn invoke(&self, request: AgentRequest) -> AgentResponse {
        self.send_request(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::keypool::{Credential, CredentialHealth};
    use crate::providers::{ChatPayload, ChunkCallback, StreamOutcome};
    use crate::secrets::StaticSecretStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockTransport {
        script: Mutex<VecDeque<Result<Value, ProviderError>>>,
        calls: AtomicUsize,
        stream_script: Mutex<VecDeque<Result<StreamOutcome, ProviderError>>>,
    }

    impl MockTransport {
        fn new(script: Vec<Result<Value, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                stream_script: Mutex::new(VecDeque::new()),
            }
        }

        fn with_stream(script: Vec<Result<StreamOutcome, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                stream_script: Mutex::new(script.into()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderTransport for MockTransport {
        async fn execute(
            &self,
            _provider: Provider,
            _payload: &ChatPayload,
            _api_key: &str,
            _strict_mode: bool,
        ) -> Result<Value, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Err(ProviderError::Network("script exhausted".into())))
        }

        async fn execute_stream(
            &self,
            _provider: Provider,
            _payload: &ChatPayload,
            _api_key: &str,
            on_reasoning: ChunkCallback<'_>,
            on_content: ChunkCallback<'_>,
        ) -> Result<StreamOutcome, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .stream_script
                .lock()
                .pop_front()
                .unwrap_or(Err(ProviderError::Network("script exhausted".into())))?;
            for piece in outcome.reasoning.split_inclusive(' ') {
                on_reasoning(piece);
            }
            for piece in outcome.content.split_inclusive(' ') {
                on_content(piece);
            }
            Ok(outcome)
        }
    }

    fn secrets() -> Arc<StaticSecretStore> {
        let mut store = StaticSecretStore::new().with_secret("DEEPSEEK_API_KEY", "sk-0");
        for idx in 2..=8 {
            store = store.with_secret(format!("DEEPSEEK_API_KEY_{idx}"), format!("sk-{idx}"));
        }
        Arc::new(store)
    }

    fn pool_with(n: usize) -> Arc<KeyPoolManager> {
        let creds: Vec<Credential> = (0..n)
            .map(|i| {
                let name = if i == 0 {
                    "DEEPSEEK_API_KEY".to_string()
                } else {
                    format!("DEEPSEEK_API_KEY_{}", i + 1)
                };
                Credential::new(Provider::Reasoner, i, name)
            })
            .collect();
        Arc::new(KeyPoolManager::from_credentials(secrets(), creds))
    }

    fn dispatcher(pool: Arc<KeyPoolManager>, transport: Arc<MockTransport>) -> (Dispatcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(
            pool,
            transport,
            Arc::new(PromptOptimizer::new()),
            Arc::new(CircuitBreakerSet::new(BreakerConfig {
                failure_threshold: 5,
                cooloff: Duration::from_secs(30),
            })),
            dir.path().to_path_buf(),
        );
        (dispatcher, dir)
    }

    fn chat_ok(content: &str) -> Value {
        json!({
            "choices": [{"message": {"content": content}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        })
    }

    #[tokio::test]
    async fn success_marks_credential_and_caches() {
        let pool = pool_with(1);
        let transport = Arc::new(MockTransport::new(vec![Ok(chat_ok("all good"))]));
        let (dispatcher, _dir) = dispatcher(pool.clone(), transport.clone());

        let request = AgentRequest::new(Provider::Reasoner, "analyze", "evaluate this run");
        let response = dispatcher.send_request(&request).await;

        assert!(response.success);
        assert_eq!(response.content, "all good");
        assert_eq!(response.credential_index, Some(0));
        assert!(response.tokens_used.is_some());
        assert_eq!(transport.calls(), 1);

        // Identical request within the TTL is served from the cache.
        let cached = dispatcher.send_request(&request).await;
        assert!(cached.success);
        assert_eq!(cached.channel, AgentChannel::Cache);
        assert_eq!(cached.content, "all good");
        assert_eq!(transport.calls(), 1);

        let counters = dispatcher.counters();
        assert_eq!(counters["deepseek"].succeeded, 1);
    }

    #[tokio::test]
    async fn empty_pool_is_typed_failure() {
        let pool = Arc::new(KeyPoolManager::from_credentials(secrets(), Vec::new()));
        let transport = Arc::new(MockTransport::new(vec![]));
        let (dispatcher, _dir) = dispatcher(pool, transport.clone());

        let request = AgentRequest::new(Provider::Reasoner, "analyze", "anything");
        let response = dispatcher.send_request(&request).await;

        assert!(!response.success);
        assert_eq!(response.failure_kind, Some(FailureKind::NoUsableCredential));
        assert_eq!(response.error.as_deref(), Some("no active deepseek credentials"));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn rate_limit_cools_credential() {
        let pool = pool_with(1);
        let transport = Arc::new(MockTransport::new(vec![Err(ProviderError::RateLimit {
            retry_after: Some(42.0),
            body: String::new(),
        })]));
        let (dispatcher, _dir) = dispatcher(pool.clone(), transport);

        let request = AgentRequest::new(Provider::Reasoner, "analyze", "hit the limit");
        let response = dispatcher.send_request(&request).await;

        assert!(!response.success);
        assert_eq!(response.failure_kind, Some(FailureKind::ProviderRateLimit));
        let metrics = pool.pool_metrics(Provider::Reasoner);
        assert_eq!(metrics.cooling, 1);
        assert!(metrics.next_available_in > 40.0);

        // The only credential is cooling now.
        let next = dispatcher.send_request(&request).await;
        assert_eq!(next.failure_kind, Some(FailureKind::NoUsableCredential));
    }

    #[tokio::test]
    async fn auth_error_disables_credential() {
        let pool = pool_with(1);
        let transport = Arc::new(MockTransport::new(vec![Err(ProviderError::Auth { status: 401 })]));
        let (dispatcher, _dir) = dispatcher(pool.clone(), transport);

        let request = AgentRequest::new(Provider::Reasoner, "analyze", "bad key");
        let response = dispatcher.send_request(&request).await;

        assert_eq!(response.failure_kind, Some(FailureKind::ProviderAuthFailure));
        assert_eq!(pool.count_active(Provider::Reasoner), 0);
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_server_errors() {
        let pool = pool_with(6);
        let script: Vec<Result<Value, ProviderError>> = (0..5)
            .map(|_| {
                Err(ProviderError::Server {
                    status: 500,
                    body: "boom".into(),
                })
            })
            .collect();
        let transport = Arc::new(MockTransport::new(script));
        let (dispatcher, _dir) = dispatcher(pool.clone(), transport.clone());

        let request = AgentRequest::new(Provider::Reasoner, "analyze", "unstable upstream");
        for _ in 0..5 {
            let response = dispatcher.send_request(&request).await;
            assert_eq!(response.failure_kind, Some(FailureKind::ProviderServerError));
        }
        assert_eq!(transport.calls(), 5);

        // Sixth call fast-fails without touching the provider; the last
        // healthy credential is not marked.
        let cooling_before = pool.pool_metrics(Provider::Reasoner).cooling;
        let response = dispatcher.send_request(&request).await;
        assert_eq!(response.failure_kind, Some(FailureKind::CircuitOpen));
        assert_eq!(response.error.as_deref(), Some("circuit_open"));
        assert_eq!(transport.calls(), 5);
        assert_eq!(pool.pool_metrics(Provider::Reasoner).cooling, cooling_before);
    }

    #[tokio::test]
    async fn unparseable_body_returns_raw_dump() {
        let pool = pool_with(1);
        let transport = Arc::new(MockTransport::new(vec![Ok(json!({"odd": {"shape": 1}}))]));
        let (dispatcher, _dir) = dispatcher(pool.clone(), transport);

        let request = AgentRequest::new(Provider::Reasoner, "analyze", "weird reply");
        let response = dispatcher.send_request(&request).await;

        assert!(!response.success);
        assert_eq!(response.failure_kind, Some(FailureKind::ParseError));
        assert_eq!(response.error.as_deref(), Some("parse_error"));
        assert!(response.content.contains("\"shape\""));
        // Provider answered; the credential is still healthy.
        assert_eq!(pool.count_active(Provider::Reasoner), 1);
    }

    #[tokio::test]
    async fn streaming_accumulates_and_persists_reasoning() {
        let pool = pool_with(1);
        let transport = Arc::new(MockTransport::with_stream(vec![Ok(StreamOutcome {
            reasoning: "thinking hard".into(),
            content: "final answer".into(),
        })]));
        let (dispatcher, dir) = dispatcher(pool, transport);

        let mut reasoning_chunks = Vec::new();
        let mut content_chunks = Vec::new();
        let request = AgentRequest::new(Provider::Reasoner, "analyze", "stream it");
        let response = dispatcher
            .stream_request(
                &request,
                |chunk| reasoning_chunks.push(chunk.to_string()),
                |chunk| content_chunks.push(chunk.to_string()),
            )
            .await;

        assert!(response.success);
        assert_eq!(response.channel, AgentChannel::Stream);
        assert_eq!(response.content, "final answer");
        assert_eq!(response.reasoning_content.as_deref(), Some("thinking hard"));
        assert_eq!(reasoning_chunks.join(""), "thinking hard");
        assert_eq!(content_chunks.join(""), "final answer");

        let logs: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn reasoning_log_failure_does_not_fail_request() {
        let pool = pool_with(1);
        let data = json!({
            "choices": [{"message": {
                "content": "answer",
                "reasoning_content": "chain of thought",
            }}],
        });
        let transport = Arc::new(MockTransport::new(vec![Ok(data)]));
        let dir = tempfile::tempdir().unwrap();
        // A file where the log directory should be makes create_dir_all fail.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"not a dir").unwrap();

        let dispatcher = Dispatcher::new(
            pool,
            transport,
            Arc::new(PromptOptimizer::new()),
            Arc::new(CircuitBreakerSet::default()),
            blocked,
        );

        let request = AgentRequest::new(Provider::Reasoner, "analyze", "log this");
        let response = dispatcher.send_request(&request).await;
        assert!(response.success);
        assert_eq!(response.reasoning_content.as_deref(), Some("chain of thought"));
    }

    #[tokio::test]
    async fn disabled_credentials_surface_as_no_credential() {
        let mut cred = Credential::new(Provider::Reasoner, 0, "DEEPSEEK_API_KEY");
        cred.auth_failed = true;
        cred.health = CredentialHealth::Disabled;
        let pool = Arc::new(KeyPoolManager::from_credentials(secrets(), vec![cred]));
        let transport = Arc::new(MockTransport::new(vec![]));
        let (dispatcher, _dir) = dispatcher(pool, transport.clone());

        let request = AgentRequest::new(Provider::Reasoner, "analyze", "anything");
        let response = dispatcher.send_request(&request).await;
        assert_eq!(response.failure_kind, Some(FailureKind::NoUsableCredential));
        assert_eq!(transport.calls(), 0);
    }
}
