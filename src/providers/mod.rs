//! Provider HTTP adapters.
//!
//! One reqwest-backed transport serves all three providers; they share the
//! OpenAI-compatible chat completions wire shape. HTTP outcomes are
//! classified into typed errors the dispatcher maps onto credential pool
//! marks. Streaming (reasoner) follows SSE with a `data: [DONE]` sentinel.

pub mod payload;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::keypool::{AuthProbe, ProbeOutcome};
use crate::models::Provider;

pub use payload::{build_payload, ChatMessage, ChatPayload, PayloadOptions};

/// Default request timeout for single-shot chat calls.
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(45);
/// Streaming requests get a much longer window.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(300);
/// Pre-flight probes are kept short.
pub const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed transport failure, classified from the HTTP outcome.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// HTTP 429; carries the parsed `Retry-After` when present.
    RateLimit { retry_after: Option<f64>, body: String },
    /// HTTP 401/403.
    Auth { status: u16 },
    /// Other 4xx.
    Client { status: u16, body: String },
    /// HTTP 408 or 5xx.
    Server { status: u16, body: String },
    /// Connection, DNS, or timeout failure before a status was received.
    Network(String),
    /// Body received but not parseable as JSON.
    Parse { body: String },
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::RateLimit { retry_after, .. } => match retry_after {
                Some(secs) => write!(f, "rate limited (retry after {secs:.0}s)"),
                None => write!(f, "rate limited"),
            },
            ProviderError::Auth { status } => write!(f, "auth failure (HTTP {status})"),
            ProviderError::Client { status, body } => {
                write!(f, "client error (HTTP {status}): {}", snippet(body))
            }
            ProviderError::Server { status, body } => {
                write!(f, "server error (HTTP {status}): {}", snippet(body))
            }
            ProviderError::Network(err) => write!(f, "network error: {err}"),
            ProviderError::Parse { .. } => write!(f, "unparseable response body"),
        }
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Accumulated output of a streaming call.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub reasoning: String,
    pub content: String,
}

pub type ChunkCallback<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Narrow seam between the dispatcher and the wire. The HTTP implementation
/// below is the production one; tests substitute canned outcomes.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn execute(
        &self,
        provider: Provider,
        payload: &ChatPayload,
        api_key: &str,
        strict_mode: bool,
    ) -> Result<Value, ProviderError>;

    async fn execute_stream(
        &self,
        provider: Provider,
        payload: &ChatPayload,
        api_key: &str,
        on_reasoning: ChunkCallback<'_>,
        on_content: ChunkCallback<'_>,
    ) -> Result<StreamOutcome, ProviderError>;
}

/// Chat completions URL for a provider. Base URLs are env-overridable;
/// the reasoner's strict mode routes through its beta endpoint.
pub fn api_url(provider: Provider, strict_mode: bool) -> String {
    match provider {
        Provider::Reasoner => {
            let base = std::env::var("DEEPSEEK_BASE_URL")
                .unwrap_or_else(|_| "https://api.deepseek.com".to_string());
            if strict_mode {
                format!("{base}/beta/chat/completions")
            } else {
                format!("{base}/v1/chat/completions")
            }
        }
        Provider::Technical => {
            let base = std::env::var("QWEN_BASE_URL")
                .unwrap_or_else(|_| "https://dashscope-intl.aliyuncs.com/compatible-mode/v1".to_string());
            format!("{base}/chat/completions")
        }
        Provider::Research => {
            let base = std::env::var("PERPLEXITY_BASE_URL")
                .unwrap_or_else(|_| "https://api.perplexity.ai".to_string());
            format!("{base}/chat/completions")
        }
    }
}

/// Parse a `Retry-After` header as seconds or an HTTP-date. Non-positive
/// results are treated as absent.
pub fn parse_retry_after(header: &str) -> Option<f64> {
    let header = header.trim();
    if header.is_empty() {
        return None;
    }

    if let Ok(secs) = header.parse::<f64>() {
        return (secs > 0.0).then_some(secs);
    }

    let retry_at: DateTime<Utc> = DateTime::parse_from_rfc2822(header).ok()?.with_timezone(&Utc);
    let delta = (retry_at - Utc::now()).num_milliseconds() as f64 / 1000.0;
    (delta > 0.0).then_some(delta)
}

/// Production transport over reqwest.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(CHAT_TIMEOUT)
            .user_agent("conclave/0.1 (agent orchestration)")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    async fn classify_failure(status: reqwest::StatusCode, response: reqwest::Response) -> ProviderError {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();

        match code {
            401 | 403 => ProviderError::Auth { status: code },
            429 => ProviderError::RateLimit { retry_after, body },
            408 => ProviderError::Server { status: code, body },
            _ if status.is_server_error() => ProviderError::Server { status: code, body },
            _ => ProviderError::Client { status: code, body },
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn execute(
        &self,
        provider: Provider,
        payload: &ChatPayload,
        api_key: &str,
        strict_mode: bool,
    ) -> Result<Value, ProviderError> {
        let url = api_url(provider, strict_mode);
        debug!("POST {} model={}", url, payload.model);

        let response = self
            .client
            .post(&url)
            .timeout(CHAT_TIMEOUT)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {api_key}"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_failure(status, response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        serde_json::from_str(&body).map_err(|_| ProviderError::Parse { body })
    }

    async fn execute_stream(
        &self,
        provider: Provider,
        payload: &ChatPayload,
        api_key: &str,
        on_reasoning: ChunkCallback<'_>,
        on_content: ChunkCallback<'_>,
    ) -> Result<StreamOutcome, ProviderError> {
        let url = api_url(provider, false);
        info!("Starting streaming request to {}", provider);

        let response = self
            .client
            .post(&url)
            .timeout(STREAM_TIMEOUT)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {api_key}"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_failure(status, response).await);
        }

        let mut outcome = StreamOutcome::default();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Network(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end_matches('\r').to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }

                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                let delta = &event["choices"][0]["delta"];

                if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str) {
                    if !reasoning.is_empty() {
                        outcome.reasoning.push_str(reasoning);
                        on_reasoning(reasoning);
                    }
                }
                if let Some(content) = delta.get("content").and_then(Value::as_str) {
                    if !content.is_empty() {
                        outcome.content.push_str(content);
                        on_content(content);
                    }
                }
            }
        }

        info!(
            "Streaming completed (reasoning: {}, content: {})",
            outcome.reasoning.len(),
            outcome.content.len()
        );
        Ok(outcome)
    }
}

/// Minimal authenticated probe used by pre-flight validation.
///
/// The research provider has no models listing; it gets a 1-token chat
/// request instead.
#[derive(Clone)]
pub struct HttpAuthProbe {
    client: reqwest::Client,
}

impl HttpAuthProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PREFLIGHT_TIMEOUT)
            .user_agent("conclave/0.1 (preflight)")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpAuthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProbe for HttpAuthProbe {
    async fn probe(&self, provider: Provider, api_key: &str) -> ProbeOutcome {
        let result = match provider {
            Provider::Reasoner => {
                let base = std::env::var("DEEPSEEK_BASE_URL")
                    .unwrap_or_else(|_| "https://api.deepseek.com".to_string());
                self.client
                    .get(format!("{base}/models"))
                    .bearer_auth(api_key)
                    .send()
                    .await
            }
            Provider::Technical => {
                let base = std::env::var("QWEN_BASE_URL")
                    .unwrap_or_else(|_| "https://dashscope-intl.aliyuncs.com/compatible-mode/v1".to_string());
                self.client
                    .get(format!("{base}/models"))
                    .bearer_auth(api_key)
                    .send()
                    .await
            }
            Provider::Research => {
                self.client
                    .post(api_url(Provider::Research, false))
                    .bearer_auth(api_key)
                    .json(&serde_json::json!({
                        "model": "sonar",
                        "messages": [{"role": "user", "content": "ping"}],
                        "max_tokens": 1,
                    }))
                    .send()
                    .await
            }
        };

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                match status {
                    200 | 201 => ProbeOutcome::Ok(status),
                    401 | 403 => ProbeOutcome::AuthFailed(status),
                    429 => ProbeOutcome::RateLimited,
                    _ => ProbeOutcome::Other(status),
                }
            }
            Err(e) => {
                warn!("Pre-flight probe for {} failed: {}", provider, e);
                ProbeOutcome::Unreachable(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_parses_seconds() {
        assert_eq!(parse_retry_after("30"), Some(30.0));
        assert_eq!(parse_retry_after(" 1.5 "), Some(1.5));
        assert_eq!(parse_retry_after("0"), None);
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("garbage"), None);
    }

    #[test]
    fn retry_after_parses_http_date() {
        let future = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed > 85.0 && parsed < 95.0);

        let past = (Utc::now() - chrono::Duration::seconds(90)).to_rfc2822();
        assert_eq!(parse_retry_after(&past), None);
    }

    #[test]
    fn api_urls_cover_strict_mode() {
        std::env::remove_var("DEEPSEEK_BASE_URL");
        assert_eq!(
            api_url(Provider::Reasoner, false),
            "https://api.deepseek.com/v1/chat/completions"
        );
        assert_eq!(
            api_url(Provider::Reasoner, true),
            "https://api.deepseek.com/beta/chat/completions"
        );
    }

    #[test]
    fn provider_error_display_is_compact() {
        let err = ProviderError::Server {
            status: 502,
            body: "x".repeat(1000),
        };
        assert!(err.to_string().len() < 260);
    }
}
