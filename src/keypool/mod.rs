//! Credential pool: rotation, health tracking, and cooldown for provider
//! API keys.
//!
//! One pool per provider, all owned by a single manager. Selection is
//! weighted by health and usage so traffic drains away from keys that are
//! erroring or rate-limited, and a pressure alert fires when too much of a
//! pool is cooling at once.

pub mod credential;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::distributions::{Distribution, WeightedIndex};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::models::Provider;
use crate::secrets::{registered_key_names, SecretStore};

pub use credential::{Credential, CredentialHealth, CredentialLease};

const COOLDOWN_ALERT_THRESHOLD: f64 = 0.5;
const COOLDOWN_ALERT_INTERVAL: Duration = Duration::from_secs(60);

/// Callback invoked when a pool comes under cooldown pressure:
/// `(provider, cooling, total)`.
pub type AlertCallback = Box<dyn Fn(Provider, usize, usize) + Send + Sync>;

/// Process-wide pool counters, exported with snapshots for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolTelemetry {
    pub cooldown_events: u64,
    pub rate_limit_events: u64,
    pub alerts_triggered: u64,
    pub cooldown_reasons: HashMap<String, u64>,
    pub snapshots: HashMap<String, PoolSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub usable: usize,
    pub cooling: usize,
    pub disabled: usize,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time metrics for one provider's pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub total: usize,
    pub cooling: usize,
    pub healthy: usize,
    pub degraded: usize,
    /// Seconds until the earliest cooling key becomes available again.
    pub next_available_in: f64,
}

/// Outcome of a minimal authenticated probe against a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Ok(u16),
    AuthFailed(u16),
    RateLimited,
    Unreachable(String),
    Other(u16),
}

/// Minimal-probe seam used by pre-flight validation. The HTTP implementation
/// lives in the providers module; tests inject canned outcomes.
#[async_trait]
pub trait AuthProbe: Send + Sync {
    async fn probe(&self, provider: Provider, api_key: &str) -> ProbeOutcome;
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyPreflight {
    pub index: usize,
    pub outcome: String,
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderPreflight {
    pub registered: usize,
    pub valid: usize,
    pub disabled: usize,
    pub keys: Vec<KeyPreflight>,
}

/// Manages credential pools with health tracking and weighted selection.
///
/// Selection runs under an async lock so at most one acquisition performs
/// the selection pass at a time; all other mutations take the short pool
/// lock only.
pub struct KeyPoolManager {
    secrets: Arc<dyn SecretStore>,
    pools: Mutex<HashMap<Provider, Vec<Credential>>>,
    selection_lock: AsyncMutex<()>,
    telemetry: Mutex<PoolTelemetry>,
    alert_callback: RwLock<Option<AlertCallback>>,
    last_alert: Mutex<HashMap<Provider, Instant>>,
}

impl KeyPoolManager {
    /// Build pools from every key the secret store has registered per
    /// provider (base env name plus indexed variants).
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        let mut pools: HashMap<Provider, Vec<Credential>> = HashMap::new();

        for provider in Provider::ALL {
            let creds: Vec<Credential> = registered_key_names(secrets.as_ref(), provider)
                .into_iter()
                .enumerate()
                .map(|(idx, name)| Credential::new(provider, idx, name))
                .collect();
            if !creds.is_empty() {
                debug!("{} pool registered ({} keys)", provider, creds.len());
            }
            pools.insert(provider, creds);
        }

        let counts: Vec<String> = Provider::ALL
            .iter()
            .map(|p| format!("{} {}", pools[p].len(), p))
            .collect();
        info!("Loaded credential pools: {}", counts.join(" + "));

        Self {
            secrets,
            pools: Mutex::new(pools),
            selection_lock: AsyncMutex::new(()),
            telemetry: Mutex::new(PoolTelemetry::default()),
            alert_callback: RwLock::new(None),
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Build a manager around an explicit credential set. Used by tooling
    /// and tests that need to shape pool state directly.
    pub fn from_credentials(secrets: Arc<dyn SecretStore>, credentials: Vec<Credential>) -> Self {
        let mut pools: HashMap<Provider, Vec<Credential>> = HashMap::new();
        for provider in Provider::ALL {
            pools.insert(provider, Vec::new());
        }
        for cred in credentials {
            pools.entry(cred.provider).or_default().push(cred);
        }
        Self {
            secrets,
            pools: Mutex::new(pools),
            selection_lock: AsyncMutex::new(()),
            telemetry: Mutex::new(PoolTelemetry::default()),
            alert_callback: RwLock::new(None),
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_alert_callback(&self, callback: AlertCallback) {
        *self.alert_callback.write() = Some(callback);
    }

    /// Selection weight for a credential. Pure over the credential snapshot.
    ///
    /// `health_factor * request_penalty * error_penalty * cooldown_penalty
    ///  * recency_bonus`, floored at 0.001.
    pub fn calculate_weight(cred: &Credential) -> f64 {
        if !cred.is_usable() {
            return 0.0;
        }
        let health_factor = match cred.health {
            CredentialHealth::Healthy => 3.0,
            CredentialHealth::Degraded => 1.5,
            CredentialHealth::Disabled => 0.0,
        };
        let request_penalty = 1.0 / (1.0 + cred.request_count as f64 / 25.0);
        let error_penalty = 1.0 / (1.0 + cred.error_count as f64);
        let cooldown_penalty = 0.5_f64.powi(cred.cooldown_level as i32);
        let recency_bonus = match cred.last_used {
            Some(last) => {
                let idle = last.elapsed().as_secs_f64();
                (0.2 + idle / 30.0).clamp(0.2, 1.2)
            }
            None => 1.0,
        };
        let weight = health_factor * request_penalty * error_penalty * cooldown_penalty * recency_bonus;
        weight.max(0.001)
    }

    /// Get a usable credential via weighted random selection.
    ///
    /// Returns `None` only when every key is disabled or cooling; callers
    /// treat that as a transient failure.
    pub async fn acquire(&self, provider: Provider) -> Option<CredentialLease> {
        let _selection = self.selection_lock.lock().await;

        let lease = {
            let mut pools = self.pools.lock();
            let pool = pools.get_mut(&provider)?;
            if pool.is_empty() {
                return None;
            }

            let recovered = {
                let mut n = 0;
                for c in pool.iter_mut() {
                    if c.maybe_exit_cooldown() {
                        n += 1;
                    }
                }
                n
            };
            if recovered > 0 {
                info!("Restored {} cooled {} keys", recovered, provider);
            }

            let candidates: Vec<usize> = pool
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_usable())
                .map(|(i, _)| i)
                .collect();

            if candidates.is_empty() {
                None
            } else {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|&i| Self::calculate_weight(&pool[i]))
                    .collect();
                let dist = WeightedIndex::new(&weights).ok()?;
                let sampled = dist.sample(&mut rand::thread_rng());
                let cred = &pool[candidates[sampled]];
                debug!(
                    "Weighted key selection for {}: key #{} (weight={:.4})",
                    provider, cred.index, weights[sampled]
                );
                Some(CredentialLease {
                    provider,
                    index: cred.index,
                    secret_name: cred.secret_name.clone(),
                })
            }
        };

        self.emit_snapshot(provider);
        if lease.is_none() {
            self.maybe_alert_pool_pressure(provider);
        }
        lease
    }

    /// Resolve the raw API key for a lease through the secret store.
    pub fn resolve_key(&self, lease: &CredentialLease) -> anyhow::Result<String> {
        self.secrets.get_decrypted_key(&lease.secret_name)
    }

    // ------------------------------------------------------------------
    // Outcome marks
    // ------------------------------------------------------------------

    /// Successful use: decay the error count, step the cooldown level down
    /// when not cooling, and refresh recency.
    pub fn mark_success(&self, lease: &CredentialLease) {
        self.with_credential(lease, |cred| {
            cred.last_used = Some(Instant::now());
            cred.request_count += 1;
            cred.error_count = cred.error_count.saturating_sub(1);
            if cred.error_count == 0 {
                cred.last_error_at = None;
            }
            if cred.cooldown_level > 0 && !cred.is_cooling() {
                cred.cooldown_level -= 1;
            }
            update_health(cred);
        });
    }

    /// Network-level failure: count it without applying a cooldown.
    pub fn mark_network_error(&self, lease: &CredentialLease) {
        self.with_credential(lease, |cred| {
            cred.error_count += 1;
            cred.last_error_at = Some(Instant::now());
            update_health(cred);
        });
    }

    /// Client error (4xx except 401/403/429): count without cooldown.
    pub fn mark_client_error(&self, lease: &CredentialLease) {
        self.with_credential(lease, |cred| {
            cred.error_count += 1;
            cred.last_error_at = Some(Instant::now());
            update_health(cred);
        });
    }

    /// Rate limit or retryable server failure: count it and cool the key.
    ///
    /// Uses the provider's `Retry-After` when positive (capped), otherwise
    /// the exponential backoff tier for the key's current cooldown level.
    pub fn mark_rate_limit(&self, lease: &CredentialLease, retry_after: Option<f64>) {
        let applied = self.with_credential(lease, |cred| {
            cred.error_count += 1;
            cred.last_error_at = Some(Instant::now());
            update_health(cred);

            let duration = match retry_after {
                Some(secs) if secs > 0.0 => {
                    Duration::from_secs_f64(secs.min(credential::MAX_COOLDOWN_SECS))
                }
                _ => cred.backoff_duration(),
            };
            cred.begin_cooldown(duration, "rate_limit")
        });

        if let Some(duration) = applied {
            {
                let mut telemetry = self.telemetry.lock();
                telemetry.cooldown_events += 1;
                telemetry.rate_limit_events += 1;
                *telemetry.cooldown_reasons.entry("rate_limit".into()).or_insert(0) += 1;
            }
            warn!(
                "Cooling {} key #{} for {:.1}s (rate_limit)",
                lease.provider,
                lease.index,
                duration.as_secs_f64()
            );
            self.emit_snapshot(lease.provider);
            self.maybe_alert_pool_pressure(lease.provider);
        }
    }

    /// Auth failure: disable immediately and permanently (until external
    /// reset). Success marks never heal an auth-disabled key.
    pub fn mark_auth_error(&self, lease: &CredentialLease) {
        self.with_credential(lease, |cred| {
            cred.error_count += 1;
            cred.last_error_at = Some(Instant::now());
            cred.auth_failed = true;
            cred.health = CredentialHealth::Disabled;
        });
        warn!("Disabled {} key #{} due to auth error", lease.provider, lease.index);
        self.emit_snapshot(lease.provider);
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    pub fn pool_metrics(&self, provider: Provider) -> PoolMetrics {
        let pools = self.pools.lock();
        let pool = pools.get(&provider).map(Vec::as_slice).unwrap_or(&[]);

        let cooling = pool.iter().filter(|c| c.is_cooling()).count();
        let healthy = pool
            .iter()
            .filter(|c| c.health == CredentialHealth::Healthy && !c.is_cooling())
            .count();
        let degraded = pool
            .iter()
            .filter(|c| c.health == CredentialHealth::Degraded && !c.is_cooling())
            .count();
        let next_available_in = pool
            .iter()
            .filter(|c| c.is_cooling())
            .map(|c| c.cooldown_remaining().as_secs_f64())
            .fold(f64::INFINITY, f64::min);

        PoolMetrics {
            total: pool.len(),
            cooling,
            healthy,
            degraded,
            next_available_in: if next_available_in.is_finite() {
                next_available_in
            } else {
                0.0
            },
        }
    }

    pub fn count_active(&self, provider: Provider) -> usize {
        let pools = self.pools.lock();
        pools
            .get(&provider)
            .map(|pool| pool.iter().filter(|c| c.is_usable()).count())
            .unwrap_or(0)
    }

    pub fn telemetry(&self) -> PoolTelemetry {
        self.telemetry.lock().clone()
    }

    // ------------------------------------------------------------------
    // Pre-flight validation
    // ------------------------------------------------------------------

    /// Probe every registered key with a minimal authenticated request and
    /// disable the ones the provider rejects as unauthorized.
    pub async fn preflight_validate(&self, probe: &dyn AuthProbe) -> HashMap<Provider, ProviderPreflight> {
        let mut results = HashMap::new();

        for provider in Provider::ALL {
            let entries: Vec<(usize, String)> = {
                let pools = self.pools.lock();
                pools
                    .get(&provider)
                    .map(|pool| pool.iter().map(|c| (c.index, c.secret_name.clone())).collect())
                    .unwrap_or_default()
            };

            if entries.is_empty() {
                warn!("Pre-flight: {} has no keys registered", provider);
                results.insert(
                    provider,
                    ProviderPreflight {
                        registered: 0,
                        valid: 0,
                        disabled: 0,
                        keys: Vec::new(),
                    },
                );
                continue;
            }

            let mut keys = Vec::new();
            let mut valid = 0;
            let mut disabled = 0;

            for (index, secret_name) in entries {
                let api_key = match self.secrets.get_decrypted_key(&secret_name) {
                    Ok(k) => k,
                    Err(e) => {
                        error!("Pre-flight: {} key #{} not decryptable: {}", provider, index, e);
                        self.disable_credential(provider, index);
                        disabled += 1;
                        keys.push(KeyPreflight {
                            index,
                            outcome: "key_not_decryptable".into(),
                            status: None,
                        });
                        continue;
                    }
                };

                match probe.probe(provider, &api_key).await {
                    ProbeOutcome::Ok(status) => {
                        info!("Pre-flight: {} key #{} valid (HTTP {})", provider, index, status);
                        valid += 1;
                        keys.push(KeyPreflight {
                            index,
                            outcome: "valid".into(),
                            status: Some(status),
                        });
                    }
                    ProbeOutcome::AuthFailed(status) => {
                        error!("Pre-flight: {} key #{} INVALID (HTTP {})", provider, index, status);
                        self.disable_credential(provider, index);
                        disabled += 1;
                        keys.push(KeyPreflight {
                            index,
                            outcome: "auth_failed".into(),
                            status: Some(status),
                        });
                    }
                    ProbeOutcome::RateLimited => {
                        warn!("Pre-flight: {} key #{} valid but rate-limited", provider, index);
                        valid += 1;
                        keys.push(KeyPreflight {
                            index,
                            outcome: "rate_limited_but_valid".into(),
                            status: Some(429),
                        });
                    }
                    ProbeOutcome::Unreachable(err) => {
                        warn!("Pre-flight: {} key #{} connection failed: {}", provider, index, err);
                        keys.push(KeyPreflight {
                            index,
                            outcome: "connection_failed".into(),
                            status: None,
                        });
                    }
                    ProbeOutcome::Other(status) => {
                        warn!("Pre-flight: {} key #{} returned HTTP {}", provider, index, status);
                        valid += 1;
                        keys.push(KeyPreflight {
                            index,
                            outcome: "unexpected_status".into(),
                            status: Some(status),
                        });
                    }
                }
            }

            results.insert(
                provider,
                ProviderPreflight {
                    registered: keys.len(),
                    valid,
                    disabled,
                    keys,
                },
            );
        }

        let valid_providers = results.values().filter(|r| r.valid > 0).count();
        info!("Pre-flight key validation: {}/{} providers OK", valid_providers, results.len());
        results
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn with_credential<T>(
        &self,
        lease: &CredentialLease,
        f: impl FnOnce(&mut Credential) -> T,
    ) -> Option<T> {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(&lease.provider)?;
        pool.iter_mut().find(|c| c.index == lease.index).map(f)
    }

    fn disable_credential(&self, provider: Provider, index: usize) {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get_mut(&provider) {
            if let Some(cred) = pool.iter_mut().find(|c| c.index == index) {
                cred.auth_failed = true;
                cred.health = CredentialHealth::Disabled;
            }
        }
    }

    fn emit_snapshot(&self, provider: Provider) {
        let snapshot = {
            let pools = self.pools.lock();
            let pool = pools.get(&provider).map(Vec::as_slice).unwrap_or(&[]);
            PoolSnapshot {
                total: pool.len(),
                usable: pool.iter().filter(|c| c.is_usable()).count(),
                cooling: pool.iter().filter(|c| c.is_cooling()).count(),
                disabled: pool
                    .iter()
                    .filter(|c| c.health == CredentialHealth::Disabled)
                    .count(),
                timestamp: Utc::now(),
            }
        };
        debug!("KeyPool[{}] snapshot: {:?}", provider, snapshot);
        self.telemetry
            .lock()
            .snapshots
            .insert(provider.as_str().to_string(), snapshot);
    }

    fn maybe_alert_pool_pressure(&self, provider: Provider) {
        let (cooling, total) = {
            let pools = self.pools.lock();
            let pool = pools.get(&provider).map(Vec::as_slice).unwrap_or(&[]);
            (pool.iter().filter(|c| c.is_cooling()).count(), pool.len())
        };
        if total == 0 {
            return;
        }

        let ratio = cooling as f64 / total as f64;
        if ratio < COOLDOWN_ALERT_THRESHOLD {
            return;
        }

        {
            let mut last_alert = self.last_alert.lock();
            let now = Instant::now();
            if let Some(last) = last_alert.get(&provider) {
                if now.duration_since(*last) < COOLDOWN_ALERT_INTERVAL {
                    return;
                }
            }
            last_alert.insert(provider, now);
        }

        self.telemetry.lock().alerts_triggered += 1;
        error!("{} key pool under pressure: {}/{} keys cooling", provider, cooling, total);

        let callback = self.alert_callback.read();
        if let Some(cb) = callback.as_ref() {
            cb(provider, cooling, total);
        }
    }
}

/// Health transitions from the error counter. Auth-disabled keys are sticky.
fn update_health(cred: &mut Credential) {
    if cred.auth_failed {
        cred.health = CredentialHealth::Disabled;
        return;
    }
    cred.health = if cred.error_count >= 5 {
        CredentialHealth::Disabled
    } else if cred.error_count >= 2 {
        CredentialHealth::Degraded
    } else {
        CredentialHealth::Healthy
    };
}
