//! Credential state: health, usage counters, and cooldown bookkeeping.
//!
//! A credential never holds the raw API key, only the secret name it resolves
//! through at dispatch time. All mutation goes through the owning pool.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::models::Provider;

/// Health tiers for a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialHealth {
    /// Fully operational.
    Healthy,
    /// Has recent errors but still usable.
    Degraded,
    /// Out of rotation due to auth failure or repeated errors.
    Disabled,
}

/// Backoff tiers applied when no `Retry-After` hint is available.
/// Indexed by cooldown level, saturating at the top tier.
pub const ERROR_BACKOFF_TIERS: [f64; 5] = [30.0, 60.0, 120.0, 300.0, 600.0];

/// Ceiling for provider-supplied `Retry-After` cooldowns.
pub const MAX_COOLDOWN_SECS: f64 = 300.0;

/// Hard cap on the cooldown level.
pub const MAX_COOLDOWN_LEVEL: u32 = 10;

/// One API credential with health tracking and cooldown management.
#[derive(Debug, Clone)]
pub struct Credential {
    pub provider: Provider,
    pub index: usize,
    /// Name under which the secret store resolves the actual key.
    pub secret_name: String,
    pub health: CredentialHealth,
    pub error_count: u32,
    pub request_count: u64,
    pub cooling_events: u64,
    pub cooldown_level: u32,
    pub last_used: Option<Instant>,
    pub last_error_at: Option<Instant>,
    pub cooldown_until: Option<Instant>,
    pub cooldown_reason: Option<String>,
    /// Sticky: set by auth failures, never cleared by success marks.
    pub auth_failed: bool,
}

impl Credential {
    pub fn new(provider: Provider, index: usize, secret_name: impl Into<String>) -> Self {
        Self {
            provider,
            index,
            secret_name: secret_name.into(),
            health: CredentialHealth::Healthy,
            error_count: 0,
            request_count: 0,
            cooling_events: 0,
            cooldown_level: 0,
            last_used: None,
            last_error_at: None,
            cooldown_until: None,
            cooldown_reason: None,
            auth_failed: false,
        }
    }

    /// Whether the credential is in an active cooldown window.
    pub fn is_cooling(&self) -> bool {
        match self.cooldown_until {
            Some(until) => until > Instant::now(),
            None => false,
        }
    }

    /// Usable = not disabled and not cooling.
    pub fn is_usable(&self) -> bool {
        self.health != CredentialHealth::Disabled && !self.is_cooling()
    }

    /// Remaining cooldown time; zero when not cooling.
    pub fn cooldown_remaining(&self) -> Duration {
        match self.cooldown_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Start a cooldown window. Returns the duration actually applied.
    pub fn begin_cooldown(&mut self, duration: Duration, reason: &str) -> Duration {
        let now = Instant::now();
        self.cooldown_until = Some(now + duration);
        self.cooldown_reason = Some(reason.to_string());
        self.cooldown_level = (self.cooldown_level + 1).min(MAX_COOLDOWN_LEVEL);
        self.cooling_events += 1;
        duration
    }

    /// Clear the cooldown window, stepping the level down by one.
    pub fn clear_cooldown(&mut self) {
        self.cooldown_level = self.cooldown_level.saturating_sub(1);
        self.cooldown_until = None;
        self.cooldown_reason = None;
    }

    /// Clear an expired cooldown. Returns true if one was cleared.
    pub fn maybe_exit_cooldown(&mut self) -> bool {
        if let Some(until) = self.cooldown_until {
            if until <= Instant::now() {
                self.clear_cooldown();
                return true;
            }
        }
        false
    }

    /// Backoff duration for the current cooldown level when no provider
    /// hint is available.
    pub fn backoff_duration(&self) -> Duration {
        let idx = (self.cooldown_level as usize).min(ERROR_BACKOFF_TIERS.len() - 1);
        Duration::from_secs_f64(ERROR_BACKOFF_TIERS[idx])
    }

    /// Human-readable status for metrics surfaces.
    pub fn status(&self) -> &'static str {
        if self.is_cooling() {
            return "cooling";
        }
        match self.health {
            CredentialHealth::Healthy => "healthy",
            CredentialHealth::Degraded => "degraded",
            CredentialHealth::Disabled => "disabled",
        }
    }
}

/// Borrow-free handle returned by the pool. Carries everything the
/// dispatcher needs to resolve the key and report the outcome back.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    pub provider: Provider,
    pub index: usize,
    pub secret_name: String,
}
