//! Per-provider circuit breaker.
//!
//! Trips open after a run of consecutive failures, fast-failing dispatch
//! without touching the provider or a credential. After a cool-off, a single
//! probe request decides whether the circuit closes again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit open.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub cooloff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooloff: Duration::from_secs(30),
        }
    }
}

/// What the dispatcher should do with the next request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerDecision {
    /// Circuit closed, proceed normally.
    Allow,
    /// Circuit half-open; this request is the probe.
    Probe,
    /// Circuit open; fail fast. Seconds until a probe becomes possible.
    Reject { retry_in: f64 },
}

#[derive(Debug, Clone)]
struct BreakerCell {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for BreakerCell {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Seconds until the open circuit admits a probe; zero when not open.
    pub seconds_until_probe: f64,
}

/// Breaker state for all providers, updated under one short lock.
pub struct CircuitBreakerSet {
    config: BreakerConfig,
    cells: Mutex<HashMap<Provider, BreakerCell>>,
}

impl CircuitBreakerSet {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a request. Open circuits transition to half-open once the
    /// cool-off has elapsed and admit exactly one probe at a time.
    pub fn preflight(&self, provider: Provider) -> BreakerDecision {
        let mut cells = self.cells.lock();
        let cell = cells.entry(provider).or_default();

        match cell.state {
            CircuitState::Closed => BreakerDecision::Allow,
            CircuitState::Open => {
                let elapsed = cell.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooloff {
                    cell.state = CircuitState::HalfOpen;
                    cell.probe_in_flight = true;
                    info!("Circuit for {} half-open, admitting probe", provider);
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Reject {
                        retry_in: (self.config.cooloff - elapsed).as_secs_f64(),
                    }
                }
            }
            CircuitState::HalfOpen => {
                if cell.probe_in_flight {
                    BreakerDecision::Reject { retry_in: 0.0 }
                } else {
                    cell.probe_in_flight = true;
                    BreakerDecision::Probe
                }
            }
        }
    }

    pub fn record_success(&self, provider: Provider) {
        let mut cells = self.cells.lock();
        let cell = cells.entry(provider).or_default();
        if cell.state != CircuitState::Closed {
            info!("Circuit for {} closed", provider);
        }
        *cell = BreakerCell::default();
    }

    pub fn record_failure(&self, provider: Provider) {
        let mut cells = self.cells.lock();
        let cell = cells.entry(provider).or_default();

        match cell.state {
            CircuitState::HalfOpen => {
                cell.state = CircuitState::Open;
                cell.opened_at = Some(Instant::now());
                cell.probe_in_flight = false;
                warn!("Circuit for {} re-opened after failed probe", provider);
            }
            CircuitState::Closed => {
                cell.consecutive_failures += 1;
                if cell.consecutive_failures >= self.config.failure_threshold {
                    cell.state = CircuitState::Open;
                    cell.opened_at = Some(Instant::now());
                    warn!(
                        "Circuit for {} opened after {} consecutive failures",
                        provider, cell.consecutive_failures
                    );
                }
            }
            CircuitState::Open => {
                cell.consecutive_failures += 1;
            }
        }
    }

    pub fn snapshot(&self, provider: Provider) -> BreakerSnapshot {
        let mut cells = self.cells.lock();
        let cell = cells.entry(provider).or_default();
        let seconds_until_probe = match (cell.state, cell.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                (self.config.cooloff.saturating_sub(opened.elapsed())).as_secs_f64()
            }
            _ => 0.0,
        };
        BreakerSnapshot {
            state: cell.state,
            consecutive_failures: cell.consecutive_failures,
            seconds_until_probe,
        }
    }

    pub fn snapshot_all(&self) -> HashMap<String, BreakerSnapshot> {
        Provider::ALL
            .iter()
            .map(|p| (p.as_str().to_string(), self.snapshot(*p)))
            .collect()
    }
}

impl Default for CircuitBreakerSet {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(cooloff_ms: u64) -> CircuitBreakerSet {
        CircuitBreakerSet::new(BreakerConfig {
            failure_threshold: 5,
            cooloff: Duration::from_millis(cooloff_ms),
        })
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let breaker = breaker(30_000);
        for _ in 0..4 {
            breaker.record_failure(Provider::Reasoner);
            assert_eq!(breaker.preflight(Provider::Reasoner), BreakerDecision::Allow);
        }
        breaker.record_failure(Provider::Reasoner);
        assert!(matches!(
            breaker.preflight(Provider::Reasoner),
            BreakerDecision::Reject { .. }
        ));
        // Other providers are unaffected.
        assert_eq!(breaker.preflight(Provider::Technical), BreakerDecision::Allow);
    }

    #[test]
    fn success_resets_failure_run() {
        let breaker = breaker(30_000);
        for _ in 0..4 {
            breaker.record_failure(Provider::Research);
        }
        breaker.record_success(Provider::Research);
        for _ in 0..4 {
            breaker.record_failure(Provider::Research);
        }
        assert_eq!(breaker.preflight(Provider::Research), BreakerDecision::Allow);
    }

    #[test]
    fn half_open_admits_single_probe() {
        let breaker = breaker(0);
        for _ in 0..5 {
            breaker.record_failure(Provider::Reasoner);
        }

        // Cool-off already elapsed: first preflight is the probe.
        assert_eq!(breaker.preflight(Provider::Reasoner), BreakerDecision::Probe);
        // A second concurrent request is rejected while the probe runs.
        assert!(matches!(
            breaker.preflight(Provider::Reasoner),
            BreakerDecision::Reject { .. }
        ));

        breaker.record_success(Provider::Reasoner);
        assert_eq!(breaker.preflight(Provider::Reasoner), BreakerDecision::Allow);
        assert_eq!(breaker.snapshot(Provider::Reasoner).state, CircuitState::Closed);
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = breaker(0);
        for _ in 0..5 {
            breaker.record_failure(Provider::Technical);
        }
        assert_eq!(breaker.preflight(Provider::Technical), BreakerDecision::Probe);
        breaker.record_failure(Provider::Technical);
        assert_eq!(breaker.snapshot(Provider::Technical).state, CircuitState::Open);
    }

    #[test]
    fn snapshot_reports_probe_window() {
        let breaker = breaker(30_000);
        for _ in 0..5 {
            breaker.record_failure(Provider::Reasoner);
        }
        let snap = breaker.snapshot(Provider::Reasoner);
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.seconds_until_probe > 29.0 && snap.seconds_until_probe <= 30.0);
    }
}
