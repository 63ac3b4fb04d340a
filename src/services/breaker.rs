//! Circuit breaker registry.
//!
//! Each remote resource gets a three-state breaker: `closed` counts failures
//! inside a rolling window, `open` rejects every call until the cooldown
//! lapses, `half_open` admits a bounded number of probes. The registry maps
//! resource keys to breakers, creating unknown keys lazily.

use crate::services::{Notifier, SqliteStore};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Breakers that exist from startup; everything else is created on first
/// reference.
pub const NAMED_BREAKERS: &[&str] = &["exchange_api", "trade_execution", "risk_threshold"];

#[derive(Debug, Error)]
#[error("circuit breaker {resource} is open, retry after {retry_after_secs}s")]
pub struct BreakerRejected {
    pub resource: String,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub probe_limit: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            probe_limit: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// Point-in-time breaker status for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub resource: String,
    pub state: BreakerState,
    pub failures: u32,
    pub retry_after_secs: Option<u64>,
}

pub struct CircuitBreaker {
    resource: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    fn new(resource: String, config: BreakerConfig) -> Self {
        Self {
            resource,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                window_start: None,
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    /// Gate an invocation. `Ok` admits the call (and reserves a probe slot
    /// while half-open); `Err` carries the remaining cooldown.
    pub fn try_acquire(&self) -> Result<(), BreakerRejected> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_in_flight = 1;
                    info!(resource = %self.resource, "breaker half-open, admitting probe");
                    Ok(())
                } else {
                    let remaining = self.config.cooldown - elapsed;
                    Err(BreakerRejected {
                        resource: self.resource.clone(),
                        retry_after_secs: remaining.as_secs().max(1),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.config.probe_limit {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(BreakerRejected {
                        resource: self.resource.clone(),
                        retry_after_secs: 1,
                    })
                }
            }
        }
    }

    /// Record a successful call. A half-open success closes the breaker and
    /// resets counters. Returns true when the state changed.
    pub fn record_success(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                inner.window_start = None;
                inner.opened_at = None;
                inner.probes_in_flight = 0;
                info!(resource = %self.resource, "breaker closed after successful probe");
                true
            }
            _ => false,
        }
    }

    /// Hand back a probe slot reserved by `try_acquire` whose call never
    /// ran, e.g. when a later gate rejected the request. Without this a
    /// half-open breaker would sit at its probe limit forever.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen && inner.probes_in_flight > 0 {
            inner.probes_in_flight -= 1;
        }
    }

    /// Record a failed call. Returns true when the breaker tripped open.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probes_in_flight = 0;
                warn!(resource = %self.resource, "probe failed, breaker re-opened");
                true
            }
            BreakerState::Closed => {
                let now = Instant::now();
                let window_expired = inner
                    .window_start
                    .map(|s| now.duration_since(s) > self.config.failure_window)
                    .unwrap_or(true);
                if window_expired {
                    inner.window_start = Some(now);
                    inner.failures = 1;
                } else {
                    inner.failures += 1;
                }
                if inner.failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        resource = %self.resource,
                        failures = inner.failures,
                        "failure threshold reached, breaker opened"
                    );
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => false,
        }
    }

    /// Force the breaker open, e.g. on stale data during order submission.
    pub fn trip(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probes_in_flight = 0;
        warn!(resource = %self.resource, "breaker tripped");
    }

    /// Manual reset (admin scope enforced by the caller).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.window_start = None;
        inner.opened_at = None;
        inner.probes_in_flight = 0;
        info!(resource = %self.resource, "breaker manually reset");
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().unwrap();
        let retry_after_secs = match inner.state {
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Some(self.config.cooldown.saturating_sub(elapsed).as_secs())
            }
            _ => None,
        };
        BreakerStatus {
            resource: self.resource.clone(),
            state: inner.state,
            failures: inner.failures,
            retry_after_secs,
        }
    }
}

/// Process-wide registry of breakers keyed by resource.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
    store: Option<Arc<SqliteStore>>,
    notifier: Option<Arc<Notifier>>,
}

impl BreakerRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_config(BreakerConfig::default())
    }

    pub fn with_config(default_config: BreakerConfig) -> Arc<Self> {
        let registry = Arc::new(Self {
            breakers: DashMap::new(),
            default_config,
            store: None,
            notifier: None,
        });
        for name in NAMED_BREAKERS {
            registry.get_or_create(name);
        }
        registry
    }

    /// Registry wired for audit records and notifications on trips/resets.
    pub fn with_observers(
        default_config: BreakerConfig,
        store: Arc<SqliteStore>,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            breakers: DashMap::new(),
            default_config,
            store: Some(store),
            notifier: Some(notifier),
        });
        for name in NAMED_BREAKERS {
            registry.get_or_create(name);
        }
        registry
    }

    pub fn get_or_create(&self, resource: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    resource.to_string(),
                    self.default_config.clone(),
                ))
            })
            .clone()
    }

    /// Gate a call through the named breaker.
    pub fn try_acquire(&self, resource: &str) -> Result<(), BreakerRejected> {
        self.get_or_create(resource).try_acquire()
    }

    pub fn record_success(&self, resource: &str) {
        self.get_or_create(resource).record_success();
    }

    /// Hand back an unused probe reservation on the named breaker.
    pub fn release_probe(&self, resource: &str) {
        self.get_or_create(resource).release_probe();
    }

    pub fn record_failure(&self, resource: &str) {
        let tripped = self.get_or_create(resource).record_failure();
        if tripped {
            self.observe_transition(resource, "opened");
        }
    }

    pub fn trip(&self, resource: &str) {
        self.get_or_create(resource).trip();
        self.observe_transition(resource, "tripped");
    }

    /// Admin-scoped manual reset.
    pub fn reset(&self, resource: &str) -> bool {
        match self.breakers.get(resource) {
            Some(breaker) => {
                breaker.reset();
                self.observe_transition(resource, "reset");
                true
            }
            None => false,
        }
    }

    pub fn state(&self, resource: &str) -> BreakerState {
        self.get_or_create(resource).state()
    }

    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> =
            self.breakers.iter().map(|b| b.value().status()).collect();
        statuses.sort_by(|a, b| a.resource.cmp(&b.resource));
        statuses
    }

    fn observe_transition(&self, resource: &str, what: &str) {
        if let Some(ref store) = self.store {
            let _ = store.append_audit(
                "breaker",
                None,
                &format!("{resource} {what}"),
            );
        }
        if let Some(ref notifier) = self.notifier {
            notifier.system_broadcast("circuit breaker", &format!("breaker {resource} {what}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(50),
            probe_limit: 1,
        }
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new("exchange_api".to_string(), fast_config());
        for _ in 0..4 {
            assert!(!breaker.record_failure());
            assert!(breaker.try_acquire().is_ok());
        }
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);

        let rejected = breaker.try_acquire().unwrap_err();
        assert_eq!(rejected.resource, "exchange_api");
        assert!(rejected.retry_after_secs >= 1);
    }

    #[test]
    fn test_half_open_probe_then_close() {
        let breaker = CircuitBreaker::new("x".to_string(), fast_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        // One probe is admitted, the next caller is rejected.
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        assert!(breaker.record_success());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("x".to_string(), fast_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire().is_ok());

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_release_probe_frees_half_open_slot() {
        let breaker = CircuitBreaker::new("x".to_string(), fast_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        // The probe slot is reserved, then handed back without a call.
        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_err());
        breaker.release_probe();

        // The slot is available again, and the breaker still heals.
        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.record_success());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_release_probe_is_noop_when_closed() {
        let breaker = CircuitBreaker::new("x".to_string(), fast_config());
        breaker.release_probe();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_manual_trip_and_reset() {
        let breaker = CircuitBreaker::new("x".to_string(), fast_config());
        breaker.trip();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_registry_named_breakers_exist() {
        let registry = BreakerRegistry::new();
        let snapshot = registry.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|s| s.resource.as_str()).collect();
        for expected in NAMED_BREAKERS {
            assert!(names.contains(expected), "missing breaker {expected}");
        }
    }

    #[test]
    fn test_registry_lazy_creation() {
        let registry = BreakerRegistry::new();
        assert_eq!(registry.state("source:crypto_feed"), BreakerState::Closed);
        assert!(registry
            .snapshot()
            .iter()
            .any(|s| s.resource == "source:crypto_feed"));
    }

    #[test]
    fn test_registry_reset_unknown_is_false() {
        let registry = BreakerRegistry::new();
        assert!(!registry.reset("never-created"));
        assert!(registry.reset("exchange_api"));
    }
}
