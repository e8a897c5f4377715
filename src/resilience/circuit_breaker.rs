//! Circuit breaker registry: one breaker per named external service (model
//! provider, email carrier, SMS carrier, lead marketplace, webhook
//! destinations, database, IMAP).
//!
//! The single-breaker state machine and lock-free atomic counters follow
//! the `CircuitBreaker` used for SQLite lock contention in
//! `Dicklesworthstone-mcp_agent_mail_rust`'s `retry.rs`,
//! generalized here from a single global breaker to a registry keyed by
//! service name, with a `half_open` probe-admission count (`successThreshold`)
//! rather than a single-probe half-open, and a sliding failure window instead
//! of a bare consecutive-failure counter.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub per_call_timeout: Duration,
    pub monitoring_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            per_call_timeout: Duration::from_secs(15),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

/// Rejection raised when a breaker is open; carries the service name so
/// callers can map it onto `OverlordError::BreakerOpen`.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker open for {service}, resets in {remaining_secs:.1}s")]
pub struct BreakerOpenError {
    pub service: String,
    pub remaining_secs: f64,
}

/// Single-service breaker. Lock-free reads via atomics; failures within
/// `monitoring_window` count toward `failure_threshold`, older failures age
/// out by resetting the window start.
struct Breaker {
    config: BreakerConfig,
    epoch: Instant,
    window_start_us: AtomicU64,
    failures_in_window: AtomicU32,
    half_open_successes: AtomicU32,
    half_open_inflight: AtomicU32,
    open_until_us: AtomicU64,
}

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            window_start_us: AtomicU64::new(0),
            failures_in_window: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_inflight: AtomicU32::new(0),
            open_until_us: AtomicU64::new(0),
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros().min(u64::MAX as u128) as u64
    }

    fn state(&self) -> CircuitState {
        let open_until = self.open_until_us.load(Ordering::Acquire);
        let now = self.now_us();
        if open_until > 0 {
            if now < open_until {
                return CircuitState::Open;
            }
            return CircuitState::HalfOpen;
        }
        CircuitState::Closed
    }

    /// Admits a call, returning whether it was let through as a half-open
    /// probe (and so must release that slot via [`Self::release_probe`] once
    /// the call finishes). Half-open admits exactly one in-flight probe at a
    /// time, so a burst of concurrent callers doesn't all hit the
    /// recovering service at once; every other caller sees the same
    /// rejection an open breaker would give them.
    fn check(&self, service: &str) -> Result<bool, BreakerOpenError> {
        match self.state() {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen => {
                if self.half_open_inflight.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    Ok(true)
                } else {
                    Err(BreakerOpenError { service: service.to_string(), remaining_secs: 0.0 })
                }
            }
            CircuitState::Open => {
                let open_until = self.open_until_us.load(Ordering::Acquire);
                let now = self.now_us();
                let remaining_secs = (open_until.saturating_sub(now)) as f64 / 1_000_000.0;
                Err(BreakerOpenError { service: service.to_string(), remaining_secs })
            }
        }
    }

    fn release_probe(&self, held_probe: bool) {
        if held_probe {
            self.half_open_inflight.store(0, Ordering::Release);
        }
    }

    fn record_success(&self, held_probe: bool) {
        if held_probe {
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.close();
            }
        } else {
            self.failures_in_window.store(0, Ordering::Release);
        }
    }

    fn record_failure(&self, held_probe: bool) {
        if held_probe {
            self.open();
            return;
        }

        let now = self.now_us();
        let window_start = self.window_start_us.load(Ordering::Acquire);
        let window_us = self.config.monitoring_window.as_micros() as u64;
        if window_start == 0 || now.saturating_sub(window_start) > window_us {
            self.window_start_us.store(now, Ordering::Release);
            self.failures_in_window.store(1, Ordering::Release);
        } else {
            let count = self.failures_in_window.fetch_add(1, Ordering::AcqRel) + 1;
            if count >= self.config.failure_threshold {
                self.open();
            }
        }
    }

    fn open(&self) {
        let reset_us = self.config.recovery_timeout.as_micros() as u64;
        self.open_until_us.store(self.now_us() + reset_us, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_inflight.store(0, Ordering::Release);
    }

    fn close(&self) {
        self.open_until_us.store(0, Ordering::Release);
        self.failures_in_window.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_inflight.store(0, Ordering::Release);
    }
}

/// Registry of named breakers, shared across worker tasks via `Arc`. When a
/// shared store is configured, state could additionally be persisted to
/// `CircuitBreakerState` rows so multiple processes observe the same trip
/// decision; the in-process atomics are the fail-open-locally fallback when
/// the store itself is unreachable.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<Breaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn breaker_for(&self, service: &str, config: &BreakerConfig) -> Arc<Breaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(config.clone())))
            .clone()
    }

    pub fn state_of(&self, service: &str) -> CircuitState {
        self.breakers
            .get(service)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Run `call` guarded by `service`'s breaker. Rejects immediately
    /// without invoking `call` when the breaker is open.
    pub async fn guard<F, Fut, T, E>(
        &self,
        service: &str,
        config: &BreakerConfig,
        call: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker_for(service, config);
        let held_probe = breaker.check(service).map_err(GuardError::Open)?;

        let result = match tokio::time::timeout(config.per_call_timeout, call()).await {
            Ok(Ok(value)) => {
                breaker.record_success(held_probe);
                Ok(value)
            }
            Ok(Err(err)) => {
                breaker.record_failure(held_probe);
                Err(GuardError::Call(err))
            }
            Err(_) => {
                breaker.record_failure(held_probe);
                Err(GuardError::Timeout)
            }
        };
        breaker.release_probe(held_probe);
        result
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    #[error(transparent)]
    Open(#[from] BreakerOpenError),
    #[error("call exceeded per-call timeout")]
    Timeout,
    #[error(transparent)]
    Call(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let registry = CircuitBreakerRegistry::new();
        let config = BreakerConfig { failure_threshold: 2, ..Default::default() };

        for _ in 0..2 {
            let result: Result<(), GuardError<&str>> = registry
                .guard("model-provider", &config, || async { Err("boom") })
                .await;
            assert!(matches!(result, Err(GuardError::Call(_))));
        }

        assert_eq!(registry.state_of("model-provider"), CircuitState::Open);

        let result: Result<(), GuardError<&str>> = registry
            .guard("model-provider", &config, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(GuardError::Open(_))));
    }

    #[tokio::test]
    async fn half_open_needs_success_threshold_consecutive_successes() {
        let registry = CircuitBreakerRegistry::new();
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(1),
            success_threshold: 2,
            ..Default::default()
        };

        let _: Result<(), GuardError<&str>> =
            registry.guard("carrier", &config, || async { Err("fail") }).await;
        assert_eq!(registry.state_of("carrier"), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.state_of("carrier"), CircuitState::HalfOpen);

        let _: Result<(), GuardError<&str>> =
            registry.guard("carrier", &config, || async { Ok(()) }).await;
        assert_eq!(registry.state_of("carrier"), CircuitState::HalfOpen);

        let _: Result<(), GuardError<&str>> =
            registry.guard("carrier", &config, || async { Ok(()) }).await;
        assert_eq!(registry.state_of("carrier"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_only_one_concurrent_probe() {
        let registry = CircuitBreakerRegistry::new();
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(1),
            success_threshold: 10,
            per_call_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let _: Result<(), GuardError<&str>> =
            registry.guard("carrier", &config, || async { Err("fail") }).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.state_of("carrier"), CircuitState::HalfOpen);

        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let registry_a = registry.clone();
        let config_a = config.clone();
        let gate_a = gate.clone();
        let probe = tokio::spawn(async move {
            registry_a
                .guard::<_, _, (), &str>("carrier", &config_a, || async move {
                    gate_a.wait().await;
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
                .await
        });

        gate.wait().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let rejected: Result<(), GuardError<&str>> =
            registry.guard("carrier", &config, || async { Ok(()) }).await;
        assert!(
            matches!(rejected, Err(GuardError::Open(_))),
            "a second concurrent half-open caller must be rejected while a probe is in flight"
        );

        let probe_result = probe.await.unwrap();
        assert!(probe_result.is_ok());
        assert_eq!(registry.state_of("carrier"), CircuitState::HalfOpen, "one success below success_threshold stays half-open");

        let admitted: Result<(), GuardError<&str>> =
            registry.guard("carrier", &config, || async { Ok(()) }).await;
        assert!(admitted.is_ok(), "once the in-flight probe completes, the slot is released for the next caller");
    }
}
