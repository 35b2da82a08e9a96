//! Circuit breaker for a single named dependency.
//!
//! A circuit breaker tracks the outcomes of calls to a dependency and rejects
//! calls outright while the dependency looks unhealthy, giving it time to
//! recover.
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through and outcomes are counted
//! - **Open**: the trip policy fired, calls are rejected until `timeout` passes
//! - **HalfOpen**: a bounded number of probe calls test whether the dependency recovered
//!
//! # Permits
//!
//! [`CircuitBreaker::try_acquire`] hands out a [`CallPermit`] that must be
//! settled with the call's outcome. Each permit remembers the breaker
//! generation it was issued under; a result that arrives after the breaker
//! has since changed state is dropped instead of being counted against the
//! new state. Dropping a permit without settling it (a cancelled call) frees
//! its probe slot and changes no counters.
//!
//! # Example
//!
//! ```no_run
//! use relay_resilience::breaker::{CircuitBreaker, CircuitBreakerConfig, TripPolicy};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     "billing",
//!     CircuitBreakerConfig {
//!         trip: TripPolicy::Consecutive { failure_threshold: 5 },
//!         timeout: Duration::from_secs(30),
//!         ..Default::default()
//!     },
//! );
//!
//! match breaker.try_acquire() {
//!     Ok(permit) => {
//!         let healthy = true; // outcome of the real call
//!         permit.record(healthy);
//!     }
//!     Err(open) => eprintln!("rejected: {}", open),
//! }
//! ```

use parking_lot::{Mutex, RwLock};
use relay_core::{BreakerSettings, TripSettings};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::observer::StateChangeObserver;

pub const DEFAULT_FAILURE_RATIO: f64 = 0.5;
pub const DEFAULT_MIN_REQUESTS: u32 = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Too many failures, calls are rejected
    Open,
    /// Testing if the dependency has recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding used by the state gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides when a closed breaker opens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripPolicy {
    /// Open after this many failures with no success in between.
    Consecutive { failure_threshold: u32 },
    /// Open when failures make up at least `failure_ratio` of the last
    /// `min_requests` outcomes. Evaluated when a failure is recorded.
    Ratio { failure_ratio: f64, min_requests: u32 },
}

impl Default for TripPolicy {
    fn default() -> Self {
        Self::Ratio {
            failure_ratio: DEFAULT_FAILURE_RATIO,
            min_requests: DEFAULT_MIN_REQUESTS,
        }
    }
}

impl TripPolicy {
    fn normalized(self) -> Self {
        match self {
            Self::Consecutive { failure_threshold } => Self::Consecutive {
                failure_threshold: failure_threshold.max(1),
            },
            Self::Ratio {
                failure_ratio,
                min_requests,
            } => Self::Ratio {
                failure_ratio: if failure_ratio > 0.0 && failure_ratio <= 1.0 {
                    failure_ratio
                } else {
                    DEFAULT_FAILURE_RATIO
                },
                min_requests: if min_requests == 0 {
                    DEFAULT_MIN_REQUESTS
                } else {
                    min_requests
                },
            },
        }
    }
}

impl From<TripSettings> for TripPolicy {
    fn from(settings: TripSettings) -> Self {
        match settings {
            TripSettings::Consecutive { failure_threshold } => {
                Self::Consecutive { failure_threshold }
            }
            TripSettings::Ratio {
                failure_ratio,
                min_requests,
            } => Self::Ratio {
                failure_ratio,
                min_requests,
            },
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub trip: TripPolicy,
    /// Successes needed in half-open state to close the circuit
    pub success_threshold: u32,
    /// Time to stay open before a probe is allowed
    pub timeout: Duration,
    /// Probes allowed in flight at once while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            trip: TripPolicy::default(),
            success_threshold: 1,
            timeout: DEFAULT_TIMEOUT,
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Replace zero or out-of-range values with their defaults.
    pub fn normalized(self) -> Self {
        Self {
            trip: self.trip.normalized(),
            success_threshold: self.success_threshold.max(1),
            timeout: if self.timeout.is_zero() {
                DEFAULT_TIMEOUT
            } else {
                self.timeout
            },
            half_open_max_probes: self.half_open_max_probes.max(1),
        }
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            trip: settings.trip.into(),
            success_threshold: settings.success_threshold,
            timeout: settings.timeout(),
            half_open_max_probes: settings.half_open_max_probes,
        }
        .normalized()
    }
}

/// Rejection returned while the breaker refuses calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker open for {name}")]
pub struct BreakerOpen {
    pub name: String,
    /// Remaining cool-down when rejected from the open state.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Default)]
struct BreakerMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    opened_count: AtomicU64,
    closed_count: AtomicU64,
    stale_dropped: AtomicU64,
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CircuitBreakerStats {
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub opened_count: u64,
    pub closed_count: u64,
    pub stale_dropped: u64,
}

/// Point-in-time view of a breaker, for health endpoints and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub in_flight_probes: u32,
    pub open_remaining_ms: Option<u64>,
    pub stats: CircuitBreakerStats,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Recent outcomes in closed state for the ratio policy; `true` is a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    in_flight_probes: u32,
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            window: VecDeque::new(),
            opened_at: None,
            in_flight_probes: 0,
            generation: 0,
        }
    }

    fn push_outcome(&mut self, failed: bool, capacity: u32) {
        if self.window.len() >= capacity as usize {
            if let Some(true) = self.window.pop_front() {
                self.failure_count = self.failure_count.saturating_sub(1);
            }
        }
        self.window.push_back(failed);
        if failed {
            self.failure_count += 1;
        }
    }

    fn clear_counters(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.window.clear();
        self.in_flight_probes = 0;
    }
}

struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    metrics: BreakerMetrics,
    observers: RwLock<Vec<Arc<dyn StateChangeObserver>>>,
}

impl Shared {
    fn transition(&self, st: &mut BreakerState, to: CircuitState) {
        let from = st.state;
        if from == to {
            return;
        }

        st.state = to;
        st.clear_counters();
        st.generation = st.generation.wrapping_add(1);
        st.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };

        match to {
            CircuitState::Open => {
                self.metrics.opened_count.fetch_add(1, Ordering::Relaxed);
                warn!(breaker = %self.name, %from, %to, "Circuit breaker opened");
            }
            CircuitState::Closed => {
                self.metrics.closed_count.fetch_add(1, Ordering::Relaxed);
                info!(breaker = %self.name, %from, %to, "Circuit breaker closed");
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, %from, %to, "Circuit breaker half-open, probing");
            }
        }

        for observer in self.observers.read().iter() {
            observer.on_state_change(&self.name, from, to);
        }
    }

    fn on_success(&self, st: &mut BreakerState) {
        self.metrics.successes.fetch_add(1, Ordering::Relaxed);

        match st.state {
            CircuitState::Closed => match self.config.trip {
                TripPolicy::Consecutive { .. } => st.failure_count = 0,
                TripPolicy::Ratio { min_requests, .. } => st.push_outcome(false, min_requests),
            },
            CircuitState::HalfOpen => {
                st.success_count += 1;
                if st.success_count >= self.config.success_threshold {
                    self.transition(st, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                warn!(breaker = %self.name, "Success recorded while open, closing circuit");
                self.transition(st, CircuitState::Closed);
            }
        }
    }

    fn on_failure(&self, st: &mut BreakerState) {
        self.metrics.failures.fetch_add(1, Ordering::Relaxed);

        match st.state {
            CircuitState::Closed => {
                let trip = match self.config.trip {
                    TripPolicy::Consecutive { failure_threshold } => {
                        st.failure_count += 1;
                        st.failure_count >= failure_threshold
                    }
                    TripPolicy::Ratio {
                        failure_ratio,
                        min_requests,
                    } => {
                        st.push_outcome(true, min_requests);
                        st.window.len() >= min_requests as usize
                            && f64::from(st.failure_count) / st.window.len() as f64
                                >= failure_ratio
                    }
                };
                if trip {
                    self.transition(st, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(st, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn settle(&self, generation: u64, probe: bool, success: bool) {
        let mut st = self.state.lock();
        if st.generation != generation {
            self.metrics.stale_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(breaker = %self.name, success, "Dropping result from a previous breaker state");
            return;
        }
        if probe {
            st.in_flight_probes = st.in_flight_probes.saturating_sub(1);
        }
        if success {
            self.on_success(&mut st);
        } else {
            self.on_failure(&mut st);
        }
    }

    fn release(&self, generation: u64) {
        let mut st = self.state.lock();
        if st.generation == generation {
            st.in_flight_probes = st.in_flight_probes.saturating_sub(1);
        }
    }

    fn reject(&self, retry_after: Option<Duration>) -> BreakerOpen {
        self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
        debug!(breaker = %self.name, ?retry_after, "Circuit breaker rejected call");
        BreakerOpen {
            name: self.name.clone(),
            retry_after,
        }
    }
}

/// Circuit breaker for one dependency.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker. Invalid config values fall back to defaults.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        let config = config.normalized();
        info!(breaker = %name, ?config, "Creating circuit breaker");

        Self {
            shared: Arc::new(Shared {
                name,
                config,
                state: Mutex::new(BreakerState::new()),
                metrics: BreakerMetrics::default(),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn with_observer(self, observer: impl StateChangeObserver + 'static) -> Self {
        self.add_observer(Arc::new(observer));
        self
    }

    pub fn add_observer(&self, observer: Arc<dyn StateChangeObserver>) {
        self.shared.observers.write().push(observer);
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> CircuitState {
        self.shared.state.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Whether a call would be admitted right now. Changes no state and
    /// claims no probe slot.
    pub fn allow_request(&self) -> bool {
        let st = self.shared.state.lock();
        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => st
                .opened_at
                .map_or(true, |at| at.elapsed() > self.shared.config.timeout),
            CircuitState::HalfOpen => st.in_flight_probes < self.shared.config.half_open_max_probes,
        }
    }

    /// Ask to make a call.
    ///
    /// In the open state the cool-down check and the move to half-open happen
    /// under one lock, so exactly one caller wins the first probe.
    pub fn try_acquire(&self) -> Result<CallPermit, BreakerOpen> {
        let mut st = self.shared.state.lock();

        match st.state {
            CircuitState::Closed => Ok(self.permit(st.generation, false)),
            CircuitState::Open => {
                let elapsed = st.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                if elapsed > self.shared.config.timeout {
                    self.shared.transition(&mut st, CircuitState::HalfOpen);
                    st.in_flight_probes = 1;
                    Ok(self.permit(st.generation, true))
                } else {
                    Err(self
                        .shared
                        .reject(Some(self.shared.config.timeout - elapsed)))
                }
            }
            CircuitState::HalfOpen => {
                if st.in_flight_probes < self.shared.config.half_open_max_probes {
                    st.in_flight_probes += 1;
                    Ok(self.permit(st.generation, true))
                } else {
                    Err(self.shared.reject(None))
                }
            }
        }
    }

    fn permit(&self, generation: u64, probe: bool) -> CallPermit {
        CallPermit {
            shared: self.shared.clone(),
            generation,
            probe,
            settled: false,
        }
    }

    /// Record a success against the current state.
    pub fn record_success(&self) {
        let mut st = self.shared.state.lock();
        self.shared.on_success(&mut st);
    }

    /// Record a failure against the current state.
    pub fn record_failure(&self) {
        let mut st = self.shared.state.lock();
        self.shared.on_failure(&mut st);
    }

    /// Force the breaker closed. Results of calls admitted earlier are dropped.
    pub fn reset(&self) {
        let mut st = self.shared.state.lock();
        info!(breaker = %self.shared.name, "Manually resetting circuit breaker");
        if st.state == CircuitState::Closed {
            st.clear_counters();
            st.generation = st.generation.wrapping_add(1);
        } else {
            self.shared.transition(&mut st, CircuitState::Closed);
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let m = &self.shared.metrics;
        CircuitBreakerStats {
            successes: m.successes.load(Ordering::Relaxed),
            failures: m.failures.load(Ordering::Relaxed),
            rejections: m.rejections.load(Ordering::Relaxed),
            opened_count: m.opened_count.load(Ordering::Relaxed),
            closed_count: m.closed_count.load(Ordering::Relaxed),
            stale_dropped: m.stale_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let st = self.shared.state.lock();
        let open_remaining_ms = match (st.state, st.opened_at) {
            (CircuitState::Open, Some(at)) => Some(
                self.shared
                    .config
                    .timeout
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };

        BreakerSnapshot {
            name: self.shared.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            in_flight_probes: st.in_flight_probes,
            open_remaining_ms,
            stats: self.stats(),
        }
    }
}

/// Admission to make one call through a breaker.
///
/// Settle it with [`record`](Self::record) once the outcome is known. Dropping
/// it unsettled releases any probe slot it holds and counts nothing.
#[must_use = "an unsettled permit records nothing"]
pub struct CallPermit {
    shared: Arc<Shared>,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("breaker", &self.shared.name)
            .field("generation", &self.generation)
            .field("probe", &self.probe)
            .finish()
    }
}

impl CallPermit {
    /// Whether this permit holds a half-open probe slot.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(mut self, success: bool) {
        self.settled = true;
        self.shared.settle(self.generation, self.probe, success);
    }

    pub fn record_success(self) {
        self.record(true);
    }

    pub fn record_failure(self) {
        self.record(false);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.shared.release(self.generation);
        }
    }
}
