//! State-change hooks for circuit breakers.
//!
//! Observers run synchronously while the breaker's lock is held. They should
//! do little more than emit a metric or a log line, and must never call back
//! into the breaker that notified them.

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

use crate::breaker::CircuitState;

pub const BREAKER_STATE_GAUGE: &str = "relay_circuit_breaker_state";
pub const BREAKER_TRANSITIONS_COUNTER: &str = "relay_circuit_breaker_transitions_total";

pub trait StateChangeObserver: Send + Sync {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState);
}

impl<F> StateChangeObserver for F
where
    F: Fn(&str, CircuitState, CircuitState) + Send + Sync,
{
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        self(name, from, to)
    }
}

/// Publishes breaker state through the `metrics` facade.
///
/// The state gauge reads 0 for closed, 1 for half-open and 2 for open.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver;

impl StateChangeObserver for MetricsObserver {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        gauge!(BREAKER_STATE_GAUGE, "dependency" => name.to_string()).set(to.gauge_value());
        counter!(
            BREAKER_TRANSITIONS_COUNTER,
            "dependency" => name.to_string(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_gauge!(
        BREAKER_STATE_GAUGE,
        Unit::Count,
        "Circuit breaker state per dependency (0 closed, 1 half-open, 2 open)"
    );
    describe_counter!(
        BREAKER_TRANSITIONS_COUNTER,
        Unit::Count,
        "Total number of circuit breaker state transitions"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_closure_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = move |name: &str, from: CircuitState, to: CircuitState| {
            sink.lock().push((name.to_string(), from, to));
        };

        observer.on_state_change("billing", CircuitState::Closed, CircuitState::Open);

        assert_eq!(
            seen.lock().as_slice(),
            &[(
                "billing".to_string(),
                CircuitState::Closed,
                CircuitState::Open
            )]
        );
    }

    #[test]
    fn test_metrics_observer_without_recorder() {
        // With no recorder installed the macros are no-ops.
        describe_metrics();
        MetricsObserver.on_state_change("billing", CircuitState::Open, CircuitState::HalfOpen);
    }
}
