//! Named breakers for one process.
//!
//! A [`BreakerRegistry`] is an ordinary owned value: the component that builds
//! outbound clients creates one at startup, hands its breakers to the clients
//! and queries it for health snapshots. Nothing here is global.

use dashmap::DashMap;
use relay_core::ResilienceConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::grpc::GrpcResilience;
use crate::http::ResilientHttpClient;
use crate::observer::StateChangeObserver;
use crate::retry::RetryPolicy;

pub struct BreakerRegistry {
    config: ResilienceConfig,
    breakers: DashMap<String, CircuitBreaker>,
    observers: Vec<Arc<dyn StateChangeObserver>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl BreakerRegistry {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            observers: Vec::new(),
        }
    }

    /// Attach `observer` to every breaker this registry creates from now on.
    pub fn with_observer(mut self, observer: impl StateChangeObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// The breaker for `name`, created from its configured policy on first use.
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(name) {
            return existing.value().clone();
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let policy = self.config.policy_for(name);
                let breaker =
                    CircuitBreaker::new(name, CircuitBreakerConfig::from(&policy.breaker));
                for observer in &self.observers {
                    breaker.add_observer(observer.clone());
                }
                debug!(breaker = %name, "Registered circuit breaker");
                breaker
            })
            .value()
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    /// Track a breaker built elsewhere. Replaces any breaker with the same name.
    pub fn register(&self, breaker: CircuitBreaker) {
        self.breakers.insert(breaker.name().to_string(), breaker);
    }

    pub fn retry_policy(&self, name: &str) -> RetryPolicy {
        RetryPolicy::from(&self.config.policy_for(name).retry)
    }

    /// The breaker for `name` if its policy enables one.
    fn breaker_for(&self, name: &str) -> Option<CircuitBreaker> {
        self.config
            .policy_for(name)
            .breaker
            .enabled
            .then(|| self.get_or_create(name))
    }

    pub fn http_client(&self, client: reqwest::Client, name: &str) -> ResilientHttpClient {
        ResilientHttpClient::new(client, self.retry_policy(name), self.breaker_for(name))
    }

    pub fn grpc(&self, name: &str) -> GrpcResilience {
        GrpcResilience::new(self.retry_policy(name), self.breaker_for(name))
    }

    /// Snapshots of every tracked breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::TripPolicy;
    use crate::observer::MetricsObserver;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use relay_core::{DependencyPolicy, TripSettings};

    fn config() -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        let mut billing = DependencyPolicy::default();
        billing.breaker.trip = TripSettings::Consecutive {
            failure_threshold: 2,
        };
        billing.retry.max_retries = 1;
        config.dependencies.insert("billing".to_string(), billing);

        let mut audit = DependencyPolicy::default();
        audit.breaker.enabled = false;
        config.dependencies.insert("audit".to_string(), audit);
        config
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let registry = BreakerRegistry::new(config());

        let first = registry.get_or_create("billing");
        first.record_failure();
        let second = registry.get_or_create("billing");

        assert_eq!(second.snapshot().failure_count, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("tenants").is_none());
    }

    #[test]
    fn test_overrides_apply() {
        let registry = BreakerRegistry::new(config());

        let billing = registry.get_or_create("billing");
        assert_eq!(
            billing.config().trip,
            TripPolicy::Consecutive {
                failure_threshold: 2
            }
        );
        assert_eq!(registry.retry_policy("billing").max_attempts(), 2);

        let tenants = registry.get_or_create("tenants");
        assert_eq!(tenants.config().trip, TripPolicy::default());
        assert_eq!(registry.retry_policy("tenants").max_attempts(), 4);
    }

    #[test]
    fn test_disabled_breaker_not_attached() {
        let registry = BreakerRegistry::new(config());

        assert!(registry.grpc("audit").breaker().is_none());
        assert!(registry
            .http_client(reqwest::Client::new(), "audit")
            .breaker()
            .is_none());
        assert!(registry.grpc("billing").breaker().is_some());
        assert!(registry.get("audit").is_none());
    }

    #[test]
    fn test_clients_share_registry_breaker() {
        let registry = BreakerRegistry::new(config());

        let grpc = registry.grpc("billing");
        let http = registry.http_client(reqwest::Client::new(), "billing");
        grpc.breaker().unwrap().record_failure();
        grpc.breaker().unwrap().record_failure();

        assert!(http.breaker().unwrap().is_open());
        assert_eq!(registry.states()["billing"], CircuitState::Open);
    }

    #[test]
    fn test_observers_attached_to_created_breakers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let registry = BreakerRegistry::new(config())
            .with_observer(MetricsObserver)
            .with_observer(move |name: &str, _: CircuitState, to: CircuitState| {
                sink.lock().push((name.to_string(), to));
            });

        let billing = registry.get_or_create("billing");
        billing.record_failure();
        billing.record_failure();

        assert_eq!(
            seen.lock().as_slice(),
            &[("billing".to_string(), CircuitState::Open)]
        );
    }

    #[test]
    fn test_snapshot_sorted_and_reset_all() {
        let registry = BreakerRegistry::new(config());
        registry.get_or_create("tenants");
        registry.get_or_create("billing");
        registry.register(CircuitBreaker::new(
            "analytics",
            CircuitBreakerConfig::default(),
        ));

        let billing = registry.get("billing").unwrap();
        billing.record_failure();
        billing.record_failure();

        let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["analytics", "billing", "tenants"]);

        registry.reset_all();
        assert!(registry
            .states()
            .values()
            .all(|state| *state == CircuitState::Closed));
    }
}
