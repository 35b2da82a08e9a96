use config::{Config as ConfigLoader, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{CoreError, Result};

/// Prefix for environment overrides, e.g. `RELAY__DEFAULTS__RETRY__MAX_RETRIES=5`.
pub const ENV_PREFIX: &str = "RELAY";

/// Separator between nested keys in environment overrides.
pub const ENV_SEPARATOR: &str = "__";

// ===== Retry Configuration =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_retry_delays"))]
pub struct RetrySettings {
    /// Retries after the first attempt. Negative values are treated as zero.
    pub max_retries: i32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[validate(range(min = 1.0))]
    pub multiplier: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn validate_retry_delays(settings: &RetrySettings) -> std::result::Result<(), ValidationError> {
    if settings.max_delay_ms < settings.base_delay_ms {
        let mut err = ValidationError::new("max_delay_below_base_delay");
        err.message = Some("max_delay_ms must be >= base_delay_ms".into());
        return Err(err);
    }
    Ok(())
}

// ===== Circuit Breaker Configuration =====

/// How a closed breaker decides to trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TripSettings {
    /// Trip after `failure_threshold` failures with no success in between.
    Consecutive { failure_threshold: u32 },
    /// Trip when failures make up at least `failure_ratio` of the last
    /// `min_requests` outcomes.
    Ratio { failure_ratio: f64, min_requests: u32 },
}

impl Default for TripSettings {
    fn default() -> Self {
        Self::Ratio {
            failure_ratio: 0.5,
            min_requests: 10,
        }
    }
}

fn validate_trip(trip: &TripSettings) -> std::result::Result<(), ValidationError> {
    match *trip {
        TripSettings::Consecutive { failure_threshold } if failure_threshold == 0 => {
            Err(ValidationError::new("failure_threshold_zero"))
        }
        TripSettings::Ratio { failure_ratio, .. }
            if !(failure_ratio > 0.0 && failure_ratio <= 1.0) =>
        {
            Err(ValidationError::new("failure_ratio_out_of_range"))
        }
        TripSettings::Ratio { min_requests, .. } if min_requests == 0 => {
            Err(ValidationError::new("min_requests_zero"))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(default)]
pub struct BreakerSettings {
    pub enabled: bool,
    #[validate(custom(function = "validate_trip"))]
    pub trip: TripSettings,
    /// Successful probes needed in half-open before closing.
    #[validate(range(min = 1))]
    pub success_threshold: u32,
    /// How long the breaker stays open before a probe is allowed.
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
    /// Probes allowed in flight at once while half-open.
    #[validate(range(min = 1))]
    pub half_open_max_probes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            trip: TripSettings::default(),
            success_threshold: 1,
            timeout_ms: 15_000,
            half_open_max_probes: 1,
        }
    }
}

impl BreakerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ===== Per-dependency Policy =====

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
#[serde(default)]
pub struct DependencyPolicy {
    #[validate(nested)]
    pub retry: RetrySettings,
    #[validate(nested)]
    pub breaker: BreakerSettings,
}

// ===== Logging Configuration =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production (machine-readable)
    Json,
    /// Pretty format for development (human-readable)
    Pretty,
    /// Compact format for minimal output
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `relay_resilience=debug`.
    #[validate(length(min = 1))]
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

// ===== Root Configuration =====

/// Root configuration: a default policy plus per-dependency overrides.
///
/// An entry under `dependencies` replaces the defaults for that dependency as
/// a whole; fields it leaves out take their built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    pub defaults: DependencyPolicy,
    pub dependencies: HashMap<String, DependencyPolicy>,
    pub logging: LoggingConfig,
}

impl ResilienceConfig {
    /// Load configuration from an optional TOML file layered under
    /// `RELAY__*` environment variables, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigLoader::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = loaded.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let loaded = ConfigLoader::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?;

        let config: Self = loaded.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section, naming the offending dependency on failure.
    pub fn validate(&self) -> Result<()> {
        self.defaults
            .validate()
            .map_err(|e| CoreError::Validation(format!("defaults: {}", e)))?;
        self.logging
            .validate()
            .map_err(|e| CoreError::Validation(format!("logging: {}", e)))?;

        for (name, policy) in &self.dependencies {
            if name.trim().is_empty() {
                return Err(CoreError::Validation(
                    "dependency names must not be empty".to_string(),
                ));
            }
            policy
                .validate()
                .map_err(|e| CoreError::Validation(format!("dependencies.{}: {}", name, e)))?;
        }

        Ok(())
    }

    /// Resolve the policy for a dependency, falling back to the defaults.
    pub fn policy_for(&self, dependency: &str) -> &DependencyPolicy {
        self.dependencies.get(dependency).unwrap_or(&self.defaults)
    }

    /// Resolve the policy for a dependency that must be configured explicitly.
    pub fn require_policy(&self, dependency: &str) -> Result<&DependencyPolicy> {
        self.dependencies
            .get(dependency)
            .ok_or_else(|| CoreError::UnknownDependency(dependency.to_string()))
    }

    /// Names of all explicitly configured dependencies, sorted.
    pub fn dependency_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.dependencies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
