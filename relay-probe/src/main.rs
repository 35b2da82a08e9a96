use anyhow::{Context, Result};
use clap::Parser;
use relay_core::ResilienceConfig;
use relay_resilience::observer::describe_metrics;
use relay_resilience::{init_tracing, BreakerRegistry, CallContext, MetricsObserver};
use std::path::PathBuf;
use std::time::Duration;

/// Send requests to one dependency through its configured breaker and retry
/// policy, then print the breaker snapshots as JSON.
#[derive(Debug, Parser)]
#[command(name = "relay-probe", version, about)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Dependency name used to look up the policy
    #[arg(short, long)]
    dependency: String,

    /// URL to GET on every request
    #[arg(short, long)]
    url: String,

    /// Number of logical calls to make
    #[arg(short = 'n', long, default_value = "10")]
    requests: u32,

    /// Pause between calls in milliseconds
    #[arg(short, long, default_value = "500")]
    interval_ms: u64,

    /// Per-call deadline in milliseconds, retries included
    #[arg(long)]
    deadline_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ResilienceConfig::load(args.config.as_deref())
        .context("Failed to load resilience configuration")?;
    init_tracing(&config.logging)?;
    describe_metrics();

    tracing::info!(
        dependency = %args.dependency,
        url = %args.url,
        requests = args.requests,
        "Starting probe"
    );

    if config.require_policy(&args.dependency).is_err() {
        tracing::warn!(
            dependency = %args.dependency,
            configured = ?config.dependency_names(),
            "No policy configured for dependency, using defaults"
        );
    }

    let registry = BreakerRegistry::new(config).with_observer(MetricsObserver);
    let client = registry.http_client(reqwest::Client::new(), &args.dependency);

    for index in 0..args.requests {
        let ctx = match args.deadline_ms {
            Some(ms) => CallContext::background().with_timeout(Duration::from_millis(ms)),
            None => CallContext::background(),
        };

        match client.send(&ctx, client.client().get(&args.url)).await {
            Ok(response) => {
                tracing::info!(call = index, status = %response.status(), "Call completed");
            }
            Err(err) if err.is_breaker_open() => {
                tracing::warn!(call = index, error = %err, "Call rejected");
            }
            Err(err) => {
                tracing::error!(
                    call = index,
                    attempts = ?err.attempts(),
                    error = %err,
                    "Call failed"
                );
            }
        }

        if index + 1 < args.requests {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    println!("{}", serde_json::to_string_pretty(&registry.snapshot())?);
    Ok(())
}
