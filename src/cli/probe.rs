use crate::cli::config::{default_store_path, LarderConfig};
use crate::cli::context::{config_path, load_config};
use larder::network::{NetworkMonitor, ReachabilityProbe, TcpProbe};
use larder::resilience::{AbortHandle, CircuitBreaker, Guard, Guarded};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Check whether the probe target is reachable
///
/// Without `wait`, one guarded probe runs with the configured retry policy.
/// With `wait`, probing repeats until reachable, the wait elapses or Ctrl-C.
/// Works without a config file, using defaults.
pub async fn execute(
    config: Option<String>,
    target: Option<String>,
    wait: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = probe_config(&config_path(config.as_deref()))?;
    let target = target.unwrap_or_else(|| config.network.probe_target.clone());
    let probe = Arc::new(TcpProbe::new(target.clone(), config.network.probe_timeout));

    let reachable = match wait {
        Some(wait) => wait_until_reachable(&config, probe, wait).await,
        None => probe_once(&config, probe).await,
    };

    if reachable {
        println!("✅ {} is reachable", target);
        Ok(())
    } else {
        Err(format!("{} is not reachable", target).into())
    }
}

fn probe_config(path: &Path) -> Result<LarderConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        load_config(path)
    } else {
        debug!(path = %path.display(), "no config, probing with defaults");
        Ok(LarderConfig::new(default_store_path()))
    }
}

async fn probe_once(config: &LarderConfig, probe: Arc<TcpProbe>) -> bool {
    let breaker = Arc::new(CircuitBreaker::new(config.breaker_options("probe")));
    let guard = Guard::new(breaker, config.retry_policy());

    let outcome = guard
        .call(
            || {
                let probe = probe.clone();
                async move { probe.probe().await.map(|()| true) }
            },
            false,
        )
        .await;

    if let Guarded::Fallback { error, .. } = &outcome {
        eprintln!("probe failed: {}", error);
    }
    outcome.into_value()
}

async fn wait_until_reachable(
    config: &LarderConfig,
    probe: Arc<TcpProbe>,
    wait: Duration,
) -> bool {
    let monitor = NetworkMonitor::new(probe, config.monitor_options());

    let abort = AbortHandle::new();
    let signal = abort.signal();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });

    let reachable = monitor.wait_for_network(wait, &signal).await;
    ctrl_c.abort();
    reachable
}
