//! Observability infrastructure: tracing and metrics.

use crate::config::Config;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize the global tracing subscriber and, if configured, the Prometheus exporter.
///
/// `RUST_LOG` takes precedence over the configured `log_level`. Call once at
/// startup; a second call fails because a global subscriber is already set.
pub fn init(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    match config.metrics_listen_addr {
        Some(addr) => {
            PrometheusBuilder::new().with_http_listener(addr).install()?;
            tracing::info!("Observability initialized (metrics on {})", addr);
        }
        None => tracing::info!("Observability initialized (metrics export disabled)"),
    }

    metrics::register_core_metrics();

    Ok(())
}
