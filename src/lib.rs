// Relay Gateway - multi-dialect LLM relay with provider failover

pub mod api;
pub mod billing;
pub mod config;
pub mod metrics;
pub mod provider;
pub mod proxy;
pub mod telemetry;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api::{ApiKeys, AppState};
use config::{AppConfig, LogFormat};
use metrics::RelayMetrics;
use provider::{ProviderDirectory, ProviderSource, RemoteDirectory};
use proxy::Dispatcher;
use telemetry::{EventSink, TelemetryEmitter};

const TELEMETRY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(level: &str, format: LogFormat) {
    let level = if level.trim().is_empty() { "info" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Provider source for this config: the provider service when an endpoint is
/// set, otherwise the providers listed in the file.
pub fn provider_directory(config: &AppConfig) -> Result<ProviderDirectory> {
    let source = if config.provider.endpoint.trim().is_empty() {
        tracing::info!(
            "Using {} providers from config",
            config.provider.providers.len()
        );
        ProviderSource::Static(config.provider.providers.iter().cloned().map(Arc::new).collect())
    } else {
        let remote = RemoteDirectory::new(&config.provider.endpoint, config.provider.timeout())
            .context("Failed to build provider service client")?;
        tracing::info!("Using provider service at {}", config.provider.endpoint);
        ProviderSource::Remote(remote)
    };
    Ok(ProviderDirectory::new(source, config.provider.cache_ttl()))
}

async fn event_sink(config: &AppConfig) -> EventSink {
    if !config.telemetry.enabled {
        return EventSink::Log;
    }
    match EventSink::connect(&config.telemetry).await {
        Ok(sink) => sink,
        Err(e) => {
            tracing::warn!("Telemetry bus unavailable, logging request records instead: {}", e);
            EventSink::Log
        }
    }
}

/// Everything a running gateway owns.
pub struct Gateway {
    pub state: AppState,
    pub api_keys: ApiKeys,
    pub telemetry: Arc<TelemetryEmitter>,
}

impl Gateway {
    pub fn new(config: &AppConfig, sink: EventSink) -> Result<Self> {
        let metrics = RelayMetrics::new().context("Failed to register metrics")?;
        let telemetry = Arc::new(TelemetryEmitter::start(
            sink,
            config.telemetry.queue_capacity,
            metrics.telemetry_dropped(),
        ));
        let directory = Arc::new(provider_directory(config)?);
        let dispatcher = Dispatcher::new(config, directory, telemetry.clone(), metrics.clone())
            .context("Failed to build HTTP client")?;

        Ok(Self {
            state: AppState {
                dispatcher: Arc::new(dispatcher),
                metrics,
            },
            api_keys: ApiKeys::new(config.api_keys.clone()),
            telemetry,
        })
    }

    pub fn router(&self, body_limit: usize) -> axum::Router {
        api::build_router(self.state.clone(), self.api_keys.clone(), body_limit)
    }
}

/// Start the gateway and run until a shutdown signal arrives.
pub async fn run(config: AppConfig) -> Result<()> {
    let sink = event_sink(&config).await;
    let gateway = Gateway::new(&config, sink)?;
    let app = gateway.router(config.server.body_limit_bytes);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    api::serve(listener, app, api::shutdown_signal()).await?;

    gateway.telemetry.shutdown(TELEMETRY_DRAIN_TIMEOUT).await;
    Ok(())
}
