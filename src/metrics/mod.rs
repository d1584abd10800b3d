// Metrics module - Prometheus counters for relay traffic

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::proxy::usage::TokenUsage;

/// Counters owned by one gateway instance; each instance has its own
/// registry so tests can run side by side.
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    provider_errors: IntCounterVec,
    failovers: IntCounterVec,
    tokens: IntCounterVec,
    request_duration: HistogramVec,
    telemetry_dropped: IntCounter,
}

impl RelayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("relay".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Inbound requests by outcome"),
            &["platform", "provider", "status"],
        )?;
        let provider_errors = IntCounterVec::new(
            Opts::new("provider_errors_total", "Failed upstream attempts by error type"),
            &["platform", "provider", "error_type"],
        )?;
        let failovers = IntCounterVec::new(
            Opts::new("failovers_total", "Attempts that moved on to another provider"),
            &["platform"],
        )?;
        let tokens = IntCounterVec::new(
            Opts::new("tokens_total", "Tokens relayed"),
            &["platform", "kind"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Time to relay a request")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["platform"],
        )?;
        let telemetry_dropped = IntCounter::with_opts(Opts::new(
            "telemetry_dropped_total",
            "Request logs dropped because the telemetry queue was full",
        ))?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(provider_errors.clone()))?;
        registry.register(Box::new(failovers.clone()))?;
        registry.register(Box::new(tokens.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(telemetry_dropped.clone()))?;

        Ok(Self {
            registry,
            requests,
            provider_errors,
            failovers,
            tokens,
            request_duration,
            telemetry_dropped,
        })
    }

    pub fn record_request(&self, platform: &str, provider: &str, status: u16, duration_sec: f64) {
        let status = status.to_string();
        self.requests
            .with_label_values(&[platform, provider, status.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[platform])
            .observe(duration_sec);
    }

    pub fn record_provider_error(&self, platform: &str, provider: &str, error_type: &str) {
        self.provider_errors
            .with_label_values(&[platform, provider, error_type])
            .inc();
    }

    pub fn record_failover(&self, platform: &str) {
        self.failovers.with_label_values(&[platform]).inc();
    }

    pub fn record_tokens(&self, platform: &str, usage: &TokenUsage) {
        for (kind, count) in [
            ("input", usage.input_tokens),
            ("output", usage.output_tokens),
            ("cache_read", usage.cache_read_tokens),
            ("cache_creation", usage.cache_creation_tokens),
            ("reasoning", usage.reasoning_tokens),
        ] {
            if count > 0 {
                self.tokens.with_label_values(&[platform, kind]).inc_by(count);
            }
        }
    }

    pub fn telemetry_dropped(&self) -> IntCounter {
        self.telemetry_dropped.clone()
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_recorded_series() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_request("claude", "p1", 200, 0.3);
        metrics.record_provider_error("claude", "p0", "rate_limit");
        metrics.record_failover("claude");
        metrics.record_tokens(
            "claude",
            &TokenUsage {
                input_tokens: 5,
                output_tokens: 7,
                ..Default::default()
            },
        );
        metrics.telemetry_dropped().inc();

        let text = metrics.encode();
        assert!(text.contains("relay_requests_total{"));
        assert!(text.contains(r#"status="200""#));
        assert!(text.contains(r#"error_type="rate_limit""#));
        assert!(text
            .lines()
            .any(|l| l.starts_with("relay_tokens_total{") && l.contains(r#"kind="output""#) && l.ends_with(" 7")));
        assert!(text.contains("relay_telemetry_dropped_total 1"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = RelayMetrics::new().unwrap();
        let b = RelayMetrics::new().unwrap();
        a.record_failover("codex");
        assert!(!b.encode().contains("relay_failovers_total{"));
    }
}
