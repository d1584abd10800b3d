// Proxy module - admission, routing, failover and relay of inbound requests

pub mod error;
pub mod log;
pub mod pricing;
pub mod relay;
pub mod router;
pub mod translator;
pub mod usage;

use axum::http::{HeaderValue, Method};
use axum::response::Response;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::billing::{Admission, BillingClient};
use crate::config::{AppConfig, PrimaryGatewayConfig};
use crate::metrics::RelayMetrics;
use crate::provider::{match_model, MatchedProvider, Platform, ProviderDirectory};
use crate::telemetry::TelemetryEmitter;

use error::{AttemptError, ErrorKind, RelayError};
use log::{RequestContext, RequestLog};
use pricing::PriceTable;
use relay::{StreamFinisher, StreamOutcome};
use router::{CandidateSelector, RoutingStrategy};

/// An inbound request after routing, before any provider is chosen.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub platform: Platform,
    pub method: Method,
    /// Path sent upstream, e.g. `/v1/messages`.
    pub endpoint: String,
    pub query: Option<String>,
    pub body: Bytes,
    /// Requested model; empty for model-less calls such as listing models.
    pub model: String,
    /// The model was read from the body's `model` field rather than the path.
    pub model_in_body: bool,
    pub stream: bool,
    pub context: RequestContext,
}

impl ProxyRequest {
    pub fn new(
        platform: Platform,
        method: Method,
        endpoint: &str,
        query: Option<String>,
        body: Bytes,
        context: RequestContext,
    ) -> Result<Self, RelayError> {
        let parsed: Option<Value> = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            match serde_json::from_slice(&body) {
                Ok(v) => Some(v),
                Err(e) => return Err(RelayError::InvalidRequest(format!("request body is not JSON: {}", e))),
            }
        };

        let mut model = parsed
            .as_ref()
            .and_then(|v| v.get("model"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let model_in_body = !model.is_empty();
        let mut stream = parsed
            .as_ref()
            .and_then(|v| v.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if platform == Platform::Gemini {
            if model.is_empty() {
                if let Some(from_path) = translator::gemini_model_from_path(endpoint) {
                    model = from_path.to_string();
                }
            }
            // Without `alt=sse` a streamed generation comes back as one JSON
            // array, which is relayed buffered.
            stream = stream
                || query
                    .as_deref()
                    .is_some_and(|q| q.split('&').any(|pair| pair == "alt=sse"));
        }

        Ok(Self {
            platform,
            method,
            endpoint: endpoint.to_string(),
            query,
            body,
            model,
            model_in_body,
            stream,
            context,
        })
    }

    /// Calls that name no model by nature, such as `GET /v1beta/models`.
    pub fn is_model_listing(&self) -> bool {
        self.platform == Platform::Gemini
            && self.method == Method::GET
            && self.model.is_empty()
            && translator::gemini_action_from_path(&self.endpoint).is_none()
    }
}

/// Closes out request logs: metrics, cost, then the telemetry queue.
#[derive(Clone)]
struct RequestRecorder {
    telemetry: Arc<TelemetryEmitter>,
    metrics: RelayMetrics,
    prices: Arc<PriceTable>,
}

impl RequestRecorder {
    fn finish(&self, mut log: RequestLog) {
        if log.error_type.is_empty() {
            let usage = usage::TokenUsage {
                input_tokens: log.input_tokens,
                output_tokens: log.output_tokens,
                cache_read_tokens: log.cache_read_tokens,
                cache_creation_tokens: log.cache_create_tokens,
                reasoning_tokens: log.reasoning_tokens,
            };
            log.total_cost = self.prices.cost(&log.model, &usage);
            self.metrics.record_tokens(log.platform.as_str(), &usage);
        }
        self.metrics.record_request(
            log.platform.as_str(),
            &log.provider,
            log.http_code,
            log.duration_sec,
        );
        tracing::info!(
            trace_id = %log.trace_id,
            platform = %log.platform,
            provider = %log.provider,
            "[Relay] {} {} -> {} in {:.3}s (in={}, out={}){}",
            log.request_method,
            log.request_path,
            log.http_code,
            log.duration_sec,
            log.input_tokens,
            log.output_tokens,
            if log.error_type.is_empty() {
                String::new()
            } else {
                format!(" [{}]", log.error_type)
            }
        );
        self.telemetry.emit(log);
    }

    fn stream_finisher(&self, log: RequestLog, status: u16, started: Instant) -> StreamFinisher {
        let recorder = self.clone();
        Box::new(move |usage, outcome| {
            let log = log.with_usage(&usage).finished(status, started);
            let log = match outcome {
                StreamOutcome::Completed => log,
                StreamOutcome::Failed(message) => log.with_error(ErrorKind::StreamError, message),
                StreamOutcome::Cancelled => {
                    log.with_error(ErrorKind::ClientCancelled, "client disconnected before completion")
                }
            };
            recorder.finish(log);
        })
    }
}

/// Runs the relay pipeline for every inbound request.
pub struct Dispatcher {
    directory: Arc<ProviderDirectory>,
    selector: CandidateSelector,
    http_client: reqwest::Client,
    billing: Option<BillingClient>,
    primary: Option<PrimaryGatewayConfig>,
    recorder: RequestRecorder,
    retry_count: usize,
    max_line_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        config: &AppConfig,
        directory: Arc<ProviderDirectory>,
        telemetry: Arc<TelemetryEmitter>,
        metrics: RelayMetrics,
    ) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.proxy.request_timeout())
            .pool_max_idle_per_host(config.proxy.pool_max_idle_per_host)
            .pool_idle_timeout(config.proxy.pool_idle_timeout())
            .build()?;

        let billing = if config.billing.enabled {
            Some(BillingClient::new(&config.billing.endpoint, config.billing.timeout())?)
        } else {
            None
        };

        let primary = Some(config.primary_gateway.clone()).filter(|p| p.enabled);

        Ok(Self {
            directory,
            selector: CandidateSelector::new(RoutingStrategy::from_round_robin(config.proxy.round_robin)),
            http_client,
            billing,
            primary,
            recorder: RequestRecorder {
                telemetry,
                metrics,
                prices: Arc::new(PriceTable::new(config.pricing.clone())),
            },
            retry_count: config.proxy.retry_count.max(1) as usize,
            max_line_bytes: config.proxy.max_line_bytes,
        })
    }

    pub fn directory(&self) -> &Arc<ProviderDirectory> {
        &self.directory
    }

    pub async fn dispatch(&self, request: ProxyRequest) -> Result<Response, RelayError> {
        let started = Instant::now();
        let platform = request.platform;
        let base_log = RequestLog::new(&request.context, platform, &request.model, request.stream);

        if let Some(billing) = &self.billing {
            if let Admission::Denied(message) = billing.check_balance(&request.context.user_id).await {
                tracing::info!(
                    trace_id = %request.context.trace_id,
                    "[Relay] Rejected {}: {}",
                    request.context.user_id,
                    message
                );
                return Err(self.fail(base_log, started, RelayError::InsufficientBalance(message)));
            }
        }

        if let Some(primary) = &self.primary {
            match self.try_primary(&primary.url, &request).await {
                Ok(response) => {
                    self.recorder.metrics.record_request(
                        platform.as_str(),
                        "primary",
                        response.status().as_u16(),
                        started.elapsed().as_secs_f64(),
                    );
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(
                        trace_id = %request.context.trace_id,
                        "[Relay] Primary gateway failed: {}",
                        e
                    );
                    self.recorder
                        .metrics
                        .record_provider_error(platform.as_str(), "primary", e.kind().as_str());
                    if !primary.fallback_to_providers {
                        return Err(self.fail(base_log, started, RelayError::PrimaryGateway(e)));
                    }
                }
            }
        }

        let candidates = match self.resolve_candidates(&request).await {
            Ok(c) if !c.is_empty() => c,
            Ok(_) => {
                let err = RelayError::ModelNotFound(request.model.clone());
                return Err(self.fail(base_log, started, err));
            }
            Err(e) => return Err(self.fail(base_log, started, e)),
        };

        let order = self.selector.attempt_order(&candidates, self.retry_count);
        let attempts = order.len();
        let mut last_error = None;

        for (i, candidate) in order.into_iter().enumerate() {
            if i > 0 {
                self.recorder.metrics.record_failover(platform.as_str());
            }
            tracing::debug!(
                trace_id = %request.context.trace_id,
                "[Relay] Attempt {}/{} via {} (model {})",
                i + 1,
                attempts,
                candidate.provider.name,
                candidate.mapped_model
            );

            let log = base_log.for_attempt(candidate);
            match self.attempt(&request, candidate, log, started).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(
                        trace_id = %request.context.trace_id,
                        provider = %candidate.provider.name,
                        "[Relay] Attempt {}/{} failed [{}]: {}",
                        i + 1,
                        attempts,
                        e.kind(),
                        e
                    );
                    self.recorder.metrics.record_provider_error(
                        platform.as_str(),
                        &candidate.provider.name,
                        e.kind().as_str(),
                    );
                    last_error = Some(e);
                }
            }
        }

        let err = match last_error {
            Some(last) => RelayError::AllProvidersFailed { attempts, last },
            None => RelayError::ModelNotFound(request.model.clone()),
        };
        Err(self.fail(base_log, started, err))
    }

    async fn resolve_candidates(&self, request: &ProxyRequest) -> Result<Vec<MatchedProvider>, RelayError> {
        let routable: Vec<_> = self
            .directory
            .list_enabled(request.platform)
            .await?
            .into_iter()
            .filter(|p| p.is_routable())
            .collect();

        if request.is_model_listing() {
            return Ok(routable
                .into_iter()
                .map(|provider| MatchedProvider {
                    priority: provider.priority,
                    provider,
                    mapped_model: String::new(),
                })
                .collect());
        }
        Ok(match_model(&routable, &request.model))
    }

    async fn attempt(
        &self,
        request: &ProxyRequest,
        candidate: &MatchedProvider,
        log: RequestLog,
        started: Instant,
    ) -> Result<Response, AttemptError> {
        let outbound = translator::adapt(request, &candidate.provider, &candidate.mapped_model)?;
        let response = self
            .http_client
            .request(request.method.clone(), outbound.url)
            .headers(outbound.headers)
            .body(outbound.body)
            .send()
            .await
            .map_err(AttemptError::Network)?;
        let response = relay::check_status(response).await?;
        let status = response.status().as_u16();

        if request.stream || relay::is_event_stream(response.headers()) {
            let peeked = relay::open_stream(response).await?;
            let finisher = self.recorder.stream_finisher(log, status, started);
            return Ok(relay::relay_stream(peeked, self.max_line_bytes, finisher));
        }

        let (response, usage) = relay::relay_buffered(response).await?;
        self.recorder.finish(log.with_usage(&usage).finished(status, started));
        Ok(response)
    }

    /// Forward to the primary gateway. Anything below 500 is the final answer.
    async fn try_primary(&self, base_url: &str, request: &ProxyRequest) -> Result<Response, AttemptError> {
        let url = translator::upstream_url(base_url, &request.endpoint, request.query.as_deref())?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(if request.stream {
                "text/event-stream"
            } else {
                "application/json"
            }),
        );
        let ctx = &request.context;
        if let Some(value) = ctx.authorization.as_deref().and_then(|a| HeaderValue::from_str(a).ok()) {
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in [("x-user-id", &ctx.user_id), ("x-request-id", &ctx.request_id)] {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }

        let response = self
            .http_client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(AttemptError::Network)?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        if status.is_success() && (request.stream || relay::is_event_stream(response.headers())) {
            let peeked = relay::open_stream(response).await?;
            let finisher: StreamFinisher = Box::new(|_, _| {});
            return Ok(relay::relay_stream(peeked, self.max_line_bytes, finisher));
        }
        let (response, _) = relay::relay_buffered(response).await?;
        Ok(response)
    }

    /// Record a request-level failure and hand the error back.
    fn fail(&self, log: RequestLog, started: Instant, err: RelayError) -> RelayError {
        let log = log
            .with_error(err.kind(), err.to_string())
            .finished(err.status_code().as_u16(), started);
        self.recorder.finish(log);
        err
    }
}
