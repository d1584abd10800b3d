// HTTP API Server module

use anyhow::Result;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::RelayMetrics;
use crate::proxy::Dispatcher;

mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: RelayMetrics,
}

/// Keys accepted from callers. Empty means no check.
#[derive(Clone, Default)]
pub struct ApiKeys(Arc<Vec<String>>);

impl ApiKeys {
    pub fn new(keys: Vec<String>) -> Self {
        Self(Arc::new(keys.into_iter().filter(|k| !k.is_empty()).collect()))
    }

    fn accepts(&self, key: &str) -> bool {
        self.0.iter().any(|k| k == key)
    }
}

fn presented_keys(request: &Request<Body>) -> Vec<String> {
    let headers = request.headers();
    let mut keys: Vec<String> = [header::AUTHORIZATION.as_str(), "x-api-key", "x-goog-api-key"]
        .into_iter()
        .filter_map(|name| headers.get(name).and_then(|v| v.to_str().ok()))
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim().to_string())
        .collect();

    if let Some(query) = request.uri().query() {
        keys.extend(
            query
                .split('&')
                .filter_map(|pair| pair.strip_prefix("key="))
                .filter_map(|v| urlencoding::decode(v).ok())
                .map(|v| v.into_owned()),
        );
    }
    keys
}

/// API Key authentication middleware
async fn auth_middleware(State(api_keys): State<ApiKeys>, request: Request<Body>, next: Next) -> Response {
    // If no API keys configured, allow all requests
    if api_keys.0.is_empty() {
        return next.run(request).await;
    }

    if presented_keys(&request).iter().any(|k| api_keys.accepts(k)) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [("Content-Type", "application/json")],
            r#"{"error":{"type":"auth_error","message":"Invalid API key"}}"#,
        )
            .into_response()
    }
}

pub fn build_router(state: AppState, api_keys: ApiKeys, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    // Routes that require API key authentication
    let protected_routes = Router::new()
        .route("/v1/messages", post(handlers::messages))
        .route("/v1/messages/count_tokens", post(handlers::messages))
        .route("/v1/messages/batches", post(handlers::messages))
        .route("/responses", post(handlers::chat))
        .route("/v1/chat/completions", post(handlers::chat))
        .route("/chat/completions", post(handlers::chat))
        .route("/v1/completions", post(handlers::chat))
        .route("/v1/embeddings", post(handlers::chat))
        .route("/v1beta/models", get(handlers::generative))
        .route(
            "/v1beta/models/*action",
            post(handlers::generative).get(handlers::generative),
        )
        .route("/internal/providers/invalidate", post(handlers::invalidate_providers))
        .route("/internal/providers/match", get(handlers::match_providers))
        .fallback(handlers::fallback)
        .layer(middleware::from_fn_with_state(api_keys, auth_middleware));

    // Routes that don't require authentication
    let public_routes = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn serve<F>(listener: tokio::net::TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!("API server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("API server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::telemetry::EventSink;
    use tower::ServiceExt;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_presented_keys_sources() {
        let keys = presented_keys(&request("/v1/messages", &[("authorization", "Bearer sk-1")]));
        assert_eq!(keys, vec!["sk-1"]);

        let keys = presented_keys(&request("/v1/messages", &[("x-api-key", "sk-2")]));
        assert_eq!(keys, vec!["sk-2"]);

        let keys = presented_keys(&request("/v1beta/models/m:generateContent?alt=sse&key=sk%2D3", &[]));
        assert_eq!(keys, vec!["sk-3"]);

        let keys = presented_keys(&request("/v1/chat/completions", &[("authorization", "raw-key")]));
        assert_eq!(keys, vec!["raw-key"]);
    }

    #[test]
    fn test_api_keys_ignore_blank_entries() {
        let keys = ApiKeys::new(vec![String::new(), "sk-1".to_string()]);
        assert!(keys.accepts("sk-1"));
        assert!(!keys.accepts(""));
    }

    async fn app(yaml: &str) -> Router {
        let config = AppConfig::from_yaml(yaml).unwrap();
        crate::Gateway::new(&config, EventSink::Log)
            .unwrap()
            .router(config.server.body_limit_bytes)
    }

    async fn status_of(app: Router, method: Method, uri: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_public_routes_skip_auth() {
        let app = app("api-keys: [\"secret\"]\n").await;
        assert_eq!(status_of(app.clone(), Method::GET, "/health").await, StatusCode::OK);
        assert_eq!(status_of(app.clone(), Method::GET, "/metrics").await, StatusCode::OK);
        assert_eq!(status_of(app, Method::POST, "/v1/messages").await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let app = app("{}").await;
        assert_eq!(status_of(app, Method::GET, "/v2/whatever").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ready_with_static_providers() {
        let app = app("{}").await;
        assert_eq!(status_of(app, Method::GET, "/ready").await, StatusCode::OK);
    }
}
