// API request handlers

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::provider::Platform;
use crate::proxy::error::RelayError;
use crate::proxy::log::RequestContext;
use crate::proxy::ProxyRequest;

const ANONYMOUS_USER: &str = "anonymous";

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Caller identity and tracing ids for one request.
fn request_context(method: &Method, uri: &Uri, headers: &HeaderMap) -> RequestContext {
    let trace_id = uuid::Uuid::new_v4().to_string();
    RequestContext {
        request_id: header_str(headers, "x-request-id").unwrap_or_else(|| trace_id.clone()),
        trace_id,
        user_id: header_str(headers, "x-user-id").unwrap_or_else(|| ANONYMOUS_USER.to_string()),
        method: method.to_string(),
        path: uri.path().to_string(),
        user_agent: header_str(headers, header::USER_AGENT.as_str()),
        authorization: header_str(headers, header::AUTHORIZATION.as_str()),
    }
}

async fn relay(
    state: &AppState,
    platform: Platform,
    endpoint: &str,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let context = request_context(&method, uri, headers);
    let query = uri.query().map(str::to_string);

    let request = match ProxyRequest::new(platform, method, endpoint, query, body, context) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    match state.dispatcher.dispatch(request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

// Root endpoint
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Relay Gateway",
        "endpoints": [
            "POST /v1/messages",
            "POST /v1/chat/completions",
            "POST /responses",
            "GET /v1beta/models",
            "POST /v1beta/models/{model}:{action}"
        ]
    }))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready once every platform's provider list can be loaded.
pub async fn ready(State(state): State<AppState>) -> Response {
    let directory = state.dispatcher.directory();
    let mut providers = serde_json::Map::new();
    for platform in Platform::ALL {
        match directory.list_enabled(platform).await {
            Ok(list) => {
                providers.insert(platform.to_string(), json!(list.len()));
            }
            Err(e) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "status": "not_ready", "error": e.to_string() })),
                )
                    .into_response();
            }
        }
    }
    Json(json!({ "status": "ready", "providers": providers })).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
        .into_response()
}

// Messages API
pub async fn messages(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(&state, Platform::Claude, uri.path(), method, &uri, &headers, body).await
}

// Chat-completions style APIs
pub async fn chat(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let endpoint = match uri.path() {
        "/chat/completions" => "/v1/chat/completions",
        other => other,
    };
    relay(&state, Platform::Codex, endpoint, method, &uri, &headers, body).await
}

// Generative-model API
pub async fn generative(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(&state, Platform::Gemini, uri.path(), method, &uri, &headers, body).await
}

/// Other `/v1beta/*` paths go to generative-model providers; anything else
/// is unknown.
pub async fn fallback(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if uri.path().starts_with("/v1beta/") {
        return relay(&state, Platform::Gemini, uri.path(), method, &uri, &headers, body).await;
    }
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": { "type": "not_found", "message": format!("No route for {} {}", method, uri.path()) }
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    pub platform: Option<String>,
    pub model: Option<String>,
}

fn parse_platform(raw: &str) -> Result<Platform, RelayError> {
    raw.parse::<Platform>().map_err(RelayError::InvalidRequest)
}

// Drop cached provider lists after an administrative change
pub async fn invalidate_providers(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<Value>, RelayError> {
    let platform = query
        .platform
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(parse_platform)
        .transpose()?;

    state.dispatcher.directory().invalidate(platform);
    tracing::info!(
        "[Providers] Cache invalidated for {}",
        platform.map_or("all platforms".to_string(), |p| p.to_string())
    );
    Ok(Json(json!({
        "invalidated": platform.map_or_else(|| json!(Platform::ALL), |p| json!([p]))
    })))
}

// Which providers would serve a model, in routing order
pub async fn match_providers(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<Value>, RelayError> {
    let platform = parse_platform(query.platform.as_deref().unwrap_or_default())?;
    let model = query
        .model
        .filter(|m| !m.is_empty())
        .ok_or_else(|| RelayError::InvalidRequest("model is required".to_string()))?;

    let matched = state.dispatcher.directory().match_model(platform, &model).await?;
    let providers: Vec<Value> = matched
        .iter()
        .map(|m| {
            json!({
                "id": m.provider.id,
                "name": m.provider.name,
                "mapped_model": m.mapped_model,
                "priority": m.priority,
            })
        })
        .collect();
    Ok(Json(json!({ "platform": platform, "model": model, "providers": providers })))
}
