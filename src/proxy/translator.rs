// Protocol adapter - shapes the outbound request for a provider's dialect

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;

use super::error::AttemptError;
use super::ProxyRequest;
use crate::provider::{Platform, Provider};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const GEMINI_MODELS_PREFIX: &str = "/v1beta/models/";

static X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
static ANTHROPIC_VERSION_HEADER: HeaderName = HeaderName::from_static("anthropic-version");
static X_ORIGINAL_USER_AGENT: HeaderName = HeaderName::from_static("x-original-user-agent");

/// A request ready to hand to the HTTP client.
#[derive(Debug)]
pub struct OutboundRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Model named in a generative-model path (`/v1beta/models/{model}:{action}`).
pub fn gemini_model_from_path(endpoint: &str) -> Option<&str> {
    let rest = endpoint.strip_prefix(GEMINI_MODELS_PREFIX)?;
    let model = rest.split(':').next()?;
    (!model.is_empty() && !model.contains('/')).then_some(model)
}

/// Action named in a generative-model path, e.g. `streamGenerateContent`.
pub fn gemini_action_from_path(endpoint: &str) -> Option<&str> {
    endpoint
        .strip_prefix(GEMINI_MODELS_PREFIX)?
        .split_once(':')
        .map(|(_, action)| action)
}

fn rewrite_gemini_path(endpoint: &str, model: &str) -> String {
    match gemini_model_from_path(endpoint) {
        Some(current) => {
            let rest = &endpoint[GEMINI_MODELS_PREFIX.len() + current.len()..];
            format!("{}{}{}", GEMINI_MODELS_PREFIX, model, rest)
        }
        None => endpoint.to_string(),
    }
}

/// Replace the `model` field of a JSON object body. Bodies that are not JSON
/// objects are passed through untouched.
pub fn rewrite_model(body: &Bytes, model: &str) -> Bytes {
    let mut data: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return body.clone(),
    };
    let Some(obj) = data.as_object_mut() else {
        return body.clone();
    };
    obj.insert("model".to_string(), Value::String(model.to_string()));
    match serde_json::to_vec(&data) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body.clone(),
    }
}

fn header_value(value: &str) -> Result<HeaderValue, AttemptError> {
    HeaderValue::from_str(value)
        .map_err(|e| AttemptError::Build(format!("invalid header value: {}", e)))
}

/// Build the upstream URL without provider credentials.
pub fn upstream_url(base_url: &str, endpoint: &str, query: Option<&str>) -> Result<Url, AttemptError> {
    let mut raw = format!("{}{}", base_url.trim_end_matches('/'), endpoint);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        raw.push('?');
        raw.push_str(q);
    }
    Url::parse(&raw).map_err(|e| AttemptError::Build(format!("invalid upstream url '{}': {}", raw, e)))
}

/// Shape `request` for `provider`, sending `effective_model` upstream.
pub fn adapt(
    request: &ProxyRequest,
    provider: &Provider,
    effective_model: &str,
) -> Result<OutboundRequest, AttemptError> {
    let model_changed = !effective_model.is_empty() && effective_model != request.model;

    let endpoint = if model_changed && request.platform == Platform::Gemini {
        rewrite_gemini_path(&request.endpoint, effective_model)
    } else {
        request.endpoint.clone()
    };

    // Callers may send their own key in the query; never forward it.
    let query = request.query.as_deref().map(|q| {
        q.split('&')
            .filter(|pair| !pair.is_empty() && !pair.starts_with("key="))
            .collect::<Vec<_>>()
            .join("&")
    });
    let mut url = upstream_url(&provider.api_url, &endpoint, query.as_deref())?;

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

    match request.platform {
        Platform::Gemini => {
            url.query_pairs_mut().append_pair("key", &provider.api_key);
        }
        Platform::Claude => {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", provider.api_key))?);
            headers.insert(X_API_KEY.clone(), header_value(&provider.api_key)?);
            headers.insert(
                ANTHROPIC_VERSION_HEADER.clone(),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        Platform::Codex => {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", provider.api_key))?);
        }
    }

    if let Some(user_agent) = request.context.user_agent.as_deref() {
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(X_ORIGINAL_USER_AGENT.clone(), value);
        }
    }

    // Generative requests usually carry the model in the path only.
    let body_carries_model = request.platform != Platform::Gemini || request.model_in_body;
    let body = if model_changed && body_carries_model {
        rewrite_model(&request.body, effective_model)
    } else {
        request.body.clone()
    };

    Ok(OutboundRequest { url, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::log::RequestContext;
    use axum::http::Method;
    use serde_json::json;

    fn provider() -> Provider {
        serde_json::from_value(json!({
            "name": "p",
            "api_url": "https://upstream.example.com/",
            "api_key": "sk-secret"
        }))
        .unwrap()
    }

    fn request(platform: Platform, endpoint: &str, query: Option<&str>, body: Value) -> ProxyRequest {
        let context = RequestContext {
            trace_id: "t".to_string(),
            request_id: "r".to_string(),
            user_id: "u".to_string(),
            method: "POST".to_string(),
            path: endpoint.to_string(),
            user_agent: Some("claude-cli/1.0".to_string()),
            authorization: None,
        };
        ProxyRequest::new(
            platform,
            Method::POST,
            endpoint,
            query.map(str::to_string),
            Bytes::from(body.to_string()),
            context,
        )
        .unwrap()
    }

    #[test]
    fn test_messages_headers() {
        let req = request(Platform::Claude, "/v1/messages", None, json!({"model": "claude-3-opus"}));
        let out = adapt(&req, &provider(), "claude-3-opus").unwrap();

        assert_eq!(out.url.as_str(), "https://upstream.example.com/v1/messages");
        assert_eq!(out.headers[AUTHORIZATION], "Bearer sk-secret");
        assert_eq!(out.headers["x-api-key"], "sk-secret");
        assert_eq!(out.headers["anthropic-version"], ANTHROPIC_VERSION);
        assert_eq!(out.headers[CONTENT_TYPE], "application/json");
        assert_eq!(out.headers[ACCEPT], "application/json");
        assert_eq!(out.headers["x-original-user-agent"], "claude-cli/1.0");
        assert_eq!(out.body, req.body);
    }

    #[test]
    fn test_chat_rewrites_model_only() {
        let req = request(
            Platform::Codex,
            "/v1/chat/completions",
            None,
            json!({"model": "gpt-4", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        );
        let out = adapt(&req, &provider(), "openai/gpt-4").unwrap();

        assert_eq!(out.headers[AUTHORIZATION], "Bearer sk-secret");
        assert!(out.headers.get("x-api-key").is_none());
        assert_eq!(out.headers[ACCEPT], "text/event-stream");

        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(
            body,
            json!({"model": "openai/gpt-4", "stream": true, "messages": [{"role": "user", "content": "hi"}]})
        );
    }

    #[test]
    fn test_generative_key_in_query() {
        let req = request(
            Platform::Gemini,
            "/v1beta/models/gemini-pro:streamGenerateContent",
            Some("alt=sse&key=caller-key"),
            json!({"contents": []}),
        );
        assert_eq!(req.model, "gemini-pro");
        assert!(req.stream);

        let out = adapt(&req, &provider(), "gemini-1.5-pro").unwrap();
        assert!(out.headers.get(AUTHORIZATION).is_none());
        assert_eq!(
            out.url.as_str(),
            "https://upstream.example.com/v1beta/models/gemini-1.5-pro:streamGenerateContent?alt=sse&key=sk-secret"
        );
        assert_eq!(out.body, req.body);
    }

    #[test]
    fn test_generative_body_model_is_rewritten() {
        let req = request(
            Platform::Gemini,
            "/v1beta/cachedContents",
            None,
            json!({"model": "gemini-pro", "contents": []}),
        );
        assert!(req.model_in_body);

        let out = adapt(&req, &provider(), "vendor/gemini-pro").unwrap();
        assert_eq!(
            out.url.as_str(),
            "https://upstream.example.com/v1beta/cachedContents?key=sk-secret"
        );
        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body, json!({"model": "vendor/gemini-pro", "contents": []}));
    }

    #[test]
    fn test_generative_stream_without_sse_is_buffered() {
        let req = request(
            Platform::Gemini,
            "/v1beta/models/gemini-pro:streamGenerateContent",
            None,
            json!({"contents": []}),
        );
        assert!(!req.stream);
        assert!(!req.model_in_body);

        let out = adapt(&req, &provider(), "gemini-pro").unwrap();
        assert_eq!(out.headers[ACCEPT], "application/json");
    }

    #[test]
    fn test_model_listing_detection() {
        let listing = ProxyRequest::new(
            Platform::Gemini,
            Method::GET,
            "/v1beta/models",
            None,
            Bytes::new(),
            request(Platform::Gemini, "/v1beta/models", None, json!({})).context,
        )
        .unwrap();
        assert!(listing.is_model_listing());

        let modelless = request(Platform::Claude, "/v1/messages", None, json!({"messages": []}));
        assert!(modelless.model.is_empty());
        assert!(!modelless.is_model_listing());
    }

    #[test]
    fn test_gemini_path_helpers() {
        assert_eq!(gemini_model_from_path("/v1beta/models/gemini-pro:generateContent"), Some("gemini-pro"));
        assert_eq!(gemini_action_from_path("/v1beta/models/gemini-pro:countTokens"), Some("countTokens"));
        assert_eq!(gemini_model_from_path("/v1beta/models"), None);
        assert_eq!(gemini_model_from_path("/v1beta/files/abc"), None);
    }

    #[test]
    fn test_rewrite_model_passes_non_json_through() {
        let raw = Bytes::from_static(b"not json");
        assert_eq!(rewrite_model(&raw, "x"), raw);
        let array = Bytes::from_static(b"[1,2]");
        assert_eq!(rewrite_model(&array, "x"), array);
    }
}
