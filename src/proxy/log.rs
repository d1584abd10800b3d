// Per-request log record built up by the relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::error::ErrorKind;
use super::usage::UsageAccumulator;
use crate::provider::{MatchedProvider, Platform};

/// One record per inbound request, published to the telemetry bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestLog {
    pub id: String,
    pub trace_id: String,
    pub request_id: String,
    pub user_id: String,
    pub platform: Platform,
    pub model: String,
    pub provider: String,
    pub provider_model: String,
    pub request_method: String,
    pub request_path: String,
    pub user_agent: String,
    pub is_stream: bool,
    pub http_code: u16,
    pub duration_sec: f64,
    pub finish_reason: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_create_tokens: u64,
    pub cache_read_tokens: u64,
    pub reasoning_tokens: u64,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

impl RequestLog {
    pub fn new(ctx: &RequestContext, platform: Platform, model: &str, is_stream: bool) -> Self {
        Self {
            id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            trace_id: ctx.trace_id.clone(),
            request_id: ctx.request_id.clone(),
            user_id: ctx.user_id.clone(),
            platform,
            model: model.to_string(),
            provider: String::new(),
            provider_model: String::new(),
            request_method: ctx.method.clone(),
            request_path: ctx.path.clone(),
            user_agent: ctx.user_agent.clone().unwrap_or_default(),
            is_stream,
            http_code: 0,
            duration_sec: 0.0,
            finish_reason: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cache_create_tokens: 0,
            cache_read_tokens: 0,
            reasoning_tokens: 0,
            total_cost: 0.0,
            error_type: String::new(),
            error_message: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Copy of this log routed to `candidate`.
    pub fn for_attempt(&self, candidate: &MatchedProvider) -> Self {
        let mut log = self.clone();
        log.id = format!("req_{}", uuid::Uuid::new_v4().simple());
        log.provider = candidate.provider.name.clone();
        log.provider_model = candidate.mapped_model.clone();
        log
    }

    pub fn with_usage(mut self, usage: &UsageAccumulator) -> Self {
        self.input_tokens = usage.tokens.input_tokens;
        self.output_tokens = usage.tokens.output_tokens;
        self.cache_read_tokens = usage.tokens.cache_read_tokens;
        self.cache_create_tokens = usage.tokens.cache_creation_tokens;
        self.reasoning_tokens = usage.tokens.reasoning_tokens;
        if let Some(reason) = &usage.finish_reason {
            self.finish_reason = reason.clone();
        }
        self
    }

    pub fn with_error(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.error_type = kind.as_str().to_string();
        self.error_message = message.into();
        self
    }

    pub fn finished(mut self, http_code: u16, started: Instant) -> Self {
        self.http_code = http_code;
        self.duration_sec = started.elapsed().as_secs_f64();
        self
    }
}

/// Caller-side facts about an inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub request_id: String,
    pub user_id: String,
    pub method: String,
    pub path: String,
    pub user_agent: Option<String>,
    pub authorization: Option<String>,
}

/// Billing-facing slice of a completed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageEvent {
    pub user_id: String,
    pub platform: Platform,
    pub model: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&RequestLog> for UsageEvent {
    fn from(log: &RequestLog) -> Self {
        Self {
            user_id: log.user_id.clone(),
            platform: log.platform,
            model: log.model.clone(),
            provider: log.provider.clone(),
            input_tokens: log.input_tokens,
            output_tokens: log.output_tokens,
            total_cost: log.total_cost,
            trace_id: log.trace_id.clone(),
            timestamp: Utc::now(),
        }
    }
}
