// Token usage and finish-reason extraction from upstream payloads

use serde_json::Value;

/// Token counters accumulated over a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub reasoning_tokens: u64,
}

/// A `usage` object in one of the known response shapes. Fields are optional
/// because streaming events often carry only part of the counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageReport {
    /// `input_tokens` / `output_tokens` / `cache_read_input_tokens`
    Messages {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        cache_read_input_tokens: Option<u64>,
        cache_creation_input_tokens: Option<u64>,
    },
    /// `prompt_tokens` / `completion_tokens`
    ChatCompletions {
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
        cached_tokens: Option<u64>,
        reasoning_tokens: Option<u64>,
    },
    /// `usageMetadata` on generative-model responses
    Generative {
        prompt_token_count: Option<u64>,
        candidates_token_count: Option<u64>,
        cached_content_token_count: Option<u64>,
        thoughts_token_count: Option<u64>,
    },
}

fn count(obj: &Value, key: &str) -> Option<u64> {
    obj.get(key).and_then(Value::as_u64)
}

fn nested_count(obj: &Value, parent: &str, key: &str) -> Option<u64> {
    obj.get(parent).and_then(|p| count(p, key))
}

impl UsageReport {
    /// Parse a `usage` object. Returns `None` when no known counter is present.
    pub fn parse(usage: &Value) -> Option<Self> {
        if !usage.is_object() {
            return None;
        }

        let input_tokens = count(usage, "input_tokens");
        let output_tokens = count(usage, "output_tokens");
        if input_tokens.is_some() || output_tokens.is_some() {
            return Some(UsageReport::Messages {
                input_tokens,
                output_tokens,
                cache_read_input_tokens: count(usage, "cache_read_input_tokens"),
                cache_creation_input_tokens: count(usage, "cache_creation_input_tokens"),
            });
        }

        let prompt_tokens = count(usage, "prompt_tokens");
        let completion_tokens = count(usage, "completion_tokens");
        if prompt_tokens.is_some() || completion_tokens.is_some() {
            return Some(UsageReport::ChatCompletions {
                prompt_tokens,
                completion_tokens,
                cached_tokens: nested_count(usage, "prompt_tokens_details", "cached_tokens"),
                reasoning_tokens: nested_count(usage, "completion_tokens_details", "reasoning_tokens"),
            });
        }

        let prompt_token_count = count(usage, "promptTokenCount");
        let candidates_token_count = count(usage, "candidatesTokenCount");
        if prompt_token_count.is_some() || candidates_token_count.is_some() {
            return Some(UsageReport::Generative {
                prompt_token_count,
                candidates_token_count,
                cached_content_token_count: count(usage, "cachedContentTokenCount"),
                thoughts_token_count: count(usage, "thoughtsTokenCount"),
            });
        }

        None
    }
}

/// What one payload says about usage and completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub usage: Option<UsageReport>,
    pub finish_reason: Option<String>,
}

fn non_empty_str<'a>(value: Option<&'a Value>) -> Option<&'a str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Inspect a full JSON payload (buffered body or one SSE event).
pub fn observe(payload: &Value) -> Observation {
    let usage = [
        payload.get("usage"),
        payload.get("message").and_then(|m| m.get("usage")),
        payload.get("response").and_then(|r| r.get("usage")),
        payload.get("usageMetadata"),
    ]
    .into_iter()
    .flatten()
    .find_map(UsageReport::parse);

    let first_choice = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"));
    let first_candidate = payload
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finishReason"));

    let finish_reason = non_empty_str(payload.get("stop_reason"))
        .or_else(|| non_empty_str(payload.get("delta").and_then(|d| d.get("stop_reason"))))
        .or_else(|| non_empty_str(first_choice))
        .or_else(|| non_empty_str(first_candidate))
        .map(str::to_string);

    Observation {
        usage,
        finish_reason,
    }
}

/// Inspect one line of an event stream. Only `data:` lines carrying JSON are
/// considered; the `[DONE]` sentinel yields nothing.
pub fn observe_sse_line(line: &[u8]) -> Option<Observation> {
    let line = std::str::from_utf8(line).ok()?;
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let payload: Value = serde_json::from_str(data).ok()?;
    Some(observe(&payload))
}

/// Running totals for one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageAccumulator {
    pub tokens: TokenUsage,
    pub finish_reason: Option<String>,
}

impl UsageAccumulator {
    /// Merge an observation. Counters present in the report overwrite the
    /// running values; absent ones are left alone.
    pub fn apply(&mut self, observation: Observation) {
        if let Some(report) = observation.usage {
            self.apply_report(&report);
        }
        if observation.finish_reason.is_some() {
            self.finish_reason = observation.finish_reason;
        }
    }

    fn apply_report(&mut self, report: &UsageReport) {
        fn set(slot: &mut u64, value: Option<u64>) {
            if let Some(v) = value {
                *slot = v;
            }
        }

        let t = &mut self.tokens;
        match *report {
            UsageReport::Messages {
                input_tokens,
                output_tokens,
                cache_read_input_tokens,
                cache_creation_input_tokens,
            } => {
                set(&mut t.input_tokens, input_tokens);
                set(&mut t.output_tokens, output_tokens);
                set(&mut t.cache_read_tokens, cache_read_input_tokens);
                set(&mut t.cache_creation_tokens, cache_creation_input_tokens);
            }
            UsageReport::ChatCompletions {
                prompt_tokens,
                completion_tokens,
                cached_tokens,
                reasoning_tokens,
            } => {
                set(&mut t.input_tokens, prompt_tokens);
                set(&mut t.output_tokens, completion_tokens);
                set(&mut t.cache_read_tokens, cached_tokens);
                set(&mut t.reasoning_tokens, reasoning_tokens);
            }
            UsageReport::Generative {
                prompt_token_count,
                candidates_token_count,
                cached_content_token_count,
                thoughts_token_count,
            } => {
                set(&mut t.input_tokens, prompt_token_count);
                set(&mut t.output_tokens, candidates_token_count);
                set(&mut t.cache_read_tokens, cached_content_token_count);
                set(&mut t.reasoning_tokens, thoughts_token_count);
            }
        }
    }

    pub fn observe_line(&mut self, line: &[u8]) {
        if let Some(observation) = observe_sse_line(line) {
            self.apply(observation);
        }
    }

    /// Inspect a buffered body. A JSON array (a generative stream sent
    /// without `alt=sse`) is read element by element, in order.
    pub fn observe_body(&mut self, body: &[u8]) {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Array(items)) => {
                for item in &items {
                    self.apply(observe(item));
                }
            }
            Ok(payload) => self.apply(observe(&payload)),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_line_updates_usage() {
        let mut acc = UsageAccumulator::default();
        acc.observe_line(br#"data: {"usage":{"input_tokens":100,"output_tokens":50}}"#);
        assert_eq!(acc.tokens.input_tokens, 100);
        assert_eq!(acc.tokens.output_tokens, 50);

        acc.observe_line(b"data: [DONE]");
        assert_eq!(acc.tokens.input_tokens, 100);
        assert_eq!(acc.tokens.output_tokens, 50);
    }

    #[test]
    fn test_stream_ignores_non_data_lines() {
        let mut acc = UsageAccumulator::default();
        acc.observe_line(b"event: message_delta");
        acc.observe_line(b": keep-alive");
        acc.observe_line(b"data: not json");
        acc.observe_line(b"");
        assert_eq!(acc, UsageAccumulator::default());
    }

    #[test]
    fn test_messages_stream_events_merge() {
        let mut acc = UsageAccumulator::default();
        acc.observe_line(
            br#"data: {"type":"message_start","message":{"usage":{"input_tokens":25,"output_tokens":1,"cache_read_input_tokens":7}}}"#,
        );
        acc.observe_line(
            br#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":15}}"#,
        );
        assert_eq!(acc.tokens.input_tokens, 25);
        assert_eq!(acc.tokens.output_tokens, 15);
        assert_eq!(acc.tokens.cache_read_tokens, 7);
        assert_eq!(acc.finish_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_buffered_shapes_agree() {
        let mut messages = UsageAccumulator::default();
        messages.observe_body(
            json!({"stop_reason": "end_turn", "usage": {"input_tokens": 12, "output_tokens": 34}})
                .to_string()
                .as_bytes(),
        );

        let mut chat = UsageAccumulator::default();
        chat.observe_body(
            json!({
                "choices": [{"finish_reason": "end_turn"}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 34}
            })
            .to_string()
            .as_bytes(),
        );

        assert_eq!(messages, chat);
        assert_eq!(messages.tokens.input_tokens, 12);
        assert_eq!(messages.tokens.output_tokens, 34);
    }

    #[test]
    fn test_buffered_generative_array() {
        let mut acc = UsageAccumulator::default();
        acc.observe_body(
            json!([
                {"candidates": [{"content": {"parts": [{"text": "Hel"}]}}]},
                {
                    "candidates": [{"finishReason": "STOP"}],
                    "usageMetadata": {"promptTokenCount": 11, "candidatesTokenCount": 6}
                }
            ])
            .to_string()
            .as_bytes(),
        );
        assert_eq!(acc.tokens.input_tokens, 11);
        assert_eq!(acc.tokens.output_tokens, 6);
        assert_eq!(acc.finish_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn test_finish_reason_preference() {
        let obs = observe(&json!({
            "stop_reason": "",
            "delta": {"stop_reason": "max_tokens"},
            "choices": [{"finish_reason": "length"}]
        }));
        assert_eq!(obs.finish_reason.as_deref(), Some("max_tokens"));

        let obs = observe(&json!({"stop_reason": null, "choices": [{"finish_reason": "stop"}]}));
        assert_eq!(obs.finish_reason.as_deref(), Some("stop"));

        let obs = observe(&json!({"choices": []}));
        assert!(obs.finish_reason.is_none());
    }

    #[test]
    fn test_malformed_counters_are_skipped() {
        let report = UsageReport::parse(&json!({"input_tokens": "many", "output_tokens": 3}));
        assert_eq!(
            report,
            Some(UsageReport::Messages {
                input_tokens: None,
                output_tokens: Some(3),
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            })
        );
        assert_eq!(UsageReport::parse(&json!({"total": 5})), None);
        assert_eq!(UsageReport::parse(&json!(5)), None);
    }

    #[test]
    fn test_generative_usage_metadata() {
        let mut acc = UsageAccumulator::default();
        acc.observe_line(
            br#"data: {"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":9,"candidatesTokenCount":4,"thoughtsTokenCount":2}}"#,
        );
        assert_eq!(acc.tokens.input_tokens, 9);
        assert_eq!(acc.tokens.output_tokens, 4);
        assert_eq!(acc.tokens.reasoning_tokens, 2);
        assert_eq!(acc.finish_reason.as_deref(), Some("STOP"));
    }
}
