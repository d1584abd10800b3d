// Model matcher - whitelist checks and model-name mapping
//
// Wildcard grammar: a single trailing `*` on a source pattern (`claude-*`)
// matches any model sharing the literal prefix. A replacement may contain one
// `*`, which receives the matched suffix.

use std::fmt;
use std::sync::Arc;

use super::{MatchedProvider, Provider};

/// Literal prefix of a well-formed wildcard pattern, `None` for exact names.
pub fn wildcard_prefix(pattern: &str) -> Option<&str> {
    pattern
        .strip_suffix('*')
        .filter(|prefix| !prefix.contains('*'))
}

fn is_malformed(pattern: &str) -> bool {
    pattern.contains('*') && wildcard_prefix(pattern).is_none()
}

/// Check whether a provider's whitelist admits `model`.
///
/// An empty whitelist allows every model.
pub fn is_model_supported(provider: &Provider, model: &str) -> bool {
    if provider.supported_models.is_empty() {
        return true;
    }

    if provider.supported_models.contains(model) {
        return true;
    }

    provider
        .supported_models
        .iter()
        .filter_map(wildcard_prefix)
        .any(|prefix| model.starts_with(prefix))
}

/// Resolve the model name to send upstream.
///
/// Exact mappings win. Among wildcard mappings the longest matching prefix
/// is used, so `claude-3-*` beats `claude-*`.
pub fn effective_model(provider: &Provider, model: &str) -> String {
    if provider.model_mapping.is_empty() {
        return model.to_string();
    }

    if let Some(mapped) = provider.model_mapping.get(model) {
        return mapped.clone();
    }

    let best = provider
        .model_mapping
        .iter()
        .filter_map(|(pattern, replacement)| {
            wildcard_prefix(pattern)
                .filter(|prefix| model.starts_with(prefix))
                .map(|prefix| (prefix, replacement))
        })
        .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)));

    match best {
        Some((prefix, replacement)) => {
            let suffix = &model[prefix.len()..];
            if replacement.contains('*') {
                replacement.replacen('*', suffix, 1)
            } else {
                replacement.clone()
            }
        }
        None => model.to_string(),
    }
}

/// A configuration problem that blocks a provider from being stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A fixed mapping target is not covered by the whitelist.
    UnsupportedTarget { from: String, to: String },
    /// A mapping exists but there is no whitelist to validate targets against.
    MappingWithoutWhitelist,
    /// A pattern uses `*` outside the single-suffix form.
    MalformedPattern(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::UnsupportedTarget { from, to } => write!(
                f,
                "invalid model mapping: '{}' -> '{}', target model '{}' not in supported_models",
                from, to, to
            ),
            Violation::MappingWithoutWhitelist => f.write_str(
                "model_mapping configured without supported_models, target models cannot be validated",
            ),
            Violation::MalformedPattern(pattern) => write!(
                f,
                "malformed wildcard pattern '{}': only a single trailing '*' is allowed",
                pattern
            ),
        }
    }
}

/// Validate the link between `model_mapping` and `supported_models`.
///
/// Checked on write paths only; live requests never consult this.
pub fn validate_configuration(provider: &Provider) -> Vec<Violation> {
    let mut violations = Vec::new();

    for pattern in provider
        .supported_models
        .iter()
        .chain(provider.model_mapping.keys().map(String::as_str))
    {
        if is_malformed(pattern) {
            violations.push(Violation::MalformedPattern(pattern.to_string()));
        }
    }
    for replacement in provider.model_mapping.values() {
        if replacement.matches('*').count() > 1 {
            violations.push(Violation::MalformedPattern(replacement.clone()));
        }
    }

    if provider.model_mapping.is_empty() {
        return violations;
    }

    if provider.supported_models.is_empty() {
        violations.push(Violation::MappingWithoutWhitelist);
        return violations;
    }

    let mut mappings: Vec<_> = provider.model_mapping.iter().collect();
    mappings.sort();
    for (from, to) in mappings {
        if to.contains('*') {
            continue;
        }
        if !is_model_supported(provider, to) {
            violations.push(Violation::UnsupportedTarget {
                from: from.clone(),
                to: to.clone(),
            });
        }
    }

    violations
}

/// Providers able to serve `model`, with the outbound model resolved,
/// ordered by priority. Ties keep input order.
pub fn match_model(providers: &[Arc<Provider>], model: &str) -> Vec<MatchedProvider> {
    let mut matched: Vec<MatchedProvider> = providers
        .iter()
        .filter(|p| is_model_supported(p, model))
        .map(|p| MatchedProvider {
            provider: Arc::clone(p),
            mapped_model: effective_model(p, model),
            priority: p.priority,
        })
        .collect();
    matched.sort_by_key(|m| m.priority);
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ModelSet;
    use std::collections::HashMap;

    fn provider(supported: &[&str], mapping: &[(&str, &str)]) -> Provider {
        Provider {
            id: 0,
            name: "test".to_string(),
            api_url: "http://localhost".to_string(),
            api_key: "sk".to_string(),
            platform: None,
            enabled: true,
            priority: 0,
            supported_models: supported.iter().copied().collect::<ModelSet>(),
            model_mapping: mapping
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_empty_whitelist_allows_everything() {
        let p = provider(&[], &[]);
        for model in ["claude-3-opus", "gpt-4", "", "anything/at-all"] {
            assert!(is_model_supported(&p, model));
        }
    }

    #[test]
    fn test_exact_and_wildcard_support() {
        let p = provider(&["claude-3-opus", "gpt-*"], &[]);
        assert!(is_model_supported(&p, "claude-3-opus"));
        assert!(!is_model_supported(&p, "claude-3-sonnet"));
        assert!(is_model_supported(&p, "gpt-"));
        assert!(is_model_supported(&p, "gpt-4o-mini"));
        assert!(!is_model_supported(&p, "gemini-pro"));
        assert!(!is_model_supported(&p, "xgpt-4"));
    }

    #[test]
    fn test_effective_model_without_match_is_identity() {
        let p = provider(&[], &[]);
        assert_eq!(effective_model(&p, "claude-3-opus"), "claude-3-opus");

        let p = provider(&["*"], &[("gpt-4", "openai/gpt-4"), ("gemini-*", "g/*")]);
        assert_eq!(effective_model(&p, "claude-3-opus"), "claude-3-opus");
    }

    #[test]
    fn test_effective_model_mappings() {
        let p = provider(
            &["anthropic/*", "openai/gpt-4"],
            &[
                ("gpt-4", "openai/gpt-4"),
                ("claude-*", "anthropic/claude-*"),
                ("claude-3-*", "anthropic/v3-*"),
                ("haiku-*", "anthropic/haiku"),
            ],
        );
        assert_eq!(effective_model(&p, "gpt-4"), "openai/gpt-4");
        assert_eq!(effective_model(&p, "claude-2.1"), "anthropic/claude-2.1");
        assert_eq!(effective_model(&p, "claude-3-opus"), "anthropic/v3-opus");
        assert_eq!(effective_model(&p, "haiku-fast"), "anthropic/haiku");
    }

    #[test]
    fn test_wildcard_mapping_round_trip() {
        let p = provider(&["anthropic/*"], &[("claude-*", "anthropic/claude-*")]);
        assert_eq!(effective_model(&p, "claude-3-opus"), "anthropic/claude-3-opus");
    }

    #[test]
    fn test_validate_configuration() {
        let ok = provider(
            &["openai/gpt-4", "anthropic/*"],
            &[("gpt-4", "openai/gpt-4"), ("claude", "anthropic/claude-3")],
        );
        assert!(validate_configuration(&ok).is_empty());

        let bad_target = provider(&["openai/gpt-4"], &[("gpt-5", "openai/gpt-5")]);
        assert_eq!(
            validate_configuration(&bad_target),
            vec![Violation::UnsupportedTarget {
                from: "gpt-5".to_string(),
                to: "openai/gpt-5".to_string()
            }]
        );

        let no_whitelist = provider(&[], &[("gpt-4", "openai/gpt-4")]);
        assert_eq!(
            validate_configuration(&no_whitelist),
            vec![Violation::MappingWithoutWhitelist]
        );

        let wildcard_target = provider(&["x"], &[("claude-*", "anthropic/claude-*")]);
        assert!(validate_configuration(&wildcard_target).is_empty());

        let malformed = provider(&["a*b"], &[]);
        assert_eq!(
            validate_configuration(&malformed),
            vec![Violation::MalformedPattern("a*b".to_string())]
        );
    }

    #[test]
    fn test_match_model_orders_by_priority() {
        let mut a = provider(&["claude-*"], &[]);
        a.name = "a".to_string();
        a.priority = 5;
        let mut b = provider(&[], &[("claude-*", "vendor/claude-*")]);
        b.name = "b".to_string();
        b.priority = 1;
        let mut c = provider(&["gpt-*"], &[]);
        c.name = "c".to_string();
        c.priority = 0;

        let providers: Vec<_> = vec![a, b, c].into_iter().map(Arc::new).collect();
        let matched = match_model(&providers, "claude-3-opus");
        let names: Vec<_> = matched.iter().map(|m| m.provider.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(matched[0].mapped_model, "vendor/claude-3-opus");
        assert_eq!(matched[1].mapped_model, "claude-3-opus");
    }
}
