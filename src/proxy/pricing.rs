// Price table - estimated cost of a request from its token counts

use serde::{Deserialize, Serialize};

use super::usage::TokenUsage;
use crate::provider::matcher::wildcard_prefix;

/// Prices in currency units per million tokens for models matching `model`,
/// which may end in a single `*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PriceEntry {
    pub model: String,
    #[serde(default)]
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
    #[serde(default)]
    pub cache_read_per_million: f64,
    #[serde(default)]
    pub cache_creation_per_million: f64,
}

impl PriceEntry {
    fn cost(&self, usage: &TokenUsage) -> f64 {
        let per_token = |count: u64, price: f64| count as f64 * price / 1_000_000.0;
        per_token(usage.input_tokens, self.input_per_million)
            + per_token(usage.output_tokens, self.output_per_million)
            + per_token(usage.cache_read_tokens, self.cache_read_per_million)
            + per_token(usage.cache_creation_tokens, self.cache_creation_per_million)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    entries: Vec<PriceEntry>,
}

impl PriceTable {
    pub fn new(entries: Vec<PriceEntry>) -> Self {
        Self { entries }
    }

    /// Exact entry first, then the longest matching wildcard.
    pub fn lookup(&self, model: &str) -> Option<&PriceEntry> {
        if let Some(exact) = self.entries.iter().find(|e| e.model == model) {
            return Some(exact);
        }
        self.entries
            .iter()
            .filter_map(|e| wildcard_prefix(&e.model).map(|prefix| (prefix, e)))
            .filter(|(prefix, _)| model.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, e)| e)
    }

    /// Zero when the model has no price.
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.lookup(model).map_or(0.0, |e| e.cost(usage))
    }
}
