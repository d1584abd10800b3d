// Provider module - backend provider records, matching and lookup

pub mod cache;
pub mod directory;
pub mod matcher;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use cache::ProviderCache;
pub use directory::{DirectoryError, ProviderDirectory, ProviderSource, RemoteDirectory};
pub use matcher::{effective_model, is_model_supported, match_model, validate_configuration, Violation};

/// Inbound API dialect. The wire names match the provider directory's
/// `platform` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Messages API (`/v1/messages`)
    Claude,
    /// OpenAI-style chat/completions API
    Codex,
    /// Generative-model API (`/v1beta/models/...`)
    Gemini,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Claude, Platform::Codex, Platform::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Claude => "claude",
            Platform::Codex => "codex",
            Platform::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Platform::Claude),
            "codex" => Ok(Platform::Codex),
            "gemini" => Ok(Platform::Gemini),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Model whitelist. Accepts either a JSON array of names or the directory's
/// `{"model": true}` object form; entries mapped to `false` are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSet(BTreeSet<String>);

impl ModelSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.0.contains(model)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ModelSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl Serialize for ModelSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ModelSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            List(Vec<String>),
            Flags(HashMap<String, bool>),
        }

        Ok(match Option::<Repr>::deserialize(deserializer)? {
            None => ModelSet::default(),
            Some(Repr::List(models)) => models.into_iter().collect(),
            Some(Repr::Flags(flags)) => flags
                .into_iter()
                .filter_map(|(model, on)| on.then_some(model))
                .collect(),
        })
    }
}

fn default_enabled() -> bool {
    true
}

/// A backend endpoint implementing one platform's dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    #[serde(default)]
    pub id: i64,

    pub name: String,

    #[serde(default, alias = "api-url", alias = "base_url")]
    pub api_url: String,

    #[serde(default, alias = "api-key")]
    pub api_key: String,

    #[serde(default)]
    pub platform: Option<Platform>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Lower is preferred. The directory service calls this `level`.
    #[serde(default, alias = "level")]
    pub priority: i32,

    #[serde(default, alias = "supported-models")]
    pub supported_models: ModelSet,

    #[serde(default, alias = "model-mapping")]
    pub model_mapping: HashMap<String, String>,
}

impl Provider {
    /// True when the provider has enough connection info to be called.
    pub fn is_routable(&self) -> bool {
        !self.api_url.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

/// A provider selected for one request, with the outbound model resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedProvider {
    pub provider: Arc<Provider>,
    pub mapped_model: String,
    pub priority: i32,
}
