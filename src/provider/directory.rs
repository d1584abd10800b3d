// Provider Directory - read-through access to the provider service

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::cache::ProviderCache;
use super::matcher;
use super::{MatchedProvider, Platform, Provider};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to reach provider service: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider service returned {0}")]
    Status(u16),
}

#[derive(Debug, Deserialize)]
struct ProvidersEnvelope<T> {
    #[serde(default = "Vec::new")]
    providers: Vec<T>,
}

/// HTTP client for the external provider service.
#[derive(Debug, Clone)]
pub struct RemoteDirectory {
    endpoint: String,
    http_client: reqwest::Client,
}

impl RemoteDirectory {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DirectoryError> {
        let mut endpoint = endpoint.into();
        while endpoint.ends_with('/') {
            endpoint.pop();
        }
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint,
            http_client,
        })
    }

    pub async fn list(&self, platform: Platform) -> Result<Vec<Provider>, DirectoryError> {
        let url = format!("{}/api/v1/providers", self.endpoint);
        let response = self
            .http_client
            .get(&url)
            .query(&[("platform", platform.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }

        let envelope: ProvidersEnvelope<Provider> = response.json().await?;
        Ok(envelope.providers)
    }

    pub async fn match_model(
        &self,
        platform: Platform,
        model: &str,
    ) -> Result<Vec<MatchedProvider>, DirectoryError> {
        let url = format!("{}/api/v1/providers/match", self.endpoint);
        let response = self
            .http_client
            .get(&url)
            .query(&[("platform", platform.as_str()), ("model", model)])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }

        let envelope: ProvidersEnvelope<MatchedProvider> = response.json().await?;
        Ok(envelope.providers)
    }
}

/// Where provider records come from.
#[derive(Debug, Clone)]
pub enum ProviderSource {
    /// The provider service.
    Remote(RemoteDirectory),
    /// A fixed list, e.g. from the config file when running offline.
    Static(Vec<Arc<Provider>>),
}

pub struct ProviderDirectory {
    source: ProviderSource,
    cache: ProviderCache,
    cache_ttl: Duration,
}

impl ProviderDirectory {
    pub fn new(source: ProviderSource, cache_ttl: Duration) -> Self {
        Self {
            source,
            cache: ProviderCache::new(),
            cache_ttl,
        }
    }

    /// Enabled providers for a platform, ascending by priority. Ties keep the
    /// directory's order.
    pub async fn list_enabled(&self, platform: Platform) -> Result<Vec<Arc<Provider>>, DirectoryError> {
        if let Some(providers) = self.cache.get(platform) {
            return Ok(providers);
        }

        let fetched: Vec<Arc<Provider>> = match &self.source {
            ProviderSource::Remote(remote) => {
                remote.list(platform).await?.into_iter().map(Arc::new).collect()
            }
            ProviderSource::Static(providers) => providers
                .iter()
                .filter(|p| p.platform.map_or(true, |pf| pf == platform))
                .cloned()
                .collect(),
        };

        let mut enabled: Vec<Arc<Provider>> = fetched.into_iter().filter(|p| p.enabled).collect();
        enabled.sort_by_key(|p| p.priority);

        tracing::debug!(
            "[ProviderDirectory] Loaded {} enabled providers for {}",
            enabled.len(),
            platform
        );
        self.cache.set(platform, enabled.clone(), self.cache_ttl);
        Ok(enabled)
    }

    /// Providers able to serve `model`, in routing order.
    pub async fn match_model(
        &self,
        platform: Platform,
        model: &str,
    ) -> Result<Vec<MatchedProvider>, DirectoryError> {
        match &self.source {
            ProviderSource::Remote(remote) => remote.match_model(platform, model).await,
            ProviderSource::Static(_) => {
                let providers = self.list_enabled(platform).await?;
                Ok(matcher::match_model(&providers, model))
            }
        }
    }

    /// Drop cached lists after an administrative change. `None` drops all.
    pub fn invalidate(&self, platform: Option<Platform>) {
        match platform {
            Some(platform) => self.cache.invalidate(platform),
            None => self.cache.clear(),
        }
    }
}
