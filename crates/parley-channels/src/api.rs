//! Remote routing API
//!
//! - `GET {base}/channels/{id}`         -> `Channel`
//! - `GET {base}/channels/{id}/routing` -> `ChannelRouting` document
//!
//! 404 means the channel is unknown. Connection failures and 5xx answers are
//! transient `UpstreamError`s; other 4xx answers and unreadable bodies are not.

use async_trait::async_trait;
use parley_core::{
    Channel, ChannelRepository, ChannelRoutingConfig, ChannelRoutingRepository, Result, RuntimeError,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::document::ChannelRoutingDocument;

/// Truncate upstream error bodies in messages
const MAX_ERROR_BODY: usize = 200;

/// Shared HTTP plumbing for both API repositories
#[derive(Clone)]
struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ApiClient {
    fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|e| RuntimeError::configuration(format!("invalid routing API base URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(RuntimeError::configuration(format!(
                "routing API base URL '{}' must be an http(s) URL",
                base_url
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    fn url(&self, segments: &[&str], subset: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if let Some(subset) = subset {
            url.query_pairs_mut().append_pair("subset", subset);
        }
        url
    }

    /// `Ok(None)` on 404
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        debug!("GET {}", url);
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RuntimeError::upstream(format!("GET {} failed: {}", url, e), true))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(RuntimeError::upstream(
                format!("GET {} returned {}: {}", url, status, body),
                status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RuntimeError::upstream(format!("reading {} failed: {}", url, e), true))?;
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| RuntimeError::upstream(format!("unreadable response from {}: {}", url, e), false))
    }
}

/// Channel routing fetched from a remote API, optionally for one subset
#[derive(Debug, Clone)]
pub struct ApiChannelRoutingRepository {
    api: ApiClient,
    subset: Option<String>,
}

impl ApiChannelRoutingRepository {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(base_url, timeout)?,
            subset: None,
        })
    }

    pub fn with_subset(mut self, subset: Option<String>) -> Self {
        self.subset = subset.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.api.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn base_url(&self) -> &str {
        self.api.base_url.as_str()
    }
}

#[async_trait]
impl ChannelRoutingRepository for ApiChannelRoutingRepository {
    fn backend(&self) -> &str {
        "api"
    }

    async fn lookup(&self, channel_id: &str) -> Result<Option<ChannelRoutingConfig>> {
        let url = self
            .api
            .url(&["channels", channel_id, "routing"], self.subset.as_deref());
        let Some(document) = self.api.get_json::<ChannelRoutingDocument>(url).await? else {
            return Ok(None);
        };

        let config = document
            .to_config()
            .map_err(|e| RuntimeError::upstream(format!("routing for '{}' rejected: {}", channel_id, e), false))?;
        if config.channel_id != channel_id {
            return Err(RuntimeError::upstream(
                format!(
                    "asked for routing of '{}' but the API answered for '{}'",
                    channel_id, config.channel_id
                ),
                false,
            ));
        }
        Ok(Some(config))
    }
}

/// Channel metadata fetched from the same remote API
#[derive(Debug, Clone)]
pub struct ApiChannelRepository {
    api: ApiClient,
}

impl ApiChannelRepository {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(base_url, timeout)?,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.api.token = token.filter(|t| !t.is_empty());
        self
    }
}

#[async_trait]
impl ChannelRepository for ApiChannelRepository {
    async fn lookup(&self, channel_id: &str) -> Result<Option<Channel>> {
        let url = self.api.url(&["channels", channel_id], None);
        self.api.get_json::<Channel>(url).await
    }
}
