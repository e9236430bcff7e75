//! Sprites API client
//!
//! Thin authenticated HTTP wrapper for sprite CRUD. The interesting
//! machinery (streaming sessions, multiplexed exec, pooling) lives behind
//! the [`Sprite`] handles this client hands out; everything here is plain
//! request/response.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, SpriteError};
use crate::sprite::Sprite;

/// Default Sprites API endpoint; override with `SPRITES_API_URL`
pub const DEFAULT_API_URL: &str = "https://api.sprites.dev";

/// Resource configuration for sprite creation
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpriteConfig {
    /// RAM allocation in MB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_mb: Option<u32>,

    /// Number of CPUs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,

    /// Region to create the sprite in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Persistent storage in GB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_gb: Option<u32>,
}

/// Sprite metadata returned by the list endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct SpriteInfo {
    /// Sprite name (unique per account)
    pub name: String,

    /// Lifecycle state as reported by the server
    #[serde(default)]
    pub status: Option<String>,

    /// Region the sprite runs in
    #[serde(default)]
    pub region: Option<String>,

    /// Creation timestamp (RFC 3339)
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<&'a SpriteConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a HashMap<String, String>>,
}

struct ClientInner {
    http: reqwest::Client,
    base: Url,
    token: String,
}

/// Authenticated client for the Sprites API
#[derive(Clone)]
pub struct SpritesClient {
    inner: Arc<ClientInner>,
}

impl SpritesClient {
    /// Create a client with the given API token
    ///
    /// The base URL comes from `SPRITES_API_URL` when set, otherwise
    /// [`DEFAULT_API_URL`].
    pub fn new(token: &str) -> Self {
        let base = std::env::var("SPRITES_API_URL")
            .ok()
            .and_then(|raw| match Url::parse(&raw) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(error = %e, url = %raw, "ignoring invalid SPRITES_API_URL");
                    None
                }
            })
            .unwrap_or_else(|| Url::parse(DEFAULT_API_URL).expect("default API URL is valid"));
        Self::with_base_url(token, base)
    }

    /// Create a client against a specific API base URL
    pub fn with_base_url(token: &str, base: Url) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                http: reqwest::Client::new(),
                base,
                token: token.to_string(),
            }),
        }
    }

    /// Create a sprite with default resources
    pub async fn create(&self, name: &str) -> Result<Sprite> {
        self.create_with_config(name, None, None).await
    }

    /// Create a sprite with explicit resources and optional labels
    pub async fn create_with_config(
        &self,
        name: &str,
        config: Option<SpriteConfig>,
        labels: Option<HashMap<String, String>>,
    ) -> Result<Sprite> {
        let url = self.api_url("v1/sprites")?;
        let body = CreateRequest {
            name,
            config: config.as_ref(),
            labels: labels.as_ref(),
        };
        let response = self
            .inner
            .http
            .post(url)
            .bearer_auth(&self.inner.token)
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        debug!(name, "sprite created");
        Ok(self.sprite(name))
    }

    /// List all sprites on the account
    pub async fn list(&self) -> Result<Vec<SpriteInfo>> {
        let url = self.api_url("v1/sprites")?;
        let response = self
            .inner
            .http
            .get(url)
            .bearer_auth(&self.inner.token)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Delete a sprite by name
    pub async fn delete(&self, name: &str) -> Result<()> {
        let url = self.api_url(&format!("v1/sprites/{name}"))?;
        let response = self
            .inner
            .http
            .delete(url)
            .bearer_auth(&self.inner.token)
            .send()
            .await?;
        check(response).await?;
        debug!(name, "sprite deleted");
        Ok(())
    }

    /// Get a handle to a sprite without any network I/O
    pub fn sprite(&self, name: &str) -> Sprite {
        Sprite::new(self.clone(), name)
    }

    pub(crate) fn token(&self) -> &str {
        &self.inner.token
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Resolve a path against the API base
    pub(crate) fn api_url(&self, path: &str) -> Result<Url> {
        Ok(self.inner.base.join(path)?)
    }

    /// Resolve a path against the API base with the WebSocket scheme
    pub(crate) fn ws_url(&self, path: &str) -> Result<Url> {
        let mut url = self.api_url(path)?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(SpriteError::Protocol(format!(
                    "cannot derive WebSocket URL from {other} scheme"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| SpriteError::Protocol("cannot derive WebSocket URL".to_string()))?;
        Ok(url)
    }
}

/// Map non-2xx responses to `SpriteError::Api`
pub(crate) async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SpriteError::Api {
        status: status.as_u16(),
        message,
    })
}
