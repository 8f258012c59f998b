//! Shared HTTP connection to the platform under test.

use std::fmt;

use reqwest::{Client as HttpClient, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::ConfigError;

/// Where and as whom to connect
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Normalise a platform URL: default to https, no trailing slash.
pub fn normalize_base_url(url: &str) -> Result<String, ConfigError> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::invalid_value("base_url", "must not be empty"));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else if trimmed.contains("://") {
        Err(ConfigError::invalid_value(
            "base_url",
            format!("unsupported scheme in '{trimmed}'"),
        ))
    } else {
        Ok(format!("https://{trimmed}"))
    }
}

/// Cloneable handle on a pooled HTTP client bound to one platform and user.
#[derive(Clone)]
pub struct PlatformClient {
    client: HttpClient,
    base_url: String,
    username: String,
    password: String,
}

impl fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl PlatformClient {
    pub fn new(params: &ConnectionParams, config: &ConnectionConfig) -> Result<Self, ConfigError> {
        let base_url = normalize_base_url(&params.base_url)?;

        let client = HttpClient::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| ConfigError::invalid_value("connection", e.to_string()))?;

        debug!(
            target: "loadgauge::connection",
            base_url = %base_url,
            timeout_ms = config.timeout.as_millis() as u64,
            "Platform client created"
        );

        Ok(Self {
            client,
            base_url,
            username: params.username.clone(),
            password: params.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a resource path (leading slash optional)
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
    }
}
