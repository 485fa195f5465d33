//! HTTP/JSON client for the upstream blockchain daemon.
//!
//! The daemon is the single source of block templates and the only
//! authority on block acceptance. All calls carry a bounded timeout so a
//! stalled daemon can never wedge the pool; callers translate errors into
//! "no template" or a failed submission and keep serving miners.

use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Daemon connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Base URL, e.g. `http://127.0.0.1:22000`
    pub url: String,

    /// Optional `X-API-Key` header value
    pub api_key: Option<String>,

    /// Optional basic-auth credentials
    pub username: Option<String>,
    pub password: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            url: "http://127.0.0.1:22000".to_string(),
            api_key: None,
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

/// Daemon client errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Connection refused, DNS failure, timeout
    #[error("Daemon transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The daemon answered with a non-success status
    #[error("Daemon rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The daemon answered with a body the pool cannot interpret
    #[error("Invalid daemon response: {0}")]
    InvalidResponse(String),
}

impl DaemonError {
    /// Whether the error is a definitive rejection (4xx) rather than a
    /// transport problem. Rejections are never retried.
    pub fn is_rejection(&self) -> bool {
        matches!(self, DaemonError::Rejected { status, .. } if (400..500).contains(status))
    }
}

/// Block payload submitted to the daemon on a solved block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSubmission {
    pub index: u64,
    pub hash: String,
    pub previous_hash: String,
    pub merkle_root: String,
    pub timestamp: u64,
    pub nonce: u64,
    pub difficulty: u64,
    pub transactions: Vec<Value>,
    pub algorithm: String,
}

/// Stateless HTTP client for the daemon's mining API.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    http: reqwest::Client,
    config: DaemonConfig,
}

impl DaemonClient {
    /// Builds a client with the configured request timeout baked in.
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(DaemonClient { http, config })
    }

    /// Fetches the current block template.
    ///
    /// Returns the raw template object; validation happens at the
    /// TemplateManager ingest boundary.
    pub async fn fetch_template(&self, pool_address: &str) -> Result<Value, DaemonError> {
        let url = format!("{}/api/mining/template", self.config.url);

        let request = self
            .http
            .get(&url)
            .query(&[("address", pool_address)]);

        let response = self.authenticate(request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DaemonError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await?;

        // Some daemon versions wrap the template in an envelope.
        let template = match body.get("template") {
            Some(inner) => inner.clone(),
            None => body,
        };

        if !template.is_object() {
            return Err(DaemonError::InvalidResponse(
                "template body is not an object".to_string(),
            ));
        }

        debug!(
            "Fetched template at height {}",
            template.get("index").and_then(Value::as_u64).unwrap_or(0)
        );

        Ok(template)
    }

    /// Submits a solved block. `Ok(())` means the daemon accepted it.
    pub async fn submit_block(&self, block: &BlockSubmission) -> Result<(), DaemonError> {
        let url = format!("{}/api/blocks/submit", self.config.url);
        let body = serde_json::json!({ "block": block });

        let request = self.http.post(&url).json(&body);
        let response = self.authenticate(request).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
            })
            .unwrap_or(text);

        Err(DaemonError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    /// Probes the daemon's health endpoint.
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/health", self.config.url);

        match self.authenticate(self.http.get(&url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Daemon health check failed: {}", e);
                false
            }
        }
    }

    fn authenticate(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = &self.config.api_key {
            request.header("X-API-Key", key)
        } else if let Some(user) = &self.config.username {
            request.basic_auth(user, self.config.password.as_deref())
        } else {
            request
        }
    }
}
