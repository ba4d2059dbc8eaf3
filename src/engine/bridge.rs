//! HTTP client for the browser sidecar.
//!
//! All browser operations go through this client, which talks to the
//! Flask + Playwright bridge via HTTP on a localhost port. One bridge serves
//! many isolated contexts, addressed by caller-chosen identifiers.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use super::{BrowserDriver, ContextProfile, DriverCookie, EngineError};

/// Default port the browser bridge listens on.
pub const DEFAULT_BRIDGE_PORT: u16 = 9224;

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout. Navigation can legitimately take a while, so this
/// sits above the in-page action timeout.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// In-page Playwright timeout sent with navigation and click actions.
const ACTION_TIMEOUT_MS: u64 = 30_000;

/// Number of health-check retries before giving up.
const HEALTH_CHECK_RETRIES: u32 = 5;

/// Delay between health-check attempts in milliseconds.
const HEALTH_CHECK_DELAY_MS: u64 = 2000;

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Client for the browser bridge HTTP API.
pub struct BridgeClient {
    client: reqwest::Client,
    base_url: String,
}

impl BridgeClient {
    /// Create a new client pointing at the given base URL.
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self { client, base_url }
    }

    /// Create a client connecting to `http://127.0.0.1:{port}`.
    pub fn with_port(port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{port}"))
    }

    /// Returns the base URL of the bridge.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check whether the bridge is up.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Wait for the bridge to become healthy, retrying with a fixed delay.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Driver`] when the bridge never answers.
    pub async fn wait_healthy(&self) -> Result<(), EngineError> {
        for attempt in 0..HEALTH_CHECK_RETRIES {
            if self.health_check().await {
                return Ok(());
            }
            if attempt < HEALTH_CHECK_RETRIES.saturating_sub(1) {
                tokio::time::sleep(std::time::Duration::from_millis(HEALTH_CHECK_DELAY_MS)).await;
            }
        }
        Err(EngineError::Driver(format!(
            "browser bridge at {} not healthy after {HEALTH_CHECK_RETRIES} attempts",
            self.base_url
        )))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(driver_err)?;
        unwrap_envelope(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(driver_err)?;
        unwrap_envelope(resp).await
    }
}

fn driver_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Driver(e.to_string())
}

async fn unwrap_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, EngineError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(EngineError::Driver(format!(
            "bridge returned HTTP {status}"
        )));
    }
    let body: BridgeResponse<T> = resp.json().await.map_err(driver_err)?;
    if !body.success {
        return Err(EngineError::Driver(
            body.error.unwrap_or_else(|| "bridge reported failure".to_owned()),
        ));
    }
    body.data
        .ok_or_else(|| EngineError::Driver("bridge reply carried no data".to_owned()))
}

#[async_trait]
impl BrowserDriver for BridgeClient {
    async fn create_context(
        &self,
        context_id: &str,
        profile: &ContextProfile,
    ) -> Result<(), EngineError> {
        let body = serde_json::json!({
            "context_id": context_id,
            "width": profile.width,
            "height": profile.height,
            "user_agent": profile.user_agent,
            "locale": profile.locale,
            "timezone": profile.timezone,
        });
        let _: serde_json::Value = self.post("/contexts", &body).await?;
        Ok(())
    }

    async fn goto(&self, context_id: &str, url: &str) -> Result<String, EngineError> {
        let body = serde_json::json!({ "url": url, "timeout_ms": ACTION_TIMEOUT_MS });
        let data: serde_json::Value = self
            .post(&format!("/contexts/{context_id}/goto"), &body)
            .await?;
        Ok(data
            .get("url")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(url)
            .to_owned())
    }

    async fn click(&self, context_id: &str, selector: &str) -> Result<(), EngineError> {
        let body = serde_json::json!({ "selector": selector, "timeout_ms": ACTION_TIMEOUT_MS });
        let _: serde_json::Value = self
            .post(&format!("/contexts/{context_id}/click"), &body)
            .await?;
        Ok(())
    }

    async fn screenshot(
        &self,
        context_id: &str,
        selector: Option<&str>,
    ) -> Result<String, EngineError> {
        let body = serde_json::json!({ "selector": selector });
        self.post(&format!("/contexts/{context_id}/screenshot"), &body)
            .await
    }

    async fn evaluate(
        &self,
        context_id: &str,
        javascript: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let body = serde_json::json!({ "javascript": javascript });
        self.post(&format!("/contexts/{context_id}/evaluate"), &body)
            .await
    }

    async fn current_url(&self, context_id: &str) -> Result<String, EngineError> {
        self.get(&format!("/contexts/{context_id}/url")).await
    }

    async fn cookies(&self, context_id: &str) -> Result<Vec<DriverCookie>, EngineError> {
        self.get(&format!("/contexts/{context_id}/cookies")).await
    }

    async fn close_context(&self, context_id: &str) -> Result<(), EngineError> {
        let url = format!("{}/contexts/{context_id}", self.base_url);
        let resp = self.client.delete(&url).send().await.map_err(driver_err)?;
        if !resp.status().is_success() {
            return Err(EngineError::Driver(format!(
                "bridge returned HTTP {} closing context",
                resp.status()
            )));
        }
        Ok(())
    }
}
