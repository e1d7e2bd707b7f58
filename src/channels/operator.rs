//! HTTP long-polling client for the operator rendezvous server.
//!
//! `send` POSTs to `/pub` and `recv` GETs `/sub`; both block server-side
//! until the matching peer shows up. The server answers 504 when its
//! poll window expires, which the client treats as "try again". The
//! overall wait is bounded by whoever awaits us, not by this client.

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::OnceCell;

use super::SignalChannel;
use crate::error::{Error, Result};

/// Per-request deadline. Must exceed the server's poll window so a 504
/// arrives as a response rather than a client-side timeout.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(45);

/// Signal channel backed by an operator broker server.
pub struct OperatorChannel {
    url: String,
    client: reqwest::Client,
    /// Base URL after the one-time plaintext-fallback probe.
    resolved: OnceCell<String>,
}

impl OperatorChannel {
    /// Create a client for the given base URL (typically `https://...`
    /// rewritten from an `operator://` address).
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(OperatorChannel {
            url: url.into(),
            client,
            resolved: OnceCell::new(),
        })
    }

    /// Resolve the base URL, opportunistically falling back from
    /// `https://` to `http://` when the server only speaks plaintext.
    async fn base_url(&self) -> &str {
        self.resolved
            .get_or_init(|| async {
                if let Some(rest) = self.url.strip_prefix("https://") {
                    if self.client.head(&self.url).send().await.is_err() {
                        let insecure = format!("http://{rest}");
                        if self.client.head(&insecure).send().await.is_ok() {
                            tracing::warn!(url = %insecure, "operator server is plaintext, falling back to http");
                            return insecure;
                        }
                    }
                }
                self.url.clone()
            })
            .await
    }
}

#[async_trait]
impl SignalChannel for OperatorChannel {
    async fn send(&self, addr: &str, data: &str) -> Result<()> {
        let base = self.base_url().await;
        tracing::debug!(addr, "operator send");

        loop {
            let response = self
                .client
                .post(format!("{base}/pub"))
                .form(&[("address", addr), ("data", data)])
                .send()
                .await;
            match response {
                Ok(resp) if resp.status() == StatusCode::GATEWAY_TIMEOUT => {
                    tracing::warn!(addr, "operator pub timed out, retrying");
                }
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(addr, "operator pub delivered");
                    return Ok(());
                }
                Ok(resp) => {
                    return Err(Error::Transport(format!(
                        "operator returned {}",
                        resp.status()
                    )))
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!(addr, "operator pub request timed out, retrying");
                }
                Err(e) => return Err(Error::Transport(e.to_string())),
            }
        }
    }

    async fn recv(&self, addr: &str) -> Result<String> {
        let base = self.base_url().await;
        tracing::debug!(addr, "operator recv");

        loop {
            let response = self
                .client
                .get(format!("{base}/sub"))
                .query(&[("address", addr)])
                .send()
                .await;
            match response {
                Ok(resp) if resp.status() == StatusCode::GATEWAY_TIMEOUT => {
                    tracing::warn!(addr, "operator sub timed out, retrying");
                }
                Ok(resp) if resp.status().is_success() => {
                    let data = resp.text().await.map_err(|e| Error::Transport(e.to_string()))?;
                    tracing::info!(addr, "operator sub received");
                    return Ok(data);
                }
                Ok(resp) => {
                    return Err(Error::Transport(format!(
                        "operator returned {}",
                        resp.status()
                    )))
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!(addr, "operator sub request timed out, retrying");
                }
                Err(e) => return Err(Error::Transport(e.to_string())),
            }
        }
    }
}
