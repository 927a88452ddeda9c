use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::error::AgentError;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_REDIRECTS: usize = 5;
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
pub const USER_AGENT: &str = concat!("xswitch/", env!("CARGO_PKG_VERSION"));

/// Source of raw subscription bodies.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String, AgentError>;
}

/// HTTP(S) subscription download.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, AgentError> {
        Self::with_timeout(FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AgentError::FetchFailed(format!("http client init: {}", e)))?;
        Ok(Self { client })
    }

    async fn fetch_inner(&self, url: &str) -> Result<String, AgentError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::FetchFailed(describe(e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::FetchFailed(format!("HTTP {}", status.as_u16())));
        }
        if let Some(len) = response.content_length() {
            if len as usize > MAX_BODY_BYTES {
                return Err(AgentError::FetchFailed(format!("body too large: {} bytes", len)));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::FetchFailed(describe(e)))?;
        if bytes.len() > MAX_BODY_BYTES {
            return Err(AgentError::FetchFailed(format!(
                "body too large: {} bytes",
                bytes.len()
            )));
        }
        debug!(bytes = bytes.len(), status = status.as_u16(), "subscription downloaded");
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl SubscriptionSource for HttpFetcher {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String, AgentError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::FetchFailed("cancelled".to_string())),
            result = self.fetch_inner(url) => result,
        }
    }
}

// reqwest 的错误信息会带上完整 URL，订阅 URL 里有 token，不能原样输出
fn describe(e: reqwest::Error) -> String {
    let e = e.without_url();
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        "connection failed".to_string()
    } else if e.is_redirect() {
        format!("too many redirects (> {})", MAX_REDIRECTS)
    } else {
        e.to_string()
    }
}
