//! HTTP liveness probe
//!
//! A route is alive when a GET on it answers with a success status and a
//! body containing a `<title>...</title>` tag.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Text between the first `<title>` and the following `</title>`
pub fn extract_title(body: &str) -> Option<&str> {
    let start = body.find("<title>")? + "<title>".len();
    let len = body[start..].find("</title>")?;
    Some(body[start..start + len].trim())
}

/// URL probed for a route: `{scheme}://{host}{path}`
pub fn route_url(scheme: &str, host: &str, path: &str) -> String {
    format!("{}://{}{}", scheme, host, path)
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Probe `url`, returning the observed title on success
    async fn check(&self, url: &str) -> Result<String>;
}

/// Liveness probe over reqwest with an explicit per-request timeout
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn from_config(config: &crate::config::SupervisorConfig) -> Result<Self> {
        Self::new(config.probe_timeout(), config.accept_invalid_certs)
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn check(&self, url: &str) -> Result<String> {
        let liveness = |reason: String| Error::Liveness {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| liveness(e.to_string()))?
            .error_for_status()
            .map_err(|e| liveness(e.to_string()))?;
        let body = response.text().await.map_err(|e| liveness(e.to_string()))?;

        match extract_title(&body) {
            Some(title) => {
                debug!(url, title, "Liveness probe passed");
                Ok(title.to_string())
            }
            None => Err(liveness("response body has no <title> tag".to_string())),
        }
    }
}
