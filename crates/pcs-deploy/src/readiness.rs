//! Wait for the deployed website to come up
//!
//! The web front end sits behind a TLS proxy that reports its own health at
//! `/ssl-proxy-status`. The prober keeps asking until the proxy says it is
//! alive or the attempt budget is spent. It never fails: a site that is slow
//! to start is a warning for the user, not a failed deployment.

use std::time::Duration;

use pcs_common::retry::{retry_with_backoff, RetryConfig};
use pcs_common::{Error, Result, MAX_RETRY};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{info, warn};

/// Health path relative to the site URL
pub const HEALTH_PATH: &str = "ssl-proxy-status";

/// Substring of `Status` that means healthy
pub const ALIVE_MARKER: &str = "Alive";

/// Interval between probes
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ProxyStatus {
    #[serde(rename = "Status")]
    status: String,
}

/// Polls a site's health endpoint
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    http: HttpClient,
    retry: RetryConfig,
}

impl ReadinessProber {
    /// Prober with the default schedule (every 10s, 36 attempts)
    pub fn new() -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            retry: RetryConfig::fixed(PROBE_INTERVAL, MAX_RETRY).quiet(),
        })
    }

    /// Override the probe schedule
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry.quiet();
        self
    }

    /// Health URL for a site
    pub fn health_url(site: &str) -> String {
        format!("{}/{}", site.trim_end_matches('/'), HEALTH_PATH)
    }

    async fn probe(&self, url: &str) -> std::result::Result<(), String> {
        let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;
        let status: ProxyStatus = response
            .json()
            .await
            .map_err(|e| format!("unexpected health response: {}", e))?;
        if status.status.contains(ALIVE_MARKER) {
            Ok(())
        } else {
            Err(format!("proxy status is {}", status.status))
        }
    }

    /// Whether `site` reported alive within the attempt budget
    pub async fn wait_until_ready(&self, site: &str) -> bool {
        let url = Self::health_url(site);
        let ready = retry_with_backoff(&self.retry, "waiting for website", |_: &String| true, || {
            self.probe(&url)
        })
        .await;

        match ready {
            Ok(()) => {
                info!(url = %site, "Website is ready");
                true
            }
            Err(e) => {
                warn!(url = %site, error = %e, "Website did not become ready");
                false
            }
        }
    }
}
