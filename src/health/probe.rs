//! Health probes.

use std::time::Duration;

use futures_util::future::BoxFuture;
use url::Url;

/// Answers whether the endpoint at `url` is alive.
pub trait HealthProbe: Send + Sync {
    fn probe<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, bool>;
}

/// GET probe; any 2xx within the timeout is healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("classification-mesh-health-check")
            .build()?;
        Ok(Self { client })
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let success = response.status().is_success();
                    if !success {
                        tracing::warn!(url = %url, status = %response.status(), "Health check failed: non-success status");
                    }
                    success
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!(url = %url, "Health check failed: timeout");
                    false
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Health check failed: connection error");
                    false
                }
            }
        })
    }
}
