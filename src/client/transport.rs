//! Downstream call transports.
//!
//! # Design Decisions
//! - The transport only moves bytes; timeouts, retries and breaking are the
//!   client's job
//! - HTTP 429 and 5xx map to retryable upstream errors, other non-2xx
//!   statuses to terminal ones

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::discovery::ServiceInstance;
use crate::error::{MeshError, MeshResult};

/// The embedding application's call function: `(instance, method, request) → response`.
pub trait ServiceTransport: Send + Sync {
    fn call<'a>(
        &'a self,
        instance: &'a ServiceInstance,
        method: &'a str,
        request: &'a Value,
    ) -> BoxFuture<'a, MeshResult<Value>>;
}

/// JSON over HTTP: `POST {base_url}/{method}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent("classification-mesh")
            .build()?;
        Ok(Self { client })
    }

    async fn post(&self, instance: &ServiceInstance, method: &str, request: &Value) -> MeshResult<Value> {
        let target = instance.service.clone();
        let url = instance
            .base_url()
            .and_then(|base| base.join(method.trim_start_matches('/')))
            .map_err(|e| MeshError::Validation(format!("bad URL for instance '{}': {e}", instance.id)))?;

        let response = self.client.post(url).json(request).send().await.map_err(|e| MeshError::Upstream {
            target: target.clone(),
            message: e.to_string(),
            retryable: e.is_connect() || e.is_timeout() || e.is_request(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MeshError::Upstream {
                target,
                message: format!("status {status}"),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }

        response.json::<Value>().await.map_err(|e| MeshError::Upstream {
            target,
            message: format!("invalid response body: {e}"),
            retryable: false,
        })
    }
}

impl ServiceTransport for HttpTransport {
    fn call<'a>(
        &'a self,
        instance: &'a ServiceInstance,
        method: &'a str,
        request: &'a Value,
    ) -> BoxFuture<'a, MeshResult<Value>> {
        Box::pin(self.post(instance, method, request))
    }
}
