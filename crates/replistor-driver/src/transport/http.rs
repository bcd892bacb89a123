use crate::protocol::{BackendRequest, CallReply};
use crate::transport::{Connection, Connector};
use async_trait::async_trait;
use replistor_core::{DriverError, Result};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Connector for a control plane that accepts JSON calls over HTTP
///
/// Each call is `POST {endpoint}/v1/call` with a `BackendRequest` body and
/// answers with a `CallReply`. Every connect builds a fresh client, so a
/// reconnect drops any pooled sockets to a restarted backend.
pub struct HttpConnector {
    endpoint: String,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let client = Client::builder()
            .connect_timeout(self.timeout)
            .build()
            .map_err(|e| {
                DriverError::connection_failure(format!("Failed to build HTTP client: {}", e))
            })?;
        debug!("HTTP client ready for {}", self.endpoint);
        Ok(Arc::new(HttpConnection {
            url: format!("{}/v1/call", self.endpoint),
            client,
        }))
    }
}

struct HttpConnection {
    url: String,
    client: Client,
}

#[async_trait]
impl Connection for HttpConnection {
    async fn call(&self, request: &BackendRequest) -> Result<CallReply> {
        let operation = request.operation();
        debug!("POST {} ({})", self.url, operation);

        let resp = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_send_error(operation, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(operation, status, body));
        }

        resp.json::<CallReply>().await.map_err(|e| {
            DriverError::generic(
                operation,
                "DECODE_ERROR",
                format!("Failed to parse reply: {}", e),
                &[],
            )
        })
    }
}

/// Socket-level send failures are connection failures; anything else the
/// client rejects is a generic error
fn classify_send_error(operation: &str, err: reqwest::Error) -> DriverError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        DriverError::connection_failure(format!("'{}' request failed: {}", operation, err))
    } else {
        DriverError::generic(operation, "HTTP_ERROR", err.to_string(), &[])
    }
}

/// Gateway errors mean a proxy could not reach the control plane, which is
/// a connection failure; any other non-2xx status is a generic error
fn classify_status(operation: &str, status: StatusCode, body: String) -> DriverError {
    let code = status.as_u16();
    if matches!(code, 502..=504) {
        DriverError::connection_failure(format!(
            "'{}' answered HTTP {} by gateway: {}",
            operation, code, body
        ))
    } else {
        DriverError::generic(operation, format!("HTTP {}", code), body, &[])
    }
}
