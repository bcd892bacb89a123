mod http;

pub use http::HttpConnector;

use crate::protocol::{BackendRequest, CallReply, StatusCode};
use async_trait::async_trait;
use replistor_core::{DriverError, ReconnectPolicy, Result};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// A live connection to the backend control plane
///
/// Implementations report an unusable connection as
/// `DriverError::ConnectionFailure`; domain failures travel as statuses in
/// the returned `CallReply`.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn call(&self, request: &BackendRequest) -> Result<CallReply>;
}

/// Trait for pluggable backend connectors
///
/// `HttpConnector` talks JSON over HTTP to a control plane endpoint.
/// `MockBackend` provides an in-memory backend for tests.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a fresh connection
    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}

#[derive(Clone)]
struct Handle {
    generation: u64,
    connection: Arc<dyn Connection>,
}

/// Backend transport with call-with-reconnect semantics
///
/// A call that fails at the connection level (or times out) is retried
/// exactly once on a freshly established connection. Domain statuses such as
/// NOT_FOUND are never retried. Reconnects are serialized; a caller whose
/// stale handle was already replaced by a concurrent reconnect reuses the new
/// handle.
pub struct BackendTransport {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    current: RwLock<Option<Handle>>,
    reconnect_lock: Mutex<()>,
}

impl BackendTransport {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            current: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
        }
    }

    /// Establish the connection eagerly. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        self.reconnect(None).await.map(|_| ())
    }

    /// Generation of the current connection handle, if any
    pub async fn generation(&self) -> Option<u64> {
        self.current.read().await.as_ref().map(|h| h.generation)
    }

    /// Issue a call, reconnecting and retrying once on connection failure
    pub async fn call(&self, request: &BackendRequest) -> Result<CallReply> {
        let operation = request.operation();
        let existing = self.current.read().await.clone();
        let handle = match existing {
            Some(h) => h,
            None => self
                .reconnect(None)
                .await
                .map_err(|e| escalate(operation, e))?,
        };

        match self.attempt(&handle, request).await {
            Err(e) if e.is_connection_failure() => {
                warn!(
                    "Backend call '{}' failed on connection generation {}: {}; reconnecting",
                    operation, handle.generation, e
                );
                let fresh = self
                    .reconnect(Some(handle.generation))
                    .await
                    .map_err(|e| escalate(operation, e))?;
                self.attempt(&fresh, request)
                    .await
                    .map_err(|e| escalate(operation, e))
            }
            other => other,
        }
    }

    /// Issue a call and check its statuses, tolerating the listed ones
    pub async fn call_checked(
        &self,
        request: &BackendRequest,
        tolerated: &[StatusCode],
    ) -> Result<(StatusCode, CallReply)> {
        let reply = self.call(request).await?;
        let status = reply.check(request, tolerated)?;
        Ok((status, reply))
    }

    async fn attempt(&self, handle: &Handle, request: &BackendRequest) -> Result<CallReply> {
        let timeout = self.policy.call_timeout();
        debug!("Backend call: {}", request.operation());
        match tokio::time::timeout(timeout, handle.connection.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::connection_failure(format!(
                "'{}' timed out after {:?}",
                request.operation(),
                timeout
            ))),
        }
    }

    /// Replace the handle with generation `stale`, or install the first one.
    ///
    /// If another caller already replaced it, the newer handle is returned
    /// without connecting again.
    async fn reconnect(&self, stale: Option<u64>) -> Result<Handle> {
        let _guard = self.reconnect_lock.lock().await;

        let existing = self.current.read().await.clone();
        if let Some(current) = existing {
            if Some(current.generation) != stale {
                return Ok(current);
            }
        }

        let connection =
            match tokio::time::timeout(self.policy.connect_timeout(), self.connector.connect())
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(DriverError::connection_failure(format!(
                        "connect timed out after {:?}",
                        self.policy.connect_timeout()
                    )))
                }
            };

        let mut slot = self.current.write().await;
        let generation = slot.as_ref().map_or(1, |h| h.generation + 1);
        let handle = Handle {
            generation,
            connection,
        };
        *slot = Some(handle.clone());
        info!("Backend connection established (generation {})", generation);
        Ok(handle)
    }
}

/// A connection failure that survived the retry surfaces as a generic error
fn escalate(operation: &str, err: DriverError) -> DriverError {
    match err {
        DriverError::ConnectionFailure { message } => DriverError::generic(
            operation,
            "CONNECTION_FAILURE",
            format!("backend unreachable after reconnect: {}", message),
            &[],
        ),
        other => other,
    }
}
