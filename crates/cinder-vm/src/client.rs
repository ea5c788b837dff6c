//! REST client for the Firecracker API socket.
//!
//! Thin by intent: one request per call, no retries, no timeouts beyond the
//! transport's own. Callers decide what a failure means.

use crate::error::{Result, VmError};
use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use std::path::{Path, PathBuf};

/// The two verbs the control API needs.
#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// `GET path`, returning the response body.
    async fn get(&self, path: &str) -> Result<String>;

    /// `PUT path` with a JSON body, returning the response body.
    async fn put(&self, path: &str, body: serde_json::Value) -> Result<String>;
}

/// [`HypervisorApi`] over a unix domain socket.
#[derive(Clone)]
pub struct ApiClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("socket_path", &self.socket_path)
            .finish()
    }
}

impl ApiClient {
    /// Create a client bound to `socket_path`. Nothing is connected until
    /// the first request.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
        }
    }

    /// Get the control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn send(&self, method: Method, path: &str, body: Option<String>) -> Result<String> {
        let start = std::time::Instant::now();
        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();

        let mut builder = Request::builder().method(method.clone()).uri(uri);
        let body = match body {
            Some(b) => {
                tracing::trace!(%method, path, body = %b, "API request body");
                builder = builder.header("Content-Type", "application/json");
                Body::from(b)
            }
            None => Body::empty(),
        };
        builder = builder.header("Accept", "application/json");

        let request = builder
            .body(body)
            .map_err(|e| VmError::Transport(format!("failed to build {method} {path}: {e}")))?;

        let response = self.client.request(request).await.map_err(|e| {
            tracing::error!(%method, path, socket = %self.socket_path.display(), error = %e, "API request failed");
            VmError::Transport(format!("{method} {path}: {e}"))
        })?;

        let status = response.status();
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| VmError::Transport(format!("{method} {path}: reading body: {e}")))?;
        let body_str = String::from_utf8_lossy(&body_bytes).into_owned();

        if !status.is_success() {
            tracing::error!(%method, path, status = %status, body = %body_str, "API call rejected");
            return Err(VmError::Api {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: body_str,
            });
        }

        tracing::debug!(
            %method,
            path,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "API call succeeded"
        );
        Ok(body_str)
    }
}

#[async_trait]
impl HypervisorApi for ApiClient {
    async fn get(&self, path: &str) -> Result<String> {
        self.send(Method::GET, path, None).await
    }

    async fn put(&self, path: &str, body: serde_json::Value) -> Result<String> {
        let body = serde_json::to_string(&body)?;
        self.send(Method::PUT, path, Some(body)).await
    }
}
