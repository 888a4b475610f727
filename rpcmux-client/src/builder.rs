//! Client builder.
//!
//! Provides a fluent API for configuring and building an [`RpcClient`].

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Uri};

use crate::batch::BatchTransport;
use crate::client::RpcClient;
use crate::transport::HttpBatchTransport;

/// Builder for creating an [`RpcClient`].
///
/// # Example
///
/// ```ignore
/// use rpcmux_client::ClientBuilder;
/// use std::time::Duration;
///
/// let client = ClientBuilder::new("http://localhost:3000/trpc")
///     .timeout(Duration::from_secs(5))
///     .header("authorization", "Bearer token")
///     .max_batch_size(16)
///     .build()?;
/// ```
pub struct ClientBuilder {
    /// Base URL batched calls are sent under.
    base_url: String,
    /// Timeout for each physical call.
    timeout: Option<Duration>,
    /// Extra headers sent with every physical call.
    headers: Vec<(String, String)>,
    /// Cap on operations per batch.
    max_batch_size: Option<usize>,
    /// Custom transport replacing the HTTP one.
    transport: Option<Arc<dyn BatchTransport>>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("headers", &self.headers.len())
            .field("max_batch_size", &self.max_batch_size)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

impl ClientBuilder {
    /// Create a new ClientBuilder with the given base URL.
    ///
    /// The base URL should include the scheme and host, e.g.,
    /// "http://localhost:3000/trpc". A trailing slash is ignored.
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: None,
            headers: Vec::new(),
            max_batch_size: None,
            transport: None,
        }
    }

    /// Set the timeout for each physical call.
    ///
    /// An elapsed timeout fails every operation of the batch with `TIMEOUT`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a header sent with every physical call.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Close a batch window early once `max` operations have joined it.
    ///
    /// By default batches are unbounded.
    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = Some(max);
        self
    }

    /// Send batches through a custom transport instead of HTTP.
    ///
    /// The base URL, timeout and headers are not used in that case.
    pub fn transport(mut self, transport: Arc<dyn BatchTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<RpcClient, ClientBuildError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let base_url = self.base_url.trim_end_matches('/').to_string();
                let uri: Uri = base_url
                    .parse()
                    .map_err(|e| ClientBuildError::InvalidBaseUrl(format!("{}: {}", base_url, e)))?;
                if uri.scheme().is_none() || uri.authority().is_none() {
                    return Err(ClientBuildError::InvalidBaseUrl(format!(
                        "{}: scheme and host are required",
                        base_url
                    )));
                }

                let mut headers = HeaderMap::new();
                for (name, value) in &self.headers {
                    let name: HeaderName = name
                        .parse()
                        .map_err(|_| ClientBuildError::InvalidHeader(name.clone()))?;
                    let value: HeaderValue = value
                        .parse()
                        .map_err(|_| ClientBuildError::InvalidHeader(name.to_string()))?;
                    headers.append(name, value);
                }

                Arc::new(HttpBatchTransport::new(base_url, headers, self.timeout))
            }
        };

        Ok(RpcClient::from_transport(transport, self.max_batch_size))
    }
}

/// Error building a client.
#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    /// The base URL is not an absolute URL.
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// A header name or value is not valid HTTP.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}
