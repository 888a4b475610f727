//! HTTP transport for batched calls.
//!
//! [`HttpBatchTransport`] sends one batch as one HTTP request using
//! hyper_util's legacy client:
//!
//! - queries: `GET {base}/{a,b}?batch=1&input=[...]`
//! - mutations and subscriptions: `POST {base}/{a,b}?batch=1` with the input
//!   array as a JSON body

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Method, Request, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rpcmux_core::{BatchRequest, Call, Code, ProcedureKind};
use serde::Serialize;

use crate::ClientError;
use crate::batch::BatchTransport;

/// Type alias for the hyper client used by the transport.
type HyperClient = Client<HttpConnector, Full<Bytes>>;

#[derive(Serialize)]
struct BatchQuery<'a> {
    batch: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<&'a str>,
}

/// Batch transport over plain HTTP/1.1.
#[derive(Clone)]
pub struct HttpBatchTransport {
    client: HyperClient,
    base_url: String,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for HttpBatchTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBatchTransport")
            .field("base_url", &self.base_url)
            .field("headers", &self.headers.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpBatchTransport {
    /// Create a transport for `base_url` (scheme, host and optional prefix,
    /// without a trailing slash).
    pub fn new(base_url: impl Into<String>, headers: HeaderMap, timeout: Option<Duration>) -> Self {
        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_timer(TokioTimer::new());
        builder.pool_idle_timeout(Duration::from_secs(90));

        Self {
            client: builder.build(HttpConnector::new()),
            base_url: base_url.into(),
            headers,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        client: HyperClient,
        request: Request<Full<Bytes>>,
        timeout: Option<Duration>,
    ) -> Result<Bytes, ClientError> {
        let exchange = async {
            let response = client
                .request(request)
                .await
                .map_err(|e| ClientError::Transport(format!("request failed: {}", e)))?;

            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::Transport(format!("failed to read response body: {}", e)))?
                .to_bytes();

            // Batched failures arrive with a non-2xx status and a body of
            // envelopes; those are answers, not transport failures.
            if !status.is_success() && rpcmux_core::decode(&body).is_err() {
                return Err(ClientError::Transport(format!(
                    "unexpected HTTP status {}",
                    status
                )));
            }
            Ok(body)
        };

        match timeout {
            Some(t) => tokio::time::timeout(t, exchange)
                .await
                .map_err(|_| ClientError::new(Code::Timeout, "client timeout exceeded"))?,
            None => exchange.await,
        }
    }
}

impl BatchTransport for HttpBatchTransport {
    fn send_batch(
        &self,
        kind: ProcedureKind,
        calls: Vec<Call>,
    ) -> BoxFuture<'static, Result<Bytes, ClientError>> {
        let request = build_request(&self.base_url, &self.headers, kind, &calls);
        let client = self.client.clone();
        let timeout = self.timeout;
        Box::pin(async move { Self::send(client, request?, timeout).await })
    }
}

/// Build the HTTP request carrying one batch.
pub fn build_request(
    base_url: &str,
    headers: &HeaderMap,
    kind: ProcedureKind,
    calls: &[Call],
) -> Result<Request<Full<Bytes>>, ClientError> {
    let batch = BatchRequest::from_calls(calls);
    let input = serde_json::to_string(&batch.input)
        .map_err(|e| ClientError::Encode(format!("failed to encode input: {}", e)))?;

    let (method, query, body) = match kind {
        ProcedureKind::Query => (
            Method::GET,
            BatchQuery {
                batch: 1,
                input: Some(&input),
            },
            Bytes::new(),
        ),
        ProcedureKind::Mutation | ProcedureKind::Subscription => (
            Method::POST,
            BatchQuery {
                batch: 1,
                input: None,
            },
            Bytes::from(input.clone()),
        ),
    };
    let query = serde_qs::to_string(&query)
        .map_err(|e| ClientError::Encode(format!("failed to encode query: {}", e)))?;
    let url = format!("{}/{}?{}", base_url, batch.path, query);

    let mut builder = Request::builder().method(method).uri(&url);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    if kind != ProcedureKind::Query {
        builder = builder.header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    builder
        .body(Full::new(body))
        .map_err(|e| ClientError::Encode(format!("invalid request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn calls(inputs: &[(&str, serde_json::Value)]) -> Vec<Call> {
        inputs
            .iter()
            .map(|(path, input)| Call {
                path: path.to_string(),
                input: input.clone(),
            })
            .collect()
    }

    #[test]
    fn test_query_batch_uses_get_with_input_param() {
        let calls = calls(&[("getUser", json!(1)), ("getUser", json!(2))]);
        let req = build_request("http://localhost:3000/trpc", &HeaderMap::new(), ProcedureKind::Query, &calls)
            .unwrap();

        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().path(), "/trpc/getUser,getUser");

        #[derive(serde::Deserialize)]
        struct Params {
            batch: u8,
            input: String,
        }
        let params: Params = serde_qs::from_str(req.uri().query().unwrap()).unwrap();
        assert_eq!(params.batch, 1);
        assert_eq!(serde_json::from_str::<serde_json::Value>(&params.input).unwrap(), json!([1, 2]));
        assert!(req.headers().get(header::CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_mutation_batch_posts_json_body() {
        let calls = calls(&[("bump", json!({"by": 1})), ("reset", json!(null))]);
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        let req = build_request("http://localhost:3000", &headers, ProcedureKind::Mutation, &calls)
            .unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().path(), "/bump,reset");
        assert_eq!(req.uri().query(), Some("batch=1"));
        assert_eq!(req.headers()["x-api-key"], "secret");
        assert_eq!(req.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_invalid_base_url_is_encode_error() {
        let calls = calls(&[("a", json!(1))]);
        let err = build_request("not a url", &HeaderMap::new(), ProcedureKind::Mutation, &calls)
            .unwrap_err();
        assert!(matches!(err, ClientError::Encode(_)));
    }
}
