//! Typed client façade over a [`BatchLink`].

use std::sync::Arc;

use rpcmux_core::ProcedureKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::ClientError;
use crate::batch::BatchTransport;
use crate::builder::ClientBuilder;
use crate::link::BatchLink;

/// Client issuing batched queries and mutations.
///
/// Cloning is cheap; clones share the link, so calls issued from any clone
/// in the same scheduler turn are batched together.
///
/// # Example
///
/// ```ignore
/// use rpcmux_client::RpcClient;
///
/// let client = RpcClient::builder("http://localhost:3000/trpc").build()?;
///
/// let (alice, bob) = tokio::join!(
///     client.query::<_, String>("getUser", &1),
///     client.query::<_, String>("getUser", &2),
/// );
/// ```
#[derive(Clone, Debug)]
pub struct RpcClient {
    link: Arc<BatchLink>,
}

impl RpcClient {
    /// Create a new client builder.
    pub fn builder<S: Into<String>>(base_url: S) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    /// Create a client sending batches through `transport`.
    pub fn from_transport(transport: Arc<dyn BatchTransport>, max_batch_size: Option<usize>) -> Self {
        Self {
            link: Arc::new(BatchLink::new(transport, max_batch_size)),
        }
    }

    pub fn link(&self) -> &BatchLink {
        &self.link
    }

    /// Issue a query.
    pub async fn query<I, O>(&self, path: &str, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.call(ProcedureKind::Query, path, input, &CancellationToken::new())
            .await
    }

    /// Issue a query that is cancelled together with `scope`.
    pub async fn query_with_scope<I, O>(
        &self,
        path: &str,
        input: &I,
        scope: &CancellationToken,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.call(ProcedureKind::Query, path, input, scope).await
    }

    /// Issue a mutation.
    pub async fn mutation<I, O>(&self, path: &str, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.call(ProcedureKind::Mutation, path, input, &CancellationToken::new())
            .await
    }

    /// Issue a mutation that is cancelled together with `scope`.
    pub async fn mutation_with_scope<I, O>(
        &self,
        path: &str,
        input: &I,
        scope: &CancellationToken,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.call(ProcedureKind::Mutation, path, input, scope).await
    }

    /// Issue an operation of any kind.
    pub async fn call<I, O>(
        &self,
        kind: ProcedureKind,
        path: &str,
        input: &I,
        scope: &CancellationToken,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)
            .map_err(|e| ClientError::Encode(format!("failed to encode input: {}", e)))?;
        let operation = self.link.operation(kind, path, input);

        #[cfg(feature = "tracing")]
        tracing::trace!(id = operation.id, kind = %kind, path, "issuing operation");

        let data = self.link.execute(operation, scope).await?;
        serde_json::from_value(data)
            .map_err(|e| ClientError::Decode(format!("failed to decode output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use futures::future::BoxFuture;
    use rpcmux_core::Call;
    use serde::Deserialize;
    use serde_json::{Value, json};

    struct Echo;

    impl BatchTransport for Echo {
        fn send_batch(
            &self,
            _kind: ProcedureKind,
            calls: Vec<Call>,
        ) -> BoxFuture<'static, Result<Bytes, ClientError>> {
            let slots: Vec<Value> = calls.iter().map(|c| json!({"result": c.input})).collect();
            let body = Bytes::from(serde_json::to_vec(&slots).unwrap());
            Box::pin(async move { Ok(body) })
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let client = RpcClient::from_transport(Arc::new(Echo), None);
        let user = User {
            id: 1,
            name: "Alice".into(),
        };
        let echoed: User = client.mutation("user.save", &user).await.unwrap();
        assert_eq!(echoed, user);
    }

    #[tokio::test]
    async fn test_decode_failure() {
        let client = RpcClient::from_transport(Arc::new(Echo), None);
        let err = client.query::<_, User>("user.get", &42).await.unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[tokio::test]
    async fn test_clones_share_batches() {
        let client = RpcClient::from_transport(Arc::new(Echo), None);
        let other = client.clone();
        let (a, b) = tokio::join!(
            client.query::<_, u32>("n", &1),
            other.query::<_, u32>("n", &2),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
    }
}
