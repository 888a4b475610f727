//! The seam between connection sessions and procedures.
//!
//! A session only needs something that turns `(ctx, kind, path, input)`
//! into a [`ProcedureOutput`]; that is the [`Router`] trait.
//! [`ProcedureRouter`] is a minimal path-keyed implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use rpcmux_core::{ProcedureKind, RpcError, Status};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::subscription::Subscription;

/// What a procedure produced.
pub enum ProcedureOutput {
    /// A single result, answered with one `data` frame.
    Value(Value),
    /// A long-lived event source, registered under the request id.
    Subscription(Subscription),
}

impl std::fmt::Debug for ProcedureOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcedureOutput::Value(v) => f.debug_tuple("Value").field(v).finish(),
            ProcedureOutput::Subscription(_) => f.write_str("Subscription(..)"),
        }
    }
}

/// Resolves and invokes procedures.
pub trait Router<C>: Send + Sync + 'static {
    fn call(
        &self,
        ctx: C,
        kind: ProcedureKind,
        path: &str,
        input: Value,
    ) -> BoxFuture<'static, Result<ProcedureOutput, RpcError>>;
}

type Handler<C> =
    Arc<dyn Fn(C, Value) -> BoxFuture<'static, Result<ProcedureOutput, RpcError>> + Send + Sync>;

struct Procedure<C> {
    kind: ProcedureKind,
    handler: Handler<C>,
}

/// Path-keyed procedure table.
///
/// Inputs are deserialized into the handler's input type; a mismatch is a
/// `BAD_REQUEST`. Outputs are serialized to JSON.
///
/// # Example
///
/// ```ignore
/// let router = ProcedureRouter::<Ctx>::new()
///     .query("getUser", |ctx: Ctx, id: u32| async move { ctx.users.get(id) })
///     .subscription("onTick", |_ctx, _: ()| async move {
///         Ok::<_, Status>(tick_stream())
///     });
/// ```
pub struct ProcedureRouter<C> {
    procedures: HashMap<String, Procedure<C>>,
}

impl<C> Default for ProcedureRouter<C> {
    fn default() -> Self {
        Self {
            procedures: HashMap::new(),
        }
    }
}

impl<C> std::fmt::Debug for ProcedureRouter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut paths: Vec<_> = self.procedures.keys().collect();
        paths.sort();
        f.debug_struct("ProcedureRouter")
            .field("procedures", &paths)
            .finish()
    }
}

impl<C: Send + 'static> ProcedureRouter<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query at `path`.
    pub fn query<I, O, F, Fut>(self, path: &str, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(C, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Status>> + Send + 'static,
    {
        self.value(ProcedureKind::Query, path, handler)
    }

    /// Register a mutation at `path`.
    pub fn mutation<I, O, F, Fut>(self, path: &str, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(C, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Status>> + Send + 'static,
    {
        self.value(ProcedureKind::Mutation, path, handler)
    }

    /// Register a subscription at `path`.
    ///
    /// The handler resolves to a stream; each item becomes a `data` event and
    /// an `Err` item stops the subscription with an error frame.
    pub fn subscription<I, T, S, F, Fut>(mut self, path: &str, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
        S: Stream<Item = Result<T, Status>> + Send + 'static,
        F: Fn(C, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler<C> = Arc::new(move |ctx: C, input: Value| -> BoxFuture<'static, _> {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let input = decode_input::<I>(input)?;
                let stream = handler(ctx, input).await?;
                let events = stream.map(|item| {
                    item.map_err(RpcError::Procedure)
                        .and_then(|event| encode_output(&event))
                });
                Ok(ProcedureOutput::Subscription(Subscription::new(events)))
            })
        });
        self.procedures.insert(
            path.to_string(),
            Procedure {
                kind: ProcedureKind::Subscription,
                handler: erased,
            },
        );
        self
    }

    fn value<I, O, F, Fut>(mut self, kind: ProcedureKind, path: &str, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(C, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler<C> = Arc::new(move |ctx: C, input: Value| -> BoxFuture<'static, _> {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let input = decode_input::<I>(input)?;
                let output = handler(ctx, input).await?;
                encode_output(&output).map(ProcedureOutput::Value)
            })
        });
        self.procedures.insert(
            path.to_string(),
            Procedure {
                kind,
                handler: erased,
            },
        );
        self
    }

    /// Paths of every registered procedure.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }
}

impl<C: Send + 'static> Router<C> for ProcedureRouter<C> {
    fn call(
        &self,
        ctx: C,
        kind: ProcedureKind,
        path: &str,
        input: Value,
    ) -> BoxFuture<'static, Result<ProcedureOutput, RpcError>> {
        let Some(procedure) = self.procedures.get(path) else {
            let status = Status::not_found(format!("no procedure at path `{}`", path));
            return Box::pin(async move { Err(RpcError::Procedure(status)) });
        };
        if procedure.kind != kind {
            let status = Status::method_not_supported(format!(
                "`{}` is a {}, not a {}",
                path, procedure.kind, kind
            ));
            return Box::pin(async move { Err(RpcError::Procedure(status)) });
        }
        (procedure.handler)(ctx, input)
    }
}

fn decode_input<I: DeserializeOwned>(input: Value) -> Result<I, RpcError> {
    serde_json::from_value(input)
        .map_err(|e| RpcError::Procedure(Status::bad_request(format!("invalid input: {}", e))))
}

fn encode_output<O: Serialize>(output: &O) -> Result<Value, RpcError> {
    serde_json::to_value(output)
        .map_err(|e| RpcError::Procedure(Status::internal(format!("failed to encode output: {}", e))))
}
