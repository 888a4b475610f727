//! Per-connection context construction.

use std::future::Future;

use futures::future::BoxFuture;
use http::HeaderMap;
use rpcmux_core::Status;

use crate::registry::ConnectionId;

/// What the server knows about an accepted connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// Headers of the upgrade request.
    pub headers: HeaderMap,
}

/// Builds the context value handed to every procedure invoked on a
/// connection.
///
/// Runs once per connection, before any message is read. A failure closes
/// the connection.
///
/// Implemented for any `Fn(ConnectionInfo) -> Future<Output = Result<C, Status>>`:
///
/// ```ignore
/// let factory = |info: ConnectionInfo| async move {
///     let user = info.headers.get("x-user").and_then(|v| v.to_str().ok());
///     Ok(Ctx { user: user.map(str::to_owned) })
/// };
/// ```
pub trait ContextFactory<C>: Send + Sync + 'static {
    fn create(&self, info: ConnectionInfo) -> BoxFuture<'static, Result<C, Status>>;
}

impl<C, F, Fut> ContextFactory<C> for F
where
    F: Fn(ConnectionInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, Status>> + Send + 'static,
{
    fn create(&self, info: ConnectionInfo) -> BoxFuture<'static, Result<C, Status>> {
        Box::pin(self(info))
    }
}
