//! Observability hook for procedure and context failures.
//!
//! The hook is a side channel: it observes errors and never changes what is
//! sent to the client.

use std::sync::Arc;

use rpcmux_core::{ProcedureKind, RpcError};
use serde_json::Value;

use crate::context::ConnectionInfo;

/// Everything known about a failure when it is reported.
///
/// `kind` is `None` for connection-level failures (context construction),
/// which also carry no path, input or context.
pub struct ErrorEvent<'a, C> {
    pub error: &'a RpcError,
    pub path: Option<&'a str>,
    pub kind: Option<ProcedureKind>,
    pub ctx: Option<&'a C>,
    pub info: &'a ConnectionInfo,
    pub input: Option<&'a Value>,
}

/// Callback invoked with every [`ErrorEvent`].
pub type OnError<C> = Arc<dyn Fn(&ErrorEvent<'_, C>) + Send + Sync>;

/// The hook installed when none is configured: logs the event.
pub fn log_error<C: 'static>() -> OnError<C> {
    Arc::new(|event: &ErrorEvent<'_, C>| {
        tracing::error!(
            connection = %event.info.id,
            path = event.path.unwrap_or("-"),
            kind = event.kind.map(|k| k.as_str()).unwrap_or("unknown"),
            code = %event.error.code(),
            error = %event.error,
            "rpc error"
        );
    })
}
