//! # rpcmux
//!
//! Persistent-connection RPC server built on [Axum](https://github.com/tokio-rs/axum)
//! WebSockets.
//!
//! Each accepted socket runs one connection session. Clients send
//! `query`, `mutation`, `subscription` and `subscription.stop` frames,
//! singly or as an array; the session invokes procedures concurrently and
//! streams subscription events back tagged with the request id.
//!
//! ## Features
//!
//! - **Explicit procedure outputs:** a procedure returns either a value or a
//!   [`Subscription`], decided by how it was registered on the [`ProcedureRouter`].
//! - **Ordered subscription events:** `started`, then `data` in producer
//!   order, then exactly one of `stopped` or an error frame.
//! - **Duplicate id protection:** a subscription id in use is rejected
//!   without disturbing the live subscription.
//! - **Reconnect broadcast:** [`RpcServer::broadcast_reconnect_notification`]
//!   reaches every open connection.
//! - **Observability hook:** every procedure and context failure is handed
//!   to an [`ErrorEvent`] callback.
//!
//! ## Getting Started
//!
//! ```rust,ignore
//! use rpcmux::prelude::*;
//!
//! let router = ProcedureRouter::<()>::new()
//!     .query("greet", |_ctx, name: String| async move {
//!         Ok::<_, Status>(format!("hello, {name}"))
//!     });
//! let server = RpcServer::builder(router, |_info: ConnectionInfo| async { Ok(()) }).build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! axum::serve(listener, server.into_router::<()>("/ws")).await?;
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod router;
mod server;
mod session;
pub mod subscription;
pub mod writer;

pub use config::{MessageLimits, ServerConfig};
pub use context::{ConnectionInfo, ContextFactory};
pub use error::ServerError;
pub use hooks::{ErrorEvent, OnError, log_error};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use router::{ProcedureOutput, ProcedureRouter, Router};
pub use server::{ABNORMAL_CLOSURE, RpcServer, RpcServerBuilder};
pub use subscription::Subscription;
pub use writer::{FrameWriter, WireMessage};

// Re-export core types for convenience
pub use rpcmux_core::{Code, ErrorShape, ProcedureKind, RequestId, RpcError, Status};

pub mod prelude {
    //! A prelude for `rpcmux` providing the most common types.
    pub use crate::context::{ConnectionInfo, ContextFactory};
    pub use crate::hooks::ErrorEvent;
    pub use crate::router::{ProcedureOutput, ProcedureRouter, Router};
    pub use crate::server::RpcServer;
    pub use crate::subscription::Subscription;
    pub use rpcmux_core::{Code, ProcedureKind, RpcError, Status};
}
