//! WebSocket entry point.
//!
//! [`RpcServer`] ties a [`Router`], a [`ContextFactory`] and an error hook
//! together and runs one connection session per accepted socket.
//!
//! # Examples
//!
//! ```rust,ignore
//! use rpcmux::{ProcedureRouter, RpcServer, ConnectionInfo};
//!
//! let router = ProcedureRouter::<()>::new()
//!     .query("hello", |_ctx, name: String| async move {
//!         Ok::<_, rpcmux::Status>(format!("hello, {name}"))
//!     });
//!
//! let server = RpcServer::builder(router, |_info: ConnectionInfo| async { Ok(()) }).build();
//! let app = server.clone().into_router("/ws");
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::future::ready;
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::HeaderMap;
use rpcmux_core::{RequestId, ResponseFrame, RpcError};
use tracing::Instrument;

use crate::config::{MessageLimits, ServerConfig};
use crate::context::{ConnectionInfo, ContextFactory};
use crate::hooks::{ErrorEvent, OnError, log_error};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::router::Router;
use crate::session::{self, Shared};
use crate::writer::{FrameWriter, WireMessage, write_loop};

/// Close code sent when a connection cannot be set up.
pub const ABNORMAL_CLOSURE: u16 = 1006;

struct ServerInner<C> {
    router: Arc<dyn Router<C>>,
    context: Arc<dyn ContextFactory<C>>,
    on_error: OnError<C>,
    config: ServerConfig,
    registry: ConnectionRegistry,
    next_connection: AtomicU64,
}

/// Serves procedures over persistent WebSocket connections.
///
/// Cheap to clone; clones share the connection registry.
pub struct RpcServer<C> {
    inner: Arc<ServerInner<C>>,
}

impl<C> Clone for RpcServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> std::fmt::Debug for RpcServer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("config", &self.inner.config)
            .field("connections", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl<C> RpcServer<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Start building a server from a router and a context factory.
    pub fn builder<R, F>(router: R, context: F) -> RpcServerBuilder<C>
    where
        R: Router<C>,
        F: ContextFactory<C>,
    {
        RpcServerBuilder {
            router: Arc::new(router),
            context: Arc::new(context),
            on_error: None,
            config: ServerConfig::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Registry of the currently open connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Ask every open connection to reconnect. Returns how many connections
    /// the notification was queued for.
    pub fn broadcast_reconnect_notification(&self) -> usize {
        self.inner.registry.broadcast_reconnect_notification()
    }

    /// An axum router that upgrades requests to `path` and serves each
    /// socket.
    pub fn into_router<S>(self, path: &str) -> axum::Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        axum::Router::new()
            .route(path, get(ws_handler::<C>))
            .with_state(self)
    }

    /// Serve an upgraded axum WebSocket until it closes.
    pub async fn serve_socket(&self, socket: WebSocket, headers: HeaderMap) {
        let (sink, stream) = socket.split();
        let sink = sink.with(|message: WireMessage| {
            let message = match message {
                WireMessage::Text(text) => Message::Text(text.into()),
                WireMessage::Close { code, reason } => Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
            };
            ready(Ok::<_, axum::Error>(message))
        });
        let stream = stream.filter_map(|message| {
            ready(match message {
                Ok(Message::Text(text)) => Some(WireMessage::Text(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => {
                    Some(WireMessage::Text(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Close(frame)) => Some(match frame {
                    Some(frame) => WireMessage::Close {
                        code: frame.code,
                        reason: frame.reason.as_str().to_owned(),
                    },
                    None => WireMessage::Close {
                        code: 1005,
                        reason: String::new(),
                    },
                }),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
                Err(e) => Some(WireMessage::Close {
                    code: ABNORMAL_CLOSURE,
                    reason: e.to_string(),
                }),
            })
        });
        self.serve_split(sink, stream, headers).await;
    }

    /// Serve a connection given as a sink and a stream of [`WireMessage`]s.
    ///
    /// The session ends when `stream` ends or yields a close message.
    pub async fn serve_split<Si, St>(&self, sink: Si, stream: St, headers: HeaderMap)
    where
        Si: Sink<WireMessage> + Send + Unpin + 'static,
        Si::Error: std::fmt::Display,
        St: Stream<Item = WireMessage> + Send + Unpin + 'static,
    {
        let id = ConnectionId::new(self.inner.next_connection.fetch_add(1, Ordering::Relaxed));
        let span = tracing::info_span!("rpc.connection", connection_id = %id);
        self.run_connection(id, sink, stream, headers)
            .instrument(span)
            .await;
    }

    async fn run_connection<Si, St>(&self, id: ConnectionId, sink: Si, stream: St, headers: HeaderMap)
    where
        Si: Sink<WireMessage> + Send + Unpin + 'static,
        Si::Error: std::fmt::Display,
        St: Stream<Item = WireMessage> + Send + Unpin + 'static,
    {
        let info = ConnectionInfo { id, headers };
        let (writer, rx) = FrameWriter::new(self.inner.config.outbound_capacity);
        let write_task = tokio::spawn(
            write_loop(rx, sink, writer.closed_flag()).instrument(tracing::Span::current()),
        );

        match self.inner.context.create(info.clone()).await {
            Ok(ctx) => {
                self.inner.registry.insert(id, &writer);
                tracing::info!("connection opened");
                let shared = Arc::new(Shared {
                    info,
                    ctx,
                    router: Arc::clone(&self.inner.router),
                    on_error: Arc::clone(&self.inner.on_error),
                });
                session::run(shared, writer.clone(), self.inner.config.limits, stream).await;
                self.inner.registry.remove(&id);
                tracing::info!("connection closed");
            }
            Err(status) => {
                let error = RpcError::Context(status);
                tracing::warn!(%error, "failed to create connection context");
                let shape = error.to_shape(None);
                writer
                    .send(ResponseFrame::error(Some(RequestId::none()), shape))
                    .await;
                (self.inner.on_error)(&ErrorEvent {
                    error: &error,
                    path: None,
                    kind: None,
                    ctx: None,
                    info: &info,
                    input: None,
                });
                writer.close(ABNORMAL_CLOSURE, "").await;
            }
        }

        drop(writer);
        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "write loop ended with error"),
            Err(e) => tracing::error!(error = %e, "write loop task failed"),
        }
    }
}

async fn ws_handler<C>(
    State(server): State<RpcServer<C>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response
where
    C: Clone + Send + Sync + 'static,
{
    ws.on_upgrade(move |socket| async move { server.serve_socket(socket, headers).await })
}

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder<C> {
    router: Arc<dyn Router<C>>,
    context: Arc<dyn ContextFactory<C>>,
    on_error: Option<OnError<C>>,
    config: ServerConfig,
}

impl<C> RpcServerBuilder<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Install the observability hook. Defaults to logging each event.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ErrorEvent<'_, C>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set custom message size limits.
    ///
    /// Default is 4 MB.
    pub fn limits(mut self, limits: MessageLimits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn max_message_size(self, max: usize) -> Self {
        self.limits(MessageLimits::new(max))
    }

    /// Outbound frames buffered per connection before writers wait.
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.config.outbound_capacity = capacity;
        self
    }

    pub fn build(self) -> RpcServer<C> {
        RpcServer {
            inner: Arc::new(ServerInner {
                router: self.router,
                context: self.context,
                on_error: self.on_error.unwrap_or_else(log_error::<C>),
                config: self.config,
                registry: ConnectionRegistry::new(),
                next_connection: AtomicU64::new(1),
            }),
        }
    }
}
