//! Outbound side of a connection.
//!
//! Every frame written to a socket goes through one [`FrameWriter`]. Clones
//! share a bounded queue drained by [`write_loop`], so frames from concurrent
//! procedures and subscriptions are serialized in the order they were
//! enqueued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::{Sink, SinkExt};
use rpcmux_core::ServerMessage;
use tokio::sync::mpsc;

use crate::error::ServerError;

/// A text frame or close instruction in either direction of a socket.
///
/// [`RpcServer::serve_split`](crate::RpcServer::serve_split) speaks this
/// type, which keeps sessions independent from any particular WebSocket
/// implementation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Close { code: u16, reason: String },
}

/// An item queued for the write loop.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
pub(crate) struct WriterInner {
    tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

/// Cloneable handle that enqueues frames for one connection.
#[derive(Clone, Debug)]
pub struct FrameWriter(Arc<WriterInner>);

impl FrameWriter {
    /// Create a writer and the receiver its write loop drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let inner = WriterInner {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (Self(Arc::new(inner)), rx)
    }

    pub(crate) fn from_arc(inner: Arc<WriterInner>) -> Self {
        Self(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<WriterInner> {
        Arc::downgrade(&self.0)
    }

    /// Flag shared with the write loop.
    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0.closed)
    }

    /// Enqueue a frame, waiting for queue space.
    ///
    /// Returns `false` once the connection is closed; the frame is dropped.
    pub async fn send(&self, message: impl Into<ServerMessage>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.0.tx.send(Outbound::Frame(message.into())).await.is_ok()
    }

    /// Enqueue a frame without waiting. A full queue drops the frame.
    pub fn try_send(&self, message: impl Into<ServerMessage>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.0.tx.try_send(Outbound::Frame(message.into())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a close frame after everything already enqueued, then refuse
    /// further frames.
    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let close = Outbound::Close {
            code,
            reason: reason.into(),
        };
        // A gone write loop means the socket is already closed.
        let _ = self.0.tx.send(close).await;
    }

    /// Refuse further frames without queuing a close frame.
    pub fn mark_closed(&self) {
        self.0.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }
}

impl From<ServerMessage> for Outbound {
    fn from(message: ServerMessage) -> Self {
        Outbound::Frame(message)
    }
}

/// Drain `rx` into `sink` until every writer is dropped or a close frame
/// has been written. The shared flag is set on the way out.
pub async fn write_loop<Si>(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: Si,
    closed: Arc<AtomicBool>,
) -> Result<(), ServerError>
where
    Si: Sink<WireMessage> + Unpin,
    Si::Error: std::fmt::Display,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(message) => {
                let text = serde_json::to_string(&message)?;
                sink.send(WireMessage::Text(text))
                    .await
                    .map_err(|e| ServerError::Socket(e.to_string()))?;
            }
            Outbound::Close { code, reason } => {
                sink.send(WireMessage::Close { code, reason })
                    .await
                    .map_err(|e| ServerError::Socket(e.to_string()))?;
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    let _ = sink.close().await;
    Ok(())
}
