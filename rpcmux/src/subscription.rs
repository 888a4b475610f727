//! Subscription lifecycle.
//!
//! A [`Subscription`] is the event source a procedure returns. Once the
//! session registers it, a [`SubscriptionRuntime`] drives it: the runtime
//! announces `started`, forwards each event as a `data` frame and ends with
//! either `stopped` or a single error frame.
//!
//! ```text
//! Created --start--> Started --stop / complete--> Stopped (emits `stopped`)
//!                        \----error-------------> Stopped (emits error)
//!                        \----terminate---------> Stopped (emits nothing)
//! ```
//!
//! Every transition into `Stopped` is an atomic swap, so exactly one of
//! them wins and the terminal frame is written at most once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::StreamExt;
use futures::stream::{BoxStream, Stream};
use rpcmux_core::{RequestId, ResponseFrame, RpcError};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::writer::FrameWriter;

/// A long-lived event source produced by a subscription procedure.
pub struct Subscription {
    stream: BoxStream<'static, Result<Value, RpcError>>,
}

impl Subscription {
    /// Wrap a stream of events. An `Err` item ends the subscription.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, RpcError>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Value, RpcError>> {
        self.stream
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// Callbacks run by the runtime's driving task.
pub(crate) struct RuntimeHooks {
    /// Called with the error that ended the subscription, before the error
    /// frame is written.
    pub report: Box<dyn FnOnce(&RpcError) + Send>,
    /// Called once the producer has ended on its own, by error or completion.
    pub finished: Box<dyn FnOnce() + Send>,
}

struct RuntimeInner {
    id: RequestId,
    path: String,
    state: AtomicU8,
    token: CancellationToken,
    // Held while writing a frame so a terminal frame never interleaves with
    // a data frame that already passed its state check.
    emit: Mutex<()>,
    writer: FrameWriter,
}

/// Drives one registered subscription.
#[derive(Clone)]
pub(crate) struct SubscriptionRuntime(Arc<RuntimeInner>);

impl std::fmt::Debug for SubscriptionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRuntime")
            .field("id", &self.0.id)
            .field("path", &self.0.path)
            .field("state", &self.0.state.load(Ordering::Acquire))
            .finish()
    }
}

impl SubscriptionRuntime {
    pub fn new(id: RequestId, path: impl Into<String>, writer: FrameWriter) -> Self {
        Self(Arc::new(RuntimeInner {
            id,
            path: path.into(),
            state: AtomicU8::new(CREATED),
            token: CancellationToken::new(),
            emit: Mutex::new(()),
            writer,
        }))
    }

    /// Spawn the task that drives `producer`.
    ///
    /// Returns `false` without spawning if the runtime was already started or
    /// stopped.
    pub fn start(&self, producer: Subscription, hooks: RuntimeHooks) -> bool {
        if self
            .0
            .state
            .compare_exchange(CREATED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let inner = Arc::clone(&self.0);
        tokio::spawn(drive(inner, producer.into_stream(), hooks));
        true
    }

    /// Stop on request: cancel the producer and emit `stopped`.
    ///
    /// Only the first call emits; later calls and calls after an error or
    /// completion do nothing.
    pub async fn stop(&self) {
        if !self.transition() {
            return;
        }
        let _emit = self.0.emit.lock().await;
        if !self.0.writer.is_closed() {
            self.0
                .writer
                .send(ResponseFrame::stopped(self.0.id.clone()))
                .await;
        }
    }

    /// Stop because the connection is gone. Nothing is emitted.
    pub fn terminate(&self) {
        self.transition();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.state.load(Ordering::Acquire) == STOPPED
    }

    fn transition(&self) -> bool {
        self.0.transition()
    }
}

impl RuntimeInner {
    /// Move to `Stopped` and cancel the producer. `true` for the caller that
    /// made the move.
    fn transition(&self) -> bool {
        let previous = self.state.swap(STOPPED, Ordering::AcqRel);
        if previous == STOPPED {
            return false;
        }
        self.token.cancel();
        true
    }

    fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }
}

async fn drive(
    inner: Arc<RuntimeInner>,
    mut events: BoxStream<'static, Result<Value, RpcError>>,
    hooks: RuntimeHooks,
) {
    {
        let _emit = inner.emit.lock().await;
        if inner.is_stopped() {
            return;
        }
        inner.writer.send(ResponseFrame::started(inner.id.clone())).await;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = inner.token.cancelled() => return,
            next = events.next() => next,
        };
        match next {
            Some(Ok(data)) => {
                let _emit = inner.emit.lock().await;
                if inner.is_stopped() {
                    return;
                }
                inner
                    .writer
                    .send(ResponseFrame::data(inner.id.clone(), data))
                    .await;
            }
            Some(Err(error)) => {
                let emit = inner.emit.lock().await;
                if !inner.transition() {
                    return;
                }
                tracing::debug!(id = %inner.id, path = %inner.path, %error, "subscription failed");
                (hooks.report)(&error);
                let shape = error.to_shape(Some(inner.path.as_str()));
                inner
                    .writer
                    .send(ResponseFrame::error(Some(inner.id.clone()), shape))
                    .await;
                drop(emit);
                (hooks.finished)();
                return;
            }
            None => {
                let emit = inner.emit.lock().await;
                if !inner.transition() {
                    return;
                }
                tracing::debug!(id = %inner.id, path = %inner.path, "subscription completed");
                if !inner.writer.is_closed() {
                    inner
                        .writer
                        .send(ResponseFrame::stopped(inner.id.clone()))
                        .await;
                }
                drop(emit);
                (hooks.finished)();
                return;
            }
        }
    }
}
