//! One task per accepted connection.
//!
//! The session task owns the subscription table. Procedure invocations run
//! in a [`JoinSet`] and report back over a channel, as do subscription
//! runtimes when their producer ends, so every insert, removal and clear of
//! the table happens on this one task.
//!
//! A `subscription` request reserves its id when it arrives. The reservation
//! carries a generation number; an outcome or termination report is only
//! applied while the entry it names still has that generation.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use rpcmux_core::{
    CallRequest, ErrorShape, InvalidRequest, ProcedureKind, Request, RequestId, ResponseFrame,
    RpcError, parse_inbound,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::MessageLimits;
use crate::context::ConnectionInfo;
use crate::hooks::{ErrorEvent, OnError};
use crate::router::{ProcedureOutput, Router};
use crate::subscription::{RuntimeHooks, Subscription, SubscriptionRuntime};
use crate::writer::{FrameWriter, WireMessage};

/// Per-connection state shared with procedure tasks.
pub(crate) struct Shared<C> {
    pub info: ConnectionInfo,
    pub ctx: C,
    pub router: Arc<dyn Router<C>>,
    pub on_error: OnError<C>,
}

impl<C> Shared<C> {
    fn report(
        &self,
        error: &RpcError,
        path: Option<&str>,
        kind: Option<ProcedureKind>,
        input: Option<&Value>,
    ) {
        (self.on_error)(&ErrorEvent {
            error,
            path,
            kind,
            ctx: Some(&self.ctx),
            info: &self.info,
            input,
        });
    }
}

type Report = Box<dyn FnOnce(&RpcError) + Send>;

enum Outcome {
    Ready {
        subscription: Subscription,
        report: Report,
    },
    Value(Value),
    Failed(ErrorShape),
}

enum SessionEvent {
    /// A procedure invoked for `id` finished. `generation` is set when the
    /// request reserved its id on arrival.
    Resolved {
        id: RequestId,
        path: String,
        generation: Option<u64>,
        outcome: Outcome,
    },
    /// A live subscription's producer ended on its own.
    Finished { id: RequestId, generation: u64 },
}

enum Slot {
    Reserved { generation: u64 },
    Live {
        generation: u64,
        runtime: SubscriptionRuntime,
    },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Slot::Reserved { generation } | Slot::Live { generation, .. } => *generation,
        }
    }
}

struct Session<C> {
    shared: Arc<Shared<C>>,
    writer: FrameWriter,
    limits: MessageLimits,
    table: HashMap<RequestId, Slot>,
    next_generation: u64,
    calls: JoinSet<()>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Run a session until `inbound` ends or yields a close frame.
///
/// On return every subscription has been terminated, the table is empty and
/// in-flight procedure calls are aborted.
pub(crate) async fn run<C, St>(
    shared: Arc<Shared<C>>,
    writer: FrameWriter,
    limits: MessageLimits,
    mut inbound: St,
) where
    C: Clone + Send + Sync + 'static,
    St: Stream<Item = WireMessage> + Unpin,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        shared,
        writer,
        limits,
        table: HashMap::new(),
        next_generation: 0,
        calls: JoinSet::new(),
        events_tx,
        events_rx,
    };

    loop {
        tokio::select! {
            message = inbound.next() => match message {
                Some(WireMessage::Text(text)) => session.handle_message(&text).await,
                Some(WireMessage::Close { code, reason }) => {
                    tracing::debug!(code, %reason, "client closed connection");
                    break;
                }
                None => break,
            },
            Some(event) = session.events_rx.recv() => session.handle_event(event).await,
            Some(joined) = session.calls.join_next(), if !session.calls.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "procedure task panicked");
                }
            }
        }
    }

    session.close();
}

impl<C> Session<C>
where
    C: Clone + Send + Sync + 'static,
{
    async fn handle_message(&mut self, text: &str) {
        if let Err(status) = self.limits.check_size(text.len()) {
            let error = RpcError::Procedure(status);
            tracing::warn!(size = text.len(), "rejecting oversized message");
            self.shared.report(&error, None, None, None);
            self.send_error(None, &error, None).await;
            return;
        }

        let requests = match parse_inbound(text.as_bytes()) {
            Ok(requests) => requests,
            Err(e) => {
                let error = RpcError::Parse(e);
                tracing::debug!(%error, "unparseable message");
                self.shared.report(&error, None, None, None);
                self.send_error(None, &error, None).await;
                return;
            }
        };

        for request in requests {
            match request {
                Ok(Request::Stop { id }) => self.stop(id).await,
                Ok(Request::Call(call)) => self.call(call).await,
                Err(InvalidRequest { id, error }) => {
                    tracing::debug!(id = ?id, %error, "invalid request");
                    self.shared.report(&error, None, None, None);
                    self.send_error(id, &error, None).await;
                }
            }
        }
    }

    async fn call(&mut self, call: CallRequest) {
        let generation = if call.kind == ProcedureKind::Subscription {
            if self.table.contains_key(&call.id) {
                self.reject_duplicate(&call.id, &call.path, Some(&call.input))
                    .await;
                return;
            }
            self.next_generation += 1;
            let generation = self.next_generation;
            self.table
                .insert(call.id.clone(), Slot::Reserved { generation });
            Some(generation)
        } else {
            None
        };

        tracing::trace!(id = %call.id, kind = %call.kind, path = %call.path, "invoking procedure");
        self.calls.spawn(invoke(
            Arc::clone(&self.shared),
            self.writer.clone(),
            self.events_tx.clone(),
            call,
            generation,
        ));
    }

    async fn stop(&mut self, id: RequestId) {
        match self.table.remove(&id) {
            Some(Slot::Live { runtime, .. }) => {
                tracing::debug!(%id, "stopping subscription");
                runtime.stop().await;
            }
            Some(Slot::Reserved { .. }) => {
                tracing::debug!(%id, "stopping subscription before it started");
                self.writer.send(ResponseFrame::stopped(id)).await;
            }
            None => tracing::debug!(%id, "stop for unknown subscription ignored"),
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Resolved {
                id,
                path,
                generation,
                outcome,
            } => self.resolve(id, path, generation, outcome).await,
            SessionEvent::Finished { id, generation } => {
                if self.is_current(&id, generation) {
                    self.table.remove(&id);
                    tracing::trace!(%id, "subscription removed");
                }
            }
        }
    }

    async fn resolve(
        &mut self,
        id: RequestId,
        path: String,
        generation: Option<u64>,
        outcome: Outcome,
    ) {
        if let Some(generation) = generation
            && !self.is_current(&id, generation)
        {
            tracing::debug!(%id, "discarding outcome of a stopped subscription request");
            return;
        }

        match outcome {
            Outcome::Ready {
                subscription,
                report,
            } => self.register(id, path, generation, subscription, report).await,
            Outcome::Value(data) => {
                if generation.is_some() {
                    self.table.remove(&id);
                }
                self.writer.send(ResponseFrame::data(id, data)).await;
            }
            Outcome::Failed(shape) => {
                if generation.is_some() {
                    self.table.remove(&id);
                }
                self.writer.send(ResponseFrame::error(Some(id), shape)).await;
            }
        }
    }

    async fn register(
        &mut self,
        id: RequestId,
        path: String,
        reserved: Option<u64>,
        subscription: Subscription,
        report: Report,
    ) {
        if self.writer.is_closed() {
            tracing::debug!(%id, "connection closed, discarding subscription");
            self.table.remove(&id);
            return;
        }

        let generation = match reserved {
            Some(generation) => generation,
            None => {
                if self.table.contains_key(&id) {
                    self.reject_duplicate(&id, &path, None).await;
                    return;
                }
                self.next_generation += 1;
                self.next_generation
            }
        };

        let runtime = SubscriptionRuntime::new(id.clone(), path, self.writer.clone());
        let events = self.events_tx.clone();
        let finished_id = id.clone();
        let hooks = RuntimeHooks {
            report,
            finished: Box::new(move || {
                // The session may already be gone.
                let _ = events.send(SessionEvent::Finished {
                    id: finished_id,
                    generation,
                });
            }),
        };
        self.table.insert(
            id.clone(),
            Slot::Live {
                generation,
                runtime: runtime.clone(),
            },
        );
        tracing::debug!(%id, "subscription started");
        runtime.start(subscription, hooks);
    }

    async fn reject_duplicate(&self, id: &RequestId, path: &str, input: Option<&Value>) {
        let error = RpcError::ProtocolViolation(format!("duplicate subscription id {}", id));
        tracing::warn!(%id, path, "rejecting duplicate subscription id");
        self.shared
            .report(&error, Some(path), Some(ProcedureKind::Subscription), input);
        self.send_error(Some(id.clone()), &error, Some(path)).await;
    }

    fn is_current(&self, id: &RequestId, generation: u64) -> bool {
        self.table
            .get(id)
            .is_some_and(|slot| slot.generation() == generation)
    }

    async fn send_error(&self, id: Option<RequestId>, error: &RpcError, path: Option<&str>) {
        self.writer
            .send(ResponseFrame::error(id, error.to_shape(path)))
            .await;
    }

    /// Terminate every subscription and abort in-flight calls. Idempotent.
    fn close(&mut self) {
        self.writer.mark_closed();
        let live = self.table.len();
        for (_, slot) in self.table.drain() {
            if let Slot::Live { runtime, .. } = slot {
                runtime.terminate();
            }
        }
        self.calls.abort_all();
        tracing::debug!(subscriptions = live, "session closed");
    }
}

async fn invoke<C>(
    shared: Arc<Shared<C>>,
    writer: FrameWriter,
    events: mpsc::UnboundedSender<SessionEvent>,
    call: CallRequest,
    generation: Option<u64>,
) where
    C: Clone + Send + Sync + 'static,
{
    let CallRequest {
        id,
        kind,
        path,
        input,
    } = call;
    let result = shared
        .router
        .call(shared.ctx.clone(), kind, &path, input.clone())
        .await;

    let outcome = match result {
        Ok(ProcedureOutput::Subscription(subscription)) => {
            let reporter = Arc::clone(&shared);
            let report_path = path.clone();
            let report: Report = Box::new(move |error: &RpcError| {
                reporter.report(error, Some(report_path.as_str()), Some(kind), Some(&input));
            });
            Outcome::Ready {
                subscription,
                report,
            }
        }
        Ok(ProcedureOutput::Value(data)) => {
            if generation.is_none() {
                writer.send(ResponseFrame::data(id, data)).await;
                return;
            }
            Outcome::Value(data)
        }
        Err(error) => {
            tracing::debug!(%id, path = %path, %error, "procedure failed");
            shared.report(&error, Some(path.as_str()), Some(kind), Some(&input));
            let shape = error.to_shape(Some(path.as_str()));
            if generation.is_none() {
                writer.send(ResponseFrame::error(Some(id), shape)).await;
                return;
            }
            Outcome::Failed(shape)
        }
    };

    // The session may already be gone.
    let _ = events.send(SessionEvent::Resolved {
        id,
        path,
        generation,
        outcome,
    });
}
