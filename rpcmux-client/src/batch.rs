//! Client-side batching of concurrent calls.
//!
//! A [`BatchCoordinator`] collects every operation of one kind submitted
//! during the current scheduler turn into one pending batch, then sends the
//! whole batch as a single physical call through a [`BatchTransport`]. The
//! response is fanned back out positionally.
//!
//! The window is closed from the callers' side. When a [`PendingCall`] is
//! first polled while its batch is still open, it wakes its own task and
//! returns `Pending`. The next poll of any member of that batch happens only
//! after the polling task has handed control back to the scheduler, and it
//! takes the batch and dispatches it. Operations a task submits before it
//! yields therefore share one call on any runtime flavor, including futures
//! driven together by `tokio::join!` or `join_all`.
//!
//! ```text
//! submit(a) ─┐
//! submit(b) ─┼─ same tick ─► [a, b] ─► transport ─► [ra, rb] ─► a: ra, b: rb
//! submit(c) ─┘ (cancelled)
//! ```
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use pin_project_lite::pin_project;
use rpcmux_core::{Call, Envelope, Operation, ParseError, ProcedureKind, decode_batch_response};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::ClientError;

/// The seam between a coordinator and the network.
///
/// One invocation is one physical call carrying an ordered list of
/// `{path, input}` pairs. The returned bytes are the undecoded response body.
pub trait BatchTransport: Send + Sync + 'static {
    fn send_batch(
        &self,
        kind: ProcedureKind,
        calls: Vec<Call>,
    ) -> BoxFuture<'static, Result<Bytes, ClientError>>;
}

type Outcome = Result<Envelope, ClientError>;

/// The resolution point of one member. The first settlement wins.
struct Slot {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Slot {
    fn new(tx: oneshot::Sender<Outcome>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                // The caller may have dropped the PendingCall; the slot is
                // settled either way.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// State shared by every member of one batch once it is in flight.
struct Flight {
    live: AtomicUsize,
    abort: CancellationToken,
}

struct Member {
    key: u64,
    call: Call,
    slot: Arc<Slot>,
}

struct PendingBatch {
    id: u64,
    flight: Arc<Flight>,
    members: Vec<Member>,
}

#[derive(Default)]
struct State {
    next_batch: u64,
    next_member: u64,
    pending: Option<PendingBatch>,
}

struct Inner {
    kind: ProcedureKind,
    transport: Arc<dyn BatchTransport>,
    max_batch_size: Option<usize>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the pending batch if it is still the one identified by `id`.
    fn take(&self, id: u64) -> Option<PendingBatch> {
        let mut state = self.lock();
        if state.pending.as_ref().map(|b| b.id) != Some(id) {
            return None;
        }
        let batch = state.pending.take()?;
        Self::seal(&batch);
        Some(batch).filter(|b| !b.members.is_empty())
    }

    fn is_pending(&self, id: u64) -> bool {
        self.lock().pending.as_ref().is_some_and(|b| b.id == id)
    }

    /// Record the member count of a batch leaving the window. Must run under
    /// the state lock.
    fn seal(batch: &PendingBatch) {
        batch.flight.live.store(batch.members.len(), Ordering::Release);
    }

    fn spawn_dispatch(self: &Arc<Self>, batch: PendingBatch) {
        let task = Arc::clone(self).dispatch(batch);
        tokio::spawn(task);
    }

    async fn dispatch(self: Arc<Self>, batch: PendingBatch) {
        let call = self.call(&batch);
        #[cfg(feature = "tracing")]
        let call = tracing::Instrument::instrument(
            call,
            tracing::debug_span!("rpc.batch", kind = %self.kind, size = batch.members.len()),
        );

        match call.await {
            Ok(slots) => {
                for (member, slot) in batch.members.iter().zip(slots) {
                    member.slot.settle(slot.map_err(ClientError::from));
                }
            }
            Err(err) => {
                for member in &batch.members {
                    member.slot.settle(Err(err.clone()));
                }
            }
        }
    }

    async fn call(
        &self,
        batch: &PendingBatch,
    ) -> Result<Vec<Result<Envelope, ParseError>>, ClientError> {
        let calls = batch.members.iter().map(|m| m.call.clone()).collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(batch = batch.id, "dispatching batch");

        let send = self.transport.send_batch(self.kind, calls);
        let body = tokio::select! {
            biased;
            _ = batch.flight.abort.cancelled() => {
                return Err(ClientError::Transport("batch call aborted".to_string()));
            }
            response = send => response?,
        };

        decode_batch_response(&body, batch.members.len()).map_err(|err| {
            #[cfg(feature = "tracing")]
            tracing::debug!(batch = batch.id, error = %err, "undecodable batch response");
            ClientError::from(err)
        })
    }
}

/// Groups same-kind operations issued within one scheduler turn into one
/// physical call.
///
/// Every operation a task submits before it next yields to the scheduler
/// joins the same batch, unless `max_batch_size` closes the window first.
/// Nothing is sent until a [`PendingCall`] of the window is polled: the
/// batch leaves on the second poll of any of its members.
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("kind", &self.inner.kind)
            .field("max_batch_size", &self.inner.max_batch_size)
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    /// Create a coordinator for one procedure kind.
    ///
    /// `max_batch_size` closes a window early once that many operations have
    /// joined it. `None` leaves batches unbounded.
    pub fn new(
        kind: ProcedureKind,
        transport: Arc<dyn BatchTransport>,
        max_batch_size: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                transport,
                max_batch_size: max_batch_size.filter(|n| *n > 0),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn kind(&self) -> ProcedureKind {
        self.inner.kind
    }

    /// Queue an operation into the current window.
    ///
    /// Must be called from within a tokio runtime. Dropping the returned
    /// [`PendingCall`] without cancelling leaves the member in its batch.
    pub fn submit(&self, operation: &Operation) -> (PendingCall, CancelHandle) {
        debug_assert_eq!(operation.kind, self.inner.kind);

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Slot::new(tx));

        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let key = state.next_member;
        state.next_member += 1;

        let batch = state.pending.get_or_insert_with(|| {
            let id = state.next_batch;
            state.next_batch += 1;
            PendingBatch {
                id,
                flight: Arc::new(Flight {
                    live: AtomicUsize::new(0),
                    abort: CancellationToken::new(),
                }),
                members: Vec::new(),
            }
        });
        batch.members.push(Member {
            key,
            call: operation.to_call(),
            slot: Arc::clone(&slot),
        });
        let id = batch.id;
        let handle = CancelHandle {
            inner: Arc::clone(&self.inner),
            batch: id,
            key,
            flight: Arc::clone(&batch.flight),
            slot,
        };

        let full = self
            .inner
            .max_batch_size
            .is_some_and(|max| batch.members.len() >= max);
        let closed = if full { state.pending.take() } else { None };
        if let Some(batch) = &closed {
            Inner::seal(batch);
        }
        drop(guard);

        if let Some(batch) = closed {
            self.inner.spawn_dispatch(batch);
        }

        let pending = PendingCall {
            rx,
            inner: Arc::clone(&self.inner),
            batch: id,
            window: Window::Open,
        };
        (pending, handle)
    }
}

/// Where a member stands relative to its batch window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    /// Not polled yet.
    Open,
    /// Polled once; the task has been woken to come back after it yields.
    Armed,
    /// The batch has left the window.
    Left,
}

pin_project! {
    /// Resolves to the member's envelope, or to the error that settled it.
    ///
    /// Polling drives the batch window; see [`BatchCoordinator`].
    pub struct PendingCall {
        #[pin]
        rx: oneshot::Receiver<Outcome>,
        inner: Arc<Inner>,
        batch: u64,
        window: Window,
    }
}

impl Future for PendingCall {
    type Output = Result<Envelope, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(result) = this.rx.poll(cx) {
            *this.window = Window::Left;
            return Poll::Ready(result.unwrap_or_else(|_| {
                Err(ClientError::Transport(
                    "batch dropped before settling".to_string(),
                ))
            }));
        }

        *this.window = match *this.window {
            Window::Open if this.inner.is_pending(*this.batch) => {
                cx.waker().wake_by_ref();
                Window::Armed
            }
            Window::Armed => {
                if let Some(batch) = this.inner.take(*this.batch) {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(
                        batch = batch.id,
                        size = batch.members.len(),
                        "closing batch window"
                    );
                    this.inner.spawn_dispatch(batch);
                }
                Window::Left
            }
            Window::Open | Window::Left => Window::Left,
        };
        Poll::Pending
    }
}

/// Cancels one member of a batch.
pub struct CancelHandle {
    inner: Arc<Inner>,
    batch: u64,
    key: u64,
    flight: Arc<Flight>,
    slot: Arc<Slot>,
}

impl CancelHandle {
    /// Cancel the member. It resolves to [`ClientError::Canceled`].
    ///
    /// Before the window closes the member is removed from the batch and its
    /// siblings are unaffected. After dispatch the member is detached; when
    /// the last attached member is cancelled the physical call is aborted.
    /// Cancelling a settled member does nothing.
    pub fn cancel(&self) {
        let mut state = self.inner.lock();
        if !self.slot.settle(Err(ClientError::Canceled)) {
            return;
        }

        if let Some(batch) = state.pending.as_mut().filter(|b| b.id == self.batch) {
            batch.members.retain(|m| m.key != self.key);
            if batch.members.is_empty() {
                state.pending = None;
            }
            return;
        }
        drop(state);

        if self.flight.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            #[cfg(feature = "tracing")]
            tracing::debug!(batch = self.batch, "every member cancelled, aborting batch");
            self.flight.abort.cancel();
        }
    }

    /// Turn the handle into a guard that cancels on drop.
    pub fn into_guard(self) -> CancelGuard {
        CancelGuard { handle: Some(self) }
    }
}

/// Cancels its member when dropped unless disarmed.
pub struct CancelGuard {
    handle: Option<CancelHandle>,
}

impl CancelGuard {
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }

    pub fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use rpcmux_core::{BatchRequest, Code, Status};
    use serde_json::{Value, json};
    use tokio::sync::Notify;

    type Responder = Box<dyn Fn(&[Call]) -> Result<Bytes, ClientError> + Send + Sync>;

    struct MockTransport {
        calls: Mutex<Vec<(ProcedureKind, Vec<Call>)>>,
        respond: Responder,
        gate: Option<Arc<Notify>>,
        dropped: Arc<AtomicBool>,
    }

    impl MockTransport {
        fn new(respond: Responder) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond,
                gate: None,
                dropped: Arc::new(AtomicBool::new(false)),
            })
        }

        fn gated(respond: Responder, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond,
                gate: Some(gate),
                dropped: Arc::new(AtomicBool::new(false)),
            })
        }

        /// Echo every input back as the data of its slot.
        fn echo() -> Responder {
            Box::new(|calls| {
                let slots: Vec<Value> = calls
                    .iter()
                    .map(|c| json!({"result": {"type": "data", "data": c.input}}))
                    .collect();
                Ok(Bytes::from(serde_json::to_vec(&slots).unwrap()))
            })
        }

        fn recorded(&self) -> Vec<(ProcedureKind, Vec<Call>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl BatchTransport for MockTransport {
        fn send_batch(
            &self,
            kind: ProcedureKind,
            calls: Vec<Call>,
        ) -> BoxFuture<'static, Result<Bytes, ClientError>> {
            let response = (self.respond)(&calls);
            self.calls.lock().unwrap().push((kind, calls));
            let gate = self.gate.clone();
            let flag = DropFlag(Arc::clone(&self.dropped));
            Box::pin(async move {
                let _flag = flag;
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                response
            })
        }
    }

    fn op(id: u64, path: &str, input: Value) -> Operation {
        Operation {
            id,
            kind: ProcedureKind::Query,
            path: path.to_string(),
            input,
        }
    }

    async fn settle_tasks() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_same_tick_operations_share_one_call() {
        let transport = MockTransport::new(Box::new(|_| {
            Ok(Bytes::from_static(br#"[{"result":"Alice"},{"result":"Bob"}]"#))
        }));
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

        let (a, _ha) = coordinator.submit(&op(1, "getUser", json!(1)));
        let (b, _hb) = coordinator.submit(&op(2, "getUser", json!(2)));

        assert_eq!(a.await.unwrap(), Envelope::success(json!("Alice")));
        assert_eq!(b.await.unwrap(), Envelope::success(json!("Bob")));

        let recorded = transport.recorded();
        assert_eq!(recorded.len(), 1);
        let batch = BatchRequest::from_calls(&recorded[0].1);
        assert_eq!(batch.path, "getUser,getUser");
        assert_eq!(batch.input, json!([1, 2]));
    }

    #[tokio::test]
    async fn test_next_tick_opens_new_batch() {
        let transport = MockTransport::new(MockTransport::echo());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

        let (a, _ha) = coordinator.submit(&op(1, "a", json!(1)));
        assert_eq!(a.await.unwrap(), Envelope::success(json!(1)));
        let (b, _hb) = coordinator.submit(&op(2, "b", json!(2)));
        assert_eq!(b.await.unwrap(), Envelope::success(json!(2)));

        assert_eq!(transport.recorded().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_slot_errors_only_its_member() {
        let transport = MockTransport::new(Box::new(|_| {
            let shape = Status::not_found("no user 2").to_shape(Some("getUser"));
            let body = json!([{"result": "Alice"}, {"error": shape}, {"result": "Carol"}]);
            Ok(Bytes::from(serde_json::to_vec(&body).unwrap()))
        }));
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport, None);

        let (a, _ha) = coordinator.submit(&op(1, "getUser", json!(1)));
        let (b, _hb) = coordinator.submit(&op(2, "getUser", json!(2)));
        let (c, _hc) = coordinator.submit(&op(3, "getUser", json!(3)));

        assert!(a.await.unwrap().is_success());
        let failed = b.await.unwrap().into_result().unwrap_err();
        assert_eq!(failed.error_code(), Code::NotFound);
        assert!(c.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_transport_error_fails_every_member() {
        let transport = MockTransport::new(Box::new(|_| {
            Err(ClientError::Transport("connection refused".into()))
        }));
        let coordinator = BatchCoordinator::new(ProcedureKind::Mutation, transport, None);

        let pending: Vec<_> = (0..3)
            .map(|i| {
                let mut operation = op(i, "bump", json!(i));
                operation.kind = ProcedureKind::Mutation;
                coordinator.submit(&operation)
            })
            .collect();

        for (call, _handle) in pending {
            let err = call.await.unwrap_err();
            assert_eq!(err.message(), "connection refused");
            assert!(err.is_transport());
        }
    }

    #[tokio::test]
    async fn test_length_mismatch_is_protocol_error() {
        let transport = MockTransport::new(Box::new(|_| Ok(Bytes::from_static(br#"[{"result":1}]"#))));
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport, None);

        let (a, _ha) = coordinator.submit(&op(1, "a", json!(1)));
        let (b, _hb) = coordinator.submit(&op(2, "b", json!(2)));

        assert_eq!(a.await.unwrap_err().code(), Code::ParseError);
        assert_eq!(b.await.unwrap_err().code(), Code::ParseError);
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_removes_member() {
        let transport = MockTransport::new(MockTransport::echo());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

        let (a, _ha) = coordinator.submit(&op(1, "a", json!("a")));
        let (b, hb) = coordinator.submit(&op(2, "b", json!("b")));
        let (c, _hc) = coordinator.submit(&op(3, "c", json!("c")));
        hb.cancel();

        assert!(matches!(b.await, Err(ClientError::Canceled)));
        assert_eq!(a.await.unwrap(), Envelope::success(json!("a")));
        assert_eq!(c.await.unwrap(), Envelope::success(json!("c")));

        let recorded = transport.recorded();
        assert_eq!(recorded.len(), 1);
        let paths: Vec<_> = recorded[0].1.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, ["a", "c"]);
    }

    #[tokio::test]
    async fn test_fully_cancelled_batch_sends_nothing() {
        let transport = MockTransport::new(MockTransport::echo());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

        let (a, ha) = coordinator.submit(&op(1, "a", json!(1)));
        let (b, hb) = coordinator.submit(&op(2, "b", json!(2)));
        ha.cancel();
        hb.cancel();

        assert!(matches!(a.await, Err(ClientError::Canceled)));
        assert!(matches!(b.await, Err(ClientError::Canceled)));
        settle_tasks().await;
        assert!(transport.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_cancelling_every_member_aborts_call() {
        let gate = Arc::new(Notify::new());
        let transport = MockTransport::gated(MockTransport::echo(), gate);
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

        let (a, ha) = coordinator.submit(&op(1, "a", json!(1)));
        let (b, hb) = coordinator.submit(&op(2, "b", json!(2)));
        let (a, b) = (tokio::spawn(a), tokio::spawn(b));
        settle_tasks().await;
        assert_eq!(transport.recorded().len(), 1);

        ha.cancel();
        settle_tasks().await;
        assert!(!transport.dropped.load(Ordering::SeqCst));

        hb.cancel();
        settle_tasks().await;
        assert!(transport.dropped.load(Ordering::SeqCst));

        assert!(matches!(a.await.unwrap(), Err(ClientError::Canceled)));
        assert!(matches!(b.await.unwrap(), Err(ClientError::Canceled)));
    }

    #[tokio::test]
    async fn test_cancel_after_dispatch_detaches_member() {
        let gate = Arc::new(Notify::new());
        let transport = MockTransport::gated(MockTransport::echo(), gate.clone());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

        let (a, ha) = coordinator.submit(&op(1, "a", json!(1)));
        let (b, _hb) = coordinator.submit(&op(2, "b", json!(2)));
        let b = tokio::spawn(b);
        settle_tasks().await;
        assert_eq!(transport.recorded().len(), 1);

        ha.cancel();
        gate.notify_one();

        assert!(matches!(a.await, Err(ClientError::Canceled)));
        assert_eq!(b.await.unwrap().unwrap(), Envelope::success(json!(2)));
    }

    #[tokio::test]
    async fn test_window_stays_open_until_caller_yields() {
        let transport = MockTransport::new(MockTransport::echo());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

        let (mut a, _ha) = coordinator.submit(&op(1, "a", json!(1)));
        assert!(futures::poll!(&mut a).is_pending());
        let (b, _hb) = coordinator.submit(&op(2, "b", json!(2)));

        assert_eq!(a.await.unwrap(), Envelope::success(json!(1)));
        assert_eq!(b.await.unwrap(), Envelope::success(json!(2)));

        let recorded = transport.recorded();
        assert_eq!(recorded.len(), 1);
        let paths: Vec<_> = recorded[0].1.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_unpolled_window_sends_nothing() {
        let transport = MockTransport::new(MockTransport::echo());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

        let (a, _ha) = coordinator.submit(&op(1, "a", json!(1)));
        settle_tasks().await;
        assert!(transport.recorded().is_empty());

        assert!(a.await.is_ok());
        assert_eq!(transport.recorded().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_synchronous_burst_is_one_call_on_multi_thread() {
        for _ in 0..50 {
            let transport = MockTransport::new(MockTransport::echo());
            let coordinator =
                BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

            let pending: Vec<_> = (0..200)
                .map(|i| coordinator.submit(&op(i, "n", json!(i))))
                .collect();
            for (i, (call, _handle)) in pending.into_iter().enumerate() {
                assert_eq!(call.await.unwrap(), Envelope::success(json!(i)));
            }

            let recorded = transport.recorded();
            assert_eq!(recorded.len(), 1);
            assert_eq!(recorded[0].1.len(), 200);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_batch_size_holds_on_multi_thread() {
        let transport = MockTransport::new(MockTransport::echo());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), Some(64));

        let pending: Vec<_> = (0..200)
            .map(|i| coordinator.submit(&op(i, "n", json!(i))))
            .collect();
        for (call, _handle) in pending {
            assert!(call.await.is_ok());
        }

        let mut sizes: Vec<_> = transport.recorded().iter().map(|(_, c)| c.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, [8, 64, 64, 64]);
    }

    #[tokio::test]
    async fn test_malformed_slot_fails_only_its_member() {
        let transport = MockTransport::new(Box::new(|_| {
            Ok(Bytes::from_static(br#"[{"result":"Alice"},{"unexpected":2}]"#))
        }));
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport, None);

        let (a, _ha) = coordinator.submit(&op(1, "getUser", json!(1)));
        let (b, _hb) = coordinator.submit(&op(2, "getUser", json!(2)));

        assert_eq!(a.await.unwrap(), Envelope::success(json!("Alice")));
        let err = b.await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert_eq!(err.code(), Code::ParseError);
    }

    #[tokio::test]
    async fn test_cancel_after_settle_is_noop() {
        let transport = MockTransport::new(MockTransport::echo());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport, None);

        let (a, ha) = coordinator.submit(&op(1, "a", json!(1)));
        assert!(a.await.is_ok());
        ha.cancel();
    }

    #[tokio::test]
    async fn test_guard_cancels_on_drop() {
        let transport = MockTransport::new(MockTransport::echo());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), None);

        let (a, ha) = coordinator.submit(&op(1, "a", json!(1)));
        let (b, hb) = coordinator.submit(&op(2, "b", json!(2)));
        drop(ha.into_guard());
        let mut guard = hb.into_guard();
        guard.disarm();

        assert!(matches!(a.await, Err(ClientError::Canceled)));
        assert!(b.await.is_ok());
        assert_eq!(transport.recorded()[0].1.len(), 1);
    }

    #[tokio::test]
    async fn test_max_batch_size_closes_window_early() {
        let transport = MockTransport::new(MockTransport::echo());
        let coordinator = BatchCoordinator::new(ProcedureKind::Query, transport.clone(), Some(2));

        let pending: Vec<_> = (0..3)
            .map(|i| coordinator.submit(&op(i, "n", json!(i))))
            .collect();
        for (i, (call, _handle)) in pending.into_iter().enumerate() {
            assert_eq!(call.await.unwrap(), Envelope::success(json!(i)));
        }

        let sizes: Vec<_> = transport.recorded().iter().map(|(_, c)| c.len()).collect();
        assert_eq!(sizes, [2, 1]);
    }
}
