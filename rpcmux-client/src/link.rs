//! The transport link: one batch coordinator per procedure kind.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rpcmux_core::{Operation, ProcedureKind};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ClientError;
use crate::batch::{BatchCoordinator, BatchTransport};

/// Client-side link that batches operations per kind and resolves each
/// caller with its own payload or a [`ClientError`].
///
/// The coordinators are created with the link and live as long as it does,
/// so operations issued in the same scheduler turn share one physical call.
#[derive(Debug)]
pub struct BatchLink {
    query: BatchCoordinator,
    mutation: BatchCoordinator,
    subscription: BatchCoordinator,
    next_id: AtomicU64,
}

impl BatchLink {
    pub fn new(transport: Arc<dyn BatchTransport>, max_batch_size: Option<usize>) -> Self {
        let coordinator =
            |kind| BatchCoordinator::new(kind, Arc::clone(&transport), max_batch_size);
        Self {
            query: coordinator(ProcedureKind::Query),
            mutation: coordinator(ProcedureKind::Mutation),
            subscription: coordinator(ProcedureKind::Subscription),
            next_id: AtomicU64::new(1),
        }
    }

    /// The coordinator operations of `kind` are submitted to.
    pub fn coordinator(&self, kind: ProcedureKind) -> &BatchCoordinator {
        match kind {
            ProcedureKind::Query => &self.query,
            ProcedureKind::Mutation => &self.mutation,
            ProcedureKind::Subscription => &self.subscription,
        }
    }

    /// Build an operation with a fresh correlation id.
    pub fn operation(&self, kind: ProcedureKind, path: impl Into<String>, input: Value) -> Operation {
        Operation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            path: path.into(),
            input,
        }
    }

    /// Execute an operation and wait for its payload.
    ///
    /// The operation joins its kind's current batch when this future is
    /// first polled. Cancelling `scope`, or dropping the future before it
    /// completes, cancels the operation.
    pub async fn execute(
        &self,
        operation: Operation,
        scope: &CancellationToken,
    ) -> Result<Value, ClientError> {
        if scope.is_cancelled() {
            return Err(ClientError::Canceled);
        }

        let (pending, handle) = self.coordinator(operation.kind).submit(&operation);
        let mut guard = handle.into_guard();

        let envelope = tokio::select! {
            biased;
            envelope = pending => envelope,
            _ = scope.cancelled() => {
                guard.cancel();
                return Err(ClientError::Canceled);
            }
        };
        guard.disarm();

        envelope?.into_result().map_err(ClientError::from)
    }
}
