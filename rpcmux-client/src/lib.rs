//! Batching RPC client for rpcmux.
//!
//! Concurrent calls of the same kind issued within one scheduler turn are
//! coalesced into a single physical HTTP request and their results fanned
//! back out to each caller.
//!
//! ## Example
//!
//! ```ignore
//! use rpcmux_client::RpcClient;
//!
//! let client = RpcClient::builder("http://localhost:3000/trpc").build()?;
//!
//! // One HTTP request: GET /trpc/getUser,getUser?batch=1&input=[1,2]
//! let (alice, bob) = tokio::join!(
//!     client.query::<_, String>("getUser", &1),
//!     client.query::<_, String>("getUser", &2),
//! );
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: The per-kind batch coordinator and the transport seam
//! - [`link`]: One coordinator per kind with cancellation scopes
//! - [`transport`]: HTTP transport built on hyper
//!
//! ## Feature Flags
//!
//! | Feature | Description | Default |
//! |---------|-------------|---------|
//! | `tracing` | Spans and events for batch dispatch | no |

pub mod batch;
mod builder;
mod client;
mod error;
pub mod link;
pub mod transport;

pub use batch::{BatchCoordinator, BatchTransport, CancelGuard, CancelHandle, PendingCall};
pub use builder::{ClientBuildError, ClientBuilder};
pub use client::RpcClient;
pub use error::ClientError;
pub use link::BatchLink;
pub use transport::HttpBatchTransport;

// Re-export core types for convenience
pub use rpcmux_core::{Code, ErrorShape, Operation, ProcedureKind, Status};
pub use tokio_util::sync::CancellationToken;
