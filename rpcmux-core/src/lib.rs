//! Core protocol types for rpcmux.
//!
//! This crate provides the wire vocabulary shared by the server (`rpcmux`)
//! and client (`rpcmux-client`) crates.
//!
//! ## Modules
//!
//! - `error`: Error codes, the structured error shape and the error taxonomy
//! - `envelope`: Batched call envelopes and persistent-connection frames
//! - `codec`: Encoding and decoding of envelopes and inbound frames

mod codec;
mod envelope;
mod error;

pub use codec::*;
pub use envelope::*;
pub use error::*;
