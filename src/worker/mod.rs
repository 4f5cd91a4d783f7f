//! AI worker channel: line-delimited JSON over a persistent child process.
//!
//! `protocol` holds the wire types (field names are compatibility
//! surface); `client` owns the transport, the readiness handshake, and the
//! per-correlation-id demultiplexer.

pub mod client;
pub mod protocol;

pub use client::{StreamUpdate, WorkerClient, WorkerError};
pub use protocol::{
    GenerationContext, GenerationMode, GenerationRequest, WorkerCommand, WorkerEvent,
};
