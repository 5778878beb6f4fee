//! spool-service: the tracing service core.
//!
//! Owns every mutable piece of the tracing stack: the per-session log
//! buffers that chunks get copied into, the registry of producers and
//! consumers, and the session state machine that coordinates configure,
//! start, flush and teardown across processes.
//!
//! Everything here runs on one task runner; no method yields mid-operation.
//! The only concurrency this crate touches is the chunk ownership handoff
//! in `spool-shm`, on its read side.

pub mod log_buffer;
pub mod service;

pub use log_buffer::{
    LogBuffer, LogBufferError, PacketSlices, PATCH_LEN, RECORD_ALIGNMENT, RECORD_HEADER_SIZE,
};
pub use service::{ProducerConnection, SessionState, TracingService};
pub use spool_shm::{CommitBatch, CommitSink, PatchRequest};
