//! spool-producer: the untrusted side of the shared-memory transport.
//!
//! A producer process holds one [`SharedMemoryArbiter`] per connection. The
//! arbiter hands out chunks from the shared region to [`TraceWriter`]s,
//! assigns chunk ids, and batches commit notifications (and deferred
//! length-prefix patches) toward the service, at most one batch per tick.
//!
//! Writers are single-threaded by construction: every mutating method takes
//! `&mut self`, and a packet handle borrows its writer exclusively.

pub mod arbiter;
pub mod writer;

pub use arbiter::{SharedMemoryArbiter, Stall};
pub use writer::{PacketHandle, StallPolicy, TraceWriter};
