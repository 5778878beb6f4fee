//! spool-core: shared vocabulary of the spool tracing stack.
//!
//! Everything here is plain data or process-local plumbing: identifier
//! types, the varint packet framing codec, trace configuration, the
//! `Producer`/`Consumer` callback traits, the single-threaded task runner
//! the service runs on, and the watchdog.
//!
//! The shared-memory ABI lives in `spool-shm`; the service and its log
//! buffers live in `spool-service`.

pub mod config;
pub mod consumer;
pub mod error;
pub mod ids;
pub mod packet;
pub mod producer;
pub mod runner;
pub mod sanity;
pub mod stats;
pub mod varint;
pub mod watchdog;

pub use config::{
    BufferConfig, DataSourceConfig, DataSourceDescriptor, DataSourceSpec, FillPolicy, TraceConfig,
};
pub use consumer::Consumer;
pub use error::ServiceError;
pub use ids::{
    chunk_id_is_newer, BufferId, ChunkId, ConsumerId, DataSourceId, DataSourceInstanceId, FlushId,
    ProducerId, SessionId, WriterId,
};
pub use packet::TracePacket;
pub use producer::Producer;
pub use runner::TaskRunner;
pub use stats::{BufferStats, TraceStats};
pub use watchdog::{TimerGuard, TimerReason, Watchdog};
