//! Trace configuration.
//!
//! A `TraceConfig` describes one tracing session: the log buffers to
//! allocate, the data sources to enable and which buffer each one targets,
//! and session-wide knobs. The structs are plain serde-able data; validation
//! happens when a consumer configures a session.

use serde::{Deserialize, Serialize};

use crate::ids::BufferId;

/// What a log buffer does when a new chunk record does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FillPolicy {
    /// Overwrite the oldest records (the buffer is a ring).
    #[default]
    Ring,
    /// Stop accepting chunks once the buffer would wrap.
    Discard,
}

/// Configuration of one log buffer within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub size_bytes: usize,
    #[serde(default)]
    pub fill_policy: FillPolicy,
}

/// Configuration blob handed to a data source instance.
///
/// `target_buffer` is filled in by the service when it fans the config out:
/// it is the session-local buffer the instance's writers must target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    #[serde(default)]
    pub target_buffer: BufferId,
    /// Source-specific payload, opaque to the service.
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// One data source requested by a trace config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceSpec {
    /// Registered data source name to match.
    pub name: String,
    /// If non-empty, only producers whose name is listed are enabled.
    #[serde(default)]
    pub producer_name_filter: Vec<String>,
    /// Index into `TraceConfig::buffers` this source writes into.
    #[serde(default)]
    pub target_buffer: u32,
    #[serde(default)]
    pub config: DataSourceConfig,
}

/// The root session configuration submitted by a consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceConfig {
    pub buffers: Vec<BufferConfig>,
    pub data_sources: Vec<DataSourceSpec>,
    /// 0 means "until disabled".
    #[serde(default)]
    pub duration_ms: u32,
    #[serde(default)]
    pub flush_interval_ms: u32,
    /// Upper bound on the shared memory handed to each producer. 0 = default.
    #[serde(default)]
    pub max_shm_size_bytes: usize,
}

/// What a producer advertises when registering a data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
    /// When set, session disable waits for this source's stop ack.
    #[serde(default)]
    pub will_notify_on_stop: bool,
}
