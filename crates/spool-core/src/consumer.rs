//! The callback interface a consumer exposes to the service.

use std::sync::Arc;

use crate::ids::FlushId;
use crate::packet::TracePacket;

/// Implemented by trace consumers.
///
/// Invoked on the service task runner. Packet batches are bounded frames;
/// `has_more` tells the consumer whether another batch for the same
/// `read_buffers` request follows.
pub trait Consumer: Send + Sync {
    fn on_connect(&self);

    fn on_disconnect(&self);

    /// The session left the Enabled state (explicit disable, duration
    /// expiry, or teardown).
    fn on_tracing_disabled(&self);

    fn on_trace_packets(&self, packets: Vec<TracePacket>, has_more: bool);

    /// A flush finished. `partial` is set when the deadline expired before
    /// every producer acked.
    fn on_flush_complete(&self, flush_id: FlushId, partial: bool);
}

pub type ConsumerRef = Arc<dyn Consumer>;
