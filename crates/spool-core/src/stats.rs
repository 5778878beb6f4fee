//! Counters maintained by the log buffers and the service.
//!
//! None of these feed back into behavior; they exist so tests and consumers
//! can tell silent drops from clean runs.

/// Per-buffer counters. All monotonic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Chunk records accepted into the buffer.
    pub chunks_written: u64,
    /// Live records displaced by later writes or padding.
    pub chunks_overwritten: u64,
    /// A repeated (producer, writer, chunk id) replaced a live record.
    pub chunks_rewritten: u64,
    /// Chunks refused because the buffer is in discard mode and wrapped.
    pub chunks_discarded: u64,
    /// Bytes consumed by padding records.
    pub padding_bytes_written: u64,
    pub patches_succeeded: u64,
    pub patches_failed: u64,
    /// Fragmented packets stitched across chunks.
    pub readaheads_succeeded: u64,
    /// Stitching attempts that had to wait for a missing successor.
    pub readaheads_failed: u64,
    /// Malformed producer data detected on the read path (bad varints,
    /// out-of-bounds fragments, broken continuation flags).
    pub abi_violations: u64,
    /// Packets whose fragments were discarded instead of delivered.
    pub packets_dropped: u64,
    pub packets_read: u64,
    pub bytes_read: u64,
}

/// Aggregate view across every buffer of a session, plus service-level
/// producer bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub buffers_created: u64,
    pub producers_connected: u64,
    pub producers_seen: u64,
    pub data_sources_registered: u64,
    pub chunks_committed: u64,
    pub patches_routed: u64,
}
