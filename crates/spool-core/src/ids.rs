//! Identifier types.
//!
//! All ids are opaque unsigned integers. `ChunkId` is the only one with
//! wrap-around semantics: writers number their chunks with a monotonically
//! increasing counter that wraps at `u32::MAX`, and every comparison between
//! chunk ids of the same writer sequence must go through the signed-difference
//! helpers below rather than `<`.

/// Identifies a connected producer. Unique for the lifetime of the service.
pub type ProducerId = u16;

/// Identifies a writer stream within a producer.
pub type WriterId = u16;

/// Sequences chunks within a (producer, writer) pair. Wraps.
pub type ChunkId = u32;

/// Identifies a log buffer. Stable for the lifetime of its session.
pub type BufferId = u16;

/// Identifies a consumer's tracing session.
pub type SessionId = u64;

/// Identifies a connected consumer.
pub type ConsumerId = u64;

/// Identifies a registered data source kind, scoped to its producer.
pub type DataSourceId = u64;

/// Identifies one active instance of a data source.
pub type DataSourceInstanceId = u64;

/// Identifies one flush request within a session.
pub type FlushId = u64;

/// Returns true if chunk id `a` was produced after `b` within the same
/// writer sequence, treating the id space as circular.
///
/// Well-defined as long as the two ids are less than half the id space
/// apart, which holds for any pair of chunks alive in a buffer at once.
#[inline]
pub fn chunk_id_is_newer(a: ChunkId, b: ChunkId) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// The id following `id` in a writer sequence.
#[inline]
pub fn next_chunk_id(id: ChunkId) -> ChunkId {
    id.wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_across_wrap() {
        assert!(chunk_id_is_newer(1, 0));
        assert!(chunk_id_is_newer(0, ChunkId::MAX));
        assert!(chunk_id_is_newer(2, ChunkId::MAX - 1));
        assert!(!chunk_id_is_newer(ChunkId::MAX, 0));
        assert!(!chunk_id_is_newer(5, 5));
    }

    #[test]
    fn successor_wraps() {
        assert_eq!(next_chunk_id(ChunkId::MAX), 0);
        assert_eq!(next_chunk_id(41), 42);
    }
}
