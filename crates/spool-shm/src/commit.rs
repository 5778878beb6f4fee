//! Commit notifications flowing from an arbiter to the service.
//!
//! Producers do not call the service once per chunk. The arbiter batches
//! everything committed since the last tick into one `CommitBatch`: a
//! per-page bitmap of chunk slots that reached Complete, plus any deferred
//! length-prefix patches targeting chunks that already left the producer's
//! hands.

use spool_core::ids::{BufferId, ChunkId, WriterId};

/// A 4-byte patch to a chunk already copied into a log buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRequest {
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
    pub target_buffer: BufferId,
    /// Offset relative to the chunk payload.
    pub offset: usize,
    pub data: [u8; 4],
}

/// One arbiter tick's worth of shared-memory changes.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    /// `(page index, slot mask)`: bit `i` set means chunk `i` of that page
    /// was committed. At most one entry per page.
    pub pages: Vec<(usize, u16)>,
    pub patches: Vec<PatchRequest>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.patches.is_empty()
    }

    /// Marks a chunk slot dirty, coalescing per page.
    pub fn mark_chunk(&mut self, page: usize, chunk_index: usize) {
        debug_assert!(chunk_index < 16);
        match self.pages.iter_mut().find(|(p, _)| *p == page) {
            Some((_, mask)) => *mask |= 1 << chunk_index,
            None => self.pages.push((page, 1 << chunk_index)),
        }
    }
}

/// Where an arbiter delivers its batches: the service, or a test double.
pub trait CommitSink: Send + Sync {
    fn commit(&self, batch: CommitBatch);
}
