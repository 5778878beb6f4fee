//! Producer-side chunk allocator.
//!
//! The arbiter is the only component that touches the shared region's state
//! words from the producer side. It scans for Free chunks (partitioning
//! blank pages on demand), commits finished chunks, and coalesces the
//! resulting notifications into one [`CommitBatch`] per tick so the service
//! sees a pages bitmap rather than a call per chunk.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use spool_core::ids::{BufferId, WriterId};
use spool_core::TaskRunner;
use spool_shm::{
    Chunk, ChunkHeader, CommitBatch, CommitSink, Doorbell, PageLayout, PatchRequest,
    SharedMemory, SharedMemoryAbi, CHUNK_HEADER_SIZE,
};

use crate::writer::{StallPolicy, TraceWriter};

/// No chunk of sufficient capacity is currently free. Not an error; the
/// writer decides whether to block or drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall;

struct ArbiterInner {
    /// Round-robin scan start, so writers don't all pile onto page 0.
    next_page: usize,
    next_writer_id: WriterId,
    pending: CommitBatch,
    flush_scheduled: bool,
}

pub struct SharedMemoryArbiter {
    abi: SharedMemoryAbi,
    /// Keeps the region mapped for as long as any chunk handle lives.
    _shmem: Arc<dyn SharedMemory>,
    sink: Arc<dyn CommitSink>,
    doorbell: Arc<Doorbell>,
    runner: TaskRunner,
    /// Self-reference so the tick task can re-enter the arbiter.
    weak_self: std::sync::Weak<SharedMemoryArbiter>,
    inner: Mutex<ArbiterInner>,
}

impl SharedMemoryArbiter {
    /// Builds an arbiter over a connected producer's region.
    ///
    /// `runner` is the producer-side task runner used to tick out batched
    /// commit notifications; `sink` is where batches go (the service, in
    /// process).
    pub fn new(
        shmem: Arc<dyn SharedMemory>,
        page_size: usize,
        sink: Arc<dyn CommitSink>,
        doorbell: Arc<Doorbell>,
        runner: TaskRunner,
    ) -> Arc<Self> {
        // SAFETY: the region Arc is stored alongside the view and outlives
        // every chunk handle the view produces.
        let abi = unsafe { SharedMemoryAbi::from_raw(shmem.as_ptr(), shmem.size(), page_size) }
            .expect("producer connection carries a validated region");
        Arc::new_cyclic(|weak_self| Self {
            abi,
            _shmem: shmem,
            sink,
            doorbell,
            runner,
            weak_self: weak_self.clone(),
            inner: Mutex::new(ArbiterInner {
                next_page: 0,
                next_writer_id: 0,
                pending: CommitBatch::default(),
                flush_scheduled: false,
            }),
        })
    }

    /// Creates a writer targeting `target_buffer`, assigning the next
    /// WriterId of this connection.
    pub fn create_trace_writer(&self, target_buffer: BufferId, policy: StallPolicy) -> TraceWriter {
        let writer_id = {
            let mut inner = self.inner.lock();
            inner.next_writer_id = inner.next_writer_id.wrapping_add(1).max(1);
            inner.next_writer_id
        };
        let arbiter = self
            .weak_self
            .upgrade()
            .expect("arbiter is always constructed inside an Arc");
        TraceWriter::new(arbiter, writer_id, target_buffer, policy)
    }

    /// Finds and acquires a Free chunk whose payload holds at least
    /// `size_hint` bytes, partitioning blank pages as needed.
    pub fn get_new_chunk(&self, size_hint: usize) -> Result<Chunk, Stall> {
        let num_pages = self.abi.num_pages();
        let start = {
            let inner = self.inner.lock();
            inner.next_page
        };
        for i in 0..num_pages {
            let page = (start + i) % num_pages;
            match self.abi.page_layout(page) {
                Some(layout) => {
                    if layout.chunk_size(self.abi.page_size()) - CHUNK_HEADER_SIZE < size_hint {
                        continue;
                    }
                    for index in 0..layout.chunk_count() {
                        if let Ok(chunk) = self.abi.try_acquire_chunk(page, index) {
                            self.inner.lock().next_page = page;
                            return Ok(chunk);
                        }
                    }
                }
                None => {
                    let layout = layout_for_hint(self.abi.page_size(), size_hint);
                    // Another release may have blanked the page meanwhile;
                    // losing the partition race just means retrying the scan.
                    if self.abi.try_partition_page(page, layout) {
                        if let Ok(chunk) = self.abi.try_acquire_chunk(page, 0) {
                            self.inner.lock().next_page = page;
                            return Ok(chunk);
                        }
                    }
                }
            }
        }
        Err(Stall)
    }

    /// Commits a written chunk and queues its notification.
    pub fn release_chunk(&self, chunk: &Chunk, header: ChunkHeader) {
        if self.abi.commit_chunk(chunk, header).is_err() {
            // commit_chunk already logged; nothing to notify about.
            return;
        }
        let mut inner = self.inner.lock();
        inner.pending.mark_chunk(chunk.page(), chunk.index());
        self.schedule_flush(&mut inner);
    }

    /// Queues a deferred length-prefix patch for a chunk that has already
    /// been committed.
    pub fn add_patch(&self, patch: PatchRequest) {
        let mut inner = self.inner.lock();
        inner.pending.patches.push(patch);
        self.schedule_flush(&mut inner);
    }

    /// Sends the pending batch now instead of waiting for the tick.
    pub fn flush_pending_commits(&self) {
        let batch = {
            let mut inner = self.inner.lock();
            inner.flush_scheduled = false;
            std::mem::take(&mut inner.pending)
        };
        if !batch.is_empty() {
            self.sink.commit(batch);
        }
    }

    /// Current doorbell epoch; sample before a scan that may stall.
    pub fn doorbell_epoch(&self) -> u64 {
        self.doorbell.epoch()
    }

    /// Blocks until the service frees any chunk (or the timeout passes).
    pub fn wait_for_chunk_release(&self, seen_epoch: u64, timeout: Duration) -> bool {
        self.doorbell.wait_past(seen_epoch, timeout)
    }

    /// Arranges for the pending batch to go out on the next runner tick.
    /// Everything committed before the task runs coalesces into one batch.
    fn schedule_flush(&self, inner: &mut ArbiterInner) {
        if inner.flush_scheduled {
            return;
        }
        inner.flush_scheduled = true;
        let Some(arbiter) = self.weak_self.upgrade() else {
            return;
        };
        self.runner.post(move || arbiter.flush_pending_commits());
    }
}

/// Picks the division whose chunks are the smallest that still fit
/// `size_hint` payload bytes, maximizing chunks per page.
fn layout_for_hint(page_size: usize, size_hint: usize) -> PageLayout {
    for layout in [
        PageLayout::Fourteen,
        PageLayout::Seven,
        PageLayout::Four,
        PageLayout::Two,
        PageLayout::One,
    ] {
        if layout.chunk_size(page_size) - CHUNK_HEADER_SIZE >= size_hint {
            return layout;
        }
    }
    PageLayout::One
}
