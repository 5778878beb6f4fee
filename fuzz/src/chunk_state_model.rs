//! In-memory model of the per-page chunk ownership state machine.
//!
//! The real thing is 2-bit states packed into one atomic word per page;
//! the model is a plain `Vec<Vec<State>>`. `execute_and_verify` applies
//! identical op sequences to both and demands identical outcomes:
//!
//! - only `Free → BeingWritten → Complete → BeingRead → Free` transitions
//!   succeed, and only from the right side;
//! - partitioning succeeds exactly on blank pages;
//! - a page whose chunks all return to Free becomes blank again.

use spool_shm::{
    ChunkHeader, ChunkState, HeapSharedMemory, PageLayout, SharedMemory, SharedMemoryAbi,
};

pub const PAGE_SIZE: usize = 4096;

/// Model-side page: blank, or a layout with explicit chunk states.
#[derive(Debug, Clone)]
pub enum PageModel {
    Blank,
    Partitioned { layout: PageLayout, states: Vec<ChunkState> },
}

pub struct StateModel {
    pages: Vec<PageModel>,
}

impl StateModel {
    pub fn new(num_pages: usize) -> Self {
        Self {
            pages: vec![PageModel::Blank; num_pages],
        }
    }

    pub fn try_partition(&mut self, page: usize, layout: PageLayout) -> bool {
        match self.pages[page] {
            PageModel::Blank => {
                self.pages[page] = PageModel::Partitioned {
                    layout,
                    states: vec![ChunkState::Free; layout.chunk_count()],
                };
                true
            }
            PageModel::Partitioned { .. } => false,
        }
    }

    /// Attempts `from → to` on one chunk; true on success.
    pub fn transition(&mut self, page: usize, index: usize, from: ChunkState, to: ChunkState) -> bool {
        let PageModel::Partitioned { states, .. } = &mut self.pages[page] else {
            return false;
        };
        if index >= states.len() || states[index] != from {
            return false;
        }
        states[index] = to;
        // All-free pages blank out for re-partitioning.
        if to == ChunkState::Free && states.iter().all(|&s| s == ChunkState::Free) {
            self.pages[page] = PageModel::Blank;
        }
        true
    }

    pub fn state(&self, page: usize, index: usize) -> Option<ChunkState> {
        match &self.pages[page] {
            PageModel::Blank => None,
            PageModel::Partitioned { states, .. } => states.get(index).copied(),
        }
    }

    pub fn is_blank(&self, page: usize) -> bool {
        matches!(self.pages[page], PageModel::Blank)
    }
}

/// Operations the fuzzer drives. Page/index/layout values are taken modulo
/// the valid ranges so every generated op is applicable.
#[derive(Debug, Clone, Copy)]
pub enum StateOp {
    Partition { page: u8, layout: u8 },
    Acquire { page: u8, index: u8 },
    Commit { page: u8, index: u8 },
    AcquireForRead { page: u8, index: u8 },
    Release { page: u8, index: u8 },
}

fn pick_layout(raw: u8) -> PageLayout {
    PageLayout::ALL[usize::from(raw) % PageLayout::ALL.len()]
}

/// Applies `ops` to the model and to a real region, comparing outcomes and
/// states after every op.
pub fn execute_and_verify(num_pages: usize, ops: &[StateOp]) -> Result<(), String> {
    let num_pages = num_pages.clamp(1, 8);
    let shmem = HeapSharedMemory::new(num_pages * PAGE_SIZE, PAGE_SIZE);
    // SAFETY: `shmem` outlives `abi`; both live to the end of this call.
    let abi = unsafe { SharedMemoryAbi::from_raw(shmem.as_ptr(), shmem.size(), PAGE_SIZE) }
        .map_err(|e| e.to_string())?;
    let mut model = StateModel::new(num_pages);
    // Chunk handles held between Acquire and Commit, and between
    // AcquireForRead and Release.
    let mut held: Vec<Option<spool_shm::Chunk>> = vec![None; num_pages * 16];

    for (i, op) in ops.iter().enumerate() {
        match *op {
            StateOp::Partition { page, layout } => {
                let page = usize::from(page) % num_pages;
                let layout = pick_layout(layout);
                let expected = model.try_partition(page, layout);
                let got = abi.try_partition_page(page, layout);
                if got != expected {
                    return Err(format!("op {i}: partition mismatch ({got} vs {expected})"));
                }
            }
            StateOp::Acquire { page, index } => {
                let page = usize::from(page) % num_pages;
                let index = usize::from(index) % 14;
                let expected =
                    model.transition(page, index, ChunkState::Free, ChunkState::BeingWritten);
                let got = abi.try_acquire_chunk(page, index);
                if got.is_ok() != expected {
                    return Err(format!("op {i}: acquire mismatch"));
                }
                if let Ok(chunk) = got {
                    held[page * 16 + index] = Some(chunk);
                }
            }
            StateOp::Commit { page, index } => {
                let page = usize::from(page) % num_pages;
                let index = usize::from(index) % 14;
                let expected =
                    model.transition(page, index, ChunkState::BeingWritten, ChunkState::Complete);
                match held[page * 16 + index].take() {
                    Some(chunk) => {
                        let got = abi.commit_chunk(&chunk, ChunkHeader::new(1, 0, 0));
                        if got.is_ok() != expected {
                            return Err(format!("op {i}: commit mismatch"));
                        }
                        if got.is_err() {
                            held[page * 16 + index] = Some(chunk);
                        }
                    }
                    None => {
                        // No handle: the chunk can't be in BeingWritten from
                        // our side, so the model must refuse too.
                        if expected {
                            return Err(format!("op {i}: model committed without a handle"));
                        }
                    }
                }
            }
            StateOp::AcquireForRead { page, index } => {
                let page = usize::from(page) % num_pages;
                let index = usize::from(index) % 14;
                let expected =
                    model.transition(page, index, ChunkState::Complete, ChunkState::BeingRead);
                let got = abi.try_acquire_for_read(page, index);
                if got.is_ok() != expected {
                    return Err(format!("op {i}: acquire-for-read mismatch"));
                }
            }
            StateOp::Release { page, index } => {
                let page = usize::from(page) % num_pages;
                let index = usize::from(index) % 14;
                let expected =
                    model.transition(page, index, ChunkState::BeingRead, ChunkState::Free);
                let got = abi.release_chunk_as_free(page, index);
                if got.is_ok() != expected {
                    return Err(format!("op {i}: release mismatch"));
                }
            }
        }

        // Full state comparison, including blank-page agreement.
        for page in 0..num_pages {
            if abi.is_page_blank(page) != model.is_blank(page) {
                return Err(format!("op {i}: page {page} blankness diverged"));
            }
            for index in 0..14 {
                if abi.chunk_state(page, index) != model.state(page, index) {
                    return Err(format!("op {i}: state of page {page} chunk {index} diverged"));
                }
            }
        }
    }
    Ok(())
}
