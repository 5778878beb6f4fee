//! spool-shm: the shared-memory transport ABI.
//!
//! This crate defines the one data structure that crosses the trust
//! boundary between producers and the service: a region of fixed-size pages,
//! each subdivided into chunks whose ownership is handed off through a
//! 2-bit state machine packed into an atomic word per page.
//!
//! # Memory layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Page 0                                                       │
//! │ ┌──────────────┬─────────────────────────────────────────┐   │
//! │ │ PageHeader   │ chunk 0 │ chunk 1 │ ... │ chunk N-1     │   │
//! │ │ (8 bytes)    │ (ChunkHeader + payload) ...             │   │
//! │ └──────────────┴─────────────────────────────────────────┘   │
//! │ Page 1 ...                                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The page header is a single `AtomicU32` *layout word*: 4 bits of layout
//! id selecting the division (1, 2, 4, 7 or 14 chunks) and 2 bits of state
//! per chunk. All ownership transitions are CAS on that word; the chunk
//! payload is only ever touched by whichever side the state says owns it.

pub mod abi;
pub mod commit;
pub mod doorbell;
pub mod shmem;

pub use abi::{
    Chunk, ChunkHeader, ChunkState, ChunkStateError, LayoutError, PageLayout, SharedMemoryAbi,
    CHUNK_CONT_FROM_PREV, CHUNK_CONT_ON_NEXT, CHUNK_HEADER_SIZE, PAGE_HEADER_SIZE,
};
pub use commit::{CommitBatch, CommitSink, PatchRequest};
pub use doorbell::Doorbell;
pub use shmem::{HeapShmFactory, HeapSharedMemory, SharedMemory, SharedMemoryFactory};

/// Default page size handed to producers. Must be a power of two.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default total region size per producer.
pub const DEFAULT_SHM_SIZE: usize = 256 * 1024;
