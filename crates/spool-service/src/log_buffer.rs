//! The per-session log buffer.
//!
//! A `LogBuffer` is a contiguous byte ring holding *chunk records*: a 16-byte
//! header followed by a 16-byte-aligned copy of a chunk payload taken from a
//! producer's shared memory. A `BTreeMap` index keyed by
//! (producer, writer, chunk id) points at the live records; padding records
//! keep the byte stream walkable but never enter the index.
//!
//! Writes evict whatever records their bytes displace. Reads walk writer
//! sequences in wrapping chunk-id order and reassemble packets that span
//! chunks, discarding (and counting) anything a malicious or crashed
//! producer left inconsistent. Nothing a producer writes can make this
//! module fail; at worst its chunks get dropped.
//!
//! Record layout, little-endian:
//!
//! ```text
//! ┌────────┬──────────┬────────┬──────────┬───────┬──────┬─────────────┐
//! │ size   │ producer │ writer │ chunk_id │ flags │ _pad │ num_packets │
//! │ u32    │ u16      │ u16    │ u32      │ u8    │ u8   │ u16         │
//! └────────┴──────────┴────────┴──────────┴───────┴──────┴─────────────┘
//! ```

use std::collections::btree_map::BTreeMap;
use std::collections::hash_map::{Entry, HashMap};
use std::ops::Bound;

use thiserror::Error;

use spool_core::ids::{chunk_id_is_newer, next_chunk_id, ChunkId, ProducerId, WriterId};
use spool_core::stats::BufferStats;
use spool_core::varint;
use spool_core::{FillPolicy, TracePacket};
use spool_shm::{CHUNK_CONT_FROM_PREV, CHUNK_CONT_ON_NEXT};

/// Size of a chunk record header.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Records are sized and placed in multiples of this.
pub const RECORD_ALIGNMENT: usize = 16;

/// Width of an out-of-band patch.
pub const PATCH_LEN: usize = 4;

/// Record-level flag marking padding; never visible outside the buffer.
const FLAG_PADDING: u8 = 1 << 7;

const PRODUCER_FLAGS: u8 = CHUNK_CONT_FROM_PREV | CHUNK_CONT_ON_NEXT;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogBufferError {
    #[error("invalid log buffer size {0}: must be a non-zero multiple of the record alignment")]
    InvalidSize(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ChunkKey {
    producer: ProducerId,
    writer: WriterId,
    chunk_id: ChunkId,
}

impl ChunkKey {
    fn new(producer: ProducerId, writer: WriterId, chunk_id: ChunkId) -> Self {
        Self {
            producer,
            writer,
            chunk_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkMeta {
    /// Offset of the record header within the buffer.
    record_off: usize,
    /// True payload length (the record may carry alignment slack beyond it).
    payload_len: usize,
    num_fragments: u16,
    num_fragments_read: u16,
    /// Offset into the payload of the next unread fragment header.
    cur_fragment_offset: usize,
    flags: u8,
}

impl ChunkMeta {
    fn fully_read(&self) -> bool {
        self.num_fragments_read >= self.num_fragments
    }
}

/// Position of the reader: the chunk currently being consumed.
#[derive(Debug, Clone, Copy)]
struct ReadPos {
    producer: ProducerId,
    writer: WriterId,
    chunk_id: ChunkId,
}

/// One reassembled packet as non-owning slices into the buffer.
///
/// Valid until the next mutation of the buffer.
#[derive(Debug)]
pub struct PacketSlices<'a> {
    pub slices: Vec<&'a [u8]>,
}

impl PacketSlices<'_> {
    pub fn len(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_packet(&self) -> TracePacket {
        TracePacket::from_slices(self.slices.iter().copied())
    }
}

enum ReadAhead {
    /// Packet fully stitched; ranges are (offset, len) pairs into the buffer.
    Complete(Vec<(usize, usize)>),
    /// A successor chunk has not arrived yet; revisit on a later read pass.
    WaitForMissingChunk,
    /// The chain was structurally broken and has been consumed as data loss.
    ChainBroken,
}

pub struct LogBuffer {
    buf: Box<[u8]>,
    wptr: usize,
    index: BTreeMap<ChunkKey, ChunkMeta>,
    /// Latest (wrap-aware) chunk id committed per writer sequence. Resolves
    /// the wrap point when iterating a sequence for reading.
    last_chunk_id_written: HashMap<(ProducerId, WriterId), ChunkId>,
    read_pos: Option<ReadPos>,
    fill_policy: FillPolicy,
    /// Latched when a Discard-policy buffer would have wrapped.
    discard_writes: bool,
    stats: BufferStats,
    suppress_sanity_checks: bool,
}

impl LogBuffer {
    pub fn new(size: usize, fill_policy: FillPolicy) -> Result<Self, LogBufferError> {
        if size < RECORD_HEADER_SIZE || size % RECORD_ALIGNMENT != 0 {
            return Err(LogBufferError::InvalidSize(size));
        }
        Ok(Self {
            buf: vec![0u8; size].into_boxed_slice(),
            wptr: 0,
            index: BTreeMap::new(),
            last_chunk_id_written: HashMap::new(),
            read_pos: None,
            fill_policy,
            discard_writes: false,
            stats: BufferStats::default(),
            suppress_sanity_checks: false,
        })
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes between the write pointer and the end of the buffer.
    pub fn size_to_end(&self) -> usize {
        self.buf.len() - self.wptr
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Lets malicious-input tests reach the hardened paths that the
    /// debug-build sanity checks would otherwise trip first.
    pub fn set_suppress_sanity_checks_for_testing(&mut self, suppress: bool) {
        self.suppress_sanity_checks = suppress;
    }

    // -------------------------------------------------------------------
    // Write path
    // -------------------------------------------------------------------

    /// Appends a committed chunk, evicting whatever its bytes displace.
    ///
    /// Returns the record size written, 0 if the chunk was refused.
    pub fn copy_chunk_in(
        &mut self,
        producer: ProducerId,
        writer: WriterId,
        chunk_id: ChunkId,
        flags: u8,
        num_packets: u16,
        payload: &[u8],
    ) -> usize {
        let flags = flags & PRODUCER_FLAGS;
        let record_size = align_up(RECORD_HEADER_SIZE + payload.len());
        if record_size > self.buf.len() {
            tracing::warn!(
                producer,
                writer,
                chunk_id,
                record_size,
                "chunk larger than the whole buffer, dropping"
            );
            self.stats.chunks_discarded += 1;
            return 0;
        }
        if self.discard_writes {
            self.stats.chunks_discarded += 1;
            return 0;
        }

        if record_size > self.size_to_end() {
            if self.fill_policy == FillPolicy::Discard {
                self.discard_writes = true;
                self.stats.chunks_discarded += 1;
                return 0;
            }
            // Pad the tail and wrap. Everything between here and the end is
            // evicted first, then covered by one padding record.
            let tail = self.size_to_end();
            let cleared = self.delete_next_chunks_for(tail);
            debug_assert_eq!(cleared, tail);
            self.write_padding_record(self.wptr, tail);
            self.stats.padding_bytes_written += tail as u64;
            self.wptr = 0;
        }

        let cleared = self.delete_next_chunks_for(record_size);
        let off = self.wptr;
        self.write_record_header(off, record_size, producer, writer, chunk_id, flags, num_packets);
        let payload_off = off + RECORD_HEADER_SIZE;
        self.buf[payload_off..payload_off + payload.len()].copy_from_slice(payload);
        self.buf[payload_off + payload.len()..off + record_size].fill(0);
        if cleared > record_size {
            // The displaced records extended past the new one; a padding
            // record keeps the byte stream walkable until the next write
            // lands on it.
            self.write_padding_record(off + record_size, cleared - record_size);
            self.stats.padding_bytes_written += (cleared - record_size) as u64;
        }

        let key = ChunkKey::new(producer, writer, chunk_id);
        let meta = ChunkMeta {
            record_off: off,
            payload_len: payload.len(),
            num_fragments: num_packets,
            num_fragments_read: 0,
            cur_fragment_offset: 0,
            flags,
        };
        if let Some(prev) = self.index.insert(key, meta) {
            if !self.suppress_sanity_checks {
                debug_assert!(false, "repeated chunk id within a writer sequence");
            }
            tracing::warn!(producer, writer, chunk_id, "repeated chunk id, newer copy wins");
            self.stats.chunks_rewritten += 1;
            // A reassembly that had consumed part of the replaced record is
            // void; the old record bytes become an unreachable zombie until
            // a later write walks over them.
            if prev.num_fragments_read > 0 {
                self.stats.packets_dropped += 1;
            }
        }
        match self.last_chunk_id_written.entry((producer, writer)) {
            Entry::Occupied(mut e) => {
                if chunk_id_is_newer(chunk_id, *e.get()) {
                    e.insert(chunk_id);
                }
            }
            Entry::Vacant(e) => {
                e.insert(chunk_id);
            }
        }

        self.wptr += record_size;
        if self.wptr >= self.buf.len() {
            self.wptr = 0;
            // An exact fill wraps too; in discard mode anything after the
            // wrap would overwrite unread records.
            if self.fill_policy == FillPolicy::Discard {
                self.discard_writes = true;
            }
        }
        self.stats.chunks_written += 1;
        record_size
    }

    /// Applies a 4-byte out-of-band patch to a committed chunk payload.
    ///
    /// Returns false (and has no effect) if the chunk is not resident or the
    /// patch does not fit inside its payload.
    pub fn try_patch(
        &mut self,
        producer: ProducerId,
        writer: WriterId,
        chunk_id: ChunkId,
        offset: usize,
        patch: [u8; PATCH_LEN],
    ) -> bool {
        let key = ChunkKey::new(producer, writer, chunk_id);
        let Some(meta) = self.index.get(&key) else {
            self.stats.patches_failed += 1;
            return false;
        };
        if offset.saturating_add(PATCH_LEN) > meta.payload_len {
            self.stats.patches_failed += 1;
            return false;
        }
        let dst = meta.record_off + RECORD_HEADER_SIZE + offset;
        self.buf[dst..dst + PATCH_LEN].copy_from_slice(&patch);
        self.stats.patches_succeeded += 1;
        true
    }

    /// Evicts records starting at the write pointer until at least `bytes`
    /// are reclaimed. Returns the reclaimed span, which ends on a record
    /// boundary and may exceed `bytes`.
    fn delete_next_chunks_for(&mut self, bytes: usize) -> usize {
        debug_assert!(self.wptr + bytes <= self.buf.len());
        let target = self.wptr + bytes;
        let mut off = self.wptr;
        while off < target {
            let size = self.record_size_at(off);
            if size == 0 {
                // Never-written territory; claim it as-is.
                return target - self.wptr;
            }
            if size % RECORD_ALIGNMENT != 0 || off + size > self.buf.len() {
                spool_core::sanity::invariant_violation("corrupt record header in log buffer");
            }
            let (key, flags) = self.record_key_at(off);
            if flags & FLAG_PADDING == 0 {
                // Zombie records (replaced by a repeated chunk id) share a
                // key with a live record elsewhere; only remove the index
                // entry if it points at these bytes.
                if self.index.get(&key).is_some_and(|m| m.record_off == off) {
                    self.index.remove(&key);
                    self.stats.chunks_overwritten += 1;
                }
            }
            off += size;
        }
        off - self.wptr
    }

    // -------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------

    /// Positions the reader at the deterministic start: the oldest chunk of
    /// the first writer sequence in index order.
    ///
    /// Per-chunk consumption state is preserved across passes, so packets
    /// already delivered are not re-delivered.
    pub fn begin_read(&mut self) {
        self.read_pos = self.index.keys().next().copied().and_then(|k| {
            self.seq_start(k.producer, k.writer).map(|chunk_id| ReadPos {
                producer: k.producer,
                writer: k.writer,
                chunk_id,
            })
        });
    }

    /// Yields the next complete packet, or `None` when every sequence is
    /// exhausted for this pass.
    pub fn read_next_packet(&mut self) -> Option<PacketSlices<'_>> {
        loop {
            let pos = self.read_pos?;
            let key = ChunkKey::new(pos.producer, pos.writer, pos.chunk_id);
            let Some(meta) = self.index.get(&key).copied() else {
                // Evicted since we looked; the range queries don't need it.
                self.move_next(pos);
                continue;
            };
            if meta.fully_read() {
                self.move_next(pos);
                continue;
            }

            let first_unread = meta.num_fragments_read == 0;
            let on_last_fragment = meta.num_fragments_read + 1 == meta.num_fragments;

            if first_unread && meta.flags & CHUNK_CONT_FROM_PREV != 0 {
                // Tail of a packet whose head we never stitched: the
                // predecessor chunk was missed. Consume as data loss.
                if self.read_fragment(key).is_some() {
                    self.stats.packets_dropped += 1;
                }
                continue;
            }

            if on_last_fragment && meta.flags & CHUNK_CONT_ON_NEXT != 0 {
                match self.read_ahead(key) {
                    ReadAhead::Complete(ranges) => return Some(self.materialize(ranges)),
                    ReadAhead::WaitForMissingChunk => {
                        self.stats.readaheads_failed += 1;
                        self.move_next_sequence(pos);
                        continue;
                    }
                    ReadAhead::ChainBroken => continue,
                }
            }

            // A fragment fully contained in this chunk.
            match self.read_fragment(key) {
                Some(range) => {
                    self.stats.packets_read += 1;
                    self.stats.bytes_read += range.1 as u64;
                    return Some(self.materialize(vec![range]));
                }
                None => continue, // chunk invalidated, loop sees it fully read
            }
        }
    }

    /// Diagnostic: the order in which a sequence's chunks would be read.
    pub fn sequence_read_order(&self, producer: ProducerId, writer: WriterId) -> Vec<ChunkId> {
        let mut out = Vec::new();
        let mut cur = self.seq_start(producer, writer);
        while let Some(id) = cur {
            out.push(id);
            cur = self.seq_next(producer, writer, id);
        }
        out
    }

    /// Consumes the next fragment of `key`'s chunk. Returns its (offset,
    /// len) range, or `None` if the fragment was malformed, in which case
    /// the whole chunk has been invalidated.
    fn read_fragment(&mut self, key: ChunkKey) -> Option<(usize, usize)> {
        let meta = self.index.get_mut(&key)?;
        let payload_off = meta.record_off + RECORD_HEADER_SIZE;
        let frag_off = meta.cur_fragment_offset;
        let avail = meta.payload_len.saturating_sub(frag_off);
        let data = &self.buf[payload_off + frag_off..payload_off + meta.payload_len];
        match varint::parse_varint(data) {
            Some((len, hdr)) if len > 0 && hdr + len as usize <= avail => {
                meta.cur_fragment_offset += hdr + len as usize;
                meta.num_fragments_read += 1;
                Some((payload_off + frag_off + hdr, len as usize))
            }
            _ => {
                // Zero length, truncated varint, or a length overrunning the
                // record: the producer is lying. Invalidate the chunk.
                meta.num_fragments_read = meta.num_fragments;
                meta.cur_fragment_offset = meta.payload_len;
                self.stats.abi_violations += 1;
                self.stats.packets_dropped += 1;
                tracing::warn!(
                    producer = key.producer,
                    writer = key.writer,
                    chunk_id = key.chunk_id,
                    "malformed packet fragment, invalidating chunk"
                );
                None
            }
        }
    }

    /// Stitches the packet that starts with the last fragment of `start`
    /// across its successor chunks.
    fn read_ahead(&mut self, start: ChunkKey) -> ReadAhead {
        // Walk the chain: each middle chunk must hold exactly one fragment
        // flagged as continuing both ways; the final chunk contributes its
        // first fragment.
        let mut middles = Vec::new();
        let mut expected = next_chunk_id(start.chunk_id);
        let last = loop {
            let key = ChunkKey::new(start.producer, start.writer, expected);
            let Some(meta) = self.index.get(&key) else {
                return ReadAhead::WaitForMissingChunk;
            };
            if meta.num_fragments == 0
                || meta.flags & CHUNK_CONT_FROM_PREV == 0
                || meta.num_fragments_read > 0
            {
                // Empty chunk in the middle, a dropped continuation flag, or
                // a half-consumed successor: the chain is poisoned.
                self.stats.abi_violations += 1;
                self.poison_chain(start, &middles, None);
                return ReadAhead::ChainBroken;
            }
            if meta.num_fragments == 1 && meta.flags & CHUNK_CONT_ON_NEXT != 0 {
                middles.push(key);
                expected = next_chunk_id(expected);
                continue;
            }
            break key;
        };

        let mut ranges = Vec::with_capacity(middles.len() + 2);
        let mut corrupt = false;
        for key in std::iter::once(start).chain(middles.iter().copied()).chain([last]) {
            match self.read_fragment(key) {
                Some(range) => ranges.push(range),
                None => corrupt = true,
            }
        }
        if corrupt {
            self.poison_chain(start, &middles, Some(last));
            return ReadAhead::ChainBroken;
        }
        self.stats.readaheads_succeeded += 1;
        self.stats.packets_read += 1;
        self.stats.bytes_read += ranges.iter().map(|r| r.1 as u64).sum::<u64>();
        ReadAhead::Complete(ranges)
    }

    /// Marks every chunk of a broken chain fully read and counts the loss.
    fn poison_chain(&mut self, start: ChunkKey, middles: &[ChunkKey], last: Option<ChunkKey>) {
        for key in std::iter::once(start).chain(middles.iter().copied()).chain(last) {
            if let Some(meta) = self.index.get_mut(&key) {
                meta.num_fragments_read = meta.num_fragments;
                meta.cur_fragment_offset = meta.payload_len;
            }
        }
        self.stats.packets_dropped += 1;
    }

    fn materialize(&self, ranges: Vec<(usize, usize)>) -> PacketSlices<'_> {
        PacketSlices {
            slices: ranges.into_iter().map(|(off, len)| &self.buf[off..off + len]).collect(),
        }
    }

    // -------------------------------------------------------------------
    // Sequence iteration (wrap-aware)
    // -------------------------------------------------------------------

    /// First chunk of a sequence in read order: the smallest id strictly
    /// after the last one written, wrapping around.
    fn seq_start(&self, producer: ProducerId, writer: WriterId) -> Option<ChunkId> {
        let lo = ChunkKey::new(producer, writer, 0);
        let hi = ChunkKey::new(producer, writer, ChunkId::MAX);
        let Some(&last) = self.last_chunk_id_written.get(&(producer, writer)) else {
            return self.index.range(lo..=hi).next().map(|(k, _)| k.chunk_id);
        };
        if last != ChunkId::MAX {
            let upper = ChunkKey::new(producer, writer, last + 1);
            if let Some((k, _)) = self.index.range(upper..=hi).next() {
                return Some(k.chunk_id);
            }
        }
        self.index
            .range(lo..=ChunkKey::new(producer, writer, last))
            .next()
            .map(|(k, _)| k.chunk_id)
    }

    /// Chunk following `cur` in a sequence's read order, if any.
    fn seq_next(&self, producer: ProducerId, writer: WriterId, cur: ChunkId) -> Option<ChunkId> {
        let last = self
            .last_chunk_id_written
            .get(&(producer, writer))
            .copied()
            .unwrap_or(ChunkId::MAX);
        let hi = ChunkKey::new(producer, writer, ChunkId::MAX);
        let first = |lo: ChunkId, hi_id: ChunkId| -> Option<ChunkId> {
            if lo > hi_id {
                return None;
            }
            self.index
                .range(ChunkKey::new(producer, writer, lo)..=ChunkKey::new(producer, writer, hi_id))
                .next()
                .map(|(k, _)| k.chunk_id)
        };
        let start = last.wrapping_add(1);
        if start == 0 {
            // The sequence does not wrap: plain ascending order.
            if cur == ChunkId::MAX {
                return None;
            }
            return self
                .index
                .range(ChunkKey::new(producer, writer, cur + 1)..=hi)
                .next()
                .map(|(k, _)| k.chunk_id);
        }
        if cur >= start {
            // Upper half (older ids); fall through to the lower half when it
            // runs out.
            if cur < ChunkId::MAX {
                if let Some(id) = first(cur + 1, ChunkId::MAX) {
                    return Some(id);
                }
            }
            return first(0, last);
        }
        if cur >= last {
            return None;
        }
        first(cur + 1, last)
    }

    /// First chunk (in read order) of the sequence after (producer, writer).
    fn next_sequence(&self, producer: ProducerId, writer: WriterId) -> Option<ReadPos> {
        let after = ChunkKey::new(producer, writer, ChunkId::MAX);
        let (&key, _) = self
            .index
            .range((Bound::Excluded(after), Bound::Unbounded))
            .next()?;
        self.seq_start(key.producer, key.writer).map(|chunk_id| ReadPos {
            producer: key.producer,
            writer: key.writer,
            chunk_id,
        })
    }

    fn move_next(&mut self, pos: ReadPos) {
        self.read_pos = match self.seq_next(pos.producer, pos.writer, pos.chunk_id) {
            Some(chunk_id) => Some(ReadPos { chunk_id, ..pos }),
            None => self.next_sequence(pos.producer, pos.writer),
        };
    }

    fn move_next_sequence(&mut self, pos: ReadPos) {
        self.read_pos = self.next_sequence(pos.producer, pos.writer);
    }

    // -------------------------------------------------------------------
    // Record serialization
    // -------------------------------------------------------------------

    fn record_size_at(&self, off: usize) -> usize {
        u32::from_le_bytes(self.buf[off..off + 4].try_into().unwrap()) as usize
    }

    fn record_key_at(&self, off: usize) -> (ChunkKey, u8) {
        let producer = u16::from_le_bytes(self.buf[off + 4..off + 6].try_into().unwrap());
        let writer = u16::from_le_bytes(self.buf[off + 6..off + 8].try_into().unwrap());
        let chunk_id = u32::from_le_bytes(self.buf[off + 8..off + 12].try_into().unwrap());
        let flags = self.buf[off + 12];
        (ChunkKey::new(producer, writer, chunk_id), flags)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_record_header(
        &mut self,
        off: usize,
        size: usize,
        producer: ProducerId,
        writer: WriterId,
        chunk_id: ChunkId,
        flags: u8,
        num_packets: u16,
    ) {
        self.buf[off..off + 4].copy_from_slice(&(size as u32).to_le_bytes());
        self.buf[off + 4..off + 6].copy_from_slice(&producer.to_le_bytes());
        self.buf[off + 6..off + 8].copy_from_slice(&writer.to_le_bytes());
        self.buf[off + 8..off + 12].copy_from_slice(&chunk_id.to_le_bytes());
        self.buf[off + 12] = flags;
        self.buf[off + 13] = 0;
        self.buf[off + 14..off + 16].copy_from_slice(&num_packets.to_le_bytes());
    }

    fn write_padding_record(&mut self, off: usize, size: usize) {
        debug_assert!(size >= RECORD_HEADER_SIZE && size % RECORD_ALIGNMENT == 0);
        self.write_record_header(off, size, 0, 0, 0, FLAG_PADDING, 0);
    }
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("size", &self.buf.len())
            .field("wptr", &self.wptr)
            .field("live_chunks", &self.index.len())
            .field("fill_policy", &self.fill_policy)
            .field("discard_writes", &self.discard_writes)
            .field("stats", &self.stats)
            .finish()
    }
}

fn align_up(n: usize) -> usize {
    (n + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}
