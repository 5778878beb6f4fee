//! Packet framing over the arbiter.
//!
//! A `TraceWriter` owns one writer sequence: it acquires chunks, numbers
//! them, and frames length-prefixed packets into them. Every fragment
//! starts with a reserved fixed-width varint header that is back-patched
//! once the fragment's size is known; nested records reserve the same kind
//! of header, and when a nested record closes after its header's chunk has
//! already been committed, the fix-up travels to the service as an
//! out-of-band patch.

use std::sync::Arc;
use std::time::Duration;

use spool_core::ids::{next_chunk_id, BufferId, ChunkId, WriterId};
use spool_core::varint::{write_redundant_varint, MAX_REDUNDANT_VARINT, REDUNDANT_VARINT_LEN};
use spool_shm::{
    Chunk, ChunkHeader, PatchRequest, CHUNK_CONT_FROM_PREV, CHUNK_CONT_ON_NEXT,
};

use crate::arbiter::{SharedMemoryArbiter, Stall};

/// What a writer does when no chunk is free for its target buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPolicy {
    /// Block the writer thread until the service frees a chunk.
    Block,
    /// Drop the packet and keep going.
    Drop,
}

/// Preferred chunk payload capacity requested from the arbiter.
const CHUNK_PAYLOAD_HINT: usize = 512;

/// Smallest fragment worth opening: the reserved header plus some content.
const MIN_FRAGMENT_SPACE: usize = REDUNDANT_VARINT_LEN + 4;

/// Re-check period while blocked on a stall.
const STALL_RETRY: Duration = Duration::from_millis(100);

/// Redundant varint encoding of zero: what a reserved, not-yet-patched
/// header reads as. The service treats a zero length as invalid, so a
/// crashed writer's half-finished packet can never be mistaken for data.
const PLACEHOLDER_HEADER: [u8; REDUNDANT_VARINT_LEN] = [0x80, 0x80, 0x80, 0x00];

struct CurChunk {
    chunk: Chunk,
    id: ChunkId,
    /// Bytes of payload filled so far (headers included).
    used: usize,
    packet_count: u16,
    flags: u8,
}

struct NestedSite {
    chunk_id: ChunkId,
    /// Offset of the reserved header within that chunk's payload.
    offset: usize,
    /// Logical stream position just past the header.
    logical_after_header: u64,
}

struct PacketState {
    /// Offset of the current fragment's reserved header in the current
    /// chunk's payload.
    frag_header_off: usize,
    /// False once at least one fragment of this packet has been committed.
    first_fragment: bool,
    /// Content bytes written for this packet, across all fragments.
    logical_pos: u64,
    nested: Vec<NestedSite>,
    dropped: bool,
}

pub struct TraceWriter {
    arbiter: Arc<SharedMemoryArbiter>,
    writer_id: WriterId,
    target_buffer: BufferId,
    policy: StallPolicy,
    cur: Option<CurChunk>,
    next_chunk_id: ChunkId,
    packet: Option<PacketState>,
    packets_dropped: u64,
}

impl TraceWriter {
    pub(crate) fn new(
        arbiter: Arc<SharedMemoryArbiter>,
        writer_id: WriterId,
        target_buffer: BufferId,
        policy: StallPolicy,
    ) -> Self {
        Self {
            arbiter,
            writer_id,
            target_buffer,
            policy,
            cur: None,
            next_chunk_id: 0,
            packet: None,
            packets_dropped: 0,
        }
    }

    pub fn writer_id(&self) -> WriterId {
        self.writer_id
    }

    /// Packets dropped by this writer under the Drop stall policy (or after
    /// a stall mid-fragmentation).
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    /// Starts a packet. Bytes written through the handle are framed into
    /// the current chunk, fragmenting transparently; dropping the handle
    /// finalizes the packet's length prefix.
    pub fn new_trace_packet(&mut self) -> PacketHandle<'_> {
        debug_assert!(self.packet.is_none(), "previous packet handle leaked");
        self.packet = Some(PacketState {
            frag_header_off: 0,
            first_fragment: true,
            logical_pos: 0,
            nested: Vec::new(),
            dropped: false,
        });
        if !self.ensure_fragment_open() {
            self.packets_dropped += 1;
            if let Some(packet) = self.packet.as_mut() {
                packet.dropped = true;
            }
        }
        PacketHandle { writer: self }
    }

    /// Commits the current chunk (even half-empty) and pushes the pending
    /// commit batch to the service. Called on data-source flush.
    pub fn flush(&mut self) {
        debug_assert!(self.packet.is_none(), "flush with an open packet");
        self.commit_current_chunk(false);
        self.arbiter.flush_pending_commits();
    }

    // -- internals ------------------------------------------------------

    fn write_bytes(&mut self, mut data: &[u8]) {
        if self.packet.as_ref().map_or(true, |p| p.dropped) {
            return;
        }
        while !data.is_empty() {
            let avail = {
                let cur = self.cur.as_ref().expect("open packet has a chunk");
                cur.chunk.payload_len() - cur.used
            };
            if avail == 0 {
                if !self.fragment() {
                    return;
                }
                continue;
            }
            let n = avail.min(data.len());
            {
                let cur = self.cur.as_mut().expect("open packet has a chunk");
                // SAFETY: the chunk is held in BeingWritten and this writer
                // is its only owner.
                unsafe {
                    cur.chunk.payload_mut()[cur.used..cur.used + n].copy_from_slice(&data[..n]);
                }
                cur.used += n;
            }
            if let Some(packet) = self.packet.as_mut() {
                packet.logical_pos += n as u64;
            }
            data = &data[n..];
        }
    }

    /// Opens a length-prefixed sub-record inside the current packet.
    fn begin_nested(&mut self) {
        if self.packet.as_ref().map_or(true, |p| p.dropped) {
            return;
        }
        // The 4-byte prefix must not split across chunks.
        loop {
            let avail = {
                let cur = self.cur.as_ref().expect("open packet has a chunk");
                cur.chunk.payload_len() - cur.used
            };
            if avail >= REDUNDANT_VARINT_LEN {
                break;
            }
            if !self.fragment() {
                return;
            }
        }
        let (chunk_id, offset) = {
            let cur = self.cur.as_mut().expect("open packet has a chunk");
            let off = cur.used;
            // SAFETY: as in write_bytes.
            unsafe {
                cur.chunk.payload_mut()[off..off + REDUNDANT_VARINT_LEN]
                    .copy_from_slice(&PLACEHOLDER_HEADER);
            }
            cur.used += REDUNDANT_VARINT_LEN;
            (cur.id, off)
        };
        let packet = self.packet.as_mut().expect("checked above");
        packet.logical_pos += REDUNDANT_VARINT_LEN as u64;
        packet.nested.push(NestedSite {
            chunk_id,
            offset,
            logical_after_header: packet.logical_pos,
        });
    }

    /// Closes the innermost nested record, finalizing its length prefix in
    /// place when its chunk is still owned, or through the arbiter's patch
    /// queue when it has already been committed.
    fn end_nested(&mut self) {
        let (site, value) = {
            let Some(packet) = self.packet.as_mut() else {
                return;
            };
            let Some(site) = packet.nested.pop() else {
                debug_assert!(false, "end_nested without begin_nested");
                return;
            };
            if packet.dropped {
                return;
            }
            let value = (packet.logical_pos - site.logical_after_header) as u64;
            (site, value)
        };
        let mut data = [0u8; REDUNDANT_VARINT_LEN];
        write_redundant_varint(value.min(u64::from(MAX_REDUNDANT_VARINT)) as u32, &mut data);
        let in_current_chunk = self.cur.as_ref().is_some_and(|c| c.id == site.chunk_id);
        if in_current_chunk {
            let cur = self.cur.as_mut().expect("just checked");
            // SAFETY: as in write_bytes.
            unsafe {
                cur.chunk.payload_mut()[site.offset..site.offset + REDUNDANT_VARINT_LEN]
                    .copy_from_slice(&data);
            }
        } else {
            self.arbiter.add_patch(PatchRequest {
                writer_id: self.writer_id,
                chunk_id: site.chunk_id,
                target_buffer: self.target_buffer,
                offset: site.offset,
                data,
            });
        }
    }

    fn finish_packet(&mut self) {
        let Some(packet) = self.packet.take() else {
            return;
        };
        if packet.dropped {
            return;
        }
        debug_assert!(packet.nested.is_empty(), "packet closed with open nested records");
        let Some(cur) = self.cur.as_mut() else {
            return;
        };
        let content = cur.used - packet.frag_header_off - REDUNDANT_VARINT_LEN;
        if content == 0 {
            // Nothing was written: un-reserve the header rather than emit an
            // (illegal) zero-length packet.
            debug_assert!(packet.first_fragment);
            cur.used = packet.frag_header_off;
            return;
        }
        write_fragment_header(cur, packet.frag_header_off);
    }

    /// Closes the current fragment, commits its chunk with the continuation
    /// flag, and opens the next fragment in a fresh chunk.
    fn fragment(&mut self) -> bool {
        {
            let packet = self.packet.as_ref().expect("fragmenting an open packet");
            let cur = self.cur.as_mut().expect("open packet has a chunk");
            debug_assert!(cur.used > packet.frag_header_off + REDUNDANT_VARINT_LEN);
            write_fragment_header(cur, packet.frag_header_off);
        }
        if let Some(packet) = self.packet.as_mut() {
            packet.first_fragment = false;
        }
        self.commit_current_chunk(true);

        match self.acquire_chunk() {
            Some(mut cur) => {
                cur.flags |= CHUNK_CONT_FROM_PREV;
                let off = cur.used;
                // SAFETY: as in write_bytes.
                unsafe {
                    cur.chunk.payload_mut()[off..off + REDUNDANT_VARINT_LEN]
                        .copy_from_slice(&PLACEHOLDER_HEADER);
                }
                cur.used += REDUNDANT_VARINT_LEN;
                self.cur = Some(cur);
                if let Some(packet) = self.packet.as_mut() {
                    packet.frag_header_off = off;
                }
                true
            }
            None => {
                // The committed fragment promised a continuation that will
                // never come; the service counts the loss when it reads.
                if let Some(packet) = self.packet.as_mut() {
                    packet.dropped = true;
                }
                self.packets_dropped += 1;
                false
            }
        }
    }

    /// Makes sure a chunk with room for a new fragment is open and reserves
    /// the fragment header. Returns false if acquisition failed.
    fn ensure_fragment_open(&mut self) -> bool {
        loop {
            if self.cur.is_none() {
                match self.acquire_chunk() {
                    Some(cur) => self.cur = Some(cur),
                    None => return false,
                }
            }
            let too_full = {
                let cur = self.cur.as_ref().expect("just ensured");
                cur.chunk.payload_len() - cur.used < MIN_FRAGMENT_SPACE
            };
            if too_full {
                self.commit_current_chunk(false);
                continue;
            }
            let off = {
                let cur = self.cur.as_mut().expect("just ensured");
                let off = cur.used;
                // SAFETY: as in write_bytes.
                unsafe {
                    cur.chunk.payload_mut()[off..off + REDUNDANT_VARINT_LEN]
                        .copy_from_slice(&PLACEHOLDER_HEADER);
                }
                cur.used += REDUNDANT_VARINT_LEN;
                off
            };
            if let Some(packet) = self.packet.as_mut() {
                packet.frag_header_off = off;
            }
            return true;
        }
    }

    fn acquire_chunk(&mut self) -> Option<CurChunk> {
        loop {
            let epoch = self.arbiter.doorbell_epoch();
            match self.arbiter.get_new_chunk(CHUNK_PAYLOAD_HINT) {
                Ok(chunk) => {
                    let id = self.next_chunk_id;
                    self.next_chunk_id = next_chunk_id(id);
                    return Some(CurChunk {
                        chunk,
                        id,
                        used: 0,
                        packet_count: 0,
                        flags: 0,
                    });
                }
                Err(Stall) => match self.policy {
                    StallPolicy::Drop => {
                        tracing::warn!(writer_id = self.writer_id, "no free chunk, dropping packet");
                        return None;
                    }
                    StallPolicy::Block => {
                        // Push our own committed chunks out first, or the
                        // service may have nothing to free.
                        self.arbiter.flush_pending_commits();
                        self.arbiter.wait_for_chunk_release(epoch, STALL_RETRY);
                    }
                },
            }
        }
    }

    fn commit_current_chunk(&mut self, continues_on_next: bool) {
        let Some(mut cur) = self.cur.take() else {
            return;
        };
        if continues_on_next {
            cur.flags |= CHUNK_CONT_ON_NEXT;
        }
        let mut header = ChunkHeader::new(self.writer_id, self.target_buffer, cur.id);
        header.packet_count = cur.packet_count;
        header.flags = cur.flags;
        self.arbiter.release_chunk(&cur.chunk, header);
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        self.finish_packet();
        self.commit_current_chunk(false);
        self.arbiter.flush_pending_commits();
    }
}

fn write_fragment_header(cur: &mut CurChunk, off: usize) {
    let content = cur.used - off - REDUNDANT_VARINT_LEN;
    let mut header = [0u8; REDUNDANT_VARINT_LEN];
    write_redundant_varint(content as u32, &mut header);
    // SAFETY: the chunk is held in BeingWritten by this writer.
    unsafe {
        cur.chunk.payload_mut()[off..off + REDUNDANT_VARINT_LEN].copy_from_slice(&header);
    }
    cur.packet_count += 1;
}

/// Scoped writer for one packet. Dropping it finalizes the packet.
pub struct PacketHandle<'a> {
    writer: &'a mut TraceWriter,
}

impl PacketHandle<'_> {
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.writer.write_bytes(data);
    }

    /// Opens a length-prefixed sub-record; close it with [`end_nested`].
    ///
    /// [`end_nested`]: Self::end_nested
    pub fn begin_nested(&mut self) {
        self.writer.begin_nested();
    }

    pub fn end_nested(&mut self) {
        self.writer.end_nested();
    }

    /// True if this packet is being discarded due to a stall.
    pub fn is_dropped(&self) -> bool {
        self.writer.packet.as_ref().map_or(false, |p| p.dropped)
    }
}

impl Drop for PacketHandle<'_> {
    fn drop(&mut self) {
        self.writer.finish_packet();
    }
}
