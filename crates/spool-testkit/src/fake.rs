//! Fake chunks and packets.
//!
//! A fake packet of total size N is a varint length header (1 or 2 bytes)
//! followed by a content pattern of the form `a00-a01-a02-…` truncated to
//! fit, where `a` is the caller's seed. The pattern makes corruption and
//! mis-stitching show up as readable garbage in assertion failures.

use spool_core::ids::{ChunkId, ProducerId, WriterId};
use spool_core::varint::encode_varint;
use spool_service::LogBuffer;

/// Content pattern used by fake packets: `s00-s01-…` truncated to `len`.
fn pattern(len: usize, seed: char) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut group = 0usize;
    while out.len() < len {
        let piece = format!("{}{:02}-", seed, group % 100);
        for &byte in piece.as_bytes() {
            if out.len() < len {
                out.push(byte);
            }
        }
        group += 1;
    }
    out
}

fn content_len_for(size: usize) -> usize {
    assert!(size >= 2, "a fake packet needs a header and content");
    let content_len = size - 1;
    if content_len > 127 {
        // Two-byte varint header.
        size - 2
    } else {
        content_len
    }
}

/// The full on-wire bytes (header + content) of a fake packet of `size`.
pub fn fake_packet_bytes(size: usize, seed: char) -> Vec<u8> {
    let content_len = content_len_for(size);
    let mut out = Vec::with_capacity(size);
    encode_varint(content_len as u64, &mut out);
    out.extend(pattern(content_len, seed));
    assert_eq!(out.len(), size, "size {size} is not representable as a fake packet");
    out
}

/// Expected content of one packet fragment; compares against read slices.
#[derive(Clone, PartialEq, Eq)]
pub struct FakePacketFragment(Vec<u8>);

impl FakePacketFragment {
    /// The content a fake packet of total `size` would carry.
    pub fn new(size: usize, seed: char) -> Self {
        Self(pattern(content_len_for(size), seed))
    }

    /// Literal bytes, for patched or hand-crafted expectations.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for FakePacketFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FakePacketFragment({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Reads the next packet out of a log buffer as comparable fragments.
/// An empty vec means the buffer reported no more packets.
pub fn read_packet(buffer: &mut LogBuffer) -> Vec<FakePacketFragment> {
    match buffer.read_next_packet() {
        Some(slices) => slices.slices.iter().map(|s| FakePacketFragment::from_bytes(s)).collect(),
        None => Vec::new(),
    }
}

/// Builder for one chunk's worth of fake packets.
pub struct FakeChunk {
    producer: ProducerId,
    writer: WriterId,
    chunk_id: ChunkId,
    payload: Vec<u8>,
    flags: u8,
    num_packets: u16,
}

impl FakeChunk {
    pub fn new(producer: ProducerId, writer: WriterId, chunk_id: ChunkId) -> Self {
        Self {
            producer,
            writer,
            chunk_id,
            payload: Vec::new(),
            flags: 0,
            num_packets: 0,
        }
    }

    /// Appends a fake packet of total `size` bytes (header included).
    pub fn add_packet(self, size: usize, seed: char) -> Self {
        self.add_packet_with_flags(size, seed, 0)
    }

    /// Appends a fake packet carrying continuation flags. The flags are
    /// recorded at chunk level: pass CONT_FROM_PREV only on the first
    /// packet and CONT_ON_NEXT only on the last, as a real writer would.
    pub fn add_packet_with_flags(mut self, size: usize, seed: char, flags: u8) -> Self {
        self.payload.extend(fake_packet_bytes(size, seed));
        self.flags |= flags;
        self.num_packets += 1;
        self
    }

    /// Zeroes `len` payload bytes at `offset`, e.g. to fabricate a patch
    /// site or a corrupt varint header.
    pub fn clear_bytes(mut self, offset: usize, len: usize) -> Self {
        for byte in &mut self.payload[offset..offset + len] {
            *byte = 0;
        }
        self
    }

    /// Overrides the declared packet count (malicious-producer tests).
    pub fn set_packet_count(mut self, num_packets: u16) -> Self {
        self.num_packets = num_packets;
        self
    }

    /// Copies the chunk into the buffer; returns the record size written.
    pub fn copy_into(&self, buffer: &mut LogBuffer) -> usize {
        buffer.copy_chunk_in(
            self.producer,
            self.writer,
            self.chunk_id,
            self.flags,
            self.num_packets,
            &self.payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_packet_layout_one_byte_header() {
        let bytes = fake_packet_bytes(9, 'b');
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0], 8); // varint(8)
        assert_eq!(&bytes[1..], b"b00-b01-");
    }

    #[test]
    fn fake_packet_layout_two_byte_header() {
        let bytes = fake_packet_bytes(512, 'a');
        assert_eq!(bytes.len(), 512);
        // 510 = 0b11_1111110 -> varint [0xFE, 0x03]
        assert_eq!(&bytes[..2], &[0xFE, 0x03]);
        assert_eq!(&bytes[2..6], b"a00-");
    }

    #[test]
    fn fragment_matches_packet_content() {
        let bytes = fake_packet_bytes(42, 'x');
        assert_eq!(FakePacketFragment::from_bytes(&bytes[1..]), FakePacketFragment::new(42, 'x'));
    }
}
