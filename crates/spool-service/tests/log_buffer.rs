//! Behavioral tests for the log buffer: write/wrap/padding arithmetic,
//! fragment stitching, out-of-band patching, and hostile producer input.
//!
//! Sizing note: a chunk record is SUM(packets) + 16 (the record header),
//! and records are rounded up to 16. Unless a test exercises the rounding
//! itself, sizes are chosen pre-aligned.

use spool_core::FillPolicy;
use spool_service::LogBuffer;
use spool_shm::{CHUNK_CONT_FROM_PREV, CHUNK_CONT_ON_NEXT};
use spool_testkit::{read_packet, FakeChunk, FakePacketFragment};

fn ring(size: usize) -> LogBuffer {
    LogBuffer::new(size, FillPolicy::Ring).expect("valid size")
}

fn frag(size: usize, seed: char) -> FakePacketFragment {
    FakePacketFragment::new(size, seed)
}

// ----------------------
// Read/write round trips
// ----------------------

#[test]
fn read_write_empty_buffer() {
    let mut buf = ring(4096);
    buf.begin_read();
    assert!(read_packet(&mut buf).is_empty());
}

#[test]
fn read_write_simple() {
    let mut buf = ring(64 * 1024);
    for chunk_id in 0u32..1000 {
        let seed = char::from(b'a' + (chunk_id % 26) as u8);
        FakeChunk::new(1, 1, chunk_id).add_packet(42, seed).copy_into(&mut buf);
        buf.begin_read();
        assert_eq!(read_packet(&mut buf), vec![frag(42, seed)]);
        assert!(read_packet(&mut buf).is_empty());
    }
}

#[test]
fn read_write_one_chunk_per_writer() {
    for num_writers in 1u8..=10 {
        let mut buf = ring(4096);
        for i in 1..=num_writers {
            assert_eq!(
                32,
                FakeChunk::new(u16::from(i), u16::from(i), u32::from(i))
                    .add_packet(32 - 16, char::from(i))
                    .copy_into(&mut buf)
            );
        }
        buf.begin_read();
        for i in 1..=num_writers {
            assert_eq!(read_packet(&mut buf), vec![frag(32 - 16, char::from(i))]);
        }
        assert!(read_packet(&mut buf).is_empty());
    }
}

// Writes chunks that fill the buffer precisely to the end:
// [ c0: 512 ][ c1: 512 ][ c2: 1024 ][ c3: 2048 ]
// | ---------------- 4k buffer --------------- |
#[test]
fn read_write_fill_till_end() {
    let mut buf = ring(4096);
    for _ in 0..3 {
        assert_eq!(512, FakeChunk::new(1, 1, 0).add_packet(512 - 16, 'a').copy_into(&mut buf));
        assert_eq!(512, FakeChunk::new(1, 1, 1).add_packet(512 - 16, 'b').copy_into(&mut buf));
        assert_eq!(1024, FakeChunk::new(1, 1, 2).add_packet(1024 - 16, 'c').copy_into(&mut buf));
        assert_eq!(2048, FakeChunk::new(1, 1, 3).add_packet(2048 - 16, 'd').copy_into(&mut buf));

        // The write pointer wrapped back to the start.
        assert_eq!(4096, buf.size_to_end());

        buf.begin_read();
        assert_eq!(read_packet(&mut buf), vec![frag(512 - 16, 'a')]);
        assert_eq!(read_packet(&mut buf), vec![frag(512 - 16, 'b')]);
        assert_eq!(read_packet(&mut buf), vec![frag(1024 - 16, 'c')]);
        assert_eq!(read_packet(&mut buf), vec![frag(2048 - 16, 'd')]);
        assert!(read_packet(&mut buf).is_empty());
    }
}

// Leaves a 128-byte gap at the end, then appends a chunk that doesn't fit,
// exercising the padding-at-end logic:
// [ c0: 128 ][ c1: 256 ][ c2: 512 ][ c3: 1024 ][ c4: 2048 ]{ 128 pad }
// After c5 (512): [ c5: 512 ][ pad ][ c3: 1024 ][ c4: 2048 ]{ 128 pad }
#[test]
fn read_write_padding_at_end() {
    let mut buf = ring(4096);
    assert_eq!(128, FakeChunk::new(1, 1, 0).add_packet(128 - 16, 'a').copy_into(&mut buf));
    assert_eq!(256, FakeChunk::new(1, 1, 1).add_packet(256 - 16, 'b').copy_into(&mut buf));
    assert_eq!(512, FakeChunk::new(1, 1, 2).add_packet(512 - 16, 'c').copy_into(&mut buf));
    assert_eq!(1024, FakeChunk::new(1, 1, 3).add_packet(1024 - 16, 'd').copy_into(&mut buf));
    assert_eq!(2048, FakeChunk::new(1, 1, 4).add_packet(2048 - 16, 'e').copy_into(&mut buf));

    assert_eq!(128, buf.size_to_end());
    assert_eq!(512, FakeChunk::new(1, 1, 5).add_packet(512 - 16, 'f').copy_into(&mut buf));
    assert_eq!(4096 - 512, buf.size_to_end());

    // c0..c2 went to make room; the read sequence is c3, c4, c5.
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(1024 - 16, 'd')]);
    assert_eq!(read_packet(&mut buf), vec![frag(2048 - 16, 'e')]);
    assert_eq!(read_packet(&mut buf), vec![frag(512 - 16, 'f')]);
    assert!(read_packet(&mut buf).is_empty());
}

// Like the above but the padding introduced is the minimum unit (16 bytes),
// via bare 16-byte chunk records.
#[test]
fn read_write_minimal_padding() {
    let mut buf = ring(4096);
    assert_eq!(2048, FakeChunk::new(1, 1, 0).add_packet(2048 - 16, 'a').copy_into(&mut buf));
    assert_eq!(1024, FakeChunk::new(1, 1, 1).add_packet(1024 - 16, 'b').copy_into(&mut buf));
    assert_eq!(1008, FakeChunk::new(1, 1, 2).add_packet(1008 - 16, 'c').copy_into(&mut buf));
    assert_eq!(16, FakeChunk::new(1, 1, 3).copy_into(&mut buf));

    assert_eq!(4096, buf.size_to_end());

    assert_eq!(2032, FakeChunk::new(1, 1, 4).add_packet(2032 - 16, 'd').copy_into(&mut buf));
    assert_eq!(1040, FakeChunk::new(1, 1, 5).add_packet(1040 - 16, 'e').copy_into(&mut buf));
    assert_eq!(16, FakeChunk::new(1, 1, 6).copy_into(&mut buf));
    assert_eq!(1008, FakeChunk::new(1, 1, 7).add_packet(1008 - 16, 'f').copy_into(&mut buf));

    assert_eq!(4096, buf.size_to_end());

    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(2032 - 16, 'd')]);
    assert_eq!(read_packet(&mut buf), vec![frag(1040 - 16, 'e')]);
    assert_eq!(read_packet(&mut buf), vec![frag(1008 - 16, 'f')]);
    for _ in 0..3 {
        assert!(read_packet(&mut buf).is_empty());
    }
}

#[test]
fn read_write_random_chunks_no_wrapping() {
    for seed in 1u64..=32 {
        let mut rng = seed;
        let mut next = |range: u64| {
            rng = rng.wrapping_mul(48271) % 0x7fff_ffff;
            rng % range
        };
        let mut buf = ring(4096 * (1 + next(32) as usize));
        let mut expected = std::collections::BTreeMap::new();
        let mut chunk_id = 0u32;
        loop {
            let chunk_size = 32 + 16 * next(60) as usize; // 32..=976, pre-aligned
            if chunk_size >= buf.size_to_end() {
                break;
            }
            let producer = 1 + next(8) as u16;
            let writer = 1 + next(8) as u16;
            let c = chunk_id;
            chunk_id += 1;
            let packet_seed = char::from(b'a' + (chunk_size % 26) as u8);
            // A colliding (producer, writer, chunk) triple would be a
            // repeated-chunk-id case, which this test is not about.
            if expected.insert((producer, writer, c), (chunk_size, packet_seed)).is_some() {
                continue;
            }
            assert_eq!(
                chunk_size,
                FakeChunk::new(producer, writer, c)
                    .add_packet(chunk_size - 16, packet_seed)
                    .copy_into(&mut buf)
            );
        }
        buf.begin_read();
        for ((_, _, _), (chunk_size, packet_seed)) in &expected {
            assert_eq!(read_packet(&mut buf), vec![frag(chunk_size - 16, *packet_seed)]);
        }
        assert!(read_packet(&mut buf).is_empty());
    }
}

// Writes a chunk that leaves just 16 bytes at the end of the buffer.
#[test]
fn read_write_wrapping_cases() {
    let mut buf = ring(4096);
    assert_eq!(4080, FakeChunk::new(1, 1, 0).add_packet(4080 - 16, 'a').copy_into(&mut buf));
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(4080 - 16, 'a')]);
    assert!(read_packet(&mut buf).is_empty());

    assert_eq!(16, FakeChunk::new(1, 1, 1).copy_into(&mut buf));
    assert_eq!(2048, FakeChunk::new(1, 1, 2).add_packet(2048 - 16, 'b').copy_into(&mut buf));
    assert_eq!(2048, FakeChunk::new(1, 1, 3).add_packet(2048 - 16, 'c').copy_into(&mut buf));
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(2048 - 16, 'b')]);
    assert_eq!(read_packet(&mut buf), vec![frag(2048 - 16, 'c')]);
    assert!(read_packet(&mut buf).is_empty());
}

// When the tail padding displaces records, they must leave the index:
// [ c0: 2048 ][ c1: 2048 ] → [ c2: 2048 ]{...} → [ c3: 3072 ][ pad ]
#[test]
fn padding_at_end_updates_index() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0).add_packet(2048 - 16, 'a').copy_into(&mut buf);
    FakeChunk::new(1, 1, 1).add_packet(2048 - 16, 'b').copy_into(&mut buf);

    FakeChunk::new(1, 1, 2).add_packet(2048 - 16, 'c').copy_into(&mut buf);
    assert_eq!(2048, buf.size_to_end());

    // 3072 doesn't fit the 2048 left: wrap, evicting c1 via padding and c2
    // via the write itself.
    assert_eq!(3072, FakeChunk::new(1, 1, 3).add_packet(3072 - 16, 'd').copy_into(&mut buf));

    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(3072 - 16, 'd')]);
    assert!(read_packet(&mut buf).is_empty());
}

// Same as above, with chunks that don't align when wrapping.
#[test]
fn padding_at_end_updates_index_misaligned() {
    let mut buf = ring(4096);
    for i in 0u8..8 {
        assert_eq!(
            512,
            FakeChunk::new(1, 1, u32::from(i))
                .add_packet(512 - 16, char::from(b'a' + i))
                .copy_into(&mut buf)
        );
    }
    assert_eq!(2080, FakeChunk::new(1, 1, 8).add_packet(2080 - 16, 'i').copy_into(&mut buf));
    assert_eq!(2016, buf.size_to_end());

    assert_eq!(3104, FakeChunk::new(1, 1, 9).add_packet(3104 - 16, 'j').copy_into(&mut buf));

    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(3104 - 16, 'j')]);
    assert!(read_packet(&mut buf).is_empty());
}

// --------------------------------------
// Fragment stitching and skipping logic
// --------------------------------------

#[test]
fn fragments_simple() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0)
        .add_packet_with_flags(10, 'a', CHUNK_CONT_FROM_PREV)
        .add_packet(20, 'b')
        .add_packet(30, 'c')
        .add_packet_with_flags(10, 'd', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 1)
        .add_packet_with_flags(20, 'e', CHUNK_CONT_FROM_PREV)
        .add_packet(30, 'f')
        .copy_into(&mut buf);

    buf.begin_read();
    // 'a' is a continuation with no predecessor: data loss, skipped.
    assert_eq!(read_packet(&mut buf), vec![frag(20, 'b')]);
    assert_eq!(read_packet(&mut buf), vec![frag(30, 'c')]);
    assert_eq!(read_packet(&mut buf), vec![frag(10, 'd'), frag(20, 'e')]);
    assert_eq!(read_packet(&mut buf), vec![frag(30, 'f')]);
    assert!(read_packet(&mut buf).is_empty());
}

#[test]
fn fragments_edge_cases() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0)
        .add_packet_with_flags(2, 'a', CHUNK_CONT_FROM_PREV)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 1)
        .add_packet_with_flags(2, 'b', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    buf.begin_read();
    assert!(read_packet(&mut buf).is_empty());

    // The missing fragment arrives; the reassembly picks up where it left.
    FakeChunk::new(1, 1, 2)
        .add_packet_with_flags(2, 'c', CHUNK_CONT_FROM_PREV)
        .copy_into(&mut buf);
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(2, 'b'), frag(2, 'c')]);
    assert!(read_packet(&mut buf).is_empty());
}

// Chunks of sequence {1,1} arrive in the order {0, 2, 1}; the stitching
// must realign without disturbing other sequences.
#[test]
fn fragments_out_of_order() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0)
        .add_packet_with_flags(10, 'a', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 2)
        .add_packet_with_flags(30, 'c', CHUNK_CONT_FROM_PREV)
        .copy_into(&mut buf);
    FakeChunk::new(1, 2, 0).add_packet(10, 'd').copy_into(&mut buf);
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(10, 'd')]);
    assert!(read_packet(&mut buf).is_empty());

    FakeChunk::new(1, 1, 1)
        .add_packet_with_flags(20, 'b', CHUNK_CONT_FROM_PREV | CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 3).add_packet(40, 'd').copy_into(&mut buf);
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(10, 'a'), frag(20, 'b'), frag(30, 'c')]);
    assert_eq!(read_packet(&mut buf), vec![frag(40, 'd')]);
    assert!(read_packet(&mut buf).is_empty());
}

#[test]
fn fragments_empty_chunk_before() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0).copy_into(&mut buf);
    FakeChunk::new(1, 1, 1)
        .add_packet(10, 'a')
        .add_packet_with_flags(20, 'b', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 2)
        .add_packet_with_flags(30, 'c', CHUNK_CONT_FROM_PREV)
        .add_packet_with_flags(40, 'd', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(10, 'a')]);
    assert_eq!(read_packet(&mut buf), vec![frag(20, 'b'), frag(30, 'c')]);
    // 'd' waits for chunk 3.
    assert!(read_packet(&mut buf).is_empty());
}

#[test]
fn fragments_empty_chunk_after() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0)
        .add_packet(10, 'a')
        .add_packet_with_flags(10, 'b', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 1).copy_into(&mut buf);
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(10, 'a')]);
    // 'b' promised a continuation; its successor turned out empty, which
    // voids the packet rather than stalling the sequence.
    assert!(read_packet(&mut buf).is_empty());
    assert!(buf.stats().packets_dropped > 0);
}

// An empty chunk in the middle of a fragmented packet voids the packet and
// counts as data loss; reading resumes at the next intact packet.
#[test]
fn fragments_empty_chunk_in_the_middle() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0)
        .add_packet_with_flags(10, 'a', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 1).copy_into(&mut buf);
    FakeChunk::new(1, 1, 2)
        .add_packet_with_flags(10, 'b', CHUNK_CONT_FROM_PREV)
        .add_packet(20, 'c')
        .copy_into(&mut buf);
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(20, 'c')]);
    assert!(read_packet(&mut buf).is_empty());
    assert_eq!(buf.stats().packets_dropped, 2); // 'a' and 'b'
}

// Fragmented packets of increasing chain length [P0, P1a][P1b]…[P1y] must
// always come back as one packet.
#[test]
fn fragments_long_packets() {
    for seq_len in 1u32..=10 {
        let mut buf = ring(4096);
        let mut expected = vec![frag(20, 'b')];
        FakeChunk::new(1, 1, 0)
            .add_packet(10, 'a')
            .add_packet_with_flags(20, 'b', CHUNK_CONT_ON_NEXT)
            .copy_into(&mut buf);
        for i in 1..=seq_len {
            let seed = char::from(b'b' + i as u8);
            expected.push(frag(20 + i as usize, seed));
            FakeChunk::new(1, 1, i)
                .add_packet_with_flags(
                    20 + i as usize,
                    seed,
                    CHUNK_CONT_FROM_PREV | CHUNK_CONT_ON_NEXT,
                )
                .copy_into(&mut buf);
        }
        expected.push(frag(30, 'y'));
        FakeChunk::new(1, 1, seq_len + 1)
            .add_packet_with_flags(30, 'y', CHUNK_CONT_FROM_PREV)
            .add_packet(50, 'z')
            .copy_into(&mut buf);

        buf.begin_read();
        assert_eq!(read_packet(&mut buf), vec![frag(10, 'a')]);
        assert_eq!(read_packet(&mut buf), expected);
        assert_eq!(read_packet(&mut buf), vec![frag(50, 'z')]);
        assert!(read_packet(&mut buf).is_empty());
    }
}

// A packet chain that crosses the ChunkId wrap point.
#[test]
fn fragments_long_packet_with_wrapping_id() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, u32::MAX - 1)
        .add_packet_with_flags(10, 'a', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, u32::MAX)
        .add_packet_with_flags(20, 'b', CHUNK_CONT_FROM_PREV | CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 0)
        .add_packet_with_flags(30, 'c', CHUNK_CONT_FROM_PREV)
        .copy_into(&mut buf);

    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(10, 'a'), frag(20, 'b'), frag(30, 'c')]);
    assert!(read_packet(&mut buf).is_empty());
}

// --------------------------
// Out-of-band patching tests
// --------------------------

#[test]
fn patching_simple() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0).add_packet(100, 'a').copy_into(&mut buf);
    FakeChunk::new(2, 1, 0)
        .add_packet(9, 'b')
        .clear_bytes(5, 4) // payload byte 5 = 4th content byte (byte 0 is the varint header)
        .copy_into(&mut buf);
    FakeChunk::new(3, 1, 0).add_packet(100, 'c').copy_into(&mut buf);
    assert!(buf.try_patch(2, 1, 0, 5, *b"YMCA"));

    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(100, 'a')]);
    assert_eq!(read_packet(&mut buf), vec![FakePacketFragment::from_bytes(b"b00-YMCA")]);
    assert_eq!(read_packet(&mut buf), vec![frag(100, 'c')]);
    assert!(read_packet(&mut buf).is_empty());
}

#[test]
fn patching_skipped_if_chunk_doesnt_exist() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0).add_packet(100, 'a').copy_into(&mut buf);
    assert!(!buf.try_patch(1, 2, 0, 0, *b"XXXX"));
    assert!(!buf.try_patch(1, 1, 1, 0, *b"XXXX"));
    assert!(!buf.try_patch(1, 1, u32::MAX, 0, *b"XXXX"));
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(100, 'a')]);
    assert!(read_packet(&mut buf).is_empty());
}

#[test]
fn patching_at_boundaries_of_chunk() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0)
        .add_packet_with_flags(100, 'a', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 1)
        .add_packet_with_flags(16, 'b', CHUNK_CONT_FROM_PREV | CHUNK_CONT_ON_NEXT)
        .clear_bytes(1, 4)
        .clear_bytes(16 - 4, 4)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 2)
        .add_packet_with_flags(100, 'c', CHUNK_CONT_FROM_PREV)
        .copy_into(&mut buf);
    assert!(buf.try_patch(1, 1, 1, 1, *b"PERF"));
    assert!(buf.try_patch(1, 1, 1, 16 - 4, *b"ETTO"));

    buf.begin_read();
    assert_eq!(
        read_packet(&mut buf),
        vec![
            frag(100, 'a'),
            FakePacketFragment::from_bytes(b"PERFb01-b02ETTO"),
            frag(100, 'c'),
        ]
    );
    assert!(read_packet(&mut buf).is_empty());
}

// ---------------------
// Malicious input tests
// ---------------------

#[test]
fn malicious_repeated_chunk_id() {
    let mut buf = ring(4096);
    buf.set_suppress_sanity_checks_for_testing(true);
    FakeChunk::new(1, 1, 0).add_packet(2048, 'a').copy_into(&mut buf);
    FakeChunk::new(1, 1, 0).add_packet(1024, 'b').copy_into(&mut buf);
    buf.begin_read();
    // The newer copy wins; the older is evicted.
    assert_eq!(read_packet(&mut buf), vec![frag(1024, 'b')]);
    assert!(read_packet(&mut buf).is_empty());
    assert_eq!(buf.stats().chunks_rewritten, 1);
}

#[test]
fn malicious_zero_varint_header() {
    let mut buf = ring(4096);
    buf.set_suppress_sanity_checks_for_testing(true);
    // A chunk whose first packet header is zeroed: the whole chunk dies,
    // including the intact packet behind it.
    FakeChunk::new(1, 1, 0)
        .add_packet(4, 'a')
        .clear_bytes(0, 1)
        .add_packet(4, 'b')
        .copy_into(&mut buf);
    FakeChunk::new(2, 1, 0).add_packet(4, 'c').copy_into(&mut buf);
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(4, 'c')]);
    assert!(read_packet(&mut buf).is_empty());
    assert!(buf.stats().abi_violations > 0);
}

// Zero varint in the middle of an otherwise-valid fragment chain: the whole
// chain is poisoned, and reading continues at the next intact packet.
#[test]
fn malicious_zero_varint_header_in_sequence() {
    let mut buf = ring(4096);
    buf.set_suppress_sanity_checks_for_testing(true);
    FakeChunk::new(1, 1, 0)
        .add_packet_with_flags(4, 'a', CHUNK_CONT_ON_NEXT)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 1)
        .add_packet_with_flags(4, 'b', CHUNK_CONT_FROM_PREV | CHUNK_CONT_ON_NEXT)
        .clear_bytes(0, 1)
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 2)
        .add_packet_with_flags(4, 'c', CHUNK_CONT_FROM_PREV)
        .add_packet(4, 'd')
        .copy_into(&mut buf);
    FakeChunk::new(1, 1, 3).add_packet(4, 'e').copy_into(&mut buf);
    FakeChunk::new(2, 1, 3).add_packet(5, 'f').copy_into(&mut buf);

    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(4, 'e')]);
    assert_eq!(read_packet(&mut buf), vec![frag(5, 'f')]);
    assert!(read_packet(&mut buf).is_empty());
}

#[test]
fn malicious_patch_out_of_bounds() {
    let mut buf = ring(4096);
    FakeChunk::new(1, 1, 0).add_packet(2048, 'a').copy_into(&mut buf);
    FakeChunk::new(1, 1, 1).add_packet(16, 'b').copy_into(&mut buf);
    for offset in [13usize, 16, usize::MAX - 16, usize::MAX - 31, usize::MAX - 1023] {
        assert!(!buf.try_patch(1, 1, 1, offset, *b"0day"));
    }
}

// A chunk declaring more packets than its payload holds: the reader takes
// what parses and invalidates the rest.
#[test]
fn malicious_overstated_packet_count() {
    let mut buf = ring(4096);
    buf.set_suppress_sanity_checks_for_testing(true);
    FakeChunk::new(1, 1, 0)
        .add_packet(8, 'a')
        .set_packet_count(100)
        .copy_into(&mut buf);
    FakeChunk::new(2, 1, 0).add_packet(8, 'b').copy_into(&mut buf);
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(8, 'a')]);
    assert_eq!(read_packet(&mut buf), vec![frag(8, 'b')]);
    assert!(read_packet(&mut buf).is_empty());
    assert!(buf.stats().abi_violations > 0);
}

// -----------------------------
// Sequence read-order (wrap) tests
// -----------------------------

fn append_chunks(buf: &mut LogBuffer, chunks: &[(u16, u16, u32)]) {
    for &(producer, writer, chunk_id) in chunks {
        FakeChunk::new(producer, writer, chunk_id).add_packet(4, 'x').copy_into(buf);
    }
}

#[test]
fn read_order_one_stream_ordered() {
    let mut buf = ring(64 * 1024);
    append_chunks(&mut buf, &[(1, 1, 0), (1, 1, 1), (1, 1, 2), (1, 1, 5), (1, 1, 6), (1, 1, 7)]);
    assert!(buf.sequence_read_order(1, 2).is_empty());
    assert!(buf.sequence_read_order(9, 9).is_empty());
    assert_eq!(buf.sequence_read_order(1, 1), vec![0, 1, 2, 5, 6, 7]);
}

#[test]
fn read_order_one_stream_wrapping() {
    let mut buf = ring(64 * 1024);
    append_chunks(&mut buf, &[(1, 1, 5), (1, 1, 6), (1, 1, 7), (1, 1, 0), (1, 1, 1), (1, 1, 2)]);
    // The last id written is 2, so reading starts past it: at 5.
    assert_eq!(buf.sequence_read_order(1, 1), vec![5, 6, 7, 0, 1, 2]);
}

#[test]
fn read_order_many_streams_ordered() {
    let mut buf = ring(64 * 1024);
    append_chunks(
        &mut buf,
        &[
            (1, 1, 0),
            (1, 1, 1),
            (1, 2, 0),
            (3, 1, 0),
            (1, 2, 3),
            (1, 2, 5),
            (3, 1, 7),
            (1, 1, 6),
            (3, 1, 8),
        ],
    );
    assert_eq!(buf.sequence_read_order(1, 1), vec![0, 1, 6]);
    assert_eq!(buf.sequence_read_order(1, 2), vec![0, 3, 5]);
    assert_eq!(buf.sequence_read_order(3, 1), vec![0, 7, 8]);
}

#[test]
fn read_order_many_streams_wrapping() {
    let mut buf = ring(64 * 1024);
    let neg = |x: i64| (i64::from(u32::MAX) + x) as u32; // ids near the wrap point
    append_chunks(
        &mut buf,
        &[
            (1, 1, neg(-4)),
            (1, 1, neg(-3)),
            (1, 2, neg(-2)),
            (3, 1, neg(-1)),
            (1, 2, 0),
            (1, 2, 1),
            (3, 1, 2),
            (1, 1, 3),
            (3, 1, 4),
        ],
    );
    assert_eq!(buf.sequence_read_order(1, 1), vec![neg(-4), neg(-3), 3]);
    assert_eq!(buf.sequence_read_order(1, 2), vec![neg(-2), 0, 1]);
    assert_eq!(buf.sequence_read_order(3, 1), vec![neg(-1), 2, 4]);
}

// -----------------------------
// Stats
// -----------------------------

#[test]
fn stats_account_for_writes_and_evictions() {
    let mut buf = ring(4096);
    for i in 0u32..4 {
        FakeChunk::new(1, 1, i).add_packet(2048 - 16, 'a').copy_into(&mut buf);
    }
    let stats = buf.stats();
    assert_eq!(stats.chunks_written, 4);
    assert_eq!(stats.chunks_overwritten, 2); // c0 and c1 displaced
    buf.begin_read();
    assert_eq!(read_packet(&mut buf), vec![frag(2048 - 16, 'a')]);
    assert_eq!(read_packet(&mut buf), vec![frag(2048 - 16, 'a')]);
    assert!(read_packet(&mut buf).is_empty());
    assert_eq!(buf.stats().packets_read, 2);
}
