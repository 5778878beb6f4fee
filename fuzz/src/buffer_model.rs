//! In-memory model of the log buffer's record arithmetic.
//!
//! Models only the write path (append, tail padding, eviction, gap
//! padding) — the part with the sharp invariants:
//!
//! - records and padding tile the written region exactly, 16-aligned;
//! - no record straddles the wrap point;
//! - the index holds exactly one entry per live chunk record;
//! - `size_to_end` is always `size - wptr`.
//!
//! `execute_and_verify` replays the same ops against a real `LogBuffer`
//! and cross-checks the returned record sizes and `size_to_end`.

use std::collections::BTreeMap;

use spool_core::FillPolicy;
use spool_service::{LogBuffer, RECORD_ALIGNMENT, RECORD_HEADER_SIZE};

/// Smallest buffer worth fuzzing.
pub const MIN_BUFFER_SIZE: usize = 256;
/// Keep buffers small so wrap cases show up quickly.
pub const MAX_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModelRecord {
    size: usize,
    /// `None` for padding records.
    key: Option<(u16, u16, u32)>,
}

/// Pure model: a list of records tiling the buffer, by offset.
pub struct BufferModel {
    size: usize,
    wptr: usize,
    /// offset → record. Tiles `[0, high_water)`.
    records: BTreeMap<usize, ModelRecord>,
    /// Bytes ever covered by records (grows to `size`, then stays).
    high_water: usize,
    index: BTreeMap<(u16, u16, u32), usize>,
}

impl BufferModel {
    pub fn new(size: usize) -> Self {
        assert!(size >= RECORD_HEADER_SIZE && size % RECORD_ALIGNMENT == 0);
        Self {
            size,
            wptr: 0,
            records: BTreeMap::new(),
            high_water: 0,
            index: BTreeMap::new(),
        }
    }

    pub fn size_to_end(&self) -> usize {
        self.size - self.wptr
    }

    /// Mirrors `LogBuffer::copy_chunk_in` for a Ring-policy buffer.
    /// Returns the record size, 0 if refused.
    pub fn append(&mut self, producer: u16, writer: u16, chunk_id: u32, payload_len: usize) -> usize {
        let record_size = align_up(RECORD_HEADER_SIZE + payload_len);
        if record_size > self.size {
            return 0;
        }
        if record_size > self.size_to_end() {
            let tail = self.size_to_end();
            let cleared = self.clear_from(self.wptr, tail);
            assert_eq!(cleared, tail, "records never straddle the end");
            self.put_record(self.wptr, tail, None);
            self.wptr = 0;
        }
        let cleared = self.clear_from(self.wptr, record_size);
        self.put_record(self.wptr, record_size, Some((producer, writer, chunk_id)));
        if cleared > record_size {
            self.put_record(self.wptr + record_size, cleared - record_size, None);
        }
        self.wptr += record_size;
        if self.wptr >= self.size {
            self.wptr = 0;
        }
        record_size
    }

    /// Removes the records overlapping `[start, start+bytes)`; returns the
    /// full span reclaimed (ends on a record boundary, or on the virgin
    /// frontier).
    fn clear_from(&mut self, start: usize, bytes: usize) -> usize {
        let target = start + bytes;
        let mut off = start;
        while off < target && off < self.high_water {
            let record = self.records.remove(&off).unwrap_or_else(|| {
                panic!("record walk landed mid-record at {off} (start {start})")
            });
            if let Some(key) = record.key {
                let removed = self.index.remove(&key);
                assert_eq!(removed, Some(off), "index entry must point at the record");
            }
            off += record.size;
            if off > self.high_water {
                panic!("record at {} overruns the written region", off - record.size);
            }
        }
        let end = off.max(target);
        self.high_water = self.high_water.max(end);
        end - start
    }

    fn put_record(&mut self, off: usize, size: usize, key: Option<(u16, u16, u32)>) {
        assert!(off + size <= self.size, "record would straddle the wrap point");
        assert_eq!(size % RECORD_ALIGNMENT, 0);
        if let Some(key) = key {
            if let Some(prev_off) = self.index.insert(key, off) {
                // Repeated chunk id: the older record becomes a zombie — it
                // stays in the tiling but drops out of the index.
                if let Some(prev) = self.records.get_mut(&prev_off) {
                    prev.key = None;
                }
            }
        }
        self.records.insert(off, ModelRecord { size, key });
    }

    pub fn verify_invariants(&self) -> Result<(), String> {
        // Records tile [0, high_water) with no gaps or overlaps.
        let mut expected_off = 0;
        for (&off, record) in &self.records {
            if off != expected_off {
                return Err(format!("gap or overlap: record at {off}, expected {expected_off}"));
            }
            if off + record.size > self.size {
                return Err(format!("record at {off} straddles the end"));
            }
            expected_off = off + record.size;
        }
        if expected_off != self.high_water {
            return Err(format!(
                "tiling ends at {expected_off}, high water is {}",
                self.high_water
            ));
        }
        // Once wrapped, the whole buffer stays covered.
        if self.high_water == self.size && expected_off != self.size {
            return Err("wrapped buffer no longer fully covered".into());
        }
        // Index ↔ records agreement.
        for (key, &off) in &self.index {
            match self.records.get(&off) {
                Some(record) if record.key == Some(*key) => {}
                _ => return Err(format!("index entry {key:?} points at a non-matching record")),
            }
        }
        let live = self.records.values().filter(|r| r.key.is_some()).count();
        if live != self.index.len() {
            return Err(format!(
                "{} live records but {} index entries",
                live,
                self.index.len()
            ));
        }
        Ok(())
    }
}

fn align_up(n: usize) -> usize {
    (n + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

/// One fuzzed append.
#[derive(Debug, Clone, Copy)]
pub struct AppendOp {
    pub producer: u8,
    pub writer: u8,
    pub chunk_id: u16,
    pub payload_len: u16,
}

/// Replays `ops` against the model and a real buffer, checking invariants
/// and cross-checking observable behavior after every op.
pub fn execute_and_verify(buffer_size: usize, ops: &[AppendOp]) -> Result<(), String> {
    let buffer_size = buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE) & !(RECORD_ALIGNMENT - 1);
    let mut model = BufferModel::new(buffer_size);
    let mut real = LogBuffer::new(buffer_size, FillPolicy::Ring)
        .map_err(|e| format!("buffer creation failed: {e}"))?;
    real.set_suppress_sanity_checks_for_testing(true);

    for (i, op) in ops.iter().enumerate() {
        let producer = u16::from(op.producer % 4) + 1;
        let writer = u16::from(op.writer % 4) + 1;
        let chunk_id = u32::from(op.chunk_id % 64);
        let payload_len = usize::from(op.payload_len) % (buffer_size / 2);

        let expected = model.append(producer, writer, chunk_id, payload_len);
        let payload = vec![0u8; payload_len];
        let got = real.copy_chunk_in(producer, writer, chunk_id, 0, 0, &payload);
        if got != expected {
            return Err(format!("op {i}: model wrote {expected}, buffer wrote {got}"));
        }
        if real.size_to_end() != model.size_to_end() {
            return Err(format!(
                "op {i}: size_to_end diverged: model {}, buffer {}",
                model.size_to_end(),
                real.size_to_end()
            ));
        }
        model.verify_invariants().map_err(|e| format!("op {i}: {e}"))?;
    }
    Ok(())
}
