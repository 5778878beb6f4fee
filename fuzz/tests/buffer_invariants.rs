//! Bolero driver for the log-buffer record arithmetic.
//!
//! Properties checked (after every op, via the model's invariant pass):
//! - records and padding tile the written region exactly
//! - no record straddles the wrap point
//! - exactly one index entry per live record
//! - the real LogBuffer agrees with the model on every observable

use bolero::check;
use spool_fuzz::buffer_model::{execute_and_verify, AppendOp};

fn main() {
    check!()
        .with_type::<(u16, Vec<(u8, u8, u16, u16)>)>()
        .for_each(|(buffer_size, raw_ops)| {
            let ops: Vec<AppendOp> = raw_ops
                .iter()
                .map(|&(producer, writer, chunk_id, payload_len)| AppendOp {
                    producer,
                    writer,
                    chunk_id,
                    payload_len,
                })
                .collect();
            if let Err(msg) = execute_and_verify(usize::from(*buffer_size), &ops) {
                panic!("buffer invariant violated: {msg}");
            }
        });
}
