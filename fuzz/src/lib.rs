//! Property-test models for the spool tracing stack.
//!
//! Each module holds a pure in-memory model of one invariant-heavy
//! component plus an `execute_and_verify` driver that replays an op
//! sequence against both the model and the real implementation, checking
//! invariants after every step.

pub mod buffer_model;
pub mod chunk_state_model;
