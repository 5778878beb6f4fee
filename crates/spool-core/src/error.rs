//! Error types reported across the service boundary.

use thiserror::Error;

/// Errors surfaced to producers and consumers by the tracing service.
///
/// Producer-originated data corruption is deliberately *not* here: malformed
/// chunks and packets are dropped and counted, never propagated as errors
/// (see the stats counters).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid trace config: {0}")]
    InvalidConfig(&'static str),

    #[error("no tracing session for this consumer")]
    NoSuchSession,

    #[error("unknown producer")]
    NoSuchProducer,

    #[error("unknown consumer")]
    NoSuchConsumer,

    #[error("operation not valid in the current session state: {0}")]
    InvalidState(&'static str),

    #[error("endpoint transport failure: {0}")]
    Transport(String),
}
