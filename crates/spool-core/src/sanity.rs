//! Internal invariant checks.
//!
//! Producer input must never be able to trip these: anything reachable from
//! untrusted bytes is handled by the drop-and-count paths. These fire only
//! for service-internal bugs.

/// Reports a broken internal invariant and panics.
///
/// Callers that need to exercise downstream hardening paths in tests guard
/// their call sites with a suppression flag instead of calling this.
#[track_caller]
pub fn invariant_violation(what: &str) -> ! {
    tracing::error!(target: "spool", "internal invariant violated: {what}");
    panic!("internal invariant violated: {what}");
}
