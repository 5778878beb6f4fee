//! Resource-limit watchdog.
//!
//! Guards against the service wedging: a caller arms a fatal timer before a
//! potentially long operation and drops the guard when done. If the guard
//! outlives its deadline the watchdog takes the process down, on the theory
//! that a wedged tracing service is worse than a restarted one.
//!
//! One watchdog is constructed per service; it is not a process-wide
//! singleton, so embedders running several services keep them isolated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a fatal timer was armed. At most one timer per reason is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerReason {
    /// A single task on the service runner is taking too long.
    TaskDeadline,
    /// A whole trace operation (e.g. a buffer drain) is taking too long.
    TraceDeadline,
}

struct ArmedTimer {
    id: u64,
    deadline: Instant,
    reason: TimerReason,
}

#[derive(Default)]
struct State {
    timers: Vec<ArmedTimer>,
    next_id: u64,
    suppressed: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// The watchdog monitor. Dropping it stops the polling thread.
pub struct Watchdog {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Handle to an armed fatal timer; disarms on drop.
pub struct TimerGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Watchdog {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("spool-watchdog".into())
            .spawn(move || watchdog_thread(thread_shared))
            .expect("failed to spawn watchdog thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Arms a timer that crashes the process in `timeout` unless the
    /// returned guard is dropped first.
    pub fn create_fatal_timer(&self, timeout: Duration, reason: TimerReason) -> TimerGuard {
        let mut state = self.shared.state.lock();
        debug_assert!(
            !state.timers.iter().any(|t| t.reason == reason),
            "one fatal timer per reason"
        );
        let id = state.next_id;
        state.next_id += 1;
        state.timers.push(ArmedTimer {
            id,
            deadline: Instant::now() + timeout,
            reason,
        });
        drop(state);
        self.shared.cv.notify_all();
        TimerGuard {
            shared: self.shared.clone(),
            id,
        }
    }

    /// Downgrades expiry from an abort to an error log. Test hook.
    pub fn set_suppressed_for_testing(&self, suppressed: bool) {
        self.shared.state.lock().suppressed = suppressed;
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.timers.retain(|t| t.id != self.id);
        drop(state);
        self.shared.cv.notify_all();
    }
}

fn watchdog_thread(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        if let Some(expired) = state.timers.iter().find(|t| t.deadline <= now) {
            let reason = expired.reason;
            if state.suppressed {
                tracing::error!(?reason, "watchdog timer expired (suppressed)");
                state.timers.retain(|t| t.deadline > now);
            } else {
                tracing::error!(?reason, "watchdog timer expired, aborting");
                std::process::abort();
            }
            continue;
        }
        match state.timers.iter().map(|t| t.deadline).min() {
            Some(deadline) => {
                let _ = shared.cv.wait_until(&mut state, deadline);
            }
            None => {
                shared.cv.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_guard_disarms() {
        let watchdog = Watchdog::new();
        let guard = watchdog.create_fatal_timer(Duration::from_millis(20), TimerReason::TaskDeadline);
        drop(guard);
        // Outlive the deadline; the process surviving is the assertion.
        std::thread::sleep(Duration::from_millis(60));
    }

    #[test]
    fn suppressed_expiry_does_not_abort() {
        let watchdog = Watchdog::new();
        watchdog.set_suppressed_for_testing(true);
        let guard = watchdog.create_fatal_timer(Duration::from_millis(10), TimerReason::TraceDeadline);
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
    }
}
