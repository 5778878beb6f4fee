//! Doorbell for producer wakeup.
//!
//! When a writer finds no free chunk for its target buffer it can block
//! until the service frees one. The service rings the doorbell after every
//! batch of chunk releases; writers re-scan the region on each ring.
//!
//! The bell counts rings so a waiter that sampled the epoch before its last
//! failed scan can never miss a wakeup that happened in between.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A counting wakeup primitive shared by one arbiter and the service.
#[derive(Default)]
pub struct Doorbell {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current ring count. Sample this *before* the scan that may stall.
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Rings the bell, waking every waiter.
    pub fn signal(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.cv.notify_all();
    }

    /// Blocks until the bell has rung past `seen_epoch` or `timeout`
    /// elapses. Returns true if a ring happened.
    pub fn wait_past(&self, seen_epoch: u64, timeout: Duration) -> bool {
        let mut epoch = self.epoch.lock();
        if *epoch > seen_epoch {
            return true;
        }
        let _ = self.cv.wait_for(&mut epoch, timeout);
        *epoch > seen_epoch
    }
}
