//! Step gate
//!
//! Single-slot, edge-triggered signal. A `signal()` that lands before
//! `wait()` is kept and consumed by that wait; the slot is cleared on every
//! consumption so one signal never advances two waits.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::types::StepMode;

#[derive(Debug, Default)]
pub struct StepGate {
    open: bool,
    pending: Mutex<bool>,
    cond: Condvar,
}

impl StepGate {
    pub fn new(mode: StepMode) -> Self {
        Self {
            open: mode == StepMode::All,
            ..Self::default()
        }
    }

    /// Gate that never blocks
    pub fn open() -> Self {
        Self::new(StepMode::All)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Deliver one continuation signal
    pub fn signal(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Block until a signal is available, then consume it
    pub fn wait(&self) {
        if self.open {
            return;
        }
        let mut pending = self.pending.lock();
        while !*pending {
            self.cond.wait(&mut pending);
        }
        *pending = false;
    }

    /// Like [`wait`](Self::wait) with an upper bound; `false` on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.open {
            return true;
        }
        let mut pending = self.pending.lock();
        self.cond
            .wait_while_for(&mut pending, |pending| !*pending, timeout);
        let consumed = *pending;
        *pending = false;
        consumed
    }
}
