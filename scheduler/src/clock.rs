// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::Cell;
use std::rc::Rc;

use crate::CsTick;

/// Source of the monotonic centisecond count all scheduling is based on.
pub trait Clock {
    fn now_cs(&self) -> CsTick;
}

/// The process monotonic clock, read via `clock_gettime(CLOCK_MONOTONIC)`.
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_cs(&self) -> CsTick {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // SAFETY: ts is a valid out-parameter and CLOCK_MONOTONIC cannot fail
        // on any supported platform.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }

        ts.tv_sec as CsTick * 100 + ts.tv_nsec as CsTick / 10_000_000
    }
}

/// Hand-cranked clock for tests. Clones share the same underlying counter, so
/// a test can keep one handle and give the other to the scheduler.
#[derive(Clone)]
pub struct TestClock {
    now: Rc<Cell<CsTick>>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(0)),
        }
    }

    pub fn advance(&self, cs: CsTick) {
        self.now.set(self.now.get() + cs);
    }

    pub fn set(&self, cs: CsTick) {
        self.now.set(cs);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_cs(&self) -> CsTick {
        self.now.get()
    }
}
