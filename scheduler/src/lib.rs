// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Co-operative idle scheduler.
//!
//! Clients register plain-`fn` callbacks against a context type `C` (the
//! application state the callbacks operate on). Whenever the host event loop
//! yields idle time it calls [`Scheduler::run`], which dispatches every due
//! callback round-robin under a per-tick time budget. Each callback owns a
//! time slice derived from its priority; a callback that wants to keep
//! working returns a next-due time in the past and is re-invoked on the spot
//! until its slice is spent, giving co-operative time-slicing without any
//! language-level async.
//!
//! Callbacks receive a [`TimeUp`] flag armed by a background one-shot timer;
//! a callback doing divisible work should poll it and return once it flips.
//! The flag is advisory only — the dispatcher re-reads the clock around every
//! invocation.

use std::fmt;

use log::*;

pub mod clock;
pub mod timer;

pub use clock::{Clock, MonotonicClock, TestClock};
pub use timer::{NullTimer, SliceTimer, ThreadTimer, TimeUp};

/// Signed centisecond count on the monotonic clock.
pub type CsTick = i64;

/// Opaque callback handle. Together with the callback fn it forms the
/// compound registry key, so the same fn can be registered once per handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(pub u64);

/// An idle callback: receives the context, its own token, the current tick
/// and the slice-expiry flag; returns `Some(next_due)` to stay registered or
/// `None` to remove itself.
pub type IdleCallback<C> = fn(&mut C, Token, CsTick, &TimeUp) -> Option<CsTick>;

/// Default per-tick dispatch budget in centiseconds.
pub const DEFAULT_TICK_BUDGET: CsTick = 10;

#[derive(Debug, PartialEq, Eq)]
pub enum SchedError {
    /// `(callback, token)` is already registered.
    Duplicate,

    /// Priority outside 1..=10.
    BadPriority,
}

impl std::error::Error for SchedError {}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Duplicate => "Callback already registered for this token",
                Self::BadPriority => "Priority must be between 1 and 10",
            }
        )
    }
}

struct Entry<C> {
    callback: IdleCallback<C>,
    token: Token,
    next_due: CsTick,
    base_slice: CsTick,
    remaining_slice: CsTick,
    removed: bool,
}

impl<C> Entry<C> {
    fn matches(&self, callback: IdleCallback<C>, token: Token) -> bool {
        !self.removed && self.callback as usize == callback as usize && self.token == token
    }
}

pub struct Scheduler<C> {
    entries: Vec<Entry<C>>,
    cursor: usize,
    tick_budget: CsTick,
    suspend_count: u32,
    dispatching: bool,
    clock: Box<dyn Clock>,
    timer: Box<dyn SliceTimer>,
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self::with_parts(Box::new(MonotonicClock), Box::new(ThreadTimer::new()))
    }

    pub fn with_parts(clock: Box<dyn Clock>, timer: Box<dyn SliceTimer>) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            tick_budget: DEFAULT_TICK_BUDGET,
            suspend_count: 0,
            dispatching: false,
            clock,
            timer,
        }
    }

    pub fn now(&self) -> CsTick {
        self.clock.now_cs()
    }

    /// Register `callback` under `token`, first due at `due`. `priority`
    /// (1..=10) becomes the callback's base time slice in centiseconds.
    pub fn register(
        &mut self,
        callback: IdleCallback<C>,
        token: Token,
        due: CsTick,
        priority: i32,
    ) -> Result<(), SchedError> {
        if !(1..=10).contains(&priority) {
            return Err(SchedError::BadPriority);
        }
        if self.entries.iter().any(|e| e.matches(callback, token)) {
            return Err(SchedError::Duplicate);
        }

        self.entries.push(Entry {
            callback,
            token,
            next_due: due,
            base_slice: priority as CsTick,
            remaining_slice: priority as CsTick,
            removed: false,
        });
        Ok(())
    }

    pub fn register_delay(
        &mut self,
        callback: IdleCallback<C>,
        token: Token,
        delay: CsTick,
        priority: i32,
    ) -> Result<(), SchedError> {
        let due = self.clock.now_cs() + delay;
        self.register(callback, token, due, priority)
    }

    /// Remove the entry keyed `(callback, token)`. Safe to call whether or
    /// not the entry exists and whether or not a dispatch is in progress; in
    /// the latter case removal is deferred to the end of the tick. Returns
    /// whether an entry was found.
    pub fn deregister(&mut self, callback: IdleCallback<C>, token: Token) -> bool {
        let Some(index) = self.entries.iter().position(|e| e.matches(callback, token)) else {
            return false;
        };

        self.entries[index].removed = true;
        if !self.dispatching {
            self.sweep_removed();
        }
        true
    }

    pub fn is_registered(&self, callback: IdleCallback<C>, token: Token) -> bool {
        self.entries.iter().any(|e| e.matches(callback, token))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum centiseconds one call to [`run`](Self::run) may spend.
    pub fn set_time_slice(&mut self, budget: CsTick) {
        self.tick_budget = budget.max(1);
    }

    /// Gate all callbacks. Calls must balance with [`resume`](Self::resume).
    pub fn suspend(&mut self) {
        self.suspend_count += 1;
    }

    pub fn resume(&mut self) {
        if self.suspend_count == 0 {
            warn!("unbalanced scheduler resume");
            return;
        }
        self.suspend_count -= 1;
    }

    /// The earliest due time over all live entries — what the host should use
    /// as its idle-event deadline. `None` when nothing is runnable (empty or
    /// suspended), meaning the host need not deliver idle events at all.
    pub fn next_due(&self) -> Option<CsTick> {
        if self.suspend_count > 0 {
            return None;
        }
        self.entries
            .iter()
            .filter(|e| !e.removed)
            .map(|e| e.next_due)
            .min()
    }

    /// One idle tick: dispatch due callbacks round-robin from the saved
    /// cursor until the tick budget is spent or no callback is due.
    pub fn run(&mut self, ctx: &mut C) {
        if self.suspend_count > 0 || self.entries.is_empty() {
            return;
        }

        let tick_start = self.clock.now_cs();
        let mut now = tick_start;
        self.dispatching = true;

        loop {
            let budget_left = self.tick_budget - (now - tick_start);
            if budget_left <= 0 {
                break;
            }

            // Next runnable entry at or after the cursor, wrapping once.
            let len = self.entries.len();
            let mut found = None;
            for step in 0..len {
                let index = (self.cursor + step) % len;
                let entry = &self.entries[index];
                if !entry.removed && entry.next_due <= now {
                    found = Some(index);
                    break;
                }
            }
            let Some(index) = found else {
                break; // everyone is blocked
            };
            self.cursor = index;

            let slice = budget_left.min(self.entries[index].remaining_slice);
            let callback = self.entries[index].callback;
            let token = self.entries[index].token;

            let time_up = self.timer.arm(slice);
            trace!("dispatch {:?} with slice {slice}", token);
            let verdict = callback(ctx, token, now, &time_up);
            self.timer.cancel();

            let before = now;
            now = self.clock.now_cs();
            let elapsed = now - before;

            let entry = &mut self.entries[index];
            match verdict {
                None => {
                    entry.removed = true;
                    self.cursor = index + 1;
                }
                Some(due) => {
                    entry.next_due = due;
                    // A finished-early callback that is due again right away
                    // gets re-run on the spot, paying at least one tick of
                    // slice per run so it cannot monopolise the dispatcher.
                    let cost = elapsed.max(1);
                    if elapsed < slice && due <= now && entry.remaining_slice > cost {
                        entry.remaining_slice -= cost;
                    } else {
                        entry.remaining_slice = entry.base_slice;
                        self.cursor = index + 1;
                    }
                }
            }
        }

        self.dispatching = false;
        self.sweep_removed();
    }

    fn sweep_removed(&mut self) {
        if self.entries.iter().any(|e| e.removed) {
            // Keep the cursor pointing at the same entry where possible.
            let before_cursor = self.entries[..self.cursor.min(self.entries.len())]
                .iter()
                .filter(|e| e.removed)
                .count();
            self.entries.retain(|e| !e.removed);
            self.cursor = self.cursor.saturating_sub(before_cursor);
        }
        if self.cursor >= self.entries.len() {
            self.cursor = 0;
        }
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}
