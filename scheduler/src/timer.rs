// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::CsTick;

/// Shared flag a background timer flips when a callback's slice runs out.
///
/// Reads are advisory: the dispatcher re-checks the monotonic clock around
/// every callback, so a missed or late flip costs fairness, not correctness.
pub struct TimeUp {
    flag: Arc<AtomicBool>,
}

impl TimeUp {
    pub fn expired(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// A flag that will never flip. What a test or a disabled timer hands out.
    pub fn never() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A flag that is already set, for driving callback early-exit paths.
    pub fn expired_now() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(true)),
        }
    }

    fn armed() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (Self { flag: flag.clone() }, flag)
    }
}

/// One-shot background timer: `arm` hands back a fresh [`TimeUp`] that will be
/// set roughly `after_cs` centiseconds later unless `cancel` runs first. At
/// most one arming is live at a time.
pub trait SliceTimer {
    fn arm(&mut self, after_cs: CsTick) -> TimeUp;
    fn cancel(&mut self);
}

/// Timer whose flags never fire. Dispatch still terminates because the
/// dispatcher re-reads the clock; this is the right choice for tests and for
/// hosts whose callbacks are all short.
pub struct NullTimer;

impl SliceTimer for NullTimer {
    fn arm(&mut self, _after_cs: CsTick) -> TimeUp {
        TimeUp::never()
    }

    fn cancel(&mut self) {}
}

struct TimerJob {
    deadline: Instant,
    flag: Arc<AtomicBool>,
}

struct TimerState {
    job: Option<TimerJob>,
    epoch: u64,
    shutdown: bool,
}

/// Worker-thread timer. The worker's only externally visible effect is the
/// single atomic store into the armed flag.
pub struct ThreadTimer {
    shared: Arc<(Mutex<TimerState>, Condvar)>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ThreadTimer {
    pub fn new() -> Self {
        let shared = Arc::new((
            Mutex::new(TimerState {
                job: None,
                epoch: 0,
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("slice-timer".to_string())
            .spawn(move || run_worker(&worker_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            worker: Some(worker),
        }
    }
}

impl Default for ThreadTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn run_worker(shared: &(Mutex<TimerState>, Condvar)) {
    let (lock, condvar) = shared;
    let mut state = lock.lock().unwrap();

    loop {
        if state.shutdown {
            return;
        }

        match &state.job {
            None => {
                state = condvar.wait(state).unwrap();
            }
            Some(job) => {
                let now = Instant::now();
                if now >= job.deadline {
                    job.flag.store(true, Ordering::Release);
                    state.job = None;
                    continue;
                }

                let epoch = state.epoch;
                let wait = job.deadline - now;
                let (next, _timed_out) = condvar.wait_timeout(state, wait).unwrap();
                state = next;

                // A different epoch means the job was cancelled or replaced
                // while we slept; go round and look at the current one.
                if state.epoch != epoch {
                    continue;
                }
            }
        }
    }
}

impl SliceTimer for ThreadTimer {
    fn arm(&mut self, after_cs: CsTick) -> TimeUp {
        let (time_up, flag) = TimeUp::armed();
        let delay = Duration::from_millis(after_cs.max(0) as u64 * 10);

        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        state.epoch += 1;
        state.job = Some(TimerJob {
            deadline: Instant::now() + delay,
            flag,
        });
        condvar.notify_one();

        time_up
    }

    fn cancel(&mut self) {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        state.epoch += 1;
        state.job = None;
        condvar.notify_one();
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.shared;
            let mut state = lock.lock().unwrap();
            state.shutdown = true;
            state.epoch += 1;
            state.job = None;
            condvar.notify_one();
        }

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_timer_fires() {
        let mut timer = ThreadTimer::new();
        let time_up = timer.arm(1); // 10 ms
        assert!(!time_up.expired());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !time_up.expired() {
            assert!(Instant::now() < deadline, "timer never fired");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn cancelled_timer_stays_quiet() {
        let mut timer = ThreadTimer::new();
        let time_up = timer.arm(2);
        timer.cancel();

        thread::sleep(Duration::from_millis(50));
        assert!(!time_up.expired());
    }

    #[test]
    fn rearm_replaces_previous_job() {
        let mut timer = ThreadTimer::new();
        let first = timer.arm(1000);
        let second = timer.arm(1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !second.expired() {
            assert!(Instant::now() < deadline, "timer never fired");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!first.expired());
    }
}
