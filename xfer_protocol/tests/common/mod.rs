// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Shared harness for the protocol integration tests: a desk over a
//! simulated heap, a hand-cranked clock, and callback probes.

// Not every test binary exercises every probe.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Read;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use packheap::SimHeap;
use scheduler::{NullTimer, TestClock};

use xfer_protocol::desk::{Desk, DeskScheduler};
use xfer_protocol::fs::StdFs;
use xfer_protocol::receiver::ReceiveHandler;
use xfer_protocol::sender::{SendHandler, SendOutcome};
use xfer_protocol::wire::Message;
use xfer_protocol::TaskId;

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

pub struct Harness {
    pub desk: Desk,
    pub sched: DeskScheduler,
    pub clock: TestClock,
    pub scratch_dir: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_heap_budget(None)
    }

    pub fn with_heap_budget(budget: Option<usize>) -> Self {
        let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let scratch_dir =
            std::env::temp_dir().join(format!("xfer-int-{}-{seq}", std::process::id()));

        let fs = StdFs::with_scratch_dir(scratch_dir.clone());
        let heap = match budget {
            Some(bytes) => SimHeap::with_budget(bytes),
            None => SimHeap::new(),
        };
        let clock = TestClock::new();

        Self {
            desk: Desk::with_parts(Box::new(fs), Box::new(heap)),
            sched: DeskScheduler::with_parts(Box::new(clock.clone()), Box::new(NullTimer)),
            clock,
            scratch_dir,
        }
    }

    pub fn pump(&mut self) -> Vec<(TaskId, Message)> {
        self.desk.pump(&mut self.sched)
    }

    pub fn idle(&mut self) {
        self.sched.run(&mut self.desk);
    }
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491u32 ^ len as u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

/// Records what the receive callbacks saw.
#[derive(Clone, Default)]
pub struct RecvProbe {
    data: Rc<RefCell<Option<Vec<u8>>>>,
    fails: Rc<RefCell<Vec<Option<String>>>>,
}

impl RecvProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self, tag: u64) -> ReceiveHandler {
        self.handler_with(tag, false, true)
    }

    pub fn handler_with(&self, tag: u64, prefer_file: bool, accept: bool) -> ReceiveHandler {
        let data = self.data.clone();
        let fails = self.fails.clone();
        ReceiveHandler {
            on_data: Box::new(move |reader, _info| {
                if !accept {
                    return false;
                }
                let mut bytes = Vec::new();
                if reader.read_to_end(&mut bytes).is_err() {
                    return false;
                }
                *data.borrow_mut() = Some(bytes);
                true
            }),
            on_fail: Box::new(move |error| {
                fails
                    .borrow_mut()
                    .push(error.map(|e| e.token().to_string()));
            }),
            tag,
            prefer_file,
        }
    }

    pub fn data(&self) -> Option<Vec<u8>> {
        self.data.borrow().clone()
    }

    /// Each `on_fail` as its error token (`None` = cancelled or timed out).
    pub fn fails(&self) -> Vec<Option<String>> {
        self.fails.borrow().clone()
    }
}

/// A send outcome flattened for assertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finished {
    pub success: bool,
    pub error_token: Option<String>,
    pub destination: Option<PathBuf>,
    pub offer_ref: u32,
}

#[derive(Clone, Default)]
pub struct SendProbe {
    finished: Rc<RefCell<Vec<Finished>>>,
}

impl SendProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> SendHandler {
        let finished = self.finished.clone();
        SendHandler {
            on_finished: Box::new(move |outcome: SendOutcome| {
                finished.borrow_mut().push(Finished {
                    success: outcome.success,
                    error_token: outcome.error.map(|e| e.token().to_string()),
                    destination: outcome.destination,
                    offer_ref: outcome.offer_ref,
                });
            }),
        }
    }

    pub fn finished(&self) -> Vec<Finished> {
        self.finished.borrow().clone()
    }
}
