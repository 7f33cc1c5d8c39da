// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The seam between the engines and the host event layer.
//!
//! Engines never block on a send: a recorded send whose frame no peer claims
//! comes back later as a bounce pseudo-event carrying the original `my_ref`
//! and action, which is the only delivery notification the protocol uses.

use scheduler::CsTick;

use packheap::pins::PinCoordinator;
use packheap::Allocator;

use crate::fs::FileSystem;
use crate::ops::OpId;
use crate::wire::Body;
use crate::{IconId, TaskId, WindowId, XferError};

/// Whether non-delivery of a send is reported back as a bounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Plain,
    Recorded,
}

/// Where a message goes. A window destination is resolved to its owning task
/// by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    Task(TaskId),
    Window { window: WindowId, icon: IconId },
}

/// What an engine answers when offered an inbound message or bounce. `Pass`
/// returns the event to the dispatcher so another engine (or the
/// application) can claim it instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    Pass,
}

/// Pointer state as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointerInfo {
    pub window: WindowId,
    pub icon: IconId,
    pub x: i32,
    pub y: i32,
    pub shift_held: bool,
}

/// Host services the engines call out to: message delivery and the pointer.
pub trait Host {
    /// Queue `body` for delivery, stamping the sending task and a fresh
    /// `my_ref`, which is returned.
    fn send(
        &mut self,
        dest: Dest,
        your_ref: u32,
        body: Body,
        delivery: Delivery,
    ) -> Result<u32, XferError>;

    fn pointer(&mut self) -> PointerInfo;

    /// The user's solid-vs-outline drag rendering preference.
    fn solid_drag_pref(&self) -> bool;

    /// Put the pointer shape back to the default.
    fn reset_pointer(&mut self);
}

/// Keys for the timer directives an engine can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKey {
    /// The 30-second no-progress deadline of one receiver operation.
    RecvDeadline(OpId),

    /// The periodic drag position broadcast.
    DragPoll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    Set { key: TimerKey, delay: CsTick },
    Clear { key: TimerKey },
}

/// Timer directives recorded during an engine call. The caller mirrors them
/// into real scheduler entries afterwards; engines themselves never hold a
/// scheduler reference, only operation ids ever cross that boundary.
#[derive(Default)]
pub struct Timers {
    ops: Vec<TimerOp>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer behind `key`.
    pub fn set(&mut self, key: TimerKey, delay: CsTick) {
        self.ops.push(TimerOp::Set { key, delay });
    }

    pub fn clear(&mut self, key: TimerKey) {
        self.ops.push(TimerOp::Clear { key });
    }

    pub fn drain(&mut self) -> Vec<TimerOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The collaborator bundle handed to every engine entry point.
pub struct Env<'a> {
    pub host: &'a mut dyn Host,
    pub fs: &'a mut dyn FileSystem,
    pub heap: &'a mut dyn Allocator,
    pub pins: &'a mut PinCoordinator,
    pub timers: &'a mut Timers,
}
