// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The in-process desktop: every peer ("task") on the one message bus, with
//! its receiver, sender and drag engines, plus the shared heap, pin count,
//! file subsystem and frame queue.
//!
//! Inbound frames are offered to each engine of the destination task in
//! turn; a frame every engine passes on goes to the application (returned
//! from [`Desk::pump`]). A recorded frame the application does not answer by
//! its next pump comes back to the sender as a bounce — answering means
//! sending any message that quotes the frame's `my_ref`, which is exactly
//! what [`Desk::receive_data`] and friends do.
//!
//! Engine timer directives are mirrored into per-operation entries on a
//! [`Scheduler<Desk>`]; the scheduler's callbacks re-enter the engines
//! through [`Desk`], so operation ids are the only state that crosses that
//! boundary.

use std::collections::VecDeque;
use std::io;
use std::path::Path;

use log::*;

use packheap::pins::PinCoordinator;
use packheap::{Allocator, Anchor, SimHeap};
use scheduler::{CsTick, IdleCallback, Scheduler, TimeUp, Token};

use crate::bus::{Claim, Delivery, Dest, Env, Host, PointerInfo, TimerKey, TimerOp, Timers};
use crate::drag::{Drag, DragHandler};
use crate::fs::{FileSystem, StdFs};
use crate::helpers::TokenTable;
use crate::ops::OpId;
use crate::receiver::{ReceiveHandler, Receiver};
use crate::sender::{SaveFn, SendHandler, Sender};
use crate::wire::{Action, BBox, Body, FileOffer, Message, WireError};
use crate::{ClientTag, FileKind, TaskId, WindowId, XferError, DRAG_POLL_CS};

pub type DeskScheduler = Scheduler<Desk>;

const RECV_DEADLINE_PRIORITY: i32 = 1;
const DRAG_POLL_PRIORITY: i32 = 2;

enum Envelope {
    Frame {
        dest: TaskId,
        raw: Vec<u8>,
        delivery: Delivery,
        origin: TaskId,
    },
    Bounce {
        dest: TaskId,
        my_ref: u32,
        action: Action,
    },
}

/// A recorded frame no engine claimed, awaiting the application's answer.
struct Parked {
    dest: TaskId,
    origin: TaskId,
    my_ref: u32,
    action: Action,
    /// The application has had one pump's worth of chance to answer.
    seen: bool,
}

/// The message-bus half of the desk: queues, window ownership, ref
/// assignment and the pointer. This is the [`Host`] the engines talk to.
pub struct BusCore {
    queue: VecDeque<Envelope>,
    windows: Vec<(WindowId, TaskId)>,
    parked: Vec<Parked>,
    next_ref: u32,
    sending_task: TaskId,
    pointer: PointerInfo,
    solid_drag: bool,
    pointer_resets: u32,
}

impl BusCore {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            windows: Vec::new(),
            parked: Vec::new(),
            next_ref: 1,
            sending_task: 0,
            pointer: PointerInfo::default(),
            solid_drag: false,
            pointer_resets: 0,
        }
    }

    fn window_owner(&self, window: WindowId) -> Option<TaskId> {
        self.windows
            .iter()
            .find(|(w, _)| *w == window)
            .map(|(_, task)| *task)
    }
}

impl Host for BusCore {
    fn send(
        &mut self,
        dest: Dest,
        your_ref: u32,
        body: Body,
        delivery: Delivery,
    ) -> Result<u32, XferError> {
        // Any reply acknowledges the recorded frame it quotes.
        if your_ref != 0 {
            let me = self.sending_task;
            self.parked
                .retain(|p| !(p.dest == me && p.my_ref == your_ref));
        }

        let my_ref = self.next_ref;
        self.next_ref += 1;
        let action = body.action();

        let msg = Message {
            sender: self.sending_task,
            my_ref,
            your_ref,
            body,
        };
        let raw = msg.encode();

        let dest_task = match dest {
            Dest::Task(task) => Some(task),
            Dest::Window { window, .. } => self.window_owner(window),
        };

        match dest_task {
            Some(task) => {
                trace!(
                    "task {} -> task {task}: {action} ref {my_ref} (re {your_ref})",
                    self.sending_task
                );
                self.queue.push_back(Envelope::Frame {
                    dest: task,
                    raw,
                    delivery,
                    origin: self.sending_task,
                });
            }
            None => {
                trace!(
                    "task {}: {action} to unowned window, {}",
                    self.sending_task,
                    if delivery == Delivery::Recorded {
                        "will bounce"
                    } else {
                        "dropped"
                    }
                );
                if delivery == Delivery::Recorded {
                    self.queue.push_back(Envelope::Bounce {
                        dest: self.sending_task,
                        my_ref,
                        action,
                    });
                }
            }
        }

        Ok(my_ref)
    }

    fn pointer(&mut self) -> PointerInfo {
        self.pointer.clone()
    }

    fn solid_drag_pref(&self) -> bool {
        self.solid_drag
    }

    fn reset_pointer(&mut self) {
        self.pointer_resets += 1;
        trace!("pointer shape reset");
    }
}

struct TaskSlot {
    id: TaskId,
    receiver: Receiver,
    sender: Sender,
    drag: Drag,
}

pub struct Desk {
    pub bus: BusCore,
    pub fs: Box<dyn FileSystem>,
    pub heap: Box<dyn Allocator>,
    pub pins: PinCoordinator,
    /// Error-token lookup for rendering engine errors to the user.
    pub tokens: TokenTable,
    tasks: Vec<TaskSlot>,
    next_task: TaskId,
    pending_timers: Vec<(TaskId, Timers)>,
}

impl Desk {
    pub fn new() -> Self {
        Self::with_parts(Box::new(StdFs::new()), Box::new(SimHeap::new()))
    }

    pub fn with_parts(fs: Box<dyn FileSystem>, heap: Box<dyn Allocator>) -> Self {
        Self {
            bus: BusCore::new(),
            fs,
            heap,
            pins: PinCoordinator::new(),
            tokens: TokenTable::standard(),
            tasks: Vec::new(),
            next_task: 1,
            pending_timers: Vec::new(),
        }
    }

    pub fn register_task(&mut self) -> TaskId {
        let id = self.next_task;
        self.next_task += 1;
        self.tasks.push(TaskSlot {
            id,
            receiver: Receiver::new(id),
            sender: Sender::new(id),
            drag: Drag::new(id),
        });
        debug!("task {id} registered");
        id
    }

    /// Finalise a task's engines (synchronously cancelling everything it has
    /// in flight) and take it off the bus.
    pub fn remove_task(&mut self, sched: &mut DeskScheduler, task: TaskId) {
        self.with_task_env(task, |env, slot| {
            slot.receiver.finalise(env);
            slot.sender.finalise(env);
            slot.drag.finalise(env);
        });
        self.apply_pending(sched);

        self.tasks.retain(|t| t.id != task);
        self.bus.windows.retain(|(_, owner)| *owner != task);
        debug!("task {task} removed");
    }

    pub fn claim_window(&mut self, window: WindowId, task: TaskId) {
        self.bus.windows.retain(|(w, _)| *w != window);
        self.bus.windows.push((window, task));
    }

    pub fn set_pointer(&mut self, pointer: PointerInfo) {
        self.bus.pointer = pointer;
    }

    pub fn set_solid_drag(&mut self, solid: bool) {
        self.bus.solid_drag = solid;
    }

    /// How often the pointer shape has been reset, for tests and demos.
    pub fn pointer_resets(&self) -> u32 {
        self.bus.pointer_resets
    }

    /// Convenience: place client bytes into the shared heap.
    pub fn alloc_data(&mut self, bytes: &[u8]) -> Result<Anchor, XferError> {
        let anchor = self.heap.alloc(bytes.len())?;
        self.heap.write(anchor, 0, bytes)?;
        Ok(anchor)
    }

    /// Convenience: copy a whole heap block back out.
    pub fn read_back(&self, anchor: Anchor) -> Option<Vec<u8>> {
        let len = self.heap.size_of(anchor)?;
        let mut out = vec![0; len];
        self.heap.read(anchor, 0, &mut out).ok()?;
        Some(out)
    }

    /// One delivery round: bounce recorded frames the application ignored
    /// last round, then drain the queue through the engines. Returns the
    /// frames the engines passed on, for the application to act on.
    pub fn pump(&mut self, sched: &mut DeskScheduler) -> Vec<(TaskId, Message)> {
        self.apply_pending(sched);
        self.flush_ignored_parked();

        let mut for_app = Vec::new();
        while let Some(envelope) = self.bus.queue.pop_front() {
            match envelope {
                Envelope::Frame {
                    dest,
                    raw,
                    delivery,
                    origin,
                } => {
                    let msg = match Message::decode(&raw) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("undecodable frame dropped: {e}");
                            continue;
                        }
                    };

                    if self.task_index(dest).is_none() {
                        if delivery == Delivery::Recorded {
                            self.bus.queue.push_back(Envelope::Bounce {
                                dest: origin,
                                my_ref: msg.my_ref,
                                action: msg.action(),
                            });
                        }
                        continue;
                    }

                    let claim = self.dispatch_frame(sched, dest, &msg);
                    if claim == Claim::Pass {
                        if delivery == Delivery::Recorded {
                            self.bus.parked.push(Parked {
                                dest,
                                origin,
                                my_ref: msg.my_ref,
                                action: msg.action(),
                                seen: false,
                            });
                        }
                        for_app.push((dest, msg));
                    }
                }
                Envelope::Bounce {
                    dest,
                    my_ref,
                    action,
                } => {
                    let claim = self.dispatch_bounce(sched, dest, my_ref, action);
                    if claim == Claim::Pass {
                        debug!("stale bounce of {action} ref {my_ref} dropped");
                    }
                }
            }
        }

        for parked in &mut self.bus.parked {
            parked.seen = true;
        }
        for_app
    }

    /// Answer an application-level offer (returned from [`pump`](Self::pump))
    /// by starting a receive operation for it.
    pub fn receive_data(
        &mut self,
        sched: &mut DeskScheduler,
        task: TaskId,
        offer_msg: &Message,
        handler: ReceiveHandler,
    ) -> Result<OpId, XferError> {
        let Body::OfferData(offer) = &offer_msg.body else {
            return Err(XferError::Wire(WireError::BadAction(
                offer_msg.action().code(),
            )));
        };

        let result = self
            .with_task_env(task, |env, slot| {
                slot.receiver
                    .receive_data(env, offer_msg.sender, offer_msg.my_ref, offer, handler)
            })
            .unwrap_or_else(|| Err(unknown_task(task)));
        self.apply_pending(sched);
        result
    }

    /// Explicitly decline a parked offer so it bounces back to its sender
    /// right away.
    pub fn reject_offer(&mut self, offer_msg: &Message) {
        let mut bounced = Vec::new();
        self.bus.parked.retain(|p| {
            if p.my_ref == offer_msg.my_ref {
                bounced.push((p.origin, p.my_ref, p.action));
                false
            } else {
                true
            }
        });
        for (dest, my_ref, action) in bounced {
            self.bus
                .queue
                .push_back(Envelope::Bounce {
                    dest,
                    my_ref,
                    action,
                });
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_data(
        &mut self,
        task: TaskId,
        peer: Option<TaskId>,
        offer: &FileOffer,
        data: Anchor,
        start: u64,
        end: u64,
        save_fn: Option<SaveFn>,
        handler: SendHandler,
    ) -> Result<OpId, XferError> {
        self.with_task_env(task, |env, slot| {
            slot.sender
                .send_data(env, peer, offer, data, start, end, save_fn, handler)
        })
        .unwrap_or_else(|| Err(unknown_task(task)))
    }

    pub fn cancel_receives(&mut self, sched: &mut DeskScheduler, task: TaskId, tag: ClientTag) {
        self.with_task_env(task, |env, slot| slot.receiver.cancel_receives(env, tag));
        self.apply_pending(sched);
    }

    pub fn cancel_sends(&mut self, task: TaskId, data: Anchor) {
        self.with_task_env(task, |env, slot| slot.sender.cancel_sends(env, data));
    }

    pub fn load_local_file(
        &mut self,
        task: TaskId,
        path: &Path,
        kind: Option<FileKind>,
        handler: ReceiveHandler,
    ) -> bool {
        self.with_task_env(task, |env, slot| {
            slot.receiver.load_local_file(env, path, kind, handler)
        })
        .unwrap_or(false)
    }

    pub fn start_drag(
        &mut self,
        sched: &mut DeskScheduler,
        task: TaskId,
        kinds: &[FileKind],
        bbox: Option<BBox>,
        from_selection: bool,
        handler: DragHandler,
    ) -> Result<(), XferError> {
        let result = self
            .with_task_env(task, |env, slot| {
                slot.drag.start(env, kinds, bbox, from_selection, handler)
            })
            .unwrap_or_else(|| Err(unknown_task(task)));
        self.apply_pending(sched);
        result
    }

    /// The host reports the user released the drag.
    pub fn end_drag(&mut self, sched: &mut DeskScheduler, task: TaskId) -> Result<(), XferError> {
        let result = self
            .with_task_env(task, |env, slot| slot.drag.drag_ended(env))
            .unwrap_or_else(|| Err(unknown_task(task)));
        self.apply_pending(sched);
        result
    }

    pub fn abort_drag(&mut self, sched: &mut DeskScheduler, task: TaskId) -> Result<(), XferError> {
        let result = self
            .with_task_env(task, |env, slot| slot.drag.abort(env))
            .unwrap_or_else(|| Err(unknown_task(task)));
        self.apply_pending(sched);
        result
    }

    /// Application-level send, e.g. a drag claim. Subject to the same ref
    /// assignment and acknowledgement rules as engine traffic.
    pub fn send_raw(
        &mut self,
        task: TaskId,
        dest: Dest,
        your_ref: u32,
        body: Body,
        delivery: Delivery,
    ) -> Result<u32, XferError> {
        if self.task_index(task).is_none() {
            return Err(unknown_task(task));
        }
        self.bus.sending_task = task;
        self.bus.send(dest, your_ref, body, delivery)
    }

    /// Live receive/send operation counts for a task, for invariant checks.
    pub fn live_ops(&self, task: TaskId) -> (usize, usize) {
        match self.tasks.iter().find(|t| t.id == task) {
            Some(slot) => (slot.receiver.live_ops(), slot.sender.live_ops()),
            None => (0, 0),
        }
    }

    fn task_index(&self, task: TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == task)
    }

    fn with_task_env<R>(
        &mut self,
        task: TaskId,
        f: impl FnOnce(&mut Env, &mut TaskSlot) -> R,
    ) -> Option<R> {
        let index = self.task_index(task)?;
        self.bus.sending_task = task;

        let mut timers = Timers::new();
        let slot = &mut self.tasks[index];
        let result = {
            let mut env = Env {
                host: &mut self.bus,
                fs: self.fs.as_mut(),
                heap: self.heap.as_mut(),
                pins: &mut self.pins,
                timers: &mut timers,
            };
            f(&mut env, slot)
        };

        if !timers.is_empty() {
            self.pending_timers.push((task, timers));
        }
        Some(result)
    }

    fn dispatch_frame(&mut self, sched: &mut DeskScheduler, dest: TaskId, msg: &Message) -> Claim {
        let claim = self
            .with_task_env(dest, |env, slot| match slot.receiver.handle(env, msg) {
                Claim::Claimed => Claim::Claimed,
                Claim::Pass => match slot.sender.handle(env, msg) {
                    Claim::Claimed => Claim::Claimed,
                    Claim::Pass => slot.drag.handle(env, msg),
                },
            })
            .unwrap_or(Claim::Pass);
        self.apply_pending(sched);
        claim
    }

    fn dispatch_bounce(
        &mut self,
        sched: &mut DeskScheduler,
        dest: TaskId,
        my_ref: u32,
        action: Action,
    ) -> Claim {
        let claim = self
            .with_task_env(dest, |env, slot| {
                match slot.receiver.handle_bounce(env, my_ref, action) {
                    Claim::Claimed => Claim::Claimed,
                    Claim::Pass => match slot.sender.handle_bounce(env, my_ref, action) {
                        Claim::Claimed => Claim::Claimed,
                        Claim::Pass => slot.drag.handle_bounce(env, my_ref, action),
                    },
                }
            })
            .unwrap_or(Claim::Pass);
        self.apply_pending(sched);
        claim
    }

    /// Recorded frames the application saw last round and left unanswered
    /// go back to their senders as bounces.
    fn flush_ignored_parked(&mut self) {
        let mut kept = Vec::new();
        for parked in std::mem::take(&mut self.bus.parked) {
            if parked.seen {
                trace!(
                    "task {}: unanswered {} ref {} bounced",
                    parked.dest,
                    parked.action,
                    parked.my_ref
                );
                self.bus.queue.push_back(Envelope::Bounce {
                    dest: parked.origin,
                    my_ref: parked.my_ref,
                    action: parked.action,
                });
            } else {
                kept.push(parked);
            }
        }
        self.bus.parked = kept;
    }

    fn apply_pending(&mut self, sched: &mut DeskScheduler) {
        for (task, mut timers) in std::mem::take(&mut self.pending_timers) {
            for op in timers.drain() {
                self.apply_timer(sched, task, op);
            }
        }
    }

    fn apply_timer(&mut self, sched: &mut DeskScheduler, task: TaskId, op: TimerOp) {
        match op {
            TimerOp::Set { key, delay } => {
                let (callback, token, priority) = timer_entry(task, key);
                // Setting an armed timer re-arms it.
                sched.deregister(callback, token);
                if let Err(e) = sched.register_delay(callback, token, delay, priority) {
                    warn!("could not arm timer for task {task}: {e}");
                }
            }
            TimerOp::Clear { key } => {
                let (callback, token, _) = timer_entry(task, key);
                sched.deregister(callback, token);
            }
        }
    }
}

impl Default for Desk {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_task(task: TaskId) -> XferError {
    XferError::Host(io::Error::other(format!("unknown task {task}")))
}

fn timer_entry(task: TaskId, key: TimerKey) -> (IdleCallback<Desk>, Token, i32) {
    match key {
        TimerKey::RecvDeadline(op) => (
            recv_deadline_fired,
            Token(((task as u64) << 32) | op.pack() as u64),
            RECV_DEADLINE_PRIORITY,
        ),
        TimerKey::DragPoll => (
            drag_poll_fired,
            Token((task as u64) << 32),
            DRAG_POLL_PRIORITY,
        ),
    }
}

fn recv_deadline_fired(desk: &mut Desk, token: Token, _now: CsTick, _up: &TimeUp) -> Option<CsTick> {
    let task = (token.0 >> 32) as TaskId;
    let op = OpId::unpack(token.0 as u32);
    desk.with_task_env(task, |env, slot| slot.receiver.expire(env, op));
    None
}

fn drag_poll_fired(desk: &mut Desk, token: Token, now: CsTick, _up: &TimeUp) -> Option<CsTick> {
    let task = (token.0 >> 32) as TaskId;
    match desk.with_task_env(task, |env, slot| slot.drag.tick(env)) {
        Some(true) => Some(now + DRAG_POLL_CS),
        _ => None,
    }
}
