// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The drag engine: tracks one user-driven drag per task, broadcasts
//! position updates, negotiates the drop-claim handshake, and resolves the
//! terminal drop into exactly one `on_drop` invocation.
//!
//! While the drag is live a scheduler callback fires every 25 centiseconds
//! and sends a `Dragging` message: broadcast unrecorded to whatever window is
//! under the pointer, or recorded to the current claimant so its death is
//! noticed. The post-drop handshake is deliberately racy — either the
//! claimant answers the final recorded `Dragging` with a claim, or the
//! message bounces; both roads lead to `on_drop`, exactly once.

use log::*;

use crate::bus::{Claim, Delivery, Dest, Env, PointerInfo, TimerKey};
use crate::wire::{claim_flags, drag_flags, Action, BBox, Body, DragInfo, Message};
use crate::{FileKind, TaskId, WindowId, XferError, DRAG_POLL_CS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragBoxOp {
    Start,
    Hide,
    Cancel,
}

/// Everything the client learns at drop time.
#[derive(Debug, Clone)]
pub struct DropInfo {
    pub shift_held: bool,
    pub window: WindowId,
    pub icon: i32,
    pub x: i32,
    pub y: i32,
    pub kind: FileKind,
    pub claimant: Option<TaskId>,
    pub claimant_ref: u32,
}

pub type DragBoxFn = Box<dyn FnMut(DragBoxOp, bool, i32, i32) -> Result<(), XferError>>;

/// Returns whether the client took responsibility for sending the data. A
/// `false` (or an absent callback) tells the claimant to stand down.
pub type DropFn = Box<dyn FnMut(&DropInfo) -> bool>;

pub struct DragHandler {
    pub on_drag_box: DragBoxFn,
    pub on_drop: Option<DropFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DragState {
    Idle,
    Active,
    /// A recorded `Dragging` is outstanding to the claimant.
    AwaitingClaimReply,
    /// The user has released; the final `Dragging` is outstanding.
    Finished,
}

pub struct Drag {
    task: TaskId,
    state: DragState,
    aborted: bool,
    claimant: Option<TaskId>,
    last_claim_ref: u32,
    last_dragging_ref: u32,
    pointer_shape_changed: bool,
    box_suppressed: bool,
    shift_at_start: bool,
    solid_pref: bool,
    from_selection: bool,
    kinds: Vec<FileKind>,
    bbox: Option<BBox>,
    handler: Option<DragHandler>,
    pointer: PointerInfo,
}

impl Drag {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            state: DragState::Idle,
            aborted: false,
            claimant: None,
            last_claim_ref: 0,
            last_dragging_ref: 0,
            pointer_shape_changed: false,
            box_suppressed: false,
            shift_at_start: false,
            solid_pref: false,
            from_selection: false,
            kinds: Vec::new(),
            bbox: None,
            handler: None,
            pointer: PointerInfo::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != DragState::Idle
    }

    /// Begin a drag advertising `kinds` (most preferred first; empty means
    /// untyped). Fails if a drag is already in progress. Any effect taken
    /// before a failure is unwound.
    pub fn start(
        &mut self,
        env: &mut Env,
        kinds: &[FileKind],
        bbox: Option<BBox>,
        from_selection: bool,
        mut handler: DragHandler,
    ) -> Result<(), XferError> {
        if self.state != DragState::Idle {
            return Err(XferError::DragInProgress);
        }

        self.pointer = env.host.pointer();
        self.shift_at_start = self.pointer.shift_held;
        self.solid_pref = env.host.solid_drag_pref();
        self.from_selection = from_selection;
        self.kinds = kinds
            .iter()
            .copied()
            .filter(|k| *k != FileKind::NULL)
            .collect();
        self.bbox = bbox;

        env.timers.set(TimerKey::DragPoll, DRAG_POLL_CS);

        if let Err(e) = (handler.on_drag_box)(
            DragBoxOp::Start,
            self.solid_pref,
            self.pointer.x,
            self.pointer.y,
        ) {
            env.timers.clear(TimerKey::DragPoll);
            self.reset();
            return Err(e);
        }

        self.handler = Some(handler);
        self.state = DragState::Active;
        debug!("task {}: drag started ({} kinds)", self.task, self.kinds.len());
        Ok(())
    }

    /// Periodic position update. Returns whether the callback should stay
    /// registered. While a recorded `Dragging` to the claimant is still
    /// unanswered, only the pointer cache refreshes — the next message waits
    /// for the claim or the bounce, so a bounce always concerns our latest
    /// ref.
    pub fn tick(&mut self, env: &mut Env) -> bool {
        match self.state {
            DragState::Active => {}
            DragState::AwaitingClaimReply => {
                self.pointer = env.host.pointer();
                return true;
            }
            _ => return false,
        }

        self.pointer = env.host.pointer();
        let body = self.dragging_body(0);

        let sent = match self.claimant {
            Some(claimant) => {
                let sent = env.host.send(
                    Dest::Task(claimant),
                    self.last_claim_ref,
                    body,
                    Delivery::Recorded,
                );
                if sent.is_ok() {
                    self.state = DragState::AwaitingClaimReply;
                }
                sent
            }
            None => env.host.send(
                Dest::Window {
                    window: self.pointer.window,
                    icon: self.pointer.icon,
                },
                0,
                body,
                Delivery::Plain,
            ),
        };

        match sent {
            Ok(my_ref) => self.last_dragging_ref = my_ref,
            Err(e) => warn!("task {}: dragging broadcast failed: {e}", self.task),
        }
        true
    }

    /// Offer an inbound message to this engine.
    pub fn handle(&mut self, env: &mut Env, msg: &Message) -> Claim {
        let Body::DragClaim(claim) = &msg.body else {
            return Claim::Pass;
        };
        if msg.your_ref == 0 || msg.your_ref != self.last_dragging_ref {
            return Claim::Pass;
        }

        if self.state == DragState::Finished {
            // The post-drop claim: the party under the pointer will take the
            // data. Resolve the kind and conclude.
            let kinds = claim.kinds.clone();
            self.conclude(env, Some((msg.sender, msg.my_ref)), Some(&kinds));
            return Claim::Claimed;
        }
        if !matches!(self.state, DragState::Active | DragState::AwaitingClaimReply) {
            return Claim::Pass;
        }

        self.claimant = Some(msg.sender);
        self.last_claim_ref = msg.my_ref;
        self.state = DragState::Active;

        let suppress = claim.flags & claim_flags::REMOVE_DRAG_BOX != 0;
        if suppress != self.box_suppressed {
            let op = if suppress {
                DragBoxOp::Hide
            } else {
                DragBoxOp::Start
            };
            if let Some(handler) = self.handler.as_mut() {
                if let Err(e) =
                    (handler.on_drag_box)(op, self.solid_pref, self.pointer.x, self.pointer.y)
                {
                    warn!("task {}: drag box update failed: {e}", self.task);
                }
            }
            self.box_suppressed = suppress;
        }

        if claim.flags & claim_flags::POINTER_SHAPE_CHANGED != 0 {
            self.pointer_shape_changed = true;
        }

        trace!("task {}: drag claimed by task {}", self.task, msg.sender);
        Claim::Claimed
    }

    /// The host reports that the user released the drag.
    pub fn drag_ended(&mut self, env: &mut Env) -> Result<(), XferError> {
        if !matches!(self.state, DragState::Active | DragState::AwaitingClaimReply) {
            warn!("task {}: drag end without an active drag", self.task);
            return Ok(());
        }
        self.finish(env)
    }

    /// The finished sequence: cancel the drag box, deregister the poll, and
    /// send the final position message — recorded, so we learn whether
    /// anyone is there to take the drop. The claim or bounce that answers it
    /// resolves `on_drop`.
    fn finish(&mut self, env: &mut Env) -> Result<(), XferError> {
        self.pointer = env.host.pointer();
        if let Some(handler) = self.handler.as_mut() {
            if let Err(e) = (handler.on_drag_box)(
                DragBoxOp::Cancel,
                self.solid_pref,
                self.pointer.x,
                self.pointer.y,
            ) {
                warn!("task {}: drag box cancel failed: {e}", self.task);
            }
        }
        env.timers.clear(TimerKey::DragPoll);
        self.state = DragState::Finished;

        let body = self.dragging_body(0);
        let (dest, your_ref) = match self.claimant {
            Some(claimant) => (Dest::Task(claimant), self.last_claim_ref),
            None => (
                Dest::Window {
                    window: self.pointer.window,
                    icon: self.pointer.icon,
                },
                0,
            ),
        };
        match env.host.send(dest, your_ref, body, Delivery::Recorded) {
            Ok(my_ref) => self.last_dragging_ref = my_ref,
            Err(e) => {
                warn!("task {}: final dragging send failed: {e}", self.task);
                self.conclude(env, None, None);
            }
        }
        Ok(())
    }

    /// Offer a bounce of one of our recorded sends to this engine.
    pub fn handle_bounce(&mut self, env: &mut Env, my_ref: u32, action: Action) -> Claim {
        if action != Action::Dragging || my_ref != self.last_dragging_ref {
            return Claim::Pass;
        }

        match self.state {
            DragState::Finished => {
                // Nobody claimed the drop; resolve with our own first choice.
                self.conclude(env, None, None);
                Claim::Claimed
            }
            DragState::AwaitingClaimReply => {
                // The claimant died mid-drag. Undo its effects and go back
                // to broadcasting.
                debug!("task {}: claimant vanished", self.task);
                self.claimant = None;
                self.last_claim_ref = 0;
                if self.pointer_shape_changed {
                    env.host.reset_pointer();
                    self.pointer_shape_changed = false;
                }
                if self.box_suppressed {
                    if let Some(handler) = self.handler.as_mut() {
                        if let Err(e) = (handler.on_drag_box)(
                            DragBoxOp::Start,
                            self.solid_pref,
                            self.pointer.x,
                            self.pointer.y,
                        ) {
                            warn!("task {}: drag box restore failed: {e}", self.task);
                        }
                    }
                    self.box_suppressed = false;
                }
                self.state = DragState::Active;
                Claim::Claimed
            }
            _ => Claim::Pass,
        }
    }

    /// Abandon the drag. The finished sequence runs exactly as for a user
    /// release — the final recorded `Dragging` still goes out, and the claim
    /// or bounce answering it delivers the one terminal `on_drop`.
    pub fn abort(&mut self, env: &mut Env) -> Result<(), XferError> {
        if !matches!(self.state, DragState::Active | DragState::AwaitingClaimReply) {
            return Ok(());
        }

        self.aborted = true;
        debug!("task {}: drag aborted", self.task);
        self.finish(env)
    }

    /// Synchronous shutdown for a task leaving the bus. No later delivery
    /// round exists to resolve the post-drop race, so the context is torn
    /// down directly instead of going through the finished sequence.
    pub fn finalise(&mut self, env: &mut Env) {
        if self.state == DragState::Idle {
            return;
        }

        if matches!(self.state, DragState::Active | DragState::AwaitingClaimReply) {
            if let Some(handler) = self.handler.as_mut() {
                if let Err(e) = (handler.on_drag_box)(
                    DragBoxOp::Cancel,
                    self.solid_pref,
                    self.pointer.x,
                    self.pointer.y,
                ) {
                    warn!("task {}: drag box cancel failed: {e}", self.task);
                }
            }
        }
        env.timers.clear(TimerKey::DragPoll);
        if self.pointer_shape_changed {
            env.host.reset_pointer();
        }
        self.reset();
    }

    fn dragging_body(&self, flags_extra: u32) -> Body {
        let mut flags = flags_extra;
        if self.from_selection {
            flags |= drag_flags::FROM_SELECTION;
        }
        Body::Dragging(DragInfo {
            window: self.pointer.window,
            icon: self.pointer.icon,
            x: self.pointer.x,
            y: self.pointer.y,
            flags,
            bbox: self.bbox,
            kinds: self.kinds.clone(),
        })
    }

    /// Deliver the one terminal `on_drop` and return to idle. `accepted`
    /// holds the claimant's kind list when a claim resolved the drop.
    fn conclude(
        &mut self,
        env: &mut Env,
        claimant: Option<(TaskId, u32)>,
        accepted: Option<&[FileKind]>,
    ) {
        if self.pointer_shape_changed {
            env.host.reset_pointer();
        }

        // Best match: the first of our kinds the claimant accepts, our list
        // order being the preference order. With no usable intersection the
        // drop falls back to our first choice.
        let kind = accepted
            .and_then(|theirs| self.kinds.iter().copied().find(|k| theirs.contains(k)))
            .or_else(|| self.kinds.first().copied())
            .unwrap_or(FileKind::NULL);

        let info = DropInfo {
            shift_held: self.shift_at_start,
            window: self.pointer.window,
            icon: self.pointer.icon,
            x: self.pointer.x,
            y: self.pointer.y,
            kind,
            claimant: claimant.map(|(task, _)| task),
            claimant_ref: claimant.map(|(_, r)| r).unwrap_or(0),
        };

        let handler = self.handler.take();
        let pointer = self.pointer.clone();
        let body = self.dragging_body(drag_flags::DO_NOT_CLAIM);
        let was_aborted = self.aborted;
        self.reset();
        self.pointer = pointer;

        let accepted_by_client = match handler.and_then(|h| h.on_drop) {
            Some(mut on_drop) => on_drop(&info),
            None => false,
        };
        debug!(
            "task {}: {} resolved to kind {kind} (client {})",
            self.task,
            if was_aborted { "aborted drag" } else { "drop" },
            if accepted_by_client { "took it" } else { "declined" }
        );

        // A declining client means the claimant must not wait for data.
        if !accepted_by_client {
            if let Some((task, claim_ref)) = claimant {
                if let Err(e) = env.host.send(Dest::Task(task), claim_ref, body, Delivery::Plain)
                {
                    warn!("task {}: could not release claimant: {e}", self.task);
                }
            }
        }
    }

    fn reset(&mut self) {
        self.state = DragState::Idle;
        self.aborted = false;
        self.claimant = None;
        self.last_claim_ref = 0;
        self.last_dragging_ref = 0;
        self.pointer_shape_changed = false;
        self.box_suppressed = false;
        self.shift_at_start = false;
        self.from_selection = false;
        self.kinds.clear();
        self.bbox = None;
        self.handler = None;
    }
}
