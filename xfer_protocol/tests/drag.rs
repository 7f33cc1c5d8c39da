// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Drag, claim and drop scenarios over the loopback desk.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::*;

use xfer_protocol::bus::{Delivery, Dest, PointerInfo};
use xfer_protocol::drag::{DragBoxOp, DragHandler, DropInfo};
use xfer_protocol::wire::{claim_flags, drag_flags, Body, ClaimInfo, Message};
use xfer_protocol::{FileKind, TaskId, XferError, DRAG_POLL_CS};

const K1: FileKind = FileKind(0x111);
const K2: FileKind = FileKind(0x222);
const K3: FileKind = FileKind(0x333);

/// Records drag-box operations and the terminal drop.
#[derive(Clone, Default)]
struct DragProbe {
    box_ops: Rc<RefCell<Vec<DragBoxOp>>>,
    drops: Rc<RefCell<Vec<DropInfo>>>,
    accept_drop: Rc<RefCell<bool>>,
    fail_box_start: Rc<RefCell<bool>>,
}

impl DragProbe {
    fn new() -> Self {
        let probe = Self::default();
        *probe.accept_drop.borrow_mut() = true;
        probe
    }

    fn handler(&self) -> DragHandler {
        let box_ops = self.box_ops.clone();
        let fail_start = self.fail_box_start.clone();
        let drops = self.drops.clone();
        let accept = self.accept_drop.clone();
        DragHandler {
            on_drag_box: Box::new(move |op, _solid, _x, _y| {
                if op == DragBoxOp::Start && *fail_start.borrow() {
                    return Err(XferError::Host(std::io::Error::other("no box")));
                }
                box_ops.borrow_mut().push(op);
                Ok(())
            }),
            on_drop: Some(Box::new(move |info| {
                drops.borrow_mut().push(info.clone());
                *accept.borrow()
            })),
        }
    }

    fn box_ops(&self) -> Vec<DragBoxOp> {
        self.box_ops.borrow().clone()
    }

    fn drops(&self) -> Vec<DropInfo> {
        self.drops.borrow().clone()
    }
}

fn dragging_for(deliveries: &[(TaskId, Message)], task: TaskId) -> Vec<Message> {
    deliveries
        .iter()
        .filter(|(t, m)| *t == task && matches!(m.body, Body::Dragging(_)))
        .map(|(_, m)| m.clone())
        .collect()
}

fn pointer_over(window: i32, icon: i32, shift: bool) -> PointerInfo {
    PointerInfo {
        window,
        icon,
        x: 64,
        y: 128,
        shift_held: shift,
    }
}

fn claim(
    h: &mut Harness,
    from: TaskId,
    to: TaskId,
    your_ref: u32,
    flags: u32,
    kinds: &[FileKind],
) -> u32 {
    h.desk
        .send_raw(
            from,
            Dest::Task(to),
            your_ref,
            Body::DragClaim(ClaimInfo {
                flags,
                kinds: kinds.to_vec(),
            }),
            Delivery::Plain,
        )
        .unwrap()
}

/// One drag-poll interval: advance the clock and run the scheduler.
fn tick(h: &mut Harness) {
    h.clock.advance(DRAG_POLL_CS);
    h.idle();
}

#[test]
fn s5_claim_then_drop_resolves_best_kind() {
    let mut h = Harness::new();
    let a = h.desk.register_task();
    let b = h.desk.register_task();
    h.desk.claim_window(7, b);
    h.desk.set_pointer(pointer_over(7, 3, true));

    let probe = DragProbe::new();
    h.desk
        .start_drag(&mut h.sched, a, &[K1, K2], None, false, probe.handler())
        .unwrap();
    assert_eq!(probe.box_ops(), vec![DragBoxOp::Start]);

    // First broadcast goes unrecorded to the window under the pointer.
    tick(&mut h);
    let deliveries = h.pump();
    let first = dragging_for(&deliveries, b).pop().expect("broadcast");
    assert_eq!(first.your_ref, 0);

    // The peer claims, accepting K2 and K3.
    let claim_ref = claim(&mut h, b, a, first.my_ref, 0, &[K2, K3]);
    h.pump();

    // Subsequent updates go recorded to the claimant, quoting its claim.
    tick(&mut h);
    let deliveries = h.pump();
    let to_claimant = dragging_for(&deliveries, b).pop().expect("recorded update");
    assert_eq!(to_claimant.your_ref, claim_ref);

    // The claimant answers, which re-arms the next update.
    claim(&mut h, b, a, to_claimant.my_ref, 0, &[K2, K3]);
    h.pump();

    // The user releases: one final recorded Dragging to the claimant.
    h.desk.end_drag(&mut h.sched, a).unwrap();
    assert_eq!(probe.box_ops(), vec![DragBoxOp::Start, DragBoxOp::Cancel]);

    let deliveries = h.pump();
    let last = dragging_for(&deliveries, b).pop().expect("final dragging");
    assert!(!last.flags_do_not_claim());

    // The post-drop claim resolves the drop to K2: K1 is not accepted, K2 is
    // and sits earlier than K3 in our preference order.
    claim(&mut h, b, a, last.my_ref, 0, &[K2]);
    h.pump();

    let drops = probe.drops();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].kind, K2);
    assert_eq!(drops[0].claimant, Some(b));
    assert_ne!(drops[0].claimant_ref, 0);
    assert_eq!(drops[0].window, 7);
    assert_eq!(drops[0].icon, 3);
    assert!(drops[0].shift_held, "modifier state from the start of the drag");
    assert!(h.sched.is_empty(), "poll callback gone after the drop");

    // A straggling claim after the conclusion is stale.
    claim(&mut h, b, a, last.my_ref, 0, &[K2]);
    h.pump();
    assert_eq!(probe.drops().len(), 1);
}

#[test]
fn s6_unclaimed_drop_bounces_to_first_kind() {
    let mut h = Harness::new();
    let a = h.desk.register_task();
    let b = h.desk.register_task();
    h.desk.claim_window(7, b);
    h.desk.set_pointer(pointer_over(7, 1, false));

    let probe = DragProbe::new();
    h.desk
        .start_drag(&mut h.sched, a, &[K1], None, false, probe.handler())
        .unwrap();

    // Broadcasts happen but nobody claims.
    tick(&mut h);
    h.pump();

    h.desk.end_drag(&mut h.sched, a).unwrap();
    h.pump(); // the final recorded Dragging reaches the application
    h.pump(); // unanswered, it bounces back

    let drops = probe.drops();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].kind, K1);
    assert_eq!(drops[0].claimant, None);
    assert_eq!(drops[0].claimant_ref, 0);
    assert!(!drops[0].shift_held);
    assert!(h.sched.is_empty());
}

#[test]
fn claimant_can_hide_and_restore_the_drag_box() {
    let mut h = Harness::new();
    let a = h.desk.register_task();
    let b = h.desk.register_task();
    h.desk.claim_window(7, b);
    h.desk.set_pointer(pointer_over(7, 0, false));

    let probe = DragProbe::new();
    h.desk
        .start_drag(&mut h.sched, a, &[K1], None, false, probe.handler())
        .unwrap();

    tick(&mut h);
    let deliveries = h.pump();
    let first = dragging_for(&deliveries, b).pop().unwrap();

    // Claim with remove-drag-box: the box is hidden once, not per claim.
    claim(&mut h, b, a, first.my_ref, claim_flags::REMOVE_DRAG_BOX, &[K1]);
    h.pump();
    assert_eq!(probe.box_ops(), vec![DragBoxOp::Start, DragBoxOp::Hide]);

    tick(&mut h);
    let deliveries = h.pump();
    let next = dragging_for(&deliveries, b).pop().unwrap();
    claim(&mut h, b, a, next.my_ref, claim_flags::REMOVE_DRAG_BOX, &[K1]);
    h.pump();
    assert_eq!(probe.box_ops(), vec![DragBoxOp::Start, DragBoxOp::Hide]);

    // The claimant stops drawing its own feedback: the box comes back.
    tick(&mut h);
    let deliveries = h.pump();
    let next = dragging_for(&deliveries, b).pop().unwrap();
    claim(&mut h, b, a, next.my_ref, 0, &[K1]);
    h.pump();
    assert_eq!(
        probe.box_ops(),
        vec![DragBoxOp::Start, DragBoxOp::Hide, DragBoxOp::Start]
    );
}

#[test]
fn dead_claimant_reverts_to_broadcasting() {
    let mut h = Harness::new();
    let a = h.desk.register_task();
    let b = h.desk.register_task();
    h.desk.claim_window(7, b);
    h.desk.set_pointer(pointer_over(7, 0, false));

    let probe = DragProbe::new();
    h.desk
        .start_drag(&mut h.sched, a, &[K1], None, false, probe.handler())
        .unwrap();

    tick(&mut h);
    let deliveries = h.pump();
    let first = dragging_for(&deliveries, b).pop().unwrap();
    claim(
        &mut h,
        b,
        a,
        first.my_ref,
        claim_flags::POINTER_SHAPE_CHANGED | claim_flags::REMOVE_DRAG_BOX,
        &[K1],
    );
    h.pump();

    // The next recorded update to the claimant goes unanswered.
    tick(&mut h);
    h.pump(); // delivered, application ignores it
    h.pump(); // bounce: the claimant is gone

    // Its effects are undone: pointer reset, drag box restored.
    assert_eq!(h.desk.pointer_resets(), 1);
    assert_eq!(
        probe.box_ops(),
        vec![DragBoxOp::Start, DragBoxOp::Hide, DragBoxOp::Start]
    );

    // Updates broadcast again, unrecorded to the window under the pointer.
    tick(&mut h);
    let deliveries = h.pump();
    let again = dragging_for(&deliveries, b).pop().expect("broadcast resumed");
    assert_eq!(again.your_ref, 0);

    assert!(probe.drops().is_empty(), "no drop from a mid-drag death");
}

#[test]
fn declined_drop_releases_the_claimant() {
    let mut h = Harness::new();
    let a = h.desk.register_task();
    let b = h.desk.register_task();
    h.desk.claim_window(7, b);
    h.desk.set_pointer(pointer_over(7, 0, false));

    let probe = DragProbe::new();
    *probe.accept_drop.borrow_mut() = false;
    h.desk
        .start_drag(&mut h.sched, a, &[K1], None, false, probe.handler())
        .unwrap();

    tick(&mut h);
    let deliveries = h.pump();
    let first = dragging_for(&deliveries, b).pop().unwrap();
    claim(&mut h, b, a, first.my_ref, 0, &[K1]);
    h.pump();

    h.desk.end_drag(&mut h.sched, a).unwrap();
    let deliveries = h.pump();
    let last = dragging_for(&deliveries, b).pop().expect("final dragging");
    claim(&mut h, b, a, last.my_ref, 0, &[K1]);

    let deliveries = h.pump();
    assert_eq!(probe.drops().len(), 1);

    // The client said no, so the claimant is told to stand down.
    let release = dragging_for(&deliveries, b)
        .into_iter()
        .find(|m| m.flags_do_not_claim())
        .expect("do-not-claim sent");
    assert_ne!(release.your_ref, 0);
}

#[test]
fn abort_runs_the_finished_sequence_and_still_drops_once() {
    let mut h = Harness::new();
    let a = h.desk.register_task();
    let b = h.desk.register_task();
    h.desk.claim_window(7, b);
    h.desk.set_pointer(pointer_over(7, 0, false));

    let probe = DragProbe::new();
    h.desk
        .start_drag(&mut h.sched, a, &[K1], None, false, probe.handler())
        .unwrap();

    // Starting again while active is refused.
    let again = DragProbe::new();
    assert!(matches!(
        h.desk
            .start_drag(&mut h.sched, a, &[K2], None, false, again.handler()),
        Err(XferError::DragInProgress)
    ));

    h.desk.abort_drag(&mut h.sched, a).unwrap();
    assert_eq!(probe.box_ops(), vec![DragBoxOp::Start, DragBoxOp::Cancel]);
    assert!(h.sched.is_empty(), "poll callback deregistered");

    // The final recorded Dragging still goes out, exactly as for a release.
    let deliveries = h.pump();
    let last = dragging_for(&deliveries, b).pop().expect("final dragging");
    assert!(!last.flags_do_not_claim());

    // Unanswered, it bounces, and the one terminal on_drop arrives.
    h.pump();
    let drops = probe.drops();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].kind, K1);
    assert_eq!(drops[0].claimant, None);

    // Aborting again is a tolerated no-op, and a fresh drag can start.
    h.desk.abort_drag(&mut h.sched, a).unwrap();
    assert_eq!(probe.drops().len(), 1);
    let fresh = DragProbe::new();
    h.desk
        .start_drag(&mut h.sched, a, &[K2], None, false, fresh.handler())
        .unwrap();
}

#[test]
fn failed_drag_box_start_unwinds_registration() {
    let mut h = Harness::new();
    let a = h.desk.register_task();
    let b = h.desk.register_task();
    h.desk.claim_window(7, b);

    let probe = DragProbe::new();
    *probe.fail_box_start.borrow_mut() = true;
    assert!(h
        .desk
        .start_drag(&mut h.sched, a, &[K1], None, false, probe.handler())
        .is_err());
    assert!(h.sched.is_empty(), "no poll callback left behind");

    tick(&mut h);
    assert!(dragging_for(&h.pump(), b).is_empty());

    // The engine is back at idle and accepts a new drag.
    *probe.fail_box_start.borrow_mut() = false;
    h.desk
        .start_drag(&mut h.sched, a, &[K1], None, false, probe.handler())
        .unwrap();
}

/// Flag accessor used by the assertions above.
trait DraggingFlags {
    fn flags_do_not_claim(&self) -> bool;
}

impl DraggingFlags for Message {
    fn flags_do_not_claim(&self) -> bool {
        match &self.body {
            Body::Dragging(d) => d.flags & drag_flags::DO_NOT_CLAIM != 0,
            _ => false,
        }
    }
}
