// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Scripted drag between two tasks: one drags, the other claims, the user
//! releases, and the drop resolves to the best shared kind.

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use log::*;

use scheduler::{NullTimer, TestClock};
use xfer_protocol::bus::{Delivery, Dest, PointerInfo};
use xfer_protocol::desk::{Desk, DeskScheduler};
use xfer_protocol::drag::{DragHandler, DropInfo};
use xfer_protocol::wire::{claim_flags, Body, ClaimInfo};
use xfer_protocol::{FileKind, TaskId, DRAG_POLL_CS};

#[derive(Parser)]
struct Cli {
    /// Drag position broadcasts before the user "releases".
    #[arg(long, default_value_t = 4)]
    rounds: u32,

    /// Claim with the remove-drag-box flag set.
    #[arg(long)]
    claimant_draws: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let clock = TestClock::new();
    let mut desk = Desk::new();
    let mut sched =
        DeskScheduler::with_parts(Box::new(clock.clone()), Box::new(NullTimer));

    let dragger = desk.register_task();
    let claimant = desk.register_task();
    desk.claim_window(7, claimant);
    desk.set_pointer(PointerInfo {
        window: 7,
        icon: 2,
        x: 120,
        y: 340,
        shift_held: false,
    });

    let drop: Rc<RefCell<Option<DropInfo>>> = Rc::new(RefCell::new(None));
    let drop_slot = drop.clone();

    desk.start_drag(
        &mut sched,
        dragger,
        &[FileKind::TEXT, FileKind::DATA],
        None,
        false,
        DragHandler {
            on_drag_box: Box::new(|op, solid, x, y| {
                info!("drag box: {op:?} (solid {solid}) at {x},{y}");
                Ok(())
            }),
            on_drop: Some(Box::new(move |info| {
                *drop_slot.borrow_mut() = Some(info.clone());
                true
            })),
        },
    )?;

    let flags = if args.claimant_draws {
        claim_flags::REMOVE_DRAG_BOX
    } else {
        0
    };

    for _ in 0..args.rounds {
        clock.advance(DRAG_POLL_CS);
        sched.run(&mut desk);
        answer_dragging(&mut desk, &mut sched, claimant, dragger, flags)?;
        desk.pump(&mut sched); // the claim reaches the drag engine
    }

    info!("user releases the drag");
    desk.end_drag(&mut sched, dragger)?;
    answer_dragging(&mut desk, &mut sched, claimant, dragger, flags)?;
    desk.pump(&mut sched);

    let drop = drop
        .borrow_mut()
        .take()
        .ok_or("the drop never resolved")?;
    println!(
        "drop on window {} icon {} resolved to kind {} (claimant task {:?})",
        drop.window, drop.icon, drop.kind, drop.claimant,
    );
    Ok(())
}

/// The claimant's side of the handshake: answer every Dragging it sees with
/// a claim accepting DATA only.
fn answer_dragging(
    desk: &mut Desk,
    sched: &mut DeskScheduler,
    claimant: TaskId,
    dragger: TaskId,
    flags: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    for (task, msg) in desk.pump(sched) {
        if task == claimant && matches!(msg.body, Body::Dragging(_)) {
            desk.send_raw(
                claimant,
                Dest::Task(dragger),
                msg.my_ref,
                Body::DragClaim(ClaimInfo {
                    flags,
                    kinds: vec![FileKind::DATA],
                }),
                Delivery::Plain,
            )?;
        }
    }
    Ok(())
}
