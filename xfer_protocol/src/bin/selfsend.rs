// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Loopback transfer demo: two tasks on one desk, one payload across the
//! full protocol, byte-for-byte verified at the end.

use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;

use clap::Parser;
use log::*;

use xfer_protocol::desk::{Desk, DeskScheduler};
use xfer_protocol::receiver::ReceiveHandler;
use xfer_protocol::sender::{SendHandler, SendOutcome};
use xfer_protocol::wire::{Body, FileOffer};
use xfer_protocol::FileKind;

#[derive(Parser)]
struct Cli {
    /// Payload size in bytes.
    #[arg(long, default_value_t = 600)]
    size: usize,

    /// Force the scrap-file fallback instead of memory transfer.
    #[arg(long)]
    via_file: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let mut desk = Desk::new();
    let mut sched = DeskScheduler::new();

    let sender_task = desk.register_task();
    let receiver_task = desk.register_task();
    desk.claim_window(1, receiver_task);

    let payload = patterned_bytes(args.size);
    let data = desk.alloc_data(&payload)?;

    let outcome: Rc<RefCell<Option<SendOutcome>>> = Rc::new(RefCell::new(None));
    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));

    let offer = FileOffer {
        window: 1,
        icon: 0,
        x: 0,
        y: 0,
        size: 0,
        kind: FileKind::DATA,
        leaf: "payload".to_string(),
    };

    let outcome_slot = outcome.clone();
    desk.send_data(
        sender_task,
        None,
        &offer,
        data,
        0,
        payload.len() as u64,
        None,
        SendHandler {
            on_finished: Box::new(move |o| {
                *outcome_slot.borrow_mut() = Some(o);
            }),
        },
    )?;

    for round in 0.. {
        if round > 100 {
            return Err("transfer did not settle".into());
        }

        for (task, msg) in desk.pump(&mut sched) {
            if task == receiver_task && matches!(msg.body, Body::OfferData(_)) {
                info!("offer arrived, accepting");
                let received_slot = received.clone();
                desk.receive_data(
                    &mut sched,
                    receiver_task,
                    &msg,
                    ReceiveHandler {
                        on_data: Box::new(move |reader, info| {
                            let mut bytes = Vec::with_capacity(info.size_hint as usize);
                            if reader.read_to_end(&mut bytes).is_err() {
                                return false;
                            }
                            *received_slot.borrow_mut() = Some(bytes);
                            true
                        }),
                        on_fail: Box::new(|e| {
                            error!("receive failed: {e:?}");
                        }),
                        tag: 1,
                        prefer_file: args.via_file,
                    },
                )?;
            }
        }

        sched.run(&mut desk);

        if outcome.borrow().is_some() && received.borrow().is_some() {
            break;
        }
    }

    let outcome = outcome.borrow_mut().take().unwrap();
    let received = received.borrow_mut().take().unwrap();

    if !outcome.success {
        let reason = match &outcome.error {
            Some(e) => desk.tokens.block_for(e).message,
            None => "cancelled".to_string(),
        };
        return Err(format!("send failed: {reason}").into());
    }
    if received != payload {
        return Err("payload mismatch".into());
    }

    println!(
        "transferred {} bytes via the {} path",
        received.len(),
        if args.via_file { "scrap-file" } else { "memory" },
    );
    Ok(())
}

/// Deterministic pseudo-random payload so runs are reproducible.
fn patterned_bytes(size: usize) -> Vec<u8> {
    let mut state = 0x2545_f491u32;
    (0..size)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}
