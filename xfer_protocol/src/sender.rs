// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The sending half of the transfer protocol.
//!
//! [`Sender::send_data`] offers a client-owned span of heap data to a peer
//! with a recorded `OfferData`. The peer then either pulls the data through
//! memory (served here push by push) or acknowledges with a scrap-file path
//! for us to write. The client keeps ownership of the source block
//! throughout; a client about to invalidate it must call
//! [`Sender::cancel_sends`] first.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::*;

use packheap::{Allocator, Anchor};

use crate::bus::{Claim, Delivery, Dest, Env};
use crate::fs::FileSystem;
use crate::ops::{OpId, OpTable, RefBook};
use crate::wire::{Action, Body, FileOffer, MemorySpan, Message};
use crate::{FileKind, TaskId, XferError};

/// How a send ended. `destination` is only reported when the receiver said
/// its path was a real location rather than a scratch name.
#[derive(Debug)]
pub struct SendOutcome {
    pub success: bool,
    pub error: Option<XferError>,
    pub destination: Option<PathBuf>,
    pub offer_ref: u32,
}

pub type FinishedFn = Box<dyn FnMut(SendOutcome)>;

/// Client-supplied writer that replaces the default scrap-file write. Its
/// presence also disables memory transfer for the operation, since the data
/// may not exist as plain bytes until saved.
pub type SaveFn =
    Box<dyn FnMut(&mut dyn FileSystem, &dyn Allocator, &Path, Anchor, u64, u64) -> Result<(), XferError>>;

pub struct SendHandler {
    pub on_finished: FinishedFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    AwaitReply,
    MemoryPushLoop,
    AwaitFileLoadAck,
}

struct SendOp {
    refs: RefBook,
    original_offer_ref: u32,
    destination_safe: bool,
    data: Anchor,
    start: u64,
    end: u64,
    cursor: u64,
    save_fn: Option<SaveFn>,
    handler: SendHandler,
    state: SendState,
    scrap_path: Option<PathBuf>,
    kind: FileKind,
}

pub struct Sender {
    task: TaskId,
    ops: OpTable<SendOp>,
}

impl Sender {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            ops: OpTable::new(),
        }
    }

    pub fn live_ops(&self) -> usize {
        self.ops.len()
    }

    /// Offer `[start..end)` of `data` to a peer. `peer` of `None` addresses
    /// the window and icon named in `offer` instead of a task directly.
    ///
    /// On `Err` no operation was created and no callback will fire.
    #[allow(clippy::too_many_arguments)]
    pub fn send_data(
        &mut self,
        env: &mut Env,
        peer: Option<TaskId>,
        offer: &FileOffer,
        data: Anchor,
        start: u64,
        end: u64,
        save_fn: Option<SaveFn>,
        handler: SendHandler,
    ) -> Result<OpId, XferError> {
        let total = env.heap.size_of(data).ok_or(XferError::BufferOverflow)? as u64;
        if start > end || end > total {
            return Err(XferError::BufferOverflow);
        }
        let estimated =
            i32::try_from(end - start).map_err(|_| XferError::BufferOverflow)?;

        let dest = match peer {
            Some(task) => Dest::Task(task),
            None => Dest::Window {
                window: offer.window,
                icon: offer.icon,
            },
        };
        let body = Body::OfferData(FileOffer {
            size: estimated,
            ..offer.clone()
        });
        let sent = env.host.send(dest, 0, body, Delivery::Recorded)?;

        let mut refs = RefBook::new();
        refs.note(sent, Action::OfferData);

        let id = self.ops.insert(SendOp {
            refs,
            original_offer_ref: sent,
            destination_safe: false,
            data,
            start,
            end,
            cursor: start,
            save_fn,
            handler,
            state: SendState::AwaitReply,
            scrap_path: None,
            kind: offer.kind,
        })?;

        debug!(
            "task {}: offering '{}' ({} bytes)",
            self.task,
            offer.leaf,
            end - start
        );
        Ok(id)
    }

    /// Offer an inbound message to this engine.
    pub fn handle(&mut self, env: &mut Env, msg: &Message) -> Claim {
        match &msg.body {
            Body::ScrapAck(ack) => self.handle_scrap_ack(env, msg, ack),
            Body::MemoryPull(span) => self.handle_pull(env, msg, *span),
            Body::FileLoadAck(_) => self.handle_load_ack(msg),
            _ => Claim::Pass,
        }
    }

    fn handle_scrap_ack(&mut self, env: &mut Env, msg: &Message, ack: &FileOffer) -> Claim {
        let Some(id) = self.ops.find(|op| {
            op.state == SendState::AwaitReply
                && op.refs.matches_reply(msg.your_ref, Action::OfferData)
        }) else {
            return Claim::Pass;
        };

        let op = self.ops.get_mut(id).expect("just found");
        // −1 marks a scratch name the receiver does not want reported back.
        op.destination_safe = ack.size != -1;
        let safe = op.destination_safe;
        let path = PathBuf::from(&ack.leaf);

        let written = match op.save_fn.as_mut() {
            Some(save) => save(env.fs, &*env.heap, &path, op.data, op.start, op.end),
            None => default_save(env, &path, op.data, op.start, op.end, op.kind),
        };
        if let Err(e) = written {
            if !safe {
                let _ = env.fs.delete(&path);
            }
            self.conclude_failure(env, id, Some(e));
            return Claim::Claimed;
        }

        // Reuse the acknowledged offer as the file-load announcement: same
        // destination, actual size, the path we just wrote.
        let size = (op.end - op.start) as i32;
        let body = Body::FileLoad(FileOffer {
            window: ack.window,
            icon: ack.icon,
            x: ack.x,
            y: ack.y,
            size,
            kind: op.kind,
            leaf: ack.leaf.clone(),
        });
        match env
            .host
            .send(Dest::Task(msg.sender), msg.my_ref, body, Delivery::Recorded)
        {
            Ok(sent) => {
                op.refs.note(sent, Action::FileLoad);
                op.state = SendState::AwaitFileLoadAck;
                op.scrap_path = Some(path);
                trace!("task {}: scrap written, file load sent", self.task);
            }
            Err(e) => {
                if !safe {
                    let _ = env.fs.delete(&path);
                }
                self.conclude_failure(env, id, Some(e));
            }
        }
        Claim::Claimed
    }

    fn handle_pull(&mut self, env: &mut Env, msg: &Message, span: MemorySpan) -> Claim {
        let Some(id) = self.ops.find(|op| {
            (op.state == SendState::AwaitReply
                && op.refs.matches_reply(msg.your_ref, Action::OfferData))
                || (op.state == SendState::MemoryPushLoop
                    && op.refs.matches_reply(msg.your_ref, Action::MemoryPush))
        }) else {
            return Claim::Pass;
        };

        // A custom writer means the data may not exist as bytes yet; decline
        // memory transfer and let the pull bounce back to the receiver.
        if self.ops.get(id).expect("just found").save_fn.is_some() {
            return Claim::Pass;
        }

        let op = self.ops.get_mut(id).expect("just found");
        let remaining = op.end - op.cursor;
        let n = remaining.min(span.len as u64);

        // The peer's buffer address is only valid while the heap cannot
        // compact underneath the copy.
        if let Err(e) = env.pins.pin(env.heap, None) {
            self.conclude_failure(env, id, Some(e.into()));
            return Claim::Claimed;
        }
        let copied = copy_span(
            env.heap,
            op.data,
            op.cursor,
            Anchor::from_raw(span.anchor),
            span.offset as u64,
            n,
        );
        env.pins.unpin(env.heap);

        if let Err(e) = copied {
            self.conclude_failure(env, id, Some(e));
            return Claim::Claimed;
        }
        op.cursor += n;

        let push = Body::MemoryPush(MemorySpan {
            anchor: span.anchor,
            offset: span.offset,
            len: n as u32,
        });

        if op.cursor == op.end {
            // Last frame: unrecorded, the protocol ends here for us.
            if let Err(e) = env
                .host
                .send(Dest::Task(msg.sender), msg.my_ref, push, Delivery::Plain)
            {
                self.conclude_failure(env, id, Some(e));
                return Claim::Claimed;
            }
            let mut op = self.ops.remove(id).expect("just found");
            trace!("task {}: memory transfer complete", self.task);
            (op.handler.on_finished)(SendOutcome {
                success: true,
                error: None,
                destination: None,
                offer_ref: op.original_offer_ref,
            });
        } else {
            match env
                .host
                .send(Dest::Task(msg.sender), msg.my_ref, push, Delivery::Recorded)
            {
                Ok(sent) => {
                    op.refs.note(sent, Action::MemoryPush);
                    op.state = SendState::MemoryPushLoop;
                }
                Err(e) => self.conclude_failure(env, id, Some(e)),
            }
        }
        Claim::Claimed
    }

    fn handle_load_ack(&mut self, msg: &Message) -> Claim {
        let Some(id) = self.ops.find(|op| {
            op.state == SendState::AwaitFileLoadAck
                && op.refs.matches_reply(msg.your_ref, Action::FileLoad)
        }) else {
            return Claim::Pass;
        };

        let mut op = self.ops.remove(id).expect("just found");
        let destination = if op.destination_safe {
            op.scrap_path.take()
        } else {
            None
        };
        debug!("task {}: file handoff acknowledged", self.task);
        (op.handler.on_finished)(SendOutcome {
            success: true,
            error: None,
            destination,
            offer_ref: op.original_offer_ref,
        });
        Claim::Claimed
    }

    /// Offer a bounce of one of our recorded sends to this engine.
    pub fn handle_bounce(&mut self, env: &mut Env, my_ref: u32, action: Action) -> Claim {
        let expected_state = match action {
            Action::OfferData => SendState::AwaitReply,
            Action::MemoryPush => SendState::MemoryPushLoop,
            Action::FileLoad => SendState::AwaitFileLoadAck,
            _ => return Claim::Pass,
        };
        let Some(id) = self
            .ops
            .find(|op| op.state == expected_state && op.refs.matches_bounce(my_ref, action))
        else {
            return Claim::Pass;
        };

        let error = match action {
            // Nobody was interested in the offer at all; that is not an
            // error worth a message box.
            Action::OfferData => None,
            _ => Some(XferError::ReceiverDied),
        };
        self.conclude_failure(env, id, error);
        Claim::Claimed
    }

    /// Abort every operation reading from `data`, leaving the block itself
    /// untouched. The call for a client about to invalidate its buffer.
    pub fn cancel_sends(&mut self, env: &mut Env, data: Anchor) {
        for id in self.ops.ids() {
            if self.ops.get(id).map_or(false, |op| op.data == data) {
                self.conclude_failure(env, id, None);
            }
        }
    }

    /// Cancel everything outstanding.
    pub fn finalise(&mut self, env: &mut Env) {
        for id in self.ops.ids() {
            self.conclude_failure(env, id, None);
        }
    }

    fn conclude_failure(&mut self, env: &mut Env, id: OpId, error: Option<XferError>) {
        let Some(mut op) = self.ops.remove(id) else {
            return;
        };

        // A scrap we wrote to a scratch name is ours to clean up for as long
        // as no FileLoadAck arrived.
        if !op.destination_safe {
            if let Some(path) = op.scrap_path.take() {
                if let Err(e) = env.fs.delete(&path) {
                    warn!("could not remove scrap file '{}': {e}", path.display());
                }
            }
        }

        (op.handler.on_finished)(SendOutcome {
            success: false,
            error,
            destination: None,
            offer_ref: op.original_offer_ref,
        });
    }
}

/// Default scrap write: stream `[start..end)` of `data` to `path` and stamp
/// the file's kind.
fn default_save(
    env: &mut Env,
    path: &Path,
    data: Anchor,
    start: u64,
    end: u64,
    kind: FileKind,
) -> Result<(), XferError> {
    env.fs.create_dirs_for(path)?;
    let mut out = env.fs.open_write(path)?;

    let mut buf = [0u8; 8192];
    let mut done = 0u64;
    while done < end - start {
        let n = buf.len().min((end - start - done) as usize);
        env.heap
            .read(data, (start + done) as usize, &mut buf[..n])?;
        out.write_all(&buf[..n])
            .map_err(|_| XferError::WriteFail(path.to_path_buf()))?;
        done += n as u64;
    }
    out.flush()
        .map_err(|_| XferError::WriteFail(path.to_path_buf()))?;
    drop(out);

    if let Some(kind) = kind.normalised() {
        env.fs.set_kind(path, kind)?;
    }
    Ok(())
}

fn copy_span(
    heap: &mut dyn Allocator,
    src: Anchor,
    src_off: u64,
    dst: Anchor,
    dst_off: u64,
    len: u64,
) -> Result<(), XferError> {
    let mut buf = [0u8; 8192];
    let mut done = 0u64;
    while done < len {
        let n = buf.len().min((len - done) as usize);
        heap.read(src, (src_off + done) as usize, &mut buf[..n])?;
        heap.write(dst, (dst_off + done) as usize, &buf[..n])?;
        done += n as u64;
    }
    Ok(())
}
