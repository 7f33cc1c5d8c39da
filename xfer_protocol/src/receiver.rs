// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The receiving half of the transfer protocol.
//!
//! An operation starts when the application accepts an inbound data offer
//! via [`Receiver::receive_data`]. Negotiation prefers memory pushes through
//! the shared heap (a recorded `MemoryPull` per buffer window, geometric
//! growth between windows); a bounced pull from a peer that never pushed
//! switches the operation to the scrap-file fallback. Every operation ends
//! in exactly one client callback: `on_data` with the received bytes, or
//! `on_fail`.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use log::*;

use packheap::Anchor;

use crate::bus::{Claim, Delivery, Dest, Env, TimerKey};
use crate::helpers::AnchorReader;
use crate::ops::{OpId, OpTable, RefBook};
use crate::wire::{Action, Body, FileOffer, MemorySpan, Message};
use crate::{ClientTag, FileKind, TaskId, XferError, DEFAULT_BUF, RECV_DEADLINE_CS};

/// What `on_data` learns about the transfer it is consuming.
#[derive(Debug, Clone)]
pub struct OfferInfo {
    pub size_hint: u64,
    pub kind: Option<FileKind>,
    pub leaf: String,
}

pub type DataFn = Box<dyn FnMut(&mut dyn Read, &OfferInfo) -> bool>;
pub type FailFn = Box<dyn FnMut(Option<XferError>)>;

/// Client half of a receive operation. `on_data` is handed a finite,
/// non-restartable reader and returns whether it consumed the data; `on_fail`
/// receives `None` for cancellation and timeout, `Some` for real errors.
/// `tag` groups operations for [`Receiver::cancel_receives`]; `prefer_file`
/// forces the scrap-file path even for kinds that could travel by memory.
pub struct ReceiveHandler {
    pub on_data: DataFn,
    pub on_fail: FailFn,
    pub tag: ClientTag,
    pub prefer_file: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    AwaitMemoryPush,
    FallbackAwaitFile,
}

struct RecvOp {
    refs: RefBook,
    state: RecvState,
    bytes_received: u64,
    peer_supports_memory: bool,
    pin_held: bool,
    buffer: Option<Anchor>,
    capacity: u64,
    handler: ReceiveHandler,
    origin: TaskId,
    /// `my_ref` of the original offer; quoted again if we fall back.
    offer_ref: u32,
    offer: FileOffer,
    kind: Option<FileKind>,
}

pub struct Receiver {
    task: TaskId,
    ops: OpTable<RecvOp>,
}

impl Receiver {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            ops: OpTable::new(),
        }
    }

    pub fn live_ops(&self) -> usize {
        self.ops.len()
    }

    /// Accept an offered transfer and start negotiating. `origin` and
    /// `offer_ref` identify the offer message; `offer` is its body.
    ///
    /// On `Err` no operation was created and no callback will fire.
    pub fn receive_data(
        &mut self,
        env: &mut Env,
        origin: TaskId,
        offer_ref: u32,
        offer: &FileOffer,
        handler: ReceiveHandler,
    ) -> Result<OpId, XferError> {
        let kind = offer.kind.normalised();
        let use_memory = kind.map_or(true, |k| k.supports_memory()) && !handler.prefer_file;
        let estimated = offer.size.max(0) as u64;

        let mut buffer = None;
        let mut capacity = 0u64;

        let (sent_ref, sent_kind, state) = if use_memory {
            // One byte beyond the estimate, so an exact estimate completes in
            // a single push instead of needing a zero-length second round.
            capacity = DEFAULT_BUF.max(estimated + 1);
            let anchor = env.heap.alloc(capacity as usize)?;

            let span = MemorySpan {
                anchor: anchor.to_raw(),
                offset: 0,
                len: capacity as u32,
            };
            let sent = match env.host.send(
                Dest::Task(origin),
                offer_ref,
                Body::MemoryPull(span),
                Delivery::Recorded,
            ) {
                Ok(r) => r,
                Err(e) => {
                    env.heap.free(anchor);
                    return Err(e);
                }
            };

            // The peer will write straight into our block; hold off the
            // compactor until the operation settles.
            if let Err(e) = env.pins.pin(env.heap, None) {
                env.heap.free(anchor);
                return Err(e.into());
            }

            buffer = Some(anchor);
            (sent, Action::MemoryPull, RecvState::AwaitMemoryPush)
        } else {
            let scratch = env.fs.scratch_path();
            let ack = FileOffer {
                window: offer.window,
                icon: offer.icon,
                x: offer.x,
                y: offer.y,
                size: -1,
                kind: offer.kind,
                leaf: scratch.display().to_string(),
            };
            let sent = env.host.send(
                Dest::Task(origin),
                offer_ref,
                Body::ScrapAck(ack),
                Delivery::Plain,
            )?;
            (sent, Action::ScrapAck, RecvState::FallbackAwaitFile)
        };

        let mut refs = RefBook::new();
        refs.note(sent_ref, sent_kind);
        let pin_held = use_memory;

        let op = RecvOp {
            refs,
            state,
            bytes_received: 0,
            peer_supports_memory: false,
            pin_held,
            buffer,
            capacity,
            handler,
            origin,
            offer_ref,
            offer: offer.clone(),
            kind,
        };

        let id = match self.ops.insert(op) {
            Ok(id) => id,
            Err(e) => {
                if pin_held {
                    env.pins.unpin(env.heap);
                }
                if let Some(anchor) = buffer {
                    env.heap.free(anchor);
                }
                return Err(e);
            }
        };

        env.timers.set(TimerKey::RecvDeadline(id), RECV_DEADLINE_CS);
        debug!(
            "task {}: receiving '{}' from task {origin} ({} path)",
            self.task,
            offer.leaf,
            if use_memory { "memory" } else { "file" }
        );
        Ok(id)
    }

    /// Offer an inbound message to this engine.
    pub fn handle(&mut self, env: &mut Env, msg: &Message) -> Claim {
        match &msg.body {
            Body::MemoryPush(span) => self.handle_push(env, msg, *span),
            Body::FileLoad(load) => self.handle_file_load(env, msg, load),
            _ => Claim::Pass,
        }
    }

    fn handle_push(&mut self, env: &mut Env, msg: &Message, span: MemorySpan) -> Claim {
        let Some(id) = self.ops.find(|op| {
            op.state == RecvState::AwaitMemoryPush
                && op.refs.matches_reply(msg.your_ref, Action::MemoryPull)
        }) else {
            return Claim::Pass;
        };

        let op = self.ops.get_mut(id).expect("just found");
        op.peer_supports_memory = true;

        let buffer = op.buffer.expect("memory path always has a buffer");
        let window = op.capacity - op.bytes_received;
        if span.anchor != buffer.to_raw()
            || span.offset as u64 != op.bytes_received
            || span.len as u64 > window
        {
            warn!("task {}: push outside the advertised window", self.task);
            self.fail(env, id, Some(XferError::BufferOverflow), true);
            return Claim::Claimed;
        }

        op.bytes_received += span.len as u64;

        if (span.len as u64) < window {
            // Short push: that was the final frame.
            self.complete_memory(env, id);
        } else {
            // Window filled exactly; grow and pull again.
            let new_capacity = op.capacity * 2;
            if !env.heap.resize(buffer, new_capacity as usize) {
                self.fail(env, id, Some(XferError::OutOfMemory), true);
                return Claim::Claimed;
            }
            op.capacity = new_capacity;

            let next = MemorySpan {
                anchor: buffer.to_raw(),
                offset: op.bytes_received as u32,
                len: (op.capacity - op.bytes_received) as u32,
            };
            match env.host.send(
                Dest::Task(op.origin),
                msg.my_ref,
                Body::MemoryPull(next),
                Delivery::Recorded,
            ) {
                Ok(sent) => {
                    op.refs.note(sent, Action::MemoryPull);
                    env.timers.set(TimerKey::RecvDeadline(id), RECV_DEADLINE_CS);
                }
                Err(e) => self.fail(env, id, Some(e), true),
            }
        }
        Claim::Claimed
    }

    fn complete_memory(&mut self, env: &mut Env, id: OpId) {
        let Some(mut op) = self.ops.remove(id) else {
            return;
        };
        env.timers.clear(TimerKey::RecvDeadline(id));

        let buffer = op.buffer.expect("memory path always has a buffer");
        let len = op.bytes_received as usize;
        let _ = env.heap.resize(buffer, len); // trim to the bytes actually sent

        let info = OfferInfo {
            size_hint: op.bytes_received,
            kind: op.kind,
            leaf: op.offer.leaf.clone(),
        };
        let accepted = {
            let mut reader = AnchorReader::new(&*env.heap, buffer, len);
            (op.handler.on_data)(&mut reader, &info)
        };
        if !accepted {
            debug!("task {}: client rejected '{}'", self.task, info.leaf);
        }

        trace!(
            "task {}: memory transfer of '{}' done, {len} bytes",
            self.task,
            info.leaf
        );
        self.release(env, &mut op);
    }

    fn handle_file_load(&mut self, env: &mut Env, msg: &Message, load: &FileOffer) -> Claim {
        let Some(id) = self.ops.find(|op| {
            op.state == RecvState::FallbackAwaitFile
                && op.refs.matches_reply(msg.your_ref, Action::ScrapAck)
        }) else {
            return Claim::Pass;
        };

        let op = self.ops.get(id).expect("just found");
        if op.kind.is_some() && load.kind.normalised() != op.kind {
            // The file that arrived is not what was offered. Fail without
            // consuming or deleting it.
            warn!(
                "task {}: file of kind {} arrived for an offer of kind {}",
                self.task,
                load.kind,
                op.offer.kind
            );
            self.fail(env, id, None, true);
            return Claim::Claimed;
        }

        let path = PathBuf::from(&load.leaf);
        let mut reader = match env.fs.open_read(&path) {
            Ok(reader) => reader,
            Err(e) => {
                self.fail(env, id, Some(e), true);
                return Claim::Claimed;
            }
        };

        let mut op = self.ops.remove(id).expect("just found");
        env.timers.clear(TimerKey::RecvDeadline(id));

        let info = OfferInfo {
            size_hint: load.size.max(0) as u64,
            kind: op.kind,
            leaf: op.offer.leaf.clone(),
        };
        let accepted = (op.handler.on_data)(&mut *reader, &info);
        drop(reader);

        if accepted {
            // We consumed the scratch file, so it is ours to remove; then
            // tell the sender the handoff worked. Neither failure can undo a
            // transfer the client already has, so both are only logged.
            if let Err(e) = env.fs.delete(&path) {
                warn!("could not delete scratch file '{}': {e}", path.display());
            }
            if let Err(e) = env.host.send(
                Dest::Task(msg.sender),
                msg.my_ref,
                Body::FileLoadAck(load.clone()),
                Delivery::Plain,
            ) {
                warn!("could not acknowledge file load: {e}");
            }
        } else {
            debug!("task {}: client rejected '{}'", self.task, info.leaf);
        }

        self.release(env, &mut op);
        Claim::Claimed
    }

    /// Offer a bounce of one of our recorded sends to this engine.
    pub fn handle_bounce(&mut self, env: &mut Env, my_ref: u32, action: Action) -> Claim {
        if action != Action::MemoryPull {
            return Claim::Pass;
        }
        let Some(id) = self.ops.find(|op| {
            op.state == RecvState::AwaitMemoryPush && op.refs.matches_bounce(my_ref, action)
        }) else {
            return Claim::Pass;
        };

        let op = self.ops.get_mut(id).expect("just found");
        if op.peer_supports_memory {
            // The peer was pushing and stopped answering pulls. It has
            // already reported the break, so fail quietly.
            self.fail(env, id, None, true);
            return Claim::Claimed;
        }

        // The peer never pushed: it does not do memory transfer at all.
        // Drop the buffer and invite a scrap file instead.
        if op.pin_held {
            op.pin_held = false;
            env.pins.unpin(env.heap);
        }
        if let Some(anchor) = op.buffer.take() {
            env.heap.free(anchor);
        }
        op.state = RecvState::FallbackAwaitFile;

        let scratch = env.fs.scratch_path();
        let ack = FileOffer {
            window: op.offer.window,
            icon: op.offer.icon,
            x: op.offer.x,
            y: op.offer.y,
            size: -1,
            kind: op.offer.kind,
            leaf: scratch.display().to_string(),
        };
        match env.host.send(
            Dest::Task(op.origin),
            op.offer_ref,
            Body::ScrapAck(ack),
            Delivery::Plain,
        ) {
            Ok(sent) => {
                op.refs.note(sent, Action::ScrapAck);
                env.timers.set(TimerKey::RecvDeadline(id), RECV_DEADLINE_CS);
                debug!("task {}: falling back to scrap-file transfer", self.task);
            }
            Err(e) => self.fail(env, id, Some(e), true),
        }
        Claim::Claimed
    }

    /// The deadline for `id` fired with no protocol progress.
    pub fn expire(&mut self, env: &mut Env, id: OpId) {
        debug!("task {}: receive operation timed out", self.task);
        self.fail(env, id, None, false);
    }

    /// Abort every operation whose client tag equals `tag`. Safe to repeat.
    pub fn cancel_receives(&mut self, env: &mut Env, tag: ClientTag) {
        for id in self.ops.ids() {
            if self.ops.get(id).map_or(false, |op| op.handler.tag == tag) {
                self.fail(env, id, None, true);
            }
        }
    }

    /// Feed the client a local file as if it had been transferred: open
    /// `path`, build an in-memory reader over it and invoke `on_data` with a
    /// synthesised offer. Returns whether the client accepted.
    pub fn load_local_file(
        &mut self,
        env: &mut Env,
        path: &Path,
        kind: Option<FileKind>,
        mut handler: ReceiveHandler,
    ) -> bool {
        let size = match env.fs.size_of(path) {
            Ok(size) => size,
            Err(e) => {
                (handler.on_fail)(Some(e));
                return false;
            }
        };
        let mut reader = match env.fs.open_read(path) {
            Ok(reader) => reader,
            Err(e) => {
                (handler.on_fail)(Some(e));
                return false;
            }
        };

        let mut data = Vec::with_capacity(size as usize);
        if reader.read_to_end(&mut data).is_err() {
            (handler.on_fail)(Some(XferError::ReadFail(path.to_path_buf())));
            return false;
        }

        let kind = kind
            .or_else(|| env.fs.kind_of(path).ok())
            .and_then(FileKind::normalised);
        let info = OfferInfo {
            size_hint: data.len() as u64,
            kind,
            leaf: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        let mut cursor = Cursor::new(data);
        (handler.on_data)(&mut cursor, &info)
    }

    /// Cancel everything outstanding. The engine stays usable afterwards;
    /// dropping it without this simply never fires the callbacks.
    pub fn finalise(&mut self, env: &mut Env) {
        for id in self.ops.ids() {
            self.fail(env, id, None, true);
        }
    }

    fn fail(&mut self, env: &mut Env, id: OpId, error: Option<XferError>, clear_timer: bool) {
        let Some(mut op) = self.ops.remove(id) else {
            return;
        };
        if clear_timer {
            env.timers.clear(TimerKey::RecvDeadline(id));
        }
        (op.handler.on_fail)(error);
        self.release(env, &mut op);
    }

    fn release(&mut self, env: &mut Env, op: &mut RecvOp) {
        if op.pin_held {
            op.pin_held = false;
            env.pins.unpin(env.heap);
        }
        if let Some(anchor) = op.buffer.take() {
            env.heap.free(anchor);
        }
    }
}
