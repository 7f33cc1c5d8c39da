// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Wire form of the transfer and drag messages.
//!
//! A frame is a little-endian sequence of 32-bit words:
//! `[size][sender][my_ref][your_ref][action]` followed by the action's body.
//! Leaf names are NUL-terminated and zero-padded to the next word; the frame
//! is sized to the name actually carried, never a fixed-size field. Kind
//! lists are terminated by an all-ones word. The leading size word doubles as
//! a record mark when frames are streamed over a byte connection
//! ([`write_frame`]/[`read_frame`]).

use std::fmt;
use std::io::{Read, Write};

use crate::{FileKind, IconId, TaskId, WindowId, XferError};

pub const WORD: usize = 4;

/// Five header words.
pub const HEADER_BYTES: usize = 5 * WORD;

/// Upper bound on any frame; longer leaf names are a protocol error.
pub const MAX_FRAME: usize = 4096;

/// Terminates kind lists on the wire. Same value as [`FileKind::NULL`], which
/// is why an untyped-only list encodes as an empty list.
const KIND_LIST_END: u32 = 0xffff_ffff;

/// Action codes. Opaque on the wire; only identity matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Action {
    OfferData = 1,
    ScrapAck = 2,
    FileLoad = 3,
    FileLoadAck = 4,
    MemoryPull = 5,
    MemoryPush = 6,
    Dragging = 7,
    DragClaim = 8,
}

impl Action {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Action> {
        Some(match code {
            1 => Self::OfferData,
            2 => Self::ScrapAck,
            3 => Self::FileLoad,
            4 => Self::FileLoadAck,
            5 => Self::MemoryPull,
            6 => Self::MemoryPush,
            7 => Self::Dragging,
            8 => Self::DragClaim,
            _ => return None,
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Dragging-message flag bits.
pub mod drag_flags {
    /// The dragged data is a selection within a document, not a whole file.
    pub const FROM_SELECTION: u32 = 1 << 0;

    /// The recipient must not (re-)claim this drag.
    pub const DO_NOT_CLAIM: u32 = 1 << 1;
}

/// DragClaim-message flag bits.
pub mod claim_flags {
    /// The claimant has changed the pointer shape.
    pub const POINTER_SHAPE_CHANGED: u32 = 1 << 0;

    /// The claimant will render its own feedback; hide the drag box.
    pub const REMOVE_DRAG_BOX: u32 = 1 << 1;
}

/// Decoding errors.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Frame shorter than its contents require.
    Truncated,

    /// Size word out of range or not word-aligned.
    BadSize,

    /// Unknown action code.
    BadAction(u32),

    /// Unterminated or non-UTF-8 leaf name, or unterminated kind list.
    BadString,
}

impl std::error::Error for WireError {}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame truncated"),
            Self::BadSize => write!(f, "bad frame size"),
            Self::BadAction(code) => write!(f, "unknown action code {code}"),
            Self::BadString => write!(f, "bad embedded string"),
        }
    }
}

/// Body of the four file-transfer messages. Which fields are meaningful
/// varies by action: `size` is the estimate in an offer, −1 ("unsafe
/// destination") in a scrap acknowledgement, and the actual byte count in a
/// file-load; `leaf` is a leaf name in an offer and a full path in the
/// scrap/file-load exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub window: WindowId,
    pub icon: IconId,
    pub x: i32,
    pub y: i32,
    pub size: i32,
    pub kind: FileKind,
    pub leaf: String,
}

/// A window into a heap block, as carried by memory pulls and pushes. For a
/// pull, `len` is the free space on offer; for a push, the bytes written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySpan {
    pub anchor: u32,
    pub offset: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub xmin: i32,
    pub ymin: i32,
    pub xmax: i32,
    pub ymax: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragInfo {
    pub window: WindowId,
    pub icon: IconId,
    pub x: i32,
    pub y: i32,
    pub flags: u32,
    pub bbox: Option<BBox>,
    pub kinds: Vec<FileKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimInfo {
    pub flags: u32,
    pub kinds: Vec<FileKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    OfferData(FileOffer),
    ScrapAck(FileOffer),
    FileLoad(FileOffer),
    FileLoadAck(FileOffer),
    MemoryPull(MemorySpan),
    MemoryPush(MemorySpan),
    Dragging(DragInfo),
    DragClaim(ClaimInfo),
}

impl Body {
    pub fn action(&self) -> Action {
        match self {
            Self::OfferData(_) => Action::OfferData,
            Self::ScrapAck(_) => Action::ScrapAck,
            Self::FileLoad(_) => Action::FileLoad,
            Self::FileLoadAck(_) => Action::FileLoadAck,
            Self::MemoryPull(_) => Action::MemoryPull,
            Self::MemoryPush(_) => Action::MemoryPush,
            Self::Dragging(_) => Action::Dragging,
            Self::DragClaim(_) => Action::DragClaim,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: TaskId,
    pub my_ref: u32,
    pub your_ref: u32,
    pub body: Body,
}

impl Message {
    pub fn action(&self) -> Action {
        self.body.action()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = buf_with_dummy_size();
        push_u32(&mut buf, self.sender);
        push_u32(&mut buf, self.my_ref);
        push_u32(&mut buf, self.your_ref);
        push_u32(&mut buf, self.action().code());

        match &self.body {
            Body::OfferData(o)
            | Body::ScrapAck(o)
            | Body::FileLoad(o)
            | Body::FileLoadAck(o) => {
                push_i32(&mut buf, o.window);
                push_i32(&mut buf, o.icon);
                push_i32(&mut buf, o.x);
                push_i32(&mut buf, o.y);
                push_i32(&mut buf, o.size);
                push_u32(&mut buf, o.kind.0);
                push_leaf(&mut buf, &o.leaf);
            }
            Body::MemoryPull(s) | Body::MemoryPush(s) => {
                push_u32(&mut buf, s.anchor);
                push_u32(&mut buf, s.offset);
                push_u32(&mut buf, s.len);
            }
            Body::Dragging(d) => {
                push_i32(&mut buf, d.window);
                push_i32(&mut buf, d.icon);
                push_i32(&mut buf, d.x);
                push_i32(&mut buf, d.y);
                push_u32(&mut buf, d.flags);
                match d.bbox {
                    Some(b) => {
                        push_i32(&mut buf, b.xmin);
                        push_i32(&mut buf, b.ymin);
                        push_i32(&mut buf, b.xmax);
                        push_i32(&mut buf, b.ymax);
                    }
                    // Absent box: xmin > xmax.
                    None => {
                        push_i32(&mut buf, 0);
                        push_i32(&mut buf, 0);
                        push_i32(&mut buf, -1);
                        push_i32(&mut buf, -1);
                    }
                }
                push_kinds(&mut buf, &d.kinds);
            }
            Body::DragClaim(c) => {
                push_u32(&mut buf, c.flags);
                push_kinds(&mut buf, &c.kinds);
            }
        }

        update_size_word(&mut buf);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Message, WireError> {
        if data.len() < HEADER_BYTES || data.len() % WORD != 0 || data.len() > MAX_FRAME {
            return Err(WireError::BadSize);
        }

        let mut parser = Parser { data, pos: 0 };
        let size = parser.take_u32()? as usize;
        if size != data.len() {
            return Err(WireError::BadSize);
        }

        let sender = parser.take_u32()?;
        let my_ref = parser.take_u32()?;
        let your_ref = parser.take_u32()?;
        let code = parser.take_u32()?;
        let action = Action::from_code(code).ok_or(WireError::BadAction(code))?;

        let body = match action {
            Action::OfferData | Action::ScrapAck | Action::FileLoad | Action::FileLoadAck => {
                let offer = FileOffer {
                    window: parser.take_i32()?,
                    icon: parser.take_i32()?,
                    x: parser.take_i32()?,
                    y: parser.take_i32()?,
                    size: parser.take_i32()?,
                    kind: FileKind(parser.take_u32()?),
                    leaf: parser.take_leaf()?,
                };
                match action {
                    Action::OfferData => Body::OfferData(offer),
                    Action::ScrapAck => Body::ScrapAck(offer),
                    Action::FileLoad => Body::FileLoad(offer),
                    _ => Body::FileLoadAck(offer),
                }
            }
            Action::MemoryPull | Action::MemoryPush => {
                let span = MemorySpan {
                    anchor: parser.take_u32()?,
                    offset: parser.take_u32()?,
                    len: parser.take_u32()?,
                };
                if action == Action::MemoryPull {
                    Body::MemoryPull(span)
                } else {
                    Body::MemoryPush(span)
                }
            }
            Action::Dragging => {
                let window = parser.take_i32()?;
                let icon = parser.take_i32()?;
                let x = parser.take_i32()?;
                let y = parser.take_i32()?;
                let flags = parser.take_u32()?;
                let (xmin, ymin, xmax, ymax) = (
                    parser.take_i32()?,
                    parser.take_i32()?,
                    parser.take_i32()?,
                    parser.take_i32()?,
                );
                let bbox = if xmin > xmax {
                    None
                } else {
                    Some(BBox {
                        xmin,
                        ymin,
                        xmax,
                        ymax,
                    })
                };
                Body::Dragging(DragInfo {
                    window,
                    icon,
                    x,
                    y,
                    flags,
                    bbox,
                    kinds: parser.take_kinds()?,
                })
            }
            Action::DragClaim => Body::DragClaim(ClaimInfo {
                flags: parser.take_u32()?,
                kinds: parser.take_kinds()?,
            }),
        };

        Ok(Message {
            sender,
            my_ref,
            your_ref,
            body,
        })
    }
}

/// One end of a connected pair of byte streams (socketpair(2)) that carries
/// whole frames. This is how the record-mark streaming below gets exercised
/// against a real descriptor rather than an in-memory buffer.
pub struct FrameConduit {
    fd: std::os::fd::OwnedFd,
}

impl FrameConduit {
    /// A connected pair of conduit ends.
    pub fn pair() -> std::io::Result<(FrameConduit, FrameConduit)> {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;

        Ok((FrameConduit { fd: a }, FrameConduit { fd: b }))
    }

    /// Encode and send one whole frame.
    pub fn send(&mut self, msg: &Message) -> std::io::Result<()> {
        write_frame(self, msg)
    }

    /// Read the next whole frame.
    pub fn recv(&mut self) -> Result<Message, XferError> {
        read_frame(self)
    }
}

impl Read for FrameConduit {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::read(&self.fd, buf)?)
    }
}

impl Write for FrameConduit {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::write(&self.fd, buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Encode and write one frame. The leading size word is the record mark.
pub fn write_frame<W: Write>(stream: &mut W, msg: &Message) -> std::io::Result<()> {
    stream.write_all(&msg.encode())
}

/// Read one frame from a stream, using the leading size word to find its end.
pub fn read_frame<R: Read>(stream: &mut R) -> Result<Message, XferError> {
    let mut size_word = [0u8; 4];
    stream.read_exact(&mut size_word)?;

    let size = u32::from_le_bytes(size_word) as usize;
    if !(HEADER_BYTES..=MAX_FRAME).contains(&size) || size % WORD != 0 {
        return Err(WireError::BadSize.into());
    }

    let mut buf = vec![0u8; size];
    buf[..4].copy_from_slice(&size_word);
    stream.read_exact(&mut buf[4..])?;

    Ok(Message::decode(&buf)?)
}

/// Returns a buffer with space for the size word already allocated, but a
/// dummy value (0) encoded since the length of the frame isn't known yet.
fn buf_with_dummy_size() -> Vec<u8> {
    vec![0, 0, 0, 0]
}

/// Given a complete encoded frame prefaced by a dummy size word, update that
/// word based on the actual length.
fn update_size_word(buf: &mut [u8]) {
    let size = u32::try_from(buf.len()).unwrap();
    buf[..4].copy_from_slice(&size.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_leaf(buf: &mut Vec<u8>, leaf: &str) {
    buf.extend_from_slice(leaf.as_bytes());
    buf.push(0);
    while buf.len() % WORD != 0 {
        buf.push(0);
    }
}

fn push_kinds(buf: &mut Vec<u8>, kinds: &[FileKind]) {
    for kind in kinds {
        // The terminator value cannot be carried as a list element.
        if kind.0 != KIND_LIST_END {
            push_u32(buf, kind.0);
        }
    }
    push_u32(buf, KIND_LIST_END);
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn take_u32(&mut self) -> Result<u32, WireError> {
        let end = self.pos + WORD;
        if end > self.data.len() {
            return Err(WireError::Truncated);
        }
        let word = u32::from_le_bytes(self.data[self.pos..end].try_into().unwrap());
        self.pos = end;
        Ok(word)
    }

    fn take_i32(&mut self) -> Result<i32, WireError> {
        self.take_u32().map(|w| w as i32)
    }

    fn take_leaf(&mut self) -> Result<String, WireError> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::BadString)?;
        let leaf = std::str::from_utf8(&rest[..nul]).map_err(|_| WireError::BadString)?;

        let consumed = nul + 1;
        self.pos += consumed + (WORD - consumed % WORD) % WORD;
        Ok(leaf.to_string())
    }

    fn take_kinds(&mut self) -> Result<Vec<FileKind>, WireError> {
        let mut kinds = Vec::new();
        loop {
            let word = self.take_u32().map_err(|_| WireError::BadString)?;
            if word == KIND_LIST_END {
                return Ok(kinds);
            }
            kinds.push(FileKind(word));
        }
    }
}
