// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Inter-application data-transfer protocol engines.
//!
//! Peers on one in-process message bus move typed byte streams between each
//! other, preferring direct memory pushes through the shared movable heap and
//! falling back to a well-known scratch file when a peer refuses memory
//! transfer. A drag engine coordinates the interactive gesture whose drop is
//! resolved into such a transfer.
//!
//! The three engines ([`receiver::Receiver`], [`sender::Sender`],
//! [`drag::Drag`]) are pure state machines driven by inbound messages and
//! scheduler callbacks; [`desk::Desk`] wires them to the bus, the file
//! subsystem, the heap and the idle scheduler.

use std::fmt;
use std::io;
use std::path::PathBuf;

pub mod bus;
pub mod desk;
pub mod drag;
pub mod fs;
pub mod helpers;
pub mod ops;
pub mod receiver;
pub mod sender;
pub mod wire;

use packheap::HeapError;

/// Task handle of one peer on the bus. Assigned by the bus at registration.
pub type TaskId = u32;

/// Window handle. Negative values are desktop furniture owned by no task.
pub type WindowId = i32;

pub type IconId = i32;

/// Opaque per-client key used to cancel receiver operations in bulk.
pub type ClientTag = u64;

/// A file-kind code, opaque on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKind(pub u32);

impl FileKind {
    /// "Untyped" sentinel; also terminates kind lists on the wire.
    pub const NULL: FileKind = FileKind(0xffff_ffff);

    pub const DIRECTORY: FileKind = FileKind(0xf000);
    pub const APPLICATION: FileKind = FileKind(0xf001);
    pub const DATA: FileKind = FileKind(0x100);
    pub const TEXT: FileKind = FileKind(0x101);

    /// `NULL` normalised away.
    pub fn normalised(self) -> Option<FileKind> {
        if self == Self::NULL {
            None
        } else {
            Some(self)
        }
    }

    /// Whether data of this kind may travel as memory pushes. Directory-like
    /// kinds only ever transfer through the file fallback.
    pub fn supports_memory(self) -> bool {
        !matches!(self, Self::DIRECTORY | Self::APPLICATION)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "&{:03x}", self.0)
    }
}

/// Default receive-buffer size in bytes.
pub const DEFAULT_BUF: u64 = 256;

/// How long a receiver operation may sit without protocol progress before it
/// is dropped: 30 seconds of centiseconds.
pub const RECV_DEADLINE_CS: scheduler::CsTick = 3000;

/// Interval between drag position broadcasts.
pub const DRAG_POLL_CS: scheduler::CsTick = 25;

/// The possible errors surfaced by the engines.
#[derive(Debug)]
pub enum XferError {
    /// Allocation of an operation record, a receive buffer, or an outgoing
    /// frame failed.
    OutOfMemory,

    OpenInFail(PathBuf),
    ReadFail(PathBuf),
    OpenOutFail(PathBuf),
    WriteFail(PathBuf),
    FileNotFound(PathBuf),
    IsADirectory(PathBuf),

    /// A recorded send bounced with no fallback left.
    ReceiverDied,

    /// A peer pushed past the end of the advertised buffer window, or named
    /// a buffer that does not exist. Hard protocol violation.
    BufferOverflow,

    /// A drag was started while one was already active.
    DragInProgress,

    /// Opaque failure from the host event layer.
    Host(io::Error),

    /// A frame that could not be decoded.
    Wire(wire::WireError),
}

impl XferError {
    /// Message-file token this error is looked up under.
    pub fn token(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "NoMem",
            Self::OpenInFail(_) => "OpenInFail",
            Self::ReadFail(_) => "ReadFail",
            Self::OpenOutFail(_) => "OpenOutFail",
            Self::WriteFail(_) => "WriteFail",
            Self::FileNotFound(_) => "NotFound",
            Self::IsADirectory(_) => "IsADir",
            Self::ReceiverDied => "RecDied",
            Self::BufferOverflow => "BufOFlo",
            Self::DragInProgress => "DragActive",
            Self::Host(_) => "HostErr",
            Self::Wire(_) => "WireErr",
        }
    }
}

impl std::error::Error for XferError {}

impl fmt::Display for XferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Not enough memory to continue the transfer"),
            Self::OpenInFail(p) => write!(f, "Cannot open '{}' for reading", p.display()),
            Self::ReadFail(p) => write!(f, "Error reading from '{}'", p.display()),
            Self::OpenOutFail(p) => write!(f, "Cannot open '{}' for writing", p.display()),
            Self::WriteFail(p) => write!(f, "Error writing to '{}'", p.display()),
            Self::FileNotFound(p) => write!(f, "File '{}' not found", p.display()),
            Self::IsADirectory(p) => write!(f, "'{}' is a directory", p.display()),
            Self::ReceiverDied => write!(f, "The other application has stopped responding"),
            Self::BufferOverflow => write!(f, "Buffer overflow during transfer"),
            Self::DragInProgress => write!(f, "A drag is already in progress"),
            Self::Host(e) => write!(f, "Host error: {e}"),
            Self::Wire(e) => write!(f, "Bad message: {e}"),
        }
    }
}

impl From<io::Error> for XferError {
    fn from(e: io::Error) -> Self {
        Self::Host(e)
    }
}

impl From<wire::WireError> for XferError {
    fn from(e: wire::WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<HeapError> for XferError {
    fn from(e: HeapError) -> Self {
        match e {
            HeapError::OutOfMemory => Self::OutOfMemory,
            // A bad anchor or out-of-bounds access at this level means a peer
            // named storage it does not own.
            HeapError::BadAnchor | HeapError::Bounds => Self::BufferOverflow,
        }
    }
}
