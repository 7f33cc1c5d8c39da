// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Error-token lookup and small shared pieces.

use std::io::{self, Read};

use packheap::{Allocator, Anchor};

use crate::XferError;

/// A resolved error: number plus user-facing message, the shape the host's
/// error reporting call wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBlock {
    pub errnum: u32,
    pub message: String,
}

/// Veneer over the host's messages file: maps error tokens to `(errnum,
/// message)` pairs. The built-in table covers every token the engines raise;
/// a host can substitute translated text per token.
pub struct TokenTable {
    entries: Vec<(&'static str, u32, String)>,
}

impl TokenTable {
    pub fn standard() -> Self {
        let entries = [
            ("NoMem", 0x101, "Not enough memory to continue the transfer"),
            ("OpenInFail", 0x102, "Cannot open the file for reading"),
            ("ReadFail", 0x103, "Error while reading the file"),
            ("OpenOutFail", 0x104, "Cannot open the file for writing"),
            ("WriteFail", 0x105, "Error while writing the file"),
            ("NotFound", 0x106, "File not found"),
            ("IsADir", 0x107, "That is a directory, not a file"),
            ("RecDied", 0x108, "The other application has stopped responding"),
            ("BufOFlo", 0x109, "Buffer overflow during transfer"),
            ("DragActive", 0x10a, "A drag is already in progress"),
            ("HostErr", 0x10b, "Unexpected error from the window system"),
            ("WireErr", 0x10c, "A malformed message was received"),
        ];
        Self {
            entries: entries
                .iter()
                .map(|(token, errnum, message)| (*token, *errnum, message.to_string()))
                .collect(),
        }
    }

    /// Replace the message text behind `token`.
    pub fn set(&mut self, token: &'static str, message: &str) {
        for entry in &mut self.entries {
            if entry.0 == token {
                entry.2 = message.to_string();
                return;
            }
        }
        self.entries.push((token, 0, message.to_string()));
    }

    pub fn lookup(&self, token: &str) -> Option<ErrorBlock> {
        self.entries
            .iter()
            .find(|(t, _, _)| *t == token)
            .map(|(_, errnum, message)| ErrorBlock {
                errnum: *errnum,
                message: message.clone(),
            })
    }

    /// The block for an engine error. Unknown tokens fall back to the error's
    /// own rendering so nothing is ever swallowed.
    pub fn block_for(&self, error: &XferError) -> ErrorBlock {
        self.lookup(error.token()).unwrap_or(ErrorBlock {
            errnum: 0,
            message: error.to_string(),
        })
    }
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Finite, non-restartable reader over one heap block, handed to receive
/// clients so buffer ownership transfers without copying.
pub struct AnchorReader<'a> {
    heap: &'a dyn Allocator,
    anchor: Anchor,
    pos: usize,
    end: usize,
}

impl<'a> AnchorReader<'a> {
    pub fn new(heap: &'a dyn Allocator, anchor: Anchor, len: usize) -> Self {
        Self {
            heap,
            anchor,
            pos: 0,
            end: len,
        }
    }
}

impl Read for AnchorReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.end - self.pos);
        if n == 0 {
            return Ok(0);
        }

        self.heap
            .read(self.anchor, self.pos, &mut buf[..n])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packheap::SimHeap;

    #[test]
    fn token_lookup_and_override() {
        let mut table = TokenTable::standard();
        let block = table.block_for(&XferError::OutOfMemory);
        assert_eq!(block.errnum, 0x101);

        table.set("NoMem", "No room");
        assert_eq!(table.lookup("NoMem").unwrap().message, "No room");
    }

    #[test]
    fn anchor_reader_reads_to_eof() {
        let mut heap = SimHeap::new();
        let a = heap.alloc(6).unwrap();
        heap.write(a, 0, b"abcdef").unwrap();

        let mut reader = AnchorReader::new(&heap, a, 4);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");
    }
}
