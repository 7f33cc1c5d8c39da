// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The file-subsystem seam and its `std::fs` implementation.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::*;

use crate::{FileKind, XferError};

/// File operations the engines need. Kind get/set is part of the seam
/// because transferred files carry their kind with them.
pub trait FileSystem {
    fn open_read(&mut self, path: &Path) -> Result<Box<dyn Read>, XferError>;

    fn open_write(&mut self, path: &Path) -> Result<Box<dyn Write>, XferError>;

    fn delete(&mut self, path: &Path) -> Result<(), XferError>;

    fn size_of(&mut self, path: &Path) -> Result<u64, XferError>;

    fn kind_of(&mut self, path: &Path) -> Result<FileKind, XferError>;

    fn set_kind(&mut self, path: &Path, kind: FileKind) -> Result<(), XferError>;

    fn canonicalise(&mut self, path: &Path) -> Result<PathBuf, XferError>;

    fn create_dirs_for(&mut self, path: &Path) -> Result<(), XferError>;

    /// The well-known rendezvous path for the scrap-file fallback.
    fn scratch_path(&mut self) -> PathBuf;
}

/// `std::fs`-backed implementation. File kinds have no native home here, so
/// they live in a path-keyed side table seeded from extensions.
pub struct StdFs {
    scratch_dir: PathBuf,
    kinds: HashMap<PathBuf, FileKind>,
}

impl StdFs {
    pub fn new() -> Self {
        Self::with_scratch_dir(std::env::temp_dir().join("xfer-scrap"))
    }

    pub fn with_scratch_dir(scratch_dir: PathBuf) -> Self {
        Self {
            scratch_dir,
            kinds: HashMap::new(),
        }
    }
}

impl Default for StdFs {
    fn default() -> Self {
        Self::new()
    }
}

fn open_error(e: io::Error, path: &Path, writing: bool) -> XferError {
    match e.kind() {
        io::ErrorKind::NotFound => XferError::FileNotFound(path.to_path_buf()),
        io::ErrorKind::IsADirectory => XferError::IsADirectory(path.to_path_buf()),
        _ if writing => XferError::OpenOutFail(path.to_path_buf()),
        _ => XferError::OpenInFail(path.to_path_buf()),
    }
}

impl FileSystem for StdFs {
    fn open_read(&mut self, path: &Path) -> Result<Box<dyn Read>, XferError> {
        let file = std::fs::File::open(path).map_err(|e| open_error(e, path, false))?;
        Ok(Box::new(file))
    }

    fn open_write(&mut self, path: &Path) -> Result<Box<dyn Write>, XferError> {
        let file = std::fs::File::create(path).map_err(|e| open_error(e, path, true))?;
        Ok(Box::new(file))
    }

    fn delete(&mut self, path: &Path) -> Result<(), XferError> {
        self.kinds.remove(path);
        std::fs::remove_file(path).map_err(|e| open_error(e, path, false))
    }

    fn size_of(&mut self, path: &Path) -> Result<u64, XferError> {
        let meta = std::fs::metadata(path).map_err(|e| open_error(e, path, false))?;
        Ok(meta.len())
    }

    fn kind_of(&mut self, path: &Path) -> Result<FileKind, XferError> {
        if let Some(kind) = self.kinds.get(path) {
            return Ok(*kind);
        }

        let meta = std::fs::metadata(path).map_err(|e| open_error(e, path, false))?;
        if meta.is_dir() {
            return Ok(FileKind::DIRECTORY);
        }

        Ok(match path.extension().and_then(|e| e.to_str()) {
            Some("txt") | Some("text") => FileKind::TEXT,
            _ => FileKind::DATA,
        })
    }

    fn set_kind(&mut self, path: &Path, kind: FileKind) -> Result<(), XferError> {
        self.kinds.insert(path.to_path_buf(), kind);
        Ok(())
    }

    fn canonicalise(&mut self, path: &Path) -> Result<PathBuf, XferError> {
        std::fs::canonicalize(path).map_err(|e| open_error(e, path, false))
    }

    fn create_dirs_for(&mut self, path: &Path) -> Result<(), XferError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        std::fs::create_dir_all(parent).map_err(|e| open_error(e, parent, true))
    }

    fn scratch_path(&mut self) -> PathBuf {
        let path = self.scratch_dir.join("scrap-data");
        if let Err(e) = std::fs::create_dir_all(&self.scratch_dir) {
            warn!(
                "could not create scratch directory '{}': {e}",
                self.scratch_dir.display()
            );
        }
        path
    }
}
