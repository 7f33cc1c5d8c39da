// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use crate::{Allocator, HeapError};

/// Reference-counted suppression of the heap compactor.
///
/// The compactor is disabled when the count rises 0→1 and re-enabled (to its
/// previous setting) when it falls 1→0; intermediate pins and unpins only
/// touch the counter. Pairs must balance.
pub struct PinCoordinator {
    count: u32,
    saved_setting: bool,
}

impl PinCoordinator {
    pub fn new() -> Self {
        Self {
            count: 0,
            saved_setting: true,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Take a pin, optionally asking the allocator to guarantee `headroom`
    /// further bytes first. On failure no pin is taken.
    pub fn pin(
        &mut self,
        heap: &mut dyn Allocator,
        headroom: Option<usize>,
    ) -> Result<(), HeapError> {
        if let Some(needed) = headroom {
            if !heap.ensure_headroom(needed) {
                return Err(HeapError::OutOfMemory);
            }
        }

        if self.count == 0 {
            self.saved_setting = heap.set_compactor(false);
        }
        self.count += 1;
        trace!("heap pinned (count {})", self.count);
        Ok(())
    }

    pub fn unpin(&mut self, heap: &mut dyn Allocator) {
        if self.count == 0 {
            warn!("unbalanced heap unpin");
            return;
        }

        self.count -= 1;
        trace!("heap unpinned (count {})", self.count);
        if self.count == 0 {
            heap.set_compactor(self.saved_setting);
        }
    }
}

impl Default for PinCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
