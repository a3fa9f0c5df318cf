// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::addr::order_size;
use crate::addr::PhysAddr;
use crate::addr::MAX_BLOCK_ORDER;
use crate::addr::PAGE_SIZE;
use crate::Error;
use crate::Result;

/// One block of host memory offered to the hypervisor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemcachePage {
    pub phys: PhysAddr,
    pub order: u8,
}

impl MemcachePage {
    pub fn size(&self) -> Option<u64> {
        order_size(self.order)
    }

    /// Pages in the block, 0 for an order no block can have.
    pub fn nr_pages(&self) -> u64 {
        self.size().map_or(0, |size| size / PAGE_SIZE)
    }

    /// Checks a block offered by the host before any of it is touched and returns its page
    /// count. The order must be at most `max_order` and the address aligned to the block size.
    pub fn validate(&self, max_order: u8) -> Result<u64> {
        if self.order > max_order.min(MAX_BLOCK_ORDER) {
            return Err(Error::InvalidArgument);
        }
        let size = self.size().ok_or(Error::InvalidArgument)?;
        if !self.phys.is_aligned(size) {
            return Err(Error::InvalidArgument);
        }
        Ok(size / PAGE_SIZE)
    }
}

/// A stack of memory blocks passed between the host and the hypervisor.
///
/// The host tops it up before a call that may need memory, the hypervisor drains it into its
/// pools, and pages handed back by the hypervisor come back the same way.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HypMemcache {
    pages: Vec<MemcachePage>,
}

impl HypMemcache {
    pub fn new() -> HypMemcache {
        Default::default()
    }

    pub fn push(&mut self, phys: PhysAddr, order: u8) {
        self.pages.push(MemcachePage { phys, order });
    }

    pub fn pop(&mut self) -> Option<MemcachePage> {
        self.pages.pop()
    }

    /// Number of blocks in the cache, whatever their order.
    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemcachePage> {
        self.pages.iter()
    }
}
