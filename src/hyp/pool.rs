// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hypervisor page pools.
//!
//! A [`HypPool`] is a small buddy allocator over pages the host has already donated. Blocks are
//! split on allocation and merged with their buddy on release, up to the pool's `max_order`.

use std::collections::BTreeMap;
use std::ops::Range;

use log::warn;
use sync::SpinLock;

use crate::addr::PhysAddr;
use crate::addr::MAX_BLOCK_ORDER;
use crate::addr::PAGE_SIZE;
use crate::hyp::mem_protect::HostStage2;
use crate::hyp::memcache::HypMemcache;
use crate::hyp::memcache::MemcachePage;
use crate::Error;
use crate::Result;

/// Anything a driver can take pages from and give them back to.
pub trait PageSource {
    fn alloc_pages(&self, order: u8) -> Option<PhysAddr>;
    fn put_pages(&self, phys: PhysAddr, order: u8);
}

// Orders inside a pool never exceed its max_order, which is at most 51 for a ranged pool.
fn block_size(order: u8) -> u64 {
    PAGE_SIZE << order
}

#[derive(Debug, Default)]
pub struct HypPool {
    range: Option<Range<u64>>,
    max_order: u8,
    free: BTreeMap<u8, Vec<PhysAddr>>,
    free_pages: u64,
}

impl HypPool {
    /// An empty pool that accepts blocks anywhere, up to `max_order`.
    pub fn new(max_order: u8) -> HypPool {
        HypPool {
            max_order,
            ..Default::default()
        }
    }

    /// A pool covering exactly `[base, base + size)`, all of it free.
    ///
    /// `size` must be a power-of-two number of pages and `base` aligned to it.
    pub fn with_range(base: PhysAddr, size: u64) -> Result<HypPool> {
        if size < PAGE_SIZE || !size.is_power_of_two() || !base.is_aligned(size) {
            return Err(Error::InvalidArgument);
        }
        let end = base.offset().checked_add(size).ok_or(Error::InvalidArgument)?;
        let max_order = (size / PAGE_SIZE).trailing_zeros() as u8;
        let mut pool = HypPool {
            range: Some(base.offset()..end),
            max_order,
            ..Default::default()
        };
        pool.insert(base, max_order);
        Ok(pool)
    }

    /// True when the pool was set up over a range. Block pools without a range are unused.
    pub fn has_range(&self) -> bool {
        self.range.is_some()
    }

    pub fn contains(&self, phys: PhysAddr) -> bool {
        self.range
            .as_ref()
            .map_or(false, |r| r.contains(&phys.offset()))
    }

    /// Total number of pages a ranged pool manages, 0 for an unranged one.
    pub fn capacity(&self) -> u64 {
        self.range
            .as_ref()
            .map_or(0, |r| (r.end - r.start) / PAGE_SIZE)
    }

    pub fn max_order(&self) -> u8 {
        self.max_order
    }

    pub fn free_pages(&self) -> u64 {
        self.free_pages
    }

    pub fn alloc_pages(&mut self, order: u8) -> Option<PhysAddr> {
        if order > self.max_order {
            return None;
        }
        let (mut cur, block) = {
            let (&cur, list) = self
                .free
                .range_mut(order..)
                .find(|(_, list)| !list.is_empty())?;
            (cur, list.pop()?)
        };
        while cur > order {
            cur -= 1;
            let buddy = PhysAddr(block.offset() + block_size(cur));
            self.free.entry(cur).or_default().push(buddy);
        }
        self.free_pages -= 1 << order;
        Some(block)
    }

    /// Returns a block to the pool. Blocks larger than `max_order` are split first, blocks
    /// larger than any the host may donate are dropped.
    pub fn put_pages(&mut self, phys: PhysAddr, order: u8) {
        if order > self.max_order.max(MAX_BLOCK_ORDER) {
            warn!("dropping {} of order {}", phys, order);
            return;
        }
        if order > self.max_order {
            let step = block_size(self.max_order);
            for i in 0..(1u64 << (order - self.max_order)) {
                self.insert(PhysAddr(phys.offset() + i * step), self.max_order);
            }
            return;
        }
        self.insert(phys, order);
    }

    fn insert(&mut self, phys: PhysAddr, order: u8) {
        self.free_pages += 1 << order;
        let mut phys = phys;
        let mut order = order;
        while order < self.max_order {
            let buddy = PhysAddr(phys.offset() ^ block_size(order));
            if self.range.is_some() && !self.contains(buddy) {
                break;
            }
            let Some(list) = self.free.get_mut(&order) else {
                break;
            };
            let Some(pos) = list.iter().position(|&p| p == buddy) else {
                break;
            };
            list.swap_remove(pos);
            phys = PhysAddr(phys.offset().min(buddy.offset()));
            order += 1;
        }
        self.free.entry(order).or_default().push(phys);
    }

    /// Takes free blocks out of the pool, largest first, until at least `target` pages are
    /// gathered or the pool is empty.
    pub fn take_free(&mut self, target: u64) -> Vec<MemcachePage> {
        let mut taken = Vec::new();
        let mut nr = 0;
        while nr < target {
            let Some((&order, list)) = self.free.iter_mut().rev().find(|(_, l)| !l.is_empty())
            else {
                break;
            };
            let Some(phys) = list.pop() else {
                break;
            };
            self.free_pages -= 1 << order;
            nr += 1 << order;
            taken.push(MemcachePage { phys, order });
        }
        taken
    }
}

impl PageSource for SpinLock<HypPool> {
    fn alloc_pages(&self, order: u8) -> Option<PhysAddr> {
        self.lock().alloc_pages(order)
    }

    fn put_pages(&self, phys: PhysAddr, order: u8) {
        self.lock().put_pages(phys, order)
    }
}

/// Drains `mc` into `pool`, taking ownership of each block from the host.
///
/// A block that cannot be admitted is pushed back onto `mc` and the error returned. Blocks above
/// the pool's `max_order` or above [`MAX_BLOCK_ORDER`] are refused.
pub fn refill_hyp_pool(
    pool: &SpinLock<HypPool>,
    mc: &mut HypMemcache,
    stage2: &HostStage2,
) -> Result<()> {
    let max_order = pool.lock().max_order();
    while let Some(page) = mc.pop() {
        let res = page
            .validate(max_order)
            .and_then(|nr_pages| stage2.host_donate_hyp(page.phys.pfn(), nr_pages));
        if let Err(e) = res {
            mc.push(page.phys, page.order);
            return Err(e);
        }
        pool.lock().put_pages(page.phys, page.order);
    }
    Ok(())
}

/// Hands up to `target` free pages of `pool` back to the host through `mc`.
pub fn reclaim_hyp_pool(
    pool: &SpinLock<HypPool>,
    mc: &mut HypMemcache,
    target: u64,
    stage2: &HostStage2,
) {
    let taken = pool.lock().take_free(target);
    return_to_host(taken, mc, stage2);
}

/// Gives blocks taken out of a pool back to the host through `mc`.
pub fn return_to_host(pages: Vec<MemcachePage>, mc: &mut HypMemcache, stage2: &HostStage2) {
    for page in pages {
        if let Err(e) = stage2.hyp_donate_host(page.phys.pfn(), page.nr_pages()) {
            warn!("failed to return {} to the host: {}", page.phys, e);
            continue;
        }
        mc.push(page.phys, page.order);
    }
}
