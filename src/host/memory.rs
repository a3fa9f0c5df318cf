// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host page allocator.
//!
//! Hands out naturally aligned power-of-two blocks of a physical range. Memory is zero on
//! allocation; contents are not modelled.

use log::warn;
use sync::Mutex;

use crate::addr::get_order;
use crate::addr::page_align;
use crate::addr::HostVirtAddr;
use crate::addr::HypVaLayout;
use crate::addr::PhysAddr;
use crate::addr::PAGE_SIZE;
use crate::hyp::memcache::HypMemcache;
use crate::Error;
use crate::Result;

pub struct HostMemory {
    base: PhysAddr,
    layout: HypVaLayout,
    // One flag per page, true while allocated.
    used: Mutex<Vec<bool>>,
}

impl HostMemory {
    /// Manages `[base, base + size)`. Both must be page aligned.
    pub fn new(base: PhysAddr, size: u64, layout: HypVaLayout) -> Result<HostMemory> {
        if size == 0 || !base.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        base.checked_add(size).ok_or(Error::InvalidArgument)?;
        let nr_pages = usize::try_from(size / PAGE_SIZE).map_err(|_| Error::TooBig)?;
        Ok(HostMemory {
            base,
            layout,
            used: Mutex::new(vec![false; nr_pages]),
        })
    }

    pub fn layout(&self) -> &HypVaLayout {
        &self.layout
    }

    /// Host linear-map address of `phys`.
    pub fn virt(&self, phys: PhysAddr) -> Option<HostVirtAddr> {
        self.layout.host_va(phys)
    }

    pub fn virt_to_phys(&self, va: HostVirtAddr) -> Option<PhysAddr> {
        self.layout.host_va_to_phys(va)
    }

    pub fn nr_free(&self) -> usize {
        self.used.lock().iter().filter(|&&u| !u).count()
    }

    /// Allocates `1 << order` pages aligned to their size.
    pub fn alloc_pages(&self, order: u8) -> Option<PhysAddr> {
        let count = 1usize.checked_shl(order.into())?;
        let mut used = self.used.lock();
        let start = (0..used.len())
            .filter(|&i| self.is_block_aligned(i, order))
            .find(|&i| i + count <= used.len() && used[i..i + count].iter().all(|&u| !u))?;
        used[start..start + count].fill(true);
        Some(PhysAddr(self.base.offset() + start as u64 * PAGE_SIZE))
    }

    fn is_block_aligned(&self, idx: usize, order: u8) -> bool {
        let phys = self.base.offset() + idx as u64 * PAGE_SIZE;
        phys % (PAGE_SIZE << order) == 0
    }

    /// Allocates enough whole pages for `size` bytes.
    pub fn alloc_pages_exact(&self, size: u64) -> Option<PhysAddr> {
        let size = page_align(size)?;
        self.alloc_pages(get_order(size))
    }

    pub fn free_pages(&self, phys: PhysAddr, order: u8) {
        let mut used = self.used.lock();
        let Some(start) = phys
            .offset()
            .checked_sub(self.base.offset())
            .map(|off| (off / PAGE_SIZE) as usize)
        else {
            warn!("freeing {} outside host memory", phys);
            return;
        };
        let end = 1usize
            .checked_shl(order.into())
            .and_then(|count| start.checked_add(count));
        let Some(end) = end.filter(|&end| end <= used.len()) else {
            warn!("freeing {} outside host memory", phys);
            return;
        };
        used[start..end].fill(false);
    }

    pub fn free_pages_exact(&self, phys: PhysAddr, size: u64) {
        if let Some(size) = page_align(size) {
            self.free_pages(phys, get_order(size));
        }
    }

    /// Adds blocks of `order` to `mc` until it holds `min_pages` of them.
    pub fn topup_memcache(&self, mc: &mut HypMemcache, min_pages: usize, order: u8) -> Result<()> {
        while mc.nr_pages() < min_pages {
            let phys = self.alloc_pages(order).ok_or(Error::NoMemory)?;
            mc.push(phys, order);
        }
        Ok(())
    }

    pub fn free_memcache(&self, mc: &mut HypMemcache) {
        while let Some(page) = mc.pop() {
            self.free_pages(page.phys, page.order);
        }
    }
}
