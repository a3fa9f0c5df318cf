// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Page ownership tracking between the host, the hypervisor and guests.
//!
//! Every transition is all-or-nothing: a range is checked in full before any page in it changes
//! hands.

use std::collections::BTreeMap;

use log::warn;
use sync::SpinLock;

use crate::addr::PhysAddr;
use crate::addr::PAGE_SHIFT;
use crate::addr::PAGE_SIZE;
use crate::hyp::vm::VmHandle;
use crate::Error;
use crate::Result;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageOwner {
    Host,
    Hyp,
    Guest(VmHandle),
}

/// Owner of every physical page. Pages not listed belong to the host.
#[derive(Debug, Default)]
pub struct HostStage2 {
    owners: SpinLock<BTreeMap<u64, PageOwner>>,
}

fn pfn_range(pfn: u64, nr_pages: u64) -> Result<std::ops::Range<u64>> {
    if nr_pages == 0 {
        return Err(Error::InvalidArgument);
    }
    let end = pfn.checked_add(nr_pages).ok_or(Error::InvalidArgument)?;
    Ok(pfn..end)
}

fn byte_range(phys: PhysAddr, size: u64) -> Result<std::ops::Range<u64>> {
    if size == 0 || !phys.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 {
        return Err(Error::InvalidArgument);
    }
    pfn_range(phys.pfn(), size >> PAGE_SHIFT)
}

impl HostStage2 {
    pub fn new() -> HostStage2 {
        Default::default()
    }

    pub fn owner(&self, pfn: u64) -> PageOwner {
        self.owners
            .lock()
            .get(&pfn)
            .copied()
            .unwrap_or(PageOwner::Host)
    }

    fn transition(&self, pfns: std::ops::Range<u64>, from: PageOwner, to: PageOwner) -> Result<()> {
        let mut owners = self.owners.lock();
        let current = |pfn: &u64| owners.get(pfn).copied().unwrap_or(PageOwner::Host);
        if !pfns.clone().all(|pfn| current(&pfn) == from) {
            return Err(Error::PermissionDenied);
        }
        for pfn in pfns {
            if to == PageOwner::Host {
                owners.remove(&pfn);
            } else {
                owners.insert(pfn, to);
            }
        }
        Ok(())
    }

    /// Moves `nr_pages` pages starting at `pfn` from the host to the hypervisor.
    pub fn host_donate_hyp(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        self.transition(pfn_range(pfn, nr_pages)?, PageOwner::Host, PageOwner::Hyp)
    }

    /// Gives `nr_pages` hypervisor pages starting at `pfn` back to the host.
    pub fn hyp_donate_host(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        self.transition(pfn_range(pfn, nr_pages)?, PageOwner::Hyp, PageOwner::Host)
    }

    /// Hands a hypervisor page to a guest.
    pub fn hyp_donate_guest(&self, pfn: u64, vm: VmHandle) -> Result<()> {
        self.transition(pfn_range(pfn, 1)?, PageOwner::Hyp, PageOwner::Guest(vm))
    }

    /// Succeeds when every page of `[phys, phys + size)` belongs to the hypervisor.
    pub fn check_range_owned(&self, phys: PhysAddr, size: u64) -> Result<()> {
        let pfns = byte_range(phys, size)?;
        let owners = self.owners.lock();
        if pfns.into_iter().all(|pfn| owners.get(&pfn) == Some(&PageOwner::Hyp)) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// Forces the owner of a byte range, whatever it was before. Used when tearing down a VM.
    pub fn set_owner(&self, phys: PhysAddr, size: u64, owner: PageOwner) -> Result<()> {
        let pfns = byte_range(phys, size)?;
        let mut owners = self.owners.lock();
        for pfn in pfns {
            match owners.get(&pfn) {
                Some(PageOwner::Host) | None if owner == PageOwner::Host => continue,
                Some(PageOwner::Host) | None => {
                    warn!("forcing host page {:#x} to {:?}", pfn, owner);
                }
                _ => {}
            }
            if owner == PageOwner::Host {
                owners.remove(&pfn);
            } else {
                owners.insert(pfn, owner);
            }
        }
        Ok(())
    }

    /// Returns every page a guest still owns to the host.
    pub fn reclaim_guest(&self, vm: VmHandle) -> usize {
        let mut owners = self.owners.lock();
        let before = owners.len();
        owners.retain(|_, owner| *owner != PageOwner::Guest(vm));
        before - owners.len()
    }
}
