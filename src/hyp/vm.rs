// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hypervisor-side VM and vCPU state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;
use sync::SpinLock;

use crate::addr::is_page_aligned;
use crate::addr::HostKvm;
use crate::addr::PhysAddr;
use crate::addr::PAGE_SIZE;
use crate::hyp::memcache::HypMemcache;
use crate::hyp::pool::HypPool;
use crate::hyp::pviommu_host::SlotIndex;
use crate::hyp::pviommu_host::MAX_NR_PVIOMMU;
use crate::smccc::SmcccRegs;
use crate::Error;
use crate::Result;

/// Handles are allocated from this value upwards so that 0 is never valid.
pub const HANDLE_OFFSET: u32 = 0x1000;

/// Largest block a VM's IOMMU pool hands out.
const VM_IOMMU_POOL_MAX_ORDER: u8 = 6;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VmHandle(pub u32);

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Guest physical to host physical mappings of one VM.
#[derive(Debug, Default)]
pub struct GuestStage2 {
    // ipa -> (pa, size)
    maps: SpinLock<BTreeMap<u64, (PhysAddr, u64)>>,
}

impl GuestStage2 {
    pub fn map(&self, ipa: u64, phys: PhysAddr, size: u64) -> Result<()> {
        if size == 0
            || !is_page_aligned(ipa)
            || !is_page_aligned(size)
            || !phys.is_aligned(PAGE_SIZE)
        {
            return Err(Error::InvalidArgument);
        }
        let end = ipa.checked_add(size).ok_or(Error::InvalidArgument)?;
        let mut maps = self.maps.lock();
        if let Some((&prev, &(_, prev_size))) = maps.range(..end).next_back() {
            if prev + prev_size > ipa {
                return Err(Error::Conflict);
            }
        }
        maps.insert(ipa, (phys, size));
        Ok(())
    }

    /// Physical address backing `ipa` and the number of contiguous bytes from there.
    pub fn translate(&self, ipa: u64) -> Option<(PhysAddr, u64)> {
        let maps = self.maps.lock();
        let (&base, &(phys, size)) = maps.range(..=ipa).next_back()?;
        let off = ipa - base;
        if off >= size {
            return None;
        }
        Some((PhysAddr(phys.offset() + off), size - off))
    }
}

/// A protected VM as the hypervisor knows it.
pub struct HypVm {
    handle: VmHandle,
    host_kvm: HostKvm,
    nr_vcpus: usize,
    /// Table slots of the pvIOMMUs frozen for this VM, in table order.
    pub(crate) pviommus: ArrayVec<SlotIndex, MAX_NR_PVIOMMU>,
    /// Pages the host donated for this VM's IOMMU page tables.
    pub iommu_pool: SpinLock<HypPool>,
    pub stage2: GuestStage2,
}

impl HypVm {
    pub(crate) fn new(handle: VmHandle, host_kvm: HostKvm, nr_vcpus: usize) -> HypVm {
        HypVm {
            handle,
            host_kvm,
            nr_vcpus,
            pviommus: ArrayVec::new(),
            iommu_pool: SpinLock::new(HypPool::new(VM_IOMMU_POOL_MAX_ORDER)),
            stage2: Default::default(),
        }
    }

    pub fn handle(&self) -> VmHandle {
        self.handle
    }

    pub fn host_kvm(&self) -> HostKvm {
        self.host_kvm
    }

    pub fn nr_vcpus(&self) -> usize {
        self.nr_vcpus
    }

    pub fn nr_pviommus(&self) -> usize {
        self.pviommus.len()
    }
}

impl fmt::Debug for HypVm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HypVm")
            .field("handle", &self.handle)
            .field("host_kvm", &self.host_kvm)
            .field("nr_vcpus", &self.nr_vcpus)
            .field("pviommus", &self.pviommus)
            .finish()
    }
}

/// Where memory requested from the host should go.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemDest {
    /// The calling VM's IOMMU pool, through the vCPU memcache.
    VmIommu,
    /// The hypervisor IOMMU pools.
    HypIommu,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemRequest {
    /// Donate `nr_pages` blocks of `sz_alloc` bytes each.
    Pool {
        dest: MemDest,
        nr_pages: u64,
        sz_alloc: u64,
    },
    /// Fault in the guest memory at `[ipa, ipa + size)`.
    Map { ipa: u64, size: u64 },
}

/// Outcome of a guest hypercall.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HvcExit {
    /// Handled. Return to the guest with the registers as set.
    Guest,
    /// Exit to the host, which must service the request before running the vCPU again.
    Host(MemRequest),
}

pub struct HypVcpu {
    pub(crate) vm: Arc<HypVm>,
    idx: usize,
    pub regs: SmcccRegs,
    /// Address of the instruction after the trapping HVC.
    pub pc: u64,
    /// Pages the host put aside for this vCPU's IOMMU requests.
    pub iommu_mc: HypMemcache,
}

impl HypVcpu {
    pub(crate) fn new(vm: Arc<HypVm>, idx: usize) -> HypVcpu {
        HypVcpu {
            vm,
            idx,
            regs: Default::default(),
            pc: 0,
            iommu_mc: HypMemcache::new(),
        }
    }

    pub fn vm(&self) -> &HypVm {
        &self.vm
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Rewinds the PC so the HVC is issued again when the vCPU next runs.
    pub fn retry_hvc(&mut self) {
        self.pc = self.pc.wrapping_sub(4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage2_translate() {
        let s2 = GuestStage2::default();
        s2.map(0x8000_0000, PhysAddr(0x1_0000_0000), 0x4000).unwrap();
        assert_eq!(
            s2.translate(0x8000_1000),
            Some((PhysAddr(0x1_0000_1000), 0x3000))
        );
        assert_eq!(s2.translate(0x8000_4000), None);
        assert_eq!(s2.translate(0x7fff_f000), None);
        assert_eq!(
            s2.map(0x8000_3000, PhysAddr(0x2000_0000), 0x1000),
            Err(Error::Conflict)
        );
        assert_eq!(
            s2.map(0x8000_4800, PhysAddr(0x2000_0000), 0x1000),
            Err(Error::InvalidArgument)
        );
        s2.map(0x8000_4000, PhysAddr(0x2000_0000), 0x1000).unwrap();
    }
}
