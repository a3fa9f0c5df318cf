// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The pvIOMMU instance table.
//!
//! The host creates pvIOMMU instances for a VM it is about to start and fills each with
//! vsid -> (iommu, sid) routes. When the VM is created the hypervisor freezes every instance the
//! host made for it; from then on the host can no longer touch them and the guest's hypercalls
//! resolve endpoints through the frozen routes only. Teardown returns the slots to the table.
//!
//! The table is a fixed arena of [`MAX_NR_PVIOMMU`] slots. A VM refers to its instances by
//! [`SlotIndex`]. Every access, read or write, takes the one table lock.

use arrayvec::ArrayVec;
use log::debug;
use log::warn;
use sync::SpinLock;

use crate::addr::HostKvm;
use crate::hyp::vm::HypVm;
use crate::Error;
use crate::IommuId;
use crate::Result;

pub const MAX_NR_PVIOMMU: usize = 32;
pub const MAX_NR_SID_PER_PVIOMMU: usize = 16;

static_assertions::const_assert!(MAX_NR_PVIOMMU <= u32::BITS as usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PvIommuEntry {
    pub iommu: IommuId,
    pub sid: u32,
    pub vsid: u32,
}

/// Where a guest virtual endpoint really lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PvIommuRoute {
    pub sid: u32,
    pub iommu: IommuId,
}

/// Index of a slot in the instance table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SlotIndex(u8);

impl SlotIndex {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, Default)]
struct PvIommuHost {
    kvm: Option<HostKvm>,
    pviommu_id: u32,
    entries: ArrayVec<PvIommuEntry, MAX_NR_SID_PER_PVIOMMU>,
    finalized: bool,
}

impl PvIommuHost {
    fn owned_by(&self, kvm: HostKvm) -> bool {
        self.kvm == Some(kvm)
    }

    fn clear(&mut self) {
        *self = Default::default();
    }
}

#[derive(Debug, Default)]
struct Slots {
    slots: [PvIommuHost; MAX_NR_PVIOMMU],
    /// Bit `i` is set while slot `i` has an owner.
    live: u32,
}

impl Slots {
    fn release(&mut self, idx: usize) {
        self.slots[idx].clear();
        self.live &= !(1 << idx);
    }
}

#[derive(Debug, Default)]
pub struct PvIommuTable {
    inner: SpinLock<Slots>,
}

impl PvIommuTable {
    pub fn new() -> PvIommuTable {
        Default::default()
    }

    /// Creates instance `pviommu_id` for the VM `kvm` in the first free slot.
    ///
    /// Fails with `Busy` when every slot is taken and with `InvalidArgument` when the VM already
    /// has an instance with that id.
    pub fn attach(&self, kvm: HostKvm, pviommu_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .slots
            .iter()
            .any(|s| s.owned_by(kvm) && s.pviommu_id == pviommu_id)
        {
            return Err(Error::InvalidArgument);
        }
        let free = !inner.live;
        if free == 0 {
            return Err(Error::Busy);
        }
        let idx = free.trailing_zeros() as usize;
        let slot = &mut inner.slots[idx];
        debug_assert!(slot.kvm.is_none() && !slot.finalized);
        slot.kvm = Some(kvm);
        slot.pviommu_id = pviommu_id;
        slot.entries.clear();
        inner.live |= 1 << idx;
        debug!("pviommu {} of {:?} in slot {}", pviommu_id, kvm, idx);
        Ok(())
    }

    /// Adds a vsid -> (iommu, sid) route to an instance that has not been frozen yet.
    pub fn add_vsid(
        &self,
        kvm: HostKvm,
        pviommu_id: u32,
        iommu: IommuId,
        sid: u32,
        vsid: u32,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| !s.finalized && s.owned_by(kvm) && s.pviommu_id == pviommu_id)
            .ok_or(Error::NotFound)?;
        if slot.entries.is_full() {
            return Err(Error::Busy);
        }
        if slot.entries.iter().any(|e| e.vsid == vsid) {
            return Err(Error::Conflict);
        }
        slot.entries.push(PvIommuEntry { iommu, sid, vsid });
        Ok(())
    }

    /// Freezes every instance the host made for `vm` and records them on the VM, in table order.
    ///
    /// Instances already frozen belong to the VM that froze them and are left alone.
    pub fn finalise(&self, vm: &mut HypVm) -> Result<()> {
        let kvm = vm.host_kvm();
        vm.pviommus.clear();
        let mut inner = self.inner.lock();
        for (idx, slot) in inner.slots.iter_mut().enumerate() {
            if !slot.owned_by(kvm) || slot.finalized {
                continue;
            }
            // The list starts empty and each slot is frozen once.
            if vm.pviommus.try_push(SlotIndex(idx as u8)).is_err() {
                return Err(Error::Busy);
            }
            slot.finalized = true;
        }
        debug!("vm {} finalised {} pviommus", vm.handle(), vm.pviommus.len());
        Ok(())
    }

    /// Releases the instances of `vm`.
    ///
    /// Instances the host attached to the VM after it was created were never frozen and are not
    /// on the VM's list; they are released too so they cannot leak into a later VM.
    pub fn teardown(&self, vm: &mut HypVm) {
        let kvm = vm.host_kvm();
        let mut inner = self.inner.lock();
        for slot in vm.pviommus.drain(..) {
            if inner.slots[slot.idx()].owned_by(kvm) {
                inner.release(slot.idx());
            }
        }
        // Not on the VM's list: the host attached these after the VM was created. Only one live
        // VM exists per host kvm, so they can be nobody else's.
        for idx in 0..MAX_NR_PVIOMMU {
            if inner.slots[idx].owned_by(kvm) {
                warn!(
                    "releasing pviommu {} attached to vm {} after creation",
                    inner.slots[idx].pviommu_id,
                    vm.handle()
                );
                inner.release(idx);
            }
        }
    }

    /// Resolves a guest (pviommu, vsid) pair through the instances frozen for `vm`.
    pub fn get_route(&self, vm: &HypVm, pviommu_id: u32, vsid: u32) -> Result<PvIommuRoute> {
        let kvm = vm.host_kvm();
        let inner = self.inner.lock();
        vm.pviommus
            .iter()
            .map(|s| &inner.slots[s.idx()])
            .filter(|s| s.finalized && s.owned_by(kvm) && s.pviommu_id == pviommu_id)
            .flat_map(|s| s.entries.iter())
            .find(|e| e.vsid == vsid)
            .map(|e| PvIommuRoute {
                sid: e.sid,
                iommu: e.iommu,
            })
            .ok_or(Error::NotFound)
    }

    /// Number of slots currently owned.
    pub fn nr_live(&self) -> usize {
        self.inner.lock().live.count_ones() as usize
    }

    /// Number of routes in instance `pviommu_id` of `kvm`, if it exists.
    pub fn nr_entries(&self, kvm: HostKvm, pviommu_id: u32) -> Option<usize> {
        self.inner
            .lock()
            .slots
            .iter()
            .find(|s| s.owned_by(kvm) && s.pviommu_id == pviommu_id)
            .map(|s| s.entries.len())
    }
}
