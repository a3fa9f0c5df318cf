// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Registry of devices that can be assigned to protected VMs.
//!
//! A device moves from the host to a guest in two steps. The host first donates all of its MMIO
//! to the hypervisor, so that for a while neither side can reach it. On the guest's first access
//! the hypervisor checks the whole group is donated, resets each device and blocks its DMA, and
//! only then hands the group to the VM. The registry lock makes every ownership change atomic
//! with the checks that allow it.

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use arrayvec::ArrayVec;
use log::debug;
use log::error;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use sync::SpinLock;

use crate::addr::is_page_aligned;
use crate::addr::page_align;
use crate::addr::HostVirtAddr;
use crate::addr::HypVaLayout;
use crate::addr::PhysAddr;
use crate::addr::PAGE_SHIFT;
use crate::addr::PAGE_SIZE;
use crate::hyp::iommu::HypIommu;
use crate::hyp::mem_protect::HostStage2;
use crate::hyp::mem_protect::PageOwner;
use crate::hyp::vm::HypVm;
use crate::hyp::vm::VmHandle;
use crate::Error;
use crate::IommuId;
use crate::Result;

pub const MAX_DEV_RESOURCES: usize = 32;
pub const MAX_DEV_IOMMUS: usize = 32;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DevResource {
    pub base: u64,
    pub size: u64,
}

impl DevResource {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DevIommu {
    pub id: IommuId,
    pub endpoint: u64,
}

/// Puts a device back into a known state before it changes hands.
pub trait DeviceReset: Send + Sync {
    fn reset(&self, host_to_guest: bool) -> Result<()>;
}

impl<F> DeviceReset for F
where
    F: Fn(bool) -> Result<()> + Send + Sync,
{
    fn reset(&self, host_to_guest: bool) -> Result<()> {
        self(host_to_guest)
    }
}

#[derive(Default)]
pub struct PkvmDevice {
    pub resources: ArrayVec<DevResource, MAX_DEV_RESOURCES>,
    pub iommus: ArrayVec<DevIommu, MAX_DEV_IOMMUS>,
    /// Devices in one group are assigned to a VM together.
    pub group_id: u32,
    ctxt: Option<VmHandle>,
    refcount: u16,
    reset_handler: Option<Arc<dyn DeviceReset>>,
}

impl PkvmDevice {
    pub fn new(group_id: u32) -> PkvmDevice {
        PkvmDevice {
            group_id,
            ..Default::default()
        }
    }

    /// The VM that owns the device, if any.
    pub fn ctxt(&self) -> Option<VmHandle> {
        self.ctxt
    }

    pub fn refcount(&self) -> u16 {
        self.refcount
    }

    fn matches(&self, addr: u64, size: u64) -> bool {
        self.resources
            .iter()
            .any(|r| r.base == addr && r.size == size)
    }

    fn contains(&self, addr: u64) -> bool {
        self.resources.iter().any(|r| r.contains(addr))
    }

    fn has_endpoint(&self, iommu: IommuId, endpoint: u64) -> bool {
        self.iommus
            .iter()
            .any(|i| i.id == iommu && i.endpoint == endpoint)
    }

    fn reset(&self, host_to_guest: bool, iommu: &HypIommu) -> Result<()> {
        let handler = self.reset_handler.as_ref().ok_or(Error::NoDevice)?;
        handler.reset(host_to_guest)?;
        for i in &self.iommus {
            if let Err(e) = iommu.block_dma(i.id, i.endpoint, host_to_guest) {
                warn!(
                    "failed to block DMA of endpoint {} on IOMMU {}: {}",
                    i.endpoint, i.id, e
                );
                return Err(e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PkvmDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PkvmDevice")
            .field("resources", &self.resources)
            .field("iommus", &self.iommus)
            .field("group_id", &self.group_id)
            .field("ctxt", &self.ctxt)
            .field("refcount", &self.refcount)
            .field("has_reset_handler", &self.reset_handler.is_some())
            .finish()
    }
}

/// The device array as the host laid it out, about to be handed to the hypervisor.
#[derive(Debug, Default)]
pub struct DeviceHandoff {
    /// Host address of the array.
    pub va: Option<HostVirtAddr>,
    pub devices: Vec<PkvmDevice>,
}

impl DeviceHandoff {
    /// Bytes the host must set aside for the array.
    pub fn size(&self) -> Option<u64> {
        (size_of::<PkvmDevice>() as u64)
            .checked_mul(self.devices.len() as u64)
            .and_then(page_align)
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: SpinLock<Vec<PkvmDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        Default::default()
    }

    /// Takes over the host's device array.
    ///
    /// The pages backing the array are donated to the hypervisor. If that fails the registry
    /// stays empty, so no device can ever be assigned, and the error is returned.
    pub fn init(
        &self,
        handoff: DeviceHandoff,
        layout: &HypVaLayout,
        stage2: &HostStage2,
    ) -> Result<()> {
        if handoff.devices.is_empty() {
            return Ok(());
        }
        let res = Self::donate(&handoff, layout, stage2);
        let mut devices = self.devices.lock();
        match res {
            Ok(()) => {
                debug!("registered {} assignable devices", handoff.devices.len());
                *devices = handoff.devices;
                Ok(())
            }
            Err(e) => {
                error!("failed to donate the device registry: {}", e);
                devices.clear();
                Err(e)
            }
        }
    }

    fn donate(handoff: &DeviceHandoff, layout: &HypVaLayout, stage2: &HostStage2) -> Result<()> {
        let va = handoff.va.ok_or(Error::InvalidArgument)?;
        let size = handoff.size().ok_or(Error::InvalidArgument)?;
        if va.0 % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        let phys = layout
            .kern_hyp_va(va)
            .and_then(|hyp_va| layout.hyp_va_to_phys(hyp_va))
            .ok_or(Error::InvalidArgument)?;
        stage2.host_donate_hyp(phys.pfn(), size >> PAGE_SHIFT)
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner and reference count of the device with a resource at `addr`.
    pub fn state(&self, addr: u64) -> Option<(Option<VmHandle>, u16)> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.contains(addr))
            .map(|d| (d.ctxt, d.refcount))
    }

    /// Moves one resource of a host-owned device to the hypervisor, ahead of guest assignment.
    pub fn assign_mmio(&self, pfn: u64, nr_pages: u64, stage2: &HostStage2) -> Result<()> {
        let (addr, size) = to_range(pfn, nr_pages)?;
        let devices = self.devices.lock();
        let dev = devices
            .iter()
            .find(|d| d.matches(addr, size))
            .ok_or(Error::NoDevice)?;
        // A VM already has this device, no take backs.
        if dev.ctxt.is_some() || dev.refcount != 0 {
            return Err(Error::Busy);
        }
        stage2.host_donate_hyp(pfn, nr_pages)
    }

    /// Gives a donated resource back to the host. Not possible once a VM owns the device.
    pub fn reclaim_mmio(&self, pfn: u64, nr_pages: u64, stage2: &HostStage2) -> Result<()> {
        let (addr, size) = to_range(pfn, nr_pages)?;
        let devices = self.devices.lock();
        let dev = devices
            .iter()
            .find(|d| d.matches(addr, size))
            .ok_or(Error::NoDevice)?;
        if dev.ctxt.is_some() {
            return Err(Error::Busy);
        }
        stage2.hyp_donate_host(pfn, nr_pages)
    }

    /// Maps one MMIO page of a device into `vm` at `gfn`, assigning the device's group to the VM
    /// on first use.
    pub fn map_guest_mmio(
        &self,
        vm: &HypVm,
        pfn: u64,
        gfn: u64,
        stage2: &HostStage2,
        iommu: &HypIommu,
    ) -> Result<()> {
        let addr = pfn.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgument)?;
        let ipa = gfn.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgument)?;
        let mut devices = self.devices.lock();
        let idx = devices
            .iter()
            .position(|d| d.contains(addr))
            .ok_or(Error::NoDevice)?;
        let group_id = devices[idx].group_id;
        let ctxt = devices[idx].ctxt;
        match ctxt {
            // First use, the whole group must be with the hypervisor.
            None => group_assign(&mut devices, group_id, vm, stage2, iommu)?,
            Some(owner) if owner != vm.handle() => return Err(Error::Busy),
            Some(_) => {}
        }
        stage2.hyp_donate_guest(pfn, vm.handle())?;
        if let Err(e) = vm.stage2.map(ipa, PhysAddr(addr), PAGE_SIZE) {
            stage2.set_owner(PhysAddr(addr), PAGE_SIZE, PageOwner::Hyp)?;
            return Err(e);
        }
        Ok(())
    }

    /// Physical address of the device MMIO page `vm` has mapped at `ipa`.
    ///
    /// Fails with `NotFound` when nothing is mapped there and with `PermissionDenied` when the
    /// page is not a resource of a device `vm` owns.
    pub fn request_mmio(&self, vm: &HypVm, ipa: u64) -> Result<PhysAddr> {
        if !is_page_aligned(ipa) {
            return Err(Error::InvalidArgument);
        }
        let (phys, _) = vm.stage2.translate(ipa).ok_or(Error::NotFound)?;
        let end = phys.checked_add(PAGE_SIZE).ok_or(Error::InvalidArgument)?;
        let devices = self.devices.lock();
        let owned = devices
            .iter()
            .filter(|d| d.ctxt == Some(vm.handle()))
            .flat_map(|d| d.resources.iter())
            .any(|r| r.contains(phys.offset()) && end.offset() - r.base <= r.size);
        if !owned {
            return Err(Error::PermissionDenied);
        }
        Ok(phys)
    }

    /// Takes a reference on the device behind an IOMMU endpoint for `vm`.
    ///
    /// Endpoints that belong to no registered device need no reference.
    pub fn get_context(&self, iommu: IommuId, endpoint: u64, vm: VmHandle) -> Result<()> {
        let mut devices = self.devices.lock();
        let Some(dev) = devices.iter_mut().find(|d| d.has_endpoint(iommu, endpoint)) else {
            return Ok(());
        };
        if dev.ctxt != Some(vm) {
            return Err(Error::PermissionDenied);
        }
        dev.refcount = dev.refcount.checked_add(1).ok_or(Error::Busy)?;
        Ok(())
    }

    pub fn put_context(&self, iommu: IommuId, endpoint: u64) {
        let mut devices = self.devices.lock();
        if let Some(dev) = devices.iter_mut().find(|d| d.has_endpoint(iommu, endpoint)) {
            match dev.refcount.checked_sub(1) {
                Some(refcount) => dev.refcount = refcount,
                None => warn!("unbalanced put on endpoint {} of IOMMU {}", endpoint, iommu),
            }
        }
    }

    /// Installs the reset handler of the device with a resource at `phys`. Only one is allowed.
    pub fn register_reset(&self, phys: PhysAddr, handler: Arc<dyn DeviceReset>) -> Result<()> {
        let mut devices = self.devices.lock();
        let dev = devices
            .iter_mut()
            .find(|d| d.contains(phys.offset()))
            .ok_or(Error::NoDevice)?;
        if dev.reset_handler.is_some() {
            return Err(Error::Busy);
        }
        dev.reset_handler = Some(handler);
        Ok(())
    }

    /// Takes every device of `vm` back for the host.
    pub fn teardown(&self, vm: VmHandle, stage2: &HostStage2, iommu: &HypIommu) {
        let mut devices = self.devices.lock();
        for dev in devices.iter_mut().filter(|d| d.ctxt == Some(vm)) {
            if let Err(e) = dev.reset(false, iommu) {
                warn!("failed to reset device of group {}: {}", dev.group_id, e);
            }
            dev.ctxt = None;
            // The VM's domains are gone, and with them every endpoint reference.
            dev.refcount = 0;
            for res in &dev.resources {
                if let Err(e) = stage2.set_owner(PhysAddr(res.base), res.size, PageOwner::Host) {
                    warn!("failed to return MMIO {:#x} to the host: {}", res.base, e);
                }
            }
        }
    }
}

fn to_range(pfn: u64, nr_pages: u64) -> Result<(u64, u64)> {
    let addr = pfn.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgument)?;
    let size = nr_pages.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgument)?;
    Ok((addr, size))
}

/// Hands every device of `group_id` to `vm`, or none of them.
fn group_assign(
    devices: &mut [PkvmDevice],
    group_id: u32,
    vm: &HypVm,
    stage2: &HostStage2,
    iommu: &HypIommu,
) -> Result<()> {
    let mut res = Ok(());
    let mut done = 0;
    for (i, dev) in devices.iter_mut().enumerate() {
        done = i;
        if dev.group_id != group_id {
            continue;
        }
        if dev.ctxt.is_some() || dev.refcount != 0 {
            res = Err(Error::PermissionDenied);
            break;
        }
        if let Err(e) = assign(dev, vm, stage2, iommu) {
            res = Err(e);
            break;
        }
    }
    if res.is_err() {
        for dev in devices[..done].iter_mut().filter(|d| d.group_id == group_id) {
            dev.ctxt = None;
        }
    }
    res
}

fn assign(dev: &mut PkvmDevice, vm: &HypVm, stage2: &HostStage2, iommu: &HypIommu) -> Result<()> {
    for res in &dev.resources {
        stage2.check_range_owned(PhysAddr(res.base), res.size)?;
    }
    dev.reset(true, iommu)?;
    dev.ctxt = Some(vm.handle());
    Ok(())
}
