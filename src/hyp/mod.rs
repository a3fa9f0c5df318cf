// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hypervisor side.
//!
//! [`Pkvm`] holds every piece of hypervisor state and is the only way in: the `host_*` methods
//! are the calls the host kernel makes, [`Pkvm::handle_guest_hvc`] is the entry point for a
//! trapped guest hypercall.

pub mod device;
pub mod iommu;
pub mod mem_protect;
pub mod memcache;
pub mod pool;
pub mod pviommu;
pub mod pviommu_host;
pub mod vm;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;
use sync::SpinLock;

use crate::addr::HostVirtAddr;
use crate::addr::HostVmRef;
use crate::addr::HypVaLayout;
use crate::addr::PhysAddr;
use crate::addr::PAGE_SIZE;
use crate::hyp::device::DeviceHandoff;
use crate::hyp::device::DeviceRegistry;
use crate::hyp::device::DeviceReset;
use crate::hyp::iommu::HypIommu;
use crate::hyp::iommu::HypIommuOps;
use crate::hyp::mem_protect::HostStage2;
use crate::hyp::mem_protect::PageOwner;
use crate::hyp::memcache::HypMemcache;
use crate::hyp::pool::reclaim_hyp_pool;
use crate::hyp::pviommu::handle_pviommu_hvc;
use crate::hyp::pviommu::teardown_guest_domains;
use crate::hyp::pviommu::GuestDomainIds;
use crate::hyp::pviommu_host::PvIommuRoute;
use crate::hyp::pviommu_host::PvIommuTable;
use crate::hyp::vm::HvcExit;
use crate::hyp::vm::HypVcpu;
use crate::hyp::vm::HypVm;
use crate::hyp::vm::VmHandle;
use crate::hyp::vm::HANDLE_OFFSET;
use crate::smccc::ARM_SMCCC_VENDOR_HYP_KVM_DEV_REQ_MMIO_FUNC_ID;
use crate::smccc::ARM_SMCCC_VENDOR_HYP_KVM_PVIOMMU_OP_FUNC_ID;
use crate::smccc::SMCCC_RET_INVALID_PARAMETER;
use crate::smccc::SMCCC_RET_NOT_SUPPORTED;
use crate::smccc::SMCCC_RET_SUCCESS;
use crate::Error;
use crate::IommuId;
use crate::Result;

/// All hypervisor state.
pub struct Pkvm {
    layout: HypVaLayout,
    pub stage2: HostStage2,
    pub pviommus: PvIommuTable,
    pub devices: DeviceRegistry,
    pub iommu: HypIommu,
    pub(crate) guest_domains: SpinLock<GuestDomainIds>,
    vms: SpinLock<BTreeMap<VmHandle, Arc<HypVm>>>,
    next_handle: AtomicU32,
}

impl Pkvm {
    pub fn new(layout: HypVaLayout) -> Pkvm {
        Pkvm {
            layout,
            stage2: HostStage2::new(),
            pviommus: PvIommuTable::new(),
            devices: DeviceRegistry::new(),
            iommu: HypIommu::new(),
            guest_domains: Default::default(),
            vms: Default::default(),
            next_handle: AtomicU32::new(HANDLE_OFFSET),
        }
    }

    pub fn layout(&self) -> &HypVaLayout {
        &self.layout
    }

    /// Creates pvIOMMU instance `pviommu_id` for a VM the host has not started yet.
    pub fn host_pviommu_attach(&self, vm: HostVmRef, pviommu_id: u32) -> Result<()> {
        let kvm = self.layout.host_kvm(vm).ok_or(Error::InvalidArgument)?;
        self.pviommus.attach(kvm, pviommu_id)
    }

    pub fn host_pviommu_add_vsid(
        &self,
        vm: HostVmRef,
        pviommu_id: u32,
        iommu: IommuId,
        sid: u32,
        vsid: u32,
    ) -> Result<()> {
        let kvm = self.layout.host_kvm(vm).ok_or(Error::NotFound)?;
        self.pviommus.add_vsid(kvm, pviommu_id, iommu, sid, vsid)
    }

    /// Installs the hypervisor IOMMU driver.
    ///
    /// `domains_root` is the host address of the zeroed domain table root, `atomic_mc` the pages
    /// for the atomic pool.
    pub fn host_iommu_init(
        &self,
        ops: Box<dyn HypIommuOps>,
        domains_root: HostVirtAddr,
        atomic_mc: &mut HypMemcache,
        init_arg: u64,
    ) -> Result<()> {
        let root = self
            .layout
            .host_va_to_phys(domains_root)
            .ok_or(Error::InvalidArgument)?;
        self.iommu
            .init(ops, root, atomic_mc, init_arg, &self.stage2)
    }

    pub fn host_set_cma(&self, base: PhysAddr, size: u64) -> Result<()> {
        self.iommu.pools().set_cma(base, size)
    }

    /// Donates the pages of `mc` to the hypervisor IOMMU pools.
    pub fn host_iommu_refill(&self, mc: &mut HypMemcache) -> Result<()> {
        self.iommu.refill(mc, &self.stage2)
    }

    /// Returns up to `target` free pages of the hypervisor IOMMU pools through `mc`.
    pub fn host_iommu_reclaim(&self, mc: &mut HypMemcache, target: u64) {
        self.iommu.reclaim(mc, target, &self.stage2)
    }

    pub fn host_iommu_reclaimable(&self) -> u64 {
        self.iommu.reclaimable()
    }

    /// Power domain change of `iommu`.
    pub fn host_hvc_pd(&self, iommu: IommuId, on: bool) -> Result<()> {
        self.iommu.power(iommu, on)
    }

    pub fn host_devices_init(&self, handoff: DeviceHandoff) -> Result<()> {
        self.devices.init(handoff, &self.layout, &self.stage2)
    }

    pub fn host_device_assign_mmio(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        self.devices.assign_mmio(pfn, nr_pages, &self.stage2)
    }

    pub fn host_device_reclaim_mmio(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        self.devices.reclaim_mmio(pfn, nr_pages, &self.stage2)
    }

    /// Resolves a guest stage-2 fault on device MMIO.
    pub fn host_map_guest_mmio(&self, vcpu: &HypVcpu, pfn: u64, gfn: u64) -> Result<()> {
        self.devices
            .map_guest_mmio(vcpu.vm(), pfn, gfn, &self.stage2, &self.iommu)
    }

    /// Gives the host page `pfn` to the VM of `vcpu` at `gfn`.
    pub fn host_donate_guest(&self, vcpu: &HypVcpu, pfn: u64, gfn: u64) -> Result<()> {
        let vm = vcpu.vm();
        let ipa = gfn.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgument)?;
        self.stage2.host_donate_hyp(pfn, 1)?;
        if let Err(e) = self.stage2.hyp_donate_guest(pfn, vm.handle()) {
            self.stage2.hyp_donate_host(pfn, 1)?;
            return Err(e);
        }
        if let Err(e) = vm.stage2.map(ipa, PhysAddr::from_pfn(pfn), PAGE_SIZE) {
            self.stage2
                .set_owner(PhysAddr::from_pfn(pfn), PAGE_SIZE, PageOwner::Host)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn host_register_device_reset(
        &self,
        phys: PhysAddr,
        handler: Arc<dyn DeviceReset>,
    ) -> Result<()> {
        self.devices.register_reset(phys, handler)
    }

    /// Creates the hypervisor side of a protected VM and freezes its pvIOMMU instances.
    ///
    /// A host VM has at most one hypervisor VM at a time; a second one gets `Busy`.
    pub fn init_vm(&self, vm: HostVmRef, nr_vcpus: usize) -> Result<VmHandle> {
        let kvm = self.layout.host_kvm(vm).ok_or(Error::InvalidArgument)?;
        if nr_vcpus == 0 {
            return Err(Error::InvalidArgument);
        }
        // Held until the VM is visible so two creations for one host VM cannot interleave.
        let mut vms = self.vms.lock();
        if vms.values().any(|v| v.host_kvm() == kvm) {
            warn!("host vm {:?} already has a protected vm", kvm);
            return Err(Error::Busy);
        }
        let handle = VmHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut hyp_vm = HypVm::new(handle, kvm, nr_vcpus);
        self.pviommus.finalise(&mut hyp_vm)?;
        info!(
            "vm {} created with {} pvIOMMU instances",
            handle,
            hyp_vm.nr_pviommus()
        );
        vms.insert(handle, Arc::new(hyp_vm));
        Ok(handle)
    }

    pub fn init_vcpu(&self, handle: VmHandle, idx: usize) -> Result<HypVcpu> {
        let vm = self.vm(handle).ok_or(Error::NotFound)?;
        if idx >= vm.nr_vcpus() {
            return Err(Error::InvalidArgument);
        }
        Ok(HypVcpu::new(vm, idx))
    }

    pub fn vm(&self, handle: VmHandle) -> Option<Arc<HypVm>> {
        self.vms.lock().get(&handle).cloned()
    }

    pub fn get_route(&self, handle: VmHandle, pviommu_id: u32, vsid: u32) -> Result<PvIommuRoute> {
        let vm = self.vm(handle).ok_or(Error::NotFound)?;
        self.pviommus.get_route(&vm, pviommu_id, vsid)
    }

    /// Destroys a VM whose vCPUs are all gone.
    ///
    /// Everything the VM held is released: its domains, pvIOMMU instances and devices. The pages
    /// of its IOMMU pool come back in the returned memcache.
    pub fn teardown_vm(&self, handle: VmHandle) -> Result<HypMemcache> {
        let vm = {
            let mut vms = self.vms.lock();
            // Every vCPU holds a reference, and `vm()` only clones under this lock.
            if Arc::strong_count(vms.get(&handle).ok_or(Error::NotFound)?) != 1 {
                return Err(Error::Busy);
            }
            vms.remove(&handle).ok_or(Error::NotFound)?
        };
        let mut vm = Arc::try_unwrap(vm).map_err(|_| Error::Busy)?;
        teardown_guest_domains(self, &vm);
        // Also takes instances the host attached after creation, which never made the VM's list.
        self.pviommus.teardown(&mut vm);
        self.devices.teardown(handle, &self.stage2, &self.iommu);

        let mut mc = HypMemcache::new();
        reclaim_hyp_pool(&vm.iommu_pool, &mut mc, u64::MAX, &self.stage2);
        let leaked = self.stage2.reclaim_guest(handle);
        if leaked != 0 {
            warn!("vm {}: {} guest pages returned to the host", handle, leaked);
        }
        debug!("vm {} destroyed", handle);
        Ok(mc)
    }

    /// Entry point for a guest HVC trapped on `vcpu`.
    pub fn handle_guest_hvc(&self, vcpu: &mut HypVcpu) -> HvcExit {
        match vcpu.regs.func_id() {
            ARM_SMCCC_VENDOR_HYP_KVM_PVIOMMU_OP_FUNC_ID => handle_pviommu_hvc(self, vcpu),
            ARM_SMCCC_VENDOR_HYP_KVM_DEV_REQ_MMIO_FUNC_ID => self.handle_request_mmio(vcpu),
            _ => {
                vcpu.regs.set_retval(SMCCC_RET_NOT_SUPPORTED, 0, 0, 0);
                HvcExit::Guest
            }
        }
    }

    fn handle_request_mmio(&self, vcpu: &mut HypVcpu) -> HvcExit {
        let ipa = vcpu.regs.arg(1);
        let res = if vcpu.regs.args_zero(2..=3) {
            self.devices.request_mmio(vcpu.vm(), ipa)
        } else {
            Err(Error::InvalidArgument)
        };
        match res {
            Ok(token) => vcpu.regs.set_retval(SMCCC_RET_SUCCESS, token.offset(), 0, 0),
            Err(e) => {
                debug!("vm {}: MMIO request at {:#x} refused: {}", vcpu.vm().handle(), ipa, e);
                vcpu.regs.set_retval(SMCCC_RET_INVALID_PARAMETER, 0, 0, 0);
            }
        }
        HvcExit::Guest
    }
}
