// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side of the IOMMU driver registration.
//!
//! Exactly one IOMMU driver may register with [`KvmIommu`]. It is published with a single
//! compare-and-exchange with release ordering, and every use loads it with acquire ordering, so
//! whatever the driver set up before registering is visible to all later callers.

use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

use bitflags::bitflags;
use log::error;
use log::info;
use log::warn;
use sync::Mutex;

use crate::addr::get_order;
use crate::addr::PhysAddr;
use crate::addr::PAGE_SIZE;
use crate::addr::PMD_ORDER;
use crate::host::cma::IommuCma;
use crate::host::memory::HostMemory;
use crate::hyp::iommu::HypIommuOps;
use crate::hyp::iommu::KVM_IOMMU_DOMAINS_ROOT_SIZE;
use crate::hyp::memcache::HypMemcache;
use crate::hyp::vm::HypVcpu;
use crate::hyp::vm::MemDest;
use crate::hyp::vm::MemRequest;
use crate::hyp::Pkvm;
use crate::Error;
use crate::IommuId;
use crate::Result;

bitflags! {
    /// Optional parts of a [`KvmIommuDriver`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct DriverCaps: u32 {
        /// Resolves firmware IOMMU nodes to ids.
        const ID_BY_OF = 1 << 0;
        /// Enumerates the IOMMU endpoints of a device.
        const DEVICE_IDS = 1 << 1;
        /// Has its own allocator for guest page-table memory.
        const GUEST_ALLOC = 1 << 2;
    }
}

/// A device as the host kernel sees it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostDevice {
    pub name: String,
    /// Firmware node of the device.
    pub of_node: String,
}

/// The host half of an IOMMU driver.
///
/// Methods outside the capabilities reported by [`KvmIommuDriver::caps`] are never called.
pub trait KvmIommuDriver: Send + Sync {
    fn caps(&self) -> DriverCaps;

    /// Brings the driver up. Usually ends with a call to [`KvmIommu::init_hyp`].
    fn init_driver(&self, kvm_iommu: &KvmIommu) -> Result<()>;

    fn remove_driver(&self);

    fn get_iommu_id_by_of(&self, _node: &str) -> IommuId {
        0
    }

    fn get_device_iommu_num_ids(&self, _dev: &HostDevice) -> usize {
        0
    }

    /// IOMMU and stream id of endpoint `idx` of `dev`.
    fn get_device_iommu_id(&self, _dev: &HostDevice, _idx: usize) -> Result<(IommuId, u32)> {
        Err(Error::NoDevice)
    }

    fn guest_alloc(&self, _order: u8) -> Option<PhysAddr> {
        None
    }

    fn guest_free(&self, _phys: PhysAddr, _order: u8) {}
}

type DriverPtr = *mut Arc<dyn KvmIommuDriver>;

// A removed driver, kept alive until the registry itself goes away because callers may still
// hold references obtained before the removal.
struct Retired(DriverPtr);

// SAFETY: the pointee is an `Arc` of a `Send + Sync` driver.
unsafe impl Send for Retired {}

pub struct KvmIommu {
    pkvm: Arc<Pkvm>,
    mem: Arc<HostMemory>,
    driver: AtomicPtr<Arc<dyn KvmIommuDriver>>,
    retired: Mutex<Vec<Retired>>,
    domains_root: Mutex<Option<PhysAddr>>,
    cma: OnceLock<IommuCma>,
}

impl KvmIommu {
    pub fn new(pkvm: Arc<Pkvm>, mem: Arc<HostMemory>) -> KvmIommu {
        KvmIommu {
            pkvm,
            mem,
            driver: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Vec::new()),
            domains_root: Mutex::new(None),
            cma: OnceLock::new(),
        }
    }

    pub fn pkvm(&self) -> &Arc<Pkvm> {
        &self.pkvm
    }

    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.mem
    }

    /// Registers the IOMMU driver. The first caller wins, later ones get `Busy`.
    pub fn register_driver(&self, driver: Arc<dyn KvmIommuDriver>) -> Result<()> {
        let new = Box::into_raw(Box::new(driver));
        match self
            .driver
            .compare_exchange(ptr::null_mut(), new, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => {
                info!("IOMMU driver registered");
                Ok(())
            }
            Err(_) => {
                // SAFETY: `new` came from `Box::into_raw` above and was never published.
                drop(unsafe { Box::from_raw(new) });
                Err(Error::Busy)
            }
        }
    }

    /// The registered driver, if any.
    pub fn driver(&self) -> Option<&Arc<dyn KvmIommuDriver>> {
        let driver = self.driver.load(Ordering::Acquire);
        // SAFETY: a published pointer stays valid until `self` is dropped, removal only moves it
        // to `retired`.
        unsafe { driver.as_ref() }
    }

    /// Allocates the domain table root and brings up the registered driver.
    pub fn init_driver(&self) -> Result<()> {
        let Some(driver) = self
            .driver()
            .filter(|d| d.caps().contains(DriverCaps::ID_BY_OF))
        else {
            error!(
                "pKVM enabled without an IOMMU driver, do not run confidential workloads in \
                 virtual machines"
            );
            return Err(Error::NoDevice);
        };
        {
            let mut root = self.domains_root.lock();
            if root.is_none() {
                let phys = self
                    .mem
                    .alloc_pages(get_order(KVM_IOMMU_DOMAINS_ROOT_SIZE))
                    .ok_or(Error::NoMemory)?;
                *root = Some(phys);
            }
        }
        driver.init_driver(self)
    }

    /// Installs the hypervisor half of the driver. `atomic_mc` fills the atomic pool.
    pub fn init_hyp(
        &self,
        ops: Box<dyn HypIommuOps>,
        atomic_mc: &mut HypMemcache,
        init_arg: u64,
    ) -> Result<()> {
        let root = self.domains_root.lock().ok_or(Error::InvalidArgument)?;
        let root_va = self.mem.virt(root).ok_or(Error::InvalidArgument)?;
        self.pkvm
            .host_iommu_init(ops, root_va, atomic_mc, init_arg)
    }

    /// Removes the registered driver. Another driver may register afterwards.
    ///
    /// Of concurrent callers only the one that unpublishes the driver tells it to go away.
    pub fn remove_driver(&self) {
        let old = self.driver.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: a published pointer stays valid until `self` is dropped, and `old` is about to
        // move to `retired`.
        let Some(driver) = (unsafe { old.as_ref() }) else {
            return;
        };
        driver.remove_driver();
        self.retired.lock().push(Retired(old));
        info!("IOMMU driver removed");
    }

    /// Id of the IOMMU behind firmware node `node`, 0 without a driver.
    pub fn get_iommu_id_by_of(&self, node: &str) -> IommuId {
        match self.driver() {
            Some(d) if d.caps().contains(DriverCaps::ID_BY_OF) => d.get_iommu_id_by_of(node),
            _ => 0,
        }
    }

    fn power(&self, dev: &HostDevice, on: bool) -> Result<()> {
        let id = self.get_iommu_id_by_of(&dev.of_node);
        self.pkvm.host_hvc_pd(id, on)
    }

    /// Tells the hypervisor the IOMMU `dev` is about to lose power.
    pub fn suspend(&self, dev: &HostDevice) -> Result<()> {
        self.power(dev, false)
    }

    pub fn resume(&self, dev: &HostDevice) -> Result<()> {
        self.power(dev, true)
    }

    pub fn device_num_ids(&self, dev: &HostDevice) -> usize {
        match self.driver() {
            Some(d) if d.caps().contains(DriverCaps::DEVICE_IDS) => {
                d.get_device_iommu_num_ids(dev)
            }
            _ => 0,
        }
    }

    pub fn device_id(&self, dev: &HostDevice, idx: usize) -> Result<(IommuId, u32)> {
        match self.driver() {
            Some(d) if d.caps().contains(DriverCaps::DEVICE_IDS) => {
                d.get_device_iommu_id(dev, idx)
            }
            _ => Err(Error::NoDevice),
        }
    }

    fn guest_allocator(&self) -> Option<&Arc<dyn KvmIommuDriver>> {
        self.driver()
            .filter(|d| d.caps().contains(DriverCaps::GUEST_ALLOC))
    }

    /// Tops `mc` up to `nr_pages` blocks of `pgsize` bytes for a guest's IOMMU page tables.
    pub fn guest_alloc_mc(
        &self,
        mc: &mut HypMemcache,
        pgsize: u64,
        nr_pages: usize,
    ) -> Result<()> {
        let order = get_order(pgsize);
        let Some(driver) = self.guest_allocator() else {
            return self.mem.topup_memcache(mc, nr_pages, order);
        };
        while mc.nr_pages() < nr_pages {
            let phys = driver.guest_alloc(order).ok_or(Error::NoMemory)?;
            mc.push(phys, order);
        }
        Ok(())
    }

    pub fn guest_free_mc(&self, mc: &mut HypMemcache) {
        let Some(driver) = self.guest_allocator() else {
            return self.mem.free_memcache(mc);
        };
        while let Some(page) = mc.pop() {
            driver.guest_free(page.phys, page.order);
        }
    }

    /// Sets up the IOMMU CMA region and tells the hypervisor about it.
    pub fn set_cma(&self, cma: IommuCma) -> Result<()> {
        self.pkvm.host_set_cma(cma.base(), cma.size())?;
        self.cma.set(cma).map_err(|_| Error::Busy)
    }

    pub fn cma(&self) -> Option<&IommuCma> {
        self.cma.get()
    }

    fn alloc_block(&self, order: u8) -> Option<PhysAddr> {
        if order == PMD_ORDER {
            if let Some(phys) = self.cma().and_then(|cma| cma.alloc_pmd()) {
                return Some(phys);
            }
        }
        self.mem.alloc_pages(order)
    }

    fn free_block(&self, phys: PhysAddr, order: u8) {
        match self.cma() {
            Some(cma)
                if order == PMD_ORDER
                    && phys.offset() >= cma.base().offset()
                    && phys.offset() - cma.base().offset() < cma.size() =>
            {
                cma.free_pmd(phys)
            }
            _ => self.mem.free_pages(phys, order),
        }
    }

    /// Donates `nr_pages` blocks of `sz_alloc` bytes to the hypervisor IOMMU pools.
    pub fn refill_hyp(&self, nr_pages: u64, sz_alloc: u64) -> Result<()> {
        let order = get_order(sz_alloc);
        let mut mc = HypMemcache::new();
        let mut res = Ok(());
        for _ in 0..nr_pages {
            match self.alloc_block(order) {
                Some(phys) => mc.push(phys, order),
                None => {
                    res = Err(Error::NoMemory);
                    break;
                }
            }
        }
        if res.is_ok() {
            res = self.pkvm.host_iommu_refill(&mut mc);
        }
        while let Some(page) = mc.pop() {
            self.free_block(page.phys, page.order);
        }
        res
    }

    /// Takes back up to `target` pages from the hypervisor IOMMU pools. Returns how many came
    /// back.
    pub fn reclaim_hyp(&self, target: u64) -> u64 {
        let mut mc = HypMemcache::new();
        self.pkvm.host_iommu_reclaim(&mut mc, target);
        let mut nr = 0;
        while let Some(page) = mc.pop() {
            nr += page.nr_pages();
            self.free_block(page.phys, page.order);
        }
        nr
    }

    /// Serves what the hypervisor asked for when `vcpu` exited, so that it can run again.
    pub fn handle_mem_request(&self, vcpu: &mut HypVcpu, req: MemRequest) -> Result<()> {
        match req {
            MemRequest::Pool {
                dest: MemDest::VmIommu,
                nr_pages,
                sz_alloc,
            } => {
                let nr_pages = usize::try_from(nr_pages).map_err(|_| Error::TooBig)?;
                let want = vcpu.iommu_mc.nr_pages() + nr_pages;
                self.guest_alloc_mc(&mut vcpu.iommu_mc, sz_alloc, want)
            }
            MemRequest::Pool {
                dest: MemDest::HypIommu,
                nr_pages,
                sz_alloc,
            } => self.refill_hyp(nr_pages, sz_alloc),
            MemRequest::Map { ipa, size } => self.fault_in(vcpu, ipa, size),
        }
    }

    // Backs every unmapped page of `[ipa, ipa + size)` with fresh host memory.
    fn fault_in(&self, vcpu: &HypVcpu, ipa: u64, size: u64) -> Result<()> {
        let end = ipa.checked_add(size).ok_or(Error::InvalidArgument)?;
        for ipa in (ipa..end).step_by(PAGE_SIZE as usize) {
            if vcpu.vm().stage2.translate(ipa).is_some() {
                continue;
            }
            let phys = self.mem.alloc_pages(0).ok_or(Error::NoMemory)?;
            if let Err(e) = self
                .pkvm
                .host_donate_guest(vcpu, phys.pfn(), ipa / PAGE_SIZE)
            {
                warn!("failed to fault in guest page {:#x}: {}", ipa, e);
                self.mem.free_pages(phys, 0);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for KvmIommu {
    fn drop(&mut self) {
        let current = *self.driver.get_mut();
        let retired = self.retired.get_mut();
        for Retired(driver) in retired.drain(..).chain(Some(Retired(current))) {
            if !driver.is_null() {
                // SAFETY: every published pointer came from `Box::into_raw` and nothing can
                // borrow it any more.
                drop(unsafe { Box::from_raw(driver) });
            }
        }
    }
}
