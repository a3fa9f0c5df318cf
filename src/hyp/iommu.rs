// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hypervisor IOMMU layer.
//!
//! The page-table format of a physical IOMMU is the business of a [`HypIommuOps`] driver installed
//! once at boot. This layer owns what is common to every driver: the domain table and its
//! reference counts, the memory pools the driver allocates page tables from, and the power state
//! of each IOMMU.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bitflags::bitflags;
use log::debug;
use log::info;
use log::warn;
use sync::SpinLock;

use crate::addr::get_order;
use crate::addr::order_size;
use crate::addr::PhysAddr;
use crate::addr::MAX_BLOCK_ORDER;
use crate::addr::PAGE_SIZE;
use crate::addr::PMD_ORDER;
use crate::addr::PMD_SIZE;
use crate::hyp::mem_protect::HostStage2;
use crate::hyp::memcache::HypMemcache;
use crate::hyp::pool::reclaim_hyp_pool;
use crate::hyp::pool::refill_hyp_pool;
use crate::hyp::pool::return_to_host;
use crate::hyp::pool::HypPool;
use crate::hyp::pool::PageSource;
use crate::hyp::vm::MemDest;
use crate::hyp::vm::MemRequest;
use crate::DomainId;
use crate::Error;
use crate::IommuId;
use crate::Result;

pub const KVM_IOMMU_MAX_DOMAINS: u64 = 1 << 16;
/// Domains sharing one leaf page of the domain table.
pub const KVM_IOMMU_DOMAINS_PER_PAGE: u64 = PAGE_SIZE / 16;
pub const KVM_IOMMU_DOMAINS_ROOT_ENTRIES: u64 = KVM_IOMMU_MAX_DOMAINS / KVM_IOMMU_DOMAINS_PER_PAGE;
/// Size of the root of the domain table, one pointer per leaf.
pub const KVM_IOMMU_DOMAINS_ROOT_SIZE: u64 = KVM_IOMMU_DOMAINS_ROOT_ENTRIES * 8;
pub const KVM_IOMMU_DOMAIN_ANY_TYPE: u32 = 0;

pub const MAX_BLOCK_POOLS: usize = 16;
const SYSTEM_POOL_MAX_ORDER: u8 = 6;
const ATOMIC_POOL_MAX_ORDER: u8 = 10;

static_assertions::const_assert_eq!(KVM_IOMMU_MAX_DOMAINS % KVM_IOMMU_DOMAINS_PER_PAGE, 0);

bitflags! {
    /// Access rights of an IOMMU mapping.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct IommuProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO = 1 << 4;
        const PRIV = 1 << 5;
    }
}

/// How far a map or unmap call got.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Progress {
    pub bytes: u64,
    /// The call stopped early because its page source ran dry.
    pub out_of_memory: bool,
}

impl Progress {
    pub fn done(bytes: u64) -> Progress {
        Progress {
            bytes,
            out_of_memory: false,
        }
    }

    pub fn starved(bytes: u64) -> Progress {
        Progress {
            bytes,
            out_of_memory: true,
        }
    }
}

/// A hypervisor IOMMU driver.
///
/// Any method given a `pool` takes its page-table memory from there and returns
/// `Err(Error::NoMemory)` (or a starved [`Progress`]) when the pool is empty; the caller then
/// asks the host for more memory and retries.
pub trait HypIommuOps: Send + Sync {
    fn init(&self, _pools: &dyn PageSource, _init_arg: u64) -> Result<()> {
        Ok(())
    }

    /// Whether `iommu` names an IOMMU this driver manages.
    fn has_iommu(&self, iommu: IommuId) -> bool;

    fn alloc_domain(
        &self,
        pool: &dyn PageSource,
        domain: DomainId,
        domain_type: u32,
    ) -> Result<()>;
    fn free_domain(&self, pool: &dyn PageSource, domain: DomainId);

    fn attach_dev(
        &self,
        pool: &dyn PageSource,
        iommu: IommuId,
        domain: DomainId,
        endpoint: u32,
        pasid: u32,
        pasid_bits: u32,
    ) -> Result<()>;
    fn detach_dev(
        &self,
        iommu: IommuId,
        domain: DomainId,
        endpoint: u32,
        pasid: u32,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn map_pages(
        &self,
        pool: &dyn PageSource,
        domain: DomainId,
        iova: u64,
        paddr: PhysAddr,
        pgsize: u64,
        pgcount: u64,
        prot: IommuProt,
    ) -> Progress;
    fn unmap_pages(
        &self,
        pool: &dyn PageSource,
        domain: DomainId,
        iova: u64,
        pgsize: u64,
        pgcount: u64,
    ) -> Progress;

    /// Stops all DMA from `endpoint` while a device changes hands.
    ///
    /// Runs where no memory request can be raised, so any page-table memory it needs comes from
    /// the `atomic` pool.
    fn block_dma(
        &self,
        _atomic: &dyn PageSource,
        _iommu: IommuId,
        _endpoint: u64,
        _host_to_guest: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn suspend(&self, _iommu: IommuId) -> Result<()> {
        Ok(())
    }

    fn resume(&self, _iommu: IommuId) -> Result<()> {
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CmaRegion {
    pub base: PhysAddr,
    pub size: u64,
}

impl CmaRegion {
    fn range(&self) -> Range<u64> {
        self.base.offset()..self.base.offset().saturating_add(self.size)
    }
}

/// Block pools are each carved from one PMD-sized chunk of the CMA region.
#[derive(Debug, Default)]
struct BlockPools {
    pools: [HypPool; MAX_BLOCK_POOLS],
    last: usize,
}

/// Memory the IOMMU drivers allocate page tables from.
#[derive(Debug)]
pub struct IommuPools {
    system: SpinLock<HypPool>,
    blocks: SpinLock<BlockPools>,
    blocks_available: AtomicBool,
    atomic: SpinLock<HypPool>,
    cma: spin::Once<CmaRegion>,
}

impl Default for IommuPools {
    fn default() -> Self {
        IommuPools {
            system: SpinLock::new(HypPool::new(SYSTEM_POOL_MAX_ORDER)),
            blocks: Default::default(),
            blocks_available: AtomicBool::new(false),
            atomic: SpinLock::new(HypPool::new(ATOMIC_POOL_MAX_ORDER)),
            cma: spin::Once::new(),
        }
    }
}

impl IommuPools {
    /// Records where the host's IOMMU CMA region is. Can only be done once.
    pub fn set_cma(&self, base: PhysAddr, size: u64) -> Result<()> {
        if size == 0 || base.checked_add(size).is_none() {
            return Err(Error::InvalidArgument);
        }
        let mut set = false;
        self.cma.call_once(|| {
            set = true;
            CmaRegion { base, size }
        });
        if !set {
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub fn cma(&self) -> Option<CmaRegion> {
        self.cma.get().copied()
    }

    fn in_cma(&self, phys: PhysAddr) -> bool {
        self.cma()
            .map_or(false, |cma| cma.range().contains(&phys.offset()))
    }

    /// Whether a block the host offers is a whole PMD of the CMA region, to become a block pool.
    pub fn donate_from_cma(&self, phys: PhysAddr, order: u8) -> bool {
        if order != PMD_ORDER || !phys.is_aligned(PMD_SIZE) {
            return false;
        }
        let Some(end) = phys.checked_add(PMD_SIZE) else {
            return false;
        };
        self.cma().map_or(false, |cma| {
            let range = cma.range();
            phys.offset() >= range.start && end.offset() <= range.end
        })
    }

    /// Admits the blocks of `mc`. Whole CMA PMDs become block pools, anything else goes to the
    /// system pool.
    pub fn refill(&self, mc: &mut HypMemcache, stage2: &HostStage2) -> Result<()> {
        while let Some(page) = mc.pop() {
            let res = page
                .validate(MAX_BLOCK_ORDER)
                .and_then(|nr_pages| stage2.host_donate_hyp(page.phys.pfn(), nr_pages));
            if let Err(e) = res {
                mc.push(page.phys, page.order);
                return Err(e);
            }
            if !self.donate_from_cma(page.phys, page.order) {
                self.system.lock().put_pages(page.phys, page.order);
                continue;
            }
            let mut blocks = self.blocks.lock();
            match blocks.pools.iter().position(|p| !p.has_range()) {
                Some(idx) => {
                    blocks.pools[idx] = HypPool::with_range(page.phys, PMD_SIZE)?;
                    self.blocks_available.store(true, Ordering::Release);
                }
                None => {
                    drop(blocks);
                    return_to_host(vec![page], mc, stage2);
                    return Err(Error::Busy);
                }
            }
        }
        Ok(())
    }

    /// Gives up to `target` free pages back to the host, system pool first, then any block pool
    /// that is entirely free.
    pub fn reclaim(&self, mc: &mut HypMemcache, target: u64, stage2: &HostStage2) {
        let block_pages = PMD_SIZE / PAGE_SIZE;
        let taken = self.system.lock().take_free(target);
        let mut remaining = target.saturating_sub(taken.iter().map(|p| p.nr_pages()).sum());
        return_to_host(taken, mc, stage2);

        let mut blocks = self.blocks.lock();
        for pool in blocks.pools.iter_mut() {
            if remaining < block_pages {
                break;
            }
            if !pool.has_range() || pool.free_pages() != pool.capacity() {
                continue;
            }
            let taken = pool.take_free(block_pages);
            *pool = HypPool::default();
            return_to_host(taken, mc, stage2);
            remaining -= block_pages;
        }
    }

    /// Pages that [`IommuPools::reclaim`] could hand back right now.
    pub fn reclaimable(&self) -> u64 {
        let system = self.system.lock().free_pages();
        let blocks: u64 = self
            .blocks
            .lock()
            .pools
            .iter()
            .filter(|p| p.has_range() && p.free_pages() == p.capacity())
            .map(|p| p.free_pages())
            .sum();
        system + blocks
    }

    /// Fills the atomic pool, used where no memory request can be raised.
    fn init_atomic(&self, mc: &mut HypMemcache, stage2: &HostStage2) -> Result<()> {
        if mc.is_empty() {
            return Ok(());
        }
        refill_hyp_pool(&self.atomic, mc, stage2)
    }

    // Gives the atomic pool back to the host after a failed install.
    fn drain_atomic(&self, mc: &mut HypMemcache, stage2: &HostStage2) {
        reclaim_hyp_pool(&self.atomic, mc, u64::MAX, stage2);
    }

    /// The pool for driver work that cannot wait on a donation.
    pub fn atomic(&self) -> &dyn PageSource {
        &self.atomic
    }

    pub fn atomic_free_pages(&self) -> u64 {
        self.atomic.lock().free_pages()
    }

    /// What to ask the host for when an allocation of `order` failed.
    pub fn request(order: u8) -> MemRequest {
        MemRequest::Pool {
            dest: MemDest::HypIommu,
            nr_pages: 1,
            sz_alloc: order_size(order.min(MAX_BLOCK_ORDER)).unwrap_or(PAGE_SIZE),
        }
    }
}

impl PageSource for IommuPools {
    fn alloc_pages(&self, order: u8) -> Option<PhysAddr> {
        if self.blocks_available.load(Ordering::Acquire) {
            let mut blocks = self.blocks.lock();
            let start = blocks.last;
            for i in 0..MAX_BLOCK_POOLS {
                let idx = (start + i) % MAX_BLOCK_POOLS;
                if let Some(p) = blocks.pools[idx].alloc_pages(order) {
                    blocks.last = idx;
                    return Some(p);
                }
            }
            self.blocks_available.store(false, Ordering::Release);
        }
        self.system.lock().alloc_pages(order)
    }

    fn put_pages(&self, phys: PhysAddr, order: u8) {
        if !self.in_cma(phys) {
            self.system.lock().put_pages(phys, order);
            return;
        }
        let mut blocks = self.blocks.lock();
        match blocks.pools.iter_mut().find(|p| p.contains(phys)) {
            Some(pool) => {
                pool.put_pages(phys, order);
                self.blocks_available.store(true, Ordering::Release);
            }
            None => warn!("{} is in the CMA region but in no block pool", phys),
        }
    }
}

/// Hypervisor IOMMU state.
pub struct HypIommu {
    ops: spin::Once<Box<dyn HypIommuOps>>,
    domains_root: spin::Once<PhysAddr>,
    // domain -> reference count, 1 while allocated plus one per attached endpoint.
    domains: SpinLock<BTreeMap<DomainId, u32>>,
    // Leaf pages of the domain table, by root index.
    domain_leaves: SpinLock<BTreeMap<u64, PhysAddr>>,
    pools: IommuPools,
    // iommu -> powered off
    power_off: SpinLock<BTreeMap<IommuId, bool>>,
    // Set while an install is in progress or done.
    installing: AtomicBool,
}

impl Default for HypIommu {
    fn default() -> Self {
        HypIommu {
            ops: spin::Once::new(),
            domains_root: spin::Once::new(),
            domains: Default::default(),
            domain_leaves: Default::default(),
            pools: Default::default(),
            power_off: Default::default(),
            installing: AtomicBool::new(false),
        }
    }
}

impl HypIommu {
    pub fn new() -> HypIommu {
        Default::default()
    }

    /// Installs the driver.
    ///
    /// The domain table root is taken from the host, the atomic pool filled and the driver
    /// initialized. Only then is the driver published, with release ordering. A failed install
    /// gives everything back to the host and can be retried.
    pub fn init(
        &self,
        ops: Box<dyn HypIommuOps>,
        domains_root: PhysAddr,
        atomic_mc: &mut HypMemcache,
        init_arg: u64,
        stage2: &HostStage2,
    ) -> Result<()> {
        if self
            .installing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let root_pages = 1u64 << get_order(KVM_IOMMU_DOMAINS_ROOT_SIZE);
        if let Err(e) = stage2.host_donate_hyp(domains_root.pfn(), root_pages) {
            self.installing.store(false, Ordering::Release);
            return Err(e);
        }
        let res = self
            .pools
            .init_atomic(atomic_mc, stage2)
            .and_then(|()| ops.init(&self.pools, init_arg));
        if let Err(e) = res {
            warn!("hypervisor IOMMU driver failed to initialize: {}", e);
            self.pools.drain_atomic(atomic_mc, stage2);
            if let Err(e) = stage2.hyp_donate_host(domains_root.pfn(), root_pages) {
                warn!("failed to return the domain table root: {}", e);
            }
            self.installing.store(false, Ordering::Release);
            return Err(e);
        }
        self.domains_root.call_once(|| domains_root);
        self.ops.call_once(|| ops);
        info!("hypervisor IOMMU driver installed");
        Ok(())
    }

    pub fn ops(&self) -> Option<&dyn HypIommuOps> {
        self.ops.get().map(|ops| ops.as_ref())
    }

    pub fn is_ready(&self) -> bool {
        self.ops.get().is_some()
    }

    pub fn domains_root(&self) -> Option<PhysAddr> {
        self.domains_root.get().copied()
    }

    pub fn pools(&self) -> &IommuPools {
        &self.pools
    }

    pub fn refill(&self, mc: &mut HypMemcache, stage2: &HostStage2) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::InvalidArgument);
        }
        self.pools.refill(mc, stage2)
    }

    pub fn reclaim(&self, mc: &mut HypMemcache, target: u64, stage2: &HostStage2) {
        if self.is_ready() {
            self.pools.reclaim(mc, target, stage2);
        }
    }

    pub fn reclaimable(&self) -> u64 {
        if !self.is_ready() {
            return 0;
        }
        self.pools.reclaimable()
    }

    /// Makes sure the leaf of the domain table covering `domain` exists.
    ///
    /// Leaves come from the hypervisor IOMMU pools and are never freed. When the pools are empty
    /// the returned request tells the host what to donate.
    pub fn reserve_domain_leaf(&self, domain: DomainId) -> std::result::Result<(), MemRequest> {
        let idx = domain / KVM_IOMMU_DOMAINS_PER_PAGE;
        let mut leaves = self.domain_leaves.lock();
        if leaves.contains_key(&idx) {
            return Ok(());
        }
        let page = self
            .pools
            .alloc_pages(0)
            .ok_or_else(|| IommuPools::request(0))?;
        leaves.insert(idx, page);
        Ok(())
    }

    pub fn alloc_domain(
        &self,
        pool: &dyn PageSource,
        domain: DomainId,
        domain_type: u32,
    ) -> Result<()> {
        let ops = self.ops().ok_or(Error::NotSupported)?;
        if domain >= KVM_IOMMU_MAX_DOMAINS {
            return Err(Error::InvalidArgument);
        }
        let mut domains = self.domains.lock();
        if domains.contains_key(&domain) {
            return Err(Error::InvalidArgument);
        }
        ops.alloc_domain(pool, domain, domain_type)?;
        domains.insert(domain, 1);
        debug!("allocated IOMMU domain {}", domain);
        Ok(())
    }

    /// Frees a domain with no endpoint attached.
    pub fn free_domain(&self, pool: &dyn PageSource, domain: DomainId) -> Result<()> {
        let ops = self.ops().ok_or(Error::NotSupported)?;
        let mut domains = self.domains.lock();
        if domains.get(&domain) != Some(&1) {
            warn!("refusing to free busy or unknown domain {}", domain);
            return Err(Error::InvalidArgument);
        }
        ops.free_domain(pool, domain);
        domains.remove(&domain);
        Ok(())
    }

    /// Frees a domain whatever is still attached to it. Only for VM teardown.
    pub fn force_free_domain(&self, pool: &dyn PageSource, domain: DomainId) {
        let Some(ops) = self.ops() else {
            return;
        };
        let mut domains = self.domains.lock();
        match domains.remove(&domain) {
            Some(refs) => {
                if refs > 1 {
                    warn!("freeing domain {} with {} attached endpoints", domain, refs - 1);
                }
                ops.free_domain(pool, domain);
            }
            None => warn!("freeing unknown domain {}", domain),
        }
    }

    pub fn domain_refs(&self, domain: DomainId) -> Option<u32> {
        self.domains.lock().get(&domain).copied()
    }

    fn domain_get(&self, domain: DomainId) -> Result<()> {
        let mut domains = self.domains.lock();
        let refs = domains.get_mut(&domain).ok_or(Error::InvalidArgument)?;
        *refs = refs.checked_add(1).ok_or(Error::InvalidArgument)?;
        Ok(())
    }

    fn domain_put(&self, domain: DomainId) {
        let mut domains = self.domains.lock();
        if let Some(refs) = domains.get_mut(&domain) {
            *refs -= 1;
            debug_assert!(*refs > 0);
        }
    }

    pub fn attach_dev(
        &self,
        pool: &dyn PageSource,
        iommu: IommuId,
        domain: DomainId,
        endpoint: u32,
        pasid: u32,
        pasid_bits: u32,
    ) -> Result<()> {
        let ops = self.ops().ok_or(Error::NotSupported)?;
        if !ops.has_iommu(iommu) {
            return Err(Error::InvalidArgument);
        }
        self.domain_get(domain)?;
        let res = ops.attach_dev(pool, iommu, domain, endpoint, pasid, pasid_bits);
        if res.is_err() {
            self.domain_put(domain);
        }
        res
    }

    pub fn detach_dev(
        &self,
        iommu: IommuId,
        domain: DomainId,
        endpoint: u32,
        pasid: u32,
    ) -> Result<()> {
        let ops = self.ops().ok_or(Error::NotSupported)?;
        if !ops.has_iommu(iommu) {
            return Err(Error::InvalidArgument);
        }
        if self.domain_refs(domain).map_or(true, |refs| refs <= 1) {
            return Err(Error::InvalidArgument);
        }
        ops.detach_dev(iommu, domain, endpoint, pasid)?;
        self.domain_put(domain);
        Ok(())
    }

    /// Maps `pgcount` pages of `pgsize` bytes. Returns how much was mapped; nothing at all if the
    /// arguments are rejected.
    #[allow(clippy::too_many_arguments)]
    pub fn map_pages(
        &self,
        pool: &dyn PageSource,
        domain: DomainId,
        iova: u64,
        paddr: PhysAddr,
        pgsize: u64,
        pgcount: u64,
        prot: IommuProt,
    ) -> Progress {
        let Some(ops) = self.ops() else {
            return Progress::default();
        };
        let Some(size) = pgsize.checked_mul(pgcount) else {
            return Progress::default();
        };
        if size == 0 || iova.checked_add(size).is_none() || paddr.checked_add(size).is_none() {
            return Progress::default();
        }
        if self.domain_get(domain).is_err() {
            return Progress::default();
        }
        let progress = ops.map_pages(pool, domain, iova, paddr, pgsize, pgcount, prot);
        self.domain_put(domain);
        progress
    }

    pub fn unmap_pages(
        &self,
        pool: &dyn PageSource,
        domain: DomainId,
        iova: u64,
        pgsize: u64,
        pgcount: u64,
    ) -> Progress {
        let Some(ops) = self.ops() else {
            return Progress::default();
        };
        let Some(size) = pgsize.checked_mul(pgcount) else {
            return Progress::default();
        };
        if size == 0 || iova.checked_add(size).is_none() {
            return Progress::default();
        }
        if self.domain_get(domain).is_err() {
            return Progress::default();
        }
        let progress = ops.unmap_pages(pool, domain, iova, pgsize, pgcount);
        self.domain_put(domain);
        progress
    }

    pub fn block_dma(&self, iommu: IommuId, endpoint: u64, host_to_guest: bool) -> Result<()> {
        let ops = self.ops().ok_or(Error::NoDevice)?;
        ops.block_dma(self.pools.atomic(), iommu, endpoint, host_to_guest)
    }

    /// Switches the power domain of `iommu`. The recorded state is restored if the driver fails.
    pub fn power(&self, iommu: IommuId, on: bool) -> Result<()> {
        let ops = self.ops().ok_or(Error::NoDevice)?;
        if !ops.has_iommu(iommu) {
            return Err(Error::NoDevice);
        }
        let mut power_off = self.power_off.lock();
        let prev = power_off.insert(iommu, !on);
        let res = if on {
            ops.resume(iommu)
        } else {
            ops.suspend(iommu)
        };
        if res.is_err() {
            match prev {
                Some(prev) => power_off.insert(iommu, prev),
                None => power_off.remove(&iommu),
            };
        }
        res
    }

    pub fn is_powered_off(&self, iommu: IommuId) -> bool {
        self.power_off.lock().get(&iommu).copied().unwrap_or(false)
    }
}
