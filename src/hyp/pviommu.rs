// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest pvIOMMU hypercalls.
//!
//! A guest programs its IOMMU through six operations selected by argument 1 of the pvIOMMU
//! call. Endpoints are named by (pviommu, vsid) and resolved through the routes frozen for the VM
//! at creation; domain ids are handed out from the upper half of the domain space, which the host
//! never uses.
//!
//! Register layout, x0 being the function id:
//!
//! | op          | x2      | x3    | x4    | x5     | x6         |
//! |-------------|---------|-------|-------|--------|------------|
//! | AllocDomain | 0       | 0     | 0     | 0      | 0          |
//! | FreeDomain  | domain  | 0     | 0     | 0      | 0          |
//! | AttachDev   | pviommu | vsid  | pasid | domain | pasid_bits |
//! | DetachDev   | pviommu | vsid  | pasid | domain | 0          |
//! | MapPages    | domain  | iova  | ipa   | size   | prot       |
//! | UnmapPages  | domain  | iova  | size  | 0      | 0          |

use std::collections::BTreeMap;

use bitflags::bitflags;
use enumn::N;
use log::debug;
use log::warn;

use crate::addr::is_page_aligned;
use crate::addr::PAGE_SIZE;
use crate::hyp::iommu::IommuProt;
use crate::hyp::iommu::KVM_IOMMU_DOMAIN_ANY_TYPE;
use crate::hyp::iommu::KVM_IOMMU_MAX_DOMAINS;
use crate::hyp::pool::refill_hyp_pool;
use crate::hyp::pviommu_host::PvIommuRoute;
use crate::hyp::vm::HvcExit;
use crate::hyp::vm::HypVcpu;
use crate::hyp::vm::HypVm;
use crate::hyp::vm::MemDest;
use crate::hyp::vm::MemRequest;
use crate::hyp::vm::VmHandle;
use crate::hyp::Pkvm;
use crate::smccc::SMCCC_RET_INVALID_PARAMETER;
use crate::smccc::SMCCC_RET_NOT_SUPPORTED;
use crate::smccc::SMCCC_RET_SUCCESS;
use crate::DomainId;
use crate::Error;
use crate::Result;

/// Guests share the upper half of the domain space.
pub const KVM_IOMMU_GUEST_DOMAIN_BASE: DomainId = KVM_IOMMU_MAX_DOMAINS >> 1;
pub const KVM_IOMMU_MAX_GUEST_DOMAINS: u64 = KVM_IOMMU_MAX_DOMAINS >> 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq, N)]
#[repr(u64)]
pub enum PvIommuOp {
    AllocDomain = 0,
    FreeDomain = 1,
    AttachDev = 2,
    DetachDev = 3,
    MapPages = 4,
    UnmapPages = 5,
}

bitflags! {
    /// Mapping protection as encoded by the guest.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PvIommuProt: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO = 1 << 4;
        const PRIV = 1 << 5;
    }
}

impl From<PvIommuProt> for IommuProt {
    fn from(prot: PvIommuProt) -> IommuProt {
        let mut iommu_prot = IommuProt::empty();
        let pairs = [
            (PvIommuProt::READ, IommuProt::READ),
            (PvIommuProt::WRITE, IommuProt::WRITE),
            (PvIommuProt::CACHE, IommuProt::CACHE),
            (PvIommuProt::NOEXEC, IommuProt::NOEXEC),
            (PvIommuProt::MMIO, IommuProt::MMIO),
            (PvIommuProt::PRIV, IommuProt::PRIV),
        ];
        for (guest, host) in pairs {
            if prot.contains(guest) {
                iommu_prot |= host;
            }
        }
        iommu_prot
    }
}

/// Domain ids handed to guests and the VM owning each.
#[derive(Debug)]
pub struct GuestDomainIds {
    bitmap: Vec<u64>,
    owners: BTreeMap<DomainId, VmHandle>,
}

impl Default for GuestDomainIds {
    fn default() -> Self {
        GuestDomainIds {
            bitmap: vec![0; (KVM_IOMMU_MAX_GUEST_DOMAINS / u64::BITS as u64) as usize],
            owners: BTreeMap::new(),
        }
    }
}

impl GuestDomainIds {
    /// Reserves the lowest free guest domain id.
    pub fn alloc(&mut self) -> Option<DomainId> {
        let (word, bits) = self
            .bitmap
            .iter_mut()
            .enumerate()
            .find(|(_, bits)| **bits != u64::MAX)?;
        let bit = bits.trailing_ones() as u64;
        *bits |= 1 << bit;
        Some(KVM_IOMMU_GUEST_DOMAIN_BASE + word as u64 * u64::BITS as u64 + bit)
    }

    /// Releases `domain` and forgets its owner.
    pub fn free(&mut self, domain: DomainId) {
        let Some(idx) = domain
            .checked_sub(KVM_IOMMU_GUEST_DOMAIN_BASE)
            .filter(|&idx| idx < KVM_IOMMU_MAX_GUEST_DOMAINS)
        else {
            warn!("freeing non-guest domain id {}", domain);
            return;
        };
        let bits = u64::BITS as u64;
        self.bitmap[(idx / bits) as usize] &= !(1 << (idx % bits));
        self.owners.remove(&domain);
    }

    pub fn set_owner(&mut self, domain: DomainId, vm: VmHandle) {
        self.owners.insert(domain, vm);
    }

    pub fn owner(&self, domain: DomainId) -> Option<VmHandle> {
        self.owners.get(&domain).copied()
    }

    pub fn owned_by(&self, vm: VmHandle) -> Vec<DomainId> {
        self.owners
            .iter()
            .filter(|(_, &owner)| owner == vm)
            .map(|(&domain, _)| domain)
            .collect()
    }
}

fn vm_pool_request() -> MemRequest {
    MemRequest::Pool {
        dest: MemDest::VmIommu,
        nr_pages: 1,
        sz_alloc: PAGE_SIZE,
    }
}

fn ret(vcpu: &mut HypVcpu, res: Result<u64>) -> HvcExit {
    match res {
        Ok(val) => vcpu.regs.set_retval(SMCCC_RET_SUCCESS, val, 0, 0),
        Err(_) => vcpu.regs.set_retval(SMCCC_RET_INVALID_PARAMETER, 0, 0, 0),
    }
    HvcExit::Guest
}

/// Exits to the host for memory and makes the vCPU issue the same call again afterwards.
fn retry_after(vcpu: &mut HypVcpu, req: MemRequest) -> HvcExit {
    vcpu.retry_hvc();
    HvcExit::Host(req)
}

fn arg_u32(vcpu: &HypVcpu, n: usize) -> Result<u32> {
    u32::try_from(vcpu.regs.arg(n)).map_err(|_| Error::InvalidArgument)
}

fn check_owner(pkvm: &Pkvm, vm: &HypVm, domain: DomainId) -> Result<()> {
    if pkvm.guest_domains.lock().owner(domain) != Some(vm.handle()) {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn alloc_domain(pkvm: &Pkvm, vcpu: &mut HypVcpu) -> HvcExit {
    if !vcpu.regs.args_zero(2..=6) {
        return ret(vcpu, Err(Error::InvalidArgument));
    }
    let vm = vcpu.vm.clone();
    let mut ids = pkvm.guest_domains.lock();
    let Some(domain) = ids.alloc() else {
        return ret(vcpu, Err(Error::Busy));
    };
    if let Err(req) = pkvm.iommu.reserve_domain_leaf(domain) {
        ids.free(domain);
        return retry_after(vcpu, req);
    }
    match pkvm
        .iommu
        .alloc_domain(&vm.iommu_pool, domain, KVM_IOMMU_DOMAIN_ANY_TYPE)
    {
        Ok(()) => {
            ids.set_owner(domain, vm.handle());
            debug!("vm {} allocated domain {}", vm.handle(), domain);
            ret(vcpu, Ok(domain))
        }
        Err(Error::NoMemory) => {
            ids.free(domain);
            retry_after(vcpu, vm_pool_request())
        }
        Err(e) => {
            ids.free(domain);
            ret(vcpu, Err(e))
        }
    }
}

fn free_domain(pkvm: &Pkvm, vcpu: &mut HypVcpu) -> HvcExit {
    if !vcpu.regs.args_zero(3..=6) {
        return ret(vcpu, Err(Error::InvalidArgument));
    }
    let domain = vcpu.regs.arg(2);
    let vm = vcpu.vm.clone();
    let mut ids = pkvm.guest_domains.lock();
    if ids.owner(domain) != Some(vm.handle()) {
        return ret(vcpu, Err(Error::InvalidArgument));
    }
    let res = pkvm.iommu.free_domain(&vm.iommu_pool, domain);
    if res.is_ok() {
        ids.free(domain);
    }
    ret(vcpu, res.map(|_| 0))
}

/// Resolves the (pviommu, vsid) pair in x2/x3.
fn route(pkvm: &Pkvm, vcpu: &HypVcpu) -> Result<PvIommuRoute> {
    let pviommu = arg_u32(vcpu, 2)?;
    let vsid = arg_u32(vcpu, 3)?;
    pkvm.pviommus.get_route(vcpu.vm(), pviommu, vsid)
}

fn attach_args(pkvm: &Pkvm, vcpu: &HypVcpu) -> Result<(PvIommuRoute, u32, DomainId, u32)> {
    let route = route(pkvm, vcpu)?;
    let pasid = arg_u32(vcpu, 4)?;
    let domain = vcpu.regs.arg(5);
    let pasid_bits = arg_u32(vcpu, 6)?;
    check_owner(pkvm, vcpu.vm(), domain)?;
    Ok((route, pasid, domain, pasid_bits))
}

fn attach_dev(pkvm: &Pkvm, vcpu: &mut HypVcpu) -> HvcExit {
    let (route, pasid, domain, pasid_bits) = match attach_args(pkvm, vcpu) {
        Ok(args) => args,
        Err(e) => return ret(vcpu, Err(e)),
    };
    let vm = vcpu.vm.clone();
    let endpoint = u64::from(route.sid);
    if let Err(e) = pkvm.devices.get_context(route.iommu, endpoint, vm.handle()) {
        return ret(vcpu, Err(e));
    }
    let res = pkvm.iommu.attach_dev(
        &vm.iommu_pool,
        route.iommu,
        domain,
        route.sid,
        pasid,
        pasid_bits,
    );
    match res {
        Ok(()) => ret(vcpu, Ok(0)),
        Err(Error::NoMemory) => {
            pkvm.devices.put_context(route.iommu, endpoint);
            retry_after(vcpu, vm_pool_request())
        }
        Err(e) => {
            pkvm.devices.put_context(route.iommu, endpoint);
            ret(vcpu, Err(e))
        }
    }
}

fn do_detach_dev(pkvm: &Pkvm, vcpu: &HypVcpu) -> Result<u64> {
    if vcpu.regs.arg(6) != 0 {
        return Err(Error::InvalidArgument);
    }
    let route = route(pkvm, vcpu)?;
    let pasid = arg_u32(vcpu, 4)?;
    let domain = vcpu.regs.arg(5);
    check_owner(pkvm, vcpu.vm(), domain)?;
    pkvm.iommu.detach_dev(route.iommu, domain, route.sid, pasid)?;
    pkvm.devices.put_context(route.iommu, u64::from(route.sid));
    Ok(0)
}

fn detach_dev(pkvm: &Pkvm, vcpu: &mut HypVcpu) -> HvcExit {
    let res = do_detach_dev(pkvm, vcpu);
    ret(vcpu, res)
}

fn map_pages(pkvm: &Pkvm, vcpu: &mut HypVcpu) -> HvcExit {
    let domain = vcpu.regs.arg(2);
    let mut iova = vcpu.regs.arg(3);
    let mut ipa = vcpu.regs.arg(4);
    let mut size = vcpu.regs.arg(5);
    let vm = vcpu.vm.clone();

    if !is_page_aligned(size) || !is_page_aligned(ipa) || !is_page_aligned(iova) {
        return ret(vcpu, Err(Error::InvalidArgument));
    }
    let Some(prot) = PvIommuProt::from_bits(vcpu.regs.arg(6)) else {
        return ret(vcpu, Err(Error::InvalidArgument));
    };
    if let Err(e) = check_owner(pkvm, &vm, domain) {
        return ret(vcpu, Err(e));
    }

    let mut total_mapped = 0;
    while size != 0 {
        let Some((paddr, contiguous)) = vm.stage2.translate(ipa) else {
            // Let the host fault the memory in. The guest sees what was mapped so far and
            // issues the call again for the rest.
            vcpu.regs.set_retval(SMCCC_RET_SUCCESS, total_mapped, 0, 0);
            return HvcExit::Host(MemRequest::Map { ipa, size });
        };
        let chunk = size.min(contiguous);
        let progress = pkvm.iommu.map_pages(
            &vm.iommu_pool,
            domain,
            iova,
            paddr,
            PAGE_SIZE,
            chunk / PAGE_SIZE,
            prot.into(),
        );
        ipa += progress.bytes;
        iova += progress.bytes;
        size -= progress.bytes;
        total_mapped += progress.bytes;
        if progress.out_of_memory {
            vcpu.regs.set_retval(SMCCC_RET_SUCCESS, total_mapped, 0, 0);
            return HvcExit::Host(vm_pool_request());
        }
        if progress.bytes == 0 {
            vcpu.regs
                .set_retval(SMCCC_RET_INVALID_PARAMETER, total_mapped, 0, 0);
            return HvcExit::Guest;
        }
    }
    ret(vcpu, Ok(total_mapped))
}

fn unmap_pages(pkvm: &Pkvm, vcpu: &mut HypVcpu) -> HvcExit {
    let domain = vcpu.regs.arg(2);
    let iova = vcpu.regs.arg(3);
    let size = vcpu.regs.arg(4);
    let vm = vcpu.vm.clone();

    if !is_page_aligned(size) || !is_page_aligned(iova) || !vcpu.regs.args_zero(5..=6) {
        return ret(vcpu, Err(Error::InvalidArgument));
    }
    if let Err(e) = check_owner(pkvm, &vm, domain) {
        return ret(vcpu, Err(e));
    }
    let progress = pkvm
        .iommu
        .unmap_pages(&vm.iommu_pool, domain, iova, PAGE_SIZE, size / PAGE_SIZE);
    if progress.bytes < size {
        if progress.out_of_memory {
            vcpu.regs.set_retval(SMCCC_RET_SUCCESS, progress.bytes, 0, 0);
            return HvcExit::Host(vm_pool_request());
        }
        vcpu.regs
            .set_retval(SMCCC_RET_INVALID_PARAMETER, progress.bytes, 0, 0);
        return HvcExit::Guest;
    }
    ret(vcpu, Ok(progress.bytes))
}

/// Handles a pvIOMMU call from `vcpu`.
pub fn handle_pviommu_hvc(pkvm: &Pkvm, vcpu: &mut HypVcpu) -> HvcExit {
    // Fill the VM pool first so no IOMMU operation has to wait on a donation.
    if let Err(e) = refill_hyp_pool(&vcpu.vm.iommu_pool, &mut vcpu.iommu_mc, &pkvm.stage2) {
        warn!("vm {}: failed to refill the IOMMU pool: {}", vcpu.vm.handle(), e);
    }

    let Some(op) = PvIommuOp::n(vcpu.regs.arg(1)) else {
        vcpu.regs.set_retval(SMCCC_RET_NOT_SUPPORTED, 0, 0, 0);
        return HvcExit::Guest;
    };
    if !pkvm.iommu.is_ready() {
        vcpu.regs.set_retval(SMCCC_RET_NOT_SUPPORTED, 0, 0, 0);
        return HvcExit::Guest;
    }
    match op {
        PvIommuOp::AllocDomain => alloc_domain(pkvm, vcpu),
        PvIommuOp::FreeDomain => free_domain(pkvm, vcpu),
        PvIommuOp::AttachDev => attach_dev(pkvm, vcpu),
        PvIommuOp::DetachDev => detach_dev(pkvm, vcpu),
        PvIommuOp::MapPages => map_pages(pkvm, vcpu),
        PvIommuOp::UnmapPages => unmap_pages(pkvm, vcpu),
    }
}

/// Frees every domain `vm` still holds.
pub fn teardown_guest_domains(pkvm: &Pkvm, vm: &HypVm) {
    let mut ids = pkvm.guest_domains.lock();
    for domain in ids.owned_by(vm.handle()) {
        pkvm.iommu.force_free_domain(&vm.iommu_pool, domain);
        ids.free(domain);
    }
}
