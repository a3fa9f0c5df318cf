// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A toy IOMMU driver and a guest that drives it through hypercalls.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use pkvm_iommu::addr::HypVaLayout;
use pkvm_iommu::addr::PhysAddr;
use pkvm_iommu::addr::PAGE_SIZE;
use pkvm_iommu::addr::PMD_SHIFT;
use pkvm_iommu::config::PlatformConfig;
use pkvm_iommu::host::DriverCaps;
use pkvm_iommu::host::KvmIommu;
use pkvm_iommu::host::KvmIommuDriver;
use pkvm_iommu::host::Platform;
use pkvm_iommu::hyp::iommu::HypIommuOps;
use pkvm_iommu::hyp::iommu::IommuProt;
use pkvm_iommu::hyp::iommu::Progress;
use pkvm_iommu::hyp::memcache::HypMemcache;
use pkvm_iommu::hyp::pool::PageSource;
use pkvm_iommu::hyp::pviommu::PvIommuOp;
use pkvm_iommu::hyp::vm::HvcExit;
use pkvm_iommu::hyp::vm::HypVcpu;
use pkvm_iommu::smccc::SmcccRegs;
use pkvm_iommu::smccc::ARM_SMCCC_VENDOR_HYP_KVM_PVIOMMU_OP_FUNC_ID;
use pkvm_iommu::smccc::SMCCC_RET_SUCCESS;
use pkvm_iommu::DomainId;
use pkvm_iommu::Error;
use pkvm_iommu::HostVmRef;
use pkvm_iommu::IommuId;
use pkvm_iommu::Result;
use sync::Mutex;

pub const IOMMU_NODE: &str = "/soc/iommu@1000";
pub const IOMMU_ID: IommuId = 1;
pub const HOST_MEM_BASE: PhysAddr = PhysAddr(0x4000_0000);
pub const HOST_MEM_SIZE: u64 = 4096 * PAGE_SIZE;

/// What the hypervisor half of the toy driver knows.
#[derive(Default)]
pub struct DriverState {
    pub pgds: Mutex<BTreeMap<DomainId, PhysAddr>>,
    /// One table page per domain and 2 MiB of IOVA space.
    pub tables: Mutex<BTreeMap<(DomainId, u64), PhysAddr>>,
    pub mappings: Mutex<BTreeMap<(DomainId, u64), PhysAddr>>,
    pub attached: Mutex<BTreeMap<(IommuId, u32, u32), DomainId>>,
}

pub struct ToyHypOps(pub Arc<DriverState>);

impl HypIommuOps for ToyHypOps {
    fn has_iommu(&self, iommu: IommuId) -> bool {
        iommu == IOMMU_ID
    }

    fn alloc_domain(&self, pool: &dyn PageSource, domain: DomainId, _: u32) -> Result<()> {
        let pgd = pool.alloc_pages(0).ok_or(Error::NoMemory)?;
        self.0.pgds.lock().insert(domain, pgd);
        Ok(())
    }

    fn free_domain(&self, pool: &dyn PageSource, domain: DomainId) {
        if let Some(pgd) = self.0.pgds.lock().remove(&domain) {
            pool.put_pages(pgd, 0);
        }
        self.0.tables.lock().retain(|&(d, _), table| {
            if d == domain {
                pool.put_pages(*table, 0);
            }
            d != domain
        });
        self.0.mappings.lock().retain(|&(d, _), _| d != domain);
    }

    fn attach_dev(
        &self,
        _: &dyn PageSource,
        iommu: IommuId,
        domain: DomainId,
        endpoint: u32,
        pasid: u32,
        _: u32,
    ) -> Result<()> {
        let mut attached = self.0.attached.lock();
        if attached.contains_key(&(iommu, endpoint, pasid)) {
            return Err(Error::Busy);
        }
        attached.insert((iommu, endpoint, pasid), domain);
        Ok(())
    }

    fn detach_dev(
        &self,
        iommu: IommuId,
        domain: DomainId,
        endpoint: u32,
        pasid: u32,
    ) -> Result<()> {
        let mut attached = self.0.attached.lock();
        match attached.get(&(iommu, endpoint, pasid)) {
            Some(&d) if d == domain => {
                attached.remove(&(iommu, endpoint, pasid));
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    fn map_pages(
        &self,
        pool: &dyn PageSource,
        domain: DomainId,
        iova: u64,
        paddr: PhysAddr,
        pgsize: u64,
        pgcount: u64,
        _: IommuProt,
    ) -> Progress {
        let mut tables = self.0.tables.lock();
        let mut mappings = self.0.mappings.lock();
        for i in 0..pgcount {
            let va = iova + i * pgsize;
            let key = (domain, va >> PMD_SHIFT);
            if !tables.contains_key(&key) {
                match pool.alloc_pages(0) {
                    Some(table) => tables.insert(key, table),
                    None => return Progress::starved(i * pgsize),
                };
            }
            mappings.insert((domain, va), PhysAddr(paddr.offset() + i * pgsize));
        }
        Progress::done(pgcount * pgsize)
    }

    fn unmap_pages(
        &self,
        _: &dyn PageSource,
        domain: DomainId,
        iova: u64,
        pgsize: u64,
        pgcount: u64,
    ) -> Progress {
        let mut mappings = self.0.mappings.lock();
        for i in 0..pgcount {
            if mappings.remove(&(domain, iova + i * pgsize)).is_none() {
                return Progress::done(i * pgsize);
            }
        }
        Progress::done(pgcount * pgsize)
    }
}

/// The host half of the toy driver.
pub struct ToyDriver {
    pub state: Arc<DriverState>,
}

impl KvmIommuDriver for ToyDriver {
    fn caps(&self) -> DriverCaps {
        DriverCaps::ID_BY_OF
    }

    fn init_driver(&self, kvm_iommu: &KvmIommu) -> Result<()> {
        let mut atomic_mc = HypMemcache::new();
        kvm_iommu.memory().topup_memcache(&mut atomic_mc, 2, 0)?;
        kvm_iommu.init_hyp(Box::new(ToyHypOps(self.state.clone())), &mut atomic_mc, 0)
    }

    fn remove_driver(&self) {}

    fn get_iommu_id_by_of(&self, node: &str) -> IommuId {
        if node == IOMMU_NODE {
            IOMMU_ID
        } else {
            0
        }
    }
}

/// A booted machine, with the toy driver when `with_driver` is set.
pub fn boot(config: PlatformConfig, with_driver: bool) -> (Platform, Arc<DriverState>) {
    let platform = Platform::new(config, HOST_MEM_BASE, HOST_MEM_SIZE).unwrap();
    let state = Arc::new(DriverState::default());
    if with_driver {
        platform
            .kvm_iommu
            .register_driver(Arc::new(ToyDriver {
                state: state.clone(),
            }))
            .unwrap();
    }
    platform.finalize();
    (platform, state)
}

pub fn vm_ref(n: u64) -> HostVmRef {
    HostVmRef::from_raw(HypVaLayout::default().host_linear_base + 0x1_0000_0000 + n * PAGE_SIZE)
}

const GUEST_PC: u64 = 0x8_0000;

/// Issues a pvIOMMU call from `vcpu`, serving memory requests the way KVM does between runs.
///
/// Calls the hypervisor asked to repeat are repeated; otherwise the guest sees the registers as
/// left on the first exit.
pub fn hvc(platform: &Platform, vcpu: &mut HypVcpu, op: PvIommuOp, args: &[u64]) -> [u64; 4] {
    let mut call = vec![op as u64];
    call.extend_from_slice(args);
    vcpu.regs = SmcccRegs::call(ARM_SMCCC_VENDOR_HYP_KVM_PVIOMMU_OP_FUNC_ID, &call);
    loop {
        vcpu.pc = GUEST_PC;
        match platform.pkvm.handle_guest_hvc(vcpu) {
            HvcExit::Guest => return vcpu.regs.retval(),
            HvcExit::Host(req) => {
                platform.kvm_iommu.handle_mem_request(vcpu, req).unwrap();
                if vcpu.pc == GUEST_PC {
                    return vcpu.regs.retval();
                }
            }
        }
    }
}

/// Maps `[ipa, ipa + size)` at `iova`, reissuing the call for whatever is left after each exit.
pub fn guest_map(
    platform: &Platform,
    vcpu: &mut HypVcpu,
    domain: DomainId,
    iova: u64,
    ipa: u64,
    size: u64,
    prot: u64,
) -> u64 {
    let mut done = 0;
    for _ in 0..64 {
        let ret = hvc(
            platform,
            vcpu,
            PvIommuOp::MapPages,
            &[domain, iova + done, ipa + done, size - done, prot],
        );
        assert_eq!(ret[0], SMCCC_RET_SUCCESS);
        done += ret[1];
        if done == size {
            return done;
        }
    }
    panic!("map of {:#x} bytes did not converge, {:#x} done", size, done);
}
