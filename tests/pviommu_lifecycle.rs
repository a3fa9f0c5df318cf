// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use common::*;
use pkvm_iommu::addr::PhysAddr;
use pkvm_iommu::addr::PAGE_SIZE;
use pkvm_iommu::config::DeviceConfig;
use pkvm_iommu::config::DeviceIommuConfig;
use pkvm_iommu::config::PlatformConfig;
use pkvm_iommu::config::RegConfig;
use pkvm_iommu::hyp::mem_protect::PageOwner;
use pkvm_iommu::hyp::pviommu::PvIommuOp;
use pkvm_iommu::hyp::pviommu::PvIommuProt;
use pkvm_iommu::hyp::pviommu::KVM_IOMMU_GUEST_DOMAIN_BASE;
use pkvm_iommu::hyp::pviommu_host::PvIommuRoute;
use pkvm_iommu::hyp::pviommu_host::MAX_NR_PVIOMMU;
use pkvm_iommu::hyp::vm::HvcExit;
use pkvm_iommu::hyp::vm::HypVcpu;
use pkvm_iommu::hyp::Pkvm;
use pkvm_iommu::smccc::SmcccRegs;
use pkvm_iommu::smccc::ARM_SMCCC_VENDOR_HYP_KVM_DEV_REQ_MMIO_FUNC_ID;
use pkvm_iommu::smccc::ARM_SMCCC_VENDOR_HYP_KVM_PVIOMMU_OP_FUNC_ID;
use pkvm_iommu::smccc::SMCCC_RET_INVALID_PARAMETER;
use pkvm_iommu::smccc::SMCCC_RET_NOT_SUPPORTED;
use pkvm_iommu::smccc::SMCCC_RET_SUCCESS;
use pkvm_iommu::Error;
use pkvm_iommu::Result;

const SID: u32 = 7;
const VSID: u32 = 3;
const PVIOMMU: u32 = 0;

#[test]
fn route_from_host_to_guest() {
    let (platform, _) = boot(PlatformConfig::default(), true);
    let pkvm = &platform.pkvm;
    pkvm.host_pviommu_attach(vm_ref(1), PVIOMMU).unwrap();
    pkvm.host_pviommu_add_vsid(vm_ref(1), PVIOMMU, IOMMU_ID, SID, VSID)
        .unwrap();
    assert_eq!(
        pkvm.host_pviommu_add_vsid(vm_ref(1), PVIOMMU, IOMMU_ID, SID + 1, VSID),
        Err(Error::Conflict)
    );

    let handle = pkvm.init_vm(vm_ref(1), 1).unwrap();
    assert_eq!(
        pkvm.get_route(handle, PVIOMMU, VSID),
        Ok(PvIommuRoute {
            sid: SID,
            iommu: IOMMU_ID
        })
    );
    assert_eq!(pkvm.get_route(handle, PVIOMMU, VSID + 1), Err(Error::NotFound));
    // Frozen.
    assert_eq!(
        pkvm.host_pviommu_add_vsid(vm_ref(1), PVIOMMU, IOMMU_ID, SID, VSID + 1),
        Err(Error::NotFound)
    );

    pkvm.teardown_vm(handle).unwrap();
    assert_eq!(pkvm.pviommus.nr_live(), 0);
}

#[test]
fn instance_table_capacity() {
    let (platform, _) = boot(PlatformConfig::default(), false);
    let pkvm = &platform.pkvm;
    for n in 0..MAX_NR_PVIOMMU as u64 {
        pkvm.host_pviommu_attach(vm_ref(n), 0).unwrap();
    }
    assert_eq!(pkvm.host_pviommu_attach(vm_ref(100), 0), Err(Error::Busy));

    // Tearing down one VM frees its slot for the next.
    let handle = pkvm.init_vm(vm_ref(0), 1).unwrap();
    pkvm.teardown_vm(handle).unwrap();
    pkvm.host_pviommu_attach(vm_ref(100), 0).unwrap();
}

#[test]
fn concurrent_driver_registration() {
    let (platform, _) = boot(PlatformConfig::default(), false);
    let kvm_iommu = &platform.kvm_iommu;
    let winners = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let driver = Arc::new(ToyDriver {
                    state: Default::default(),
                });
                match kvm_iommu.register_driver(driver) {
                    Ok(()) => {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => assert_eq!(e, Error::Busy),
                }
                // Whoever won, a published driver is fully usable.
                assert_eq!(kvm_iommu.get_iommu_id_by_of(IOMMU_NODE), IOMMU_ID);
            });
        }
    });
    assert_eq!(winners.load(Ordering::Relaxed), 1);
}

#[test]
fn no_driver_no_pviommu() {
    let (platform, _) = boot(PlatformConfig::default(), false);
    assert!(!platform.pkvm.iommu.is_ready());
    let handle = platform.pkvm.init_vm(vm_ref(1), 1).unwrap();
    let mut vcpu = platform.pkvm.init_vcpu(handle, 0).unwrap();
    for op in [
        PvIommuOp::AllocDomain,
        PvIommuOp::FreeDomain,
        PvIommuOp::AttachDev,
        PvIommuOp::DetachDev,
        PvIommuOp::MapPages,
        PvIommuOp::UnmapPages,
    ] {
        assert_eq!(hvc(&platform, &mut vcpu, op, &[])[0], SMCCC_RET_NOT_SUPPORTED);
    }
}

#[test]
fn dma_lifecycle() {
    let (platform, state) = boot(PlatformConfig::default(), true);
    let pkvm = &platform.pkvm;
    assert!(pkvm.iommu.is_ready());
    pkvm.host_pviommu_attach(vm_ref(1), PVIOMMU).unwrap();
    pkvm.host_pviommu_add_vsid(vm_ref(1), PVIOMMU, IOMMU_ID, SID, VSID)
        .unwrap();
    let handle = pkvm.init_vm(vm_ref(1), 1).unwrap();
    let mut vcpu = pkvm.init_vcpu(handle, 0).unwrap();

    // The domain table leaf and the pgd both need host memory first.
    let ret = hvc(&platform, &mut vcpu, PvIommuOp::AllocDomain, &[]);
    assert_eq!(ret[0], SMCCC_RET_SUCCESS);
    let domain = ret[1];
    assert_eq!(domain, KVM_IOMMU_GUEST_DOMAIN_BASE);
    assert_eq!(pkvm.iommu.domain_refs(domain), Some(1));

    let ret = hvc(
        &platform,
        &mut vcpu,
        PvIommuOp::AttachDev,
        &[PVIOMMU as u64, VSID as u64, 0, domain, 0],
    );
    assert_eq!(ret[0], SMCCC_RET_SUCCESS);
    assert_eq!(pkvm.iommu.domain_refs(domain), Some(2));
    assert_eq!(state.attached.lock().get(&(IOMMU_ID, SID, 0)), Some(&domain));

    let iova = 0x10_0000;
    let ipa = 0x8000_0000;
    let size = 16 * PAGE_SIZE;
    let prot = (PvIommuProt::READ | PvIommuProt::WRITE).bits();
    assert_eq!(
        guest_map(&platform, &mut vcpu, domain, iova, ipa, size, prot),
        size
    );
    assert_eq!(state.mappings.lock().len(), 16);
    // Guest memory was faulted in on the way.
    let (phys, _) = vcpu.vm().stage2.translate(ipa).unwrap();
    assert_eq!(pkvm.stage2.owner(phys.pfn()), PageOwner::Guest(handle));
    assert_eq!(state.mappings.lock().get(&(domain, iova)), Some(&phys));

    let ret = hvc(&platform, &mut vcpu, PvIommuOp::UnmapPages, &[domain, iova, size]);
    assert_eq!(ret[..2], [SMCCC_RET_SUCCESS, size]);
    assert!(state.mappings.lock().is_empty());

    // Busy until detached.
    let ret = hvc(&platform, &mut vcpu, PvIommuOp::FreeDomain, &[domain]);
    assert_eq!(ret[0], SMCCC_RET_INVALID_PARAMETER);
    let ret = hvc(
        &platform,
        &mut vcpu,
        PvIommuOp::DetachDev,
        &[PVIOMMU as u64, VSID as u64, 0, domain],
    );
    assert_eq!(ret[0], SMCCC_RET_SUCCESS);
    let ret = hvc(&platform, &mut vcpu, PvIommuOp::FreeDomain, &[domain]);
    assert_eq!(ret[0], SMCCC_RET_SUCCESS);
    assert_eq!(pkvm.iommu.domain_refs(domain), None);
    assert!(state.pgds.lock().is_empty());

    assert_eq!(pkvm.teardown_vm(handle), Err(Error::Busy));
    drop(vcpu);
    let mut mc = pkvm.teardown_vm(handle).unwrap();
    assert!(!mc.is_empty());
    assert_eq!(pkvm.stage2.owner(phys.pfn()), PageOwner::Host);
    platform.kvm_iommu.guest_free_mc(&mut mc);
}

#[test]
fn guests_only_touch_their_domains() {
    let (platform, _) = boot(PlatformConfig::default(), true);
    let pkvm = &platform.pkvm;
    let a = pkvm.init_vm(vm_ref(1), 1).unwrap();
    let b = pkvm.init_vm(vm_ref(2), 1).unwrap();
    let mut vcpu_a = pkvm.init_vcpu(a, 0).unwrap();
    let mut vcpu_b = pkvm.init_vcpu(b, 0).unwrap();

    let ret = hvc(&platform, &mut vcpu_a, PvIommuOp::AllocDomain, &[]);
    assert_eq!(ret[0], SMCCC_RET_SUCCESS);
    let domain = ret[1];

    let ret = hvc(&platform, &mut vcpu_b, PvIommuOp::FreeDomain, &[domain]);
    assert_eq!(ret[0], SMCCC_RET_INVALID_PARAMETER);
    let ret = hvc(
        &platform,
        &mut vcpu_b,
        PvIommuOp::UnmapPages,
        &[domain, 0, PAGE_SIZE],
    );
    assert_eq!(ret[0], SMCCC_RET_INVALID_PARAMETER);

    // Domains left behind go away with their VM.
    drop(vcpu_a);
    pkvm.teardown_vm(a).unwrap();
    assert_eq!(pkvm.iommu.domain_refs(domain), None);
}

#[test]
fn malformed_calls() {
    let (platform, _) = boot(PlatformConfig::default(), true);
    let handle = platform.pkvm.init_vm(vm_ref(1), 1).unwrap();
    let mut vcpu = platform.pkvm.init_vcpu(handle, 0).unwrap();

    let ret = hvc(&platform, &mut vcpu, PvIommuOp::AllocDomain, &[1]);
    assert_eq!(ret[0], SMCCC_RET_INVALID_PARAMETER);
    let domain = hvc(&platform, &mut vcpu, PvIommuOp::AllocDomain, &[])[1];

    // Unaligned, unknown protection bits, unknown route.
    let ret = hvc(
        &platform,
        &mut vcpu,
        PvIommuOp::MapPages,
        &[domain, 0x800, 0, PAGE_SIZE, 1],
    );
    assert_eq!(ret[0], SMCCC_RET_INVALID_PARAMETER);
    let ret = hvc(
        &platform,
        &mut vcpu,
        PvIommuOp::MapPages,
        &[domain, 0, 0, PAGE_SIZE, 1 << 40],
    );
    assert_eq!(ret[0], SMCCC_RET_INVALID_PARAMETER);
    let ret = hvc(
        &platform,
        &mut vcpu,
        PvIommuOp::AttachDev,
        &[PVIOMMU as u64, VSID as u64, 0, domain, 0],
    );
    assert_eq!(ret[0], SMCCC_RET_INVALID_PARAMETER);

    // Unknown op, then unknown function.
    vcpu.regs = SmcccRegs::call(ARM_SMCCC_VENDOR_HYP_KVM_PVIOMMU_OP_FUNC_ID, &[42]);
    assert_eq!(platform.pkvm.handle_guest_hvc(&mut vcpu), HvcExit::Guest);
    assert_eq!(vcpu.regs.retval()[0], SMCCC_RET_NOT_SUPPORTED);
    vcpu.regs = SmcccRegs::call(0xc600_0001, &[0]);
    assert_eq!(platform.pkvm.handle_guest_hvc(&mut vcpu), HvcExit::Guest);
    assert_eq!(vcpu.regs.retval()[0], SMCCC_RET_NOT_SUPPORTED);
}

const MMIO_BASE: u64 = 0x1000_0000;

fn device_config() -> PlatformConfig {
    PlatformConfig {
        devices: vec![DeviceConfig {
            name: "dma-engine".to_string(),
            group_id: 1,
            regs: vec![RegConfig {
                base: MMIO_BASE,
                size: PAGE_SIZE,
            }],
            iommus: vec![DeviceIommuConfig {
                node: IOMMU_NODE.to_string(),
                endpoint: SID as u64,
            }],
        }],
        ..Default::default()
    }
}

fn request_mmio(pkvm: &Pkvm, vcpu: &mut HypVcpu, args: &[u64]) -> [u64; 4] {
    vcpu.regs = SmcccRegs::call(ARM_SMCCC_VENDOR_HYP_KVM_DEV_REQ_MMIO_FUNC_ID, args);
    assert_eq!(pkvm.handle_guest_hvc(vcpu), HvcExit::Guest);
    vcpu.regs.retval()
}

#[test]
fn assigned_device_endpoint() {
    let (platform, _) = boot(device_config(), true);
    let pkvm = &platform.pkvm;
    assert_eq!(pkvm.devices.len(), 1);

    for n in [1, 2] {
        pkvm.host_pviommu_attach(vm_ref(n), PVIOMMU).unwrap();
        pkvm.host_pviommu_add_vsid(vm_ref(n), PVIOMMU, IOMMU_ID, SID, VSID)
            .unwrap();
    }
    let owner = pkvm.init_vm(vm_ref(1), 1).unwrap();
    let other = pkvm.init_vm(vm_ref(2), 1).unwrap();
    let mut vcpu = pkvm.init_vcpu(owner, 0).unwrap();
    let mut intruder = pkvm.init_vcpu(other, 0).unwrap();

    let resets = Arc::new(AtomicUsize::new(0));
    let counter = resets.clone();
    pkvm.host_register_device_reset(
        PhysAddr(MMIO_BASE),
        Arc::new(move |_: bool| -> Result<()> {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    )
    .unwrap();

    let pfn = MMIO_BASE / PAGE_SIZE;
    // The host must give the MMIO up first.
    assert_eq!(
        pkvm.host_map_guest_mmio(&vcpu, pfn, 0x9000),
        Err(Error::PermissionDenied)
    );
    pkvm.host_device_assign_mmio(pfn, 1).unwrap();
    pkvm.host_map_guest_mmio(&vcpu, pfn, 0x9000).unwrap();
    assert_eq!(resets.load(Ordering::Relaxed), 1);
    assert_eq!(pkvm.devices.state(MMIO_BASE), Some((Some(owner), 0)));
    assert_eq!(pkvm.host_device_reclaim_mmio(pfn, 1), Err(Error::Busy));

    // The guest learns where the page really is; nobody else does.
    let ipa = 0x9000 * PAGE_SIZE;
    assert_eq!(
        request_mmio(pkvm, &mut vcpu, &[ipa]),
        [SMCCC_RET_SUCCESS, MMIO_BASE, 0, 0]
    );
    assert_eq!(
        request_mmio(pkvm, &mut vcpu, &[ipa, 1]),
        [SMCCC_RET_INVALID_PARAMETER, 0, 0, 0]
    );
    assert_eq!(
        request_mmio(pkvm, &mut vcpu, &[ipa + PAGE_SIZE]),
        [SMCCC_RET_INVALID_PARAMETER, 0, 0, 0]
    );
    assert_eq!(
        request_mmio(pkvm, &mut intruder, &[ipa]),
        [SMCCC_RET_INVALID_PARAMETER, 0, 0, 0]
    );

    let domain = hvc(&platform, &mut vcpu, PvIommuOp::AllocDomain, &[])[1];
    let attach = [PVIOMMU as u64, VSID as u64, 0, domain, 0];
    let ret = hvc(&platform, &mut vcpu, PvIommuOp::AttachDev, &attach);
    assert_eq!(ret[0], SMCCC_RET_SUCCESS);
    assert_eq!(pkvm.devices.state(MMIO_BASE), Some((Some(owner), 1)));

    // Same endpoint, wrong VM.
    let other_domain = hvc(&platform, &mut intruder, PvIommuOp::AllocDomain, &[])[1];
    let ret = hvc(
        &platform,
        &mut intruder,
        PvIommuOp::AttachDev,
        &[PVIOMMU as u64, VSID as u64, 0, other_domain, 0],
    );
    assert_eq!(ret[0], SMCCC_RET_INVALID_PARAMETER);
    assert_eq!(pkvm.devices.state(MMIO_BASE), Some((Some(owner), 1)));

    // Teardown resets the device and gives it back to the host.
    drop(vcpu);
    pkvm.teardown_vm(owner).unwrap();
    assert_eq!(resets.load(Ordering::Relaxed), 2);
    assert_eq!(pkvm.devices.state(MMIO_BASE), Some((None, 0)));
    assert_eq!(pkvm.stage2.owner(pfn), PageOwner::Host);
}

#[test]
fn host_vm_cannot_share_instances() {
    let (platform, _) = boot(PlatformConfig::default(), true);
    let pkvm = &platform.pkvm;
    pkvm.host_pviommu_attach(vm_ref(1), PVIOMMU).unwrap();
    pkvm.host_pviommu_add_vsid(vm_ref(1), PVIOMMU, IOMMU_ID, SID, VSID)
        .unwrap();
    let first = pkvm.init_vm(vm_ref(1), 1).unwrap();
    assert_eq!(pkvm.init_vm(vm_ref(1), 1), Err(Error::Busy));
    pkvm.teardown_vm(first).unwrap();

    // The freed slot goes to another host VM with a different route for the same vsid.
    pkvm.host_pviommu_attach(vm_ref(2), PVIOMMU).unwrap();
    pkvm.host_pviommu_add_vsid(vm_ref(2), PVIOMMU, IOMMU_ID, SID + 1, VSID)
        .unwrap();
    let second = pkvm.init_vm(vm_ref(2), 1).unwrap();
    let again = pkvm.init_vm(vm_ref(1), 1).unwrap();
    assert_eq!(pkvm.get_route(again, PVIOMMU, VSID), Err(Error::NotFound));
    assert_eq!(
        pkvm.get_route(second, PVIOMMU, VSID),
        Ok(PvIommuRoute {
            sid: SID + 1,
            iommu: IOMMU_ID
        })
    );

    // The guest of the recreated VM cannot reach the other VM's endpoint either.
    let mut vcpu = pkvm.init_vcpu(again, 0).unwrap();
    let domain = hvc(&platform, &mut vcpu, PvIommuOp::AllocDomain, &[])[1];
    let ret = hvc(
        &platform,
        &mut vcpu,
        PvIommuOp::AttachDev,
        &[PVIOMMU as u64, VSID as u64, 0, domain, 0],
    );
    assert_eq!(ret[0], SMCCC_RET_INVALID_PARAMETER);
}

#[test]
fn malformed_memcache_blocks() {
    let (platform, _) = boot(PlatformConfig::default(), true);
    let pkvm = &platform.pkvm;
    let handle = pkvm.init_vm(vm_ref(1), 1).unwrap();
    let mut vcpu = pkvm.init_vcpu(handle, 0).unwrap();

    for order in [64, 52, 10] {
        vcpu.iommu_mc.push(PhysAddr(0x1000), order);
    }
    // The host's bad blocks are refused, the call still completes with memory it adds later.
    let ret = hvc(&platform, &mut vcpu, PvIommuOp::AllocDomain, &[]);
    assert_eq!(ret, [SMCCC_RET_SUCCESS, KVM_IOMMU_GUEST_DOMAIN_BASE, 0, 0]);
    assert_eq!(pkvm.stage2.owner(1), PageOwner::Host);
    assert!(vcpu
        .iommu_mc
        .iter()
        .any(|page| page.order == 10 && page.phys == PhysAddr(0x1000)));
}
