// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builds the assignable device array from the platform description.

use log::error;
use log::info;

use crate::addr::is_page_aligned;
use crate::config::DeviceConfig;
use crate::host::iommu::KvmIommu;
use crate::host::memory::HostMemory;
use crate::hyp::device::DevIommu;
use crate::hyp::device::DevResource;
use crate::hyp::device::DeviceHandoff;
use crate::hyp::device::PkvmDevice;
use crate::Error;
use crate::Result;

fn register_device(cfg: &DeviceConfig, kvm_iommu: &KvmIommu) -> Result<PkvmDevice> {
    let mut dev = PkvmDevice::new(cfg.group_id);
    for reg in &cfg.regs {
        if !is_page_aligned(reg.base) || !is_page_aligned(reg.size) {
            return Err(Error::InvalidArgument);
        }
        dev.resources
            .try_push(DevResource {
                base: reg.base,
                size: reg.size,
            })
            .map_err(|_| Error::TooBig)?;
    }
    for iommu in &cfg.iommus {
        dev.iommus
            .try_push(DevIommu {
                id: kvm_iommu.get_iommu_id_by_of(&iommu.node),
                endpoint: iommu.endpoint,
            })
            .map_err(|_| Error::TooBig)?;
    }
    Ok(dev)
}

/// Lays out the device array in host memory, ready to be donated to the hypervisor.
///
/// Nothing is allocated when there are no devices. On failure no memory is kept.
pub fn build_handoff(
    devices: &[DeviceConfig],
    kvm_iommu: &KvmIommu,
    mem: &HostMemory,
) -> Result<DeviceHandoff> {
    info!("found {} assignable devices", devices.len());
    if devices.is_empty() {
        return Ok(Default::default());
    }
    let mut handoff = DeviceHandoff::default();
    for (idx, cfg) in devices.iter().enumerate() {
        match register_device(cfg, kvm_iommu) {
            Ok(dev) => handoff.devices.push(dev),
            Err(e) => {
                error!("device {} ({}): {}", idx, cfg.name, e);
                return Err(e);
            }
        }
    }
    let size = handoff.size().ok_or(Error::TooBig)?;
    let phys = mem.alloc_pages_exact(size).ok_or(Error::NoMemory)?;
    match mem.virt(phys) {
        Some(va) => handoff.va = Some(va),
        None => {
            mem.free_pages_exact(phys, size);
            return Err(Error::InvalidArgument);
        }
    }
    Ok(handoff)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::addr::HypVaLayout;
    use crate::addr::PhysAddr;
    use crate::addr::PAGE_SIZE;
    use crate::config::DeviceIommuConfig;
    use crate::config::RegConfig;
    use crate::hyp::device::MAX_DEV_RESOURCES;
    use crate::hyp::Pkvm;

    fn setup() -> (KvmIommu, Arc<HostMemory>) {
        let layout = HypVaLayout::default();
        let mem = HostMemory::new(PhysAddr(0x4000_0000), 16 * PAGE_SIZE, layout).unwrap();
        let mem = Arc::new(mem);
        (KvmIommu::new(Arc::new(Pkvm::new(layout)), mem.clone()), mem)
    }

    fn device(regs: &[(u64, u64)]) -> DeviceConfig {
        DeviceConfig {
            name: "dev".to_string(),
            group_id: 3,
            regs: regs
                .iter()
                .map(|&(base, size)| RegConfig { base, size })
                .collect(),
            iommus: vec![DeviceIommuConfig {
                node: "/soc/iommu@0".to_string(),
                endpoint: 5,
            }],
        }
    }

    #[test]
    fn no_devices_no_memory() {
        let (kvm_iommu, mem) = setup();
        let handoff = build_handoff(&[], &kvm_iommu, &mem).unwrap();
        assert!(handoff.devices.is_empty());
        assert_eq!(handoff.va, None);
        assert_eq!(mem.nr_free(), 16);
    }

    #[test]
    fn devices_are_laid_out() {
        let (kvm_iommu, mem) = setup();
        let handoff =
            build_handoff(&[device(&[(0x1000_0000, 0x2000)])], &kvm_iommu, &mem).unwrap();
        assert_eq!(handoff.devices.len(), 1);
        let dev = &handoff.devices[0];
        assert_eq!(dev.group_id, 3);
        assert_eq!(dev.resources[0].size, 0x2000);
        // No driver to resolve the node.
        assert_eq!(dev.iommus[0], DevIommu { id: 0, endpoint: 5 });
        assert!(handoff.va.is_some());
        assert!(mem.nr_free() < 16);
    }

    #[test]
    fn bad_resources() {
        let (kvm_iommu, mem) = setup();
        assert_eq!(
            build_handoff(&[device(&[(0x1000_0800, 0x1000)])], &kvm_iommu, &mem).err(),
            Some(Error::InvalidArgument)
        );
        let many: Vec<_> = (0..=MAX_DEV_RESOURCES as u64)
            .map(|i| (0x1000_0000 + i * PAGE_SIZE, PAGE_SIZE))
            .collect();
        assert_eq!(
            build_handoff(&[device(&many)], &kvm_iommu, &mem).err(),
            Some(Error::TooBig)
        );
        assert_eq!(mem.nr_free(), 16);
    }
}
