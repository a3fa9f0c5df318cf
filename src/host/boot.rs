// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Late boot: bring up the IOMMU driver and hand the assignable devices to the hypervisor.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use log::error;
use log::warn;

use crate::addr::PhysAddr;
use crate::config::PlatformConfig;
use crate::host::cma::IommuCma;
use crate::host::device::build_handoff;
use crate::host::iommu::KvmIommu;
use crate::host::memory::HostMemory;
use crate::hyp::Pkvm;

/// Host and hypervisor state of one machine.
pub struct Platform {
    pub config: PlatformConfig,
    pub pkvm: Arc<Pkvm>,
    pub kvm_iommu: KvmIommu,
}

impl Platform {
    /// Sets up both sides over host memory `[mem_base, mem_base + mem_size)`.
    ///
    /// The IOMMU driver registers with [`Platform::kvm_iommu`] before [`Platform::finalize`].
    pub fn new(config: PlatformConfig, mem_base: PhysAddr, mem_size: u64) -> anyhow::Result<Self> {
        let pkvm = Arc::new(Pkvm::new(config.hyp_va));
        let mem = HostMemory::new(mem_base, mem_size, config.hyp_va)
            .with_context(|| format!("invalid host memory {}+{:#x}", mem_base, mem_size))?;
        let kvm_iommu = KvmIommu::new(pkvm.clone(), Arc::new(mem));
        if let Some(rmem) = &config.iommu_cma {
            let cma = IommuCma::init(rmem)
                .with_context(|| format!("failed to set up reserved region {}", rmem.name))?;
            kvm_iommu
                .set_cma(cma)
                .context("failed to expose the IOMMU CMA region")?;
        }
        Ok(Platform {
            config,
            pkvm,
            kvm_iommu,
        })
    }

    pub fn from_file<P: AsRef<Path>>(
        path: P,
        mem_base: PhysAddr,
        mem_size: u64,
    ) -> anyhow::Result<Self> {
        let config = PlatformConfig::load(path).context("failed to load platform config")?;
        Platform::new(config, mem_base, mem_size)
    }

    /// Brings up the registered IOMMU driver and the device registry.
    ///
    /// Neither failure is fatal. Without a driver guests get no pvIOMMU; without a registry no
    /// device can be assigned.
    pub fn finalize(&self) {
        if let Err(e) = self.kvm_iommu.init_driver() {
            error!("failed to init KVM IOMMU driver: {}", e);
        }
        let handoff = match build_handoff(
            &self.config.devices,
            &self.kvm_iommu,
            self.kvm_iommu.memory(),
        ) {
            Ok(handoff) => handoff,
            Err(e) => {
                error!("failed to init kvm devices: {}", e);
                return;
            }
        };
        if let Err(e) = self.pkvm.host_devices_init(handoff) {
            warn!(
                "assignable devices failed to initialize in the hypervisor: {}",
                e
            );
        }
    }
}
