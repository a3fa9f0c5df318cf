// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The reserved region IOMMU page-table blocks are carved from, one PMD at a time.

use log::info;
use log::warn;
use sync::Mutex;

use crate::addr::is_aligned;
use crate::addr::PhysAddr;
use crate::addr::PMD_SIZE;
use crate::config::ReservedMemConfig;
use crate::Error;
use crate::Result;

pub struct IommuCma {
    name: String,
    base: PhysAddr,
    size: u64,
    // First PMD-aligned address in the region, and the state of each whole PMD from there.
    first_pmd: u64,
    used: Mutex<Vec<bool>>,
}

impl IommuCma {
    /// Sets up the region described by `rmem`.
    ///
    /// A region that is not PMD aligned is still accepted, only its whole PMDs are handed out.
    pub fn init(rmem: &ReservedMemConfig) -> Result<IommuCma> {
        if rmem.size == 0 {
            return Err(Error::InvalidArgument);
        }
        let end = rmem
            .base
            .checked_add(rmem.size)
            .ok_or(Error::InvalidArgument)?;
        if !is_aligned(rmem.base, PMD_SIZE) || !is_aligned(rmem.size, PMD_SIZE) {
            warn!(
                "{}: [{:#x}, {:#x}) is not aligned to {:#x}",
                rmem.name, rmem.base, end, PMD_SIZE
            );
        }
        let first_pmd = rmem
            .base
            .checked_next_multiple_of(PMD_SIZE)
            .ok_or(Error::InvalidArgument)?;
        let nr_pmds = end.saturating_sub(first_pmd) / PMD_SIZE;
        info!(
            "{}: {} MiB of IOMMU CMA at {:#x}",
            rmem.name,
            rmem.size >> 20,
            rmem.base
        );
        Ok(IommuCma {
            name: rmem.name.clone(),
            base: PhysAddr(rmem.base),
            size: rmem.size,
            first_pmd,
            used: Mutex::new(vec![false; nr_pmds as usize]),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn nr_pmds(&self) -> usize {
        self.used.lock().len()
    }

    pub fn alloc_pmd(&self) -> Option<PhysAddr> {
        let mut used = self.used.lock();
        let idx = used.iter().position(|&u| !u)?;
        used[idx] = true;
        Some(PhysAddr(self.first_pmd + idx as u64 * PMD_SIZE))
    }

    pub fn free_pmd(&self, phys: PhysAddr) {
        let mut used = self.used.lock();
        let idx = phys
            .offset()
            .checked_sub(self.first_pmd)
            .filter(|off| off % PMD_SIZE == 0)
            .map(|off| (off / PMD_SIZE) as usize)
            .filter(|&idx| idx < used.len());
        match idx {
            Some(idx) => used[idx] = false,
            None => warn!("{}: {} is not one of our blocks", self.name, phys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rmem(base: u64, size: u64) -> ReservedMemConfig {
        ReservedMemConfig {
            name: "pkvm-iommu-cma".to_string(),
            base,
            size,
        }
    }

    #[test]
    fn hands_out_whole_pmds() {
        let cma = IommuCma::init(&rmem(0x8000_0000, 2 * PMD_SIZE)).unwrap();
        assert_eq!(cma.nr_pmds(), 2);
        let a = cma.alloc_pmd().unwrap();
        let b = cma.alloc_pmd().unwrap();
        assert_eq!(a, PhysAddr(0x8000_0000));
        assert_eq!(b, PhysAddr(0x8000_0000 + PMD_SIZE));
        assert_eq!(cma.alloc_pmd(), None);
        cma.free_pmd(a);
        assert_eq!(cma.alloc_pmd(), Some(a));
    }

    #[test]
    fn misaligned_region_is_accepted() {
        // Starts half way into a PMD: only the one whole PMD after it is usable.
        let cma = IommuCma::init(&rmem(0x8010_0000, 2 * PMD_SIZE)).unwrap();
        assert_eq!(cma.base(), PhysAddr(0x8010_0000));
        assert_eq!(cma.size(), 2 * PMD_SIZE);
        assert_eq!(cma.nr_pmds(), 1);
        assert_eq!(cma.alloc_pmd(), Some(PhysAddr(0x8020_0000)));
        // Not ours, ignored.
        cma.free_pmd(PhysAddr(0x8010_0000));
        assert_eq!(cma.alloc_pmd(), None);
    }

    #[test]
    fn empty_region() {
        assert!(IommuCma::init(&rmem(0x8000_0000, 0)).is_err());
        assert!(IommuCma::init(&rmem(u64::MAX - PMD_SIZE, 2 * PMD_SIZE)).is_err());
    }
}
