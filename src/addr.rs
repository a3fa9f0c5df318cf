// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Address types and the host to hypervisor address translation.
//!
//! The host kernel and the hypervisor map physical memory at different linear offsets. A value
//! handed over by the host is only meaningful inside the hypervisor after going through
//! [`HypVaLayout`], which is the one place this translation happens.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use static_assertions::const_assert;

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PMD_SHIFT: u64 = 21;
pub const PMD_SIZE: u64 = 1 << PMD_SHIFT;
/// Allocation order of one PMD-sized block, in pages.
pub const PMD_ORDER: u8 = (PMD_SHIFT - PAGE_SHIFT) as u8;
/// Largest block the host may hand to the hypervisor in one piece.
pub const MAX_BLOCK_ORDER: u8 = PMD_ORDER;

const_assert!(PMD_SHIFT > PAGE_SHIFT);

/// Rounds `size` up to a whole number of pages. Returns `None` on overflow.
pub fn page_align(size: u64) -> Option<u64> {
    size.checked_add(PAGE_SIZE - 1).map(|s| s & !(PAGE_SIZE - 1))
}

pub fn is_aligned(value: u64, align: u64) -> bool {
    debug_assert!(align.is_power_of_two());
    value & (align - 1) == 0
}

pub fn is_page_aligned(value: u64) -> bool {
    is_aligned(value, PAGE_SIZE)
}

/// Smallest order such that `PAGE_SIZE << order >= size`.
pub fn get_order(size: u64) -> u8 {
    if size <= PAGE_SIZE {
        return 0;
    }
    let pages = (size - 1) >> PAGE_SHIFT;
    (u64::BITS - pages.leading_zeros()) as u8
}

/// Size in bytes of a block of the given order, `None` if it does not fit in 64 bits.
pub fn order_size(order: u8) -> Option<u64> {
    1u64.checked_shl(PAGE_SHIFT as u32 + u32::from(order))
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub fn from_pfn(pfn: u64) -> PhysAddr {
        PhysAddr(pfn << PAGE_SHIFT)
    }

    pub fn pfn(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    pub fn offset(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: u64) -> Option<PhysAddr> {
        self.0.checked_add(other).map(PhysAddr)
    }

    pub fn is_aligned(self, align: u64) -> bool {
        is_aligned(self.0, align)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A host kernel linear-map virtual address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostVirtAddr(pub u64);

/// A hypervisor virtual address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HypVirtAddr(pub u64);

/// An opaque reference to a host VM object, exactly as the host passed it.
///
/// The hypervisor never dereferences or compares these directly; they are turned into a
/// [`HostKvm`] key by [`HypVaLayout::host_kvm`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HostVmRef(u64);

impl HostVmRef {
    pub const NULL: HostVmRef = HostVmRef(0);

    pub fn from_raw(raw: u64) -> HostVmRef {
        HostVmRef(raw)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// The hypervisor-side identity of a host VM object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostKvm(HypVirtAddr);

impl HostKvm {
    pub fn hyp_va(&self) -> HypVirtAddr {
        self.0
    }
}

/// Placement of the host and hypervisor linear maps of physical memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HypVaLayout {
    /// Host virtual address at which physical address 0 is mapped.
    pub host_linear_base: u64,
    /// Hypervisor virtual address at which physical address 0 is mapped.
    pub hyp_linear_base: u64,
}

impl Default for HypVaLayout {
    fn default() -> Self {
        HypVaLayout {
            host_linear_base: 0xffff_0000_0000_0000,
            hyp_linear_base: 0x0000_8000_0000_0000,
        }
    }
}

impl HypVaLayout {
    pub fn host_va(&self, phys: PhysAddr) -> Option<HostVirtAddr> {
        self.host_linear_base.checked_add(phys.0).map(HostVirtAddr)
    }

    pub fn host_va_to_phys(&self, va: HostVirtAddr) -> Option<PhysAddr> {
        va.0.checked_sub(self.host_linear_base).map(PhysAddr)
    }

    pub fn hyp_va(&self, phys: PhysAddr) -> Option<HypVirtAddr> {
        self.hyp_linear_base.checked_add(phys.0).map(HypVirtAddr)
    }

    pub fn hyp_va_to_phys(&self, va: HypVirtAddr) -> Option<PhysAddr> {
        va.0.checked_sub(self.hyp_linear_base).map(PhysAddr)
    }

    /// Translates a host linear-map address into the hypervisor's view of the same memory.
    ///
    /// Returns `None` for addresses outside the host linear map.
    pub fn kern_hyp_va(&self, va: HostVirtAddr) -> Option<HypVirtAddr> {
        self.host_va_to_phys(va).and_then(|phys| self.hyp_va(phys))
    }

    /// Turns a host VM reference into the key the hypervisor tables use.
    ///
    /// This is the only path from a host-chosen VM reference to a hypervisor-side identity. A
    /// null or malformed reference has no identity.
    pub fn host_kvm(&self, vm: HostVmRef) -> Option<HostKvm> {
        if vm.is_null() {
            return None;
        }
        self.kern_hyp_va(HostVirtAddr(vm.0)).map(HostKvm)
    }
}
