// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host kernel side.

pub mod boot;
pub mod cma;
pub mod device;
pub mod iommu;
pub mod memory;

pub use crate::host::boot::Platform;
pub use crate::host::iommu::DriverCaps;
pub use crate::host::iommu::HostDevice;
pub use crate::host::iommu::KvmIommu;
pub use crate::host::iommu::KvmIommuDriver;
