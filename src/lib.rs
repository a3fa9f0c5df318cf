// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DMA isolation for protected VMs behind a paravirtualized IOMMU.
//!
//! The crate is split along the trust boundary it models:
//!
//! - [`hyp`] is the trusted side. It owns the pvIOMMU instance table, the device registry, the
//!   IOMMU memory pools and the guest hypercall handlers. Nothing in it sleeps; every shared
//!   structure is guarded by a [`sync::SpinLock`].
//! - [`host`] is the untrusted host kernel side. It registers the IOMMU driver, carves the CMA
//!   region, describes assignable devices and proposes pvIOMMU routes, all through calls into
//!   [`hyp::Pkvm`].
//!
//! Host-supplied addresses never cross into the hypervisor untranslated: see
//! [`addr::HypVaLayout`].

pub mod addr;
pub mod config;
pub mod host;
pub mod hyp;
pub mod smccc;

use remain::sorted;
use thiserror::Error;

pub use crate::addr::HostVmRef;
pub use crate::config::PlatformConfig;
pub use crate::hyp::Pkvm;

/// Handle of a physical IOMMU as defined by the IOMMU driver.
pub type IommuId = u64;

/// Handle of an IOMMU translation domain.
pub type DomainId = u64;

#[sorted]
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    #[error("resource is busy or exhausted")]
    Busy,
    #[error("entry already exists")]
    Conflict,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such device")]
    NoDevice,
    #[error("out of memory")]
    NoMemory,
    #[error("no such entry")]
    NotFound,
    #[error("operation not supported")]
    NotSupported,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("too many elements")]
    TooBig,
}

impl Error {
    /// The positive errno value matching this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Busy => libc::EBUSY,
            Error::Conflict => libc::EEXIST,
            Error::InvalidArgument => libc::EINVAL,
            Error::NoDevice => libc::ENODEV,
            Error::NoMemory => libc::ENOMEM,
            Error::NotFound => libc::ENOENT,
            Error::NotSupported => libc::EOPNOTSUPP,
            Error::PermissionDenied => libc::EPERM,
            Error::TooBig => libc::E2BIG,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Folds a result into the kernel calling convention: 0 on success, negative errno on failure.
pub fn kernel_ret(res: Result<()>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(e) => -e.errno(),
    }
}
