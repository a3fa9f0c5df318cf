// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SMC Calling Convention register file and return codes.

use std::ops::RangeInclusive;

pub const SMCCC_RET_SUCCESS: u64 = 0;
pub const SMCCC_RET_NOT_SUPPORTED: u64 = -1i64 as u64;
pub const SMCCC_RET_NOT_REQUIRED: u64 = -2i64 as u64;
pub const SMCCC_RET_INVALID_PARAMETER: u64 = -3i64 as u64;

const ARM_SMCCC_FAST_CALL: u32 = 1 << 31;
const ARM_SMCCC_SMC_64: u32 = 1 << 30;
const ARM_SMCCC_OWNER_SHIFT: u32 = 24;
const ARM_SMCCC_OWNER_VENDOR_HYP: u32 = 6;

/// Builds a function id in the 64-bit fast-call space of `owner`.
pub const fn arm_smccc_call_val_64(owner: u32, func_num: u32) -> u32 {
    ARM_SMCCC_FAST_CALL | ARM_SMCCC_SMC_64 | (owner << ARM_SMCCC_OWNER_SHIFT) | (func_num & 0xffff)
}

pub const ARM_SMCCC_KVM_FUNC_PVIOMMU_OP: u32 = 13;

/// Function id of the vendor-hypervisor pvIOMMU call. The operation is selected by arg 1.
pub const ARM_SMCCC_VENDOR_HYP_KVM_PVIOMMU_OP_FUNC_ID: u32 =
    arm_smccc_call_val_64(ARM_SMCCC_OWNER_VENDOR_HYP, ARM_SMCCC_KVM_FUNC_PVIOMMU_OP);

pub const ARM_SMCCC_KVM_FUNC_DEV_REQ_MMIO: u32 = 14;

/// Function id of the call a guest makes to learn the physical address of an assigned device's
/// MMIO page. Arg 1 is the IPA, args 2 and 3 must be zero.
pub const ARM_SMCCC_VENDOR_HYP_KVM_DEV_REQ_MMIO_FUNC_ID: u32 =
    arm_smccc_call_val_64(ARM_SMCCC_OWNER_VENDOR_HYP, ARM_SMCCC_KVM_FUNC_DEV_REQ_MMIO);

/// General purpose registers x0-x7 of a trapped SMCCC call.
///
/// On entry x0 holds the function id and x1-x7 the arguments. On return x0 holds the status and
/// x1-x3 the values.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SmcccRegs {
    x: [u64; 8],
}

impl SmcccRegs {
    /// Registers for a call to `func_id` with up to seven arguments.
    pub fn call(func_id: u32, args: &[u64]) -> SmcccRegs {
        assert!(args.len() < 8, "too many SMCCC arguments");
        let mut regs = SmcccRegs::default();
        regs.x[0] = func_id.into();
        regs.x[1..=args.len()].copy_from_slice(args);
        regs
    }

    pub fn func_id(&self) -> u32 {
        self.x[0] as u32
    }

    pub fn arg(&self, n: usize) -> u64 {
        self.x[n]
    }

    pub fn set_arg(&mut self, n: usize, value: u64) {
        self.x[n] = value;
    }

    /// True when every argument register in `args` is zero. Used for must-be-zero checks.
    pub fn args_zero(&self, args: RangeInclusive<usize>) -> bool {
        self.x[args].iter().all(|&r| r == 0)
    }

    pub fn set_retval(&mut self, a0: u64, a1: u64, a2: u64, a3: u64) {
        self.x[0] = a0;
        self.x[1] = a1;
        self.x[2] = a2;
        self.x[3] = a3;
    }

    /// Status and values as the caller sees them after return.
    pub fn retval(&self) -> [u64; 4] {
        [self.x[0], self.x[1], self.x[2], self.x[3]]
    }
}
