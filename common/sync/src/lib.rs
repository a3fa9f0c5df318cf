// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive types whose methods panic rather than returning error in case of poison.
//!
//! The `Mutex` type in this crate wraps the standard library version and mirrors the same
//! methods, except that it panics where the standard library would return an Error. Releases are
//! built with panic=abort so poisoning never occurs, and code should not have to consider it.
//!
//! `SpinLock` is the lock to use from contexts that must never sleep: hypervisor call handlers
//! and anything reached from them. It busy-waits and has no poisoning either.
//!
//! Developers should feel free to use types defined in this crate anywhere they would otherwise
//! be using the corresponding types in std::sync.

mod mutex;
mod spin_lock;

pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;
pub use crate::spin_lock::SpinLock;
pub use crate::spin_lock::SpinLockGuard;
