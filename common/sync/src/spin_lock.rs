// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Debug;

use ::spin::mutex::SpinMutex;
pub use ::spin::mutex::SpinMutexGuard as SpinLockGuard;

/// A lock that busy-waits instead of sleeping.
///
/// Critical sections guarded by a `SpinLock` must be short and bounded: they are entered from
/// contexts that cannot schedule, and a waiter burns its CPU until the holder releases.
#[derive(Default)]
pub struct SpinLock<T: ?Sized> {
    inner: SpinMutex<T>,
}

impl<T> SpinLock<T> {
    /// Creates a new, unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> SpinLock<T> {
        SpinLock {
            inner: SpinMutex::new(value),
        }
    }

    /// Consumes the lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spins until the lock is acquired. The lock is released when the guard is dropped.
    pub fn lock(&self) -> SpinLockGuard<T> {
        self.inner.lock()
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SpinLockGuard<T>> {
        self.inner.try_lock()
    }

    /// Returns true if some CPU currently holds the lock.
    ///
    /// Only meaningful as a debugging assertion; the answer may be stale by the time it is read.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Returns a mutable reference to the underlying data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: ?Sized + Debug> Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}
