// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Locks the given mutex, recovering the guard if another thread panicked
/// while holding it.
///
/// The engine never runs user code while holding one of its locks, so a
/// poisoned lock still protects a consistent value.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status, to inspect or modify it without notifying anyone.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        lock(&self.mutex)
    }

    /// Sets the status to the given value without notifying anyone.
    pub fn set(&self, t: T) {
        *self.lock() = t;
    }

    /// Runs the given function on the locked status, then notifies one waiting
    /// thread.
    pub fn notify_one_with(&self, f: impl FnOnce(&mut T)) {
        f(&mut *self.lock());
        self.condvar.notify_one();
    }

    /// Sets the status to the given value and notifies all waiting threads.
    pub fn notify_all(&self, t: T) {
        *self.lock() = t;
        self.condvar.notify_all();
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.lock(), predicate)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the predicate is false on this status, or until the timeout
    /// elapses.
    ///
    /// The returned boolean is `true` if the timeout elapsed while the
    /// predicate was still true.
    pub fn wait_timeout_while(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'_, T>, bool) {
        let (guard, result) = self
            .condvar
            .wait_timeout_while(self.lock(), timeout, predicate)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }

    /// Waits on an already locked status for at most the given timeout, or
    /// until another thread notifies it.
    ///
    /// Spurious wake-ups are possible, so the caller must re-check whatever
    /// condition it waits for.
    pub fn wait_timeout<'a>(
        &'a self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> MutexGuard<'a, T> {
        let (guard, _) = self
            .condvar
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        guard
    }

    /// Notifies all waiting threads without changing the status.
    pub fn wake_all(&self) {
        let _guard = self.lock();
        self.condvar.notify_all();
    }
}
