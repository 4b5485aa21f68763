use crate::RawLock;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// A value protected by a raw lock `R`.
pub struct Mutex<T, R> {
    raw: R,
    cell: UnsafeCell<T>,
}

// Safety: the raw lock serializes all access to `cell`.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
        }
    }

    /// Mutable access through `&mut self`; no locking needed.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

impl<T, R: RawLock> Mutex<T, R> {
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.lock();
        MutexGuard { m: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        if self.raw.try_lock() {
            Some(MutexGuard { m: self })
        } else {
            None
        }
    }

    /// Run `f` with the lock held.
    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut guard = self.lock();
        f(&mut guard)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl<T: Default, R: Default> Default for Mutex<T, R> {
    fn default() -> Self {
        Self::from_raw(R::default(), T::default())
    }
}

impl<T: fmt::Debug, R: RawLock> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard; the lock is released on drop.
pub struct MutexGuard<'a, T, R: RawLock> {
    m: &'a Mutex<T, R>,
}

impl<T, R: RawLock> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves the lock is held.
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, R: RawLock> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves the lock is held, and `&mut self` makes the
        // borrow unique.
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, R: RawLock> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        // Safety: a guard only exists while the lock is held.
        unsafe { self.m.raw.unlock() }
    }
}
