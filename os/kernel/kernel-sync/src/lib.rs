//! # Kernel synchronization primitives
//!
//! Busy-waiting locks for code that must never sleep while holding them: the
//! frame allocator's per-arena free lists, per-address-space region lists and
//! page-table walks, and the ASID pool.
//!
//! | Type | Policy |
//! |------|--------|
//! | [`SpinMutex<T>`] | Test-and-test-and-set spinning; cheapest when uncontended. |
//! | [`TicketMutex<T>`] | FIFO ticket order; bounded waiting under contention. |
//! | [`SyncOnceCell<T>`] | Write-once publication of boot-time state. |
//!
//! Both mutexes are the same [`Mutex<T, R>`] over a different [`RawLock`].
//!
//! ```rust
//! # use kernel_sync::TicketMutex;
//! let free = TicketMutex::new(16_usize);
//! *free.lock() -= 4;
//! assert_eq!(free.with_lock(|n| *n), 12);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;
mod raw_ticket;
mod sync_once_cell;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use sync_once_cell::SyncOnceCell;

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

/// A raw mutual-exclusion primitive without associated data.
///
/// # Safety
/// Between a successful [`lock`](Self::lock) / [`try_lock`](Self::try_lock)
/// and the matching [`unlock`](Self::unlock) no other caller may acquire the
/// lock, and acquisition must synchronize-with the previous release.
pub unsafe trait RawLock {
    fn lock(&self);

    fn try_lock(&self) -> bool;

    /// # Safety
    /// The caller must hold the lock.
    unsafe fn unlock(&self);

    /// Racy snapshot, for diagnostics and assertions only.
    fn is_locked(&self) -> bool;
}
