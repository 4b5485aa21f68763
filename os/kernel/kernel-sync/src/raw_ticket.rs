use crate::RawLock;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// FIFO ticket lock.
///
/// Waiters are served in arrival order, so a thread scanning several arenas
/// cannot be starved by a tight alloc/free loop on another core.
pub struct RawTicket {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
}

impl Default for RawTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
        }
    }
}

// Safety: tickets are unique, and only the holder of `now_serving` proceeds
// until `unlock` advances it with `Release`.
unsafe impl RawLock for RawTicket {
    #[inline]
    fn lock(&self) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        let serving = self.now_serving.load(Ordering::Relaxed);
        self.next_ticket
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.now_serving.fetch_add(1, Ordering::Release);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }
}
