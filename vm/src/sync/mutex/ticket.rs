//! FIFO ticket lock.
//!
//! Each locker draws a ticket and spins until the counter being served
//! reaches it, so waiters get the lock in arrival order. A fault handler
//! queued on the eviction lock cannot be starved by a busy neighbour.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

pub struct TicketMutex<T: ?Sized> {
    /// Next ticket to hand out.
    next_ticket: AtomicU32,
    /// Ticket currently allowed in.
    serving: AtomicU32,
    data: UnsafeCell<T>,
}

/// Access to the data behind a [`TicketMutex`]. Dropping it admits the next
/// ticket holder.
pub struct TicketMutexGuard<'a, T: ?Sized> {
    lock: &'a TicketMutex<T>,
}

unsafe impl<T: ?Sized + Send> Sync for TicketMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for TicketMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for TicketMutexGuard<'_, T> {}

impl<T> TicketMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            serving: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> TicketMutex<T> {
    pub fn lock(&self) -> TicketMutexGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        TicketMutexGuard { lock: self }
    }

    /// Takes the lock only if nobody holds it or is queued for it.
    pub fn try_lock(&self) -> Option<TicketMutexGuard<'_, T>> {
        let serving = self.serving.load(Ordering::Acquire);
        self.next_ticket
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| TicketMutexGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.queued() > 0
    }

    /// Holder plus waiters.
    pub fn queued(&self) -> u32 {
        let next = self.next_ticket.load(Ordering::Relaxed);
        next.wrapping_sub(self.serving.load(Ordering::Relaxed))
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for TicketMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized> Deref for TicketMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while its ticket is being served.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TicketMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` makes this the only reference.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for TicketMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.serving.fetch_add(1, Ordering::Release);
    }
}
