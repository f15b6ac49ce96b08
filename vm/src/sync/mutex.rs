#[cfg_attr(feature = "ticket_mutex", allow(dead_code))]
mod spin;
#[cfg_attr(not(feature = "ticket_mutex"), allow(dead_code))]
mod ticket;

use core::{
    fmt,
    ops::{Deref, DerefMut},
};

#[cfg(feature = "ticket_mutex")]
type InnerMutex<T> = ticket::TicketMutex<T>;
#[cfg(feature = "ticket_mutex")]
type InnerMutexGuard<'a, T> = ticket::TicketMutexGuard<'a, T>;

#[cfg(not(feature = "ticket_mutex"))]
type InnerMutex<T> = spin::SpinMutex<T>;
#[cfg(not(feature = "ticket_mutex"))]
type InnerMutexGuard<'a, T> = spin::SpinMutexGuard<'a, T>;

/// A lock that provides mutually exclusive data access.
///
/// Every lock in the VM subsystem goes through this type, so the locking
/// strategy can be swapped with the `ticket_mutex` feature.
pub struct Mutex<T: ?Sized> {
    inner: InnerMutex<T>,
}

/// A guard that provides mutable data access.
pub struct MutexGuard<'a, T: 'a + ?Sized> {
    inner: InnerMutexGuard<'a, T>,
}

impl<T> Mutex<T> {
    #[inline(always)]
    pub const fn new(value: T) -> Self {
        Self {
            inner: InnerMutex::new(value),
        }
    }

    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    #[inline(always)]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            inner: self.inner.lock(),
        }
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    #[inline(always)]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner
            .try_lock()
            .map(|guard| MutexGuard { inner: guard })
    }

    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.write_str("Mutex { <locked> }"),
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
