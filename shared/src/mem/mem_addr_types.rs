//! Strongly typed addresses, so user virtual pages and physical frames cannot be mixed up.

use super::{OFFSET, PAGE_FRAME_SIZE};
use core::fmt;
use core::ops::{Add, Sub};

/// A virtual address in some address space.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

/// A physical address, as handed out by the physical frame pool.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

macro_rules! impl_addr {
    ($($name:ident),*) => {
        $(
        impl $name {
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            pub const fn as_usize(self) -> usize {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            pub const fn page_round_down(self) -> Self {
                Self(self.0 & !(PAGE_FRAME_SIZE - 1))
            }

            /// Rounds up to the next page boundary, saturating at the top of the address space.
            pub const fn page_round_up(self) -> Self {
                match self.0.checked_add(PAGE_FRAME_SIZE - 1) {
                    Some(addr) => Self(addr & !(PAGE_FRAME_SIZE - 1)),
                    None => Self(usize::MAX & !(PAGE_FRAME_SIZE - 1)),
                }
            }

            pub const fn page_offset(self) -> usize {
                self.0 & (PAGE_FRAME_SIZE - 1)
            }

            pub const fn is_page_aligned(self) -> bool {
                self.page_offset() == 0
            }

            pub const fn page_number(self) -> usize {
                self.0 / PAGE_FRAME_SIZE
            }

            pub const fn checked_add(self, rhs: usize) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(addr) => Some(Self(addr)),
                    None => None,
                }
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, rhs: usize) -> Self {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            fn sub(self, rhs: $name) -> usize {
                self.0 - rhs.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
        )*
    };
}

impl_addr!(VirtAddr, PhysAddr);

impl VirtAddr {
    /// Whether this address lies in the user portion of the address space.
    pub const fn is_user(self) -> bool {
        self.0 < OFFSET
    }
}
