pub mod mem_addr_types;

pub use mem_addr_types::{PhysAddr, VirtAddr};

use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// Largest region below OFFSET the user stack may grow into.
pub const USER_STACK_MAX: usize = 8 * MB;

// PUSHA touches 32 bytes below the stack pointer before moving it.
pub const USER_STACK_SLACK: usize = 32;
