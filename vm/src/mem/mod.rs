//! Demand paging for user address spaces.
//!
//! [`VirtualMemory`] ties together the global [`FrameTable`], the swap store,
//! and the per-process state in [`AddressSpace`]. Pages are described up front
//! (segments at exec time, file mappings at `mmap` time, stack pages on the
//! first fault) and only get a frame when touched.

pub mod address_space;
mod fault;
pub mod frame_pool;
pub mod frame_table;
pub mod mmap;
pub mod page;
pub mod page_replacement;
pub mod pagedir;
pub mod supplemental;
mod user;

#[cfg(test)]
mod tests;

pub use address_space::{AddressSpace, AddressSpaceId};
pub use frame_pool::{AllocFlags, CoreMapPool, FramePool};
pub use frame_table::{Frame, FrameStats, FrameTable};
pub use mmap::MapId;
pub use page::{PageInfo, PageKind, ShareKey};
pub use pagedir::{PageDirectory, SoftPageDirectory};

use crate::block::BlockError;
use crate::config::VmConfig;
use crate::fs::Fd;
use crate::swapping::SwapSpace;
use alloc::sync::Arc;
use core::fmt;
use kidneyos_shared::mem::VirtAddr;
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Access to an address with no page that is not stack growth.
    InvalidAccess(VirtAddr),
    /// Access not allowed by the page, such as a write to a read-only page.
    ProtectionViolation(VirtAddr),
    /// A page already exists at this address.
    AlreadyMapped(VirtAddr),
    NullAddress,
    Misaligned(VirtAddr),
    /// Standard input and output cannot be mapped.
    ReservedDescriptor(Fd),
    EmptyFile,
    /// The request extends past the end of user memory.
    OutOfRange,
    NoSuchMapping(MapId),
    /// A file page could not be read in full.
    ShortRead { expected: usize, actual: usize },
    Io(BlockError),
    /// Every frame is pinned, so nothing can be evicted.
    OutOfFrames,
}

impl VmError {
    /// Whether the error leaves the kernel unable to continue, as opposed to
    /// being the current process's fault.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::OutOfFrames | VmError::Io(_))
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAccess(addr) => write!(f, "invalid access to {addr}"),
            Self::ProtectionViolation(addr) => write!(f, "protection violation at {addr}"),
            Self::AlreadyMapped(addr) => write!(f, "page {addr} is already mapped"),
            Self::NullAddress => write!(f, "null address"),
            Self::Misaligned(addr) => write!(f, "address {addr} is not page aligned"),
            Self::ReservedDescriptor(fd) => write!(f, "file descriptor {fd} cannot be mapped"),
            Self::EmptyFile => write!(f, "cannot map an empty file"),
            Self::OutOfRange => write!(f, "range extends past user memory"),
            Self::NoSuchMapping(id) => write!(f, "no mapping with id {id}"),
            Self::ShortRead { expected, actual } => {
                write!(f, "short read: expected {expected} bytes, got {actual}")
            }
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::OutOfFrames => write!(f, "out of frames: every frame is pinned"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        VmError::Io(err)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;

pub struct VirtualMemory {
    frames: FrameTable,
    swap: Arc<SwapSpace>,
    config: VmConfig,
}

impl VirtualMemory {
    pub fn new(pool: Arc<dyn FramePool>, swap: SwapSpace, config: VmConfig) -> Self {
        let swap = Arc::new(swap);
        info!(
            "virtual memory: {} frames, {} swap slots",
            pool.capacity(),
            swap.capacity()
        );
        Self {
            frames: FrameTable::new(pool, Arc::clone(&swap)),
            swap,
            config,
        }
    }

    pub fn frame_table(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn stats(&self) -> FrameStats {
        self.frames.stats()
    }
}
