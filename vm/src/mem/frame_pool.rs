//! The physical page allocator the frame table draws from.
//!
//! The kernel proper hands us its own allocator through [`FramePool`].
//! [`CoreMapPool`] is a self-contained pool over preallocated page-aligned
//! memory, tracked with a core map the way the boot-time frame allocator is.

mod placement_algorithms;

pub use placement_algorithms::{FirstFit, NextFit, PlacementAlgorithm};

use crate::sync::Mutex;
use alloc::{boxed::Box, vec::Vec};
use bitbybit::bitfield;
use core::{cell::UnsafeCell, ptr::NonNull};
use kidneyos_shared::mem::{PhysAddr, PAGE_FRAME_SIZE};
use log::trace;

#[bitfield(u8, default = 0)]
pub struct AllocFlags {
    /// The frame will be mapped into a user address space.
    #[bit(0, rw)]
    user: bool,
    /// Zero the frame before returning it.
    #[bit(1, rw)]
    zero: bool,
}

impl AllocFlags {
    pub const USER: Self = Self::DEFAULT.with_user(true);
}

/// Allocates and frees single physical page frames.
pub trait FramePool: Send + Sync {
    /// Returns a free frame, or `None` if the pool is exhausted.
    fn alloc(&self, flags: AllocFlags) -> Option<PhysAddr>;

    /// Returns `frame` to the pool.
    fn free(&self, frame: PhysAddr);

    /// Kernel-visible pointer to the first byte of `frame`.
    fn frame_ptr(&self, frame: PhysAddr) -> NonNull<u8>;

    /// Total number of frames the pool manages.
    fn capacity(&self) -> usize;

    /// Number of frames currently handed out.
    fn in_use(&self) -> usize;
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    user: bool,
}

#[repr(C, align(4096))]
struct FrameBuf(UnsafeCell<[u8; PAGE_FRAME_SIZE]>);

// SAFETY: the pool never reads or writes frame contents except while zeroing a frame it
// has just reserved. Everyone else goes through `frame_ptr`, whose users coordinate with
// the frame table's pin and claim protocol.
unsafe impl Sync for FrameBuf {}

struct CoreMap<P> {
    entries: Box<[CoreMapEntry]>,
    placement: P,
    allocated: usize,
}

/// A pool of `capacity` frames at physical addresses `base`, `base + PAGE_FRAME_SIZE`, ...
pub struct CoreMapPool<P: PlacementAlgorithm = NextFit> {
    base: PhysAddr,
    frames: Box<[FrameBuf]>,
    core_map: Mutex<CoreMap<P>>,
}

impl<P: PlacementAlgorithm> CoreMapPool<P> {
    /// Physical address the first frame is reported at, just above the first megabyte.
    pub const DEFAULT_BASE: PhysAddr = PhysAddr::new(0x0010_0000);

    pub fn new(capacity: usize) -> Self {
        Self::with_base(Self::DEFAULT_BASE, capacity)
    }

    pub fn with_base(base: PhysAddr, capacity: usize) -> Self {
        assert!(base.is_page_aligned(), "pool base {base} is not page aligned");

        let frames: Vec<FrameBuf> = (0..capacity)
            .map(|_| FrameBuf(UnsafeCell::new([0; PAGE_FRAME_SIZE])))
            .collect();

        Self {
            base,
            frames: frames.into_boxed_slice(),
            core_map: Mutex::new(CoreMap {
                entries: alloc::vec![CoreMapEntry::DEFAULT; capacity].into_boxed_slice(),
                placement: P::default(),
                allocated: 0,
            }),
        }
    }

    fn index_of(&self, frame: PhysAddr) -> usize {
        assert!(
            frame >= self.base && frame.is_page_aligned(),
            "{frame:?} does not belong to this pool"
        );
        let index = (frame - self.base) / PAGE_FRAME_SIZE;
        assert!(index < self.frames.len(), "{frame:?} does not belong to this pool");
        index
    }
}

impl<P: PlacementAlgorithm> FramePool for CoreMapPool<P> {
    fn alloc(&self, flags: AllocFlags) -> Option<PhysAddr> {
        let index = {
            let mut core_map = self.core_map.lock();
            let CoreMap {
                entries,
                placement,
                allocated,
            } = &mut *core_map;

            let range = placement.place(entries, 1)?;
            let entry = &mut entries[range.start];
            assert!(!entry.allocated());
            *entry = entry.with_allocated(true).with_user(flags.user());
            *allocated += 1;
            range.start
        };

        let frame = self.base + index * PAGE_FRAME_SIZE;
        if flags.zero() {
            // SAFETY: the core map entry was just reserved for us, so nobody else touches it.
            unsafe { self.frame_ptr(frame).as_ptr().write_bytes(0, PAGE_FRAME_SIZE) };
        }

        trace!("pool: allocated {frame:?}");
        Some(frame)
    }

    fn free(&self, frame: PhysAddr) {
        let index = self.index_of(frame);
        let mut core_map = self.core_map.lock();
        let entry = &mut core_map.entries[index];
        assert!(entry.allocated(), "double free of {frame:?}");
        *entry = CoreMapEntry::DEFAULT;
        core_map.allocated -= 1;
        trace!("pool: freed {frame:?}");
    }

    fn frame_ptr(&self, frame: PhysAddr) -> NonNull<u8> {
        let index = self.index_of(frame);
        NonNull::from(&self.frames[index]).cast()
    }

    fn capacity(&self) -> usize {
        self.frames.len()
    }

    fn in_use(&self) -> usize {
        self.core_map.lock().allocated
    }
}
