//! The global frame table: every physical frame holding user data, the pages
//! resident in it, and its pin state.
//!
//! Locks, in the order they may be taken:
//!
//! 1. the eviction lock (`policy`), so one eviction runs at a time
//! 2. a frame's page list
//! 3. an address space's supplemental page table
//! 4. that address space's page directory
//!
//! The frame map lock is a leaf. Pin counts are atomic and can be changed
//! under any lock.

use super::address_space::{AddressSpace, AddressSpaceId};
use super::frame_pool::{AllocFlags, FramePool};
use super::page::{Page, PageSource, ShareKey};
use super::page_replacement::{Clock, PageReplacementPolicy};
use super::{Result, VmError};
use crate::swapping::SwapSpace;
use crate::sync::{Mutex, MutexGuard};
use alloc::collections::BTreeMap;
use alloc::{boxed::Box, sync::Arc, sync::Weak, vec::Vec};
use arbitrary_int::{u7, Number};
use bitbybit::bitfield;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use hashbrown::HashMap;
use kidneyos_shared::mem::{PhysAddr, VirtAddr, PAGE_FRAME_SIZE};
use log::{debug, error, trace, warn};

#[bitfield(u8, default = 0)]
pub struct FrameFlags {
    /// Set by whoever has claimed the frame for eviction or freeing. A claimed
    /// frame cannot be pinned.
    #[bit(0, rw)]
    evicting: bool,
    #[bits(1..=7, rw)]
    pin_count: u7,
}

/// A non-owning reference from a frame to a page resident in it.
pub struct PageRef {
    space: Weak<AddressSpace>,
    space_id: AddressSpaceId,
    upage: VirtAddr,
}

impl PageRef {
    pub fn space_id(&self) -> AddressSpaceId {
        self.space_id
    }

    pub fn upage(&self) -> VirtAddr {
        self.upage
    }
}

#[derive(Default)]
struct FramePages {
    pages: Vec<PageRef>,
    /// The read-only file contents held, if the frame can be shared.
    fingerprint: Option<ShareKey>,
}

pub struct Frame {
    addr: PhysAddr,
    /// Position on the clock. Later frames have larger numbers.
    seq: u64,
    flags: AtomicU8,
    pages: Mutex<FramePages>,
}

impl Frame {
    fn new(addr: PhysAddr, seq: u64) -> Self {
        let flags = FrameFlags::DEFAULT.with_pin_count(u7::new(1));
        Self {
            addr,
            seq,
            flags: AtomicU8::new(flags.raw_value()),
            pages: Mutex::new(FramePages::default()),
        }
    }

    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn flags(&self) -> FrameFlags {
        FrameFlags::new_with_raw_value(self.flags.load(Ordering::Acquire))
    }

    fn update_flags(&self, mut f: impl FnMut(FrameFlags) -> Option<FrameFlags>) -> bool {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                f(FrameFlags::new_with_raw_value(raw)).map(|flags| flags.raw_value())
            })
            .is_ok()
    }

    pub fn pin_count(&self) -> u8 {
        self.flags().pin_count().value()
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn is_evicting(&self) -> bool {
        self.flags().evicting()
    }

    /// Pins the frame. Fails if it has been claimed for eviction, in which case
    /// the caller must wait for the eviction to finish and look again, or if
    /// the pin count is saturated.
    pub(crate) fn pin(&self) -> bool {
        self.update_flags(|flags| {
            let count = flags.pin_count().value();
            (!flags.evicting() && count < u7::MAX.value())
                .then(|| flags.with_pin_count(u7::new(count + 1)))
        })
    }

    /// Drops a pin. Callers outside this module go through
    /// [`FrameTable::unpin_frame`], which also frees a frame left unused.
    fn unpin(&self) {
        let unpinned = self.update_flags(|flags| {
            let count = flags.pin_count().value();
            (count > 0).then(|| flags.with_pin_count(u7::new(count - 1)))
        });
        assert!(unpinned, "unpinning {:?}, which is not pinned", self.addr);
    }

    /// Claims an unpinned frame for eviction.
    pub(crate) fn try_claim(&self) -> bool {
        self.update_flags(|flags| {
            (!flags.evicting() && flags.pin_count().value() == 0)
                .then(|| flags.with_evicting(true))
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().pages.len()
    }

    /// The pages resident here, as (address space, user page) pairs.
    pub fn resident_pages(&self) -> Vec<(AddressSpaceId, VirtAddr)> {
        self.pages
            .lock()
            .pages
            .iter()
            .map(|page| (page.space_id, page.upage))
            .collect()
    }

    /// Clears the accessed bit of every page resident here. Returns whether any
    /// of them was set, which spares the frame for another turn of the clock.
    pub(crate) fn take_second_chance(&self) -> bool {
        let pages = self.pages.lock();
        let mut accessed = false;
        for page in &pages.pages {
            let Some(space) = page.space.upgrade() else {
                continue;
            };
            let mut pagedir = space.pagedir();
            if pagedir.translate(page.upage) == Some(self.addr) && pagedir.is_accessed(page.upage)
            {
                pagedir.set_accessed(page.upage, false);
                accessed = true;
            }
        }
        accessed
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let flags = self.flags();
        f.debug_struct("Frame")
            .field("addr", &self.addr)
            .field("seq", &self.seq)
            .field("pins", &flags.pin_count().value())
            .field("evicting", &flags.evicting())
            .finish()
    }
}

/// What happens to a page's contents when it leaves its frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnloadMode {
    /// Write dirty data to its file or to swap so it can be loaded again.
    Preserve,
    /// Drop the contents; the page is about to be destroyed.
    Discard,
}

#[derive(Default)]
struct FrameMap {
    by_addr: HashMap<PhysAddr, Arc<Frame>>,
    /// Frames in clock order.
    ring: BTreeMap<u64, Arc<Frame>>,
    next_seq: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames taken from the pool.
    pub acquired: usize,
    pub evictions: usize,
    /// Loads satisfied by sharing an existing read-only frame.
    pub shared_hits: usize,
    /// Frames currently tracked.
    pub resident: usize,
}

pub struct FrameTable {
    pool: Arc<dyn FramePool>,
    swap: Arc<SwapSpace>,
    frames: Mutex<FrameMap>,
    /// Also serves as the eviction lock.
    policy: Mutex<Box<dyn PageReplacementPolicy>>,
    acquired: AtomicUsize,
    evictions: AtomicUsize,
    shared_hits: AtomicUsize,
}

impl FrameTable {
    pub fn new(pool: Arc<dyn FramePool>, swap: Arc<SwapSpace>) -> Self {
        Self::with_policy(pool, swap, Box::new(Clock::new()))
    }

    pub fn with_policy(
        pool: Arc<dyn FramePool>,
        swap: Arc<SwapSpace>,
        policy: Box<dyn PageReplacementPolicy>,
    ) -> Self {
        Self {
            pool,
            swap,
            frames: Mutex::new(FrameMap::default()),
            policy: Mutex::new(policy),
            acquired: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            shared_hits: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<dyn FramePool> {
        &self.pool
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            resident: self.len(),
        }
    }

    /// Number of tracked frames.
    pub fn len(&self) -> usize {
        self.frames.lock().by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, addr: PhysAddr) -> Option<Arc<Frame>> {
        self.frames.lock().by_addr.get(&addr).cloned()
    }

    /// The first frame at or after clock position `seq`, wrapping around.
    pub(crate) fn frame_at_or_after(&self, seq: u64) -> Option<Arc<Frame>> {
        let frames = self.frames.lock();
        frames
            .ring
            .range(seq..)
            .next()
            .or_else(|| frames.ring.iter().next())
            .map(|(_, frame)| Arc::clone(frame))
    }

    fn is_tracked(&self, frame: &Arc<Frame>) -> bool {
        self.frames
            .lock()
            .by_addr
            .get(&frame.addr)
            .is_some_and(|tracked| Arc::ptr_eq(tracked, frame))
    }

    fn track(&self, addr: PhysAddr) -> Arc<Frame> {
        let mut frames = self.frames.lock();
        let frame = Arc::new(Frame::new(addr, frames.next_seq));
        frames.next_seq += 1;
        frames.ring.insert(frame.seq, Arc::clone(&frame));
        let previous = frames.by_addr.insert(addr, Arc::clone(&frame));
        assert!(previous.is_none(), "pool handed out tracked frame {addr:?}");
        frame
    }

    /// Stops tracking `frame` and returns it to the pool.
    fn free(&self, frame: &Arc<Frame>) {
        {
            let mut frames = self.frames.lock();
            let tracked = frames
                .by_addr
                .get(&frame.addr)
                .is_some_and(|tracked| Arc::ptr_eq(tracked, frame));
            assert!(tracked, "frame table lookup miss for {frame:?}");
            frames.by_addr.remove(&frame.addr);
            frames.ring.remove(&frame.seq);
        }
        self.pool.free(frame.addr);
        trace!("freed {frame:?}");
    }

    /// Gets a frame for user data, evicting a page if the pool is empty.
    ///
    /// The frame comes back pinned and with no pages attached.
    pub fn acquire(&self, flags: AllocFlags) -> Result<Arc<Frame>> {
        loop {
            if let Some(addr) = self.pool.alloc(flags.with_user(true)) {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                let frame = self.track(addr);
                trace!("acquired {frame:?}");
                return Ok(frame);
            }
            self.evict_one()?;
        }
    }

    /// Runs the replacement policy once and evicts the victim.
    pub fn evict_one(&self) -> Result<()> {
        let mut policy = self.policy.lock();
        let Some(victim) = policy.evict_page(self) else {
            error!("no evictable frame among {} frames", self.len());
            return Err(VmError::OutOfFrames);
        };
        debug!("evicting {victim:?}");
        self.release_claimed(&victim);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records that `upage` of `space` now lives in `frame`. `fingerprint`
    /// makes the frame available to [`FrameTable::lookup_shared`].
    pub fn attach(
        &self,
        frame: &Arc<Frame>,
        space: &Arc<AddressSpace>,
        upage: VirtAddr,
        fingerprint: Option<ShareKey>,
    ) {
        let mut pages = frame.pages.lock();
        debug_assert!(!pages
            .pages
            .iter()
            .any(|page| page.space_id == space.id() && page.upage == upage));
        if pages.pages.is_empty() {
            pages.fingerprint = fingerprint;
        }
        pages.pages.push(PageRef {
            space: Arc::downgrade(space),
            space_id: space.id(),
            upage,
        });
        trace!("attached {}:{upage:?} to {frame:?}", space.id());
    }

    /// Finds a resident frame holding the read-only file contents `key`, and
    /// pins it. A miss only costs a fresh load.
    pub fn lookup_shared(&self, key: ShareKey) -> Option<Arc<Frame>> {
        let candidates: Vec<Arc<Frame>> =
            self.frames.lock().by_addr.values().cloned().collect();
        for frame in candidates {
            let pages = frame.pages.lock();
            if pages.fingerprint == Some(key) && !pages.pages.is_empty() && frame.pin() {
                drop(pages);
                self.shared_hits.fetch_add(1, Ordering::Relaxed);
                trace!("sharing {frame:?} for {key:?}");
                return Some(frame);
            }
        }
        None
    }

    /// Takes pages out of `frame`.
    ///
    /// With an owner, only that address space's page leaves and its dirty data
    /// is written back. An owner with no page here is a no-op.
    ///
    /// Without an owner every page is unloaded.
    ///
    /// Either way the frame goes back to the pool once it holds no pages, as
    /// soon as nobody has it pinned.
    pub fn release(&self, frame: &Arc<Frame>, owner: Option<&Arc<AddressSpace>>) {
        let mut pages = frame.pages.lock();
        match owner {
            Some(space) => {
                if let Some(pos) = pages
                    .pages
                    .iter()
                    .position(|page| page.space_id == space.id())
                {
                    self.detach_at(frame, pages, pos, space, UnloadMode::Preserve);
                }
            }
            None => {
                for page in core::mem::take(&mut pages.pages) {
                    if let Some(space) = page.space.upgrade() {
                        self.unload(frame, &space, page.upage, UnloadMode::Preserve);
                    }
                }
                self.free_if_unused(frame, pages);
            }
        }
    }

    /// Unloads every page of a frame claimed by the caller, then frees it.
    fn release_claimed(&self, frame: &Arc<Frame>) {
        debug_assert!(frame.is_evicting());
        let mut pages = frame.pages.lock();
        assert!(self.is_tracked(frame), "frame table lookup miss for {frame:?}");
        for page in core::mem::take(&mut pages.pages) {
            if let Some(space) = page.space.upgrade() {
                self.unload(frame, &space, page.upage, UnloadMode::Preserve);
            }
        }
        pages.fingerprint = None;
        drop(pages);
        self.free(frame);
    }

    /// Takes `upage` of `space` out of its frame, if it is resident.
    pub(crate) fn unload_resident(
        &self,
        space: &Arc<AddressSpace>,
        upage: VirtAddr,
        mode: UnloadMode,
    ) {
        loop {
            let frame = {
                // Frames are unloaded before they are freed, so while the page table says
                // the page is resident its frame must be tracked.
                let spt = space.pages();
                let Some(addr) = spt.find(upage).and_then(Page::frame) else {
                    return;
                };
                match self.get(addr) {
                    Some(frame) => frame,
                    None => panic!("{}:{upage:?} is resident in untracked {addr:?}", space.id()),
                }
            };

            let pages = frame.pages.lock();
            let Some(pos) = pages
                .pages
                .iter()
                .position(|page| page.space_id == space.id() && page.upage == upage)
            else {
                // Evicted between the lookup and the lock. Look again.
                drop(pages);
                core::hint::spin_loop();
                continue;
            };
            self.detach_at(&frame, pages, pos, space, mode);
            return;
        }
    }

    /// Unloads the page at `pos` in `frame`'s page list, whose lock the caller
    /// hands over, and frees the frame if that left it unused.
    fn detach_at(
        &self,
        frame: &Arc<Frame>,
        mut pages: MutexGuard<'_, FramePages>,
        pos: usize,
        space: &AddressSpace,
        mode: UnloadMode,
    ) {
        let page = pages.pages.remove(pos);
        self.unload(frame, space, page.upage, mode);
        self.free_if_unused(frame, pages);
    }

    /// Frees `frame` if no page is left in it and nobody has it pinned. A
    /// pinned frame is freed by its last [`FrameTable::unpin_frame`], a
    /// claimed one by whoever claimed it.
    fn free_if_unused(&self, frame: &Arc<Frame>, mut pages: MutexGuard<'_, FramePages>) {
        if !pages.pages.is_empty() {
            return;
        }
        pages.fingerprint = None;
        if frame.try_claim() {
            drop(pages);
            self.free(frame);
        }
    }

    /// Drops one pin on `frame`, returning it to the pool if it was the last
    /// thing keeping an empty frame alive.
    pub(crate) fn unpin_frame(&self, frame: &Arc<Frame>) {
        let pages = frame.pages.lock();
        frame.unpin();
        self.free_if_unused(frame, pages);
    }

    /// Moves one page out of `frame`, preserving or dropping its contents.
    /// The caller holds `frame`'s page list.
    fn unload(&self, frame: &Frame, space: &AddressSpace, upage: VirtAddr, mode: UnloadMode) {
        let mut spt = space.pages();
        let Some(page) = spt.find_mut(upage) else {
            return;
        };
        if !page.loaded || page.frame != Some(frame.addr) {
            return;
        }

        let dirty = space.pagedir().is_dirty(upage);
        if mode == UnloadMode::Preserve {
            self.preserve(frame, page, dirty);
        }

        space.pagedir().clear(upage);
        page.loaded = false;
        page.frame = None;
        trace!("unloaded {}:{upage:?} from {frame:?} ({mode:?})", space.id());
    }

    /// Saves the contents of a resident page so it can be loaded again.
    fn preserve(&self, frame: &Frame, page: &mut Page, dirty: bool) {
        let to_swap = match &page.source {
            PageSource::File(backing) if backing.write_back => {
                if dirty {
                    // SAFETY: the caller holds the frame's page list with this page on it, so
                    // the frame stays allocated, and nobody else writes to it meanwhile.
                    let written = unsafe {
                        self.with_frame_bytes(frame.addr, |bytes| {
                            backing.file.write_at(&bytes[..backing.read_bytes], backing.offset)
                        })
                    };
                    if written != backing.read_bytes {
                        warn!(
                            "short write-back of {:?}: {written} of {} bytes",
                            page.addr(),
                            backing.read_bytes
                        );
                    }
                }
                false
            }
            PageSource::File(_) => dirty,
            PageSource::Zero => page.is_writable(),
            PageSource::Swap(_) => true,
        };

        if to_swap {
            let Some(slot) = self.swap.allocate() else {
                error!("swap space exhausted while evicting {:?}", page.addr());
                panic!("out of swap space");
            };
            // SAFETY: as above.
            let result =
                unsafe { self.with_frame_bytes(frame.addr, |bytes| self.swap.write(slot, bytes)) };
            if let Err(err) = result {
                error!("swap write to {slot} failed: {err}");
                panic!("swap write failed: {err}");
            }
            page.source = PageSource::Swap(Some(slot));
            trace!("{:?} swapped out to {slot}", page.addr());
        }
    }

    /// Pins the frame at `addr`. Returns `false` if it is not tracked or is
    /// being evicted.
    pub fn pin(&self, addr: PhysAddr) -> bool {
        self.get(addr).is_some_and(|frame| frame.pin())
    }

    pub fn unpin(&self, addr: PhysAddr) {
        match self.get(addr) {
            Some(frame) => self.unpin_frame(&frame),
            None => panic!("unpinning untracked {addr:?}"),
        }
    }

    /// The page of `space` resident in `frame`, if any.
    pub fn find_owning_page(&self, frame: &Frame, space: &AddressSpace) -> Option<VirtAddr> {
        frame
            .pages
            .lock()
            .pages
            .iter()
            .find(|page| page.space_id == space.id())
            .map(PageRef::upage)
    }

    /// Gives `f` the contents of the frame at `addr`.
    ///
    /// # Safety
    ///
    /// The frame must stay allocated for the duration of the call (the caller
    /// pins it, claims it, or holds its page list with a page on it), and no one
    /// else may access its bytes meanwhile.
    pub(crate) unsafe fn with_frame_bytes<R>(
        &self,
        addr: PhysAddr,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let ptr = self.pool.frame_ptr(addr);
        let bytes = core::slice::from_raw_parts_mut(ptr.as_ptr(), PAGE_FRAME_SIZE);
        f(bytes)
    }

    /// Backs out of a load into `frame` whose page changed before it was
    /// committed: takes `upage` of `space` off the frame and drops the
    /// loader's pin.
    pub(crate) fn abandon(&self, frame: &Arc<Frame>, space: &AddressSpace, upage: VirtAddr) {
        let mut pages = frame.pages.lock();
        pages
            .pages
            .retain(|page| !(page.space_id == space.id() && page.upage == upage));
        frame.unpin();
        self.free_if_unused(frame, pages);
    }
}
