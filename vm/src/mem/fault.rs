//! Page faults and demand loading.

use super::address_space::AddressSpace;
use super::frame_pool::AllocFlags;
use super::frame_table::Frame;
use super::page::{Page, PageKind, PageSource, ShareKey};
use super::{Result, VirtualMemory, VmError};
use crate::fs::File;
use crate::swapping::SwapSlot;
use alloc::sync::Arc;
use kidneyos_shared::mem::{VirtAddr, OFFSET};
use log::{debug, trace};

/// What a non-resident page needs to be brought in, copied out of its
/// descriptor so no lock is held during I/O.
enum LoadPlan {
    File {
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: usize,
        share_key: Option<ShareKey>,
    },
    Zero,
    Swap(SwapSlot),
}

impl VirtualMemory {
    /// Whether a fault at `addr` with stack pointer `esp` is the stack growing.
    pub fn is_stack_access(&self, addr: VirtAddr, esp: VirtAddr) -> bool {
        let lowest_stack = OFFSET.saturating_sub(self.config.max_stack_size);
        addr.as_usize() >= esp.as_usize().saturating_sub(self.config.stack_slack)
            && addr.as_usize() >= lowest_stack
            && addr.is_user()
    }

    /// Resolves a page fault at `addr` in `space`.
    ///
    /// A fault on a missing page is either stack growth, which gets a fresh
    /// zero page, or an invalid access. A fault on a resident page is a
    /// protection violation (a write to a read-only page).
    pub fn handle_fault(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        esp: VirtAddr,
    ) -> Result<()> {
        if addr.is_null() || !addr.is_user() {
            return Err(VmError::InvalidAccess(addr));
        }
        let upage = addr.page_round_down();
        debug!("page fault at {addr:?} in {} (esp {esp:?})", space.id());

        let loaded = space.pages().find(upage).map(|page| page.is_loaded());
        match loaded {
            Some(true) => return Err(VmError::ProtectionViolation(addr)),
            Some(false) => {}
            None if self.is_stack_access(addr, esp) => {
                debug!("growing stack of {} to {upage:?}", space.id());
                self.create_zero_page(space, upage, true)?;
            }
            None => return Err(VmError::InvalidAccess(addr)),
        }

        self.load_page(space, upage, false)
    }

    /// Brings `upage` into a frame and maps it. With `keep_pinned` the frame
    /// stays pinned, and the caller must [`FrameTable::unpin`] it.
    ///
    /// [`FrameTable::unpin`]: super::frame_table::FrameTable::unpin
    pub fn load_page(
        &self,
        space: &Arc<AddressSpace>,
        upage: VirtAddr,
        keep_pinned: bool,
    ) -> Result<()> {
        let frame = self.load_page_pinned(space, upage)?;
        if !keep_pinned {
            self.frames.unpin_frame(&frame);
        }
        Ok(())
    }

    /// Makes `upage` resident and returns its frame, pinned.
    pub(crate) fn load_page_pinned(
        &self,
        space: &Arc<AddressSpace>,
        upage: VirtAddr,
    ) -> Result<Arc<Frame>> {
        loop {
            let plan = {
                let spt = space.pages();
                let page = spt.find(upage).ok_or(VmError::InvalidAccess(upage))?;
                if page.is_loaded() {
                    if let Some(frame) = page.frame().and_then(|addr| self.frames.get(addr)) {
                        if frame.pin() {
                            return Ok(frame);
                        }
                    }
                    drop(spt);
                    // Being evicted, after which the page is loaded afresh, or pinned
                    // by too many loaders at once.
                    core::hint::spin_loop();
                    continue;
                }
                self.plan_load(page)
            };

            if let Some(frame) = self.try_load(space, upage, plan)? {
                return Ok(frame);
            }
        }
    }

    fn plan_load(&self, page: &Page) -> LoadPlan {
        match page.source() {
            PageSource::File(backing) => LoadPlan::File {
                file: Arc::clone(&backing.file),
                offset: backing.offset,
                read_bytes: backing.read_bytes,
                share_key: page.share_key().filter(|_| self.config.share_read_only),
            },
            PageSource::Zero => LoadPlan::Zero,
            PageSource::Swap(Some(slot)) => LoadPlan::Swap(*slot),
            PageSource::Swap(None) => {
                panic!("{:?} is not resident but has no swap slot", page.addr())
            }
        }
    }

    /// One attempt at loading. Returns `None` if the page changed under us and
    /// the caller should look again.
    fn try_load(
        &self,
        space: &Arc<AddressSpace>,
        upage: VirtAddr,
        plan: LoadPlan,
    ) -> Result<Option<Arc<Frame>>> {
        let share_key = match &plan {
            LoadPlan::File { share_key, .. } => *share_key,
            _ => None,
        };
        let shared = share_key.and_then(|key| self.frames.lookup_shared(key));
        let fresh = shared.is_none();

        let frame = match shared {
            Some(frame) => frame,
            None => {
                let frame = self.frames.acquire(AllocFlags::USER)?;
                if let Err(err) = self.populate(&frame, &plan) {
                    self.frames.unpin_frame(&frame);
                    return Err(err);
                }
                frame
            }
        };

        // A shared frame whose last page left after we pinned it has lost its
        // key, so it is set again here.
        self.frames.attach(&frame, space, upage, share_key);

        let mut spt = space.pages();
        let unchanged = spt
            .find(upage)
            .is_some_and(|page| !page.loaded && Self::plan_matches(&plan, &page.source));
        if !unchanged {
            drop(spt);
            trace!("{upage:?} changed while loading, retrying");
            self.frames.abandon(&frame, space, upage);
            return Ok(None);
        }
        let page = spt
            .find_mut(upage)
            .ok_or(VmError::InvalidAccess(upage))?;

        if let LoadPlan::Swap(slot) = plan {
            self.swap.free(slot);
            page.source = PageSource::Swap(None);
        }
        page.loaded = true;
        page.frame = Some(frame.addr());

        let mut pagedir = space.pagedir();
        if !pagedir.map(upage, frame.addr(), page.is_writable()) {
            panic!("failed to map {upage:?} to {:?}", frame.addr());
        }
        pagedir.set_dirty(upage, false);
        pagedir.set_accessed(upage, true);

        debug!(
            "loaded {}:{upage:?} ({:?}) into {:?}{}",
            space.id(),
            page.source.kind(),
            frame.addr(),
            if fresh { "" } else { " (shared)" }
        );
        Ok(Some(frame))
    }

    fn plan_matches(plan: &LoadPlan, source: &PageSource) -> bool {
        match (plan, source) {
            (LoadPlan::Swap(slot), PageSource::Swap(current)) => *current == Some(*slot),
            (LoadPlan::Swap(_), _) => false,
            (_, source) => source.kind() != PageKind::Swap,
        }
    }

    /// Fills a freshly acquired frame from the plan's source.
    fn populate(&self, frame: &Frame, plan: &LoadPlan) -> Result<()> {
        // SAFETY: the frame was just acquired. It is pinned and has no pages, so no one
        // else can reach its contents.
        unsafe {
            self.frames.with_frame_bytes(frame.addr(), |bytes| match plan {
                LoadPlan::File {
                    file,
                    offset,
                    read_bytes,
                    ..
                } => {
                    let actual = file.read_at(&mut bytes[..*read_bytes], *offset);
                    if actual != *read_bytes {
                        return Err(VmError::ShortRead {
                            expected: *read_bytes,
                            actual,
                        });
                    }
                    bytes[*read_bytes..].fill(0);
                    Ok(())
                }
                LoadPlan::Zero => {
                    bytes.fill(0);
                    Ok(())
                }
                LoadPlan::Swap(slot) => self.swap.read(*slot, bytes).map_err(VmError::Io),
            })
        }
    }
}
