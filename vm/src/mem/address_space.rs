//! Per-process state: the page directory, the supplemental page table and
//! the mapped-file registry.

use super::mmap::MappedFileRegistry;
use super::page::{FileBacking, Page, PageInfo, PageSource};
use super::pagedir::PageDirectory;
use super::supplemental::SupplementalPageTable;
use super::{Result, VirtualMemory, VmError};
use crate::fs::File;
use crate::sync::{Mutex, MutexGuard};
use alloc::{boxed::Box, sync::Arc};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kidneyos_shared::mem::{VirtAddr, PAGE_FRAME_SIZE};
use log::debug;

static NEXT_ADDRESS_SPACE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    fn next() -> Self {
        Self(NEXT_ADDRESS_SPACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// A user address space.
///
/// Lock order within one address space is `pages` then `pagedir`.
/// `mappings` is never held while taking another lock.
pub struct AddressSpace {
    id: AddressSpaceId,
    pagedir: Mutex<Box<dyn PageDirectory>>,
    pages: Mutex<SupplementalPageTable>,
    mappings: Mutex<MappedFileRegistry>,
}

impl AddressSpace {
    pub fn new(pagedir: Box<dyn PageDirectory>) -> Arc<Self> {
        Arc::new(Self {
            id: AddressSpaceId::next(),
            pagedir: Mutex::new(pagedir),
            pages: Mutex::new(SupplementalPageTable::new()),
            mappings: Mutex::new(MappedFileRegistry::new()),
        })
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// The page directory, for the MMU glue to report accessed and dirty bits.
    pub fn pagedir(&self) -> MutexGuard<'_, Box<dyn PageDirectory>> {
        self.pagedir.lock()
    }

    pub(crate) fn pages(&self) -> MutexGuard<'_, SupplementalPageTable> {
        self.pages.lock()
    }

    pub(crate) fn mappings(&self) -> MutexGuard<'_, MappedFileRegistry> {
        self.mappings.lock()
    }

    pub fn page_info(&self, upage: VirtAddr) -> Option<PageInfo> {
        self.pages.lock().find(upage).map(Page::info)
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.lock().iter().filter(|page| page.is_loaded()).count()
    }

    fn check_upage(upage: VirtAddr) -> Result<()> {
        if !upage.is_page_aligned() {
            return Err(VmError::Misaligned(upage));
        }
        if !upage.is_user() {
            return Err(VmError::InvalidAccess(upage));
        }
        Ok(())
    }

    fn create_page(&self, upage: VirtAddr, source: PageSource, writable: bool) -> Result<()> {
        Self::check_upage(upage)?;
        self.pages
            .lock()
            .create(Page::new(self.id, upage, source, writable))?;
        Ok(())
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace").field("id", &self.id).finish()
    }
}

impl VirtualMemory {
    /// Creates an empty address space on top of `pagedir`.
    pub fn new_address_space(&self, pagedir: Box<dyn PageDirectory>) -> Arc<AddressSpace> {
        let space = AddressSpace::new(pagedir);
        debug!("created address space {}", space.id());
        space
    }

    /// Registers a lazily loaded page of an executable segment: `read_bytes`
    /// from `file` at `offset`, then `zero_bytes` of zeroes.
    #[allow(clippy::too_many_arguments)]
    pub fn create_segment_page(
        &self,
        space: &AddressSpace,
        upage: VirtAddr,
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        assert_eq!(read_bytes + zero_bytes, PAGE_FRAME_SIZE);
        let backing = FileBacking::new(file, offset, read_bytes, false);
        space.create_page(upage, PageSource::File(backing), writable)
    }

    /// Registers a page that reads as zeroes until first written.
    pub fn create_zero_page(
        &self,
        space: &AddressSpace,
        upage: VirtAddr,
        writable: bool,
    ) -> Result<()> {
        space.create_page(upage, PageSource::Zero, writable)
    }

    /// Registers the pages of one loadable segment, starting at `upage`.
    ///
    /// `read_bytes + zero_bytes` must be a whole number of pages. Pages with
    /// nothing to read become zero pages.
    #[allow(clippy::too_many_arguments)]
    pub fn load_segment(
        &self,
        space: &AddressSpace,
        file: &Arc<dyn File>,
        mut offset: u64,
        mut upage: VirtAddr,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        assert_eq!((read_bytes + zero_bytes) % PAGE_FRAME_SIZE, 0);
        AddressSpace::check_upage(upage)?;

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
            let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

            if page_read_bytes == 0 {
                self.create_zero_page(space, upage, writable)?;
            } else {
                self.create_segment_page(
                    space,
                    upage,
                    Arc::clone(file),
                    offset,
                    page_read_bytes,
                    page_zero_bytes,
                    writable,
                )?;
            }

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            offset += page_read_bytes as u64;
            upage = upage
                .checked_add(PAGE_FRAME_SIZE)
                .ok_or(VmError::OutOfRange)?;
        }

        Ok(())
    }

    /// Frees one page: its frame if resident (contents discarded), its swap
    /// slot, and its descriptor. Returns `false` if `upage` had no page.
    pub fn free_page(&self, space: &Arc<AddressSpace>, upage: VirtAddr) -> bool {
        self.frames
            .unload_resident(space, upage, super::frame_table::UnloadMode::Discard);
        space.pages.lock().destroy(upage, &self.swap)
    }

    /// Tears down everything `space` owns: every memory mapping (writing back
    /// dirty pages), then every remaining page.
    ///
    /// Called on process exit, before the page directory is destroyed.
    pub fn free_all_pages_for(&self, space: &Arc<AddressSpace>) {
        let ids = space.mappings.lock().ids();
        for id in ids {
            // The registry was just read, so the mapping exists unless another
            // thread unmapped it concurrently, which is fine.
            let _ = self.munmap(space, id);
        }

        let addrs = space.pages.lock().addrs();
        for upage in addrs {
            self.free_page(space, upage);
        }

        debug_assert!(space.pages.lock().is_empty());
        debug!("freed all pages of {}", space.id());
    }
}
