//! The hardware page-table adapter.

use alloc::collections::BTreeMap;
use kidneyos_shared::mem::{PhysAddr, VirtAddr};
use kidneyos_shared::paging::PageTableEntry;

/// Installs and inspects user mappings in one address space's page directory.
///
/// All addresses are page-aligned user virtual pages.
pub trait PageDirectory: Send {
    /// Maps `upage` to `frame`. Returns `false` if the mapping could not be
    /// installed (for example, a page table could not be allocated).
    fn map(&mut self, upage: VirtAddr, frame: PhysAddr, writable: bool) -> bool;

    /// Removes the mapping for `upage`, if any. Later accesses fault.
    fn clear(&mut self, upage: VirtAddr);

    /// The frame `upage` is mapped to, if it is present.
    fn translate(&self, upage: VirtAddr) -> Option<PhysAddr>;

    fn is_accessed(&self, upage: VirtAddr) -> bool;
    fn set_accessed(&mut self, upage: VirtAddr, accessed: bool);

    fn is_dirty(&self, upage: VirtAddr) -> bool;
    fn set_dirty(&mut self, upage: VirtAddr, dirty: bool);
}

/// A page directory kept in ordinary memory.
///
/// Entries use the x86 layout, so the accessed and dirty bits behave like the
/// ones the MMU maintains. Nothing sets them on its own: whoever stands in for
/// the MMU calls `set_accessed`/`set_dirty`.
#[derive(Default)]
pub struct SoftPageDirectory {
    entries: BTreeMap<VirtAddr, PageTableEntry>,
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of present mappings.
    pub fn mapped(&self) -> usize {
        self.entries.len()
    }

    pub fn is_writable(&self, upage: VirtAddr) -> bool {
        self.entries
            .get(&upage)
            .is_some_and(|entry| entry.read_write())
    }

    fn update(&mut self, upage: VirtAddr, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(entry) = self.entries.get_mut(&upage) {
            *entry = f(*entry);
        }
    }
}

impl PageDirectory for SoftPageDirectory {
    fn map(&mut self, upage: VirtAddr, frame: PhysAddr, writable: bool) -> bool {
        debug_assert!(upage.is_page_aligned() && upage.is_user());
        match PageTableEntry::user_mapping(frame, writable) {
            Some(entry) => {
                self.entries.insert(upage, entry);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self, upage: VirtAddr) {
        self.entries.remove(&upage);
    }

    fn translate(&self, upage: VirtAddr) -> Option<PhysAddr> {
        self.entries.get(&upage).map(PageTableEntry::frame)
    }

    fn is_accessed(&self, upage: VirtAddr) -> bool {
        self.entries.get(&upage).is_some_and(|entry| entry.accessed())
    }

    fn set_accessed(&mut self, upage: VirtAddr, accessed: bool) {
        self.update(upage, |entry| entry.with_accessed(accessed));
    }

    fn is_dirty(&self, upage: VirtAddr) -> bool {
        self.entries.get(&upage).is_some_and(|entry| entry.dirty())
    }

    fn set_dirty(&mut self, upage: VirtAddr, dirty: bool) {
        self.update(upage, |entry| entry.with_dirty(dirty));
    }
}
