//! The supplemental page table: one per address space, keyed by user page.

use super::page::Page;
use super::{Result, VmError};
use crate::swapping::SwapSpace;
use alloc::vec::Vec;
use hashbrown::HashMap;
use kidneyos_shared::mem::VirtAddr;

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: HashMap<VirtAddr, Page>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor. Fails if one already exists at the same address.
    pub fn create(&mut self, page: Page) -> Result<&mut Page> {
        let addr = page.addr();
        match self.pages.entry(addr) {
            hashbrown::hash_map::Entry::Occupied(_) => Err(VmError::AlreadyMapped(addr)),
            hashbrown::hash_map::Entry::Vacant(slot) => Ok(slot.insert(page)),
        }
    }

    pub fn find(&self, upage: VirtAddr) -> Option<&Page> {
        self.pages.get(&upage)
    }

    pub fn find_mut(&mut self, upage: VirtAddr) -> Option<&mut Page> {
        self.pages.get_mut(&upage)
    }

    pub fn contains(&self, upage: VirtAddr) -> bool {
        self.pages.contains_key(&upage)
    }

    /// Removes the descriptor at `upage`, releasing its swap slot if the page
    /// lives in swap. Returns `false` if there was no descriptor.
    ///
    /// The page must already be evicted from its frame.
    pub fn destroy(&mut self, upage: VirtAddr, swap: &SwapSpace) -> bool {
        let Some(page) = self.pages.remove(&upage) else {
            return false;
        };
        assert!(!page.is_loaded(), "destroying resident {page:?}");
        if let Some(slot) = page.swap_slot() {
            swap.free(slot);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Addresses of every page, in no particular order.
    pub fn addrs(&self) -> Vec<VirtAddr> {
        self.pages.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }
}
