//! Page descriptors: how each user page is (re)materialized.

use super::address_space::AddressSpaceId;
use crate::fs::{BlockId, File};
use crate::swapping::SwapSlot;
use alloc::sync::Arc;
use core::fmt;
use kidneyos_shared::mem::{PhysAddr, VirtAddr, PAGE_FRAME_SIZE};

/// File contents backing a page.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn File>,
    pub offset: u64,
    /// Bytes read from `offset`. The rest of the page is zeroed.
    pub read_bytes: usize,
    pub zero_bytes: usize,
    /// Disk location of the first byte, used to share read-only frames.
    pub block_id: Option<BlockId>,
    /// Dirty contents go back to the file on unload (memory-mapped files),
    /// rather than to swap (executable segments).
    pub write_back: bool,
}

impl FileBacking {
    pub fn new(file: Arc<dyn File>, offset: u64, read_bytes: usize, write_back: bool) -> Self {
        assert!(
            read_bytes <= PAGE_FRAME_SIZE,
            "{read_bytes} bytes do not fit in one page"
        );
        let block_id = file.block_id(offset);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - read_bytes,
            block_id,
            write_back,
        }
    }
}

/// What a read-only file frame holds: the disk block its first byte comes
/// from and how many bytes come from the file. Two pages with equal keys
/// have identical contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShareKey {
    pub block: BlockId,
    pub read_bytes: usize,
}

impl ShareKey {
    pub const fn new(block: BlockId, read_bytes: usize) -> Self {
        Self { block, read_bytes }
    }
}

/// Where a non-resident page's contents come from.
#[derive(Clone)]
pub enum PageSource {
    File(FileBacking),
    Zero,
    /// The slot is `None` while the page is resident: it is freed on load and
    /// a fresh one is allocated on the next eviction.
    Swap(Option<SwapSlot>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    File,
    Zero,
    Swap,
}

impl PageSource {
    pub fn kind(&self) -> PageKind {
        match self {
            PageSource::File(_) => PageKind::File,
            PageSource::Zero => PageKind::Zero,
            PageSource::Swap(_) => PageKind::Swap,
        }
    }
}

pub struct Page {
    addr: VirtAddr,
    owner: AddressSpaceId,
    pub(super) source: PageSource,
    writable: bool,
    pub(super) loaded: bool,
    /// The frame holding this page while `loaded`.
    pub(super) frame: Option<PhysAddr>,
}

impl Page {
    pub fn new(owner: AddressSpaceId, addr: VirtAddr, source: PageSource, writable: bool) -> Self {
        assert!(addr.is_page_aligned(), "page address {addr} is not aligned");
        if let PageSource::File(backing) = &source {
            assert_eq!(backing.read_bytes + backing.zero_bytes, PAGE_FRAME_SIZE);
        }
        Self {
            addr,
            owner,
            source,
            writable,
            loaded: false,
            frame: None,
        }
    }

    pub fn addr(&self) -> VirtAddr {
        self.addr
    }

    pub fn owner(&self) -> AddressSpaceId {
        self.owner
    }

    pub fn source(&self) -> &PageSource {
        &self.source
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn frame(&self) -> Option<PhysAddr> {
        self.frame
    }

    /// The key under which this page may share a frame, if it is a read-only
    /// file page on disk.
    pub fn share_key(&self) -> Option<ShareKey> {
        match &self.source {
            PageSource::File(backing) if !self.writable => backing
                .block_id
                .map(|block| ShareKey::new(block, backing.read_bytes)),
            _ => None,
        }
    }

    pub(super) fn swap_slot(&self) -> Option<SwapSlot> {
        match self.source {
            PageSource::Swap(slot) => slot,
            _ => None,
        }
    }

    pub fn info(&self) -> PageInfo {
        PageInfo {
            addr: self.addr,
            kind: self.source.kind(),
            writable: self.writable,
            loaded: self.loaded,
            frame: self.frame,
            swap_slot: self.swap_slot(),
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("addr", &self.addr)
            .field("owner", &self.owner)
            .field("kind", &self.source.kind())
            .field("writable", &self.writable)
            .field("loaded", &self.loaded)
            .field("frame", &self.frame)
            .finish()
    }
}

/// A snapshot of a page descriptor's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub addr: VirtAddr,
    pub kind: PageKind,
    pub writable: bool,
    pub loaded: bool,
    pub frame: Option<PhysAddr>,
    pub swap_slot: Option<SwapSlot>,
}
