//! Memory-mapped files.

use super::address_space::AddressSpace;
use super::frame_table::UnloadMode;
use super::page::{FileBacking, Page, PageSource};
use super::{Result, VirtualMemory, VmError};
use crate::fs::{Fd, File, STDIN_FILENO, STDOUT_FILENO};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use kidneyos_shared::mem::{VirtAddr, OFFSET, PAGE_FRAME_SIZE};
use log::debug;

/// Identifies a mapping within one process. Ids start at 0 and are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u32);

impl MapId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct MappedFile {
    id: MapId,
    fd: Fd,
    file: Arc<dyn File>,
    start: VirtAddr,
    /// One past the last mapped page.
    end: VirtAddr,
}

impl MappedFile {
    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn file(&self) -> &Arc<dyn File> {
        &self.file
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn end(&self) -> VirtAddr {
        self.end
    }

    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> {
        (self.start.as_usize()..self.end.as_usize())
            .step_by(PAGE_FRAME_SIZE)
            .map(VirtAddr::new)
    }
}

/// The live mappings of one process.
#[derive(Default)]
pub struct MappedFileRegistry {
    next_id: u32,
    mappings: BTreeMap<MapId, MappedFile>,
}

impl MappedFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, fd: Fd, file: Arc<dyn File>, start: VirtAddr, end: VirtAddr) -> MapId {
        let id = MapId(self.next_id);
        self.next_id += 1;
        self.mappings.insert(
            id,
            MappedFile {
                id,
                fd,
                file,
                start,
                end,
            },
        );
        id
    }

    fn remove(&mut self, id: MapId) -> Option<MappedFile> {
        self.mappings.remove(&id)
    }

    pub fn get(&self, id: MapId) -> Option<&MappedFile> {
        self.mappings.get(&id)
    }

    pub fn ids(&self) -> Vec<MapId> {
        self.mappings.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl VirtualMemory {
    /// Maps all of `file`, open as `fd`, at `addr` in `space`.
    ///
    /// Pages are loaded on demand and dirty pages are written back to the file
    /// when evicted or unmapped. The mapping holds its own handle to the file,
    /// so it outlives `fd`.
    pub fn mmap(
        &self,
        space: &AddressSpace,
        fd: Fd,
        file: &Arc<dyn File>,
        addr: VirtAddr,
    ) -> Result<MapId> {
        if fd == STDIN_FILENO || fd == STDOUT_FILENO {
            return Err(VmError::ReservedDescriptor(fd));
        }
        if addr.is_null() {
            return Err(VmError::NullAddress);
        }
        if !addr.is_page_aligned() {
            return Err(VmError::Misaligned(addr));
        }

        let length = file.length();
        if length == 0 {
            return Err(VmError::EmptyFile);
        }
        let length = usize::try_from(length).map_err(|_| VmError::OutOfRange)?;
        let end = addr
            .checked_add(length)
            .map(VirtAddr::page_round_up)
            .filter(|end| end.as_usize() <= OFFSET)
            .ok_or(VmError::OutOfRange)?;

        let file = file.reopen();
        {
            let mut spt = space.pages();
            let pages = (addr.as_usize()..end.as_usize())
                .step_by(PAGE_FRAME_SIZE)
                .map(VirtAddr::new);

            // Check the whole range first so a failed call leaves nothing behind.
            if let Some(taken) = pages.clone().find(|&upage| spt.contains(upage)) {
                return Err(VmError::AlreadyMapped(taken));
            }

            for upage in pages {
                let offset = upage - addr;
                let read_bytes = (length - offset).min(PAGE_FRAME_SIZE);
                let backing = FileBacking::new(Arc::clone(&file), offset as u64, read_bytes, true);
                spt.create(Page::new(space.id(), upage, PageSource::File(backing), true))?;
            }
        }

        let id = space.mappings().insert(fd, file, addr, end);
        debug!("{}: mapped fd {fd} at {addr:?}..{end:?} as {id}", space.id());
        Ok(id)
    }

    /// Removes mapping `id`, writing dirty pages back to the file.
    pub fn munmap(&self, space: &Arc<AddressSpace>, id: MapId) -> Result<()> {
        let mapping = space
            .mappings()
            .remove(id)
            .ok_or(VmError::NoSuchMapping(id))?;

        for upage in mapping.pages() {
            self.frames
                .unload_resident(space, upage, UnloadMode::Preserve);
            space.pages().destroy(upage, &self.swap);
        }

        debug!("{}: unmapped {id}", space.id());
        Ok(())
    }
}
