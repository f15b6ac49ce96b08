use super::{BlockId, File};
use crate::block::{BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

/// A fixed-length file held in kernel memory.
///
/// Handles created by [`File::reopen`] share contents, and count towards
/// [`RamFile::open_handles`]. A file created with [`RamFile::on_disk`]
/// pretends to occupy consecutive sectors starting at `first_sector`, so
/// its pages carry block ids.
pub struct RamFile {
    inner: Arc<Inner>,
}

struct Inner {
    data: Mutex<Vec<u8>>,
    first_sector: Option<BlockSector>,
    handles: AtomicUsize,
}

impl RamFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_inner(data, None)
    }

    pub fn on_disk(data: Vec<u8>, first_sector: BlockSector) -> Self {
        Self::with_inner(data, Some(first_sector))
    }

    fn with_inner(data: Vec<u8>, first_sector: Option<BlockSector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(data),
                first_sector,
                handles: AtomicUsize::new(1),
            }),
        }
    }

    /// A copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }

    pub fn open_handles(&self) -> usize {
        self.inner.handles.load(Ordering::Relaxed)
    }
}

impl Drop for RamFile {
    fn drop(&mut self) {
        self.inner.handles.fetch_sub(1, Ordering::Relaxed);
    }
}

impl File for RamFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.inner.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        len
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.inner.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let len = buf.len().min(data.len() - start);
        data[start..start + len].copy_from_slice(&buf[..len]);
        len
    }

    fn length(&self) -> u64 {
        self.inner.data.lock().len() as u64
    }

    fn reopen(&self) -> Arc<dyn File> {
        self.inner.handles.fetch_add(1, Ordering::Relaxed);
        Arc::new(RamFile {
            inner: Arc::clone(&self.inner),
        })
    }

    fn block_id(&self, offset: u64) -> Option<BlockId> {
        let first = self.inner.first_sector?;
        let sector = u32::try_from(offset / BLOCK_SECTOR_SIZE as u64).ok()?;
        Some(BlockId(first.checked_add(sector)?))
    }
}
