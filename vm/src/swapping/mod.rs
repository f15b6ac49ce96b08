//! The swap store: a block device carved into page-sized slots.
//!
//! Slot `i` occupies sectors `i * SECTORS_IN_PAGE .. (i + 1) * SECTORS_IN_PAGE`.
//! Slot 0 is reserved for the [`SwapHeader`], so valid slot indices start at 1.

mod swap_header;

pub use swap_header::{SwapHeader, SWAP_MAGIC, SWAP_VERSION};

use crate::block::{BlockError, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::boxed::Box;
use core::fmt::{self, Display, Formatter};
use kidneyos_shared::bit_array::BitArray;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{info, trace};
use zerocopy::AsBytes;

pub const SECTORS_IN_PAGE: u32 = (PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE) as u32;

/// Index of a page-sized slot on the swap device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub fn index(self) -> u32 {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        self.0 * SECTORS_IN_PAGE
    }
}

impl Display for SwapSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "swap slot {}", self.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SwapError {
    /// The device cannot hold the header slot plus at least one data slot.
    DeviceTooSmall,
    /// Sector 0 does not contain a valid swap header.
    BadHeader,
    /// The header claims more slots than the device holds.
    SlotCountMismatch { header: u32, device: u32 },
    Io(BlockError),
}

impl Display for SwapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SwapError::DeviceTooSmall => write!(f, "swap device too small"),
            SwapError::BadHeader => write!(f, "not a swap device (bad header)"),
            SwapError::SlotCountMismatch { header, device } => write!(
                f,
                "swap header claims {header} slots but the device holds {device}"
            ),
            SwapError::Io(err) => write!(f, "swap device I/O error: {err}"),
        }
    }
}

impl core::error::Error for SwapError {}

impl From<BlockError> for SwapError {
    fn from(err: BlockError) -> Self {
        SwapError::Io(err)
    }
}

pub struct SwapSpace {
    device: Mutex<Box<dyn BlockOp>>,
    /// One bit per slot, set while the slot holds a page. Bit 0 is always set.
    slots: Mutex<BitArray>,
}

impl SwapSpace {
    /// Writes a fresh header to `device` and returns an empty swap space on it.
    pub fn format(mut device: Box<dyn BlockOp>) -> Result<Self, SwapError> {
        let slot_count = device.size() / SECTORS_IN_PAGE;
        if slot_count < 2 {
            return Err(SwapError::DeviceTooSmall);
        }

        device.write(0, SwapHeader::new(slot_count).as_bytes())?;
        info!("formatted swap device with {} slots", slot_count - 1);

        Ok(Self::with_slots(device, slot_count))
    }

    /// Opens a device previously prepared with [`SwapSpace::format`].
    ///
    /// Swapped pages do not survive a reboot, so every data slot starts free.
    pub fn open(mut device: Box<dyn BlockOp>) -> Result<Self, SwapError> {
        let mut sector = [0u8; BLOCK_SECTOR_SIZE];
        device.read(0, &mut sector)?;
        let header = SwapHeader::parse(&sector).ok_or(SwapError::BadHeader)?;

        let device_slots = device.size() / SECTORS_IN_PAGE;
        let slot_count = header.slot_count();
        if slot_count > device_slots {
            return Err(SwapError::SlotCountMismatch {
                header: slot_count,
                device: device_slots,
            });
        }
        if slot_count < 2 {
            return Err(SwapError::DeviceTooSmall);
        }

        Ok(Self::with_slots(device, slot_count))
    }

    fn with_slots(device: Box<dyn BlockOp>, slot_count: u32) -> Self {
        let mut slots = BitArray::new(slot_count as usize);
        slots.set(0, true);
        Self {
            device: Mutex::new(device),
            slots: Mutex::new(slots),
        }
    }

    /// Number of slots that can hold pages.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len() - 1
    }

    /// Number of slots currently holding pages.
    pub fn used(&self) -> usize {
        self.slots.lock().count_ones() - 1
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        let slots = self.slots.lock();
        (slot.0 as usize) < slots.len() && slot.0 != 0 && slots.get(slot.0 as usize)
    }

    /// Reserves a free slot, or returns `None` if the device is full.
    pub fn allocate(&self) -> Option<SwapSlot> {
        let idx = self.slots.lock().scan_and_flip(1)?;
        let slot = SwapSlot(u32::try_from(idx).ok()?);
        trace!("allocated {slot}");
        Some(slot)
    }

    /// Returns `slot` to the free pool.
    ///
    /// Panics if the slot is not allocated, since a double free would let two
    /// pages share one slot.
    pub fn free(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        let idx = slot.0 as usize;
        assert!(
            slot.0 != 0 && idx < slots.len() && slots.get(idx),
            "freeing {slot}, which is not allocated"
        );
        slots.set(idx, false);
        trace!("freed {slot}");
    }

    /// Writes one page from `page` into `slot`.
    pub fn write(&self, slot: SwapSlot, page: &[u8]) -> Result<(), BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        debug_assert!(self.is_allocated(slot), "writing to free {slot}");

        let mut device = self.device.lock();
        for (i, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            device.write(slot.first_sector() + i as u32, sector)?;
        }
        Ok(())
    }

    /// Reads the page stored in `slot` into `page`.
    pub fn read(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        debug_assert!(self.is_allocated(slot), "reading from free {slot}");

        let mut device = self.device.lock();
        for (i, sector) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            device.read(slot.first_sector() + i as u32, sector)?;
        }
        Ok(())
    }
}
