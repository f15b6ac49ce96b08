//! On-disk layout of the swap device.
//!
//! Slot 0 is reserved. Its first sector holds a [`SwapHeader`] so a kernel can
//! tell a formatted swap partition from a random disk, and recover the slot
//! count without trusting the device size.

use crate::block::BLOCK_SECTOR_SIZE;
// These are little-endian unaligned integer types
use zerocopy::little_endian::U32;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const SWAP_MAGIC: [u8; 8] = *b"KIDNSWAP";
pub const SWAP_VERSION: u32 = 1;

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct SwapHeader {
    magic: [u8; 8],
    version: U32,
    /// Number of slots on the device, including the reserved slot 0.
    slot_count: U32,
    _reserved: [u8; BLOCK_SECTOR_SIZE - 16],
}

impl SwapHeader {
    pub fn new(slot_count: u32) -> Self {
        let mut header = Self::new_zeroed();
        header.magic = SWAP_MAGIC;
        header.version = U32::new(SWAP_VERSION);
        header.slot_count = U32::new(slot_count);
        header
    }

    /// Parses a header sector, returning `None` if it was not written by [`SwapHeader::new`].
    pub fn parse(sector: &[u8]) -> Option<Self> {
        let header = Self::read_from(sector)?;
        (header.magic == SWAP_MAGIC && header.version.get() == SWAP_VERSION).then_some(header)
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count.get()
    }
}
