use super::block_core::{check_transfer, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use super::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// A block device backed by kernel memory.
///
/// Used as the swap device when no disk driver is attached, and by tests.
/// Keeps read and write counts like a real driver would.
pub struct RamDisk {
    data: Vec<u8>,
    sectors: BlockSector,
    read_count: u32,
    write_count: u32,
    failing: bool,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
            sectors,
            read_count: 0,
            write_count: 0,
            failing: false,
        }
    }

    /// A disk whose every transfer fails with an I/O error.
    pub fn failing(sectors: BlockSector) -> Self {
        Self {
            failing: true,
            ..Self::new(sectors)
        }
    }

    pub fn read_count(&self) -> u32 {
        self.read_count
    }

    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    fn sector_range(sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        check_transfer(self.sectors, sector, buf)?;
        if self.failing {
            return Err(BlockError::ReadError);
        }
        buf.copy_from_slice(&self.data[Self::sector_range(sector)]);
        self.read_count += 1;
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        check_transfer(self.sectors, sector, buf)?;
        if self.failing {
            return Err(BlockError::WriteError);
        }
        self.data[Self::sector_range(sector)].copy_from_slice(buf);
        self.write_count += 1;
        Ok(())
    }

    fn size(&self) -> BlockSector {
        self.sectors
    }
}
