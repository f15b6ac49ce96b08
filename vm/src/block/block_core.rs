use super::block_error::BlockError;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = kidneyos_shared::sizes::SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Lower-level interface to block device drivers.
///
/// Buffers passed to `read` and `write` are exactly one sector long.
pub trait BlockOp: Send {
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
    /// The size of the device in sectors
    fn size(&self) -> BlockSector;
}

/// Verifies that `sector` and `buf` describe a valid transfer on a device of `size` sectors.
pub fn check_transfer(
    size: BlockSector,
    sector: BlockSector,
    buf: &[u8],
) -> Result<(), BlockError> {
    if sector >= size {
        return Err(BlockError::SectorOutOfBounds);
    }
    if buf.len() != BLOCK_SECTOR_SIZE {
        return Err(BlockError::BufferInvalid);
    }
    Ok(())
}
