use core::error::Error;
use core::fmt::{Display, Formatter};

/// Error type for block operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
    /// The sector is out of bounds (greater than the block size)
    SectorOutOfBounds,
    /// The buffer has an invalid size (not `BLOCK_SECTOR_SIZE`)
    BufferInvalid,
    /// Error reading from the disk
    ReadError,
    /// Error writing to the disk
    WriteError,
}

impl Display for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            BlockError::SectorOutOfBounds => "sector out of bounds (greater than the block size)",
            BlockError::BufferInvalid => "invalid buffer size (not `BLOCK_SECTOR_SIZE`)",
            BlockError::ReadError => "error reading from the block device",
            BlockError::WriteError => "error writing to the block device",
        })
    }
}

impl Error for BlockError {}
