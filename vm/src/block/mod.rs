pub mod block_core;
pub mod block_error;
pub mod ram_disk;

pub use block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
pub use block_error::BlockError;
pub use ram_disk::RamDisk;
