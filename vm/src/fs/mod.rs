//! The slice of the file abstraction the VM subsystem depends on.

mod ram_file;

pub use ram_file::RamFile;

use crate::block::BlockSector;
use alloc::sync::Arc;

/// A file descriptor number, as seen by user programs.
pub type Fd = i32;

pub const STDIN_FILENO: Fd = 0;
pub const STDOUT_FILENO: Fd = 1;

/// Identifies where a byte of file content lives on disk.
///
/// Two file pages with the same `BlockId` at their first byte hold the same
/// data, which is what read-only frame sharing keys on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub BlockSector);

/// An open file.
///
/// Offsets are absolute, so callers never depend on a shared cursor.
pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number of bytes read,
    /// which is short only at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Writes up to `buf.len()` bytes starting at `offset`. Returns the number of bytes
    /// written, which may be short if the file cannot grow.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    /// Length of the file in bytes.
    fn length(&self) -> u64;

    /// Opens an independent handle to the same file.
    fn reopen(&self) -> Arc<dyn File>;

    /// The disk location backing `offset`, if the file lives on a block device.
    fn block_id(&self, _offset: u64) -> Option<BlockId> {
        None
    }
}
