//! Copying between kernel buffers and user memory on behalf of system calls.
//!
//! Each user page is faulted in if needed and pinned only while it is being
//! copied, so a system call holds at most one pinned frame at a time.

use super::address_space::AddressSpace;
use super::frame_table::Frame;
use super::{Result, VirtualMemory, VmError};
use alloc::sync::Arc;
use kidneyos_shared::mem::{VirtAddr, PAGE_FRAME_SIZE};

impl VirtualMemory {
    /// Copies `buf.len()` bytes of user memory at `uaddr` into `buf`.
    pub fn read_through(
        &self,
        space: &Arc<AddressSpace>,
        esp: VirtAddr,
        uaddr: VirtAddr,
        buf: &mut [u8],
    ) -> Result<()> {
        self.for_each_user_chunk(space, esp, uaddr, buf.len(), false, |done, user| {
            buf[done..done + user.len()].copy_from_slice(user);
        })
    }

    /// Copies `data` into user memory at `uaddr`, marking the pages dirty.
    pub fn write_through(
        &self,
        space: &Arc<AddressSpace>,
        esp: VirtAddr,
        uaddr: VirtAddr,
        data: &[u8],
    ) -> Result<()> {
        self.for_each_user_chunk(space, esp, uaddr, data.len(), true, |done, user| {
            let len = user.len();
            user.copy_from_slice(&data[done..done + len]);
        })
    }

    /// Calls `copy(bytes_done_so_far, user_bytes)` for each page-bounded piece
    /// of `len` bytes at `uaddr`, with that page's frame pinned.
    fn for_each_user_chunk(
        &self,
        space: &Arc<AddressSpace>,
        esp: VirtAddr,
        uaddr: VirtAddr,
        len: usize,
        write: bool,
        mut copy: impl FnMut(usize, &mut [u8]),
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let last = uaddr
            .checked_add(len - 1)
            .filter(|last| last.is_user())
            .ok_or(VmError::InvalidAccess(uaddr))?;
        if uaddr.is_null() {
            return Err(VmError::InvalidAccess(uaddr));
        }

        let mut done = 0;
        while done < len {
            let addr = uaddr + done;
            let upage = addr.page_round_down();
            let chunk = (PAGE_FRAME_SIZE - addr.page_offset()).min(len - done);
            debug_assert!(addr + (chunk - 1) <= last);

            let frame = self.pin_user_page(space, esp, addr, write)?;
            // SAFETY: the frame is pinned, so it cannot be evicted or freed during the copy.
            unsafe {
                self.frames.with_frame_bytes(frame.addr(), |bytes| {
                    let start = addr.page_offset();
                    copy(done, &mut bytes[start..start + chunk]);
                });
            }
            {
                let mut pagedir = space.pagedir();
                pagedir.set_accessed(upage, true);
                if write {
                    pagedir.set_dirty(upage, true);
                }
            }
            self.frames.unpin_frame(&frame);

            done += chunk;
        }

        Ok(())
    }

    /// Makes the page containing `addr` resident and pins its frame, faulting it
    /// in (or growing the stack) the way a user access would.
    fn pin_user_page(
        &self,
        space: &Arc<AddressSpace>,
        esp: VirtAddr,
        addr: VirtAddr,
        write: bool,
    ) -> Result<Arc<Frame>> {
        let upage = addr.page_round_down();
        let writable = space.pages().find(upage).map(|page| page.is_writable());
        match writable {
            Some(false) if write => return Err(VmError::ProtectionViolation(addr)),
            Some(_) => {}
            None if self.is_stack_access(addr, esp) => {
                // Another thread of the process may have grown the stack first.
                match self.create_zero_page(space, upage, true) {
                    Ok(()) | Err(VmError::AlreadyMapped(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            None => return Err(VmError::InvalidAccess(addr)),
        }

        self.load_page_pinned(space, upage)
    }
}
