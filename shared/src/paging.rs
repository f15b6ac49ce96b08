// https://wiki.osdev.org/Paging

use crate::mem::{PhysAddr, PAGE_FRAME_SIZE};
use arbitrary_int::{u20, Number};
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user mapping of `frame`, or `None` if the frame lies above 4GB.
    pub fn user_mapping(frame: PhysAddr, writable: bool) -> Option<Self> {
        let frame_number = u32::try_from(frame.as_usize() / PAGE_FRAME_SIZE).ok()?;
        if frame_number > u20::MAX.value() {
            return None;
        }

        Some(
            Self::DEFAULT
                .with_present(true)
                .with_read_write(writable)
                .with_user_supervisor(true)
                .with_page_frame_address(u20::new(frame_number)),
        )
    }

    pub fn frame(&self) -> PhysAddr {
        PhysAddr::new(self.page_frame_address().value() as usize * PAGE_FRAME_SIZE)
    }
}
