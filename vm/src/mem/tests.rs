//! End-to-end paging scenarios on hosted collaborators.

use super::frame_pool::NextFit;
use super::*;
use crate::block::RamDisk;
use crate::fs::{BlockId, File, RamFile};
use crate::swapping::{SwapSpace, SECTORS_IN_PAGE};
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use kidneyos_shared::mem::{OFFSET, PAGE_FRAME_SIZE, USER_STACK_MAX};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const PAGE: usize = PAGE_FRAME_SIZE;
const ESP: VirtAddr = VirtAddr::new(OFFSET - PAGE);
const BASE: usize = 0x0804_8000;

fn vm_with(frames: usize, swap_slots: u32, config: VmConfig) -> VirtualMemory {
    let disk = RamDisk::new(swap_slots * SECTORS_IN_PAGE);
    let swap = SwapSpace::format(Box::new(disk)).unwrap();
    VirtualMemory::new(Arc::new(CoreMapPool::<NextFit>::new(frames)), swap, config)
}

fn vm(frames: usize, swap_slots: u32) -> VirtualMemory {
    vm_with(frames, swap_slots, VmConfig::default())
}

fn new_space(vm: &VirtualMemory) -> Arc<AddressSpace> {
    vm.new_address_space(Box::new(SoftPageDirectory::new()))
}

fn page(i: usize) -> VirtAddr {
    VirtAddr::new(BASE + i * PAGE)
}

fn info(space: &AddressSpace, upage: VirtAddr) -> PageInfo {
    space.page_info(upage).unwrap()
}

/// Every resident page sits in a tracked frame exactly once, and is mapped there.
fn assert_residency(vm: &VirtualMemory, space: &AddressSpace) {
    let resident: Vec<_> = space
        .pages()
        .iter()
        .filter(|page| page.is_loaded())
        .map(|page| (page.addr(), page.frame().unwrap()))
        .collect();

    for (upage, addr) in resident {
        let frame = vm.frame_table().get(addr).unwrap();
        let hits = frame
            .resident_pages()
            .into_iter()
            .filter(|&(id, page)| id == space.id() && page == upage)
            .count();
        assert_eq!(hits, 1, "{upage:?} appears {hits} times in {frame:?}");
        assert_eq!(space.pagedir().translate(upage), Some(addr));
    }
}

#[test]
fn fourth_zero_page_evicts_exactly_one_frame() {
    let vm = vm(3, 8);
    let space = new_space(&vm);
    for i in 0..4 {
        vm.create_zero_page(&space, page(i), true).unwrap();
    }
    for i in 0..3 {
        vm.handle_fault(&space, page(i), ESP).unwrap();
    }
    assert_eq!(vm.stats().evictions, 0);

    vm.handle_fault(&space, page(3) + 12, ESP).unwrap();

    assert_eq!(vm.stats().evictions, 1);
    let evicted = info(&space, page(0));
    assert!(!evicted.loaded);
    assert_eq!(evicted.kind, PageKind::Swap);
    assert!(evicted.swap_slot.is_some());
    for i in 1..4 {
        assert!(info(&space, page(i)).loaded);
    }
    assert_eq!(vm.swap().used(), 1);
    assert_residency(&vm, &space);
}

#[test]
fn accessed_frames_get_a_second_chance() {
    let vm = vm(3, 8);
    let space = new_space(&vm);
    for i in 0..4 {
        vm.create_zero_page(&space, page(i), true).unwrap();
    }
    for i in 0..3 {
        vm.handle_fault(&space, page(i), ESP).unwrap();
    }
    space.pagedir().set_accessed(page(1), false);

    vm.handle_fault(&space, page(3), ESP).unwrap();

    assert!(!info(&space, page(1)).loaded);
    for i in [0, 2, 3] {
        assert!(info(&space, page(i)).loaded);
    }
}

#[test]
fn eviction_picks_the_only_unpinned_frame() {
    let vm = vm(4, 8);
    let space = new_space(&vm);
    for i in 0..5 {
        vm.create_zero_page(&space, page(i), true).unwrap();
    }
    for i in 0..4 {
        vm.load_page(&space, page(i), i != 2).unwrap();
    }

    vm.handle_fault(&space, page(4), ESP).unwrap();

    assert_eq!(vm.stats().evictions, 1);
    assert!(!info(&space, page(2)).loaded);
    for i in [0, 1, 3] {
        let pinned = info(&space, page(i));
        assert!(pinned.loaded);
        vm.frame_table().unpin(pinned.frame.unwrap());
    }
    assert_residency(&vm, &space);
}

#[test]
fn all_frames_pinned_is_fatal() {
    let vm = vm(2, 8);
    let space = new_space(&vm);
    for i in 0..3 {
        vm.create_zero_page(&space, page(i), true).unwrap();
    }
    vm.load_page(&space, page(0), true).unwrap();
    vm.load_page(&space, page(1), true).unwrap();

    let err = vm.handle_fault(&space, page(2), ESP).unwrap_err();
    assert_eq!(err, VmError::OutOfFrames);
    assert!(err.is_fatal());
    assert!(!info(&space, page(2)).loaded);
    assert_eq!(vm.frame_table().pool().in_use(), 2);
}

#[test]
fn swapped_pages_round_trip() {
    for seed in 0..4 {
        let mut rng = StdRng::seed_from_u64(seed);
        let vm = vm(2, 16);
        let space = new_space(&vm);

        let pages = 6;
        let contents: Vec<Vec<u8>> = (0..pages)
            .map(|_| {
                let mut bytes = vec![0u8; PAGE];
                rng.fill(&mut bytes[..]);
                bytes
            })
            .collect();

        for (i, bytes) in contents.iter().enumerate() {
            vm.create_zero_page(&space, page(i), true).unwrap();
            vm.write_through(&space, ESP, page(i), bytes).unwrap();
        }
        assert!(vm.stats().evictions >= pages - 2);

        let mut order: Vec<usize> = (0..pages).collect();
        order.shuffle(&mut rng);
        for i in order {
            let mut back = vec![0u8; PAGE];
            vm.read_through(&space, ESP, page(i), &mut back).unwrap();
            assert_eq!(back, contents[i], "page {i} differs (seed {seed})");
        }
        assert_residency(&vm, &space);
    }
}

#[test]
fn random_accesses_match_a_flat_buffer() {
    let mut rng = StdRng::seed_from_u64(0xf1a7);
    let vm = vm(3, 16);
    let space = new_space(&vm);

    let pages = 7;
    for i in 0..pages {
        vm.create_zero_page(&space, page(i), true).unwrap();
    }
    let mut shadow = vec![0u8; pages * PAGE];

    for _ in 0..60 {
        let len = rng.gen_range(1..3 * PAGE);
        let start = rng.gen_range(0..shadow.len() - len);
        if rng.gen_bool(0.5) {
            let mut data = vec![0u8; len];
            rng.fill(&mut data[..]);
            vm.write_through(&space, ESP, page(0) + start, &data).unwrap();
            shadow[start..start + len].copy_from_slice(&data);
        } else {
            let mut back = vec![0u8; len];
            vm.read_through(&space, ESP, page(0) + start, &mut back).unwrap();
            assert_eq!(back, &shadow[start..start + len]);
        }
    }
    assert_residency(&vm, &space);
}

#[test]
fn overlapping_mmap_leaves_nothing_behind() {
    let vm = vm(4, 8);
    let space = new_space(&vm);
    let one: Arc<dyn File> = Arc::new(RamFile::new(vec![1; 100]));
    let two: Arc<dyn File> = Arc::new(RamFile::new(vec![2; PAGE + 1]));
    let x = page(4);

    assert_eq!(vm.mmap(&space, 2, &one, x), Ok(MapId::new(0)));
    assert_eq!(vm.mmap(&space, 3, &two, x), Err(VmError::AlreadyMapped(x)));
    assert_eq!(vm.mmap(&space, 3, &two, x - PAGE), Err(VmError::AlreadyMapped(x)));
    assert_eq!(space.page_count(), 1);
    assert!(space.page_info(x - PAGE).is_none());
    assert_eq!(space.mappings().len(), 1);

    assert_eq!(vm.mmap(&space, 3, &two, x + PAGE), Ok(MapId::new(1)));
    assert_eq!(space.page_count(), 3);
}

#[test]
fn mmap_rejects_bad_requests() {
    let vm = vm(4, 8);
    let space = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::new(vec![1; 2 * PAGE]));
    let empty: Arc<dyn File> = Arc::new(RamFile::new(vec![]));

    assert_eq!(vm.mmap(&space, 0, &file, page(0)), Err(VmError::ReservedDescriptor(0)));
    assert_eq!(vm.mmap(&space, 1, &file, page(0)), Err(VmError::ReservedDescriptor(1)));
    assert_eq!(vm.mmap(&space, 2, &file, VirtAddr::new(0)), Err(VmError::NullAddress));
    assert_eq!(
        vm.mmap(&space, 2, &file, page(0) + 1),
        Err(VmError::Misaligned(page(0) + 1))
    );
    assert_eq!(vm.mmap(&space, 2, &empty, page(0)), Err(VmError::EmptyFile));
    assert_eq!(
        vm.mmap(&space, 2, &file, VirtAddr::new(OFFSET - PAGE)),
        Err(VmError::OutOfRange)
    );
    assert_eq!(space.page_count(), 0);
    assert!(space.mappings().is_empty());
}

#[test]
fn munmap_writes_back_and_rejects_second_call() {
    let vm = vm(4, 8);
    let space = new_space(&vm);
    let ram = Arc::new(RamFile::new(vec![0; PAGE + 100]));
    let file: Arc<dyn File> = ram.clone();
    let x = page(0);

    let id = vm.mmap(&space, 2, &file, x).unwrap();
    assert_eq!(ram.open_handles(), 2);
    vm.write_through(&space, ESP, x + 10, b"hello").unwrap();
    vm.write_through(&space, ESP, x + PAGE + 2, b"world").unwrap();
    assert_eq!(&ram.contents()[10..15], &[0; 5]);

    vm.munmap(&space, id).unwrap();

    let contents = ram.contents();
    assert_eq!(&contents[10..15], b"hello");
    assert_eq!(&contents[PAGE + 2..PAGE + 7], b"world");
    assert_eq!(contents.len(), PAGE + 100);
    assert_eq!(space.page_count(), 0);
    assert!(vm.frame_table().is_empty());

    assert_eq!(vm.munmap(&space, id), Err(VmError::NoSuchMapping(id)));
    assert_eq!(ram.open_handles(), 1);
}

#[test]
fn evicted_mmap_page_goes_back_to_its_file() {
    let vm = vm(1, 8);
    let space = new_space(&vm);
    let ram = Arc::new(RamFile::new(vec![0; 2 * PAGE]));
    let file: Arc<dyn File> = ram.clone();
    let x = page(0);
    vm.mmap(&space, 2, &file, x).unwrap();

    vm.write_through(&space, ESP, x, b"dirty").unwrap();
    let mut buf = [0u8; 4];
    vm.read_through(&space, ESP, x + PAGE, &mut buf).unwrap();

    assert_eq!(&ram.contents()[..5], b"dirty");
    assert_eq!(vm.swap().used(), 0);
    let evicted = info(&space, x);
    assert!(!evicted.loaded);
    assert_eq!(evicted.kind, PageKind::File);

    // Comes back from the file.
    let mut back = [0u8; 5];
    vm.read_through(&space, ESP, x, &mut back).unwrap();
    assert_eq!(&back, b"dirty");
}

#[test]
fn mapping_survives_closing_the_descriptor() {
    let vm = vm(2, 8);
    let space = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::new(vec![9; 64]));
    vm.mmap(&space, 5, &file, page(0)).unwrap();
    drop(file);

    let mut buf = [0u8; 64];
    vm.read_through(&space, ESP, page(0), &mut buf).unwrap();
    assert_eq!(buf, [9; 64]);
}

#[test]
fn dirty_segment_pages_go_to_swap() {
    let vm = vm(1, 8);
    let space = new_space(&vm);
    let ram = Arc::new(RamFile::new(vec![3; PAGE]));
    let file: Arc<dyn File> = ram.clone();
    vm.create_segment_page(&space, page(0), file, 0, PAGE, 0, true)
        .unwrap();
    vm.create_zero_page(&space, page(1), true).unwrap();

    vm.write_through(&space, ESP, page(0) + 1, &[4]).unwrap();
    vm.handle_fault(&space, page(1), ESP).unwrap();

    let evicted = info(&space, page(0));
    assert_eq!(evicted.kind, PageKind::Swap);
    assert_eq!(vm.swap().used(), 1);
    assert!(ram.contents().iter().all(|&b| b == 3));

    let mut back = [0u8; 3];
    vm.read_through(&space, ESP, page(0), &mut back).unwrap();
    assert_eq!(back, [3, 4, 3]);
    // The slot is released once the page is back in memory. The one in use
    // now holds page 1.
    assert_eq!(info(&space, page(0)).swap_slot, None);
    assert_eq!(info(&space, page(1)).kind, PageKind::Swap);
    assert_eq!(vm.swap().used(), 1);
}

#[test]
fn clean_segment_pages_are_dropped_and_reread() {
    let vm = vm(1, 8);
    let space = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::new(vec![5; 10]));
    vm.create_segment_page(&space, page(0), file, 0, 10, PAGE - 10, false)
        .unwrap();
    vm.create_zero_page(&space, page(1), false).unwrap();

    vm.handle_fault(&space, page(0), ESP).unwrap();
    vm.handle_fault(&space, page(1), ESP).unwrap();
    let evicted = info(&space, page(0));
    assert_eq!(evicted.kind, PageKind::File);
    assert!(!evicted.loaded);
    assert_eq!(vm.swap().used(), 0);

    let mut back = [0u8; 12];
    vm.read_through(&space, ESP, page(0), &mut back).unwrap();
    assert_eq!(&back[..10], &[5; 10]);
    assert_eq!(&back[10..], &[0, 0]);
    // A read-only zero page is dropped too.
    assert_eq!(info(&space, page(1)).kind, PageKind::Zero);
    assert_eq!(vm.swap().used(), 0);
}

fn load_shared_page(vm: &VirtualMemory, space: &Arc<AddressSpace>, file: &Arc<dyn File>) {
    vm.create_segment_page(space, page(0), Arc::clone(file), 0, PAGE, 0, false)
        .unwrap();
    vm.handle_fault(space, page(0), ESP).unwrap();
}

#[test]
fn read_only_file_pages_share_a_frame() {
    let vm = vm(4, 8);
    let a = new_space(&vm);
    let b = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::on_disk(vec![7; PAGE], 100));
    load_shared_page(&vm, &a, &file);
    load_shared_page(&vm, &b, &file);

    let shared = info(&a, page(0)).frame.unwrap();
    assert_eq!(info(&b, page(0)).frame, Some(shared));
    assert_eq!(vm.stats().shared_hits, 1);
    assert_eq!(vm.frame_table().len(), 1);

    let frame = vm.frame_table().get(shared).unwrap();
    assert_eq!(frame.page_count(), 2);
    assert_eq!(vm.frame_table().find_owning_page(&frame, &b), Some(page(0)));
    let found = vm
        .frame_table()
        .lookup_shared(ShareKey::new(BlockId(100), PAGE))
        .unwrap();
    assert_eq!(found.addr(), shared);
    vm.frame_table().unpin(shared);
    assert_residency(&vm, &a);
    assert_residency(&vm, &b);

    vm.free_all_pages_for(&a);
    assert_eq!(frame.page_count(), 1);
    assert!(info(&b, page(0)).loaded);
    assert_eq!(vm.frame_table().len(), 1);

    vm.free_all_pages_for(&b);
    assert!(vm.frame_table().is_empty());
    assert_eq!(vm.frame_table().pool().in_use(), 0);
}

#[test]
fn evicting_a_shared_frame_unloads_every_holder() {
    let vm = vm(1, 8);
    let a = new_space(&vm);
    let b = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::on_disk(vec![7; PAGE], 100));
    load_shared_page(&vm, &a, &file);
    load_shared_page(&vm, &b, &file);

    vm.create_zero_page(&a, page(1), true).unwrap();
    vm.handle_fault(&a, page(1), ESP).unwrap();

    assert_eq!(vm.stats().evictions, 1);
    for space in [&a, &b] {
        let evicted = info(space, page(0));
        assert!(!evicted.loaded);
        assert_eq!(evicted.kind, PageKind::File);
    }

    vm.handle_fault(&b, page(0), ESP).unwrap();
    assert!(info(&b, page(0)).loaded);
    assert_eq!(info(&a, page(1)).kind, PageKind::Swap);
}

#[test]
fn pinned_shared_frame_outlives_its_last_page() {
    let vm = vm(4, 8);
    let a = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::on_disk(vec![7; PAGE], 100));
    load_shared_page(&vm, &a, &file);

    // A loader in another process has found the frame but not attached yet.
    let frame = vm
        .frame_table()
        .lookup_shared(ShareKey::new(BlockId(100), PAGE))
        .unwrap();
    vm.free_all_pages_for(&a);

    assert_eq!(frame.page_count(), 0);
    assert_eq!(frame.pin_count(), 1);
    assert_eq!(vm.frame_table().get(frame.addr()).map(|f| f.seq()), Some(frame.seq()));
    assert_eq!(vm.frame_table().pool().in_use(), 1);

    vm.frame_table().unpin(frame.addr());
    assert!(vm.frame_table().is_empty());
    assert_eq!(vm.frame_table().pool().in_use(), 0);
}

#[test]
fn targeted_release_frees_the_frame_with_its_last_page() {
    let vm = vm(4, 8);
    let a = new_space(&vm);
    let b = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::on_disk(vec![7; PAGE], 100));
    load_shared_page(&vm, &a, &file);
    load_shared_page(&vm, &b, &file);
    let frame = vm
        .frame_table()
        .get(info(&a, page(0)).frame.unwrap())
        .unwrap();

    vm.frame_table().release(&frame, Some(&a));
    assert!(!info(&a, page(0)).loaded);
    assert_eq!(a.pagedir().translate(page(0)), None);
    assert!(info(&b, page(0)).loaded);
    assert_eq!(frame.page_count(), 1);
    assert_eq!(vm.frame_table().len(), 1);

    // Nothing of `a` is left in the frame.
    vm.frame_table().release(&frame, Some(&a));
    assert_eq!(frame.page_count(), 1);

    vm.frame_table().release(&frame, Some(&b));
    assert!(!info(&b, page(0)).loaded);
    assert!(vm.frame_table().is_empty());
    assert_eq!(vm.frame_table().pool().in_use(), 0);

    vm.handle_fault(&a, page(0), ESP).unwrap();
    let mut back = [0u8; 2];
    vm.read_through(&a, ESP, page(0), &mut back).unwrap();
    assert_eq!(back, [7, 7]);
}

#[test]
fn full_release_unloads_every_sharer() {
    let vm = vm(4, 8);
    let a = new_space(&vm);
    let b = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::on_disk(vec![7; PAGE], 100));
    load_shared_page(&vm, &a, &file);
    load_shared_page(&vm, &b, &file);
    let frame = vm
        .frame_table()
        .get(info(&a, page(0)).frame.unwrap())
        .unwrap();

    vm.frame_table().release(&frame, None);

    assert!(!info(&a, page(0)).loaded);
    assert!(!info(&b, page(0)).loaded);
    assert!(vm.frame_table().is_empty());
    assert_eq!(vm.frame_table().pool().in_use(), 0);
}

#[test]
fn partial_file_pages_do_not_share_full_ones() {
    let vm = vm(4, 8);
    let a = new_space(&vm);
    let b = new_space(&vm);
    let c = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::on_disk(vec![7; PAGE], 100));
    load_shared_page(&vm, &a, &file);
    vm.create_segment_page(&b, page(0), Arc::clone(&file), 0, 16, PAGE - 16, false)
        .unwrap();
    vm.handle_fault(&b, page(0), ESP).unwrap();

    assert_ne!(info(&a, page(0)).frame, info(&b, page(0)).frame);
    assert_eq!(vm.stats().shared_hits, 0);
    let mut head = [0u8; 16];
    vm.read_through(&b, ESP, page(0), &mut head).unwrap();
    assert_eq!(head, [7; 16]);
    let mut tail = [1u8; 4];
    vm.read_through(&b, ESP, page(0) + 100, &mut tail).unwrap();
    assert_eq!(tail, [0; 4]);

    // A full page of the same block still shares with the first one.
    load_shared_page(&vm, &c, &file);
    assert_eq!(info(&c, page(0)).frame, info(&a, page(0)).frame);
    assert_eq!(vm.stats().shared_hits, 1);
}

#[test]
fn sharing_can_be_disabled() {
    let vm = vm_with(4, 8, VmConfig::new().with_share_read_only(false));
    let a = new_space(&vm);
    let b = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::on_disk(vec![7; PAGE], 100));
    load_shared_page(&vm, &a, &file);
    load_shared_page(&vm, &b, &file);

    assert_ne!(info(&a, page(0)).frame, info(&b, page(0)).frame);
    assert_eq!(vm.stats().shared_hits, 0);
}

#[test]
fn writable_file_pages_are_private() {
    let vm = vm(4, 8);
    let a = new_space(&vm);
    let b = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::on_disk(vec![7; PAGE], 100));
    for space in [&a, &b] {
        vm.create_segment_page(space, page(0), Arc::clone(&file), 0, PAGE, 0, true)
            .unwrap();
        vm.handle_fault(space, page(0), ESP).unwrap();
    }
    assert_ne!(info(&a, page(0)).frame, info(&b, page(0)).frame);
}

#[test]
fn stack_grows_only_near_esp() {
    let vm = vm(4, 8);
    let space = new_space(&vm);

    assert_eq!(vm.handle_fault(&space, ESP - 4, ESP), Ok(()));
    assert_eq!(info(&space, (ESP - 4).page_round_down()).kind, PageKind::Zero);

    assert_eq!(
        vm.handle_fault(&space, ESP - 10000, ESP),
        Err(VmError::InvalidAccess(ESP - 10000))
    );
    assert!(space.page_info((ESP - 10000).page_round_down()).is_none());

    // PUSHA writes 32 bytes below the stack pointer.
    let low = ESP - 3 * PAGE;
    assert_eq!(vm.handle_fault(&space, low - 32, low), Ok(()));
    assert!(!vm.is_stack_access(low - 33, low));

    let deep = VirtAddr::new(OFFSET - USER_STACK_MAX - PAGE);
    assert!(!vm.is_stack_access(deep, deep));
    assert_eq!(
        vm.handle_fault(&space, VirtAddr::new(OFFSET + 5), ESP),
        Err(VmError::InvalidAccess(VirtAddr::new(OFFSET + 5)))
    );
}

#[test]
fn syscall_buffers_grow_the_stack() {
    let vm = vm(4, 8);
    let space = new_space(&vm);
    vm.write_through(&space, ESP, ESP - 8, &[1, 2, 3, 4]).unwrap();
    let mut back = [0u8; 4];
    vm.read_through(&space, ESP, ESP - 8, &mut back).unwrap();
    assert_eq!(back, [1, 2, 3, 4]);
}

#[test]
fn read_only_pages_reject_writes() {
    let vm = vm(4, 8);
    let space = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::new(vec![1; PAGE]));
    vm.create_segment_page(&space, page(0), file, 0, PAGE, 0, false)
        .unwrap();
    vm.handle_fault(&space, page(0), ESP).unwrap();

    assert_eq!(
        vm.handle_fault(&space, page(0) + 8, ESP),
        Err(VmError::ProtectionViolation(page(0) + 8))
    );
    assert_eq!(
        vm.write_through(&space, ESP, page(0), b"x"),
        Err(VmError::ProtectionViolation(page(0)))
    );
    let mut buf = [0u8; 1];
    assert_eq!(vm.read_through(&space, ESP, page(0), &mut buf), Ok(()));
    assert_eq!(buf, [1]);
}

#[test]
fn user_buffers_must_stay_in_user_memory() {
    let vm = vm(4, 8);
    let space = new_space(&vm);
    let mut buf = [0u8; 4];
    let near_top = VirtAddr::new(OFFSET - 2);
    assert_eq!(
        vm.read_through(&space, ESP, near_top, &mut buf),
        Err(VmError::InvalidAccess(near_top))
    );
    assert_eq!(
        vm.write_through(&space, ESP, VirtAddr::new(0), &buf),
        Err(VmError::InvalidAccess(VirtAddr::new(0)))
    );
    assert_eq!(vm.read_through(&space, ESP, near_top, &mut []), Ok(()));
}

#[test]
fn free_page_releases_swap_and_is_idempotent() {
    let vm = vm(1, 8);
    let space = new_space(&vm);
    vm.create_zero_page(&space, page(0), true).unwrap();
    vm.create_zero_page(&space, page(1), true).unwrap();
    vm.write_through(&space, ESP, page(0), &[1; 16]).unwrap();
    vm.handle_fault(&space, page(1), ESP).unwrap();
    assert_eq!(vm.swap().used(), 1);

    assert!(vm.free_page(&space, page(0)));
    assert_eq!(vm.swap().used(), 0);
    assert!(!vm.free_page(&space, page(0)));

    assert!(vm.free_page(&space, page(1)));
    assert!(vm.frame_table().is_empty());
    assert_eq!(vm.frame_table().pool().in_use(), 0);
    assert!(!vm.free_page(&space, page(7)));
}

#[test]
fn failed_load_does_not_leak_a_frame() {
    let vm = vm(2, 8);
    let space = new_space(&vm);
    let file: Arc<dyn File> = Arc::new(RamFile::new(vec![1; 100]));
    vm.create_segment_page(&space, page(0), file, 0, 200, PAGE - 200, false)
        .unwrap();

    let err = vm.handle_fault(&space, page(0), ESP).unwrap_err();
    assert_eq!(
        err,
        VmError::ShortRead {
            expected: 200,
            actual: 100
        }
    );
    assert!(!err.is_fatal());
    assert!(!info(&space, page(0)).loaded);
    assert!(vm.frame_table().is_empty());
    assert_eq!(vm.frame_table().pool().in_use(), 0);
}

#[test]
fn segments_are_split_into_pages() {
    let vm = vm(4, 8);
    let space = new_space(&vm);
    let bytes: Vec<u8> = (0..6000).map(|i| (i % 251) as u8).collect();
    let file: Arc<dyn File> = Arc::new(RamFile::new(bytes.clone()));

    vm.load_segment(&space, &file, 0, page(0), 6000, 3 * PAGE - 6000, true)
        .unwrap();

    assert_eq!(space.page_count(), 3);
    assert_eq!(info(&space, page(0)).kind, PageKind::File);
    assert_eq!(info(&space, page(1)).kind, PageKind::File);
    assert_eq!(info(&space, page(2)).kind, PageKind::Zero);

    let mut back = vec![0u8; PAGE];
    vm.read_through(&space, ESP, page(1), &mut back).unwrap();
    assert_eq!(&back[..6000 - PAGE], &bytes[PAGE..]);
    assert!(back[6000 - PAGE..].iter().all(|&b| b == 0));

    assert_eq!(
        vm.load_segment(&space, &file, 0, page(5) + 4, 10, PAGE - 10, false),
        Err(VmError::Misaligned(page(5) + 4))
    );
    assert_eq!(
        vm.load_segment(&space, &file, 0, page(2), 10, PAGE - 10, false),
        Err(VmError::AlreadyMapped(page(2)))
    );
}

#[test]
fn process_exit_frees_everything() {
    let vm = vm(2, 8);
    let space = new_space(&vm);
    let ram = Arc::new(RamFile::new(vec![0; PAGE]));
    let file: Arc<dyn File> = ram.clone();
    vm.mmap(&space, 2, &file, page(10)).unwrap();
    for i in 0..3 {
        vm.create_zero_page(&space, page(i), true).unwrap();
        vm.write_through(&space, ESP, page(i), &[i as u8 + 1; 8]).unwrap();
    }
    vm.write_through(&space, ESP, page(10), b"bye").unwrap();
    assert!(vm.swap().used() > 0);

    vm.free_all_pages_for(&space);

    assert_eq!(space.page_count(), 0);
    assert!(space.mappings().is_empty());
    assert_eq!(vm.swap().used(), 0);
    assert!(vm.frame_table().is_empty());
    assert_eq!(vm.frame_table().pool().in_use(), 0);
    assert_eq!(&ram.contents()[..3], b"bye");
    assert_eq!(ram.open_handles(), 1);
}

#[test]
#[should_panic(expected = "out of swap space")]
fn swap_exhaustion_panics() {
    let vm = vm(1, 2);
    let space = new_space(&vm);
    for i in 0..3 {
        vm.create_zero_page(&space, page(i), true).unwrap();
        vm.handle_fault(&space, page(i), ESP).unwrap();
    }
}

#[test]
fn concurrent_processes_keep_their_data() {
    let vm = Arc::new(vm(6, 64));
    let workers: Vec<_> = (0..4u8)
        .map(|worker| {
            let vm = Arc::clone(&vm);
            std::thread::spawn(move || {
                let space = new_space(&vm);
                for i in 0..5 {
                    vm.create_zero_page(&space, page(i), true).unwrap();
                }
                for round in 0..10u8 {
                    for i in 0..5 {
                        let fill = worker.wrapping_mul(31) ^ round ^ i as u8;
                        vm.write_through(&space, ESP, page(i), &[fill; 64]).unwrap();
                    }
                    for i in 0..5 {
                        let fill = worker.wrapping_mul(31) ^ round ^ i as u8;
                        let mut back = [0u8; 64];
                        vm.read_through(&space, ESP, page(i), &mut back).unwrap();
                        assert_eq!(back, [fill; 64]);
                    }
                }
                vm.free_all_pages_for(&space);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(vm.frame_table().is_empty());
    assert_eq!(vm.swap().used(), 0);
}
