use kernel_alloc::{FrameAllocator, PmmError};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_novm::FlatAllocator;

#[repr(C, align(4096))]
struct Page([u8; 4096]);

/// Leaked, page-aligned RAM whose address doubles as its physical address.
fn ram(pages: usize) -> (PhysicalAddress, u64) {
    let pages: &'static mut [Page] =
        Box::leak((0..pages).map(|_| Page([0xA5; 4096])).collect::<Vec<_>>().into_boxed_slice());
    let start = pages.as_mut_ptr().expose_provenance() as u64;
    (PhysicalAddress::new(start), pages.len() as u64 * PAGE_SIZE)
}

fn static_map(words: usize) -> &'static mut [u64] {
    Box::leak(vec![0; words].into_boxed_slice())
}

#[test]
fn first_fit_scan_and_free() {
    let novm = FlatAllocator::new();
    let base = PhysicalAddress::new(0x8000_0000);
    novm.add_arena("main", base, 16 * PAGE_SIZE, static_map(1)).unwrap();
    assert_eq!(novm.free_count(), 16);

    let a = novm.alloc_pages(3).unwrap();
    let b = novm.alloc_pages(2).unwrap();
    assert_eq!(a, base);
    assert_eq!(b, base + 3 * PAGE_SIZE);
    assert_eq!(novm.free_count(), 11);

    // A hole of three pages is reused before the tail.
    novm.free_pages(a, 3);
    assert_eq!(novm.alloc_pages(2).unwrap(), base);
    assert_eq!(novm.alloc_pages(4).unwrap(), base + 5 * PAGE_SIZE);
    assert_eq!(novm.alloc_pages(8), Err(PmmError::NoMemory));
    assert_eq!(novm.alloc_pages(1).unwrap(), base + 2 * PAGE_SIZE);
}

#[test]
fn specific_claims_are_all_or_nothing() {
    let novm = FlatAllocator::new();
    let base = PhysicalAddress::new(0x8000_0000);
    novm.add_arena("main", base, 8 * PAGE_SIZE, static_map(1)).unwrap();

    novm.alloc_specific(base + 4 * PAGE_SIZE, 1).unwrap();
    assert_eq!(
        novm.alloc_specific(base + 2 * PAGE_SIZE, 4),
        Err(PmmError::AlreadyAllocated)
    );
    assert_eq!(novm.free_count(), 7);

    assert_eq!(
        novm.alloc_specific(PhysicalAddress::new(0x9000_0000), 1),
        Err(PmmError::NoMemory)
    );
    assert_eq!(novm.alloc_specific(base + 7 * PAGE_SIZE, 2), Err(PmmError::NoMemory));
    assert_eq!(novm.alloc_specific(base + 1, 1), Err(PmmError::InvalidArgument));

    novm.alloc_specific(base, 4).unwrap();
    assert_eq!(novm.free_count(), 3);
}

#[test]
fn frame_allocator_contract() {
    let novm = FlatAllocator::new();
    let base = PhysicalAddress::new(0x4000_0000);
    novm.add_arena("main", base, 64 * PAGE_SIZE, static_map(1)).unwrap();

    let frames = novm.alloc_frames(5).unwrap();
    assert!(frames.is_contiguous());
    assert_eq!(frames.first(), Some(base));

    let (run, list) = novm.alloc_contiguous(4, 15).unwrap();
    assert!(run.is_aligned_to(1 << 15));
    assert_eq!(run, base + 8 * PAGE_SIZE);
    assert_eq!(list.len(), 4);

    let claimed = novm.alloc_at(base + 20 * PAGE_SIZE, 2).unwrap();
    assert_eq!(novm.alloc_at(base + 21 * PAGE_SIZE, 1), Err(PmmError::AlreadyAllocated));

    assert_eq!(novm.free_count(), 64 - 11);
    assert_eq!(novm.free_frames(frames), 5);
    assert_eq!(novm.free_frames(list), 4);
    assert_eq!(novm.free_frames(claimed), 2);
    assert_eq!(novm.free_count(), 64);
}

#[test]
fn embedded_bitmap_carves_its_own_pages() {
    // 200 pages need 4 bitmap words (32 bytes): fits in part of the first page.
    let (start, size) = ram(200);
    let novm = FlatAllocator::new();
    unsafe { novm.add_arena_embedded("ram", start, size) }.unwrap();

    assert_eq!(novm.arena_ranges().collect::<Vec<_>>(), [(start, size)]);
    assert_eq!(novm.free_count(), 199);

    // The rest of the bitmap's page is handed out as the remainder.
    let (rem, len) = novm.alloc_unaligned_remainder().unwrap();
    assert_eq!(rem, start + 32);
    assert_eq!(len, 4096 - 32);

    // First page is the bitmap's; allocation starts after it.
    assert_eq!(novm.alloc_pages(1).unwrap(), start + PAGE_SIZE);
    assert_eq!(novm.alloc_specific(start, 1), Err(PmmError::AlreadyAllocated));
}

#[test]
fn embedded_bitmap_in_front_of_the_first_page() {
    // Start 256 bytes before a page boundary: the bitmap fits in front of it.
    let (ram_start, size) = ram(9);
    let start = ram_start + (PAGE_SIZE - 256);
    let novm = FlatAllocator::new();
    unsafe { novm.add_arena_embedded("ram", start, size - PAGE_SIZE + 256) }.unwrap();

    // Eight whole pages, none lost to the bitmap.
    assert_eq!(novm.free_count(), 8);
    let (rem, len) = novm.alloc_unaligned_remainder().unwrap();
    assert_eq!(rem, start + 8);
    assert_eq!(len, 256 - 8);
}

#[test]
fn arena_too_small_for_its_bitmap_is_rejected() {
    let (start, _) = ram(1);
    let novm = FlatAllocator::new();
    assert_eq!(
        unsafe { novm.add_arena_embedded("tiny", start, PAGE_SIZE) },
        Err(PmmError::InvalidArgument)
    );
}

#[test]
#[should_panic(expected = "double free")]
fn freeing_a_clear_page_panics() {
    let novm = FlatAllocator::new();
    novm.add_arena("main", PhysicalAddress::new(0x8000_0000), 4 * PAGE_SIZE, static_map(1))
        .unwrap();
    let pa = novm.alloc_pages(1).unwrap();
    novm.free_pages(pa, 2);
}

#[test]
#[should_panic(expected = "outside every arena")]
fn freeing_an_unknown_address_panics() {
    let novm = FlatAllocator::new();
    novm.add_arena("main", PhysicalAddress::new(0x8000_0000), 4 * PAGE_SIZE, static_map(1))
        .unwrap();
    novm.free_pages(PhysicalAddress::new(0x1000), 1);
}

#[test]
fn oversized_dirty_map_counts_only_its_pages() {
    let novm = FlatAllocator::new();
    let base = PhysicalAddress::new(0x8000_0000);
    let map = Box::leak(vec![u64::MAX; 4].into_boxed_slice());
    novm.add_arena("main", base, 64 * PAGE_SIZE, map).unwrap();
    assert_eq!(novm.free_count(), 64);

    assert_eq!(novm.alloc_pages(64), Ok(base));
    assert_eq!(novm.free_count(), 0);
    novm.free_pages(base, 64);
    assert_eq!(novm.free_count(), 64);
}

#[test]
fn bad_frame_list_frees_nothing() {
    let novm = FlatAllocator::new();
    let base = PhysicalAddress::new(0x8000_0000);
    novm.add_arena("main", base, 8 * PAGE_SIZE, static_map(1)).unwrap();
    let frames = novm.alloc_frames(3).unwrap();
    novm.free_pages(base + 2 * PAGE_SIZE, 1);
    assert_eq!(novm.free_count(), 6);

    // The third page is already free: the first two must stay allocated.
    let freed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        novm.free_frames(frames)
    }));
    assert!(freed.is_err());
    assert_eq!(novm.free_count(), 6);
    assert_eq!(novm.alloc_specific(base, 1), Err(PmmError::AlreadyAllocated));
    assert_eq!(novm.alloc_specific(base + PAGE_SIZE, 1), Err(PmmError::AlreadyAllocated));
}

#[test]
fn foreign_frame_list_frees_nothing() {
    let novm = FlatAllocator::new();
    let base = PhysicalAddress::new(0x8000_0000);
    novm.add_arena("main", base, 8 * PAGE_SIZE, static_map(1)).unwrap();
    let mut frames = novm.alloc_frames(2).unwrap();
    frames.push(PhysicalAddress::new(0x1000)).unwrap();

    let freed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        novm.free_frames(frames)
    }));
    assert!(freed.is_err());
    assert_eq!(novm.free_count(), 6);
}
