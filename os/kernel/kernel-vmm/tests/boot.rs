mod common;

use common::{
    CountingPfa, KERNEL_BASE, Machine, PHYSMAP_BASE, PHYSMAP_SIZE, RAM_BASE, USER_BASE, layout,
    pa, va,
};
use kernel_alloc::FrameAllocator;
use kernel_info::InitialMapping;
use kernel_memory_addresses::PAGE_SIZE;
use kernel_vmm::{AspaceKind, MmuFlags, RegionKind, Vmm, VmmError};

#[test]
fn physical_addresses_map_into_the_physmap() {
    let m = Machine::new(64);
    let walker = m.walker();
    let pfa = CountingPfa::new(&m.pmm);
    let vmm = Vmm::new(layout(), &walker, &pfa).unwrap();

    assert_eq!(
        vmm.paddr_to_kvaddr(pa(RAM_BASE + 0x1234)),
        Some(va(PHYSMAP_BASE + 0x1234))
    );
    assert_eq!(vmm.paddr_to_kvaddr(pa(RAM_BASE - PAGE_SIZE)), None);
    assert_eq!(vmm.paddr_to_kvaddr(pa(RAM_BASE + PHYSMAP_SIZE)), None);
}

#[test]
fn kernel_pages_come_back_with_their_physmap_address() {
    let m = Machine::new(64);
    let walker = m.walker();
    let pfa = CountingPfa::new(&m.pmm);
    let vmm = Vmm::new(layout(), &walker, &pfa).unwrap();
    let free = m.pmm.free_count();

    let (kva, frames) = vmm.alloc_kpages(3).unwrap();
    assert!(frames.is_contiguous());
    assert_eq!(frames.len(), 3);
    assert_eq!(vmm.paddr_to_kvaddr(frames.first().unwrap()), Some(kva));
    assert_eq!(m.pmm.free_count(), free - 3);
    assert!(vmm.kernel().regions().is_empty());

    assert_eq!(vmm.alloc_kpages(0).err(), Some(VmmError::InvalidArgument));
    assert_eq!(vmm.alloc_kpages(64).err(), Some(VmmError::NoMemory));

    vmm.free_kpages(frames);
    assert_eq!(m.pmm.free_count(), free);
}

#[test]
fn kernel_pages_outside_the_physmap_are_refused() {
    let m = Machine::new(64);
    let walker = m.walker();
    let pfa = CountingPfa::new(&m.pmm);
    let mut low_physmap = layout();
    low_physmap.physmap_phys_base = pa(0);
    let vmm = Vmm::new(low_physmap, &walker, &pfa).unwrap();
    let free = m.pmm.free_count();

    assert_eq!(vmm.alloc_kpages(1).err(), Some(VmmError::NoMemory));
    assert_eq!(m.pmm.free_count(), free);
    assert_eq!(pfa.frees(), 1);
}

#[test]
fn virtual_addresses_resolve_in_their_address_space() {
    let m = Machine::new(256);
    let walker = m.walker();
    let pfa = CountingPfa::new(&m.pmm);
    let vmm = Vmm::new(layout(), &walker, &pfa).unwrap();
    let user = vmm.create_address_space("task", AspaceKind::User).unwrap();

    let k = vmm
        .alloc(vmm.kernel(), "buf", 0x1000, Some(va(KERNEL_BASE + 0x1000_0000)), 12, MmuFlags::RW)
        .unwrap();
    let u = vmm.alloc(&user, "buf", 0x1000, None, 12, MmuFlags::USER_RW).unwrap();

    assert!(std::ptr::eq(vmm.vaddr_to_aspace(k, None).unwrap(), vmm.kernel()));
    assert!(std::ptr::eq(vmm.vaddr_to_aspace(u + 8, Some(&user)).unwrap(), &user));
    assert!(vmm.vaddr_to_aspace(u, None).is_none());
    assert!(vmm.vaddr_to_aspace(va(0x1000), Some(&user)).is_none());

    let (kpa, _) = vmm.query(vmm.kernel(), k).unwrap();
    assert_eq!(vmm.vaddr_to_paddr(k + 0x10, Some(&user)), Some(kpa + 0x10));
    let (upa, _) = vmm.query(&user, u).unwrap();
    assert_eq!(vmm.vaddr_to_paddr(u, Some(&user)), Some(upa));
    assert_eq!(vmm.vaddr_to_paddr(u + 0x1000, Some(&user)), None);
    assert_eq!(vmm.vaddr_to_paddr(u, None), None);
}

#[test]
fn boot_frames_are_taken_out_of_the_allocator() {
    let m = Machine::new(256);
    let walker = m.walker();
    let pfa = CountingPfa::new(&m.pmm);
    let vmm = Vmm::new(layout(), &walker, &pfa).unwrap();

    // The image was mapped while its frames still looked free.
    let (image, frames) = m.pmm.alloc_contiguous(3, 0).unwrap();
    let kva = va(KERNEL_BASE + 0x20_0000);
    vmm.alloc_physical(vmm.kernel(), "image", 3 * PAGE_SIZE, Some(kva), image, MmuFlags::RX)
        .unwrap();
    m.pmm.free_frames(frames);
    let free = m.pmm.free_count();

    assert_eq!(vmm.mark_pages_in_use(kva + 0x10, 2 * PAGE_SIZE), Ok(3));
    assert_eq!(m.pmm.free_count(), free - 3);
    for i in 0..3_u64 {
        assert!(m.pmm.frame_info(image + i * PAGE_SIZE).unwrap().in_use);
    }

    assert_eq!(vmm.mark_pages_in_use(kva, 3 * PAGE_SIZE), Ok(0));
    assert_eq!(vmm.mark_pages_in_use(kva, 0), Ok(0));
    assert_eq!(
        vmm.mark_pages_in_use(kva, 4 * PAGE_SIZE),
        Err(VmmError::NotFound)
    );
    assert_eq!(
        vmm.mark_pages_in_use(va(USER_BASE), PAGE_SIZE),
        Err(VmmError::InvalidArgument)
    );
    assert_eq!(m.pmm.free_count(), free - 3);
}

#[test]
fn initial_mappings_are_reserved() {
    let m = Machine::new(256);
    let walker = m.walker();
    let pfa = CountingPfa::new(&m.pmm);
    let vmm = Vmm::new(layout(), &walker, &pfa).unwrap();
    let kernel = vmm.kernel();

    let mappings = [
        InitialMapping {
            name: "physmap",
            phys: pa(RAM_BASE),
            virt: va(PHYSMAP_BASE),
            size: 256 * PAGE_SIZE,
            temporary: false,
        },
        InitialMapping {
            name: "uart",
            phys: pa(0x1000_0000),
            virt: va(KERNEL_BASE + 0x2000_0100),
            size: 0x100,
            temporary: false,
        },
        InitialMapping {
            name: "identity",
            phys: pa(RAM_BASE),
            virt: va(RAM_BASE),
            size: 0x10_0000,
            temporary: true,
        },
    ];
    vmm.reserve_initial_mappings(&mappings).unwrap();

    let regions = kernel.regions();
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].name, "physmap");
    assert_eq!(regions[0].size, 256 * PAGE_SIZE);
    assert_eq!(regions[0].kind, RegionKind::Reserved);
    assert_eq!(regions[1].base, va(KERNEL_BASE + 0x2000_0000));
    assert_eq!(regions[1].size, PAGE_SIZE);

    assert_eq!(
        vmm.alloc(kernel, "heap", 0x1000, None, 12, MmuFlags::RW),
        Ok(va(KERNEL_BASE + 256 * PAGE_SIZE))
    );
    assert_eq!(
        vmm.alloc(kernel, "over", 0x1000, Some(va(PHYSMAP_BASE)), 12, MmuFlags::RW),
        Err(VmmError::AlreadyAllocated)
    );
    assert_eq!(
        vmm.reserve_initial_mappings(&mappings[..1]),
        Err(VmmError::AlreadyAllocated)
    );
}
