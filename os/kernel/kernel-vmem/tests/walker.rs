mod common;

use common::*;
use kernel_alloc::{FrameAllocator, FrameList};
use kernel_vmem::{
    Arm64, ArmLpae, AspaceKind, CachePolicy, MapError, Mmu, MmuFlags, PageTableFormat,
    QueryError, Slot, Sv39, Sv48,
};

const TWO_MIB: u64 = 0x20_0000;

fn kernel_and_user<F: TestFormat>(w: &TestWalker<'_, F>) -> (kernel_vmem::ArchAspace, kernel_vmem::ArchAspace) {
    let kernel = w
        .init_aspace(va(F::KERNEL_BASE), F::KERNEL_SIZE, AspaceKind::Kernel)
        .unwrap();
    let user = w
        .init_aspace(va(USER_BASE), USER_SIZE, AspaceKind::User)
        .unwrap();
    (kernel, user)
}

fn round_trip<F: TestFormat>() {
    let m = Machine::new(64);
    let w = m.walker::<F>(F::MAX_ASID_BITS);
    let (kernel, user) = kernel_and_user(&w);

    let cases = [
        MmuFlags::new(),
        MmuFlags::new().with_read_only(true),
        MmuFlags::new().with_no_execute(true),
        MmuFlags::RO,
        MmuFlags::new().with_user(true),
        MmuFlags::USER_RW,
        MmuFlags::DEVICE,
        MmuFlags::RW.with_cache(CachePolicy::Uncached),
    ];

    for (i, &flags) in cases.iter().enumerate() {
        let aspace = if flags.user() { &user } else { &kernel };
        let i = i as u64;
        let v = aspace.base() + i * TWO_MIB;
        let p = pa(0x9000_0000 + i * 0x1000);

        w.map(aspace, v, p, 1, flags).unwrap();

        let expected = if F::ENCODES_CACHE {
            flags
        } else {
            flags.with_cache(CachePolicy::Cached)
        };
        assert_eq!(w.query(aspace, v), Ok((p, expected)), "{} {flags:?}", F::NAME);
        assert_eq!(w.query(aspace, v + 0x123).unwrap().0, p + 0x123);
        assert_eq!(
            w.query(aspace, v + 0x1000),
            Err(QueryError::NotFound(v + 0x1000))
        );
    }
}

/// Mapping one page into an empty user root builds one table per level
/// below the root; unmapping it gives all of them back.
fn reclaims_tables<F: TestFormat>() {
    let m = Machine::new(64);
    let w = m.walker::<F>(0);
    let (_kernel, user) = kernel_and_user(&w);
    let baseline = m.pmm.free_count();

    // Three pages straddling a 2 MiB boundary: two leaf tables.
    let v = va(USER_BASE + TWO_MIB - 0x1000);
    w.map(&user, v, pa(0x9000_0000), 3, MmuFlags::USER_RW).unwrap();
    assert_eq!(m.pmm.free_count(), baseline - F::LEVELS);

    assert_eq!(w.unmap(&user, v, 1), 1);
    assert_eq!(m.pmm.free_count(), baseline - F::LEVELS + 1);

    assert_eq!(w.unmap(&user, v + 0x1000, 2), 2);
    assert_eq!(m.pmm.free_count(), baseline);
    assert_eq!(w.query(&user, v + 0x1000), Err(QueryError::NotFound(v + 0x1000)));
}

fn rollback_on_exhaustion<F: TestFormat>() {
    let m = Machine::new(64);
    let w = m.walker::<F>(0);
    let (_kernel, user) = kernel_and_user(&w);

    // Leave exactly enough frames for the first walk down.
    let spare = F::LEVELS - 1;
    let _held: FrameList = m.pmm.alloc_frames(m.pmm.free_count() - spare).unwrap();

    let boundary = USER_BASE + TWO_MIB;
    let v = va(boundary - 0x2000);
    assert_eq!(
        w.map(&user, v, pa(0x9000_0000), 4, MmuFlags::USER_RW),
        Err(MapError::NoMemory {
            va: va(boundary),
            level: 0
        })
    );

    assert_eq!(m.pmm.free_count(), spare);
    for i in 0..4 {
        let page = v + i * 0x1000;
        assert_eq!(w.query(&user, page), Err(QueryError::NotFound(page)));
    }
}

fn destroy_returns_every_frame<F: TestFormat>() {
    let m = Machine::new(64);
    let w = m.walker::<F>(F::MAX_ASID_BITS);
    let kernel = w
        .init_aspace(va(F::KERNEL_BASE), F::KERNEL_SIZE, AspaceKind::Kernel)
        .unwrap();
    let baseline = m.pmm.free_count();

    let user = w
        .init_aspace(va(USER_BASE), USER_SIZE, AspaceKind::User)
        .unwrap();
    for i in 0..4 {
        let v = va(USER_BASE + i * 0x0100_0000);
        w.map(&user, v, pa(0x9000_0000), 2, MmuFlags::USER_RX).unwrap();
    }
    assert!(m.pmm.free_count() < baseline);

    w.destroy_aspace(user);
    assert_eq!(m.pmm.free_count(), baseline);
    assert_eq!(w.asid_pool().map_or(0, kernel_vmem::AsidPool::in_use), 0);

    // The kernel address space is untouched.
    w.map(&kernel, kernel.base(), pa(0x9000_0000), 1, MmuFlags::RW).unwrap();
    assert!(w.query(&kernel, kernel.base()).is_ok());
}

macro_rules! per_format {
    ($($format:ident => $module:ident),* $(,)?) => {
        $(
            mod $module {
                use super::*;

                #[test]
                fn map_query_round_trip() {
                    round_trip::<$format>();
                }

                #[test]
                fn unmap_reclaims_tables() {
                    reclaims_tables::<$format>();
                }

                #[test]
                fn map_rolls_back_on_exhaustion() {
                    rollback_on_exhaustion::<$format>();
                }

                #[test]
                fn destroy_returns_frames() {
                    destroy_returns_every_frame::<$format>();
                }
            }
        )*
    };
}

per_format! {
    Sv39 => sv39,
    Sv48 => sv48,
    Arm64 => arm64,
    ArmLpae => arm_lpae,
}

#[test]
fn unmap_skips_holes() {
    let m = Machine::new(64);
    let w = m.walker::<Sv39>(0);
    let (_kernel, user) = kernel_and_user(&w);

    let v = va(USER_BASE);
    w.map(&user, v, pa(0x9000_0000), 1, MmuFlags::USER_RW).unwrap();
    w.map(&user, v + 0x5000, pa(0x9000_5000), 1, MmuFlags::USER_RW).unwrap();

    assert_eq!(w.unmap(&user, v, 8), 2);
    // The whole window, mostly empty top-level slots.
    assert_eq!(w.unmap(&user, v, (USER_SIZE / 0x1000) as usize), 0);
}

#[test]
fn unaligned_requests_are_rejected() {
    let m = Machine::new(16);
    let w = m.walker::<Sv39>(0);
    let (kernel, _user) = kernel_and_user(&w);

    assert!(matches!(
        w.map(&kernel, kernel.base() + 0x10, pa(0x9000_0000), 1, MmuFlags::RW),
        Err(MapError::InvalidArgument(_))
    ));
    assert!(matches!(
        w.map(&kernel, kernel.base(), pa(0x9000_0010), 1, MmuFlags::RW),
        Err(MapError::InvalidArgument(_))
    ));
    assert_eq!(w.map(&kernel, kernel.base(), pa(0x9000_0000), 0, MmuFlags::RW), Ok(()));
}

#[test]
fn query_outside_the_window() {
    let m = Machine::new(16);
    let w = m.walker::<Sv39>(0);
    let (kernel, user) = kernel_and_user(&w);

    assert_eq!(
        w.query(&user, kernel.base()),
        Err(QueryError::OutOfRange(kernel.base()))
    );
    assert_eq!(
        w.query(&user, va(USER_BASE - 0x1000)),
        Err(QueryError::OutOfRange(va(USER_BASE - 0x1000)))
    );
}

#[test]
#[should_panic(expected = "already mapped")]
fn double_map_is_fatal() {
    let m = Machine::new(16);
    let w = m.walker::<Arm64>(0);
    let (kernel, _user) = kernel_and_user(&w);

    w.map(&kernel, kernel.base(), pa(0x9000_0000), 1, MmuFlags::RW).unwrap();
    let _ = w.map(&kernel, kernel.base(), pa(0x9000_1000), 1, MmuFlags::RW);
}

#[test]
#[should_panic(expected = "outside address space")]
fn map_beyond_the_window_is_fatal() {
    let m = Machine::new(16);
    let w = m.walker::<Sv39>(0);
    let (_kernel, user) = kernel_and_user(&w);

    let last = va(USER_BASE + USER_SIZE - 0x1000);
    let _ = w.map(&user, last, pa(0x9000_0000), 2, MmuFlags::USER_RW);
}

#[test]
#[should_panic(expected = "cannot be destroyed")]
fn destroying_the_kernel_is_fatal() {
    let m = Machine::new(16);
    let w = m.walker::<Sv39>(0);
    let (kernel, _user) = kernel_and_user(&w);
    w.destroy_aspace(kernel);
}

#[test]
fn kernel_address_space_is_created_once() {
    let m = Machine::new(16);
    let w = m.walker::<Sv48>(0);

    assert!(matches!(
        w.init_aspace(va(USER_BASE), USER_SIZE, AspaceKind::User),
        Err(MapError::InvalidArgument(_))
    ));

    w.init_aspace(va(Sv48::KERNEL_BASE), Sv48::KERNEL_SIZE, AspaceKind::Kernel)
        .unwrap();
    assert_eq!(
        w.init_aspace(va(Sv48::KERNEL_BASE), Sv48::KERNEL_SIZE, AspaceKind::Kernel)
            .unwrap_err(),
        MapError::InvalidArgument("kernel address space already initialized")
    );
    assert_eq!(w.kernel_window(), Some((va(Sv48::KERNEL_BASE), Sv48::KERNEL_SIZE)));
}

#[test]
fn split_formats_need_no_kernel_first() {
    let m = Machine::new(16);
    let w = m.walker::<Arm64>(16);
    let user = w
        .init_aspace(va(USER_BASE), USER_SIZE, AspaceKind::User)
        .unwrap();
    assert_eq!(user.asid(), Some(1));
}

#[test]
fn sv39_shares_pinned_kernel_slots() {
    let m = Machine::new(64);
    let w = m.walker::<Sv39>(0);
    let (kernel, user) = kernel_and_user(&w);

    let slot = Sv39::index(kernel.base(), 2);
    let shared = m.ram.table(kernel.root()).get(slot);
    assert!(matches!(Sv39::decode(shared, 2), Slot::Table(_)));
    assert_eq!(m.ram.table(user.root()).get(slot), shared);

    // Emptying the kernel window keeps the pinned table alive.
    w.map(&kernel, kernel.base(), pa(0x9000_0000), 1, MmuFlags::RW).unwrap();
    assert_eq!(w.unmap(&kernel, kernel.base(), 1), 1);
    assert_eq!(m.ram.table(kernel.root()).get(slot), shared);
    assert_eq!(m.ram.table(user.root()).get(slot), shared);
}

#[test]
fn query_reports_block_leaves() {
    let m = Machine::new(16);
    let w = m.walker::<Sv39>(0);
    let (kernel, _user) = kernel_and_user(&w);

    // Boot code mapped a 2 MiB block into the pinned level-1 table.
    let Slot::Table(l1) = Sv39::decode(
        m.ram.table(kernel.root()).get(Sv39::index(kernel.base(), 2)),
        2,
    ) else {
        panic!("kernel slot not populated");
    };
    let block = Sv39::leaf_entry(pa(0x8020_0000), MmuFlags::RX, 1, true);
    m.ram.table(l1).set(Sv39::index(kernel.base(), 1), block);

    assert_eq!(
        w.query(&kernel, kernel.base() + 0x1_2345),
        Ok((pa(0x8021_2345), MmuFlags::RX))
    );
}

#[test]
fn asid_tagged_address_spaces() {
    use common::HwEvent::*;

    let m = Machine::new(64);
    let w = m.walker::<Sv39>(16);
    let (kernel, user) = kernel_and_user(&w);
    assert_eq!(user.asid(), Some(1));
    m.hw.take();

    let v = va(USER_BASE);
    w.map(&user, v, pa(0x9000_0000), 1, MmuFlags::USER_RW).unwrap();
    w.unmap(&user, v, 1);
    assert_eq!(m.hw.take(), vec![FlushPage(v, Some(1))]);

    w.map(&kernel, kernel.base(), pa(0x9000_0000), 1, MmuFlags::RW).unwrap();
    w.unmap(&kernel, kernel.base(), 1);
    assert_eq!(m.hw.take(), vec![FlushPage(kernel.base(), None)]);

    unsafe { w.context_switch(Some(&user)) };
    assert_eq!(
        m.hw.take(),
        vec![InstallRoot(Sv39::root_register(user.root(), Some(1)))]
    );

    unsafe { w.context_switch(None) };
    assert_eq!(
        m.hw.take(),
        vec![InstallRoot(Sv39::root_register(kernel.root(), Some(0)))]
    );

    w.destroy_aspace(user);
    assert_eq!(m.hw.take(), vec![FlushAsid(1)]);
}

#[test]
fn untagged_switches_flush_everything() {
    use common::HwEvent::*;

    let m = Machine::new(64);
    let w = m.walker::<Sv48>(0);
    let (kernel, user) = kernel_and_user(&w);
    assert_eq!(user.asid(), None);
    m.hw.take();

    unsafe { w.context_switch(Some(&user)) };
    assert_eq!(
        m.hw.take(),
        vec![InstallRoot(Sv48::root_register(user.root(), None)), FlushAll]
    );

    // The kernel handle selects the kernel-only context.
    unsafe { w.context_switch(Some(&kernel)) };
    assert_eq!(
        m.hw.take(),
        vec![InstallRoot(Sv48::root_register(kernel.root(), None)), FlushAll]
    );

    w.destroy_aspace(user);
    assert_eq!(m.hw.take(), vec![FlushAll]);
}

#[test]
fn split_formats_disable_the_user_root() {
    use common::HwEvent::*;

    let m = Machine::new(32);

    let tagged = m.walker::<ArmLpae>(8);
    unsafe { tagged.context_switch(None) };
    assert_eq!(m.hw.take(), vec![DisableUserRoot]);

    let untagged = m.walker::<Arm64>(0);
    unsafe { untagged.context_switch(None) };
    assert_eq!(m.hw.take(), vec![DisableUserRoot, FlushAll]);
}

#[test]
fn asid_exhaustion_falls_back_to_full_flushes() {
    use common::HwEvent::*;

    let m = Machine::new(32);
    let w = m.walker::<Arm64>(1);
    let first = w.init_aspace(va(USER_BASE), USER_SIZE, AspaceKind::User).unwrap();
    let second = w.init_aspace(va(USER_BASE), USER_SIZE, AspaceKind::User).unwrap();
    assert_eq!(first.asid(), Some(1));
    assert_eq!(second.asid(), None);
    m.hw.take();

    unsafe { w.context_switch(Some(&second)) };
    assert_eq!(
        m.hw.take(),
        vec![InstallRoot(Arm64::root_register(second.root(), None)), FlushAll]
    );

    // Released ASIDs are handed out again.
    w.destroy_aspace(first);
    let third = w.init_aspace(va(USER_BASE), USER_SIZE, AspaceKind::User).unwrap();
    assert_eq!(third.asid(), Some(1));
}

#[test]
fn asid_width_is_clamped_to_the_format() {
    let m = Machine::new(16);
    let w = m.walker::<ArmLpae>(16);
    assert_eq!(w.asid_pool().unwrap().capacity(), 256);
}
