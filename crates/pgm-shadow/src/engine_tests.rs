use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use pgm_core::{
    AccessHandlerKind, AccessKind, GcPhys, GcPtr, HandlerAction, PageState, PgmError,
};

use super::{Pgm, PgmConfig};
use crate::{
    dump::DumpFlags,
    pool::PoolKind,
    sharing::{PageSharingService, SharedModule, SharedPageDesc, SharedPageMatch, SharedRegion},
    sync::{GuestMode, HostCaps},
};

const PML4: u64 = 0x10_000;
const PDPT: u64 = 0x11_000;
const PD: u64 = 0x12_000;
const PT: u64 = 0x13_000;
const DATA: u64 = 0x20_000;
const VA: u64 = 0x40_0000;

const TABLE_FLAGS: u64 = 0x7;
const LEAF_RW: u64 = 0x7;
const LEAF_RO: u64 = 0x5;

fn engine() -> Pgm {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();

    let mut pgm = Pgm::new(PgmConfig {
        host: HostCaps {
            long_mode: true,
            nested_paging: false,
            maxphyaddr: 48,
        },
        vcpu_count: 1,
        pool_pages: 32,
        pool_cache_enabled: true,
        driverless: false,
    })
    .unwrap();

    pgm.memory_mut()
        .register_ram(GcPhys(0), 16 * 1024 * 1024, "test ram")
        .unwrap();
    pgm
}

/// Builds the long-mode table chain and enters the mode on VCPU 0.
fn engine_with_paging() -> Pgm {
    let mut pgm = engine();
    let mem = pgm.memory_mut();
    mem.write_u64(GcPhys(PML4), PDPT | TABLE_FLAGS).unwrap();
    mem.write_u64(GcPhys(PDPT), PD | TABLE_FLAGS).unwrap();
    mem.write_u64(GcPhys(PD + 2 * 8), PT | TABLE_FLAGS).unwrap();

    pgm.change_mode(0, GuestMode::Amd64, GcPhys(PML4)).unwrap();
    pgm
}

fn map_page(pgm: &mut Pgm, n: u64, phys: u64, flags: u64) {
    pgm.memory_mut()
        .write_u64(GcPhys(PT + n * 8), phys | flags)
        .unwrap();
}

#[test]
fn paging_disabled_means_identity_translation() {
    let mut pgm = engine();
    pgm.memory_mut()
        .write_phys(GcPhys(0x5000), b"hello", None)
        .unwrap();

    let mut buf = [0u8; 5];
    pgm.read_virt(0, GcPtr(0x5000), &mut buf, None).unwrap();
    assert_eq!(&buf, b"hello");

    assert!(pgm.translate(0, GcPtr(0x5000)).unwrap().is_mapped());
}

#[test]
fn virt_access_follows_a_scattered_mapping() {
    let mut pgm = engine_with_paging();
    // Two virtually contiguous pages backed out of order.
    map_page(&mut pgm, 0, DATA + 0x3000, LEAF_RW);
    map_page(&mut pgm, 1, DATA + 0x1000, LEAF_RW);

    let data: Vec<u8> = (0..=255).collect();
    let addr = GcPtr(VA + 0xF80); // straddles the page boundary
    pgm.write_virt(0, addr, &data, None).unwrap();

    let mut read_back = vec![0u8; data.len()];
    pgm.read_virt(0, addr, &mut read_back, None).unwrap();
    assert_eq!(read_back, data);

    // The bytes really landed in the two scattered physical pages.
    let mut tail = vec![0u8; 0x80];
    pgm.memory()
        .read_phys(GcPhys(DATA + 0x1000), &mut tail, None)
        .unwrap();
    assert_eq!(tail, data[0x80..]);
}

#[test]
fn virt_short_count_at_an_unmapped_page() {
    let mut pgm = engine_with_paging();
    map_page(&mut pgm, 0, DATA, LEAF_RW);
    // VA page 1 is not mapped.

    let mut buf = vec![0u8; 0x100];
    let addr = GcPtr(VA + 0xF80);

    assert!(matches!(
        pgm.read_virt(0, addr, &mut buf, None),
        Err(PgmError::NotMapped(_))
    ));

    let mut actual = 0usize;
    pgm.read_virt(0, addr, &mut buf, Some(&mut actual)).unwrap();
    assert_eq!(actual, 0x80);

    // A failure on the very first page is an error even with the
    // out-parameter.
    let mut actual = 0usize;
    assert!(
        pgm.read_virt(0, GcPtr(VA + 0x1000), &mut buf, Some(&mut actual))
            .is_err()
    );

    let mut actual = 0usize;
    pgm.write_virt(0, addr, &vec![0xAA; 0x100], Some(&mut actual))
        .unwrap();
    assert_eq!(actual, 0x80);
}

#[test]
fn translation_cache_is_dropped_on_invlpg() {
    let mut pgm = engine_with_paging();
    pgm.memory_mut()
        .write_phys(GcPhys(DATA + 0x3000), b"old", None)
        .unwrap();
    pgm.memory_mut()
        .write_phys(GcPhys(DATA + 0x5000), b"new", None)
        .unwrap();

    map_page(&mut pgm, 0, DATA + 0x3000, LEAF_RW);
    let mut buf = [0u8; 3];
    pgm.read_virt(0, GcPtr(VA), &mut buf, None).unwrap();
    assert_eq!(&buf, b"old");

    // The guest edits its PTE behind the debug interface's back; the
    // cached translation still serves.
    map_page(&mut pgm, 0, DATA + 0x5000, LEAF_RW);
    pgm.read_virt(0, GcPtr(VA), &mut buf, None).unwrap();
    assert_eq!(&buf, b"old");

    pgm.invalidate_page(0, GcPtr(VA)).unwrap();
    pgm.read_virt(0, GcPtr(VA), &mut buf, None).unwrap();
    assert_eq!(&buf, b"new");
}

#[test]
fn virtual_scan_matches_across_scattered_physical_pages() {
    let mut pgm = engine_with_paging();
    map_page(&mut pgm, 0, DATA + 0x3000, LEAF_RW);
    map_page(&mut pgm, 1, DATA + 0x1000, LEAF_RW);

    let needle = b"XYZQRS";
    pgm.write_virt(0, GcPtr(VA + 0xFFD), needle, None).unwrap();

    let hit = pgm
        .scan_virtual(0, GcPtr(VA), 2 * 0x1000, 1, needle)
        .unwrap();
    assert_eq!(hit, Some(GcPtr(VA + 0xFFD)));

    // Physically the needle is split across distant pages; a physical scan
    // cannot see it.
    assert_eq!(
        pgm.memory()
            .scan_physical(GcPhys(0), 16 * 1024 * 1024, 1, needle)
            .unwrap(),
        None
    );
}

#[test]
fn virtual_scan_skips_holes_and_honors_alignment() {
    let mut pgm = engine_with_paging();
    map_page(&mut pgm, 0, DATA, LEAF_RW);
    map_page(&mut pgm, 8, DATA + 0x8000, LEAF_RW);
    map_page(&mut pgm, 9, DATA + 0x9000, LEAF_RW);

    pgm.write_virt(0, GcPtr(VA + 0x8004), &[0xDE, 0xAD], None)
        .unwrap();
    pgm.write_virt(0, GcPtr(VA + 0x9010), &[0xDE, 0xAD], None)
        .unwrap();

    // 16-byte alignment skips the hit at +0x8004; the hole between pages 0
    // and 8 is crossed with skip hints.
    let hit = pgm
        .scan_virtual(0, GcPtr(VA), 4 * 1024 * 1024, 16, &[0xDE, 0xAD])
        .unwrap();
    assert_eq!(hit, Some(GcPtr(VA + 0x9010)));

    assert_eq!(
        pgm.scan_virtual(0, GcPtr(VA), 0x1000, 1, b"absent").unwrap(),
        None
    );
}

#[test]
fn access_dispatch_honors_the_handler_kind() {
    let mut pgm = engine();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();

    pgm.handlers_mut()
        .register(
            AccessHandlerKind::Write,
            GcPhys(0xC0000),
            GcPhys(0xC0FFF),
            Box::new(move |_, _| {
                hits2.fetch_add(1, Ordering::Relaxed);
                HandlerAction::Handled
            }),
            "rom shadow",
        )
        .unwrap();

    assert_eq!(
        pgm.dispatch_access(GcPhys(0xC0800), AccessKind::Write),
        HandlerAction::Handled
    );
    // Reads pass a write-only handler through.
    assert_eq!(
        pgm.dispatch_access(GcPhys(0xC0800), AccessKind::Read),
        HandlerAction::DoDefault
    );
    assert_eq!(
        pgm.dispatch_access(GcPhys(0xD0000), AccessKind::Write),
        HandlerAction::DoDefault
    );
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn write_fault_service_zaps_tracking_and_flags_tlb_flushes() {
    let mut pgm = engine_with_paging();
    pgm.memory_mut()
        .write_phys(GcPhys(DATA), &[1], None)
        .unwrap();
    pgm.memory_mut().write_monitor_page(GcPhys(DATA)).unwrap();

    let (pool, mem) = pgm.pool_and_memory_mut();
    let pt = pool.alloc(mem, PoolKind::PtPae, GcPhys(PT)).unwrap().idx;
    pool.write_entry(pt, 0, DATA | LEAF_RO).unwrap();
    pool.track_reference(mem, GcPhys(DATA), pt, 0).unwrap();

    pgm.vcpu_mut(0).unwrap().tlb_flush_pending = false;
    pgm.make_page_writable(GcPhys(DATA)).unwrap();

    assert_eq!(pgm.pool().entry(pt, 0).unwrap(), 0);
    let page = pgm.memory().page_at(GcPhys(DATA)).unwrap();
    assert_eq!(page.state(), PageState::Allocated);
    assert!(page.written_to());
    assert!(pgm.vcpu(0).unwrap().tlb_flush_pending);
}

#[test]
fn pool_exhaustion_is_serviced_by_the_flush_protocol() {
    let mut pgm = engine_with_paging();

    // Monitored shadow tables fill every free slot, so the next root
    // allocation cannot evict its way out.
    let (pool, mem) = pgm.pool_and_memory_mut();
    let mut gc_phys = 0x100_000u64;
    while pool.free_count() > 0 {
        let idx = pool.alloc(mem, PoolKind::PtPae, GcPhys(gc_phys)).unwrap().idx;
        pool.set_monitored(idx, true).unwrap();
        gc_phys += 0x1000;
    }

    pgm.switch_cr3(0, GcPhys(PML4 + 0x1000)).unwrap();

    assert_eq!(pgm.pool().flushes(), 1);
    assert_eq!(pgm.vcpu(0).unwrap().cr3(), GcPhys(PML4 + 0x1000));
    assert!(pgm.vcpu(0).unwrap().root().is_some());
    pgm.check_integrity().unwrap();
}

#[test]
fn shared_module_scan_runs_end_to_end() {
    struct MatchFirst;
    impl PageSharingService for MatchFirst {
        fn match_page(
            &mut self,
            _module: &SharedModule,
            _region: usize,
            _page: usize,
            _desc: &SharedPageDesc,
        ) -> Option<SharedPageMatch> {
            Some(SharedPageMatch {
                page_id: 0x8000_0001,
                hc_phys: pgm_core::HcPhys(0x7000_0000_0000),
            })
        }
    }

    let mut pgm = engine_with_paging();
    map_page(&mut pgm, 0, DATA, LEAF_RO);
    // Debug writes ignore the PTE write bit, so the read-only page can be
    // given content.
    pgm.write_virt(0, GcPtr(VA), b"dll text", None).unwrap();

    let idx = pgm
        .register_shared_module(SharedModule {
            name: "kernel32.dll".into(),
            version: "6.1".into(),
            regions: vec![SharedRegion {
                gc_ptr: GcPtr(VA),
                size: 0x1000,
            }],
        })
        .unwrap();

    let summary = pgm.scan_shared_module(0, idx, &mut MatchFirst).unwrap();
    assert_eq!(summary.pages_shared, 1);
    assert_eq!(pgm.memory().shared_pages(), 1);
    assert!(pgm.vcpu(0).unwrap().tlb_flush_pending);

    // Content still reads back through the shared backing.
    let mut buf = [0u8; 8];
    pgm.read_virt(0, GcPtr(VA), &mut buf, None).unwrap();
    assert_eq!(&buf, b"dll text");
}

#[test]
fn dump_wrappers_reflect_vcpu_state() {
    let mut pgm = engine_with_paging();
    map_page(&mut pgm, 0, DATA, LEAF_RW);
    pgm.memory_mut()
        .write_phys(GcPhys(DATA), &[1], None)
        .unwrap();

    let report = pgm
        .dump_guest_hierarchy(0, DumpFlags::PAGE_INFO, GcPtr(0), GcPtr(u64::MAX), 4)
        .unwrap();
    assert_eq!(report.leaves, 1);
    assert!(report.text.contains("4K"));
    assert!(report.text.contains("state=Allocated"));

    // The shadow root exists but holds no entries yet.
    let report = pgm
        .dump_shadow_hierarchy(0, DumpFlags::empty(), GcPtr(0), GcPtr(u64::MAX), 4)
        .unwrap();
    assert_eq!(report.leaves, 0);

    // Without paging there is nothing to dump on either side.
    let pgm = engine();
    assert!(
        pgm.dump_guest_hierarchy(0, DumpFlags::empty(), GcPtr(0), GcPtr(u64::MAX), 4)
            .is_err()
    );
    assert!(
        pgm.dump_shadow_hierarchy(0, DumpFlags::empty(), GcPtr(0), GcPtr(u64::MAX), 4)
            .is_err()
    );
}

#[test]
fn reset_rebuilds_the_pool_and_zeroes_ram() {
    let mut pgm = engine_with_paging();
    map_page(&mut pgm, 0, DATA, LEAF_RW);
    pgm.write_virt(0, GcPtr(VA), &[0x55; 32], None).unwrap();
    assert!(pgm.memory().private_pages() > 0);

    pgm.reset().unwrap();
    assert_eq!(pgm.memory().private_pages(), 0);
    assert_eq!(pgm.pool().flushes(), 1);
    // The VCPU re-entered its address space.
    assert!(pgm.vcpu(0).unwrap().root().is_some());
    pgm.check_integrity().unwrap();
}

#[test]
fn scan_parameter_validation() {
    let pgm = engine_with_paging();
    assert!(pgm.scan_virtual(0, GcPtr(VA), 0x1000, 3, b"x").is_err());
    assert!(pgm.scan_virtual(0, GcPtr(VA), 0x1000, 1, &[]).is_err());
    assert_eq!(pgm.scan_virtual(0, GcPtr(VA), 2, 1, b"long").unwrap(), None);
}
