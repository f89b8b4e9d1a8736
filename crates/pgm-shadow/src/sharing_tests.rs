use pgm_arch_x86::{PagingMode, ReservedMasks, WalkConfig};
use pgm_core::{GcPhys, GcPtr, HcPhys, PageState, PgmError, PhysPageDirectory, TrackingRef};

use super::{
    AdoptOutcome, PageSharingEngine, PageSharingService, SharedModule, SharedPageDesc,
    SharedPageMatch, SharedRegion, adopt_shared_copy,
};
use crate::pool::{PhysInvalidation, PoolKind, ShadowPagePool};

const PML4: u64 = 0x10_000;
const PDPT: u64 = 0x11_000;
const PD: u64 = 0x12_000;
const PT: u64 = 0x13_000;
const DATA: u64 = 0x20_000;
const VA: u64 = 0x40_0000;

const TABLE_FLAGS: u64 = 0x7; // P | RW | US
const LEAF_RO: u64 = 0x5; // P | US
const LEAF_RW: u64 = 0x7;

fn fixture() -> (PhysPageDirectory, WalkConfig) {
    let mut mem = PhysPageDirectory::new();
    mem.register_ram(GcPhys(0), 16 * 1024 * 1024, "test ram").unwrap();

    mem.write_u64(GcPhys(PML4), PDPT | TABLE_FLAGS).unwrap();
    mem.write_u64(GcPhys(PDPT), PD | TABLE_FLAGS).unwrap();
    // VA 4M lives in PD entry 2.
    mem.write_u64(GcPhys(PD + 2 * 8), PT | TABLE_FLAGS).unwrap();

    let config = WalkConfig {
        mode: PagingMode::Amd64,
        cr3: GcPhys(PML4),
        pse: false,
        nx: false,
        a20: true,
        masks: ReservedMasks::derive(PagingMode::Amd64, 48, false),
    };
    (mem, config)
}

fn map_page(mem: &mut PhysPageDirectory, n: u64, flags: u64) {
    mem.write_u64(GcPhys(PT + n * 8), (DATA + n * 0x1000) | flags)
        .unwrap();
}

/// Writes to the data page so it leaves the zero state.
fn allocate(mem: &mut PhysPageDirectory, n: u64) {
    mem.write_phys(GcPhys(DATA + n * 0x1000), &[n as u8 + 1; 16], None)
        .unwrap();
}

fn module(pages: u64) -> SharedModule {
    SharedModule {
        name: "ntdll.dll".into(),
        version: "10.0.19041".into(),
        regions: vec![SharedRegion {
            gc_ptr: GcPtr(VA),
            size: pages * 0x1000,
        }],
    }
}

/// Matches every offer with a distinct shared copy.
#[derive(Default)]
struct MatchAll {
    offers: Vec<SharedPageDesc>,
}

impl PageSharingService for MatchAll {
    fn match_page(
        &mut self,
        _module: &SharedModule,
        _region: usize,
        _page: usize,
        desc: &SharedPageDesc,
    ) -> Option<SharedPageMatch> {
        self.offers.push(*desc);
        Some(SharedPageMatch {
            page_id: 0x8000_0000 + self.offers.len() as u32,
            hc_phys: HcPhys(0x7000_0000_0000 + self.offers.len() as u64 * 0x1000),
        })
    }
}

#[test]
fn only_readonly_private_pages_are_offered() {
    let (mut mem, config) = fixture();
    let mut pool = ShadowPagePool::new(16, true).unwrap();

    map_page(&mut mem, 0, LEAF_RO);
    allocate(&mut mem, 0);
    map_page(&mut mem, 1, LEAF_RW);
    allocate(&mut mem, 1);
    map_page(&mut mem, 2, LEAF_RO); // stays a zero page

    let mut engine = PageSharingEngine::new();
    let idx = engine.register_module(module(3)).unwrap();
    let private_backing = mem.page_at(GcPhys(DATA)).unwrap().hc_phys();

    let mut service = MatchAll::default();
    let summary = engine
        .scan_module(&mut mem, &mut pool, config, idx, &mut service)
        .unwrap();

    assert_eq!(summary.pages_offered, 1);
    assert_eq!(summary.pages_shared, 1);
    assert_eq!(summary.pages_skipped, 2);
    assert!(summary.pending.tlb_flush_all);
    assert!(!summary.pending.pool_flush);

    // The offer identifies the private backing being replaced.
    assert_eq!(service.offers.len(), 1);
    assert_eq!(service.offers[0].gc_ptr, GcPtr(VA));
    assert_eq!(service.offers[0].gc_phys, GcPhys(DATA));
    assert_eq!(service.offers[0].hc_phys, private_backing);

    let shared = mem.page_at(GcPhys(DATA)).unwrap();
    assert_eq!(shared.state(), PageState::Shared);
    assert_eq!(mem.shared_pages(), 1);

    // The writable neighbor kept its private backing.
    assert_eq!(
        mem.page_at(GcPhys(DATA + 0x1000)).unwrap().state(),
        PageState::Allocated
    );
}

#[test]
fn unmapped_stretches_are_crossed_with_skip_hints() {
    let (mut mem, config) = fixture();
    let mut pool = ShadowPagePool::new(16, true).unwrap();

    map_page(&mut mem, 0, LEAF_RO);
    allocate(&mut mem, 0);
    // The rest of the 4M region, including the whole absent PD entry 3, is
    // unmapped.

    let mut engine = PageSharingEngine::new();
    let idx = engine.register_module(module(1024)).unwrap();

    let mut service = MatchAll::default();
    let summary = engine
        .scan_module(&mut mem, &mut pool, config, idx, &mut service)
        .unwrap();
    assert_eq!(summary.pages_offered, 1);
    assert_eq!(summary.pages_shared, 1);
}

#[test]
fn adoption_rechecks_the_mapping_before_mutating() {
    let (mut mem, config) = fixture();
    let mut pool = ShadowPagePool::new(16, true).unwrap();

    map_page(&mut mem, 0, LEAF_RO);
    allocate(&mut mem, 0);

    // The page was a valid candidate, but the guest made it writable before
    // the adoption went through.
    map_page(&mut mem, 0, LEAF_RW);

    let outcome = adopt_shared_copy(
        &mut mem,
        &mut pool,
        config,
        GcPtr(VA),
        GcPhys(DATA),
        SharedPageMatch {
            page_id: 0x9000_0000,
            hc_phys: HcPhys(0x7000_0000_0000),
        },
    )
    .unwrap();

    assert_eq!(outcome, AdoptOutcome::Rejected);
    assert_eq!(mem.page_at(GcPhys(DATA)).unwrap().state(), PageState::Allocated);
    assert_eq!(mem.shared_pages(), 0);
}

#[test]
fn adoption_rejects_a_remapped_translation() {
    let (mut mem, config) = fixture();
    let mut pool = ShadowPagePool::new(16, true).unwrap();

    map_page(&mut mem, 0, LEAF_RO);
    allocate(&mut mem, 0);
    // Remapped to a different frame since the candidate was selected.
    mem.write_u64(GcPhys(PT), (DATA + 0x5000) | LEAF_RO).unwrap();

    let outcome = adopt_shared_copy(
        &mut mem,
        &mut pool,
        config,
        GcPtr(VA),
        GcPhys(DATA),
        SharedPageMatch {
            page_id: 0x9000_0000,
            hc_phys: HcPhys(0x7000_0000_0000),
        },
    )
    .unwrap();
    assert_eq!(outcome, AdoptOutcome::Rejected);
}

#[test]
fn backing_swap_invalidates_shadow_tracking() {
    let (mut mem, config) = fixture();
    let mut pool = ShadowPagePool::new(16, true).unwrap();

    map_page(&mut mem, 0, LEAF_RO);
    allocate(&mut mem, 0);

    // A shadow PT maps the old backing.
    let pt = pool
        .alloc(&mut mem, PoolKind::PtPae, GcPhys(PT))
        .unwrap()
        .idx;
    pool.write_entry(pt, 0, DATA | LEAF_RO).unwrap();
    pool.track_reference(&mut mem, GcPhys(DATA), pt, 0).unwrap();

    let outcome = adopt_shared_copy(
        &mut mem,
        &mut pool,
        config,
        GcPtr(VA),
        GcPhys(DATA),
        SharedPageMatch {
            page_id: 0x9000_0000,
            hc_phys: HcPhys(0x7000_0000_0000),
        },
    )
    .unwrap();

    assert_eq!(
        outcome,
        AdoptOutcome::Shared {
            invalidation: PhysInvalidation::Zapped(1)
        }
    );
    assert_eq!(pool.entry(pt, 0).unwrap(), 0);
    assert_eq!(mem.page_at(GcPhys(DATA)).unwrap().tracking(), TrackingRef::None);
}

#[test]
fn writing_a_shared_page_breaks_the_sharing() {
    let (mut mem, config) = fixture();
    let mut pool = ShadowPagePool::new(16, true).unwrap();

    map_page(&mut mem, 0, LEAF_RO);
    allocate(&mut mem, 0);

    let mut engine = PageSharingEngine::new();
    let idx = engine.register_module(module(1)).unwrap();
    let mut service = MatchAll::default();
    engine
        .scan_module(&mut mem, &mut pool, config, idx, &mut service)
        .unwrap();
    assert_eq!(mem.shared_pages(), 1);

    mem.write_phys(GcPhys(DATA), &[0xFF], None).unwrap();
    let page = mem.page_at(GcPhys(DATA)).unwrap();
    assert_eq!(page.state(), PageState::Allocated);
    assert_eq!(mem.shared_pages(), 0);
}

#[test]
fn module_registration_validates_regions() {
    let mut engine = PageSharingEngine::new();

    let mut bad = module(1);
    bad.regions[0].size = 0x123;
    assert!(matches!(
        engine.register_module(bad),
        Err(PgmError::InvalidParameter(_))
    ));

    let mut bad = module(1);
    bad.regions[0].gc_ptr = GcPtr(VA + 5);
    assert!(matches!(
        engine.register_module(bad),
        Err(PgmError::InvalidParameter(_))
    ));

    let idx = engine.register_module(module(2)).unwrap();
    let removed = engine.unregister_module(idx).unwrap();
    assert_eq!(removed.name, "ntdll.dll");
    assert!(engine.modules().is_empty());
}
