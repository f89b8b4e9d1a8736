use pgm_core::{GcPhys, GcPtr, PhysPageDirectory};

use super::{DumpFlags, HierarchyDumper};
use crate::pool::{PoolKind, ShadowPagePool};

const PML4: u64 = 0x10_000;
const PDPT: u64 = 0x11_000;
const PD: u64 = 0x12_000;
const PT: u64 = 0x13_000;
const DATA: u64 = 0x20_000;
const VA: u64 = 0x40_0000;

const TABLE_FLAGS: u64 = 0x7;

fn amd64_fixture() -> PhysPageDirectory {
    let mut mem = PhysPageDirectory::new();
    mem.register_ram(GcPhys(0), 16 * 1024 * 1024, "test ram").unwrap();

    mem.write_u64(GcPhys(PML4), PDPT | TABLE_FLAGS).unwrap();
    mem.write_u64(GcPhys(PDPT), PD | TABLE_FLAGS).unwrap();
    mem.write_u64(GcPhys(PD + 2 * 8), PT | TABLE_FLAGS).unwrap();
    mem
}

fn full_range() -> (GcPtr, GcPtr) {
    (GcPtr(0), GcPtr(u64::MAX))
}

#[test]
fn amd64_dump_has_one_line_per_present_entry() {
    let mut mem = amd64_fixture();
    // One read-only user page, one writable no-execute page.
    mem.write_u64(GcPhys(PT), DATA | 0x5).unwrap();
    mem.write_u64(GcPhys(PT + 8), (DATA + 0x1000) | 0x3 | (1 << 63))
        .unwrap();

    let (first, last) = full_range();
    let report = HierarchyDumper::new(
        &mem,
        DumpFlags::LME | DumpFlags::NXE,
        48,
        first,
        last,
    )
    .unwrap()
    .dump(PML4, 4)
    .unwrap();

    assert_eq!(report.leaves, 2);

    let lines: Vec<&str> = report.text.lines().collect();
    // Root, PDPT, PD, then the two leaves.
    assert_eq!(lines.len(), 5);
    assert!(lines[0].starts_with("0000000000000000 4 | P W U"));
    assert!(lines[3].contains("0000000000400000 1 | P R U"));
    assert!(lines[3].contains("4K"));
    assert!(lines[3].ends_with(&format!("{DATA:016x}")));
    assert!(lines[4].contains("P W S"));
    assert!(lines[4].contains("NX"));
}

#[test]
fn depth_cutoff_counts_entries_without_descending() {
    let mut mem = amd64_fixture();
    mem.write_u64(GcPhys(PT), DATA | 0x5).unwrap();

    let (first, last) = full_range();
    let report = HierarchyDumper::new(&mem, DumpFlags::LME, 48, first, last)
        .unwrap()
        .dump(PML4, 1)
        .unwrap();

    assert_eq!(report.leaves, 1);
    assert_eq!(report.text.lines().count(), 1);
    assert!(!report.text.contains("4K"));
}

#[test]
fn reserved_bits_are_annotated_inline() {
    let mut mem = amd64_fixture();
    // Bit 50 is above a 48-bit MAXPHYADDR. The annotated window covers
    // bits 62:52; the trailing '!' marks the violation.
    mem.write_u64(GcPhys(PT), DATA | 0x5 | (1 << 50)).unwrap();

    let (first, last) = full_range();
    let report = HierarchyDumper::new(&mem, DumpFlags::LME | DumpFlags::NXE, 48, first, last)
        .unwrap()
        .dump(PML4, 4)
        .unwrap();

    assert!(report.text.contains(" 62:52=000!"));
}

#[test]
fn reserved_annotation_is_limited_to_the_long_mode_formats() {
    let mut mem = PhysPageDirectory::new();
    mem.register_ram(GcPhys(0), 16 * 1024 * 1024, "test ram").unwrap();

    let pd = 0x10_000u64;
    // A 4M PSE page with bit 17 set, reserved in the 32-bit format.
    mem.write_u64(GcPhys(pd), 0x0080_0000 | (1 << 17) | (1 << 7) | 0x3)
        .unwrap();

    let (first, last) = full_range();
    let report = HierarchyDumper::new(&mem, DumpFlags::PSE, 48, first, last)
        .unwrap()
        .dump(pd, 2)
        .unwrap();
    assert_eq!(report.leaves, 1);
    assert!(!report.text.contains("62:52"));

    // Same for EPT: a memory type on a non-leaf link is reserved, but the
    // 62:52 window belongs to the PAE and long-mode formats.
    let mut mem = amd64_fixture();
    mem.write_u64(GcPhys(PD + 2 * 8), PT | TABLE_FLAGS | (6 << 3)).unwrap();
    mem.write_u64(GcPhys(PT), DATA | 0x7).unwrap();

    let report = HierarchyDumper::new(&mem, DumpFlags::EPT, 48, first, last)
        .unwrap()
        .dump(PML4, 4)
        .unwrap();
    assert!(!report.text.contains("62:52"));
}

#[test]
fn range_clip_limits_the_output() {
    let mut mem = amd64_fixture();
    mem.write_u64(GcPhys(PT), DATA | 0x5).unwrap();
    mem.write_u64(GcPhys(PT + 8), (DATA + 0x1000) | 0x5).unwrap();

    let report = HierarchyDumper::new(
        &mem,
        DumpFlags::LME,
        48,
        GcPtr(VA + 0x1000),
        GcPtr(VA + 0x1FFF),
    )
    .unwrap()
    .dump(PML4, 4)
    .unwrap();

    assert_eq!(report.leaves, 1);
    assert!(report.text.contains("0000000000401000 1"));
    assert!(!report.text.contains("0000000000400000 1"));
}

#[test]
fn bit32_dump_decodes_pse_large_pages() {
    let mut mem = PhysPageDirectory::new();
    mem.register_ram(GcPhys(0), 16 * 1024 * 1024, "test ram").unwrap();

    let pd = 0x10_000u64;
    let pt = 0x11_000u64;
    // Entry 0: a 4M PSE page at 8M. Entry 1: a page table with one 4K page.
    mem.write_u64(GcPhys(pd), 0x0080_0000 | (1 << 7) | 0x3).unwrap();
    mem.write_u64(GcPhys(pd + 4), pt | 0x3).unwrap();
    mem.write_u64(GcPhys(pt), DATA | 0x3).unwrap();

    let (first, last) = full_range();
    let report = HierarchyDumper::new(&mem, DumpFlags::PSE, 48, first, last)
        .unwrap()
        .dump(pd, 2)
        .unwrap();

    assert_eq!(report.leaves, 2);
    assert!(report.text.contains("00000000 2 | P W S"));
    assert!(report.text.contains("4M"));
    assert!(report.text.contains("00400000 1 | P W S"));
}

#[test]
fn ept_dump_shows_permission_triplets() {
    let mut mem = amd64_fixture();
    // Reuse the table chain as an EPT hierarchy: RWX links, one leaf with
    // write-back memory type.
    mem.write_u64(GcPhys(PT), DATA | 0x7 | (6 << 3)).unwrap();

    let (first, last) = full_range();
    let report = HierarchyDumper::new(&mem, DumpFlags::EPT, 48, first, last)
        .unwrap()
        .dump(PML4, 4)
        .unwrap();

    assert_eq!(report.leaves, 1);
    assert!(report.text.contains("RWX 6"));
}

#[test]
fn header_and_root_register_are_printed_on_request() {
    let mem = amd64_fixture();
    let (first, last) = full_range();
    let report = HierarchyDumper::new(
        &mem,
        DumpFlags::LME | DumpFlags::HEADER | DumpFlags::PRINT_CR3,
        48,
        first,
        last,
    )
    .unwrap()
    .dump(PML4, 4)
    .unwrap();

    let lines: Vec<&str> = report.text.lines().collect();
    assert_eq!(lines[0], format!("cr3={PML4:016x}"));
    assert!(lines[1].starts_with("Address"));
}

#[test]
fn shadow_dump_reads_tables_out_of_the_pool() {
    let mut mem = amd64_fixture();
    let mut pool = ShadowPagePool::new(16, true).unwrap();

    let pml4 = pool.alloc(&mut mem, PoolKind::Pml4, GcPhys(PML4)).unwrap().idx;
    let pdpt = pool.alloc(&mut mem, PoolKind::Pdpt, GcPhys(PDPT)).unwrap().idx;
    let pd = pool.alloc(&mut mem, PoolKind::PdPae, GcPhys(PD)).unwrap().idx;
    let pt = pool.alloc(&mut mem, PoolKind::PtPae, GcPhys(PT)).unwrap().idx;

    pool.write_entry(pml4, 0, pool.hc_phys_of(pdpt).0 | TABLE_FLAGS).unwrap();
    pool.write_entry(pdpt, 0, pool.hc_phys_of(pd).0 | TABLE_FLAGS).unwrap();
    pool.write_entry(pd, 2, pool.hc_phys_of(pt).0 | TABLE_FLAGS).unwrap();
    pool.write_entry(pt, 0, DATA | 0x5).unwrap();

    let (first, last) = full_range();
    let report = HierarchyDumper::new_shadow(&mem, &pool, DumpFlags::LME, 52, first, last)
        .unwrap()
        .dump(pool.hc_phys_of(pml4).0, 4)
        .unwrap();

    assert_eq!(report.leaves, 1);
    assert!(report.text.contains("0000000000400000 1 | P R U"));
    assert!(report.text.ends_with(&format!("{DATA:016x}\n")));
}
