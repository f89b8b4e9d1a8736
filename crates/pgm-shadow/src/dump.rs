use std::fmt::Write as _;

use pgm_arch_x86::{EptEntry, PagingMode, Pte32, Pte64, ReservedMasks, WalkLevel};
use pgm_core::{GcPhys, GcPtr, HcPhys, PgmError, PgmResult, PhysPageDirectory};

use crate::pool::ShadowPagePool;

bitflags::bitflags! {
    /// Control-register state and options for a hierarchy dump.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DumpFlags: u32 {
        /// CR4.PSE — 32-bit 4M pages are enabled.
        const PSE = 1 << 0;

        /// CR4.PAE — the hierarchy uses the PAE format.
        const PAE = 1 << 1;

        /// EFER.LMA — the hierarchy uses the long-mode format.
        const LME = 1 << 2;

        /// EFER.NXE — bit 63 is the no-execute bit, not reserved.
        const NXE = 1 << 3;

        /// The hierarchy is an EPT hierarchy.
        const EPT = 1 << 4;

        /// Dump the shadow hierarchy out of the pool instead of guest
        /// tables; the root is a pool synthetic address.
        const SHADOW = 1 << 5;

        /// Print the column legend first.
        const HEADER = 1 << 6;

        /// Print the root register value first.
        const PRINT_CR3 = 1 << 7;

        /// Append backing-page details to each leaf line.
        const PAGE_INFO = 1 << 8;
    }
}

impl DumpFlags {
    fn mode(self) -> PagingMode {
        if self.contains(Self::EPT) {
            PagingMode::Ept
        } else if self.contains(Self::LME) {
            PagingMode::Amd64
        } else if self.contains(Self::PAE) {
            PagingMode::Pae
        } else {
            PagingMode::Bit32
        }
    }
}

/// The output of a hierarchy dump.
#[derive(Debug)]
pub struct DumpReport {
    /// The formatted dump.
    pub text: String,

    /// Number of leaf entries encountered, including entries at the depth
    /// cutoff that were not descended into.
    pub leaves: u64,
}

/// Formats a page table hierarchy in a fixed-column layout.
///
/// The layout is part of the debug interface: one line per present entry,
/// addresses first, the decoded attribute columns aligned, reserved-bit
/// violations annotated at the end of the line. Not-present entries produce
/// no output.
pub struct HierarchyDumper<'a> {
    mem: &'a PhysPageDirectory,
    pool: Option<&'a ShadowPagePool>,
    flags: DumpFlags,
    mode: PagingMode,
    masks: ReservedMasks,
    first: GcPtr,
    last: GcPtr,
    leaves: u64,
}

impl<'a> HierarchyDumper<'a> {
    /// Creates a dumper for guest hierarchies.
    pub fn new(
        mem: &'a PhysPageDirectory,
        flags: DumpFlags,
        maxphyaddr: u32,
        first: GcPtr,
        last: GcPtr,
    ) -> PgmResult<Self> {
        if flags.contains(DumpFlags::SHADOW) {
            return Err(PgmError::InvalidParameter("shadow dump needs a pool"));
        }
        Self::build(mem, None, flags, maxphyaddr, first, last)
    }

    /// Creates a dumper that reads shadow hierarchies out of the pool.
    pub fn new_shadow(
        mem: &'a PhysPageDirectory,
        pool: &'a ShadowPagePool,
        flags: DumpFlags,
        maxphyaddr: u32,
        first: GcPtr,
        last: GcPtr,
    ) -> PgmResult<Self> {
        Self::build(mem, Some(pool), flags | DumpFlags::SHADOW, maxphyaddr, first, last)
    }

    fn build(
        mem: &'a PhysPageDirectory,
        pool: Option<&'a ShadowPagePool>,
        flags: DumpFlags,
        maxphyaddr: u32,
        first: GcPtr,
        last: GcPtr,
    ) -> PgmResult<Self> {
        if first > last {
            return Err(PgmError::InvalidParameter("inverted range"));
        }

        let mode = flags.mode();
        let masks = ReservedMasks::derive(mode, maxphyaddr, flags.contains(DumpFlags::NXE));
        Ok(Self {
            mem,
            pool,
            flags,
            mode,
            masks,
            first,
            last,
            leaves: 0,
        })
    }

    /// Dumps the hierarchy rooted at `cr3` (or the EPT pointer, or a pool
    /// synthetic address for shadow dumps), descending at most `max_depth`
    /// levels. Present entries at the cutoff are counted but not entered.
    pub fn dump(mut self, cr3: u64, max_depth: u8) -> PgmResult<DumpReport> {
        let mut text = String::new();

        if self.flags.contains(DumpFlags::PRINT_CR3) {
            let label = match self.mode {
                PagingMode::Ept => "eptp",
                _ => "cr3",
            };
            let _ = writeln!(text, "{label}={cr3:016x}");
        }
        if self.flags.contains(DumpFlags::HEADER) {
            let _ = match self.mode {
                PagingMode::Ept => writeln!(
                    text,
                    "Address          Lv | RWX MT I A D Size Physical"
                ),
                PagingMode::Bit32 => writeln!(
                    text,
                    "Address  Lv | P RW US A D G WT CD Size Physical"
                ),
                _ => writeln!(
                    text,
                    "Address          Lv | P RW US A D G WT CD AT NX Size Physical"
                ),
            };
        }

        if max_depth == 0 {
            return Ok(DumpReport {
                text,
                leaves: 0,
            });
        }

        let root_level = self.mode.root_level();
        let root = match self.mode {
            PagingMode::Ept => cr3 & !0xFFFu64,
            _ => self.mode.root_base(GcPhys(cr3)).0,
        };
        self.dump_table(&mut text, root, root_level, 0, max_depth)?;

        Ok(DumpReport {
            text,
            leaves: self.leaves,
        })
    }

    fn dump_table(
        &mut self,
        text: &mut String,
        table: u64,
        level: WalkLevel,
        va_base: u64,
        depth_left: u8,
    ) -> PgmResult<()> {
        let entries = self.mode.entries(level);
        let shift = self.mode.shift(level);
        let span = 1u64 << shift;

        for idx in 0..entries {
            let mut va = va_base.wrapping_add(idx << shift);
            if self.mode == PagingMode::Amd64 && level == WalkLevel::Pml4 && idx >= 256 {
                va |= 0xFFFF_0000_0000_0000;
            }

            // Range clip, inclusive on both ends.
            if va.wrapping_add(span - 1) < self.first.0 || va > self.last.0 {
                continue;
            }

            let Some(raw) = self.read_entry(table, idx) else {
                // The table itself is gone; one line, not one per entry.
                let _ = writeln!(
                    text,
                    "{}table at {table:016x} is not readable",
                    self.addr_col(va)
                );
                return Ok(());
            };
            if !self.entry_present(raw) {
                continue;
            }

            let leaf = self.entry_is_leaf(raw, level);
            if leaf || depth_left == 1 {
                self.leaves += 1;
            }

            self.print_entry(text, va, level, raw, leaf);

            if !leaf && depth_left > 1 {
                let child = self.entry_next(raw, level, false);
                if self.table_readable(child) {
                    self.dump_table(text, child, level.next().ok_or(
                        PgmError::Corruption("leafless bottom level"),
                    )?, va, depth_left - 1)?;
                } else {
                    let _ = writeln!(text, "{}invalid: {raw:016x}", self.addr_col(va));
                }
            }
        }

        Ok(())
    }

    fn addr_col(&self, va: u64) -> String {
        match self.mode {
            PagingMode::Bit32 => format!("{:08x} ", va),
            _ => format!("{:016x} ", va),
        }
    }

    fn entry_present(&self, raw: u64) -> bool {
        match self.mode {
            PagingMode::Ept => raw & 0x7 != 0,
            _ => raw & 1 != 0,
        }
    }

    fn entry_is_leaf(&self, raw: u64, level: WalkLevel) -> bool {
        if level == WalkLevel::Pt {
            return true;
        }
        if !self.mode.can_be_leaf(level) {
            return false;
        }
        match self.mode {
            PagingMode::Bit32 => self.flags.contains(DumpFlags::PSE) && Pte32(raw as u32).large(),
            PagingMode::Ept => EptEntry(raw).large(),
            _ => Pte64(raw).large(),
        }
    }

    fn entry_next(&self, raw: u64, level: WalkLevel, leaf: bool) -> u64 {
        match self.mode {
            PagingMode::Bit32 => {
                let pte = Pte32(raw as u32);
                if leaf && level == WalkLevel::Pd {
                    pte.pfn_4m().gc_phys().0
                } else {
                    pte.pfn().gc_phys().0
                }
            }
            PagingMode::Ept => EptEntry(raw).pfn().gc_phys().0,
            _ => Pte64(raw).pfn().gc_phys().0,
        }
    }

    fn size_label(&self, level: WalkLevel, leaf: bool) -> &'static str {
        if leaf {
            match (self.mode, level) {
                (_, WalkLevel::Pt) => "4K  ",
                (PagingMode::Bit32, _) => "4M  ",
                (_, WalkLevel::Pd) => "2M  ",
                _ => "1G  ",
            }
        } else {
            match level {
                WalkLevel::Pml4 => "PDPT",
                WalkLevel::Pdpt => "PD  ",
                WalkLevel::Pd => "PT  ",
                WalkLevel::Pt => "??  ",
            }
        }
    }

    fn print_entry(&mut self, text: &mut String, va: u64, level: WalkLevel, raw: u64, leaf: bool) {
        let size = self.size_label(level, leaf);
        let phys = self.entry_next(raw, level, leaf);
        let violation = self.masks.violation(level, leaf, raw);

        match self.mode {
            PagingMode::Ept => {
                let e = EptEntry(raw);
                let _ = write!(
                    text,
                    "{}{} | {}{}{} {}  {} {} {} {size} {phys:016x}",
                    self.addr_col(va),
                    level.number(),
                    if e.read() { 'R' } else { '-' },
                    if e.write() { 'W' } else { '-' },
                    if e.execute() { 'X' } else { '-' },
                    if leaf { e.memory_type() } else { 0 },
                    if e.ignore_pat() { 'I' } else { '-' },
                    if e.accessed() { 'A' } else { '-' },
                    if e.dirty() { 'D' } else { '-' },
                );
            }

            PagingMode::Bit32 => {
                let e = Pte32(raw as u32);
                let _ = write!(
                    text,
                    "{}{} | P {} {}  {} {} {} {} {} {size} {phys:016x}",
                    self.addr_col(va),
                    level.number(),
                    if e.write() { 'W' } else { 'R' },
                    if e.user() { 'U' } else { 'S' },
                    if e.accessed() { 'A' } else { '-' },
                    if e.dirty() { 'D' } else { '-' },
                    if e.global() { 'G' } else { '-' },
                    if e.write_through() { "WT" } else { "--" },
                    if e.cache_disable() { "CD" } else { "--" },
                );
            }

            _ => {
                let e = Pte64(raw);
                let _ = write!(
                    text,
                    "{}{} | P {} {}  {} {} {} {} {} {} {} {size} {phys:016x}",
                    self.addr_col(va),
                    level.number(),
                    if e.write() { 'W' } else { 'R' },
                    if e.user() { 'U' } else { 'S' },
                    if e.accessed() { 'A' } else { '-' },
                    if e.dirty() { 'D' } else { '-' },
                    if e.global() { 'G' } else { '-' },
                    if e.write_through() { "WT" } else { "--" },
                    if e.cache_disable() { "CD" } else { "--" },
                    if e.pat() { "AT" } else { "--" },
                    if e.no_execute() { "NX" } else { "--" },
                );
            }
        }

        // The annotated window belongs to the PAE and long-mode entry
        // layouts; the other formats reserve only low bits.
        if violation != 0 && matches!(self.mode, PagingMode::Pae | PagingMode::Amd64) {
            let _ = write!(text, " 62:52={:03x}!", (raw >> 52) & 0x7FF);
        }

        if leaf && self.flags.contains(DumpFlags::PAGE_INFO) {
            match self.mem.page_at(GcPhys(phys)) {
                Ok(page) => {
                    let _ = write!(
                        text,
                        "  idx={:#x} state={:?} type={:?}",
                        page.page_id(),
                        page.state(),
                        page.page_type(),
                    );
                }
                Err(_) => {
                    let _ = write!(text, "  unbacked");
                }
            }
        }

        text.push('\n');
    }

    fn read_entry(&self, table: u64, idx: u64) -> Option<u64> {
        if self.flags.contains(DumpFlags::SHADOW) {
            let pool = self.pool?;
            let page = pool.page_by_hc_phys(HcPhys(table))?;
            return pool.entry(page, idx as u16).ok();
        }

        let addr = GcPhys(table + idx * self.mode.entry_size());
        match self.mode {
            PagingMode::Bit32 => self.mem.read_u32(addr).ok().map(u64::from),
            _ => self.mem.read_u64(addr).ok(),
        }
    }

    fn table_readable(&self, table: u64) -> bool {
        if self.flags.contains(DumpFlags::SHADOW) {
            return self
                .pool
                .and_then(|pool| pool.page_by_hc_phys(HcPhys(table)))
                .is_some();
        }
        self.mem.read_u32(GcPhys(table)).is_ok()
    }
}

#[cfg(test)]
#[path = "dump_tests.rs"]
mod dump_tests;
