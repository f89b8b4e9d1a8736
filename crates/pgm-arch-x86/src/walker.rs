use smallvec::SmallVec;

use pgm_core::{GcPhys, GcPtr, MemoryAccess, PAGE_SHIFT, PhysPageDirectory};

use crate::{
    entry::{EptEntry, Pte32, Pte64},
    paging::{CANONICAL_HIGH_BASE, PagingMode, ReservedMasks, WalkLevel, is_canonical},
};

bitflags::bitflags! {
    /// Effective translation flags accumulated over a walk.
    ///
    /// Write and user are the AND over all traversed levels, no-execute the
    /// OR; accessed/dirty/global come from the leaf entry.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct WalkFlags: u32 {
        /// The mapping is writable at every level.
        const WRITE = 1 << 0;

        /// The mapping is user-accessible at every level.
        const USER = 1 << 1;

        /// Instruction fetches are disallowed at some level.
        const NO_EXECUTE = 1 << 2;

        /// The leaf entry has been accessed.
        const ACCESSED = 1 << 3;

        /// The leaf entry is dirty.
        const DIRTY = 1 << 4;

        /// The leaf entry is global.
        const GLOBAL = 1 << 5;

        /// The leaf maps a large page.
        const LARGE = 1 << 6;
    }
}

/// A successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkInfo {
    /// The translated guest physical address.
    pub gc_phys: GcPhys,

    /// The level of the leaf entry (1 = 4K, 2 = 2M/4M, 3 = 1G).
    pub level: WalkLevel,

    /// The effective flags over the whole path.
    pub flags: WalkFlags,

    /// The raw leaf entry value.
    pub raw_leaf: u64,
}

impl WalkInfo {
    /// The effective permissions of the mapping.
    pub fn access(&self) -> MemoryAccess {
        let mut access = MemoryAccess::R;
        access.set(MemoryAccess::W, self.flags.contains(WalkFlags::WRITE));
        access.set(MemoryAccess::X, !self.flags.contains(WalkFlags::NO_EXECUTE));
        access
    }
}

/// The outcome of a guest page table walk.
///
/// Failures carry the number of 4K pages a scanning caller may skip without
/// missing a mapping: the remaining span of the entry that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// The address is mapped.
    Mapped(WalkInfo),

    /// The entry at the given level is not present.
    NotPresent {
        /// The level at which the walk stopped.
        level: WalkLevel,

        /// Pages until the end of the failing entry's span.
        pages_skip: u64,
    },

    /// The entry at the given level sets must-be-zero bits.
    ReservedBits {
        /// The level at which the walk stopped.
        level: WalkLevel,

        /// Pages until the end of the failing entry's span.
        pages_skip: u64,
    },

    /// The root table itself cannot be read; nothing in this address space
    /// is mapped.
    RootNotPresent,

    /// The address violates the long-mode canonical form. Distinct from
    /// "not present".
    NotCanonical {
        /// Pages until the far edge of the non-canonical hole.
        pages_skip: u64,
    },
}

impl WalkOutcome {
    /// Whether the walk reached a mapped leaf.
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }

    /// The number of 4K pages a sequential scan may advance by.
    pub fn pages_skip(&self) -> u64 {
        match *self {
            Self::Mapped(_) => 1,
            Self::NotPresent { pages_skip, .. } => pages_skip,
            Self::ReservedBits { pages_skip, .. } => pages_skip,
            Self::RootNotPresent => u64::MAX,
            Self::NotCanonical { pages_skip } => pages_skip,
        }
    }
}

/// The fixed inputs of a walk: mode, root, and the control-register state
/// that shapes entry interpretation.
#[derive(Debug, Clone, Copy)]
pub struct WalkConfig {
    /// The active paging mode.
    pub mode: PagingMode,

    /// The root table register (CR3, or the EPT pointer).
    pub cr3: GcPhys,

    /// CR4.PSE — whether 32-bit 4M pages are enabled.
    pub pse: bool,

    /// EFER.NXE — whether the no-execute bit is honored.
    pub nx: bool,

    /// The A20 gate; when masked, physical bit 20 is forced clear.
    pub a20: bool,

    /// The per-mode reserved-bit masks.
    pub masks: ReservedMasks,
}

impl WalkConfig {
    fn apply_a20(&self, gc_phys: GcPhys) -> GcPhys {
        if self.a20 {
            gc_phys
        } else {
            gc_phys & !(1u64 << 20)
        }
    }
}

/// A mode-normalized view of one page table entry.
#[derive(Debug, Clone, Copy)]
struct EntryView {
    present: bool,
    write: bool,
    user: bool,
    nx: bool,
    large: bool,
    accessed: bool,
    dirty: bool,
    global: bool,
    raw: u64,
    /// Physical base of the next table, or of the leaf frame.
    next: GcPhys,
}

/// One resolved upper level, kept for incremental re-walks.
#[derive(Debug, Clone, Copy)]
struct CachedLevel {
    level: WalkLevel,
    table: GcPhys,
    /// First address covered by `table`.
    va_base: GcPtr,
    /// log2 of the span `table` covers.
    span_shift: u32,
}

/// Walks guest page tables through the physical page directory, producing
/// translation results and skip-ahead hints.
///
/// [`walk_next`](Self::walk_next) reuses already-resolved upper levels while
/// the address stays within the same upper-level entry, which turns a
/// sequential scan of a large range into one table read per 4K step instead
/// of a full descent.
pub struct GuestPageWalker<'a> {
    mem: &'a PhysPageDirectory,
    config: WalkConfig,
    cache: SmallVec<[CachedLevel; 4]>,
}

impl<'a> GuestPageWalker<'a> {
    /// Creates a walker over the given directory.
    pub fn new(mem: &'a PhysPageDirectory, config: WalkConfig) -> Self {
        Self {
            mem,
            config,
            cache: SmallVec::new(),
        }
    }

    /// The walk configuration.
    pub fn config(&self) -> &WalkConfig {
        &self.config
    }

    /// Drops the cached upper levels, e.g. after a guest table edit.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    /// Performs a full walk from the root.
    pub fn walk(&mut self, addr: GcPtr) -> WalkOutcome {
        self.cache.clear();

        if let Some(outcome) = self.check_canonical(addr) {
            return outcome;
        }

        let root_level = self.config.mode.root_level();
        let root = self
            .config
            .apply_a20(self.config.mode.root_base(self.config.cr3));
        self.descend(addr, root_level, root)
    }

    /// Performs an incremental walk, reusing resolved upper levels when the
    /// address stays inside their span.
    pub fn walk_next(&mut self, addr: GcPtr) -> WalkOutcome {
        if let Some(outcome) = self.check_canonical(addr) {
            self.cache.clear();
            return outcome;
        }

        // Deepest cached table still covering the address.
        let mut resume = None;
        for (i, cached) in self.cache.iter().enumerate() {
            let span_base = GcPtr(addr.0 & !((1u64 << cached.span_shift) - 1));
            if span_base == cached.va_base {
                resume = Some(i);
            } else {
                break;
            }
        }

        match resume {
            Some(i) => {
                let cached = self.cache[i];
                self.cache.truncate(i);
                self.descend(addr, cached.level, cached.table)
            }
            None => self.walk(addr),
        }
    }

    fn check_canonical(&self, addr: GcPtr) -> Option<WalkOutcome> {
        if self.config.mode.requires_canonical() && !is_canonical(addr) {
            let pages_skip = (CANONICAL_HIGH_BASE.saturating_sub(addr.0)) >> PAGE_SHIFT;
            return Some(WalkOutcome::NotCanonical {
                pages_skip: pages_skip.max(1),
            });
        }
        None
    }

    fn descend(&mut self, addr: GcPtr, mut level: WalkLevel, mut table: GcPhys) -> WalkOutcome {
        let mode = self.config.mode;

        // Effective flags accumulate across levels.
        let mut write = true;
        let mut user = true;
        let mut nx = false;

        loop {
            self.remember(addr, level, table);

            let entry = match self.read_entry(table, addr, level) {
                Ok(entry) => entry,
                Err(_) if level == mode.root_level() => {
                    self.cache.clear();
                    return WalkOutcome::RootNotPresent;
                }
                Err(_) => {
                    return WalkOutcome::NotPresent {
                        level,
                        pages_skip: self.pages_skip(addr, level),
                    };
                }
            };

            if !entry.present {
                return WalkOutcome::NotPresent {
                    level,
                    pages_skip: self.pages_skip(addr, level),
                };
            }

            let leaf = entry.large || level == WalkLevel::Pt;
            if self
                .config
                .masks
                .violation(level, leaf, entry.raw)
                != 0
            {
                tracing::trace!(%addr, ?level, raw = entry.raw, "reserved bits set");
                return WalkOutcome::ReservedBits {
                    level,
                    pages_skip: self.pages_skip(addr, level),
                };
            }

            write &= entry.write;
            user &= entry.user;
            nx |= entry.nx && self.config.nx;

            if leaf {
                let span = 1u64 << mode.shift(level);
                let base = entry.next & !(span - 1);
                let gc_phys = self.config.apply_a20(base + (addr.0 & (span - 1)));

                let mut flags = WalkFlags::empty();
                flags.set(WalkFlags::WRITE, write);
                flags.set(WalkFlags::USER, user);
                flags.set(WalkFlags::NO_EXECUTE, nx);
                flags.set(WalkFlags::ACCESSED, entry.accessed);
                flags.set(WalkFlags::DIRTY, entry.dirty);
                flags.set(WalkFlags::GLOBAL, entry.global);
                flags.set(WalkFlags::LARGE, entry.large);

                return WalkOutcome::Mapped(WalkInfo {
                    gc_phys,
                    level,
                    flags,
                    raw_leaf: entry.raw,
                });
            }

            table = self.config.apply_a20(entry.next);
            level = level.next().expect("leaf check covers the PT level");
        }
    }

    /// Records the table about to be consulted for `addr` at `level`.
    fn remember(&mut self, addr: GcPtr, level: WalkLevel, table: GcPhys) {
        let mode = self.config.mode;
        let span_shift = mode.shift(level) + mode.entries(level).trailing_zeros();
        // The root table of a 32-bit/PAE walk covers the entire 4G space;
        // clamp so the shift stays meaningful.
        let span_shift = span_shift.min(63);
        let va_base = GcPtr(addr.0 & !((1u64 << span_shift) - 1));

        self.cache.push(CachedLevel {
            level,
            table,
            va_base,
            span_shift,
        });
    }

    /// Pages from `addr` to the end of the span of the entry that failed at
    /// `level`.
    fn pages_skip(&self, addr: GcPtr, level: WalkLevel) -> u64 {
        let span = 1u64 << self.config.mode.shift(level);
        ((span - (addr.0 & (span - 1))) >> PAGE_SHIFT).max(1)
    }

    fn read_entry(&self, table: GcPhys, addr: GcPtr, level: WalkLevel) -> Result<EntryView, ()> {
        let mode = self.config.mode;
        let index = mode.index(addr, level);
        let entry_addr = self
            .config
            .apply_a20(table + index * mode.entry_size());

        match mode {
            PagingMode::Bit32 => {
                let pte = Pte32(self.mem.read_u32(entry_addr).map_err(|_| ())?);
                let large = level == WalkLevel::Pd && self.config.pse && pte.large();
                Ok(EntryView {
                    present: pte.present(),
                    write: pte.write(),
                    user: pte.user(),
                    nx: false,
                    large,
                    accessed: pte.accessed(),
                    dirty: pte.dirty(),
                    global: pte.global(),
                    raw: pte.0 as u64,
                    next: if large {
                        pte.pfn_4m().gc_phys()
                    } else {
                        pte.pfn().gc_phys()
                    },
                })
            }

            PagingMode::Pae | PagingMode::Amd64 => {
                let pte = Pte64(self.mem.read_u64(entry_addr).map_err(|_| ())?);
                let pae_pdpte = mode == PagingMode::Pae && level == WalkLevel::Pdpt;
                let large = mode.can_be_leaf(level) && level != WalkLevel::Pt && pte.large();
                Ok(EntryView {
                    present: pte.present(),
                    // The PAE PDPTE carries no RW/US bits.
                    write: pte.write() || pae_pdpte,
                    user: pte.user() || pae_pdpte,
                    nx: pte.no_execute(),
                    large,
                    accessed: pte.accessed(),
                    dirty: pte.dirty(),
                    global: pte.global(),
                    raw: pte.0,
                    next: pte.pfn().gc_phys(),
                })
            }

            PagingMode::Ept => {
                let entry = EptEntry(self.mem.read_u64(entry_addr).map_err(|_| ())?);
                let large = mode.can_be_leaf(level) && level != WalkLevel::Pt && entry.large();
                Ok(EntryView {
                    present: entry.present(),
                    write: entry.write(),
                    user: entry.user_execute(),
                    nx: !entry.execute(),
                    large,
                    accessed: entry.accessed(),
                    dirty: entry.dirty(),
                    global: false,
                    raw: entry.0,
                    next: entry.pfn().gc_phys(),
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "walker_tests.rs"]
mod walker_tests;
