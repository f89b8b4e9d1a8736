use pgm_core::{GcPhys, GcPtr};

/// Supported paging modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Legacy 32-bit paging (two levels, optionally 4M pages via CR4.PSE).
    Bit32,

    /// Physical Address Extension (three levels, 2M large pages).
    Pae,

    /// AMD64 long mode (four levels, 2M and 1G large pages).
    Amd64,

    /// Intel second-level (nested) translation, four levels.
    Ept,
}

impl PagingMode {
    /// The level the walk starts at.
    pub fn root_level(self) -> WalkLevel {
        match self {
            Self::Bit32 => WalkLevel::Pd,
            Self::Pae => WalkLevel::Pdpt,
            Self::Amd64 | Self::Ept => WalkLevel::Pml4,
        }
    }

    /// The size of an entry, in bytes.
    pub fn entry_size(self) -> u64 {
        match self {
            Self::Bit32 => 4,
            _ => 8,
        }
    }

    /// The number of entries in a table at the given level.
    pub fn entries(self, level: WalkLevel) -> u64 {
        match (self, level) {
            (Self::Bit32, _) => 1024,
            (Self::Pae, WalkLevel::Pdpt) => 4,
            _ => 512,
        }
    }

    /// The virtual address shift of the given level.
    pub fn shift(self, level: WalkLevel) -> u32 {
        match (self, level) {
            (Self::Bit32, WalkLevel::Pt) => 12,
            (Self::Bit32, _) => 22,
            (_, WalkLevel::Pt) => 12,
            (_, WalkLevel::Pd) => 21,
            (_, WalkLevel::Pdpt) => 30,
            (_, WalkLevel::Pml4) => 39,
        }
    }

    /// The table index the given address selects at the given level.
    pub fn index(self, addr: GcPtr, level: WalkLevel) -> u64 {
        (addr.0 >> self.shift(level)) & (self.entries(level) - 1)
    }

    /// The physical base of the root table designated by CR3 (or the EPT
    /// pointer).
    pub fn root_base(self, cr3: GcPhys) -> GcPhys {
        match self {
            // The PAE PDPT is 32-byte aligned.
            Self::Pae => cr3 & 0xFFFF_FFE0,
            _ => cr3 & !0xFFFu64,
        }
    }

    /// Whether linear addresses must be canonical in this mode.
    pub fn requires_canonical(self) -> bool {
        matches!(self, Self::Amd64)
    }

    /// Whether the entry format carries the no-execute bit.
    pub fn has_nx(self) -> bool {
        !matches!(self, Self::Bit32)
    }

    /// Whether a leaf is architecturally possible at the given level.
    pub fn can_be_leaf(self, level: WalkLevel) -> bool {
        match (self, level) {
            (_, WalkLevel::Pt) => true,
            (_, WalkLevel::Pd) => true,
            (Self::Amd64 | Self::Ept, WalkLevel::Pdpt) => true,
            _ => false,
        }
    }
}

/// The levels in the page table hierarchy, numbered the way fault reporting
/// numbers them (1 = innermost).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum WalkLevel {
    /// Page Table — the lowest level, pointing directly to 4K pages.
    Pt = 1,

    /// Page Directory — can point to PTs or map 2M/4M large pages.
    Pd = 2,

    /// Page Directory Pointer Table — can point to PDs or map 1G pages.
    Pdpt = 3,

    /// Page Map Level 4 — the highest level in 4-level paging.
    Pml4 = 4,
}

impl WalkLevel {
    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pt => None,
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
        }
    }

    /// Returns the next higher level in the page table hierarchy.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Pt => Some(Self::Pd),
            Self::Pd => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pml4),
            Self::Pml4 => None,
        }
    }

    /// The numeric level, 1 through 4.
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// Checks whether a long-mode linear address is canonical (bits 63:47 are a
/// sign extension of bit 47).
pub fn is_canonical(addr: GcPtr) -> bool {
    let shifted = (addr.0 as i64) >> 47;
    shifted == 0 || shifted == -1
}

/// The first address above the non-canonical hole.
pub const CANONICAL_HIGH_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Per-mode must-be-zero masks for page table entries.
///
/// Physical-address bits at and above the host's MAXPHYADDR are reserved,
/// as is bit 63 when no-execute is disabled. Derived once per VM at the
/// first mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedMasks {
    /// Masks for non-leaf entries, indexed by `WalkLevel::number() - 1`.
    table: [u64; 4],

    /// Masks for leaf entries (4K PTEs and large pages), same indexing.
    leaf: [u64; 4],
}

impl ReservedMasks {
    /// Derives the masks for a mode from the host's maximum physical-address
    /// width and the no-execute configuration.
    pub fn derive(mode: PagingMode, maxphyaddr: u32, nx_enabled: bool) -> Self {
        debug_assert!((32..=52).contains(&maxphyaddr));

        let phys_mbz = if maxphyaddr >= 52 {
            0
        } else {
            ((1u64 << 52) - 1) & !((1u64 << maxphyaddr) - 1)
        };

        let nx_mbz = if mode.has_nx() && !nx_enabled { 1u64 << 63 } else { 0 };

        let mut table = [0u64; 4];
        let mut leaf = [0u64; 4];

        match mode {
            PagingMode::Bit32 => {
                // 32-bit entries have no high physical bits. A 4M leaf
                // reserves bits 21:17 between the PSE-36 field and the
                // frame number.
                leaf[WalkLevel::Pd.number() as usize - 1] = 0x003E_0000;
            }

            PagingMode::Pae | PagingMode::Amd64 => {
                for level in [WalkLevel::Pt, WalkLevel::Pd, WalkLevel::Pdpt, WalkLevel::Pml4] {
                    let i = level.number() as usize - 1;
                    table[i] = phys_mbz | nx_mbz;
                    leaf[i] = phys_mbz | nx_mbz;
                }

                // Large pages reserve the bits between the PAT bit and the
                // frame number.
                leaf[WalkLevel::Pd.number() as usize - 1] |= 0x001F_E000;
                leaf[WalkLevel::Pdpt.number() as usize - 1] |= 0x3FFF_E000;

                if mode == PagingMode::Pae {
                    // The PAE PDPTE has no RW/US/A/D bits.
                    table[WalkLevel::Pdpt.number() as usize - 1] |= 0x1E6;
                }
            }

            PagingMode::Ept => {
                for level in [WalkLevel::Pt, WalkLevel::Pd, WalkLevel::Pdpt, WalkLevel::Pml4] {
                    let i = level.number() as usize - 1;
                    table[i] = phys_mbz;
                    leaf[i] = phys_mbz;
                }

                // Non-leaf EPT entries have no memory-type field.
                for level in [WalkLevel::Pd, WalkLevel::Pdpt, WalkLevel::Pml4] {
                    table[level.number() as usize - 1] |= 0x78;
                }

                leaf[WalkLevel::Pd.number() as usize - 1] |= 0x001F_F000;
                leaf[WalkLevel::Pdpt.number() as usize - 1] |= 0x3FFF_F000;
            }
        }

        Self { table, leaf }
    }

    /// The must-be-zero mask for an entry at the given level.
    pub fn mask(&self, level: WalkLevel, leaf: bool) -> u64 {
        let i = level.number() as usize - 1;
        if leaf { self.leaf[i] } else { self.table[i] }
    }

    /// Checks an entry's raw value against the mask; a non-zero overlap is
    /// a reserved-bit violation.
    pub fn violation(&self, level: WalkLevel, leaf: bool, raw: u64) -> u64 {
        raw & self.mask(level, leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_boundaries() {
        assert!(is_canonical(GcPtr(0)));
        assert!(is_canonical(GcPtr(0x0000_7FFF_FFFF_FFFF)));
        assert!(!is_canonical(GcPtr(0x0000_8000_0000_0000)));
        assert!(!is_canonical(GcPtr(0xFFFF_7FFF_FFFF_FFFF)));
        assert!(is_canonical(GcPtr(CANONICAL_HIGH_BASE)));
        assert!(is_canonical(GcPtr(u64::MAX)));
    }

    #[test]
    fn reserved_masks_track_maxphyaddr() {
        let masks = ReservedMasks::derive(PagingMode::Amd64, 36, true);
        // Bit 36 is reserved, bit 35 is not.
        assert_ne!(masks.violation(WalkLevel::Pt, true, 1 << 36), 0);
        assert_eq!(masks.violation(WalkLevel::Pt, true, 1 << 35), 0);

        let wide = ReservedMasks::derive(PagingMode::Amd64, 52, true);
        assert_eq!(wide.violation(WalkLevel::Pt, true, 1 << 51), 0);
    }

    #[test]
    fn nx_bit_is_reserved_without_nxe() {
        let masks = ReservedMasks::derive(PagingMode::Amd64, 48, false);
        assert_ne!(masks.violation(WalkLevel::Pt, true, 1 << 63), 0);

        let masks = ReservedMasks::derive(PagingMode::Amd64, 48, true);
        assert_eq!(masks.violation(WalkLevel::Pt, true, 1 << 63), 0);
    }

    #[test]
    fn pae_pdpte_low_bits_are_reserved() {
        let masks = ReservedMasks::derive(PagingMode::Pae, 48, true);
        assert_ne!(masks.violation(WalkLevel::Pdpt, false, 1 << 1), 0);
        assert_ne!(masks.violation(WalkLevel::Pdpt, false, 1 << 2), 0);
        assert_eq!(masks.violation(WalkLevel::Pd, false, 1 << 1), 0);
    }

    #[test]
    fn mode_geometry() {
        assert_eq!(PagingMode::Bit32.entries(WalkLevel::Pd), 1024);
        assert_eq!(PagingMode::Pae.entries(WalkLevel::Pdpt), 4);
        assert_eq!(PagingMode::Amd64.entries(WalkLevel::Pml4), 512);

        let addr = GcPtr(0x0000_7F12_3456_7000);
        assert_eq!(
            PagingMode::Amd64.index(addr, WalkLevel::Pml4),
            (addr.0 >> 39) & 0x1FF
        );
        assert_eq!(PagingMode::Bit32.index(GcPtr(0xFFC0_1000), WalkLevel::Pd), 0x3FF);
    }
}
