use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use pgm_core::Gfn;

/// A legacy 32-bit page table or page directory entry.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Pte32(pub u32);

impl Pte32 {
    /// Checks if the page is present in physical memory.
    pub fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the page is writable.
    pub fn write(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// Checks if the page is accessible in user mode.
    pub fn user(self) -> bool {
        (self.0 >> 2) & 1 != 0
    }

    /// Checks if write-through caching is enabled for the page.
    pub fn write_through(self) -> bool {
        (self.0 >> 3) & 1 != 0
    }

    /// Checks if caching is disabled for the page.
    pub fn cache_disable(self) -> bool {
        (self.0 >> 4) & 1 != 0
    }

    /// Checks if the page has been accessed.
    pub fn accessed(self) -> bool {
        (self.0 >> 5) & 1 != 0
    }

    /// Checks if the page has been written to.
    pub fn dirty(self) -> bool {
        (self.0 >> 6) & 1 != 0
    }

    /// Checks if this directory entry maps a 4M page (requires CR4.PSE).
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Checks if the page is global.
    pub fn global(self) -> bool {
        (self.0 >> 8) & 1 != 0
    }

    /// Extracts the page frame number from a non-large entry.
    pub fn pfn(self) -> Gfn {
        Gfn::new((self.0 >> 12) as u64)
    }

    /// Extracts the frame number of a 4M page (bits 31:22, plus the PSE-36
    /// extension bits 16:13 contributing address bits 39:32).
    pub fn pfn_4m(self) -> Gfn {
        let low = ((self.0 >> 22) as u64) << 10;
        let high = (((self.0 >> 13) & 0xF) as u64) << 20;
        Gfn::new(low | high)
    }
}

impl std::fmt::Debug for Pte32 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pte32")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("user", &self.user())
            .field("accessed", &self.accessed())
            .field("dirty", &self.dirty())
            .field("large", &self.large())
            .field("pfn", &self.pfn())
            .finish()
    }
}

/// A PAE or long-mode page table entry at any level.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Pte64(pub u64);

impl Pte64 {
    /// Checks if the page is present in physical memory.
    pub fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the page is writable.
    pub fn write(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// Checks if the page is accessible in user mode.
    pub fn user(self) -> bool {
        (self.0 >> 2) & 1 != 0
    }

    /// Checks if write-through caching is enabled for the page.
    pub fn write_through(self) -> bool {
        (self.0 >> 3) & 1 != 0
    }

    /// Checks if caching is disabled for the page.
    pub fn cache_disable(self) -> bool {
        (self.0 >> 4) & 1 != 0
    }

    /// Checks if the page has been accessed.
    pub fn accessed(self) -> bool {
        (self.0 >> 5) & 1 != 0
    }

    /// Checks if the page has been written to.
    pub fn dirty(self) -> bool {
        (self.0 >> 6) & 1 != 0
    }

    /// Checks if this entry maps a large page (2M at PD, 1G at PDPT level).
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// The PAT bit of a 4K leaf entry (same position as the large bit).
    pub fn pat(self) -> bool {
        self.large()
    }

    /// Checks if the page is global.
    pub fn global(self) -> bool {
        (self.0 >> 8) & 1 != 0
    }

    /// Checks if instruction fetches are disallowed (requires EFER.NXE).
    pub fn no_execute(self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Extracts the page frame number from the entry.
    pub fn pfn(self) -> Gfn {
        const BITS: u64 = 40;
        const MASK: u64 = (1 << BITS) - 1;
        Gfn::new((self.0 >> 12) & MASK)
    }
}

impl std::fmt::Debug for Pte64 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pte64")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("user", &self.user())
            .field("accessed", &self.accessed())
            .field("dirty", &self.dirty())
            .field("large", &self.large())
            .field("global", &self.global())
            .field("no_execute", &self.no_execute())
            .field("pfn", &self.pfn())
            .finish()
    }
}

/// An EPT (second-level translation) entry at any level.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EptEntry(pub u64);

impl EptEntry {
    /// Checks if reads are permitted.
    pub fn read(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if writes are permitted.
    pub fn write(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// Checks if instruction fetches are permitted.
    pub fn execute(self) -> bool {
        (self.0 >> 2) & 1 != 0
    }

    /// An EPT entry is present when any access is permitted.
    pub fn present(self) -> bool {
        self.0 & 0b111 != 0
    }

    /// The EPT memory type field (leaf entries only).
    pub fn memory_type(self) -> u8 {
        ((self.0 >> 3) & 0b111) as u8
    }

    /// Checks if the guest PAT is ignored for this page.
    pub fn ignore_pat(self) -> bool {
        (self.0 >> 6) & 1 != 0
    }

    /// Checks if this entry maps a large page (2M at level 2, 1G at level 3).
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Checks if the page has been accessed (requires A/D tracking).
    pub fn accessed(self) -> bool {
        (self.0 >> 8) & 1 != 0
    }

    /// Checks if the page has been written to (requires A/D tracking).
    pub fn dirty(self) -> bool {
        (self.0 >> 9) & 1 != 0
    }

    /// Checks if user-mode instruction fetches are permitted
    /// (mode-based execute control).
    pub fn user_execute(self) -> bool {
        (self.0 >> 10) & 1 != 0
    }

    /// Extracts the page frame number from the entry.
    pub fn pfn(self) -> Gfn {
        const BITS: u64 = 40;
        const MASK: u64 = (1 << BITS) - 1;
        Gfn::new((self.0 >> 12) & MASK)
    }
}

impl std::fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EptEntry")
            .field("read", &self.read())
            .field("write", &self.write())
            .field("execute", &self.execute())
            .field("memory_type", &self.memory_type())
            .field("large", &self.large())
            .field("accessed", &self.accessed())
            .field("dirty", &self.dirty())
            .field("pfn", &self.pfn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte64_bit_positions() {
        let pte = Pte64(0x8000_0000_0001_0867);
        assert!(pte.present());
        assert!(pte.write());
        assert!(pte.user());
        assert!(pte.accessed());
        assert!(pte.dirty());
        assert!(pte.no_execute());
        assert!(!pte.large());
        assert_eq!(pte.pfn(), Gfn::new(0x10));
    }

    #[test]
    fn pte32_4m_frame_number() {
        // 4M page at 0x0080_0000 with PSE-36 bits clear.
        let pde = Pte32((0x0080_0000u32) | (1 << 7) | 1);
        assert!(pde.large());
        assert_eq!(pde.pfn_4m(), Gfn::new(0x800));
    }

    #[test]
    fn ept_present_means_any_permission() {
        assert!(!EptEntry(0).present());
        assert!(EptEntry(0b001).present());
        assert!(EptEntry(0b100).present());
        assert_eq!(EptEntry(0x38).memory_type(), 7);
    }
}
