use super::macros::impl_address;

impl_address!(GcPhys, u64, "guest-context physical address");
impl_address!(GcPtr, u64, "guest-context virtual address");
impl_address!(HcPhys, u64, "host-context physical address");
impl_address!(Gfn, u64, "guest frame number");

/// The size of a base page, in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// The base page shift.
pub const PAGE_SHIFT: u32 = 12;

/// Mask covering the offset within a base page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

impl GcPhys {
    /// Returns the frame number of the page containing this address.
    pub const fn gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }

    /// Returns the offset of this address within its page.
    pub const fn offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Rounds the address down to its page boundary.
    pub const fn page_align(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Checks whether the address is page aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_OFFSET_MASK == 0
    }
}

impl Gfn {
    /// Returns the physical address of the first byte of this frame.
    pub const fn gc_phys(self) -> GcPhys {
        GcPhys(self.0 << PAGE_SHIFT)
    }
}

impl GcPtr {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the offset of this address within its page.
    pub const fn offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Rounds the address down to its page boundary.
    pub const fn page_align(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }
}
