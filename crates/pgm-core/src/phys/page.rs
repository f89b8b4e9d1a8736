use serde::{Deserialize, Serialize};

use crate::HcPhys;

/// The allocation state of a guest physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageState {
    /// The page reads as all zeroes and has no private backing yet.
    /// The first write allocates it.
    Zero,

    /// The page has private, writable backing.
    Allocated,

    /// The page is backed by a de-duplicated copy owned by the host-global
    /// sharing service. Writes must fault so the sharing can be broken.
    Shared,

    /// The page has been returned to the host by the balloon driver.
    Ballooned,

    /// The page is allocated but write-monitored (e.g. a guest page table
    /// mirrored by a shadow page, or an MMIO2 page under dirty tracking).
    WriteMonitored,
}

/// The kind of memory a guest physical page represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageType {
    /// Ordinary RAM.
    Ram,

    /// Device MMIO. Never backed by memory; every access goes to a handler.
    Mmio,

    /// Device-owned RAM-like memory (frame buffers and the like),
    /// optionally dirty-tracked through a write handler.
    Mmio2,

    /// Read-only memory. Writes fault unconditionally.
    Rom,

    /// ROM with a RAM shadow page behind it.
    RomShadow,

    /// An alias page remapped over MMIO for optimization purposes.
    SpecialAlias,
}

/// The tiered back-reference from a guest physical page to the shadow pool
/// pages referencing it.
///
/// The common case is a single mapping, which costs one inline slot. A
/// second mapping promotes the page to a counted extent chain; overflowing
/// the chain gives up on precise tracking and any write to the page then
/// triggers a full pool invalidation instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingRef {
    /// No shadow page references this physical page.
    #[default]
    None,

    /// Exactly one shadow page table entry references this page.
    Single {
        /// Index of the referencing pool page.
        pool_idx: u16,

        /// Index of the referencing entry within that pool page.
        pte_idx: u16,
    },

    /// Multiple references, tracked in the extent arena starting at the
    /// given extent slot.
    Extent(u16),

    /// Too many references to track precisely.
    Overflowed,
}

/// Per-page state for one guest physical 4K page.
#[derive(Debug, Clone)]
pub struct PhysPage {
    hc_phys: HcPhys,
    page_id: u32,
    state: PageState,
    page_type: PageType,
    read_locks: u8,
    write_locks: u8,
    written_to: bool,
    tracking: TrackingRef,
}

impl PhysPage {
    /// Creates a new page record of the given type.
    pub fn new(page_type: PageType, hc_phys: HcPhys, page_id: u32) -> Self {
        let state = match page_type {
            PageType::Ram | PageType::Mmio => PageState::Zero,
            PageType::Mmio2 | PageType::SpecialAlias => PageState::Allocated,
            PageType::Rom | PageType::RomShadow => PageState::Allocated,
        };

        Self {
            hc_phys,
            page_id,
            state,
            page_type,
            read_locks: 0,
            write_locks: 0,
            written_to: false,
            tracking: TrackingRef::None,
        }
    }

    /// The host physical address backing this page.
    pub fn hc_phys(&self) -> HcPhys {
        self.hc_phys
    }

    /// The opaque page identifier assigned by the allocator.
    pub fn page_id(&self) -> u32 {
        self.page_id
    }

    /// The allocation state of the page.
    pub fn state(&self) -> PageState {
        self.state
    }

    /// The memory kind of the page.
    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Whether the page has been written to since the flag was last cleared.
    pub fn written_to(&self) -> bool {
        self.written_to
    }

    /// The shadow pool back-reference slot for this page.
    pub fn tracking(&self) -> TrackingRef {
        self.tracking
    }

    pub(crate) fn set_state(&mut self, state: PageState) {
        self.state = state;
    }

    pub(crate) fn set_written_to(&mut self, written_to: bool) {
        self.written_to = written_to;
    }

    /// Replaces the backing of this page, e.g. when allocating a zero page
    /// or adopting a shared copy. The old tracking becomes invalid and must
    /// be flushed by the caller.
    pub fn replace_backing(&mut self, hc_phys: HcPhys, page_id: u32) {
        self.hc_phys = hc_phys;
        self.page_id = page_id;
    }

    /// Updates the shadow tracking slot.
    pub fn set_tracking(&mut self, tracking: TrackingRef) {
        self.tracking = tracking;
    }

    /// Whether a guest write to this page must fault.
    ///
    /// State and type jointly determine this: a write-through is only
    /// permitted for privately allocated RAM-like pages.
    pub fn must_fault_on_write(&self) -> bool {
        match self.page_type {
            PageType::Rom | PageType::RomShadow | PageType::Mmio | PageType::SpecialAlias => true,
            PageType::Ram | PageType::Mmio2 => !matches!(self.state, PageState::Allocated),
        }
    }

    /// Pins the page for reading.
    pub fn lock_read(&mut self) {
        debug_assert!(self.read_locks < u8::MAX);
        self.read_locks = self.read_locks.saturating_add(1);
    }

    /// Releases a read pin.
    pub fn unlock_read(&mut self) {
        debug_assert!(self.read_locks > 0);
        self.read_locks = self.read_locks.saturating_sub(1);
    }

    /// Pins the page for writing.
    pub fn lock_write(&mut self) {
        debug_assert!(self.write_locks < u8::MAX);
        self.write_locks = self.write_locks.saturating_add(1);
    }

    /// Releases a write pin.
    pub fn unlock_write(&mut self) {
        debug_assert!(self.write_locks > 0);
        self.write_locks = self.write_locks.saturating_sub(1);
    }

    /// Whether the page is currently pinned.
    pub fn is_locked(&self) -> bool {
        self.read_locks > 0 || self.write_locks > 0
    }
}
