//! Ground-truth per-physical-page state: RAM ranges and the page directory.

mod page;
mod range;

pub use self::{
    page::{PageState, PageType, PhysPage, TrackingRef},
    range::RamRange,
};

use crate::{GcPhys, HcPhys, PAGE_OFFSET_MASK, PAGE_SIZE, PgmError, PgmResult};

/// The page identifier of the all-zeroes page.
pub const ZERO_PAGE_ID: u32 = 0;

/// The host physical address of the all-zeroes page.
pub const ZERO_PAGE_HC_PHYS: HcPhys = HcPhys(0);

/// The maximum needle length accepted by the scan API.
pub const MAX_NEEDLE_SIZE: usize = 256;

/// The maximum alignment accepted by the scan API (4 GiB).
pub const MAX_SCAN_ALIGNMENT: u64 = 0x1_0000_0000;

/// The ordered, non-overlapping set of [`RamRange`]s making up guest
/// physical memory, together with the page allocator bookkeeping.
///
/// One instance exists per VM. All mutation goes through `&mut self`; the
/// owning engine serializes access.
pub struct PhysPageDirectory {
    /// Address-sorted, pairwise disjoint.
    ranges: Vec<RamRange>,

    next_page_id: u32,
    next_hc_phys: u64,

    zero_pages: u64,
    private_pages: u64,
    shared_pages: u64,
}

impl Default for PhysPageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysPageDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            ranges: Vec::new(),
            next_page_id: 1,
            next_hc_phys: 0x1_0000_0000,
            zero_pages: 0,
            private_pages: 0,
            shared_pages: 0,
        }
    }

    fn alloc_backing(&mut self) -> (HcPhys, u32) {
        let hc_phys = HcPhys(self.next_hc_phys);
        self.next_hc_phys += PAGE_SIZE;

        let page_id = self.next_page_id;
        self.next_page_id += 1;

        (hc_phys, page_id)
    }

    fn register(
        &mut self,
        gc_phys: GcPhys,
        cb: u64,
        page_type: PageType,
        desc: &str,
    ) -> PgmResult<()> {
        if cb == 0 {
            return Err(PgmError::InvalidParameter("cb"));
        }
        if gc_phys.0 & PAGE_OFFSET_MASK != 0 || cb & PAGE_OFFSET_MASK != 0 {
            return Err(PgmError::InvalidParameter("page alignment"));
        }
        if gc_phys.0.checked_add(cb - 1).is_none() {
            return Err(PgmError::InvalidParameter("range wraps"));
        }

        let gc_phys_last = gc_phys + (cb - 1);
        let index = self
            .ranges
            .partition_point(|range| range.gc_phys_last() < gc_phys);
        if let Some(next) = self.ranges.get(index) {
            if next.gc_phys() <= gc_phys_last {
                return Err(PgmError::Conflict(next.gc_phys()));
            }
        }

        let page_count = (cb >> crate::PAGE_SHIFT) as usize;
        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            let page = match page_type {
                PageType::Ram | PageType::Mmio => {
                    self.zero_pages += 1;
                    PhysPage::new(page_type, ZERO_PAGE_HC_PHYS, ZERO_PAGE_ID)
                }
                _ => {
                    let (hc_phys, page_id) = self.alloc_backing();
                    self.private_pages += 1;
                    PhysPage::new(page_type, hc_phys, page_id)
                }
            };
            pages.push(page);
        }

        tracing::debug!(%gc_phys, %gc_phys_last, ?page_type, desc, "registering range");
        self.ranges
            .insert(index, RamRange::new(gc_phys, pages, desc.to_string()));
        Ok(())
    }

    /// Registers a RAM range. Pages start out in the zero state.
    pub fn register_ram(&mut self, gc_phys: GcPhys, cb: u64, desc: &str) -> PgmResult<()> {
        self.register(gc_phys, cb, PageType::Ram, desc)
    }

    /// Registers a ROM range and copies the image into its backing.
    pub fn register_rom(&mut self, gc_phys: GcPhys, image: &[u8], desc: &str) -> PgmResult<()> {
        if image.is_empty() || image.len() as u64 & PAGE_OFFSET_MASK != 0 {
            return Err(PgmError::InvalidParameter("image size"));
        }

        self.register(gc_phys, image.len() as u64, PageType::Rom, desc)?;

        let range = self
            .find_range_mut(gc_phys)
            .expect("range was just inserted");
        for (index, chunk) in image.chunks_exact(PAGE_SIZE as usize).enumerate() {
            range.page_bytes_mut(index).copy_from_slice(chunk);
        }
        Ok(())
    }

    /// Registers a device MMIO range. Accesses always go to a handler.
    pub fn register_mmio(&mut self, gc_phys: GcPhys, cb: u64, desc: &str) -> PgmResult<()> {
        self.register(gc_phys, cb, PageType::Mmio, desc)
    }

    /// Registers a RAM-like device memory range (MMIO2).
    pub fn register_mmio2(&mut self, gc_phys: GcPhys, cb: u64, desc: &str) -> PgmResult<()> {
        self.register(gc_phys, cb, PageType::Mmio2, desc)
    }

    /// The registered ranges, in address order.
    pub fn ranges(&self) -> &[RamRange] {
        &self.ranges
    }

    /// Number of pages in the zero state.
    pub fn zero_pages(&self) -> u64 {
        self.zero_pages
    }

    /// Number of pages with private backing.
    pub fn private_pages(&self) -> u64 {
        self.private_pages
    }

    /// Number of pages backed by shared copies.
    pub fn shared_pages(&self) -> u64 {
        self.shared_pages
    }

    fn range_index(&self, gc_phys: GcPhys) -> Option<usize> {
        let index = self
            .ranges
            .partition_point(|range| range.gc_phys_last() < gc_phys);
        self.ranges
            .get(index)
            .filter(|range| range.contains(gc_phys))
            .map(|_| index)
    }

    /// The range covering the given address, if any.
    pub fn find_range(&self, gc_phys: GcPhys) -> Option<&RamRange> {
        self.range_index(gc_phys).map(|index| &self.ranges[index])
    }

    fn find_range_mut(&mut self, gc_phys: GcPhys) -> Option<&mut RamRange> {
        self.range_index(gc_phys)
            .map(|index| &mut self.ranges[index])
    }

    /// The page record covering the given address.
    pub fn page_at(&self, gc_phys: GcPhys) -> PgmResult<&PhysPage> {
        self.find_range(gc_phys)
            .ok_or(PgmError::OutOfRange(gc_phys))?
            .page_at(gc_phys)
    }

    /// The mutable page record covering the given address.
    pub fn page_mut_at(&mut self, gc_phys: GcPhys) -> PgmResult<&mut PhysPage> {
        self.find_range_mut(gc_phys)
            .ok_or(PgmError::OutOfRange(gc_phys))?
            .page_mut_at(gc_phys)
    }

    /// Makes the page covering `gc_phys` privately writable: allocates zero
    /// pages, breaks sharing, and demotes write monitoring.
    ///
    /// The caller owns the consequences: any previous host physical address
    /// is dead and all shadow tracking for it must be invalidated.
    pub fn make_writable(&mut self, gc_phys: GcPhys) -> PgmResult<()> {
        let page = self.page_at(gc_phys)?;
        match (page.page_type(), page.state()) {
            (PageType::Ram | PageType::Mmio2, PageState::Allocated) => Ok(()),

            (PageType::Ram, PageState::Zero) => {
                let (hc_phys, page_id) = self.alloc_backing();
                self.zero_pages -= 1;
                self.private_pages += 1;

                let page = self.page_mut_at(gc_phys)?;
                page.replace_backing(hc_phys, page_id);
                page.set_state(PageState::Allocated);
                tracing::trace!(%gc_phys, %hc_phys, "allocated zero page");
                Ok(())
            }

            (PageType::Ram, PageState::Shared) => {
                let (hc_phys, page_id) = self.alloc_backing();
                self.shared_pages -= 1;
                self.private_pages += 1;

                let page = self.page_mut_at(gc_phys)?;
                page.replace_backing(hc_phys, page_id);
                page.set_state(PageState::Allocated);
                tracing::trace!(%gc_phys, %hc_phys, "broke page sharing");
                Ok(())
            }

            (PageType::Ram | PageType::Mmio2, PageState::WriteMonitored) => {
                let page = self.page_mut_at(gc_phys)?;
                page.set_state(PageState::Allocated);
                page.set_written_to(true);
                Ok(())
            }

            (PageType::Ram, PageState::Ballooned) => Err(PgmError::InvalidPageType(gc_phys)),

            _ => Err(PgmError::InvalidPageType(gc_phys)),
        }
    }

    /// Replaces a privately allocated RAM page with a de-duplicated shared
    /// copy. The page becomes read-only; the next write breaks the sharing
    /// through [`make_writable`](Self::make_writable).
    ///
    /// The old host physical address is dead after this; the caller must
    /// invalidate all shadow tracking for the page.
    pub fn share_page(&mut self, gc_phys: GcPhys, hc_phys: HcPhys, page_id: u32) -> PgmResult<()> {
        let page = self.page_at(gc_phys)?;
        if page.page_type() != PageType::Ram || page.state() != PageState::Allocated {
            return Err(PgmError::InvalidPageType(gc_phys));
        }

        self.private_pages -= 1;
        self.shared_pages += 1;

        let page = self.page_mut_at(gc_phys)?;
        page.replace_backing(hc_phys, page_id);
        page.set_state(PageState::Shared);
        tracing::trace!(%gc_phys, %hc_phys, page_id, "page now shared");
        Ok(())
    }

    /// Puts a privately allocated RAM or MMIO2 page under write monitoring,
    /// e.g. for a guest page table mirrored by a shadow page or an MMIO2
    /// page under dirty tracking.
    ///
    /// The next guest write faults and goes back to the allocated state
    /// through [`make_writable`](Self::make_writable). Monitoring an already
    /// monitored page is a no-op.
    pub fn write_monitor_page(&mut self, gc_phys: GcPhys) -> PgmResult<()> {
        let page = self.page_at(gc_phys)?;
        match (page.page_type(), page.state()) {
            (PageType::Ram | PageType::Mmio2, PageState::Allocated) => {
                let page = self.page_mut_at(gc_phys)?;
                page.set_state(PageState::WriteMonitored);
                page.set_written_to(false);
                tracing::trace!(%gc_phys, "page write-monitored");
                Ok(())
            }
            (PageType::Ram | PageType::Mmio2, PageState::WriteMonitored) => Ok(()),
            _ => Err(PgmError::InvalidPageType(gc_phys)),
        }
    }

    /// Reads guest physical memory.
    ///
    /// The operation is chunked at page granularity internally; the chunking
    /// is invisible on success. With `actual` provided, a failure after the
    /// first byte reports success with the short count; without it, any
    /// failure is an error.
    pub fn read_phys(
        &self,
        gc_phys: GcPhys,
        buf: &mut [u8],
        mut actual: Option<&mut usize>,
    ) -> PgmResult<()> {
        if buf.is_empty() {
            return Err(PgmError::InvalidParameter("zero-length read"));
        }

        let mut done = 0usize;
        let mut addr = gc_phys;

        while done < buf.len() {
            let offset = addr.offset() as usize;
            let chunk = std::cmp::min(PAGE_SIZE as usize - offset, buf.len() - done);

            match self.read_page_chunk(addr, &mut buf[done..done + chunk]) {
                Ok(()) => {
                    done += chunk;
                    addr = addr.page_align() + PAGE_SIZE;
                }
                Err(err) => {
                    return match actual {
                        Some(actual) if done > 0 => {
                            *actual = done;
                            Ok(())
                        }
                        _ => Err(err),
                    };
                }
            }
        }

        if let Some(actual) = actual.as_deref_mut() {
            *actual = done;
        }
        Ok(())
    }

    fn read_page_chunk(&self, gc_phys: GcPhys, buf: &mut [u8]) -> PgmResult<()> {
        let range = self
            .find_range(gc_phys)
            .ok_or(PgmError::OutOfRange(gc_phys))?;
        let index = range.page_index(gc_phys)?;
        let page = range.page_at(gc_phys)?;

        match page.page_type() {
            PageType::Mmio | PageType::SpecialAlias => {
                return Err(PgmError::InvalidPageType(gc_phys));
            }
            _ => {}
        }

        match page.state() {
            PageState::Zero | PageState::Ballooned => buf.fill(0),
            _ => {
                let offset = gc_phys.offset() as usize;
                buf.copy_from_slice(&range.page_bytes(index)[offset..offset + buf.len()]);
            }
        }
        Ok(())
    }

    /// Writes guest physical memory, with the same short-count contract as
    /// [`read_phys`](Self::read_phys).
    pub fn write_phys(
        &mut self,
        gc_phys: GcPhys,
        data: &[u8],
        mut actual: Option<&mut usize>,
    ) -> PgmResult<()> {
        if data.is_empty() {
            return Err(PgmError::InvalidParameter("zero-length write"));
        }

        let mut done = 0usize;
        let mut addr = gc_phys;

        while done < data.len() {
            let offset = addr.offset() as usize;
            let chunk = std::cmp::min(PAGE_SIZE as usize - offset, data.len() - done);

            match self.write_page_chunk(addr, &data[done..done + chunk]) {
                Ok(()) => {
                    done += chunk;
                    addr = addr.page_align() + PAGE_SIZE;
                }
                Err(err) => {
                    return match actual {
                        Some(actual) if done > 0 => {
                            *actual = done;
                            Ok(())
                        }
                        _ => Err(err),
                    };
                }
            }
        }

        if let Some(actual) = actual.as_deref_mut() {
            *actual = done;
        }
        Ok(())
    }

    fn write_page_chunk(&mut self, gc_phys: GcPhys, data: &[u8]) -> PgmResult<()> {
        let page = self.page_at(gc_phys)?;
        match page.page_type() {
            PageType::Ram | PageType::Mmio2 => {}
            _ => return Err(PgmError::InvalidPageType(gc_phys)),
        }

        self.make_writable(gc_phys)?;

        let range = self
            .find_range_mut(gc_phys)
            .ok_or(PgmError::OutOfRange(gc_phys))?;
        let index = range.page_index(gc_phys)?;
        let offset = gc_phys.offset() as usize;
        range.page_bytes_mut(index)[offset..offset + data.len()].copy_from_slice(data);
        range.page_mut_at(gc_phys)?.set_written_to(true);
        Ok(())
    }

    /// Reads a naturally aligned 64-bit value, e.g. a page table entry.
    pub fn read_u64(&self, gc_phys: GcPhys) -> PgmResult<u64> {
        let mut buf = [0u8; 8];
        self.read_phys(gc_phys, &mut buf, None)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a naturally aligned 32-bit value.
    pub fn read_u32(&self, gc_phys: GcPhys) -> PgmResult<u32> {
        let mut buf = [0u8; 4];
        self.read_phys(gc_phys, &mut buf, None)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes a 64-bit value. Used when constructing guest tables.
    pub fn write_u64(&mut self, gc_phys: GcPhys, value: u64) -> PgmResult<()> {
        self.write_phys(gc_phys, &value.to_le_bytes(), None)
    }

    /// Returns every allocated RAM page to the zero state, as on VM reset.
    /// ROM, MMIO and MMIO2 contents are left alone.
    pub fn reset(&mut self) {
        let mut freed = 0u64;
        for range in &mut self.ranges {
            for page in range.pages_mut() {
                if page.page_type() == PageType::Ram
                    && matches!(
                        page.state(),
                        PageState::Allocated | PageState::Shared | PageState::WriteMonitored
                    )
                {
                    if page.state() == PageState::Shared {
                        self.shared_pages -= 1;
                    } else {
                        self.private_pages -= 1;
                    }
                    self.zero_pages += 1;
                    freed += 1;

                    page.replace_backing(ZERO_PAGE_HC_PHYS, ZERO_PAGE_ID);
                    page.set_state(PageState::Zero);
                    page.set_written_to(false);
                    page.set_tracking(TrackingRef::None);
                }
            }
        }
        tracing::debug!(freed, "reset ram ranges");
    }

    /// Verifies the range list invariants: address-sorted and pairwise
    /// disjoint in both traversal directions.
    pub fn check_integrity(&self) -> PgmResult<()> {
        for window in self.ranges.windows(2) {
            if window[0].gc_phys_last() >= window[1].gc_phys() {
                return Err(PgmError::Corruption("ram ranges overlap or are unsorted"));
            }
        }
        for window in self.ranges.windows(2).rev() {
            if window[1].gc_phys() <= window[0].gc_phys_last() {
                return Err(PgmError::Corruption("ram ranges overlap (reverse walk)"));
            }
        }
        for range in &self.ranges {
            if range.gc_phys() > range.gc_phys_last() {
                return Err(PgmError::Corruption("inverted ram range"));
            }
        }
        Ok(())
    }

    /// Scans guest physical memory for the first occurrence of `needle` at
    /// the given alignment.
    ///
    /// A legitimately empty or unreadable range is a clean `None`, never an
    /// error. The needle may match across a page boundary.
    pub fn scan_physical(
        &self,
        start: GcPhys,
        cb: u64,
        alignment: u64,
        needle: &[u8],
    ) -> PgmResult<Option<GcPhys>> {
        if needle.is_empty() || needle.len() > MAX_NEEDLE_SIZE {
            return Err(PgmError::InvalidParameter("needle length"));
        }
        if !alignment.is_power_of_two() || alignment > MAX_SCAN_ALIGNMENT {
            return Err(PgmError::InvalidParameter("alignment"));
        }
        if cb < needle.len() as u64 {
            return Ok(None);
        }

        // Window: one page plus enough lookahead for a needle straddling the
        // boundary.
        let mut window = vec![0u8; PAGE_SIZE as usize + needle.len() - 1];
        let last = GcPhys(start.0.saturating_add(cb - 1));

        // Alignments beyond a page admit matches only at aligned page bases,
        // so the loop strides whole alignment units.
        let step = alignment.max(PAGE_SIZE);
        let mut page = if alignment > PAGE_SIZE {
            match start.0.checked_next_multiple_of(alignment) {
                Some(aligned) => GcPhys(aligned),
                None => return Ok(None),
            }
        } else {
            start.page_align()
        };
        while page <= last {
            let readable = self.read_page_chunk(page, &mut window[..PAGE_SIZE as usize]);
            if readable.is_ok() {
                let next_page = page + PAGE_SIZE;
                let lookahead = if needle.len() > 1 && next_page <= last {
                    match self.read_page_chunk(next_page, &mut window[PAGE_SIZE as usize..]) {
                        Ok(()) => needle.len() - 1,
                        Err(_) => 0,
                    }
                } else {
                    0
                };

                let usable = &window[..PAGE_SIZE as usize + lookahead];
                if let Some(hit) = scan_window(page, usable, start, last, alignment, needle) {
                    return Ok(Some(hit));
                }
            }

            match page.0.checked_add(step) {
                Some(next) => page = GcPhys(next),
                None => break,
            }
        }

        Ok(None)
    }
}

/// Scans one page-sized window for the needle, honoring the overall scan
/// bounds and alignment. `base` is the address of `window[0]`.
fn scan_window(
    base: GcPhys,
    window: &[u8],
    start: GcPhys,
    last: GcPhys,
    alignment: u64,
    needle: &[u8],
) -> Option<GcPhys> {
    // Candidates are aligned absolutely, not relative to the page base.
    let from = base.0.max(start.0);
    let mut offset = from.checked_next_multiple_of(alignment)? - base.0;

    // Match positions must start within this page.
    while offset < PAGE_SIZE {
        let addr = base + offset;
        if addr > last || addr.0.checked_add(needle.len() as u64 - 1)? > last.0 {
            return None;
        }

        let offset_usize = offset as usize;
        if offset_usize + needle.len() > window.len() {
            return None;
        }

        if alignment == 1 {
            // Let memchr skip ahead to the next candidate first byte.
            let haystack = &window[offset_usize..];
            match memchr::memchr(needle[0], haystack) {
                Some(found) => {
                    let candidate = offset_usize + found;
                    if candidate as u64 >= PAGE_SIZE {
                        return None;
                    }
                    if candidate + needle.len() <= window.len()
                        && window[candidate..candidate + needle.len()] == *needle
                    {
                        let addr = base + candidate as u64;
                        if addr.0 + needle.len() as u64 - 1 <= last.0 {
                            return Some(addr);
                        }
                        return None;
                    }
                    offset = candidate as u64 + 1;
                }
                None => return None,
            }
        } else {
            if window[offset_usize..offset_usize + needle.len()] == *needle {
                return Some(addr);
            }
            offset += alignment;
        }
    }

    None
}
