use crate::{GcPhys, PAGE_SHIFT, PAGE_SIZE, PgmError, PgmResult};

use super::page::PhysPage;

/// A described, non-overlapping interval of guest physical memory owning a
/// contiguous array of per-page state and its byte backing.
pub struct RamRange {
    gc_phys: GcPhys,
    gc_phys_last: GcPhys,
    desc: String,
    pages: Vec<PhysPage>,
    backing: Vec<u8>,
}

impl RamRange {
    pub(crate) fn new(gc_phys: GcPhys, pages: Vec<PhysPage>, desc: String) -> Self {
        let page_count = pages.len() as u64;
        let gc_phys_last = gc_phys + (page_count * PAGE_SIZE - 1);
        let backing = vec![0u8; (page_count << PAGE_SHIFT) as usize];

        Self {
            gc_phys,
            gc_phys_last,
            desc,
            pages,
            backing,
        }
    }

    /// The first address covered by this range.
    pub fn gc_phys(&self) -> GcPhys {
        self.gc_phys
    }

    /// The last address covered by this range (inclusive).
    pub fn gc_phys_last(&self) -> GcPhys {
        self.gc_phys_last
    }

    /// The description given at registration.
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// The number of pages in this range.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Whether the range covers the given address.
    pub fn contains(&self, gc_phys: GcPhys) -> bool {
        self.gc_phys <= gc_phys && gc_phys <= self.gc_phys_last
    }

    pub(crate) fn page_index(&self, gc_phys: GcPhys) -> PgmResult<usize> {
        if !self.contains(gc_phys) {
            return Err(PgmError::OutOfRange(gc_phys));
        }

        Ok(((gc_phys - self.gc_phys).0 >> PAGE_SHIFT) as usize)
    }

    /// The page record covering the given address.
    pub fn page_at(&self, gc_phys: GcPhys) -> PgmResult<&PhysPage> {
        let index = self.page_index(gc_phys)?;
        Ok(&self.pages[index])
    }

    /// The mutable page record covering the given address.
    pub fn page_mut_at(&mut self, gc_phys: GcPhys) -> PgmResult<&mut PhysPage> {
        let index = self.page_index(gc_phys)?;
        Ok(&mut self.pages[index])
    }

    /// Iterates over the page records in this range.
    pub fn pages(&self) -> impl Iterator<Item = (GcPhys, &PhysPage)> {
        self.pages
            .iter()
            .enumerate()
            .map(|(i, page)| (self.gc_phys + ((i as u64) << PAGE_SHIFT), page))
    }

    pub(crate) fn pages_mut(&mut self) -> impl Iterator<Item = &mut PhysPage> {
        self.pages.iter_mut()
    }

    /// The backing bytes of the page with the given index within the range.
    pub fn page_bytes(&self, index: usize) -> &[u8] {
        let offset = index << PAGE_SHIFT;
        &self.backing[offset..offset + PAGE_SIZE as usize]
    }

    pub(crate) fn page_bytes_mut(&mut self, index: usize) -> &mut [u8] {
        let offset = index << PAGE_SHIFT;
        &mut self.backing[offset..offset + PAGE_SIZE as usize]
    }
}
