use indexmap::IndexMap;

use pgm_core::{GcPhys, HcPhys, PAGE_SIZE, PgmError, PgmResult, PhysPageDirectory, TrackingRef};

/// Nil link value for the pool's index-based lists.
pub const POOL_NIL: u16 = u16::MAX;

/// Synthetic host physical base of the pool's backing pages. Shadow table
/// entries link to each other through these addresses.
pub const POOL_HC_BASE: u64 = 0x8000_0000_0000;

/// Number of back-reference slots per extent record.
const EXTENT_SLOTS: usize = 3;

/// What a shadow pool page mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// 32-bit page table.
    Pt32,

    /// 32-bit page directory.
    Pd32,

    /// PAE page table.
    PtPae,

    /// PAE page directory.
    PdPae,

    /// PAE or long-mode page directory pointer table.
    Pdpt,

    /// Long-mode PML4.
    Pml4,

    /// EPT page table.
    EptPt,

    /// EPT page directory.
    EptPd,

    /// EPT page directory pointer table.
    EptPdpt,

    /// EPT PML4.
    EptPml4,
}

impl PoolKind {
    /// The size in bytes of one entry in a table of this kind.
    pub fn entry_size(self) -> usize {
        match self {
            Self::Pt32 | Self::Pd32 => 4,
            _ => 8,
        }
    }
}

/// One 4K page owned by the shadow pool.
#[derive(Debug)]
pub struct PoolPage {
    kind: Option<PoolKind>,
    gc_phys: GcPhys,
    data: Box<[u8]>,

    /// Guest writes to the mirrored table are intercepted; the page must not
    /// be evicted behind the monitor's back.
    monitored: bool,

    /// Exempt from eviction regardless of age (shadow roots).
    permanent: bool,

    /// Entries were zapped since the last sync.
    dirty: bool,

    /// Active users (mapped CR3 roots). Non-zero blocks eviction and flush.
    refs: u32,

    /// Guest pages this shadow table references, for cleanup on free.
    tracked: Vec<(GcPhys, u16)>,

    age_prev: u16,
    age_next: u16,
}

impl PoolPage {
    fn empty() -> Self {
        Self {
            kind: None,
            gc_phys: GcPhys(0),
            data: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
            monitored: false,
            permanent: false,
            dirty: false,
            refs: 0,
            tracked: Vec::new(),
            age_prev: POOL_NIL,
            age_next: POOL_NIL,
        }
    }

    /// The table kind, or `None` while the page sits on the free list.
    pub fn kind(&self) -> Option<PoolKind> {
        self.kind
    }

    /// The guest physical address of the mirrored guest table.
    pub fn gc_phys(&self) -> GcPhys {
        self.gc_phys
    }

    /// Whether guest writes to the mirrored table are intercepted.
    pub fn is_monitored(&self) -> bool {
        self.monitored
    }

    /// Whether the page is exempt from eviction.
    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    /// Whether entries were zapped since the last sync.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Active user count.
    pub fn refs(&self) -> u32 {
        self.refs
    }
}

/// One record in the extent arena: up to [`EXTENT_SLOTS`] back-references
/// and a link to the next record in the chain.
#[derive(Debug, Clone, Copy)]
struct PhysExtent {
    /// `(pool_idx, pte_idx)` pairs; a slot is free when `pool_idx` is nil.
    slots: [(u16, u16); EXTENT_SLOTS],
    next: u16,
}

impl PhysExtent {
    fn empty() -> Self {
        Self {
            slots: [(POOL_NIL, POOL_NIL); EXTENT_SLOTS],
            next: POOL_NIL,
        }
    }
}

/// The result of a pool allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAlloc {
    /// Index of the allocated page.
    pub idx: u16,

    /// Whether the identity cache already held a page for this
    /// `(kind, gc_phys)` pair.
    pub cached: bool,
}

/// The pool-side effect of a host backing change for one guest page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysInvalidation {
    /// No shadow entry referenced the page.
    None,

    /// This many shadow entries were zapped in place.
    Zapped(u32),

    /// Tracking had overflowed; every shadow table is suspect and the full
    /// flush protocol must run, followed by an all-VCPU TLB flush.
    FlushAll,
}

/// The fixed-size allocator for shadow paging structures.
///
/// Pages are identified by `(kind, guest table address)` and recycled through
/// an identity cache, so re-shadowing a recently used guest table is a cache
/// hit instead of a fresh allocation. An intrusive age list orders used pages
/// by recency; when the free list runs dry the least recently used page that
/// is neither monitored, permanent nor referenced is evicted. If nothing
/// qualifies the allocation fails with [`PgmError::PoolFlushRequired`] and
/// the owner must run the full flush protocol.
pub struct ShadowPagePool {
    pages: Vec<PoolPage>,
    free: Vec<u16>,

    cache: IndexMap<(PoolKind, GcPhys), u16>,
    cache_enabled: bool,

    /// Most recently used page.
    age_head: u16,
    /// Least recently used page, the eviction end.
    age_tail: u16,

    extents: Vec<PhysExtent>,
    extent_free: Vec<u16>,

    cache_hits: u64,
    evictions: u64,
    flushes: u64,
}

impl ShadowPagePool {
    /// Creates a pool with the given page capacity.
    pub fn new(capacity: u16, cache_enabled: bool) -> PgmResult<Self> {
        if capacity == 0 || capacity == POOL_NIL {
            return Err(PgmError::InvalidParameter("pool capacity"));
        }

        let pages = (0..capacity).map(|_| PoolPage::empty()).collect();
        // Pop order matches index order: lowest index first.
        let free = (0..capacity).rev().collect();

        let extent_count = capacity as usize * 2;
        let extents = vec![PhysExtent::empty(); extent_count];
        let extent_free = (0..extent_count as u16).rev().collect();

        Ok(Self {
            pages,
            free,
            cache: IndexMap::new(),
            cache_enabled,
            age_head: POOL_NIL,
            age_tail: POOL_NIL,
            extents,
            extent_free,
            cache_hits: 0,
            evictions: 0,
            flushes: 0,
        })
    }

    /// The total number of pool pages.
    pub fn capacity(&self) -> u16 {
        self.pages.len() as u16
    }

    /// The number of pages on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// The number of identity cache hits served so far.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    /// The number of evictions performed so far.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// The number of full flushes performed so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// The page at `idx`, if it is allocated.
    pub fn page(&self, idx: u16) -> Option<&PoolPage> {
        self.pages.get(idx as usize).filter(|p| p.kind.is_some())
    }

    /// The backing bytes of an allocated page.
    pub fn page_data(&self, idx: u16) -> PgmResult<&[u8]> {
        match self.pages.get(idx as usize) {
            Some(page) if page.kind.is_some() => Ok(&page.data),
            _ => Err(PgmError::InvalidParameter("pool index")),
        }
    }

    /// The synthetic host physical address of a pool page. Shadow entries
    /// use these to link to child tables.
    pub fn hc_phys_of(&self, idx: u16) -> HcPhys {
        HcPhys(POOL_HC_BASE + (idx as u64) * PAGE_SIZE)
    }

    /// Resolves a synthetic pool address back to a page index.
    pub fn page_by_hc_phys(&self, hc_phys: HcPhys) -> Option<u16> {
        let offset = hc_phys.0.checked_sub(POOL_HC_BASE)?;
        let idx = (offset / PAGE_SIZE) as usize;
        (offset % PAGE_SIZE == 0 && idx < self.pages.len() && self.pages[idx].kind.is_some())
            .then_some(idx as u16)
    }

    /// Allocates (or finds in the identity cache) a shadow page for the
    /// guest table at `gc_phys`.
    pub fn alloc(
        &mut self,
        directory: &mut PhysPageDirectory,
        kind: PoolKind,
        gc_phys: GcPhys,
    ) -> PgmResult<PoolAlloc> {
        if self.cache_enabled {
            if let Some(&idx) = self.cache.get(&(kind, gc_phys)) {
                self.cache_hits += 1;
                self.age_touch(idx);
                tracing::trace!(idx, ?kind, %gc_phys, "pool cache hit");
                return Ok(PoolAlloc { idx, cached: true });
            }
        }

        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                let victim = self.pick_victim().ok_or(PgmError::PoolFlushRequired)?;
                tracing::debug!(victim, "pool full, evicting");
                self.free_page(directory, victim)?;
                self.evictions += 1;
                self.free.pop().ok_or(PgmError::PoolFlushRequired)?
            }
        };

        let page = &mut self.pages[idx as usize];
        page.kind = Some(kind);
        page.gc_phys = gc_phys;
        page.data.fill(0);
        page.monitored = false;
        page.permanent = false;
        page.dirty = false;
        page.refs = 0;
        page.tracked.clear();

        self.age_push_head(idx);
        if self.cache_enabled {
            self.cache.insert((kind, gc_phys), idx);
        }

        tracing::trace!(idx, ?kind, %gc_phys, "pool page allocated");
        Ok(PoolAlloc { idx, cached: false })
    }

    /// Walks the age list tail-first for an evictable page.
    fn pick_victim(&self) -> Option<u16> {
        let mut idx = self.age_tail;
        while idx != POOL_NIL {
            let page = &self.pages[idx as usize];
            if !page.monitored && !page.permanent && page.refs == 0 {
                return Some(idx);
            }
            idx = page.age_prev;
        }
        None
    }

    /// Frees one page: drops its back-references, its cache entry and its
    /// age link, and returns it to the free list.
    pub fn free_page(&mut self, directory: &mut PhysPageDirectory, idx: u16) -> PgmResult<()> {
        let page = self
            .pages
            .get_mut(idx as usize)
            .ok_or(PgmError::InvalidParameter("pool index"))?;
        let Some(kind) = page.kind else {
            return Err(PgmError::InvalidParameter("pool page already free"));
        };
        if page.refs > 0 {
            return Err(PgmError::Corruption("freeing a referenced pool page"));
        }

        let gc_phys = page.gc_phys;
        let tracked = std::mem::take(&mut page.tracked);
        for (data_phys, pte_idx) in tracked {
            self.untrack_phys(directory, data_phys, idx, pte_idx)?;
        }

        let page = &mut self.pages[idx as usize];
        page.kind = None;
        page.monitored = false;
        page.permanent = false;
        page.dirty = false;

        self.age_unlink(idx);
        self.cache.swap_remove(&(kind, gc_phys));
        self.free.push(idx);
        Ok(())
    }

    /// Marks a page as a mapped root. Referenced pages cannot be evicted or
    /// flushed away.
    pub fn retain(&mut self, idx: u16) -> PgmResult<()> {
        let page = self
            .pages
            .get_mut(idx as usize)
            .filter(|p| p.kind.is_some())
            .ok_or(PgmError::InvalidParameter("pool index"))?;
        page.refs += 1;
        Ok(())
    }

    /// Drops a root reference.
    pub fn release(&mut self, idx: u16) -> PgmResult<()> {
        let page = self
            .pages
            .get_mut(idx as usize)
            .filter(|p| p.kind.is_some())
            .ok_or(PgmError::InvalidParameter("pool index"))?;
        if page.refs == 0 {
            return Err(PgmError::Corruption("pool refcount underflow"));
        }
        page.refs -= 1;
        Ok(())
    }

    /// Sets or clears write monitoring on a page.
    pub fn set_monitored(&mut self, idx: u16, monitored: bool) -> PgmResult<()> {
        let page = self
            .pages
            .get_mut(idx as usize)
            .filter(|p| p.kind.is_some())
            .ok_or(PgmError::InvalidParameter("pool index"))?;
        page.monitored = monitored;
        Ok(())
    }

    /// Sets or clears the eviction exemption on a page.
    pub fn set_permanent(&mut self, idx: u16, permanent: bool) -> PgmResult<()> {
        let page = self
            .pages
            .get_mut(idx as usize)
            .filter(|p| p.kind.is_some())
            .ok_or(PgmError::InvalidParameter("pool index"))?;
        page.permanent = permanent;
        Ok(())
    }

    /// Reads one entry of a shadow table.
    pub fn entry(&self, idx: u16, entry_idx: u16) -> PgmResult<u64> {
        let page = self
            .pages
            .get(idx as usize)
            .filter(|p| p.kind.is_some())
            .ok_or(PgmError::InvalidParameter("pool index"))?;
        let size = page.kind.map(PoolKind::entry_size).unwrap_or(8);
        let offset = entry_idx as usize * size;
        if offset + size > page.data.len() {
            return Err(PgmError::InvalidParameter("entry index"));
        }

        Ok(match size {
            4 => u32::from_le_bytes(page.data[offset..offset + 4].try_into().map_err(|_| {
                PgmError::Corruption("pool page backing truncated")
            })?) as u64,
            _ => u64::from_le_bytes(page.data[offset..offset + 8].try_into().map_err(|_| {
                PgmError::Corruption("pool page backing truncated")
            })?),
        })
    }

    /// Writes one entry of a shadow table.
    pub fn write_entry(&mut self, idx: u16, entry_idx: u16, value: u64) -> PgmResult<()> {
        let page = self
            .pages
            .get_mut(idx as usize)
            .filter(|p| p.kind.is_some())
            .ok_or(PgmError::InvalidParameter("pool index"))?;
        let size = page.kind.map(PoolKind::entry_size).unwrap_or(8);
        let offset = entry_idx as usize * size;
        if offset + size > page.data.len() {
            return Err(PgmError::InvalidParameter("entry index"));
        }

        match size {
            4 => page.data[offset..offset + 4].copy_from_slice(&(value as u32).to_le_bytes()),
            _ => page.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes()),
        }
        Ok(())
    }

    /// Records that entry `pte_idx` of pool page `pool_idx` now maps the
    /// guest page at `gc_phys`.
    ///
    /// The first reference costs one inline slot on the physical page. A
    /// second promotes it to an extent chain; exhausting the arena gives up
    /// and marks the page overflowed.
    pub fn track_reference(
        &mut self,
        directory: &mut PhysPageDirectory,
        gc_phys: GcPhys,
        pool_idx: u16,
        pte_idx: u16,
    ) -> PgmResult<()> {
        if self.page(pool_idx).is_none() {
            return Err(PgmError::InvalidParameter("pool index"));
        }

        let tracking = directory.page_at(gc_phys)?.tracking();
        let updated = match tracking {
            TrackingRef::None => TrackingRef::Single { pool_idx, pte_idx },

            TrackingRef::Single {
                pool_idx: other_pool,
                pte_idx: other_pte,
            } => match self.extent_free.pop() {
                Some(ext) => {
                    let extent = &mut self.extents[ext as usize];
                    *extent = PhysExtent::empty();
                    extent.slots[0] = (other_pool, other_pte);
                    extent.slots[1] = (pool_idx, pte_idx);
                    TrackingRef::Extent(ext)
                }
                None => TrackingRef::Overflowed,
            },

            TrackingRef::Extent(head) => {
                match self.extent_insert(head, pool_idx, pte_idx) {
                    Some(head) => TrackingRef::Extent(head),
                    None => {
                        self.extent_free_chain(head);
                        TrackingRef::Overflowed
                    }
                }
            }

            TrackingRef::Overflowed => TrackingRef::Overflowed,
        };

        directory.page_mut_at(gc_phys)?.set_tracking(updated);
        self.pages[pool_idx as usize].tracked.push((gc_phys, pte_idx));
        Ok(())
    }

    /// Inserts into an extent chain, growing it if needed. `None` means the
    /// arena is exhausted.
    fn extent_insert(&mut self, head: u16, pool_idx: u16, pte_idx: u16) -> Option<u16> {
        let mut idx = head;
        loop {
            let extent = &mut self.extents[idx as usize];
            for slot in &mut extent.slots {
                if slot.0 == POOL_NIL {
                    *slot = (pool_idx, pte_idx);
                    return Some(head);
                }
            }
            if extent.next == POOL_NIL {
                break;
            }
            idx = extent.next;
        }

        let ext = self.extent_free.pop()?;
        let extent = &mut self.extents[ext as usize];
        *extent = PhysExtent::empty();
        extent.slots[0] = (pool_idx, pte_idx);
        extent.next = head;
        Some(ext)
    }

    fn extent_free_chain(&mut self, head: u16) {
        let mut idx = head;
        while idx != POOL_NIL {
            let next = self.extents[idx as usize].next;
            self.extents[idx as usize] = PhysExtent::empty();
            self.extent_free.push(idx);
            idx = next;
        }
    }

    /// Removes one back-reference, demoting the tracking tier when the
    /// reference count allows it. An overflowed page stays overflowed.
    pub fn untrack_reference(
        &mut self,
        directory: &mut PhysPageDirectory,
        gc_phys: GcPhys,
        pool_idx: u16,
        pte_idx: u16,
    ) -> PgmResult<()> {
        self.untrack_phys(directory, gc_phys, pool_idx, pte_idx)?;
        if let Some(page) = self.pages.get_mut(pool_idx as usize) {
            if let Some(pos) = page
                .tracked
                .iter()
                .position(|&(gc, pte)| gc == gc_phys && pte == pte_idx)
            {
                page.tracked.swap_remove(pos);
            }
        }
        Ok(())
    }

    /// The physical-page side of untracking, without touching the pool
    /// page's forward list.
    fn untrack_phys(
        &mut self,
        directory: &mut PhysPageDirectory,
        gc_phys: GcPhys,
        pool_idx: u16,
        pte_idx: u16,
    ) -> PgmResult<()> {
        let tracking = directory.page_at(gc_phys)?.tracking();
        let updated = match tracking {
            TrackingRef::None => TrackingRef::None,

            TrackingRef::Single {
                pool_idx: p,
                pte_idx: e,
            } if p == pool_idx && e == pte_idx => TrackingRef::None,
            single @ TrackingRef::Single { .. } => single,

            TrackingRef::Extent(head) => {
                let mut idx = head;
                'chain: while idx != POOL_NIL {
                    let extent = &mut self.extents[idx as usize];
                    for slot in &mut extent.slots {
                        if *slot == (pool_idx, pte_idx) {
                            *slot = (POOL_NIL, POOL_NIL);
                            break 'chain;
                        }
                    }
                    idx = extent.next;
                }
                self.extent_compact(head)
            }

            TrackingRef::Overflowed => TrackingRef::Overflowed,
        };

        directory.page_mut_at(gc_phys)?.set_tracking(updated);
        Ok(())
    }

    /// Collapses an extent chain after a removal: one remaining reference
    /// demotes to the inline tier, zero to no tracking.
    fn extent_compact(&mut self, head: u16) -> TrackingRef {
        let mut remaining = Vec::new();
        let mut idx = head;
        while idx != POOL_NIL {
            for slot in self.extents[idx as usize].slots {
                if slot.0 != POOL_NIL {
                    remaining.push(slot);
                }
            }
            idx = self.extents[idx as usize].next;
        }

        match remaining.len() {
            0 => {
                self.extent_free_chain(head);
                TrackingRef::None
            }
            1 => {
                self.extent_free_chain(head);
                TrackingRef::Single {
                    pool_idx: remaining[0].0,
                    pte_idx: remaining[0].1,
                }
            }
            _ => TrackingRef::Extent(head),
        }
    }

    /// Reacts to a host backing change of the guest page at `gc_phys`: every
    /// shadow entry still mapping the old backing is zapped in place.
    ///
    /// An overflowed page cannot be handled precisely and escalates to the
    /// full flush protocol.
    pub fn invalidate_phys(
        &mut self,
        directory: &mut PhysPageDirectory,
        gc_phys: GcPhys,
    ) -> PgmResult<PhysInvalidation> {
        let tracking = directory.page_at(gc_phys)?.tracking();
        let result = match tracking {
            TrackingRef::None => PhysInvalidation::None,

            TrackingRef::Single { pool_idx, pte_idx } => {
                self.zap_entry(gc_phys, pool_idx, pte_idx);
                PhysInvalidation::Zapped(1)
            }

            TrackingRef::Extent(head) => {
                let mut refs = Vec::new();
                let mut idx = head;
                while idx != POOL_NIL {
                    for slot in self.extents[idx as usize].slots {
                        if slot.0 != POOL_NIL {
                            refs.push(slot);
                        }
                    }
                    idx = self.extents[idx as usize].next;
                }
                self.extent_free_chain(head);

                let count = refs.len() as u32;
                for (pool_idx, pte_idx) in refs {
                    self.zap_entry(gc_phys, pool_idx, pte_idx);
                }
                PhysInvalidation::Zapped(count)
            }

            TrackingRef::Overflowed => PhysInvalidation::FlushAll,
        };

        if result != PhysInvalidation::FlushAll {
            directory.page_mut_at(gc_phys)?.set_tracking(TrackingRef::None);
        }
        tracing::trace!(%gc_phys, ?result, "phys tracking invalidated");
        Ok(result)
    }

    /// Clears one shadow entry and drops the forward reference.
    fn zap_entry(&mut self, gc_phys: GcPhys, pool_idx: u16, pte_idx: u16) {
        if let Some(page) = self.pages.get_mut(pool_idx as usize) {
            if let Some(kind) = page.kind {
                let size = kind.entry_size();
                let offset = pte_idx as usize * size;
                if offset + size <= page.data.len() {
                    page.data[offset..offset + size].fill(0);
                }
                page.dirty = true;
            }
            if let Some(pos) = page
                .tracked
                .iter()
                .position(|&(gc, pte)| gc == gc_phys && pte == pte_idx)
            {
                page.tracked.swap_remove(pos);
            }
        }
    }

    /// Frees every pool page at once.
    ///
    /// All CR3 roots must have been unmapped first; a live reference here
    /// means a VCPU would keep running on freed shadow structures.
    pub fn flush_all(&mut self, directory: &mut PhysPageDirectory) -> PgmResult<()> {
        if self.pages.iter().any(|p| p.refs > 0) {
            return Err(PgmError::Corruption("pool flush with mapped roots"));
        }

        for idx in 0..self.pages.len() as u16 {
            if self.pages[idx as usize].kind.is_some() {
                self.pages[idx as usize].permanent = false;
                self.pages[idx as usize].monitored = false;
                self.free_page(directory, idx)?;
            }
        }

        self.flushes += 1;
        tracing::debug!(flushes = self.flushes, "pool flushed");
        Ok(())
    }

    /// Verifies the pool's list invariants in both traversal directions and
    /// cross-checks the cache and free list against the page records.
    pub fn check_integrity(&self) -> PgmResult<()> {
        let used = self.pages.iter().filter(|p| p.kind.is_some()).count();
        if used + self.free.len() != self.pages.len() {
            return Err(PgmError::Corruption("pool free list count mismatch"));
        }

        let mut forward = 0usize;
        let mut idx = self.age_head;
        let mut prev = POOL_NIL;
        while idx != POOL_NIL {
            let page = &self.pages[idx as usize];
            if page.kind.is_none() {
                return Err(PgmError::Corruption("free page on the age list"));
            }
            if page.age_prev != prev {
                return Err(PgmError::Corruption("age list prev link broken"));
            }
            forward += 1;
            if forward > self.pages.len() {
                return Err(PgmError::Corruption("age list cycle"));
            }
            prev = idx;
            idx = page.age_next;
        }
        if prev != self.age_tail {
            return Err(PgmError::Corruption("age list tail mismatch"));
        }

        let mut backward = 0usize;
        let mut idx = self.age_tail;
        let mut next = POOL_NIL;
        while idx != POOL_NIL {
            let page = &self.pages[idx as usize];
            if page.age_next != next {
                return Err(PgmError::Corruption("age list next link broken"));
            }
            backward += 1;
            if backward > self.pages.len() {
                return Err(PgmError::Corruption("age list cycle (reverse walk)"));
            }
            next = idx;
            idx = page.age_prev;
        }

        if forward != backward || forward != used {
            return Err(PgmError::Corruption("age list does not cover used pages"));
        }

        for (&(kind, gc_phys), &idx) in &self.cache {
            let page = self
                .pages
                .get(idx as usize)
                .ok_or(PgmError::Corruption("cache points past the pool"))?;
            if page.kind != Some(kind) || page.gc_phys != gc_phys {
                return Err(PgmError::Corruption("cache entry does not match its page"));
            }
        }

        Ok(())
    }

    fn age_push_head(&mut self, idx: u16) {
        let old_head = self.age_head;
        self.pages[idx as usize].age_prev = POOL_NIL;
        self.pages[idx as usize].age_next = old_head;
        if old_head != POOL_NIL {
            self.pages[old_head as usize].age_prev = idx;
        }
        self.age_head = idx;
        if self.age_tail == POOL_NIL {
            self.age_tail = idx;
        }
    }

    fn age_unlink(&mut self, idx: u16) {
        let (prev, next) = {
            let page = &self.pages[idx as usize];
            (page.age_prev, page.age_next)
        };

        if prev != POOL_NIL {
            self.pages[prev as usize].age_next = next;
        } else if self.age_head == idx {
            self.age_head = next;
        }
        if next != POOL_NIL {
            self.pages[next as usize].age_prev = prev;
        } else if self.age_tail == idx {
            self.age_tail = prev;
        }

        let page = &mut self.pages[idx as usize];
        page.age_prev = POOL_NIL;
        page.age_next = POOL_NIL;
    }

    fn age_touch(&mut self, idx: u16) {
        if self.age_head != idx {
            self.age_unlink(idx);
            self.age_push_head(idx);
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod pool_tests;
