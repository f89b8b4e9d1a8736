use pgm_arch_x86::{GuestPageWalker, WalkConfig, WalkOutcome};
use pgm_core::{
    GcPhys, GcPtr, HcPhys, MemoryAccess, PAGE_OFFSET_MASK, PAGE_SHIFT, PageState, PageType,
    PgmError, PgmResult, PhysPageDirectory,
};

use crate::{
    pool::{PhysInvalidation, ShadowPagePool},
    sync::PendingInvalidations,
};

/// One mapped region of a registered shared module.
#[derive(Debug, Clone)]
pub struct SharedRegion {
    /// Page-aligned guest virtual base of the region.
    pub gc_ptr: GcPtr,

    /// Region size in bytes, a multiple of the page size.
    pub size: u64,
}

/// A guest module registered for cross-VM page de-duplication, e.g. a
/// system DLL the guest additions reported.
#[derive(Debug, Clone)]
pub struct SharedModule {
    /// Module name, as reported by the guest.
    pub name: String,

    /// Module version; pages only match within the same version.
    pub version: String,

    /// The module's mapped regions.
    pub regions: Vec<SharedRegion>,
}

/// A candidate page offered to the host-global sharing service.
#[derive(Debug, Clone, Copy)]
pub struct SharedPageDesc {
    /// Guest virtual address of the page.
    pub gc_ptr: GcPtr,

    /// Guest physical address the page currently translates to.
    pub gc_phys: GcPhys,

    /// Host physical address of the private backing being offered up.
    pub hc_phys: HcPhys,

    /// The page's current allocator identifier.
    pub page_id: u32,
}

/// A successful match against the host-global content index.
#[derive(Debug, Clone, Copy)]
pub struct SharedPageMatch {
    /// Identifier of the shared copy.
    pub page_id: u32,

    /// Host physical address of the shared copy.
    pub hc_phys: HcPhys,
}

/// The host-global service that owns the de-duplicated copies. Matching is
/// content-based and outside this crate's scope; the engine only deals in
/// offers and matches.
pub trait PageSharingService {
    /// Offers one candidate page. `Some` means a content match exists and
    /// the page should adopt the shared copy.
    fn match_page(
        &mut self,
        module: &SharedModule,
        region: usize,
        page: usize,
        desc: &SharedPageDesc,
    ) -> Option<SharedPageMatch>;
}

/// Counters for one module scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Candidate pages offered to the service.
    pub pages_offered: u64,

    /// Pages that adopted a shared copy.
    pub pages_shared: u64,

    /// Mapped pages skipped because they were writable or not private RAM.
    pub pages_skipped: u64,

    /// Matches dropped because the mapping changed between the offer and
    /// the adoption.
    pub rejected_at_recheck: u64,

    /// Invalidation work for the caller to apply once, at the end.
    pub pending: PendingInvalidations,
}

/// The outcome of one adoption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptOutcome {
    /// The page now uses the shared copy.
    Shared {
        /// Shadow-side invalidation that the backing change triggered.
        invalidation: PhysInvalidation,
    },

    /// The mapping or page state changed since the candidate was selected;
    /// nothing was mutated.
    Rejected,
}

/// Walks registered module regions and trades eligible private pages for
/// shared copies.
///
/// A page is eligible when its translation is present and read-only and the
/// backing is privately allocated RAM. Eligibility is decided twice: once
/// when offering, and again immediately before the state mutation, because
/// another VCPU may have written to (and thus privatized or remapped) the
/// page in between.
#[derive(Debug, Default)]
pub struct PageSharingEngine {
    modules: Vec<SharedModule>,
}

impl PageSharingEngine {
    /// Creates an engine with no registered modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module for scanning.
    pub fn register_module(&mut self, module: SharedModule) -> PgmResult<usize> {
        for region in &module.regions {
            if region.size == 0 || region.size & PAGE_OFFSET_MASK != 0 {
                return Err(PgmError::InvalidParameter("region size"));
            }
            if region.gc_ptr.0 & PAGE_OFFSET_MASK != 0 {
                return Err(PgmError::InvalidParameter("region alignment"));
            }
        }

        tracing::debug!(name = module.name, version = module.version, "module registered");
        self.modules.push(module);
        Ok(self.modules.len() - 1)
    }

    /// Removes a module. Already shared pages stay shared; they break on
    /// the next write like any other shared page.
    pub fn unregister_module(&mut self, index: usize) -> PgmResult<SharedModule> {
        if index >= self.modules.len() {
            return Err(PgmError::InvalidParameter("module index"));
        }
        Ok(self.modules.remove(index))
    }

    /// The registered modules.
    pub fn modules(&self) -> &[SharedModule] {
        &self.modules
    }

    /// Scans one module's regions against the sharing service.
    ///
    /// Unmapped stretches are crossed with the walker's skip-ahead hints
    /// rather than page by page. All invalidation work is accumulated in
    /// the summary for the caller to apply once.
    pub fn scan_module(
        &self,
        directory: &mut PhysPageDirectory,
        pool: &mut ShadowPagePool,
        config: WalkConfig,
        module_idx: usize,
        service: &mut dyn PageSharingService,
    ) -> PgmResult<ScanSummary> {
        let module = self
            .modules
            .get(module_idx)
            .ok_or(PgmError::InvalidParameter("module index"))?;

        let mut summary = ScanSummary::default();

        for (region_idx, region) in module.regions.iter().enumerate() {
            let pages = region.size >> PAGE_SHIFT;

            // Candidate selection. The walker only borrows the directory for
            // reading, so the mutating adoption runs in a second pass; the
            // adoption re-validates everything anyway.
            let mut candidates = Vec::new();
            {
                let mut walker = GuestPageWalker::new(&*directory, config);
                let mut page = 0u64;
                while page < pages {
                    let gc_ptr = GcPtr(region.gc_ptr.0 + (page << PAGE_SHIFT));

                    match walker.walk_next(gc_ptr) {
                        WalkOutcome::Mapped(info) => {
                            if info.access().contains(MemoryAccess::W) {
                                summary.pages_skipped += 1;
                            } else {
                                let gc_phys = info.gc_phys.page_align();
                                match directory.page_at(gc_phys) {
                                    Ok(phys)
                                        if phys.page_type() == PageType::Ram
                                            && phys.state() == PageState::Allocated =>
                                    {
                                        candidates.push((
                                            page,
                                            SharedPageDesc {
                                                gc_ptr,
                                                gc_phys,
                                                hc_phys: phys.hc_phys(),
                                                page_id: phys.page_id(),
                                            },
                                        ));
                                    }
                                    _ => summary.pages_skipped += 1,
                                }
                            }
                            page += 1;
                        }
                        WalkOutcome::RootNotPresent => break,
                        outcome => page += outcome.pages_skip(),
                    }
                }
            }

            for (page, desc) in candidates {
                summary.pages_offered += 1;
                let Some(matched) = service.match_page(module, region_idx, page as usize, &desc)
                else {
                    continue;
                };

                match adopt_shared_copy(directory, pool, config, desc.gc_ptr, desc.gc_phys, matched)?
                {
                    AdoptOutcome::Shared { invalidation } => {
                        summary.pages_shared += 1;
                        summary.pending.tlb_flush_all = true;
                        if invalidation == PhysInvalidation::FlushAll {
                            summary.pending.pool_flush = true;
                        }
                    }
                    AdoptOutcome::Rejected => summary.rejected_at_recheck += 1,
                }
            }
        }

        tracing::debug!(
            module = module.name,
            offered = summary.pages_offered,
            shared = summary.pages_shared,
            "module scanned"
        );
        Ok(summary)
    }
}

/// Trades one page's private backing for a shared copy.
///
/// Eligibility is re-established from scratch here: a full fresh walk, and a
/// fresh look at the page state. Any drift since the candidate was selected
/// rejects the adoption without mutating anything.
pub fn adopt_shared_copy(
    directory: &mut PhysPageDirectory,
    pool: &mut ShadowPagePool,
    config: WalkConfig,
    gc_ptr: GcPtr,
    expected_phys: GcPhys,
    matched: SharedPageMatch,
) -> PgmResult<AdoptOutcome> {
    let mut walker = GuestPageWalker::new(directory, config);
    let info = match walker.walk(gc_ptr) {
        WalkOutcome::Mapped(info) => info,
        _ => return Ok(AdoptOutcome::Rejected),
    };
    if info.access().contains(MemoryAccess::W) || info.gc_phys.page_align() != expected_phys {
        return Ok(AdoptOutcome::Rejected);
    }

    match directory.page_at(expected_phys) {
        Ok(page) if page.page_type() == PageType::Ram && page.state() == PageState::Allocated => {}
        _ => return Ok(AdoptOutcome::Rejected),
    }

    // The old backing dies with the swap; no shadow entry may keep pointing
    // at it.
    let invalidation = pool.invalidate_phys(directory, expected_phys)?;
    directory.share_page(expected_phys, matched.hc_phys, matched.page_id)?;

    tracing::trace!(%gc_ptr, %expected_phys, page_id = matched.page_id, "shared copy adopted");
    Ok(AdoptOutcome::Shared { invalidation })
}

#[cfg(test)]
#[path = "sharing_tests.rs"]
mod sharing_tests;
