use std::num::NonZeroUsize;

use lru::LruCache;

use pgm_arch_x86::{GuestPageWalker, WalkFlags, WalkInfo, WalkLevel, WalkOutcome};
use pgm_core::{
    AccessHandlerKind, AccessHandlerTree, AccessKind, GcPhys, GcPtr, HANDLER_CAPACITY,
    HANDLER_CAPACITY_DRIVERLESS, HandlerAction, MAX_NEEDLE_SIZE, MAX_SCAN_ALIGNMENT, PAGE_SIZE,
    PgmError, PgmResult, PhysPageDirectory,
};

use crate::{
    dump::{DumpFlags, DumpReport, HierarchyDumper},
    pool::{PhysInvalidation, ShadowPagePool},
    sharing::{PageSharingEngine, PageSharingService, ScanSummary, SharedModule},
    sync::{
        GuestMode, HostCaps, PendingInvalidations, ShadowSyncEngine, VcpuPagingContext,
    },
};

/// Capacity of the per-VM virtual-to-physical debug translation cache.
const V2P_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(8192).unwrap();

/// Construction parameters for a [`Pgm`] instance.
#[derive(Debug, Clone, Copy)]
pub struct PgmConfig {
    /// Host capabilities.
    pub host: HostCaps,

    /// Number of VCPUs.
    pub vcpu_count: u32,

    /// Shadow pool size in pages.
    pub pool_pages: u16,

    /// Whether the pool identity cache is enabled.
    pub pool_cache_enabled: bool,

    /// Use the reduced handler capacity of the driverless setup.
    pub driverless: bool,
}

/// The per-VM guest memory engine: physical ground truth, access handlers,
/// the shadow pool, per-VCPU paging state, and the debug access surface
/// built on top of them.
pub struct Pgm {
    memory: PhysPageDirectory,
    handlers: AccessHandlerTree,
    pool: ShadowPagePool,
    sync: ShadowSyncEngine,
    sharing: PageSharingEngine,
    vcpus: Vec<VcpuPagingContext>,

    /// Debug translation cache, keyed by `(cr3, page virtual address)`.
    /// Dropped wholesale on anything that could change translations.
    v2p: LruCache<(u64, u64), GcPhys>,
}

impl Pgm {
    /// Creates the engine for one VM.
    pub fn new(config: PgmConfig) -> PgmResult<Self> {
        if config.vcpu_count == 0 {
            return Err(PgmError::InvalidParameter("vcpu count"));
        }

        let handler_capacity = if config.driverless {
            HANDLER_CAPACITY_DRIVERLESS
        } else {
            HANDLER_CAPACITY
        };

        Ok(Self {
            memory: PhysPageDirectory::new(),
            handlers: AccessHandlerTree::with_capacity(handler_capacity),
            pool: ShadowPagePool::new(config.pool_pages, config.pool_cache_enabled)?,
            sync: ShadowSyncEngine::new(config.host)?,
            sharing: PageSharingEngine::new(),
            vcpus: (0..config.vcpu_count).map(VcpuPagingContext::new).collect(),
            v2p: LruCache::new(V2P_CACHE_CAPACITY),
        })
    }

    /// The physical page directory.
    pub fn memory(&self) -> &PhysPageDirectory {
        &self.memory
    }

    /// The physical page directory, mutably (range registration, physical
    /// debug access).
    pub fn memory_mut(&mut self) -> &mut PhysPageDirectory {
        &mut self.memory
    }

    /// The access handler tree.
    pub fn handlers(&self) -> &AccessHandlerTree {
        &self.handlers
    }

    /// The access handler tree, mutably (registration).
    pub fn handlers_mut(&mut self) -> &mut AccessHandlerTree {
        &mut self.handlers
    }

    /// The shadow page pool.
    pub fn pool(&self) -> &ShadowPagePool {
        &self.pool
    }

    /// The pool and the directory together, for callers populating shadow
    /// tables (pool mutation tracks back-references through the directory).
    pub fn pool_and_memory_mut(&mut self) -> (&mut ShadowPagePool, &mut PhysPageDirectory) {
        (&mut self.pool, &mut self.memory)
    }

    /// One VCPU's paging context.
    pub fn vcpu(&self, vcpu: u32) -> PgmResult<&VcpuPagingContext> {
        self.vcpus
            .get(vcpu as usize)
            .ok_or(PgmError::InvalidParameter("vcpu id"))
    }

    /// One VCPU's paging context, mutably (CR4/EFER/A20 updates).
    pub fn vcpu_mut(&mut self, vcpu: u32) -> PgmResult<&mut VcpuPagingContext> {
        self.vcpus
            .get_mut(vcpu as usize)
            .ok_or(PgmError::InvalidParameter("vcpu id"))
    }

    /// Switches a VCPU to a new guest paging mode. An exhausted pool is
    /// serviced in place with the flush protocol and a retry.
    pub fn change_mode(&mut self, vcpu: u32, guest_mode: GuestMode, cr3: GcPhys) -> PgmResult<()> {
        let idx = vcpu as usize;
        if idx >= self.vcpus.len() {
            return Err(PgmError::InvalidParameter("vcpu id"));
        }

        match self
            .sync
            .change_mode(&mut self.vcpus[idx], &mut self.pool, &mut self.memory, guest_mode, cr3)
        {
            Err(PgmError::PoolFlushRequired) => {
                self.sync
                    .flush_pool(&mut self.vcpus, &mut self.pool, &mut self.memory)?;
                self.sync.change_mode(
                    &mut self.vcpus[idx],
                    &mut self.pool,
                    &mut self.memory,
                    guest_mode,
                    cr3,
                )?;
            }
            result => result?,
        }
        self.v2p.clear();
        Ok(())
    }

    /// Follows a guest CR3 write without a mode change, with the same pool
    /// exhaustion handling as a mode change.
    pub fn switch_cr3(&mut self, vcpu: u32, cr3: GcPhys) -> PgmResult<()> {
        let idx = vcpu as usize;
        if idx >= self.vcpus.len() {
            return Err(PgmError::InvalidParameter("vcpu id"));
        }

        match self
            .sync
            .switch_cr3(&mut self.vcpus[idx], &mut self.pool, &mut self.memory, cr3)
        {
            Err(PgmError::PoolFlushRequired) => {
                self.sync
                    .flush_pool(&mut self.vcpus, &mut self.pool, &mut self.memory)?;
                self.sync
                    .switch_cr3(&mut self.vcpus[idx], &mut self.pool, &mut self.memory, cr3)?;
            }
            result => result?,
        }
        self.v2p.clear();
        Ok(())
    }

    /// Services an INVLPG: drops the cached translation of one page.
    pub fn invalidate_page(&mut self, vcpu: u32, addr: GcPtr) -> PgmResult<()> {
        let ctx = self.vcpu(vcpu)?;
        let key = (ctx.cr3().0, addr.page_align().0);
        self.v2p.pop(&key);
        Ok(())
    }

    /// Performs a full, uncached walk of the guest tables.
    pub fn translate(&self, vcpu: u32, addr: GcPtr) -> PgmResult<WalkOutcome> {
        let ctx = self.vcpu(vcpu)?;
        if ctx.guest_mode() == GuestMode::None {
            return Ok(identity_mapping(addr));
        }

        let config = ctx.walk_config()?;
        let mut walker = GuestPageWalker::new(&self.memory, config);
        Ok(walker.walk(addr))
    }

    /// Translates one address for the debug accessors, through the cache.
    fn translate_page(&mut self, vcpu: u32, addr: GcPtr) -> PgmResult<GcPhys> {
        let ctx = self
            .vcpus
            .get(vcpu as usize)
            .ok_or(PgmError::InvalidParameter("vcpu id"))?;
        if ctx.guest_mode() == GuestMode::None {
            return Ok(GcPhys(addr.0));
        }

        let config = ctx.walk_config()?;
        let key = (config.cr3.0, addr.page_align().0);
        if let Some(&page) = self.v2p.get(&key) {
            return Ok(page + addr.offset());
        }

        let outcome = {
            let mut walker = GuestPageWalker::new(&self.memory, config);
            walker.walk(addr)
        };
        match outcome {
            WalkOutcome::Mapped(info) => {
                let page = info.gc_phys.page_align();
                self.v2p.put(key, page);
                Ok(page + addr.offset())
            }
            _ => Err(PgmError::NotMapped(addr)),
        }
    }

    /// Reads guest virtual memory through one VCPU's paging mode.
    ///
    /// Same short-count contract as the physical accessor: with `actual`
    /// provided, a failure after the first byte (unmapped page, handler-only
    /// page) reports success with the short count.
    pub fn read_virt(
        &mut self,
        vcpu: u32,
        addr: GcPtr,
        buf: &mut [u8],
        mut actual: Option<&mut usize>,
    ) -> PgmResult<()> {
        if buf.is_empty() {
            return Err(PgmError::InvalidParameter("zero-length read"));
        }

        let mut done = 0usize;
        let mut addr = addr;

        while done < buf.len() {
            let offset = addr.offset() as usize;
            let chunk = std::cmp::min(PAGE_SIZE as usize - offset, buf.len() - done);

            let result = self
                .translate_page(vcpu, addr)
                .and_then(|phys| self.memory.read_phys(phys, &mut buf[done..done + chunk], None));
            match result {
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

    /// Writes guest virtual memory, with the same short-count contract as
    /// [`read_virt`](Self::read_virt).
    ///
    /// The write may land in a guest page table, so the translation cache
    /// is dropped afterwards.
    pub fn write_virt(
        &mut self,
        vcpu: u32,
        addr: GcPtr,
        data: &[u8],
        mut actual: Option<&mut usize>,
    ) -> PgmResult<()> {
        if data.is_empty() {
            return Err(PgmError::InvalidParameter("zero-length write"));
        }

        let mut done = 0usize;
        let mut addr = addr;

        while done < data.len() {
            let offset = addr.offset() as usize;
            let chunk = std::cmp::min(PAGE_SIZE as usize - offset, data.len() - done);

            let written = self
                .translate_page(vcpu, addr)
                .and_then(|phys| self.memory.write_phys(phys, &data[done..done + chunk], None));
            match written {
                Ok(()) => {
                    done += chunk;
                    addr = addr.page_align() + PAGE_SIZE;
                }
                Err(err) => {
                    if done > 0 {
                        self.v2p.clear();
                    }
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

        self.v2p.clear();
        if let Some(actual) = actual.as_deref_mut() {
            *actual = done;
        }
        Ok(())
    }

    /// Scans guest virtual memory for `needle` at the given alignment.
    ///
    /// Unmapped stretches, including the whole non-canonical hole, are
    /// crossed with the walker's skip-ahead hints. A needle may match
    /// across the boundary of two virtually contiguous mapped pages.
    pub fn scan_virtual(
        &self,
        vcpu: u32,
        start: GcPtr,
        cb: u64,
        alignment: u64,
        needle: &[u8],
    ) -> PgmResult<Option<GcPtr>> {
        if needle.is_empty() || needle.len() > MAX_NEEDLE_SIZE {
            return Err(PgmError::InvalidParameter("needle length"));
        }
        if !alignment.is_power_of_two() || alignment > MAX_SCAN_ALIGNMENT {
            return Err(PgmError::InvalidParameter("alignment"));
        }
        if cb < needle.len() as u64 {
            return Ok(None);
        }

        let ctx = self.vcpu(vcpu)?;
        if ctx.guest_mode() == GuestMode::None {
            return Ok(self
                .memory
                .scan_physical(GcPhys(start.0), cb, alignment, needle)?
                .map(|hit| GcPtr(hit.0)));
        }

        let config = ctx.walk_config()?;
        let mut walker = GuestPageWalker::new(&self.memory, config);

        let last = start.0.saturating_add(cb - 1);
        let mut carry: Vec<u8> = Vec::new();
        let mut page_buf = vec![0u8; PAGE_SIZE as usize];

        let mut page_va = start.page_align().0;
        while page_va <= last {
            match walker.walk_next(GcPtr(page_va)) {
                WalkOutcome::Mapped(info) => {
                    let page_phys = info.gc_phys.page_align();
                    if self.memory.read_phys(page_phys, &mut page_buf, None).is_ok() {
                        let base_va = page_va - carry.len() as u64;
                        let mut window = Vec::with_capacity(carry.len() + page_buf.len());
                        window.extend_from_slice(&carry);
                        window.extend_from_slice(&page_buf);

                        if let Some(hit) =
                            scan_buffer(&window, base_va, start.0, last, alignment, needle)
                        {
                            return Ok(Some(GcPtr(hit)));
                        }

                        if needle.len() > 1 {
                            carry.clear();
                            carry.extend_from_slice(&page_buf[PAGE_SIZE as usize - (needle.len() - 1)..]);
                        }
                    } else {
                        carry.clear();
                    }

                    match page_va.checked_add(PAGE_SIZE) {
                        Some(next) => page_va = next,
                        None => break,
                    }
                }

                WalkOutcome::RootNotPresent => break,

                outcome => {
                    carry.clear();
                    let skip = outcome.pages_skip().saturating_mul(PAGE_SIZE);
                    match page_va.checked_add(skip) {
                        Some(next) => page_va = next,
                        None => break,
                    }
                }
            }
        }

        Ok(None)
    }

    /// Dispatches a trapped physical access to its registered handler.
    ///
    /// Reads only fire all-access handlers; a miss (or a write-only handler
    /// on a read) is the default action.
    pub fn dispatch_access(&mut self, gc_phys: GcPhys, access: AccessKind) -> HandlerAction {
        match self.handlers.lookup_mut(gc_phys) {
            Some((_, handler))
                if handler.kind() == AccessHandlerKind::All || access == AccessKind::Write =>
            {
                handler.invoke(gc_phys, access)
            }
            _ => HandlerAction::DoDefault,
        }
    }

    /// Services a write fault on a non-writable page: invalidates the shadow
    /// tracking of the old backing, makes the page privately writable, and
    /// applies the resulting TLB and pool work.
    pub fn make_page_writable(&mut self, gc_phys: GcPhys) -> PgmResult<()> {
        let invalidation = self.pool.invalidate_phys(&mut self.memory, gc_phys)?;
        self.memory.make_writable(gc_phys)?;

        let pending = PendingInvalidations {
            tlb_flush_all: invalidation != PhysInvalidation::None,
            pool_flush: invalidation == PhysInvalidation::FlushAll,
        };
        self.sync
            .apply_pending(pending, &mut self.vcpus, &mut self.pool, &mut self.memory)
    }

    /// Registers a module for page sharing.
    pub fn register_shared_module(&mut self, module: SharedModule) -> PgmResult<usize> {
        self.sharing.register_module(module)
    }

    /// Unregisters a shared module.
    pub fn unregister_shared_module(&mut self, index: usize) -> PgmResult<SharedModule> {
        self.sharing.unregister_module(index)
    }

    /// Scans one registered module through a VCPU's paging mode, applying
    /// all accumulated invalidation work once at the end.
    pub fn scan_shared_module(
        &mut self,
        vcpu: u32,
        module_idx: usize,
        service: &mut dyn PageSharingService,
    ) -> PgmResult<ScanSummary> {
        let config = self.vcpu(vcpu)?.walk_config()?;
        let summary = self.sharing.scan_module(
            &mut self.memory,
            &mut self.pool,
            config,
            module_idx,
            service,
        )?;

        self.sync.apply_pending(
            summary.pending,
            &mut self.vcpus,
            &mut self.pool,
            &mut self.memory,
        )?;
        if summary.pages_shared > 0 {
            self.v2p.clear();
        }
        Ok(summary)
    }

    /// Dumps the guest hierarchy of one VCPU. Mode bits come from the VCPU
    /// state; `options` may add the output options.
    pub fn dump_guest_hierarchy(
        &self,
        vcpu: u32,
        options: DumpFlags,
        first: GcPtr,
        last: GcPtr,
        max_depth: u8,
    ) -> PgmResult<DumpReport> {
        let ctx = self.vcpu(vcpu)?;

        let mut flags = options
            & (DumpFlags::HEADER | DumpFlags::PRINT_CR3 | DumpFlags::PAGE_INFO);
        match ctx.guest_mode() {
            GuestMode::None => return Err(PgmError::InvalidParameter("paging disabled")),
            GuestMode::Bit32 => flags.set(DumpFlags::PSE, ctx.pse),
            GuestMode::Pae => flags |= DumpFlags::PAE,
            GuestMode::Amd64 => flags |= DumpFlags::LME,
        }
        flags.set(DumpFlags::NXE, ctx.nx);

        HierarchyDumper::new(&self.memory, flags, self.sync.host().maxphyaddr, first, last)?
            .dump(ctx.cr3().0, max_depth)
    }

    /// Dumps the shadow hierarchy of one VCPU out of the pool.
    pub fn dump_shadow_hierarchy(
        &self,
        vcpu: u32,
        options: DumpFlags,
        first: GcPtr,
        last: GcPtr,
        max_depth: u8,
    ) -> PgmResult<DumpReport> {
        let ctx = self.vcpu(vcpu)?;
        let root = ctx
            .root()
            .ok_or(PgmError::InvalidParameter("no shadow root mapped"))?;

        let mut flags = options
            & (DumpFlags::HEADER | DumpFlags::PRINT_CR3 | DumpFlags::PAGE_INFO);
        match ctx.shadow_mode() {
            Some(crate::sync::ShadowMode::Bit32) | None => {}
            Some(crate::sync::ShadowMode::Pae) => flags |= DumpFlags::PAE,
            Some(crate::sync::ShadowMode::Amd64) => flags |= DumpFlags::LME,
            Some(crate::sync::ShadowMode::Ept) => flags |= DumpFlags::EPT,
        }

        HierarchyDumper::new_shadow(
            &self.memory,
            &self.pool,
            flags,
            self.sync.host().maxphyaddr,
            first,
            last,
        )?
        .dump(self.pool.hc_phys_of(root).0, max_depth)
    }

    /// Resets guest memory state: the pool is rebuilt through the flush
    /// protocol and every RAM page returns to the zero state.
    pub fn reset(&mut self) -> PgmResult<()> {
        self.sync
            .flush_pool(&mut self.vcpus, &mut self.pool, &mut self.memory)?;
        self.memory.reset();
        self.v2p.clear();
        Ok(())
    }

    /// Verifies the integrity of every structure with ordering invariants.
    pub fn check_integrity(&self) -> PgmResult<()> {
        self.memory.check_integrity()?;
        self.handlers.check_integrity()?;
        self.pool.check_integrity()
    }
}

/// The translation used while paging is disabled.
fn identity_mapping(addr: GcPtr) -> WalkOutcome {
    WalkOutcome::Mapped(WalkInfo {
        gc_phys: GcPhys(addr.0),
        level: WalkLevel::Pt,
        flags: WalkFlags::WRITE | WalkFlags::USER,
        raw_leaf: 0,
    })
}

/// Scans one window of virtually contiguous bytes. `base_va` is the virtual
/// address of `window[0]`; match positions are bounded by `[start, last]`.
fn scan_buffer(
    window: &[u8],
    base_va: u64,
    start: u64,
    last: u64,
    alignment: u64,
    needle: &[u8],
) -> Option<u64> {
    if window.len() < needle.len() {
        return None;
    }

    let mut offset = 0u64;
    let max_offset = (window.len() - needle.len()) as u64;

    while offset <= max_offset {
        let va = base_va.checked_add(offset)?;
        if va > last || va.checked_add(needle.len() as u64 - 1)? > last {
            return None;
        }
        if va < start || va & (alignment - 1) != 0 {
            offset += 1;
            continue;
        }

        let pos = offset as usize;
        if alignment == 1 {
            match memchr::memchr(needle[0], &window[pos..=max_offset as usize]) {
                Some(found) => {
                    let candidate = pos + found;
                    if window[candidate..candidate + needle.len()] == *needle {
                        let va = base_va + candidate as u64;
                        if va >= start && va + needle.len() as u64 - 1 <= last {
                            return Some(va);
                        }
                    }
                    offset = candidate as u64 + 1;
                }
                None => return None,
            }
        } else {
            if window[pos..pos + needle.len()] == *needle {
                return Some(va);
            }
            offset += alignment;
        }
    }

    None
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod engine_tests;
