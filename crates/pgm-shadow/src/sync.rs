use pgm_arch_x86::{PagingMode, ReservedMasks, WalkConfig};
use pgm_core::{GcPhys, PgmError, PgmResult, PhysPageDirectory};

use crate::pool::{PoolKind, ShadowPagePool};

/// The paging mode the guest has programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestMode {
    /// Paging disabled; guest physical equals guest virtual.
    None,

    /// Legacy 32-bit paging.
    Bit32,

    /// PAE paging.
    Pae,

    /// Long-mode 4-level paging.
    Amd64,
}

impl GuestMode {
    /// The walker paging mode, if paging is enabled.
    pub fn paging_mode(self) -> Option<PagingMode> {
        match self {
            Self::None => None,
            Self::Bit32 => Some(PagingMode::Bit32),
            Self::Pae => Some(PagingMode::Pae),
            Self::Amd64 => Some(PagingMode::Amd64),
        }
    }
}

/// The shadow (host-side) paging mode backing the guest mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowMode {
    /// 32-bit shadow tables.
    Bit32,

    /// PAE shadow tables.
    Pae,

    /// Long-mode shadow tables.
    Amd64,

    /// Hardware nested paging; the shadow hierarchy is an EPT hierarchy.
    Ept,
}

impl ShadowMode {
    fn root_kind(self) -> PoolKind {
        match self {
            Self::Bit32 => PoolKind::Pd32,
            Self::Pae => PoolKind::Pdpt,
            Self::Amd64 => PoolKind::Pml4,
            Self::Ept => PoolKind::EptPml4,
        }
    }
}

/// Host capabilities that constrain mode selection and entry validation.
#[derive(Debug, Clone, Copy)]
pub struct HostCaps {
    /// Whether the host can run long-mode guests.
    pub long_mode: bool,

    /// Whether hardware nested paging is available and enabled.
    pub nested_paging: bool,

    /// The host's physical address width, 32 through 52.
    pub maxphyaddr: u32,
}

/// Pending cross-VCPU invalidation work, accumulated during an operation
/// and applied once at its end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingInvalidations {
    /// Every VCPU must flush its TLB before re-entering the guest.
    pub tlb_flush_all: bool,

    /// The shadow pool must be rebuilt through the full flush protocol.
    pub pool_flush: bool,
}

impl PendingInvalidations {
    /// Folds another set of pending work into this one.
    pub fn merge(&mut self, other: PendingInvalidations) {
        self.tlb_flush_all |= other.tlb_flush_all;
        self.pool_flush |= other.pool_flush;
    }

    /// Whether any work is pending.
    pub fn is_empty(&self) -> bool {
        !self.tlb_flush_all && !self.pool_flush
    }
}

/// Per-VCPU paging state: the mode pair, the control-register inputs of the
/// walker, and the mapped shadow root.
#[derive(Debug)]
pub struct VcpuPagingContext {
    vcpu: u32,

    guest_mode: GuestMode,
    shadow_mode: Option<ShadowMode>,

    cr3: GcPhys,

    /// CR4.PSE.
    pub pse: bool,

    /// EFER.NXE.
    pub nx: bool,

    /// The A20 gate state.
    pub a20: bool,

    root: Option<u16>,

    /// Reserved-bit masks for the guest mode, derived at mode-change time.
    masks: Option<ReservedMasks>,

    /// The VCPU must flush its TLB before resuming the guest.
    pub tlb_flush_pending: bool,
}

impl VcpuPagingContext {
    /// Creates the context for one VCPU, starting with paging disabled.
    pub fn new(vcpu: u32) -> Self {
        Self {
            vcpu,
            guest_mode: GuestMode::None,
            shadow_mode: None,
            cr3: GcPhys(0),
            pse: false,
            nx: false,
            a20: true,
            root: None,
            masks: None,
            tlb_flush_pending: false,
        }
    }

    /// The VCPU id.
    pub fn vcpu(&self) -> u32 {
        self.vcpu
    }

    /// The active guest paging mode.
    pub fn guest_mode(&self) -> GuestMode {
        self.guest_mode
    }

    /// The active shadow mode, if the VCPU has entered one.
    pub fn shadow_mode(&self) -> Option<ShadowMode> {
        self.shadow_mode
    }

    /// The guest CR3 value.
    pub fn cr3(&self) -> GcPhys {
        self.cr3
    }

    /// The pool index of the mapped shadow root, if any.
    pub fn root(&self) -> Option<u16> {
        self.root
    }

    /// The walker paging mode for the guest side, if paging is enabled.
    pub fn guest_paging_mode(&self) -> Option<PagingMode> {
        self.guest_mode.paging_mode()
    }

    /// Builds the walker configuration for this VCPU's guest tables.
    pub fn walk_config(&self) -> PgmResult<WalkConfig> {
        let mode = self
            .guest_paging_mode()
            .ok_or(PgmError::InvalidParameter("paging disabled"))?;
        let masks = self
            .masks
            .ok_or(PgmError::Corruption("mode entered without derived masks"))?;

        Ok(WalkConfig {
            mode,
            cr3: self.cr3,
            pse: self.pse,
            nx: self.nx,
            a20: self.a20,
            masks,
        })
    }
}

/// Orchestrates guest mode changes and the pool flush protocol.
///
/// A mode change brings the new root up before the old world is torn
/// down: validate the mode pair, map the new shadow root, switch both
/// modes and re-derive the validation masks, then drop the old root. Any
/// failure, including an exhausted pool, leaves the context untouched so
/// the caller can flush and retry.
#[derive(Debug)]
pub struct ShadowSyncEngine {
    host: HostCaps,
}

impl ShadowSyncEngine {
    /// Creates the engine for a host.
    pub fn new(host: HostCaps) -> PgmResult<Self> {
        if !(32..=52).contains(&host.maxphyaddr) {
            return Err(PgmError::InvalidParameter("maxphyaddr"));
        }
        Ok(Self { host })
    }

    /// The host capabilities.
    pub fn host(&self) -> &HostCaps {
        &self.host
    }

    /// Picks the shadow mode backing a guest mode on this host.
    pub fn select_shadow_mode(&self, guest_mode: GuestMode) -> PgmResult<ShadowMode> {
        if self.host.nested_paging {
            return Ok(ShadowMode::Ept);
        }

        match guest_mode {
            GuestMode::None | GuestMode::Bit32 => Ok(ShadowMode::Bit32),
            GuestMode::Pae => Ok(ShadowMode::Pae),
            GuestMode::Amd64 if self.host.long_mode => Ok(ShadowMode::Amd64),
            GuestMode::Amd64 => Err(PgmError::NotSupported),
        }
    }

    /// Switches a VCPU to a new guest mode and CR3.
    pub fn change_mode(
        &self,
        ctx: &mut VcpuPagingContext,
        pool: &mut ShadowPagePool,
        directory: &mut PhysPageDirectory,
        guest_mode: GuestMode,
        cr3: GcPhys,
    ) -> PgmResult<()> {
        // Validate and map the new root before tearing anything down, so a
        // failure aborts with the old state intact.
        let shadow_mode = self.select_shadow_mode(guest_mode)?;
        let new_root = self.alloc_root(pool, directory, Some(shadow_mode), guest_mode, cr3)?;

        let old_root = ctx.root.take();
        ctx.guest_mode = guest_mode;
        ctx.shadow_mode = Some(shadow_mode);
        ctx.cr3 = cr3;
        ctx.masks = ctx
            .guest_paging_mode()
            .map(|mode| ReservedMasks::derive(mode, self.host.maxphyaddr, ctx.nx));
        ctx.tlb_flush_pending = true;
        ctx.root = new_root;

        self.drop_old_root(pool, old_root, new_root)?;

        tracing::debug!(
            vcpu = ctx.vcpu,
            ?guest_mode,
            ?shadow_mode,
            %cr3,
            "mode changed"
        );
        Ok(())
    }

    /// Updates CR3 without a mode change (a guest address-space switch).
    /// The new root is mapped before the old one is dropped.
    pub fn switch_cr3(
        &self,
        ctx: &mut VcpuPagingContext,
        pool: &mut ShadowPagePool,
        directory: &mut PhysPageDirectory,
        cr3: GcPhys,
    ) -> PgmResult<()> {
        let new_root = self.alloc_root(pool, directory, ctx.shadow_mode, ctx.guest_mode, cr3)?;

        let old_root = ctx.root.take();
        ctx.cr3 = cr3;
        ctx.tlb_flush_pending = true;
        ctx.root = new_root;

        self.drop_old_root(pool, old_root, new_root)
    }

    /// Maps the shadow root for the context's current mode and CR3, as part
    /// of the flush re-entry.
    fn map_cr3(
        &self,
        ctx: &mut VcpuPagingContext,
        pool: &mut ShadowPagePool,
        directory: &mut PhysPageDirectory,
    ) -> PgmResult<()> {
        ctx.root = self.alloc_root(pool, directory, ctx.shadow_mode, ctx.guest_mode, ctx.cr3)?;
        Ok(())
    }

    /// Allocates, retains and pins the shadow root for a mode pair, or
    /// `None` when no root is needed.
    fn alloc_root(
        &self,
        pool: &mut ShadowPagePool,
        directory: &mut PhysPageDirectory,
        shadow_mode: Option<ShadowMode>,
        guest_mode: GuestMode,
        cr3: GcPhys,
    ) -> PgmResult<Option<u16>> {
        let Some(shadow_mode) = shadow_mode else {
            return Ok(None);
        };
        if guest_mode == GuestMode::None && shadow_mode != ShadowMode::Ept {
            return Ok(None);
        }

        let kind = shadow_mode.root_kind();
        let root_phys = guest_mode
            .paging_mode()
            .map(|mode| mode.root_base(cr3))
            .unwrap_or(cr3);

        let alloc = pool.alloc(directory, kind, root_phys)?;
        pool.retain(alloc.idx)?;
        pool.set_permanent(alloc.idx, true)?;

        tracing::trace!(root = alloc.idx, cached = alloc.cached, "cr3 mapped");
        Ok(Some(alloc.idx))
    }

    /// Releases the outgoing root once the new one is in place. When both
    /// are the same page, only the duplicate mapping reference is dropped.
    fn drop_old_root(
        &self,
        pool: &mut ShadowPagePool,
        old: Option<u16>,
        new: Option<u16>,
    ) -> PgmResult<()> {
        if let Some(old) = old {
            pool.release(old)?;
            if Some(old) != new {
                pool.set_permanent(old, false)?;
            }
        }
        Ok(())
    }

    /// Unmaps the shadow root, if one is mapped.
    fn unmap_cr3(&self, ctx: &mut VcpuPagingContext, pool: &mut ShadowPagePool) -> PgmResult<()> {
        if let Some(root) = ctx.root.take() {
            pool.release(root)?;
            // Stays cached for a quick return to this address space, but is
            // eviction-eligible again.
            pool.set_permanent(root, false)?;
        }
        Ok(())
    }

    /// Runs the full pool flush protocol: every VCPU leaves its shadow
    /// address space, the pool is rebuilt, and every VCPU re-enters.
    pub fn flush_pool(
        &self,
        vcpus: &mut [VcpuPagingContext],
        pool: &mut ShadowPagePool,
        directory: &mut PhysPageDirectory,
    ) -> PgmResult<()> {
        for ctx in vcpus.iter_mut() {
            self.unmap_cr3(ctx, pool)?;
            ctx.tlb_flush_pending = true;
        }

        pool.flush_all(directory)?;

        for ctx in vcpus.iter_mut() {
            self.map_cr3(ctx, pool, directory)?;
        }
        Ok(())
    }

    /// Applies accumulated invalidation work once, at the end of an
    /// operation.
    pub fn apply_pending(
        &self,
        pending: PendingInvalidations,
        vcpus: &mut [VcpuPagingContext],
        pool: &mut ShadowPagePool,
        directory: &mut PhysPageDirectory,
    ) -> PgmResult<()> {
        if pending.pool_flush {
            self.flush_pool(vcpus, pool, directory)?;
        }
        if pending.tlb_flush_all {
            for ctx in vcpus.iter_mut() {
                ctx.tlb_flush_pending = true;
            }
        }
        Ok(())
    }
}
