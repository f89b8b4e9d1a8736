//! Guest physical memory and shadow paging engine.
//!
//! This crate re-exports the whole engine surface:
//!
//! - [`pgm_core`]: the physical ground truth. RAM ranges, per-page state,
//!   access handlers, and the physical debug access and scan interfaces.
//! - [`pgm_arch_x86`]: the x86-family paging-structure formats and the
//!   guest page walker with its skip-ahead hints.
//! - [`pgm_shadow`]: the shadow page pool, mode synchronization, page
//!   sharing, the hierarchy dumper, and the per-VM [`Pgm`] engine object.
//!
//! # Example
//!
//! ```
//! use pgm::{GcPhys, GcPtr, HostCaps, Pgm, PgmConfig};
//!
//! # fn main() -> Result<(), pgm::PgmError> {
//! let mut pgm = Pgm::new(PgmConfig {
//!     host: HostCaps {
//!         long_mode: true,
//!         nested_paging: false,
//!         maxphyaddr: 48,
//!     },
//!     vcpu_count: 1,
//!     pool_pages: 512,
//!     pool_cache_enabled: true,
//!     driverless: false,
//! })?;
//!
//! pgm.memory_mut()
//!     .register_ram(GcPhys(0), 64 * 1024 * 1024, "low ram")?;
//! pgm.memory_mut().write_phys(GcPhys(0x1000), b"boot", None)?;
//!
//! let mut buf = [0u8; 4];
//! pgm.read_virt(0, GcPtr(0x1000), &mut buf, None)?;
//! assert_eq!(&buf, b"boot");
//! # Ok(())
//! # }
//! ```

pub use pgm_arch_x86::{
    self, EptEntry, GuestPageWalker, PagingMode, Pte32, Pte64, ReservedMasks, WalkConfig,
    WalkFlags, WalkInfo, WalkLevel, WalkOutcome,
};
pub use pgm_core::{
    self, AccessHandler, AccessHandlerKind, AccessHandlerTree, AccessKind, Gfn, GcPhys, GcPtr,
    HandlerAction, HandlerCallback, HandlerHandle, HcPhys, MemoryAccess, PAGE_SHIFT, PAGE_SIZE,
    PageState, PageType, PgmError, PgmResult, PhysPage, PhysPageDirectory, RamRange, TrackingRef,
};
pub use pgm_shadow::{
    self, DumpFlags, DumpReport, GuestMode, HierarchyDumper, HostCaps, PageSharingEngine,
    PageSharingService, PendingInvalidations, Pgm, PgmConfig, PoolKind, ShadowMode,
    ShadowPagePool, ShadowSyncEngine, SharedModule, SharedPageDesc, SharedPageMatch, SharedRegion,
    VcpuPagingContext,
};
