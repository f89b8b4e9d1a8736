//! Shadow paging state and the per-VM engine object.
//!
//! The [`ShadowPagePool`] owns every shadow paging structure and the tiered
//! back-references from guest physical pages into them. [`ShadowSyncEngine`]
//! orchestrates mode changes and the pool flush protocol,
//! [`PageSharingEngine`] trades private pages for de-duplicated copies, and
//! [`HierarchyDumper`] renders hierarchies for debugging. [`Pgm`] ties all
//! of it together with the physical ground truth from `pgm-core`.

mod dump;
mod engine;
mod pool;
mod sharing;
mod sync;

pub use self::{
    dump::{DumpFlags, DumpReport, HierarchyDumper},
    engine::{Pgm, PgmConfig},
    pool::{
        POOL_HC_BASE, POOL_NIL, PhysInvalidation, PoolAlloc, PoolKind, PoolPage, ShadowPagePool,
    },
    sharing::{
        AdoptOutcome, PageSharingEngine, PageSharingService, ScanSummary, SharedModule,
        SharedPageDesc, SharedPageMatch, SharedRegion, adopt_shared_copy,
    },
    sync::{
        GuestMode, HostCaps, PendingInvalidations, ShadowMode, ShadowSyncEngine,
        VcpuPagingContext,
    },
};
