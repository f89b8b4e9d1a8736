//! Core guest physical memory state.
//!
//! This crate owns the ground truth for a VM's physical address space: the
//! ordered set of RAM ranges with one [`PhysPage`] record per 4K page, the
//! range-keyed [`AccessHandlerTree`], and the physical debug access and scan
//! interfaces built on them.

mod core;
mod error;
mod handler;
mod phys;

pub use self::{
    core::{Gfn, GcPhys, GcPtr, HcPhys, MemoryAccess, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE},
    error::{PgmError, PgmResult},
    handler::{
        AccessHandler, AccessHandlerKind, AccessHandlerTree, AccessKind, HANDLER_CAPACITY,
        HANDLER_CAPACITY_DRIVERLESS, HandlerAction, HandlerCallback, HandlerHandle,
    },
    phys::{
        MAX_NEEDLE_SIZE, MAX_SCAN_ALIGNMENT, PageState, PageType, PhysPage, PhysPageDirectory,
        RamRange, TrackingRef, ZERO_PAGE_HC_PHYS, ZERO_PAGE_ID,
    },
};
