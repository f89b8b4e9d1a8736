//! x86-family paging-structure definitions and the guest page walker.
//!
//! The entry layouts here mirror the hardware paging-structure formats for
//! legacy 32-bit paging, PAE, AMD64 long mode and EPT. They are
//! architecturally fixed; external tooling parses dumps produced from them.

mod entry;
mod paging;
mod walker;

pub use self::{
    entry::{EptEntry, Pte32, Pte64},
    paging::{
        CANONICAL_HIGH_BASE, PagingMode, ReservedMasks, WalkLevel, is_canonical,
    },
    walker::{GuestPageWalker, WalkConfig, WalkFlags, WalkInfo, WalkOutcome},
};
