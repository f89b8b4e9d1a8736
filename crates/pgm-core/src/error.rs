use crate::{GcPhys, GcPtr};

/// An error that can occur when working with the guest memory engine.
#[derive(thiserror::Error, Debug)]
pub enum PgmError {
    /// A caller-contract violation: null pointer, zero-length range,
    /// unaligned size or address. Never silently fixed up.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The requested guest/shadow/host paging-mode combination is not
    /// implemented. Discovering this at mode-change time is fatal to the VM.
    #[error("Paging mode combination not supported")]
    NotSupported,

    /// A fixed-capacity allocator (handler slab, extent arena) is exhausted.
    #[error("Out of capacity")]
    OutOfCapacity,

    /// A range overlaps an already registered one.
    #[error("Range conflicts with an existing registration at {0}")]
    Conflict(GcPhys),

    /// The address is not backed by any registered RAM range.
    #[error("No RAM range covers {0}")]
    OutOfRange(GcPhys),

    /// The guest virtual address has no translation in the active paging
    /// mode.
    #[error("No translation for {0}")]
    NotMapped(GcPtr),

    /// The page exists but cannot be accessed this way (e.g. reading
    /// device MMIO through the debug interface).
    #[error("Invalid page type for this access at {0}")]
    InvalidPageType(GcPhys),

    /// The shadow page pool is exhausted and no single page can be evicted;
    /// the caller must run the full flush protocol and retry.
    #[error("Shadow pool exhausted, full flush required")]
    PoolFlushRequired,

    /// Mirrored hardware-compatible state is corrupt. Continuing would
    /// silently desynchronize guest-visible memory from the shadow
    /// structures; the VM must be aborted.
    #[error("State corruption detected: {0}")]
    Corruption(&'static str),
}

/// Alias for `Result` with [`PgmError`] as the error type.
pub type PgmResult<T> = Result<T, PgmError>;
