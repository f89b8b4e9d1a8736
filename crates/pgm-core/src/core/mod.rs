mod address;
pub(crate) mod macros;
mod memory_access;

pub use self::{
    address::{Gfn, GcPhys, GcPtr, HcPhys, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE},
    memory_access::MemoryAccess,
};
