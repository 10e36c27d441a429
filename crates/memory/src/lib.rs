//! Guest physical memory, physical memory attributes, TLBs and the soft-MMU.

pub mod mmu;
pub mod phys;
pub mod pma;
pub mod tlb;

pub use mmu::{
    pte, AccessType, MemoryError, Mmu, MmuStats, PagingScheme, PrivilegeMode, TranslationCtx,
    VmMode,
};
pub use phys::{MemError, MemResult, Prot, SegmentMemory, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
pub use pma::{PmaFlags, PmaTable};
pub use tlb::{Tlb, TlbEntry};

#[cfg(test)]
mod tests;
