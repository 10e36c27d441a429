//! Virtual→physical translation and fault-checked access primitives.
//!
//! The MMU composes guest physical memory, the PMA table and two TLBs (one
//! for instruction fetch, one for data). Translation state is not read from a
//! processor type directly; callers snapshot the relevant fields into a
//! [`TranslationCtx`] per access, so this crate stays a leaf.

mod walk;

pub use walk::{pte, walk, LeafPte, PagingScheme};

use core::fmt;

use crate::phys::{Prot, SegmentMemory, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::pma::{PmaFlags, PmaTable};
use crate::tlb::Tlb;

/// Privilege mode of the hart issuing an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrivilegeMode {
    User,
    Supervisor,
    Machine,
}

/// Virtual-memory scheme selector (the `vm` field of the status register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmMode {
    #[default]
    Mbare,
    Sv32,
    Sv39,
    Sv48,
}

impl VmMode {
    #[inline]
    fn scheme(self) -> Option<PagingScheme> {
        match self {
            VmMode::Mbare => None,
            VmMode::Sv32 => Some(PagingScheme::Sv32),
            VmMode::Sv39 => Some(PagingScheme::Sv39),
            VmMode::Sv48 => Some(PagingScheme::Sv48),
        }
    }
}

/// The translation-relevant slice of processor state, snapshotted per access.
#[derive(Debug, Clone, Copy)]
pub struct TranslationCtx {
    pub mode: PrivilegeMode,
    /// "modify privilege": when set, M-mode data accesses are translated.
    pub mprv: bool,
    /// "make executable readable": loads may be satisfied by X-only pages.
    pub mxr: bool,
    /// Supervisor may access user pages.
    pub sum: bool,
    pub vm: VmMode,
    /// Protection-domain id used as a TLB tag.
    pub pdid: u64,
    /// Supervisor page-table base register: root ppn in the low bits, address
    /// space tag above.
    pub sptbr: u64,
}

impl TranslationCtx {
    /// Machine-mode context with translation off; the proxy machine and tests
    /// start here.
    pub fn bare() -> Self {
        Self {
            mode: PrivilegeMode::Machine,
            mprv: false,
            mxr: false,
            sum: false,
            vm: VmMode::Mbare,
            pdid: 0,
            sptbr: 0,
        }
    }

    /// Privilege level the leaf-PTE checks run against. M-mode only reaches
    /// the paged path via `mprv`, where it acts on behalf of the supervisor.
    #[inline]
    fn effective_mode(&self) -> PrivilegeMode {
        match self.mode {
            PrivilegeMode::Machine => PrivilegeMode::Supervisor,
            m => m,
        }
    }
}

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Fetch,
    Load,
    Store,
}

/// A failed MMU access. Every variant carries the faulting virtual address so
/// the processor can record it in `badaddr` before taking the trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    MisalignedFetch { vaddr: u64 },
    MisalignedLoad { vaddr: u64 },
    MisalignedStore { vaddr: u64 },
    FetchFault { vaddr: u64 },
    LoadFault { vaddr: u64 },
    StoreFault { vaddr: u64 },
}

impl MemoryError {
    #[inline]
    pub(crate) fn fault(access: AccessType, vaddr: u64) -> Self {
        match access {
            AccessType::Fetch => MemoryError::FetchFault { vaddr },
            AccessType::Load => MemoryError::LoadFault { vaddr },
            AccessType::Store => MemoryError::StoreFault { vaddr },
        }
    }

    /// The virtual address that caused the failure.
    #[inline]
    pub fn vaddr(&self) -> u64 {
        match *self {
            MemoryError::MisalignedFetch { vaddr }
            | MemoryError::MisalignedLoad { vaddr }
            | MemoryError::MisalignedStore { vaddr }
            | MemoryError::FetchFault { vaddr }
            | MemoryError::LoadFault { vaddr }
            | MemoryError::StoreFault { vaddr } => vaddr,
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, vaddr) = match *self {
            MemoryError::MisalignedFetch { vaddr } => ("misaligned fetch", vaddr),
            MemoryError::MisalignedLoad { vaddr } => ("misaligned load", vaddr),
            MemoryError::MisalignedStore { vaddr } => ("misaligned store", vaddr),
            MemoryError::FetchFault { vaddr } => ("fetch fault", vaddr),
            MemoryError::LoadFault { vaddr } => ("load fault", vaddr),
            MemoryError::StoreFault { vaddr } => ("store fault", vaddr),
        };
        write!(f, "{kind} at 0x{vaddr:x}")
    }
}

impl std::error::Error for MemoryError {}

/// Translation statistics. Plain counters; cheap enough to keep always-on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    pub itlb_hits: u64,
    pub itlb_misses: u64,
    pub dtlb_hits: u64,
    pub dtlb_misses: u64,
    /// Page-table walks performed due to TLB misses.
    pub page_walks: u64,
}

/// The soft-MMU.
#[derive(Debug)]
pub struct Mmu {
    itlb: Tlb,
    dtlb: Tlb,
    pma: PmaTable,
    mem: SegmentMemory,
    stats: MmuStats,
}

macro_rules! access_fns {
    ( $( $load_fn:ident, $store_fn:ident => $u:ident ),* $(,)? ) => {
        $(
            /// Aligned typed load through the data TLB.
            pub fn $load_fn(&mut self, ctx: &TranslationCtx, vaddr: u64) -> Result<$u, MemoryError> {
                const SIZE: u64 = core::mem::size_of::<$u>() as u64;
                if vaddr & (SIZE - 1) != 0 {
                    return Err(MemoryError::MisalignedLoad { vaddr });
                }
                let paddr = self.translate(ctx, vaddr, AccessType::Load)?;
                if !self.check_physical(paddr, SIZE, AccessType::Load) {
                    return Err(MemoryError::LoadFault { vaddr });
                }
                let mut buf = [0u8; core::mem::size_of::<$u>()];
                self.mem
                    .read_into(paddr, &mut buf)
                    .map_err(|_| MemoryError::LoadFault { vaddr })?;
                Ok($u::from_le_bytes(buf))
            }

            /// Aligned typed store through the data TLB.
            pub fn $store_fn(
                &mut self,
                ctx: &TranslationCtx,
                vaddr: u64,
                value: $u,
            ) -> Result<(), MemoryError> {
                const SIZE: u64 = core::mem::size_of::<$u>() as u64;
                if vaddr & (SIZE - 1) != 0 {
                    return Err(MemoryError::MisalignedStore { vaddr });
                }
                let paddr = self.translate(ctx, vaddr, AccessType::Store)?;
                if !self.check_physical(paddr, SIZE, AccessType::Store) {
                    return Err(MemoryError::StoreFault { vaddr });
                }
                self.mem
                    .write_from(paddr, &value.to_le_bytes())
                    .map_err(|_| MemoryError::StoreFault { vaddr })
            }
        )*
    };
}

impl Mmu {
    pub fn new(mem: SegmentMemory) -> Self {
        Self {
            itlb: Tlb::new(),
            dtlb: Tlb::new(),
            pma: PmaTable::new(),
            mem,
            stats: MmuStats::default(),
        }
    }

    pub fn mem(&self) -> &SegmentMemory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut SegmentMemory {
        &mut self.mem
    }

    pub fn pma_mut(&mut self) -> &mut PmaTable {
        &mut self.pma
    }

    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = MmuStats::default();
    }

    /// Invalidate both TLBs (sfence.vma with no address).
    pub fn flush_tlbs(&mut self) {
        self.itlb.flush_all();
        self.dtlb.flush_all();
    }

    /// Invalidate the translation caching `vaddr`'s page in both TLBs.
    pub fn flush_tlb_page(&mut self, vaddr: u64) {
        self.itlb.flush_page(vaddr);
        self.dtlb.flush_page(vaddr);
    }

    /// Translate `vaddr` for `access` under `ctx`.
    ///
    /// In M-mode with `mprv` clear translation is disabled entirely;
    /// otherwise the `vm` selector decides between bare mapping and a paged
    /// scheme.
    pub fn translate(
        &mut self,
        ctx: &TranslationCtx,
        vaddr: u64,
        access: AccessType,
    ) -> Result<u64, MemoryError> {
        if ctx.mode == PrivilegeMode::Machine && !ctx.mprv {
            return Ok(vaddr);
        }
        match ctx.vm.scheme() {
            None => Ok(vaddr),
            Some(scheme) => self.paged_translate(ctx, vaddr, access, scheme),
        }
    }

    fn paged_translate(
        &mut self,
        ctx: &TranslationCtx,
        vaddr: u64,
        access: AccessType,
        scheme: PagingScheme,
    ) -> Result<u64, MemoryError> {
        // The whole base register (asid + root ppn) tags TLB entries, so a
        // switch of either component can never hit stale translations.
        let root_tag = ctx.sptbr;
        let root_ppn = ctx.sptbr & ((1u64 << scheme.ppn_bits()) - 1);
        let eff_mode = ctx.effective_mode();
        let is_fetch = access == AccessType::Fetch;

        let hit = if is_fetch {
            self.itlb.lookup(ctx.pdid, root_tag, vaddr).copied()
        } else {
            self.dtlb.lookup(ctx.pdid, root_tag, vaddr).copied()
        };

        if let Some(entry) = hit {
            if is_fetch {
                self.stats.itlb_hits += 1;
            } else {
                self.stats.dtlb_hits += 1;
            }
            if !check_leaf(entry.flags, access, eff_mode, ctx.mxr, ctx.sum) {
                return Err(MemoryError::fault(access, vaddr));
            }
            return Ok(entry.translate(vaddr));
        }

        if is_fetch {
            self.stats.itlb_misses += 1;
        } else {
            self.stats.dtlb_misses += 1;
        }
        self.stats.page_walks += 1;

        let leaf = walk::walk(&self.mem, scheme, root_ppn, vaddr)
            .ok_or(MemoryError::fault(access, vaddr))?;
        if !check_leaf(leaf.flags, access, eff_mode, ctx.mxr, ctx.sum) {
            return Err(MemoryError::fault(access, vaddr));
        }

        let paddr = leaf.translate(vaddr);
        // Cache at 4 KiB granularity: for a megapage/gigapage leaf the slot
        // holds the page-granular ppn for this vpn, not the leaf's base.
        let page_ppn = paddr >> PAGE_SHIFT;
        let tlb = if is_fetch { &mut self.itlb } else { &mut self.dtlb };
        tlb.insert(ctx.pdid, root_tag, vaddr, leaf.flags, page_ppn);
        Ok(paddr)
    }

    /// Post-translation check of physical attributes: PMA first, then the
    /// backing segment's protection.
    fn check_physical(&self, paddr: u64, len: u64, access: AccessType) -> bool {
        let (pma_need, prot_need) = match access {
            AccessType::Fetch => (PmaFlags::X, Prot::X),
            AccessType::Load => (PmaFlags::R, Prot::R),
            AccessType::Store => (PmaFlags::W, Prot::W),
        };
        if !self.pma.lookup(paddr).contains(pma_need) {
            return false;
        }
        matches!(self.mem.prot_at(paddr, len), Some(p) if p.contains(prot_need))
    }

    /// Fetch one instruction at `pc`: 16 bits, plus another 16 when the low
    /// two bits mark a full-width encoding. Returns the raw bits and the pc
    /// increment (2 or 4).
    pub fn fetch(&mut self, ctx: &TranslationCtx, pc: u64) -> Result<(u32, u8), MemoryError> {
        if pc & 1 != 0 {
            return Err(MemoryError::MisalignedFetch { vaddr: pc });
        }
        let lo = self.fetch_parcel(ctx, pc)?;
        if lo & 0b11 == 0b11 {
            // The second parcel may sit on the next page; translate it on its
            // own so a fault reports the parcel's address.
            let hi = self.fetch_parcel(ctx, pc.wrapping_add(2))?;
            Ok((((hi as u32) << 16) | lo as u32, 4))
        } else {
            Ok((lo as u32, 2))
        }
    }

    fn fetch_parcel(&mut self, ctx: &TranslationCtx, vaddr: u64) -> Result<u16, MemoryError> {
        let paddr = self.translate(ctx, vaddr, AccessType::Fetch)?;
        if !self.check_physical(paddr, 2, AccessType::Fetch) {
            return Err(MemoryError::FetchFault { vaddr });
        }
        self.mem
            .read_u16_le(paddr)
            .map_err(|_| MemoryError::FetchFault { vaddr })
    }

    access_fns! {
        load_u8, store_u8 => u8,
        load_u16, store_u16 => u16,
        load_u32, store_u32 => u32,
        load_u64, store_u64 => u64,
    }

    /// Byte-wise translated read, chunked per page. Used for argument
    /// marshalling where natural alignment is not guaranteed.
    pub fn read_bytes(
        &mut self,
        ctx: &TranslationCtx,
        vaddr: u64,
        dst: &mut [u8],
    ) -> Result<(), MemoryError> {
        let mut off = 0usize;
        while off < dst.len() {
            let va = vaddr.wrapping_add(off as u64);
            let in_page = (PAGE_SIZE - (va & PAGE_MASK)) as usize;
            let take = in_page.min(dst.len() - off);
            let paddr = self.translate(ctx, va, AccessType::Load)?;
            if !self.check_physical(paddr, take as u64, AccessType::Load) {
                return Err(MemoryError::LoadFault { vaddr: va });
            }
            self.mem
                .read_into(paddr, &mut dst[off..off + take])
                .map_err(|_| MemoryError::LoadFault { vaddr: va })?;
            off += take;
        }
        Ok(())
    }

    /// Byte-wise translated write, chunked per page.
    pub fn write_bytes(
        &mut self,
        ctx: &TranslationCtx,
        vaddr: u64,
        src: &[u8],
    ) -> Result<(), MemoryError> {
        let mut off = 0usize;
        while off < src.len() {
            let va = vaddr.wrapping_add(off as u64);
            let in_page = (PAGE_SIZE - (va & PAGE_MASK)) as usize;
            let take = in_page.min(src.len() - off);
            let paddr = self.translate(ctx, va, AccessType::Store)?;
            if !self.check_physical(paddr, take as u64, AccessType::Store) {
                return Err(MemoryError::StoreFault { vaddr: va });
            }
            self.mem
                .write_from(paddr, &src[off..off + take])
                .map_err(|_| MemoryError::StoreFault { vaddr: va })?;
            off += take;
        }
        Ok(())
    }
}

/// Leaf-PTE permission check run after a hit or a successful walk.
///
/// Fetch requires X; load requires R (or X under `mxr`); store requires both
/// W and D; a store to a clean page traps so software can manage the dirty
/// bit. The U bit is cross-checked against the effective mode, with `sum`
/// letting the supervisor touch user data (never user code).
fn check_leaf(flags: u16, access: AccessType, mode: PrivilegeMode, mxr: bool, sum: bool) -> bool {
    match mode {
        PrivilegeMode::User => {
            if flags & pte::U == 0 {
                return false;
            }
        }
        _ => {
            if flags & pte::U != 0 && (access == AccessType::Fetch || !sum) {
                return false;
            }
        }
    }
    match access {
        AccessType::Fetch => flags & pte::X != 0,
        AccessType::Load => flags & pte::R != 0 || (mxr && flags & pte::X != 0),
        AccessType::Store => flags & pte::W != 0 && flags & pte::D != 0,
    }
}
