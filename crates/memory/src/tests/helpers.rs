use crate::mmu::pte;
use crate::{
    Mmu, PagingScheme, PrivilegeMode, Prot, SegmentMemory, TranslationCtx, VmMode, PAGE_SIZE,
};

/// Base of the page-table arena used by the sv39 tests.
pub const PT_BASE: u64 = 0x8000_0000;

/// Leaf flags for a read-write data page (A/D preset, as a kernel would).
pub const LEAF_RW: u16 = pte::V | pte::R | pte::W | pte::A | pte::D;
/// Leaf flags for an executable page.
pub const LEAF_RX: u16 = pte::V | pte::R | pte::X | pte::A;
/// Interior (pointer) PTE: valid, no R/W/X.
pub const INTERIOR: u16 = pte::V;

/// An MMU whose guest physical memory has a low RAM window and a page-table
/// arena at [`PT_BASE`].
pub fn new_mmu(low_ram_pages: u64, pt_pages: u64) -> Mmu {
    let mut mem = SegmentMemory::new();
    mem.map(0, low_ram_pages * PAGE_SIZE, Prot::RWX).unwrap();
    mem.map(PT_BASE, pt_pages * PAGE_SIZE, Prot::RW).unwrap();
    Mmu::new(mem)
}

/// Supervisor-mode context translating through sv39 with the root table at
/// physical `root_pa`.
pub fn sv39_ctx(root_pa: u64) -> TranslationCtx {
    TranslationCtx {
        mode: PrivilegeMode::Supervisor,
        mprv: false,
        mxr: false,
        sum: false,
        vm: VmMode::Sv39,
        pdid: 0,
        sptbr: root_pa >> 12,
    }
}

/// Write one 8-byte PTE into the table at `table_pa`.
pub fn write_pte64(mmu: &mut Mmu, table_pa: u64, index: u64, ppn: u64, flags: u16) {
    let raw = (ppn << 10) | flags as u64;
    mmu.mem_mut()
        .write_u64_le(table_pa + index * PagingScheme::Sv39.pte_size(), raw)
        .unwrap();
}

/// Build the three-level sv39 chain root→l1→l0 inside the page-table arena
/// and return `(root_pa, l1_pa, l0_pa)`. Indexes are for vpn[2] and vpn[1].
pub fn sv39_chain(mmu: &mut Mmu, vpn2: u64, vpn1: u64) -> (u64, u64, u64) {
    let root = PT_BASE;
    let l1 = PT_BASE + PAGE_SIZE;
    let l0 = PT_BASE + 2 * PAGE_SIZE;
    write_pte64(mmu, root, vpn2, l1 >> 12, INTERIOR);
    write_pte64(mmu, l1, vpn1, l0 >> 12, INTERIOR);
    (root, l1, l0)
}
