use super::helpers::{new_mmu, sv39_chain, sv39_ctx, write_pte64, INTERIOR, LEAF_RW, LEAF_RX, PT_BASE};
use crate::mmu::pte;
use crate::{AccessType, MemoryError, PrivilegeMode, Prot, PAGE_SIZE};

#[test]
fn walk_then_tlb_hit() {
    let mut mmu = new_mmu(16, 8);
    let (root, _l1, l0) = sv39_chain(&mut mmu, 0, 0);
    // va 0x1000 → pa 0x2000.
    write_pte64(&mut mmu, l0, 1, 0x2, LEAF_RW);
    mmu.mem_mut().write_u8_le(0x2000, 0xa5).unwrap();

    let ctx = sv39_ctx(root);
    assert_eq!(mmu.load_u8(&ctx, 0x1000).unwrap(), 0xa5);
    assert_eq!(mmu.stats().page_walks, 1);
    assert_eq!(mmu.stats().dtlb_misses, 1);

    // Second access through the same page is served from the TLB.
    assert_eq!(mmu.load_u8(&ctx, 0x1004).unwrap(), 0);
    assert_eq!(mmu.stats().page_walks, 1);
    assert_eq!(mmu.stats().dtlb_hits, 1);
}

#[test]
fn tlb_entry_dies_with_its_root() {
    let mut mmu = new_mmu(16, 8);
    let (root, _l1, l0) = sv39_chain(&mut mmu, 0, 0);
    write_pte64(&mut mmu, l0, 1, 0x2, LEAF_RW);

    let ctx = sv39_ctx(root);
    mmu.load_u8(&ctx, 0x1000).unwrap();
    assert_eq!(mmu.stats().page_walks, 1);

    // A different page-table base must not see the cached translation.
    let other = sv39_ctx(root + PAGE_SIZE);
    assert!(mmu.load_u8(&other, 0x1000).is_err());
    assert_eq!(mmu.stats().page_walks, 2);

    // Likewise a different protection domain.
    let mut other_pdid = sv39_ctx(root);
    other_pdid.pdid = 7;
    mmu.load_u8(&other_pdid, 0x1000).unwrap();
    assert_eq!(mmu.stats().page_walks, 3);
}

#[test]
fn megapage_leaf_passes_low_bits_through() {
    let mut mmu = new_mmu(16, 8);
    let root = PT_BASE;
    let l1 = PT_BASE + 3 * PAGE_SIZE;
    write_pte64(&mut mmu, root, 1, l1 >> 12, INTERIOR);
    // Level-1 leaf: va 0x4000_0000..0x4020_0000 → pa 0x1_0000_0000, R+X.
    write_pte64(&mut mmu, l1, 0, 0x1_0000_0000u64 >> 12, LEAF_RX);

    mmu.mem_mut()
        .map(0x1_0000_0000, 4 * PAGE_SIZE, Prot::RX)
        .unwrap();
    mmu.mem_mut().write_u16_le(0x1_0000_1000, 0x4501).unwrap();

    let ctx = sv39_ctx(root);
    assert_eq!(
        mmu.translate(&ctx, 0x4000_1000, AccessType::Fetch).unwrap(),
        0x1_0000_1000
    );
    assert_eq!(mmu.fetch(&ctx, 0x4000_1000).unwrap(), (0x4501, 2));

    // Addresses sharing the bits above the leaf shift translate into the
    // same megapage frame.
    let pa_a = mmu.translate(&ctx, 0x4000_1000, AccessType::Load).unwrap();
    let pa_b = mmu.translate(&ctx, 0x4000_3000, AccessType::Load).unwrap();
    assert_eq!(pa_a >> 21, pa_b >> 21);
    assert_eq!(pa_b, 0x1_0000_3000);
}

#[test]
fn interior_chain_without_leaf_is_a_translation_fault() {
    let mut mmu = new_mmu(16, 8);
    let (root, _l1, l0) = sv39_chain(&mut mmu, 0, 0);
    // Valid PTE with R=W=X=0 at the last level never becomes a leaf.
    write_pte64(&mut mmu, l0, 2, 0x3, INTERIOR);

    let ctx = sv39_ctx(root);
    for err in [
        mmu.load_u8(&ctx, 0x2000).unwrap_err(),
        mmu.store_u8(&ctx, 0x2000, 0).unwrap_err(),
        mmu.fetch(&ctx, 0x2000).unwrap_err(),
    ] {
        assert_eq!(err.vaddr(), 0x2000);
    }
    assert_eq!(
        mmu.store_u8(&ctx, 0x2000, 0).unwrap_err(),
        MemoryError::StoreFault { vaddr: 0x2000 }
    );
}

#[test]
fn reserved_write_only_encoding_faults() {
    let mut mmu = new_mmu(16, 8);
    let (root, _l1, l0) = sv39_chain(&mut mmu, 0, 0);
    // W set without R is a reserved encoding.
    write_pte64(&mut mmu, l0, 1, 0x2, pte::V | pte::W | pte::A | pte::D);

    let ctx = sv39_ctx(root);
    assert_eq!(
        mmu.load_u8(&ctx, 0x1000).unwrap_err(),
        MemoryError::LoadFault { vaddr: 0x1000 }
    );
}

#[test]
fn store_to_clean_page_faults_until_dirty() {
    let mut mmu = new_mmu(16, 8);
    let (root, _l1, l0) = sv39_chain(&mut mmu, 0, 0);
    // Writable but D=0: loads succeed, stores trap for software D management.
    write_pte64(&mut mmu, l0, 3, 0x4, pte::V | pte::R | pte::W | pte::A);

    let ctx = sv39_ctx(root);
    assert!(mmu.load_u32(&ctx, 0x3000).is_ok());
    assert_eq!(
        mmu.store_u32(&ctx, 0x3000, 1).unwrap_err(),
        MemoryError::StoreFault { vaddr: 0x3000 }
    );

    write_pte64(&mut mmu, l0, 3, 0x4, LEAF_RW);
    mmu.flush_tlb_page(0x3000);
    assert!(mmu.store_u32(&ctx, 0x3000, 1).is_ok());
}

#[test]
fn mxr_lets_loads_read_execute_only_pages() {
    let mut mmu = new_mmu(16, 8);
    let (root, _l1, l0) = sv39_chain(&mut mmu, 0, 0);
    write_pte64(&mut mmu, l0, 4, 0x5, pte::V | pte::X | pte::A);

    let mut ctx = sv39_ctx(root);
    assert!(mmu.load_u8(&ctx, 0x4000).is_err());
    ctx.mxr = true;
    assert!(mmu.load_u8(&ctx, 0x4000).is_ok());
}

#[test]
fn user_bit_is_cross_checked_against_mode() {
    let mut mmu = new_mmu(16, 8);
    let (root, _l1, l0) = sv39_chain(&mut mmu, 0, 0);
    write_pte64(&mut mmu, l0, 5, 0x6, LEAF_RW | pte::U);
    write_pte64(&mut mmu, l0, 6, 0x7, LEAF_RW);

    // Supervisor touching a user page requires sum.
    let mut s_ctx = sv39_ctx(root);
    assert!(mmu.load_u8(&s_ctx, 0x5000).is_err());
    s_ctx.sum = true;
    assert!(mmu.load_u8(&s_ctx, 0x5000).is_ok());

    // User mode requires the U bit.
    let mut u_ctx = sv39_ctx(root);
    u_ctx.mode = PrivilegeMode::User;
    assert!(mmu.load_u8(&u_ctx, 0x5000).is_ok());
    assert!(mmu.load_u8(&u_ctx, 0x6000).is_err());
}
