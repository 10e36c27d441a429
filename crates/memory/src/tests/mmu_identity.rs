use crate::{MemoryError, Mmu, Prot, SegmentMemory, TranslationCtx, PAGE_SIZE};

fn identity_mmu() -> (Mmu, TranslationCtx) {
    let mut mem = SegmentMemory::new();
    mem.map(0x1000, PAGE_SIZE, Prot::RW).unwrap();
    (Mmu::new(mem), TranslationCtx::bare())
}

#[test]
fn machine_mode_store_load_roundtrip() {
    let (mut mmu, ctx) = identity_mmu();

    mmu.store_u32(&ctx, 0x1000, 0xdead_beef).unwrap();
    assert_eq!(mmu.load_u32(&ctx, 0x1000).unwrap(), 0xdead_beef);
}

#[test]
fn store_then_load_is_independent_of_history() {
    let (mut mmu, ctx) = identity_mmu();

    for &(va, v) in &[(0x1000u64, 1u64), (0x1008, u64::MAX), (0x1ff8, 0x55aa)] {
        mmu.store_u64(&ctx, va, v).unwrap();
        assert_eq!(mmu.load_u64(&ctx, va).unwrap(), v);
        // Writing the loaded value back leaves memory unchanged.
        mmu.store_u64(&ctx, va, v).unwrap();
        assert_eq!(mmu.load_u64(&ctx, va).unwrap(), v);
    }
}

#[test]
fn misaligned_load_reports_the_faulting_address() {
    let (mut mmu, ctx) = identity_mmu();

    let err = mmu.load_u32(&ctx, 0x1002).unwrap_err();
    assert_eq!(err, MemoryError::MisalignedLoad { vaddr: 0x1002 });
    assert_eq!(err.vaddr(), 0x1002);

    let err = mmu.store_u16(&ctx, 0x1001, 7).unwrap_err();
    assert_eq!(err, MemoryError::MisalignedStore { vaddr: 0x1001 });
}

#[test]
fn aligned_accesses_never_misalign() {
    let (mut mmu, ctx) = identity_mmu();

    for va in (0x1000..0x1040u64).step_by(8) {
        assert!(mmu.load_u64(&ctx, va).is_ok());
        assert!(mmu.load_u32(&ctx, va).is_ok());
        assert!(mmu.load_u16(&ctx, va).is_ok());
        assert!(mmu.load_u8(&ctx, va).is_ok());
    }
}

#[test]
fn unmapped_physical_range_faults() {
    let (mut mmu, ctx) = identity_mmu();

    assert_eq!(
        mmu.load_u32(&ctx, 0x3000).unwrap_err(),
        MemoryError::LoadFault { vaddr: 0x3000 }
    );
    assert_eq!(
        mmu.store_u8(&ctx, 0x0fff, 1).unwrap_err(),
        MemoryError::StoreFault { vaddr: 0x0fff }
    );
}

#[test]
fn fetch_requires_execute_protection() {
    let mut mem = SegmentMemory::new();
    mem.map(0x1000, PAGE_SIZE, Prot::RW).unwrap();
    mem.map(0x2000, PAGE_SIZE, Prot::RX).unwrap();
    let mut mmu = Mmu::new(mem);
    let ctx = TranslationCtx::bare();

    // 0x0001 parcel: low bits 01 → compressed, length 2.
    mmu.mem_mut().write_u16_le(0x2000, 0x4501).unwrap();
    assert_eq!(mmu.fetch(&ctx, 0x2000).unwrap(), (0x4501, 2));

    assert_eq!(
        mmu.fetch(&ctx, 0x1000).unwrap_err(),
        MemoryError::FetchFault { vaddr: 0x1000 }
    );
    assert_eq!(
        mmu.fetch(&ctx, 0x2001).unwrap_err(),
        MemoryError::MisalignedFetch { vaddr: 0x2001 }
    );
}

#[test]
fn fetch_assembles_full_width_parcels() {
    let mut mem = SegmentMemory::new();
    mem.map(0x2000, PAGE_SIZE, Prot::RX).unwrap();
    let mut mmu = Mmu::new(mem);
    let ctx = TranslationCtx::bare();

    // 0x00000013 (nop) stored as two parcels.
    mmu.mem_mut().write_u16_le(0x2000, 0x0013).unwrap();
    mmu.mem_mut().write_u16_le(0x2002, 0x0000).unwrap();
    assert_eq!(mmu.fetch(&ctx, 0x2000).unwrap(), (0x0000_0013, 4));
}
