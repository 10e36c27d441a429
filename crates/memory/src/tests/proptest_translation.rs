use proptest::prelude::*;

use super::helpers::{new_mmu, sv39_chain, sv39_ctx, write_pte64};
use crate::mmu::pte;
use crate::{AccessType, Mmu, PrivilegeMode, TranslationCtx};

#[derive(Clone, Debug)]
struct Mapping {
    valid: bool,
    readable: bool,
    writable: bool,
    executable: bool,
    user: bool,
    dirty: bool,
    phys_page: u64,
}

impl Mapping {
    fn flags(&self) -> u16 {
        let mut f = pte::A;
        if self.valid {
            f |= pte::V;
        }
        if self.readable {
            f |= pte::R;
        }
        if self.writable {
            f |= pte::W;
        }
        if self.executable {
            f |= pte::X;
        }
        if self.user {
            f |= pte::U;
        }
        if self.dirty {
            f |= pte::D;
        }
        f
    }
}

prop_compose! {
    fn arb_mapping(max_phys_pages: u64)(
        valid in any::<bool>(),
        readable in any::<bool>(),
        writable in any::<bool>(),
        executable in any::<bool>(),
        user in any::<bool>(),
        dirty in any::<bool>(),
        phys_page in 1u64..max_phys_pages,
    ) -> Mapping {
        Mapping { valid, readable, writable, executable, user, dirty, phys_page }
    }
}

fn build_tables(mappings: &[Mapping]) -> (Mmu, TranslationCtx) {
    let mut mmu = new_mmu(16, 8);
    let (root, _l1, l0) = sv39_chain(&mut mmu, 0, 0);
    for (i, m) in mappings.iter().enumerate() {
        write_pte64(&mut mmu, l0, i as u64, m.phys_page, m.flags());
    }
    let mut ctx = sv39_ctx(root);
    ctx.mode = PrivilegeMode::User;
    (mmu, ctx)
}

fn arb_access() -> impl Strategy<Value = AccessType> {
    prop_oneof![
        Just(AccessType::Fetch),
        Just(AccessType::Load),
        Just(AccessType::Store),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Translating through a warm TLB must agree, success or fault, with
    // re-walking the page table on every access.
    #[test]
    fn tlb_path_matches_walk_path(
        mappings in prop::collection::vec(arb_mapping(15), 1..16),
        accesses in prop::collection::vec((0usize..16usize, 0u16..4096u16, arb_access()), 1..32),
    ) {
        let (mut mmu_tlb, ctx) = build_tables(&mappings);
        let (mut mmu_walk, _) = build_tables(&mappings);

        for (page_idx, offset, access) in accesses {
            let vaddr = ((page_idx as u64) << 12) | offset as u64;

            let res_tlb = mmu_tlb.translate(&ctx, vaddr, access);
            mmu_walk.flush_tlbs();
            let res_walk = mmu_walk.translate(&ctx, vaddr, access);
            prop_assert_eq!(res_tlb, res_walk);
        }
    }
}
