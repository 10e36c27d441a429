mod helpers;
mod mmu_identity;
mod mmu_sv39;
mod proptest_translation;
