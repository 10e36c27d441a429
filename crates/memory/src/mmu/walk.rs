//! Multi-level page-table walker for the sv32/sv39/sv48 schemes.

use crate::phys::{SegmentMemory, PAGE_SHIFT};

/// PTE flag bits shared by all schemes.
pub mod pte {
    pub const V: u16 = 1 << 0;
    pub const R: u16 = 1 << 1;
    pub const W: u16 = 1 << 2;
    pub const X: u16 = 1 << 3;
    pub const U: u16 = 1 << 4;
    pub const G: u16 = 1 << 5;
    pub const A: u16 = 1 << 6;
    pub const D: u16 = 1 << 7;
}

/// Paged address-translation scheme parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingScheme {
    Sv32,
    Sv39,
    Sv48,
}

impl PagingScheme {
    /// Number of page-table levels.
    #[inline]
    pub const fn levels(self) -> u32 {
        match self {
            PagingScheme::Sv32 => 2,
            PagingScheme::Sv39 => 3,
            PagingScheme::Sv48 => 4,
        }
    }

    /// vpn bits consumed per level.
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            PagingScheme::Sv32 => 10,
            PagingScheme::Sv39 | PagingScheme::Sv48 => 9,
        }
    }

    /// Size of one PTE in bytes.
    #[inline]
    pub const fn pte_size(self) -> u64 {
        match self {
            PagingScheme::Sv32 => 4,
            PagingScheme::Sv39 | PagingScheme::Sv48 => 8,
        }
    }

    /// Width of the root ppn field in the page-table base register; bits above
    /// it tag the address space.
    #[inline]
    pub const fn ppn_bits(self) -> u32 {
        match self {
            PagingScheme::Sv32 => 22,
            PagingScheme::Sv39 | PagingScheme::Sv48 => 44,
        }
    }

    /// Extract the ppn field from a raw PTE word.
    #[inline]
    fn pte_ppn(self, raw: u64) -> u64 {
        (raw >> 10) & ((1u64 << self.ppn_bits()) - 1)
    }
}

/// A successfully-walked leaf translation.
///
/// `shift` is the number of low virtual-address bits that pass straight
/// through: 12 for a 4 KiB leaf, more when the leaf sits at a higher level
/// (megapage/gigapage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafPte {
    pub ppn: u64,
    pub flags: u16,
    pub shift: u32,
}

impl LeafPte {
    /// Compose the physical address for `vaddr` through this leaf.
    #[inline]
    pub fn translate(&self, vaddr: u64) -> u64 {
        (self.ppn << PAGE_SHIFT) + (vaddr & ((1u64 << self.shift) - 1))
    }
}

/// Walk the page table rooted at `root_ppn` for `vaddr`.
///
/// Performs only the validity tests the walk itself owes (`V = 0`, then the
/// reserved `W ∧ ¬R` encoding, in that order); permission and mode checks
/// against the leaf flags are the caller's job. Returns `None` on any
/// translation failure.
pub fn walk(
    mem: &SegmentMemory,
    scheme: PagingScheme,
    root_ppn: u64,
    vaddr: u64,
) -> Option<LeafPte> {
    let mut ppn = root_ppn;

    for level in (0..scheme.levels()).rev() {
        let shift = scheme.bits() * level + PAGE_SHIFT;
        let vpn = (vaddr >> shift) & ((1u64 << scheme.bits()) - 1);
        let pte_pa = (ppn << PAGE_SHIFT) + vpn * scheme.pte_size();

        let raw = match scheme.pte_size() {
            4 => mem.read_u32_le(pte_pa).ok()? as u64,
            _ => mem.read_u64_le(pte_pa).ok()?,
        };
        let flags = (raw & 0x3ff) as u16;

        if flags & pte::V == 0 {
            walk_failed(scheme, vaddr, level, ppn, raw);
            return None;
        }
        if flags & pte::R == 0 && flags & pte::W != 0 {
            walk_failed(scheme, vaddr, level, ppn, raw);
            return None;
        }

        let entry_ppn = scheme.pte_ppn(raw);
        if flags & (pte::R | pte::X) != 0 {
            return Some(LeafPte {
                ppn: entry_ppn,
                flags,
                shift,
            });
        }

        ppn = entry_ppn;
    }

    // Ran out of levels without hitting a leaf.
    walk_failed(scheme, vaddr, 0, ppn, 0);
    None
}

#[inline]
fn walk_failed(scheme: PagingScheme, vaddr: u64, level: u32, ppn: u64, raw: u64) {
    tracing::trace!(
        ?scheme,
        vaddr = format_args!("0x{vaddr:x}"),
        level,
        ppn = format_args!("0x{ppn:x}"),
        pte = format_args!("0x{raw:x}"),
        "page-table walk failed"
    );
}
