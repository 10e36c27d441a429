use core::fmt;

/// Physical memory attributes for a contiguous physical range.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PmaFlags(u8);

impl PmaFlags {
    pub const R: PmaFlags = PmaFlags(1 << 0);
    pub const W: PmaFlags = PmaFlags(1 << 1);
    pub const X: PmaFlags = PmaFlags(1 << 2);
    pub const CACHEABLE: PmaFlags = PmaFlags(1 << 3);
    pub const IO: PmaFlags = PmaFlags(1 << 4);
    pub const COHERENT: PmaFlags = PmaFlags(1 << 5);

    /// Main-memory default: readable, writable, executable, cacheable,
    /// coherent.
    pub const MAIN: PmaFlags =
        PmaFlags(Self::R.0 | Self::W.0 | Self::X.0 | Self::CACHEABLE.0 | Self::COHERENT.0);

    #[inline]
    pub const fn contains(self, other: PmaFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: PmaFlags) -> PmaFlags {
        PmaFlags(self.0 | other.0)
    }
}

impl fmt::Debug for PmaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (PmaFlags::R, "R"),
            (PmaFlags::W, "W"),
            (PmaFlags::X, "X"),
            (PmaFlags::CACHEABLE, "C"),
            (PmaFlags::IO, "IO"),
            (PmaFlags::COHERENT, "COH"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PmaEntry {
    base: u64,
    len: u64,
    flags: PmaFlags,
}

/// Fixed-capacity ordered table of physical memory attributes.
///
/// Lookup returns the first entry whose range contains the queried physical
/// address; addresses matching no entry get the unconstrained main-memory
/// default. The MMU consults this after translation, so e.g. a store into a
/// read-only range faults regardless of what the PTE allows.
#[derive(Debug, Default)]
pub struct PmaTable {
    entries: Vec<PmaEntry>,
}

impl PmaTable {
    pub const CAPACITY: usize = 8;

    pub fn new() -> Self {
        Self::default()
    }

    /// Declare attributes for `[base, base + len)`. Returns `false` when the
    /// table is full.
    pub fn insert(&mut self, base: u64, len: u64, flags: PmaFlags) -> bool {
        if self.entries.len() == Self::CAPACITY {
            return false;
        }
        self.entries.push(PmaEntry { base, len, flags });
        true
    }

    /// Attributes in effect at `paddr`.
    pub fn lookup(&self, paddr: u64) -> PmaFlags {
        self.entries
            .iter()
            .find(|e| paddr >= e.base && paddr - e.base < e.len)
            .map(|e| e.flags)
            .unwrap_or(PmaFlags::MAIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_first_match_wins() {
        let mut pma = PmaTable::new();
        assert!(pma.insert(0x1000, 0x1000, PmaFlags::R.union(PmaFlags::CACHEABLE)));
        assert!(pma.insert(0x0, 0x10000, PmaFlags::MAIN));

        assert_eq!(pma.lookup(0x1800), PmaFlags::R.union(PmaFlags::CACHEABLE));
        assert_eq!(pma.lookup(0x800), PmaFlags::MAIN);
    }

    #[test]
    fn unmatched_address_gets_default() {
        let pma = PmaTable::new();
        assert_eq!(pma.lookup(0xffff_0000), PmaFlags::MAIN);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut pma = PmaTable::new();
        for i in 0..PmaTable::CAPACITY {
            assert!(pma.insert(i as u64 * 0x1000, 0x1000, PmaFlags::MAIN));
        }
        assert!(!pma.insert(0x100000, 0x1000, PmaFlags::MAIN));
    }
}
