use crate::state::CpuState;
use crate::trap::Trap;

/// Memory interface the interpreter drives.
///
/// Implementations translate guest virtual addresses however they see fit
/// (identity for tests, through the soft-MMU for the real machine) and
/// report failures as [`Trap`] values carrying the faulting address.
pub trait CpuBus {
    /// Synchronize any translation state cached by the bus with the current
    /// CPU state. The run loop calls this once per instruction boundary,
    /// before fetch, so a paging-aware bus observes privilege/satp updates.
    #[inline]
    fn sync(&mut self, _state: &CpuState) {}

    /// Invalidate cached translations (sfence.vma). `vaddr` of `None` flushes
    /// everything.
    #[inline]
    fn sfence_vma(&mut self, _vaddr: Option<u64>) {}

    /// Fetch one instruction at `pc`, returning the raw bits and the pc
    /// increment (2 for a compressed parcel, 4 otherwise).
    fn fetch(&mut self, pc: u64) -> Result<(u32, u8), Trap>;

    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Trap>;
    fn read_u16(&mut self, vaddr: u64) -> Result<u16, Trap>;
    fn read_u32(&mut self, vaddr: u64) -> Result<u32, Trap>;
    fn read_u64(&mut self, vaddr: u64) -> Result<u64, Trap>;

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Trap>;
    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), Trap>;
    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Trap>;
    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), Trap>;
}

/// Identity-mapped flat memory bus used by unit tests.
#[derive(Debug, Clone)]
pub struct FlatBus {
    mem: Vec<u8>,
}

impl FlatBus {
    pub fn new(size: usize) -> Self {
        Self { mem: vec![0; size] }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    /// Store a little-endian instruction stream starting at `addr`.
    pub fn load_code(&mut self, addr: u64, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.load(addr + 4 * i as u64, &w.to_le_bytes());
        }
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        &self.mem[addr as usize..addr as usize + len]
    }

    fn read_n<const N: usize>(&self, vaddr: u64, on_fail: Trap) -> Result<[u8; N], Trap> {
        let start = usize::try_from(vaddr).map_err(|_| on_fail)?;
        let end = start.checked_add(N).ok_or(on_fail)?;
        if end > self.mem.len() {
            return Err(on_fail);
        }
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.mem[start..end]);
        Ok(buf)
    }

    fn write_n(&mut self, vaddr: u64, bytes: &[u8]) -> Result<(), Trap> {
        let fail = Trap::StoreFault { vaddr };
        let start = usize::try_from(vaddr).map_err(|_| fail)?;
        let end = start.checked_add(bytes.len()).ok_or(fail)?;
        if end > self.mem.len() {
            return Err(fail);
        }
        self.mem[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

impl CpuBus for FlatBus {
    fn fetch(&mut self, pc: u64) -> Result<(u32, u8), Trap> {
        if pc & 1 != 0 {
            return Err(Trap::MisalignedFetch { vaddr: pc });
        }
        let fail = Trap::FetchFault { vaddr: pc };
        let lo = u16::from_le_bytes(self.read_n::<2>(pc, fail)?);
        if lo & 0b11 == 0b11 {
            let fail = Trap::FetchFault { vaddr: pc + 2 };
            let hi = u16::from_le_bytes(self.read_n::<2>(pc + 2, fail)?);
            Ok((((hi as u32) << 16) | lo as u32, 4))
        } else {
            Ok((lo as u32, 2))
        }
    }

    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Trap> {
        Ok(self.read_n::<1>(vaddr, Trap::LoadFault { vaddr })?[0])
    }

    fn read_u16(&mut self, vaddr: u64) -> Result<u16, Trap> {
        if vaddr & 1 != 0 {
            return Err(Trap::MisalignedLoad { vaddr });
        }
        Ok(u16::from_le_bytes(self.read_n(vaddr, Trap::LoadFault { vaddr })?))
    }

    fn read_u32(&mut self, vaddr: u64) -> Result<u32, Trap> {
        if vaddr & 3 != 0 {
            return Err(Trap::MisalignedLoad { vaddr });
        }
        Ok(u32::from_le_bytes(self.read_n(vaddr, Trap::LoadFault { vaddr })?))
    }

    fn read_u64(&mut self, vaddr: u64) -> Result<u64, Trap> {
        if vaddr & 7 != 0 {
            return Err(Trap::MisalignedLoad { vaddr });
        }
        Ok(u64::from_le_bytes(self.read_n(vaddr, Trap::LoadFault { vaddr })?))
    }

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Trap> {
        self.write_n(vaddr, &[val])
    }

    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), Trap> {
        if vaddr & 1 != 0 {
            return Err(Trap::MisalignedStore { vaddr });
        }
        self.write_n(vaddr, &val.to_le_bytes())
    }

    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Trap> {
        if vaddr & 3 != 0 {
            return Err(Trap::MisalignedStore { vaddr });
        }
        self.write_n(vaddr, &val.to_le_bytes())
    }

    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), Trap> {
        if vaddr & 7 != 0 {
            return Err(Trap::MisalignedStore { vaddr });
        }
        self.write_n(vaddr, &val.to_le_bytes())
    }
}
