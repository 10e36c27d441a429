use memory::{Mmu, TranslationCtx};
use rvsim_cpu_core::{CpuBus, CpuState, Trap};

/// [`CpuBus`] implementation routing every access through the soft-MMU.
///
/// The translation context is a snapshot of the CPU's privilege/paging state;
/// `sync` refreshes it at each instruction boundary, so satp or status
/// updates take effect on the following fetch.
pub struct MmuBus {
    mmu: Mmu,
    ctx: TranslationCtx,
}

impl MmuBus {
    pub fn new(mmu: Mmu) -> Self {
        Self {
            mmu,
            ctx: TranslationCtx::bare(),
        }
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn ctx(&self) -> &TranslationCtx {
        &self.ctx
    }

    /// Translated bulk read used by syscall argument marshalling.
    pub fn read_guest_bytes(&mut self, vaddr: u64, len: usize) -> Result<Vec<u8>, Trap> {
        let mut buf = vec![0u8; len];
        self.mmu.read_bytes(&self.ctx, vaddr, &mut buf)?;
        Ok(buf)
    }

    /// Translated bulk write used by syscall result marshalling.
    pub fn write_guest_bytes(&mut self, vaddr: u64, src: &[u8]) -> Result<(), Trap> {
        self.mmu.write_bytes(&self.ctx, vaddr, src)?;
        Ok(())
    }

    /// Read a NUL-terminated guest string, capped at `max` bytes.
    pub fn read_guest_cstr(&mut self, vaddr: u64, max: usize) -> Result<Vec<u8>, Trap> {
        let mut out = Vec::new();
        for i in 0..max as u64 {
            let b = self.mmu.load_u8(&self.ctx, vaddr.wrapping_add(i))?;
            if b == 0 {
                break;
            }
            out.push(b);
        }
        Ok(out)
    }
}

impl CpuBus for MmuBus {
    fn sync(&mut self, state: &CpuState) {
        self.ctx = state.translation_ctx();
    }

    fn sfence_vma(&mut self, vaddr: Option<u64>) {
        match vaddr {
            Some(va) => self.mmu.flush_tlb_page(va),
            None => self.mmu.flush_tlbs(),
        }
    }

    fn fetch(&mut self, pc: u64) -> Result<(u32, u8), Trap> {
        Ok(self.mmu.fetch(&self.ctx, pc)?)
    }

    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Trap> {
        Ok(self.mmu.load_u8(&self.ctx, vaddr)?)
    }

    fn read_u16(&mut self, vaddr: u64) -> Result<u16, Trap> {
        Ok(self.mmu.load_u16(&self.ctx, vaddr)?)
    }

    fn read_u32(&mut self, vaddr: u64) -> Result<u32, Trap> {
        Ok(self.mmu.load_u32(&self.ctx, vaddr)?)
    }

    fn read_u64(&mut self, vaddr: u64) -> Result<u64, Trap> {
        Ok(self.mmu.load_u64(&self.ctx, vaddr)?)
    }

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Trap> {
        Ok(self.mmu.store_u8(&self.ctx, vaddr, val)?)
    }

    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), Trap> {
        Ok(self.mmu.store_u16(&self.ctx, vaddr, val)?)
    }

    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Trap> {
        Ok(self.mmu.store_u32(&self.ctx, vaddr, val)?)
    }

    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), Trap> {
        Ok(self.mmu.store_u64(&self.ctx, vaddr, val)?)
    }
}
