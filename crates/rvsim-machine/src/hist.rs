//! Execution histograms: pc, register and instruction usage.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

use rvsim_cpu_core::disasm;
use rvsim_cpu_core::interp::Decoded;

#[derive(Debug, Default)]
pub struct Histograms {
    pub pc: BTreeMap<u64, u64>,
    pub reg: [u64; 32],
    pub inst: BTreeMap<&'static str, u64>,
}

impl Histograms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pc(&mut self, pc: u64) {
        *self.pc.entry(pc).or_insert(0) += 1;
    }

    pub fn record_regs(&mut self, d: &Decoded) {
        for r in d.inst.regs_read().into_iter().flatten() {
            self.reg[r as usize] += 1;
        }
        if let Some(r) = d.inst.reg_written() {
            self.reg[r as usize] += 1;
        }
    }

    pub fn record_inst(&mut self, d: &Decoded) {
        *self.inst.entry(disasm::mnemonic(&d.inst)).or_insert(0) += 1;
    }

    /// Human-readable dump, most-frequent first.
    pub fn dump(&self, w: &mut dyn Write) -> io::Result<()> {
        if !self.inst.is_empty() {
            writeln!(w, "instruction usage:")?;
            let mut rows: Vec<_> = self.inst.iter().collect();
            rows.sort_by(|a, b| b.1.cmp(a.1));
            for (name, count) in rows {
                writeln!(w, "  {name:<12} {count}")?;
            }
        }
        if self.reg.iter().any(|&c| c != 0) {
            writeln!(w, "register usage:")?;
            let mut rows: Vec<_> = (0..32).filter(|&r| self.reg[r] != 0).collect();
            rows.sort_by(|&a, &b| self.reg[b].cmp(&self.reg[a]));
            for r in rows {
                writeln!(w, "  {:<12} {}", disasm::X_NAMES[r], self.reg[r])?;
            }
        }
        if !self.pc.is_empty() {
            writeln!(w, "pc usage (top 32):")?;
            let mut rows: Vec<_> = self.pc.iter().collect();
            rows.sort_by(|a, b| b.1.cmp(a.1));
            for (pc, count) in rows.into_iter().take(32) {
                writeln!(w, "  0x{pc:016x} {count}")?;
            }
        }
        Ok(())
    }

    /// Write one file per histogram into `dir`.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)?;

        let mut f = std::fs::File::create(dir.join("inst.hist"))?;
        for (name, count) in &self.inst {
            writeln!(f, "{name} {count}")?;
        }

        let mut f = std::fs::File::create(dir.join("reg.hist"))?;
        for r in 0..32 {
            writeln!(f, "{} {}", disasm::X_NAMES[r], self.reg[r])?;
        }

        let mut f = std::fs::File::create(dir.join("pc.hist"))?;
        for (pc, count) in &self.pc {
            writeln!(f, "0x{pc:x} {count}")?;
        }
        Ok(())
    }
}
