//! Static RISC-V ELF image loading.

use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use memory::{Prot, SegmentMemory, PAGE_MASK, PAGE_SIZE};
use rvsim_cpu_core::Xlen;
use thiserror::Error;

const EM_RISCV: u16 = 243;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("not a parseable ELF: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("not a RISC-V executable (e_machine = {0})")]
    WrongMachine(u16),
    #[error("no PT_LOAD segment")]
    NoLoadSegments,
    #[error("segment at 0x{vaddr:x} cannot be mapped: {source}")]
    Map {
        vaddr: u64,
        #[source]
        source: memory::MemError,
    },
}

/// One symbol-table entry kept for symbolication.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub addr: u64,
    pub size: u64,
    pub name: String,
}

/// What image loading leaves behind for stack construction and the proxy.
#[derive(Debug)]
pub struct LoadedImage {
    pub entry: u64,
    pub xlen: Xlen,
    /// First free address above the highest LOAD segment (initial brk).
    pub brk_base: u64,
    /// Guest address of the program-header table, for AT_PHDR.
    pub phdr_addr: u64,
    pub phent: u64,
    pub phnum: u64,
    /// Sorted by address; empty unless symbolication was requested.
    pub symbols: Vec<Symbol>,
}

/// Map every PT_LOAD segment of `bytes` into guest physical memory,
/// zero-filling the `p_memsz - p_filesz` tail.
pub fn load_elf(
    mem: &mut SegmentMemory,
    bytes: &[u8],
    want_symbols: bool,
) -> Result<LoadedImage, LoadError> {
    let elf = Elf::parse(bytes)?;
    if elf.header.e_machine != EM_RISCV {
        return Err(LoadError::WrongMachine(elf.header.e_machine));
    }
    let xlen = if elf.is_64 { Xlen::Rv64 } else { Xlen::Rv32 };

    let mut brk_base = 0u64;
    let mut phdr_addr = 0u64;
    let mut mapped_any = false;

    for ph in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        let base = ph.p_vaddr & !PAGE_MASK;
        let end = (ph.p_vaddr + ph.p_memsz + PAGE_MASK) & !PAGE_MASK;
        let prot = elf_prot(ph.p_flags);

        tracing::debug!(
            vaddr = format_args!("0x{:x}", ph.p_vaddr),
            filesz = format_args!("0x{:x}", ph.p_filesz),
            memsz = format_args!("0x{:x}", ph.p_memsz),
            prot = ?prot,
            "load segment"
        );

        // Map the uncovered page runs; neighbouring LOAD segments may share
        // an edge page, whose protection is then first-come.
        let mut run_start: Option<u64> = None;
        let mut page = base;
        while page <= end {
            let covered = page < end && mem.is_mapped(page, PAGE_SIZE);
            if page == end || covered {
                if let Some(start) = run_start.take() {
                    mem.map(start, page - start, prot)
                        .map_err(|source| LoadError::Map { vaddr: ph.p_vaddr, source })?;
                }
            } else if run_start.is_none() {
                run_start = Some(page);
            }
            page += PAGE_SIZE;
        }

        let file = &bytes[ph.file_range()];
        if !file.is_empty() {
            mem.write_from(ph.p_vaddr, file)
                .map_err(|source| LoadError::Map { vaddr: ph.p_vaddr, source })?;
        }

        // The program-header table usually lives inside the first segment.
        let phoff = elf.header.e_phoff;
        if phoff >= ph.p_offset && phoff < ph.p_offset + ph.p_filesz {
            phdr_addr = ph.p_vaddr + (phoff - ph.p_offset);
        }

        brk_base = brk_base.max(end);
        mapped_any = true;
    }

    if !mapped_any {
        return Err(LoadError::NoLoadSegments);
    }

    let mut symbols = Vec::new();
    if want_symbols {
        for sym in elf.syms.iter() {
            if sym.st_value == 0 {
                continue;
            }
            if let Some(name) = elf.strtab.get_at(sym.st_name) {
                if !name.is_empty() {
                    symbols.push(Symbol {
                        addr: sym.st_value,
                        size: sym.st_size,
                        name: name.to_string(),
                    });
                }
            }
        }
        symbols.sort_by_key(|s| s.addr);
    }

    Ok(LoadedImage {
        entry: elf.header.e_entry,
        xlen,
        brk_base,
        phdr_addr,
        phent: elf.header.e_phentsize as u64,
        phnum: elf.header.e_phnum as u64,
        symbols,
    })
}

fn elf_prot(p_flags: u32) -> Prot {
    let mut prot = Prot::NONE;
    if p_flags & PF_R != 0 {
        prot = prot.union(Prot::R);
    }
    if p_flags & PF_W != 0 {
        prot = prot.union(Prot::W);
    }
    if p_flags & PF_X != 0 {
        prot = prot.union(Prot::X);
    }
    prot
}

/// Resolve an address to `name` or `name+0x<offset>`, preferring an exact or
/// containing symbol and falling back to the nearest one below.
pub fn resolve_symbol(symbols: &[Symbol], addr: u64) -> Option<String> {
    if symbols.is_empty() {
        return None;
    }
    let idx = symbols.partition_point(|s| s.addr <= addr);
    let sym = &symbols[idx.checked_sub(1)?];
    let offset = addr - sym.addr;
    if offset == 0 {
        Some(sym.name.clone())
    } else if sym.size == 0 || offset < sym.size {
        Some(format!("{}+0x{offset:x}", sym.name))
    } else {
        None
    }
}
