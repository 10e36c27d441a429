//! Guest stack construction: the standard ABI frame of argc/argv/envp plus
//! an auxiliary vector, placed just below the top of guest memory.

use memory::{MemResult, Prot, SegmentMemory};
use rvsim_cpu_core::{CpuState, Xlen};

use crate::loader::LoadedImage;

pub const STACK_SIZE: u64 = 0x0010_0000; // 1 MiB

// Auxiliary-vector tags.
const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_ENTRY: u64 = 9;
const AT_RANDOM: u64 = 25;

/// Highest guest address; the stack grows down from here.
pub fn memory_top(xlen: Xlen) -> u64 {
    match xlen {
        Xlen::Rv32 => 0x8000_0000,
        Xlen::Rv64 => 0x40_0000_0000,
    }
}

fn write_word(mem: &mut SegmentMemory, xlen: Xlen, addr: u64, value: u64) -> MemResult<()> {
    match xlen {
        Xlen::Rv32 => mem.write_u32_le(addr, value as u32),
        Xlen::Rv64 => mem.write_u64_le(addr, value),
    }
}

/// Map the stack segment, lay out the ABI frame and point sp at it.
///
/// Frame layout (low → high): argc, argv[0..], NULL, envp[0..], NULL, auxv
/// pairs, AT_NULL pair; the referenced strings and the AT_RANDOM bytes live
/// above the vectors, right under `memory_top`.
pub fn build_stack(
    mem: &mut SegmentMemory,
    cpu: &mut CpuState,
    image: &LoadedImage,
    args: &[String],
    env: &[String],
    at_random: [u8; 16],
) -> MemResult<u64> {
    let xlen = cpu.xlen;
    let top = memory_top(xlen);
    let word = match xlen {
        Xlen::Rv32 => 4u64,
        Xlen::Rv64 => 8u64,
    };

    mem.map(top - STACK_SIZE, STACK_SIZE, Prot::RW)?;

    // Strings blob, offsets recorded relative to its base.
    let mut blob = Vec::new();
    let mut arg_offsets = Vec::with_capacity(args.len());
    for a in args {
        arg_offsets.push(blob.len() as u64);
        blob.extend_from_slice(a.as_bytes());
        blob.push(0);
    }
    let mut env_offsets = Vec::with_capacity(env.len());
    for e in env {
        env_offsets.push(blob.len() as u64);
        blob.extend_from_slice(e.as_bytes());
        blob.push(0);
    }
    while blob.len() % 16 != 0 {
        blob.push(0);
    }
    let random_offset = blob.len() as u64;
    blob.extend_from_slice(&at_random);

    let strings_base = (top - blob.len() as u64) & !0xf;
    mem.write_from(strings_base, &blob)?;

    let mut vector: Vec<u64> = Vec::new();
    vector.push(args.len() as u64);
    vector.extend(arg_offsets.iter().map(|o| strings_base + o));
    vector.push(0);
    vector.extend(env_offsets.iter().map(|o| strings_base + o));
    vector.push(0);
    for (tag, value) in [
        (AT_PHDR, image.phdr_addr),
        (AT_PHENT, image.phent),
        (AT_PHNUM, image.phnum),
        (AT_PAGESZ, memory::PAGE_SIZE),
        (AT_ENTRY, image.entry),
        (AT_RANDOM, strings_base + random_offset),
        (AT_NULL, 0),
    ] {
        vector.push(tag);
        vector.push(value);
    }

    let sp = (strings_base - vector.len() as u64 * word) & !0xf;
    for (i, v) in vector.iter().enumerate() {
        write_word(mem, xlen, sp + i as u64 * word, *v)?;
    }

    cpu.set_x(2, sp);
    Ok(sp)
}

/// Keep only environment variables whose name is on the allow-list.
pub fn filter_env<'a>(
    host_env: impl Iterator<Item = (String, String)>,
    allow: &'a [String],
) -> Vec<String> {
    host_env
        .filter(|(name, _)| allow.iter().any(|a| a == name))
        .map(|(name, value)| format!("{name}={value}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadedImage;
    use rvsim_cpu_core::{CpuState, IsaExt};

    fn dummy_image() -> LoadedImage {
        LoadedImage {
            entry: 0x1_0000,
            xlen: Xlen::Rv64,
            brk_base: 0x2_0000,
            phdr_addr: 0x1_0040,
            phent: 56,
            phnum: 2,
            symbols: Vec::new(),
        }
    }

    #[test]
    fn frame_layout_matches_the_abi() {
        let mut mem = SegmentMemory::new();
        let mut cpu = CpuState::new(Xlen::Rv64, IsaExt::IMAFDC);
        let args = vec!["prog".to_string(), "arg1".to_string()];
        let env = vec!["TERM=xterm".to_string()];

        let sp = build_stack(&mut mem, &mut cpu, &dummy_image(), &args, &env, [7; 16]).unwrap();
        assert_eq!(cpu.x(2), sp);
        assert_eq!(sp % 16, 0);

        // argc
        assert_eq!(mem.read_u64_le(sp).unwrap(), 2);
        // argv[0] points at "prog\0"
        let argv0 = mem.read_u64_le(sp + 8).unwrap();
        assert_eq!(mem.get_slice(argv0, 5).unwrap(), b"prog\0");
        let argv1 = mem.read_u64_le(sp + 16).unwrap();
        assert_eq!(mem.get_slice(argv1, 5).unwrap(), b"arg1\0");
        // argv terminator
        assert_eq!(mem.read_u64_le(sp + 24).unwrap(), 0);
        // envp[0]
        let envp0 = mem.read_u64_le(sp + 32).unwrap();
        assert_eq!(mem.get_slice(envp0, 10).unwrap(), b"TERM=xterm");
        assert_eq!(mem.read_u64_le(sp + 40).unwrap(), 0);

        // First auxv pair.
        assert_eq!(mem.read_u64_le(sp + 48).unwrap(), 3); // AT_PHDR
        assert_eq!(mem.read_u64_le(sp + 56).unwrap(), 0x1_0040);
    }

    #[test]
    fn at_random_bytes_are_reachable() {
        let mut mem = SegmentMemory::new();
        let mut cpu = CpuState::new(Xlen::Rv64, IsaExt::IMAFDC);
        let sp = build_stack(
            &mut mem,
            &mut cpu,
            &dummy_image(),
            &["p".to_string()],
            &[],
            [0xab; 16],
        )
        .unwrap();

        // Scan the auxv for AT_RANDOM.
        let mut addr = sp + 8; // skip argc
        while mem.read_u64_le(addr).unwrap() != 0 {
            addr += 8; // argv entries
        }
        addr += 8; // argv NULL
        while mem.read_u64_le(addr).unwrap() != 0 {
            addr += 8; // envp entries
        }
        addr += 8; // envp NULL
        loop {
            let tag = mem.read_u64_le(addr).unwrap();
            let value = mem.read_u64_le(addr + 8).unwrap();
            if tag == 0 {
                panic!("AT_RANDOM not found");
            }
            if tag == 25 {
                assert_eq!(mem.get_slice(value, 16).unwrap(), &[0xab; 16]);
                break;
            }
            addr += 16;
        }
    }

    #[test]
    fn env_filtering_defaults_to_term_only() {
        let host = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("PATH".to_string(), "/bin".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let allow = vec!["TERM".to_string()];
        let filtered = filter_env(host.into_iter(), &allow);
        assert_eq!(filtered, vec!["TERM=xterm-256color".to_string()]);
    }
}
