//! End-to-end tests against synthesized static RISC-V ELF images.

use pretty_assertions::assert_eq;
use rvsim_cpu_core::Trap;
use rvsim_machine::{Machine, MachineConfig, RunExit};

const CODE_VADDR: u64 = 0x10000;

// --- tiny instruction encoders -------------------------------------------------

fn enc_i(imm: i32, rs1: u8, f3: u32, rd: u8, op: u32) -> u32 {
    ((imm as u32 & 0xfff) << 20) | ((rs1 as u32) << 15) | (f3 << 12) | ((rd as u32) << 7) | op
}

fn enc_s(imm: i32, rs2: u8, rs1: u8, f3: u32) -> u32 {
    let imm = imm as u32 & 0xfff;
    ((imm >> 5) << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | (f3 << 12)
        | ((imm & 0x1f) << 7)
        | 0x23
}

fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    ((rs2 as u32) << 20) | ((rs1 as u32) << 15) | ((rd as u32) << 7) | 0x33
}

fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    enc_i(imm, rs1, 0b000, rd, 0x13)
}

fn lui(rd: u8, imm20: u32) -> u32 {
    (imm20 << 12) | ((rd as u32) << 7) | 0x37
}

fn lb(rd: u8, rs1: u8, imm: i32) -> u32 {
    enc_i(imm, rs1, 0b000, rd, 0x03)
}

fn ld(rd: u8, rs1: u8, imm: i32) -> u32 {
    enc_i(imm, rs1, 0b011, rd, 0x03)
}

fn lw(rd: u8, rs1: u8, imm: i32) -> u32 {
    enc_i(imm, rs1, 0b010, rd, 0x03)
}

fn sb(rs2: u8, rs1: u8, imm: i32) -> u32 {
    enc_s(imm, rs2, rs1, 0b000)
}

fn sw(rs2: u8, rs1: u8, imm: i32) -> u32 {
    enc_s(imm, rs2, rs1, 0b010)
}

const ECALL: u32 = 0x0000_0073;

// --- minimal static ELF builder ------------------------------------------------

fn build_elf(class64: bool, code: &[u32], data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    for w in code {
        body.extend_from_slice(&w.to_le_bytes());
    }
    // Data lands at CODE_VADDR + 0x100.
    assert!(body.len() <= 0x100, "code overflows the data offset");
    body.resize(0x100, 0);
    body.extend_from_slice(data);

    let (ehsize, phentsize) = if class64 { (64u16, 56u16) } else { (52u16, 32u16) };
    let phoff = ehsize as u64;
    let file_body_off = 0x1000u64;

    let mut elf = Vec::new();
    // e_ident
    elf.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
    elf.push(if class64 { 2 } else { 1 });
    elf.push(1); // little-endian
    elf.push(1); // EV_CURRENT
    elf.push(0); // System V
    elf.extend_from_slice(&[0u8; 8]);
    // e_type, e_machine, e_version
    elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf.extend_from_slice(&243u16.to_le_bytes()); // EM_RISCV
    elf.extend_from_slice(&1u32.to_le_bytes());

    if class64 {
        elf.extend_from_slice(&CODE_VADDR.to_le_bytes()); // e_entry
        elf.extend_from_slice(&phoff.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    } else {
        elf.extend_from_slice(&(CODE_VADDR as u32).to_le_bytes());
        elf.extend_from_slice(&(phoff as u32).to_le_bytes());
        elf.extend_from_slice(&0u32.to_le_bytes());
    }
    elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    elf.extend_from_slice(&ehsize.to_le_bytes());
    elf.extend_from_slice(&phentsize.to_le_bytes());
    elf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(elf.len() as u64, phoff);

    let filesz = body.len() as u64;
    if class64 {
        elf.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        elf.extend_from_slice(&7u32.to_le_bytes()); // PF_RWX
        elf.extend_from_slice(&file_body_off.to_le_bytes());
        elf.extend_from_slice(&CODE_VADDR.to_le_bytes()); // p_vaddr
        elf.extend_from_slice(&CODE_VADDR.to_le_bytes()); // p_paddr
        elf.extend_from_slice(&filesz.to_le_bytes());
        elf.extend_from_slice(&filesz.to_le_bytes()); // p_memsz
        elf.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
    } else {
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&(file_body_off as u32).to_le_bytes());
        elf.extend_from_slice(&(CODE_VADDR as u32).to_le_bytes());
        elf.extend_from_slice(&(CODE_VADDR as u32).to_le_bytes());
        elf.extend_from_slice(&(filesz as u32).to_le_bytes());
        elf.extend_from_slice(&(filesz as u32).to_le_bytes());
        elf.extend_from_slice(&7u32.to_le_bytes()); // p_flags (after memsz on ELF32)
        elf.extend_from_slice(&0x1000u32.to_le_bytes());
    }

    elf.resize(file_body_off as usize, 0);
    elf.extend_from_slice(&body);
    elf
}

fn machine(elf: &[u8], args: &[&str]) -> Machine {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let mut m = Machine::new(elf, &args, &[], MachineConfig::default()).unwrap();
    m.capture_output();
    m
}

// --- tests ---------------------------------------------------------------------

#[test]
fn writes_hi_and_exits_with_status_7() {
    let code = [
        addi(10, 0, 1),        // a0 = fd 1
        lui(11, 0x10),         // a1 = 0x10000
        addi(11, 11, 0x100),   // a1 = &"hi\n"
        addi(12, 0, 3),        // a2 = 3
        addi(17, 0, 64),       // write
        ECALL,
        addi(10, 0, 7),
        addi(17, 0, 93),       // exit
        ECALL,
    ];
    let elf = build_elf(true, &code, b"hi\n");
    let mut m = machine(&elf, &["prog"]);

    let exit = m.run();
    assert_eq!(exit, RunExit::Exited { code: 7 });
    assert_eq!(m.take_output(), b"hi\n");
}

#[test]
fn rv32_image_runs_the_same_abi() {
    let code = [
        addi(10, 0, 1),
        lui(11, 0x10),
        addi(11, 11, 0x100),
        addi(12, 0, 2),
        addi(17, 0, 64),
        ECALL,
        addi(10, 0, 5),
        addi(17, 0, 93),
        ECALL,
    ];
    let elf = build_elf(false, &code, b"ok");
    let mut m = machine(&elf, &["prog"]);

    assert_eq!(m.cpu().xlen, rvsim_cpu_core::Xlen::Rv32);
    let exit = m.run();
    assert_eq!(exit, RunExit::Exited { code: 5 });
    assert_eq!(m.take_output(), b"ok");
}

#[test]
fn argc_is_visible_on_the_guest_stack() {
    let code = [
        ld(10, 2, 0),          // a0 = argc
        addi(17, 0, 93),
        ECALL,
    ];
    let elf = build_elf(true, &code, b"");
    let mut m = machine(&elf, &["prog", "one", "two"]);

    assert_eq!(m.run(), RunExit::Exited { code: 3 });
}

#[test]
fn brk_extends_the_heap() {
    let code = [
        addi(17, 0, 214),      // brk
        addi(10, 0, 0),
        ECALL,                 // a0 = current brk
        addi(11, 10, 0),       // a1 = old brk
        addi(10, 10, 64),
        ECALL,                 // extend by 64 bytes
        sb(0, 11, 0),          // touch the fresh page
        lb(10, 11, 0),         // reads back zero
        addi(17, 0, 93),
        ECALL,
    ];
    let elf = build_elf(true, &code, b"");
    let mut m = machine(&elf, &["prog"]);

    assert_eq!(m.run(), RunExit::Exited { code: 0 });
}

#[test]
fn mprotect_revokes_write_access() {
    let code = [
        addi(17, 0, 214),      // brk
        addi(10, 0, 0),
        ECALL,                 // a0 = current brk
        addi(8, 10, 0),        // s0 = heap base
        lui(5, 1),             // t0 = 0x1000
        add(10, 10, 5),
        ECALL,                 // extend by one page
        sw(0, 8, 0),           // writable while RW
        addi(17, 0, 226),      // mprotect(s0, 0x1000, PROT_READ)
        addi(10, 8, 0),
        addi(11, 5, 0),
        addi(12, 0, 1),
        ECALL,
        sw(0, 8, 0),           // faults now
    ];
    let elf = build_elf(true, &code, b"");
    let mut m = machine(&elf, &["prog"]);

    match m.run() {
        RunExit::Fault { trap, badaddr, .. } => {
            assert_eq!(trap, Trap::StoreFault { vaddr: 0x11000 });
            assert_eq!(badaddr, 0x11000);
        }
        other => panic!("expected a store fault, got {other:?}"),
    }
}

#[test]
fn unserviceable_fault_reports_pc_and_badaddr() {
    let code = [
        lw(10, 0, 0x40),       // load from unmapped 0x40
    ];
    let elf = build_elf(true, &code, b"");
    let mut m = machine(&elf, &["prog"]);

    match m.run() {
        RunExit::Fault { trap, pc, badaddr } => {
            assert_eq!(trap, Trap::LoadFault { vaddr: 0x40 });
            assert_eq!(pc, CODE_VADDR);
            assert_eq!(badaddr, 0x40);
            assert_eq!(m.cpu().badaddr, 0x40);
        }
        other => panic!("expected a fault, got {other:?}"),
    }
}

#[test]
fn unknown_syscall_returns_enosys() {
    let code = [
        addi(17, 0, 999),      // no such syscall
        ECALL,                 // a0 = -ENOSYS
        addi(10, 10, 38),      // a0 += ENOSYS → 0 when the proxy declined
        addi(17, 0, 93),
        ECALL,
    ];
    let elf = build_elf(true, &code, b"");
    let mut m = machine(&elf, &["prog"]);

    assert_eq!(m.run(), RunExit::Exited { code: 0 });
}
