//! Text rendering of decoded instructions for the execution trace.

use crate::interp::decode::{
    AluOp, AmoOp, AmoWidth, BranchCond, CsrOp, CsrSrc, FmaOp, FpAluOp, FpCmpOp, FpWidth, Inst,
    IntWidth, LoadWidth, StoreWidth,
};
use crate::interp::Decoded;
use crate::state::Reg;

pub const X_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

pub const F_NAMES: [&str; 32] = [
    "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7", "fs0", "fs1", "fa0", "fa1", "fa2",
    "fa3", "fa4", "fa5", "fa6", "fa7", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7", "fs8", "fs9",
    "fs10", "fs11", "ft8", "ft9", "ft10", "ft11",
];

#[inline]
pub fn reg_name(r: Reg) -> &'static str {
    X_NAMES[r as usize]
}

#[inline]
pub fn freg_name(r: Reg) -> &'static str {
    F_NAMES[r as usize]
}

/// Address symbolication callback: `addr` → `symbol` or `symbol+0x10`.
pub type Resolver<'a> = &'a dyn Fn(u64) -> Option<String>;

#[derive(Default, Clone, Copy)]
pub struct DisasmOptions<'a> {
    /// Fold common idioms into pseudo-instructions (li, mv, ret, beqz, ...).
    pub pseudo: bool,
    pub resolver: Option<Resolver<'a>>,
}

/// Mnemonic used for the instruction-usage histogram.
pub fn mnemonic(inst: &Inst) -> &'static str {
    match inst {
        Inst::Lui { .. } => "lui",
        Inst::Auipc { .. } => "auipc",
        Inst::Jal { .. } => "jal",
        Inst::Jalr { .. } => "jalr",
        Inst::Branch { cond, .. } => match cond {
            BranchCond::Eq => "beq",
            BranchCond::Ne => "bne",
            BranchCond::Lt => "blt",
            BranchCond::Ge => "bge",
            BranchCond::Ltu => "bltu",
            BranchCond::Geu => "bgeu",
        },
        Inst::Load { width, .. } => match width {
            LoadWidth::B => "lb",
            LoadWidth::H => "lh",
            LoadWidth::W => "lw",
            LoadWidth::D => "ld",
            LoadWidth::Bu => "lbu",
            LoadWidth::Hu => "lhu",
            LoadWidth::Wu => "lwu",
        },
        Inst::Store { width, .. } => match width {
            StoreWidth::B => "sb",
            StoreWidth::H => "sh",
            StoreWidth::W => "sw",
            StoreWidth::D => "sd",
        },
        Inst::OpImm { op, .. } => match op {
            AluOp::Add => "addi",
            AluOp::Slt => "slti",
            AluOp::Sltu => "sltiu",
            AluOp::Xor => "xori",
            AluOp::Or => "ori",
            AluOp::And => "andi",
            AluOp::Sll => "slli",
            AluOp::Srl => "srli",
            AluOp::Sra => "srai",
            _ => "op-imm",
        },
        Inst::OpImm32 { op, .. } => match op {
            AluOp::Add => "addiw",
            AluOp::Sll => "slliw",
            AluOp::Srl => "srliw",
            AluOp::Sra => "sraiw",
            _ => "op-imm-32",
        },
        Inst::Op { op, .. } => alu_name(*op, false),
        Inst::Op32 { op, .. } => alu_name(*op, true),
        Inst::Fence => "fence",
        Inst::FenceI => "fence.i",
        Inst::Ecall => "ecall",
        Inst::Ebreak => "ebreak",
        Inst::Csr { op, src, .. } => match (op, src) {
            (CsrOp::Rw, CsrSrc::Reg(_)) => "csrrw",
            (CsrOp::Rs, CsrSrc::Reg(_)) => "csrrs",
            (CsrOp::Rc, CsrSrc::Reg(_)) => "csrrc",
            (CsrOp::Rw, CsrSrc::Imm(_)) => "csrrwi",
            (CsrOp::Rs, CsrSrc::Imm(_)) => "csrrsi",
            (CsrOp::Rc, CsrSrc::Imm(_)) => "csrrci",
        },
        Inst::SfenceVma { .. } => "sfence.vma",
        Inst::Lr { width, .. } => amo_name("lr", *width),
        Inst::Sc { width, .. } => amo_name("sc", *width),
        Inst::Amo { op, width, .. } => {
            let base = match op {
                AmoOp::Swap => "amoswap",
                AmoOp::Add => "amoadd",
                AmoOp::Xor => "amoxor",
                AmoOp::And => "amoand",
                AmoOp::Or => "amoor",
                AmoOp::Min => "amomin",
                AmoOp::Max => "amomax",
                AmoOp::Minu => "amominu",
                AmoOp::Maxu => "amomaxu",
            };
            amo_name(base, *width)
        }
        Inst::FpLoad { width, .. } => fp_name("fl", *width),
        Inst::FpStore { width, .. } => fp_name("fs", *width),
        Inst::FpOp { op, width, .. } => {
            let base = match op {
                FpAluOp::Add => "fadd",
                FpAluOp::Sub => "fsub",
                FpAluOp::Mul => "fmul",
                FpAluOp::Div => "fdiv",
                FpAluOp::Sqrt => "fsqrt",
                FpAluOp::SgnJ => "fsgnj",
                FpAluOp::SgnJn => "fsgnjn",
                FpAluOp::SgnJx => "fsgnjx",
                FpAluOp::Min => "fmin",
                FpAluOp::Max => "fmax",
            };
            fp_suffixed(base, *width)
        }
        Inst::FpFma { op, width, .. } => {
            let base = match op {
                FmaOp::MAdd => "fmadd",
                FmaOp::MSub => "fmsub",
                FmaOp::NmSub => "fnmsub",
                FmaOp::NmAdd => "fnmadd",
            };
            fp_suffixed(base, *width)
        }
        Inst::FpCmp { cmp, width, .. } => {
            let base = match cmp {
                FpCmpOp::Eq => "feq",
                FpCmpOp::Lt => "flt",
                FpCmpOp::Le => "fle",
            };
            fp_suffixed(base, *width)
        }
        Inst::FpClass { width, .. } => fp_suffixed("fclass", *width),
        Inst::FpCvtInt { .. } | Inst::FpCvtFp { .. } => "fcvt",
        Inst::FpMv { width, to_int, .. } => match (width, to_int) {
            (FpWidth::S, true) => "fmv.x.w",
            (FpWidth::S, false) => "fmv.w.x",
            (FpWidth::D, true) => "fmv.x.d",
            (FpWidth::D, false) => "fmv.d.x",
        },
    }
}

fn alu_name(op: AluOp, word: bool) -> &'static str {
    match (op, word) {
        (AluOp::Add, false) => "add",
        (AluOp::Sub, false) => "sub",
        (AluOp::Sll, false) => "sll",
        (AluOp::Slt, false) => "slt",
        (AluOp::Sltu, false) => "sltu",
        (AluOp::Xor, false) => "xor",
        (AluOp::Srl, false) => "srl",
        (AluOp::Sra, false) => "sra",
        (AluOp::Or, false) => "or",
        (AluOp::And, false) => "and",
        (AluOp::Mul, false) => "mul",
        (AluOp::Mulh, false) => "mulh",
        (AluOp::Mulhsu, false) => "mulhsu",
        (AluOp::Mulhu, false) => "mulhu",
        (AluOp::Div, false) => "div",
        (AluOp::Divu, false) => "divu",
        (AluOp::Rem, false) => "rem",
        (AluOp::Remu, false) => "remu",
        (AluOp::Add, true) => "addw",
        (AluOp::Sub, true) => "subw",
        (AluOp::Sll, true) => "sllw",
        (AluOp::Srl, true) => "srlw",
        (AluOp::Sra, true) => "sraw",
        (AluOp::Mul, true) => "mulw",
        (AluOp::Div, true) => "divw",
        (AluOp::Divu, true) => "divuw",
        (AluOp::Rem, true) => "remw",
        (AluOp::Remu, true) => "remuw",
        _ => "op",
    }
}

fn amo_name(base: &'static str, width: AmoWidth) -> &'static str {
    // Static names only; the handful of combinations is spelled out.
    match (base, width) {
        ("lr", AmoWidth::W) => "lr.w",
        ("lr", AmoWidth::D) => "lr.d",
        ("sc", AmoWidth::W) => "sc.w",
        ("sc", AmoWidth::D) => "sc.d",
        ("amoswap", AmoWidth::W) => "amoswap.w",
        ("amoswap", AmoWidth::D) => "amoswap.d",
        ("amoadd", AmoWidth::W) => "amoadd.w",
        ("amoadd", AmoWidth::D) => "amoadd.d",
        ("amoxor", AmoWidth::W) => "amoxor.w",
        ("amoxor", AmoWidth::D) => "amoxor.d",
        ("amoand", AmoWidth::W) => "amoand.w",
        ("amoand", AmoWidth::D) => "amoand.d",
        ("amoor", AmoWidth::W) => "amoor.w",
        ("amoor", AmoWidth::D) => "amoor.d",
        ("amomin", AmoWidth::W) => "amomin.w",
        ("amomin", AmoWidth::D) => "amomin.d",
        ("amomax", AmoWidth::W) => "amomax.w",
        ("amomax", AmoWidth::D) => "amomax.d",
        ("amominu", AmoWidth::W) => "amominu.w",
        ("amominu", AmoWidth::D) => "amominu.d",
        ("amomaxu", AmoWidth::W) => "amomaxu.w",
        ("amomaxu", AmoWidth::D) => "amomaxu.d",
        _ => "amo",
    }
}

fn fp_name(base: &'static str, width: FpWidth) -> &'static str {
    match (base, width) {
        ("fl", FpWidth::S) => "flw",
        ("fl", FpWidth::D) => "fld",
        ("fs", FpWidth::S) => "fsw",
        ("fs", FpWidth::D) => "fsd",
        _ => "fp",
    }
}

fn fp_suffixed(base: &'static str, width: FpWidth) -> &'static str {
    macro_rules! table {
        ($($name:literal),* $(,)?) => {
            match (base, width) {
                $(
                    ($name, FpWidth::S) => concat!($name, ".s"),
                    ($name, FpWidth::D) => concat!($name, ".d"),
                )*
                _ => base,
            }
        };
    }
    table!(
        "fadd", "fsub", "fmul", "fdiv", "fsqrt", "fsgnj", "fsgnjn", "fsgnjx", "fmin", "fmax",
        "fmadd", "fmsub", "fnmsub", "fnmadd", "feq", "flt", "fle", "fclass",
    )
}

fn target(pc: u64, offset: i64, opts: &DisasmOptions) -> String {
    let addr = pc.wrapping_add(offset as u64);
    match opts.resolver.and_then(|r| r(addr)) {
        Some(sym) => format!("0x{addr:x} <{sym}>"),
        None => format!("0x{addr:x}"),
    }
}

/// Render one decoded instruction as assembly text.
pub fn format_inst(d: &Decoded, opts: &DisasmOptions) -> String {
    let inst = &d.inst;

    if opts.pseudo {
        if let Some(s) = fold_pseudo(d, opts) {
            return s;
        }
    }

    match *inst {
        Inst::Lui { rd, imm } => format!("lui {}, 0x{:x}", reg_name(rd), (imm as u64 >> 12) & 0xfffff),
        Inst::Auipc { rd, imm } => {
            format!("auipc {}, 0x{:x}", reg_name(rd), (imm as u64 >> 12) & 0xfffff)
        }
        Inst::Jal { rd, offset } => {
            format!("jal {}, {}", reg_name(rd), target(d.pc, offset, opts))
        }
        Inst::Jalr { rd, rs1, offset } => {
            format!("jalr {}, {}({})", reg_name(rd), offset, reg_name(rs1))
        }
        Inst::Branch { rs1, rs2, offset, .. } => format!(
            "{} {}, {}, {}",
            mnemonic(inst),
            reg_name(rs1),
            reg_name(rs2),
            target(d.pc, offset, opts)
        ),
        Inst::Load { rd, rs1, offset, .. } => format!(
            "{} {}, {}({})",
            mnemonic(inst),
            reg_name(rd),
            offset,
            reg_name(rs1)
        ),
        Inst::Store { rs1, rs2, offset, .. } => format!(
            "{} {}, {}({})",
            mnemonic(inst),
            reg_name(rs2),
            offset,
            reg_name(rs1)
        ),
        Inst::OpImm { rd, rs1, imm, .. } | Inst::OpImm32 { rd, rs1, imm, .. } => format!(
            "{} {}, {}, {}",
            mnemonic(inst),
            reg_name(rd),
            reg_name(rs1),
            imm
        ),
        Inst::Op { rd, rs1, rs2, .. } | Inst::Op32 { rd, rs1, rs2, .. } => format!(
            "{} {}, {}, {}",
            mnemonic(inst),
            reg_name(rd),
            reg_name(rs1),
            reg_name(rs2)
        ),
        Inst::Fence => "fence".into(),
        Inst::FenceI => "fence.i".into(),
        Inst::Ecall => "ecall".into(),
        Inst::Ebreak => "ebreak".into(),
        Inst::Csr { rd, csr, src, .. } => match src {
            CsrSrc::Reg(rs1) => format!(
                "{} {}, 0x{:x}, {}",
                mnemonic(inst),
                reg_name(rd),
                csr,
                reg_name(rs1)
            ),
            CsrSrc::Imm(i) => {
                format!("{} {}, 0x{:x}, {}", mnemonic(inst), reg_name(rd), csr, i)
            }
        },
        Inst::SfenceVma { rs1, rs2 } => {
            format!("sfence.vma {}, {}", reg_name(rs1), reg_name(rs2))
        }
        Inst::Lr { rd, rs1, .. } => {
            format!("{} {}, ({})", mnemonic(inst), reg_name(rd), reg_name(rs1))
        }
        Inst::Sc { rd, rs1, rs2, .. } | Inst::Amo { rd, rs1, rs2, .. } => format!(
            "{} {}, {}, ({})",
            mnemonic(inst),
            reg_name(rd),
            reg_name(rs2),
            reg_name(rs1)
        ),
        Inst::FpLoad { rd, rs1, offset, .. } => format!(
            "{} {}, {}({})",
            mnemonic(inst),
            freg_name(rd),
            offset,
            reg_name(rs1)
        ),
        Inst::FpStore { rs1, rs2, offset, .. } => format!(
            "{} {}, {}({})",
            mnemonic(inst),
            freg_name(rs2),
            offset,
            reg_name(rs1)
        ),
        Inst::FpOp { op: FpAluOp::Sqrt, rd, rs1, .. } => {
            format!("{} {}, {}", mnemonic(inst), freg_name(rd), freg_name(rs1))
        }
        Inst::FpOp { rd, rs1, rs2, .. } => format!(
            "{} {}, {}, {}",
            mnemonic(inst),
            freg_name(rd),
            freg_name(rs1),
            freg_name(rs2)
        ),
        Inst::FpFma { rd, rs1, rs2, rs3, .. } => format!(
            "{} {}, {}, {}, {}",
            mnemonic(inst),
            freg_name(rd),
            freg_name(rs1),
            freg_name(rs2),
            freg_name(rs3)
        ),
        Inst::FpCmp { rd, rs1, rs2, .. } => format!(
            "{} {}, {}, {}",
            mnemonic(inst),
            reg_name(rd),
            freg_name(rs1),
            freg_name(rs2)
        ),
        Inst::FpClass { rd, rs1, .. } => {
            format!("{} {}, {}", mnemonic(inst), reg_name(rd), freg_name(rs1))
        }
        Inst::FpCvtInt { width, int, to_int, rd, rs1, .. } => {
            let f = match width {
                FpWidth::S => "s",
                FpWidth::D => "d",
            };
            let i = match int {
                IntWidth::W => "w",
                IntWidth::Wu => "wu",
                IntWidth::L => "l",
                IntWidth::Lu => "lu",
            };
            if to_int {
                format!("fcvt.{i}.{f} {}, {}", reg_name(rd), freg_name(rs1))
            } else {
                format!("fcvt.{f}.{i} {}, {}", freg_name(rd), reg_name(rs1))
            }
        }
        Inst::FpCvtFp { from, to, rd, rs1, .. } => {
            let name = match (from, to) {
                (FpWidth::D, FpWidth::S) => "fcvt.s.d",
                _ => "fcvt.d.s",
            };
            format!("{name} {}, {}", freg_name(rd), freg_name(rs1))
        }
        Inst::FpMv { width, to_int, rd, rs1 } => match (width, to_int) {
            (_, true) => format!("{} {}, {}", mnemonic(inst), reg_name(rd), freg_name(rs1)),
            (_, false) => format!("{} {}, {}", mnemonic(inst), freg_name(rd), reg_name(rs1)),
        },
    }
}

fn fold_pseudo(d: &Decoded, opts: &DisasmOptions) -> Option<String> {
    Some(match d.inst {
        Inst::OpImm { op: AluOp::Add, rd: 0, rs1: 0, imm: 0 } => "nop".into(),
        Inst::OpImm { op: AluOp::Add, rd, rs1: 0, imm } => {
            format!("li {}, {}", reg_name(rd), imm)
        }
        Inst::OpImm { op: AluOp::Add, rd, rs1, imm: 0 } => {
            format!("mv {}, {}", reg_name(rd), reg_name(rs1))
        }
        Inst::OpImm { op: AluOp::Xor, rd, rs1, imm: -1 } => {
            format!("not {}, {}", reg_name(rd), reg_name(rs1))
        }
        Inst::OpImm { op: AluOp::Sltu, rd, rs1, imm: 1 } => {
            format!("seqz {}, {}", reg_name(rd), reg_name(rs1))
        }
        Inst::Op { op: AluOp::Sub, rd, rs1: 0, rs2 } => {
            format!("neg {}, {}", reg_name(rd), reg_name(rs2))
        }
        Inst::Op { op: AluOp::Sltu, rd, rs1: 0, rs2 } => {
            format!("snez {}, {}", reg_name(rd), reg_name(rs2))
        }
        Inst::Jal { rd: 0, offset } => format!("j {}", target(d.pc, offset, opts)),
        Inst::Jal { rd: 1, offset } => format!("jal {}", target(d.pc, offset, opts)),
        Inst::Jalr { rd: 0, rs1: 1, offset: 0 } => "ret".into(),
        Inst::Jalr { rd: 0, rs1, offset: 0 } => format!("jr {}", reg_name(rs1)),
        Inst::Jalr { rd: 1, rs1, offset: 0 } => format!("jalr {}", reg_name(rs1)),
        Inst::Branch { cond: BranchCond::Eq, rs1, rs2: 0, offset } => {
            format!("beqz {}, {}", reg_name(rs1), target(d.pc, offset, opts))
        }
        Inst::Branch { cond: BranchCond::Ne, rs1, rs2: 0, offset } => {
            format!("bnez {}, {}", reg_name(rs1), target(d.pc, offset, opts))
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::decode::decode;
    use crate::state::{IsaExt, Xlen};

    fn dis(raw: u32, pc: u64, pseudo: bool) -> String {
        let inst = decode(raw, Xlen::Rv64, IsaExt::IMAFDC).unwrap();
        let d = Decoded { pc, raw, len: 4, inst };
        format_inst(&d, &DisasmOptions { pseudo, resolver: None })
    }

    #[test]
    fn renders_plain_forms() {
        assert_eq!(dis(0x02a0_0513, 0, false), "addi a0, zero, 42");
        assert_eq!(dis(0x00b1_2423, 0, false), "sw a1, 8(sp)");
    }

    #[test]
    fn folds_pseudo_instructions() {
        assert_eq!(dis(0x02a0_0513, 0, true), "li a0, 42");
        // jalr zero, 0(ra)
        assert_eq!(dis(0x0000_8067, 0, true), "ret");
        // beq a0, zero, +16
        assert_eq!(dis(0x0105_0863, 0x100, true), "beqz a0, 0x110");
    }

    #[test]
    fn symbolicates_targets() {
        let resolver = |addr: u64| (addr == 0x110).then(|| "main+0x10".to_string());
        let inst = decode(0x0105_0863, Xlen::Rv64, IsaExt::IMAFDC).unwrap();
        let d = Decoded { pc: 0x100, raw: 0x0105_0863, len: 4, inst };
        let opts = DisasmOptions { pseudo: true, resolver: Some(&resolver) };
        assert_eq!(format_inst(&d, &opts), "beqz a0, 0x110 <main+0x10>");
    }
}
