//! Fetch-decode-execute core.
//!
//! [`step`] runs exactly one instruction against a [`CpuBus`]. A trap leaves
//! `pc` and the architectural registers untouched: every fallible access is
//! ordered before the first write-back, so the run loop can service the trap
//! and resume (or report) with consistent state.

pub mod alu;
pub mod decode;

use crate::bus::CpuBus;
use crate::csr;
use crate::fpu;
use crate::state::{CpuState, IsaExt, Xlen};
use crate::trap::Trap;

use decode::{
    AmoOp, AmoWidth, BranchCond, CsrOp, CsrSrc, FmaOp, FpAluOp, FpCmpOp, FpWidth, Inst, LoadWidth,
    StoreWidth,
};
use memory::PrivilegeMode;

/// One decoded instruction, with enough context to trace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub pc: u64,
    pub raw: u32,
    /// pc increment: 2 for a compressed encoding, 4 otherwise.
    pub len: u8,
    pub inst: Inst,
}

/// Fetch and decode the instruction at the current pc without executing it.
pub fn fetch_decode<B: CpuBus>(cpu: &CpuState, bus: &mut B) -> Result<Decoded, Trap> {
    let pc = cpu.pc();
    if !cpu.ext.contains(IsaExt::C) && pc & 0x3 != 0 {
        return Err(Trap::MisalignedFetch { vaddr: pc });
    }
    let (raw, len) = bus.fetch(pc)?;
    let inst = if len == 2 {
        if !cpu.ext.contains(IsaExt::C) {
            return Err(Trap::IllegalInstruction { raw });
        }
        decode::decode_compressed(raw as u16, cpu.xlen, cpu.ext)
            .ok_or(Trap::IllegalInstruction { raw })?
    } else {
        decode::decode(raw, cpu.xlen, cpu.ext).ok_or(Trap::IllegalInstruction { raw })?
    };
    Ok(Decoded { pc, raw, len, inst })
}

/// Run one full cycle: sync the bus, fetch, decode, execute.
pub fn step<B: CpuBus>(cpu: &mut CpuState, bus: &mut B) -> Result<Decoded, Trap> {
    bus.sync(cpu);
    let d = fetch_decode(cpu, bus)?;
    execute(cpu, bus, &d)?;
    Ok(d)
}

/// Jump/branch targets must stay aligned to the fetch granule.
#[inline]
fn check_target(cpu: &CpuState, target: u64) -> Result<u64, Trap> {
    let align = if cpu.ext.contains(IsaExt::C) { 1 } else { 3 };
    if target & align != 0 {
        return Err(Trap::MisalignedFetch { vaddr: target });
    }
    Ok(target)
}

/// Execute a decoded instruction, advancing `pc` on success.
pub fn execute<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, d: &Decoded) -> Result<(), Trap> {
    let mut next_pc = d.pc.wrapping_add(d.len as u64);

    match d.inst {
        Inst::Lui { rd, imm } => cpu.set_x(rd, imm as u64),
        Inst::Auipc { rd, imm } => cpu.set_x(rd, d.pc.wrapping_add(imm as u64)),
        Inst::Jal { rd, offset } => {
            let target = check_target(cpu, cpu.mask_addr(d.pc.wrapping_add(offset as u64)))?;
            cpu.set_x(rd, next_pc);
            next_pc = target;
        }
        Inst::Jalr { rd, rs1, offset } => {
            let base = cpu.x(rs1);
            let target =
                check_target(cpu, cpu.mask_addr(base.wrapping_add(offset as u64)) & !1)?;
            cpu.set_x(rd, next_pc);
            next_pc = target;
        }
        Inst::Branch { cond, rs1, rs2, offset } => {
            let a = cpu.x(rs1);
            let b = cpu.x(rs2);
            let taken = match cond {
                BranchCond::Eq => a == b,
                BranchCond::Ne => a != b,
                BranchCond::Lt => (a as i64) < (b as i64),
                BranchCond::Ge => (a as i64) >= (b as i64),
                BranchCond::Ltu => match cpu.xlen {
                    Xlen::Rv32 => (a as u32) < (b as u32),
                    Xlen::Rv64 => a < b,
                },
                BranchCond::Geu => match cpu.xlen {
                    Xlen::Rv32 => (a as u32) >= (b as u32),
                    Xlen::Rv64 => a >= b,
                },
            };
            if taken {
                next_pc = check_target(cpu, cpu.mask_addr(d.pc.wrapping_add(offset as u64)))?;
            }
        }
        Inst::Load { width, rd, rs1, offset } => {
            let addr = cpu.mask_addr(cpu.x(rs1).wrapping_add(offset as u64));
            let value = match width {
                LoadWidth::B => bus.read_u8(addr)? as i8 as i64 as u64,
                LoadWidth::Bu => bus.read_u8(addr)? as u64,
                LoadWidth::H => bus.read_u16(addr)? as i16 as i64 as u64,
                LoadWidth::Hu => bus.read_u16(addr)? as u64,
                LoadWidth::W => bus.read_u32(addr)? as i32 as i64 as u64,
                LoadWidth::Wu => bus.read_u32(addr)? as u64,
                LoadWidth::D => bus.read_u64(addr)?,
            };
            cpu.set_x(rd, value);
        }
        Inst::Store { width, rs1, rs2, offset } => {
            let addr = cpu.mask_addr(cpu.x(rs1).wrapping_add(offset as u64));
            let value = cpu.x(rs2);
            match width {
                StoreWidth::B => bus.write_u8(addr, value as u8)?,
                StoreWidth::H => bus.write_u16(addr, value as u16)?,
                StoreWidth::W => bus.write_u32(addr, value as u32)?,
                StoreWidth::D => bus.write_u64(addr, value)?,
            }
        }
        Inst::OpImm { op, rd, rs1, imm } => {
            cpu.set_x(rd, alu::alu(op, cpu.xlen, cpu.x(rs1), imm as u64));
        }
        Inst::OpImm32 { op, rd, rs1, imm } => {
            cpu.set_x(rd, alu::alu32(op, cpu.x(rs1), imm as u64));
        }
        Inst::Op { op, rd, rs1, rs2 } => {
            cpu.set_x(rd, alu::alu(op, cpu.xlen, cpu.x(rs1), cpu.x(rs2)));
        }
        Inst::Op32 { op, rd, rs1, rs2 } => {
            cpu.set_x(rd, alu::alu32(op, cpu.x(rs1), cpu.x(rs2)));
        }
        Inst::Fence | Inst::FenceI => {
            // Single-hart, strictly in-order interpretation: nothing to order.
        }
        Inst::Ecall => {
            return Err(match cpu.mode {
                PrivilegeMode::User => Trap::EcallFromU,
                PrivilegeMode::Supervisor => Trap::EcallFromS,
                PrivilegeMode::Machine => Trap::EcallFromM,
            });
        }
        Inst::Ebreak => return Err(Trap::Breakpoint),
        Inst::Csr { op, rd, csr: spec, src } => {
            let old = csr::read(cpu, spec).ok_or(Trap::IllegalInstruction { raw: d.raw })?;
            let operand = match src {
                CsrSrc::Reg(r) => cpu.x(r),
                CsrSrc::Imm(i) => i as u64,
            };
            let write_back = match op {
                CsrOp::Rw => Some(operand),
                CsrOp::Rs => {
                    let skip = matches!(src, CsrSrc::Reg(0)) || matches!(src, CsrSrc::Imm(0));
                    (!skip).then_some(old | operand)
                }
                CsrOp::Rc => {
                    let skip = matches!(src, CsrSrc::Reg(0)) || matches!(src, CsrSrc::Imm(0));
                    (!skip).then_some(old & !operand)
                }
            };
            if let Some(value) = write_back {
                csr::write(cpu, spec, value).ok_or(Trap::IllegalInstruction { raw: d.raw })?;
            }
            cpu.set_x(rd, old);
        }
        Inst::SfenceVma { rs1, .. } => {
            let vaddr = (rs1 != 0).then(|| cpu.x(rs1));
            bus.sfence_vma(vaddr);
        }
        Inst::Lr { width, rd, rs1 } => {
            let addr = cpu.mask_addr(cpu.x(rs1));
            let value = match width {
                AmoWidth::W => bus.read_u32(addr)? as i32 as i64 as u64,
                AmoWidth::D => bus.read_u64(addr)?,
            };
            cpu.reservation = Some(addr);
            cpu.set_x(rd, value);
        }
        Inst::Sc { width, rd, rs1, rs2 } => {
            let addr = cpu.mask_addr(cpu.x(rs1));
            let valid = cpu.reservation == Some(addr);
            cpu.reservation = None;
            if valid {
                let value = cpu.x(rs2);
                match width {
                    AmoWidth::W => bus.write_u32(addr, value as u32)?,
                    AmoWidth::D => bus.write_u64(addr, value)?,
                }
                cpu.set_x(rd, 0);
            } else {
                cpu.set_x(rd, 1);
            }
        }
        Inst::Amo { op, width, rd, rs1, rs2 } => {
            let addr = cpu.mask_addr(cpu.x(rs1));
            let rhs = cpu.x(rs2);
            let old = match width {
                AmoWidth::W => bus.read_u32(addr)? as i32 as i64 as u64,
                AmoWidth::D => bus.read_u64(addr)?,
            };
            let new = amo_op(op, width, old, rhs);
            match width {
                AmoWidth::W => bus.write_u32(addr, new as u32)?,
                AmoWidth::D => bus.write_u64(addr, new)?,
            }
            cpu.set_x(rd, old);
        }
        Inst::FpLoad { width, rd, rs1, offset } => {
            let addr = cpu.mask_addr(cpu.x(rs1).wrapping_add(offset as u64));
            let bits = match width {
                FpWidth::S => fpu::box_f32_bits(bus.read_u32(addr)?),
                FpWidth::D => bus.read_u64(addr)?,
            };
            cpu.set_f_bits(rd, bits);
        }
        Inst::FpStore { width, rs1, rs2, offset } => {
            let addr = cpu.mask_addr(cpu.x(rs1).wrapping_add(offset as u64));
            let bits = cpu.f_bits(rs2);
            match width {
                FpWidth::S => bus.write_u32(addr, bits as u32)?,
                FpWidth::D => bus.write_u64(addr, bits)?,
            }
        }
        Inst::FpOp { op, width, rd, rs1, rs2, rm } => {
            exec_fp_op(cpu, d.raw, op, width, rd, rs1, rs2, rm)?;
        }
        Inst::FpFma { op, width, rd, rs1, rs2, rs3, rm } => {
            fpu::resolve_rounding(rm, cpu.frm())
                .ok_or(Trap::IllegalInstruction { raw: d.raw })?;
            match width {
                FpWidth::S => {
                    let a = fpu::unbox_f32(cpu.f_bits(rs1));
                    let b = fpu::unbox_f32(cpu.f_bits(rs2));
                    let c = fpu::unbox_f32(cpu.f_bits(rs3));
                    let (a, b, c) = fma_operands(op, a, b, c);
                    let (r, flags) = fpu::f32_ops::fma(a, b, c);
                    cpu.accrue_fflags(flags);
                    cpu.set_f_bits(rd, fpu::box_f32(r));
                }
                FpWidth::D => {
                    let a = f64::from_bits(cpu.f_bits(rs1));
                    let b = f64::from_bits(cpu.f_bits(rs2));
                    let c = f64::from_bits(cpu.f_bits(rs3));
                    let (a, b, c) = fma_operands(op, a, b, c);
                    let (r, flags) = fpu::f64_ops::fma(a, b, c);
                    cpu.accrue_fflags(flags);
                    cpu.set_f_bits(rd, r.to_bits());
                }
            }
        }
        Inst::FpCmp { cmp, width, rd, rs1, rs2 } => {
            let (result, flags) = match width {
                FpWidth::S => {
                    let a = fpu::unbox_f32(cpu.f_bits(rs1));
                    let b = fpu::unbox_f32(cpu.f_bits(rs2));
                    match cmp {
                        FpCmpOp::Eq => fpu::f32_ops::feq(a, b),
                        FpCmpOp::Lt => fpu::f32_ops::flt(a, b),
                        FpCmpOp::Le => fpu::f32_ops::fle(a, b),
                    }
                }
                FpWidth::D => {
                    let a = f64::from_bits(cpu.f_bits(rs1));
                    let b = f64::from_bits(cpu.f_bits(rs2));
                    match cmp {
                        FpCmpOp::Eq => fpu::f64_ops::feq(a, b),
                        FpCmpOp::Lt => fpu::f64_ops::flt(a, b),
                        FpCmpOp::Le => fpu::f64_ops::fle(a, b),
                    }
                }
            };
            cpu.accrue_fflags(flags);
            cpu.set_x(rd, result as u64);
        }
        Inst::FpClass { width, rd, rs1 } => {
            let bits = match width {
                FpWidth::S => fpu::f32_ops::class(fpu::unbox_f32(cpu.f_bits(rs1))),
                FpWidth::D => fpu::f64_ops::class(f64::from_bits(cpu.f_bits(rs1))),
            };
            cpu.set_x(rd, bits);
        }
        Inst::FpCvtInt { width, int, to_int, rd, rs1, rm } => {
            let rounding = fpu::resolve_rounding(rm, cpu.frm())
                .ok_or(Trap::IllegalInstruction { raw: d.raw })?;
            if to_int {
                let v = match width {
                    FpWidth::S => fpu::unbox_f32(cpu.f_bits(rs1)) as f64,
                    FpWidth::D => f64::from_bits(cpu.f_bits(rs1)),
                };
                let (result, flags) = fpu::cvt_to_int(v, int, rounding);
                cpu.accrue_fflags(flags);
                cpu.set_x(rd, result);
            } else {
                let bits = cpu.x(rs1);
                match width {
                    FpWidth::S => {
                        cpu.set_f_bits(rd, fpu::box_f32(fpu::cvt_int_to_f32(bits, int)))
                    }
                    FpWidth::D => {
                        cpu.set_f_bits(rd, fpu::cvt_int_to_f64(bits, int).to_bits())
                    }
                }
            }
        }
        Inst::FpCvtFp { from, to, rd, rs1, rm } => {
            fpu::resolve_rounding(rm, cpu.frm())
                .ok_or(Trap::IllegalInstruction { raw: d.raw })?;
            match (from, to) {
                (FpWidth::S, FpWidth::D) => {
                    let v = fpu::unbox_f32(cpu.f_bits(rs1));
                    if v.is_nan() {
                        cpu.set_f_bits(rd, fpu::F64_CANONICAL_NAN);
                    } else {
                        cpu.set_f_bits(rd, (v as f64).to_bits());
                    }
                }
                (FpWidth::D, FpWidth::S) => {
                    let v = f64::from_bits(cpu.f_bits(rs1));
                    let narrowed = v as f32;
                    if !v.is_nan() && narrowed as f64 != v {
                        cpu.accrue_fflags(fpu::NX);
                    }
                    cpu.set_f_bits(rd, fpu::box_f32(narrowed));
                }
                _ => return Err(Trap::IllegalInstruction { raw: d.raw }),
            }
        }
        Inst::FpMv { width, to_int, rd, rs1 } => match (width, to_int) {
            (FpWidth::S, true) => cpu.set_x(rd, cpu.f_bits(rs1) as u32 as i32 as i64 as u64),
            (FpWidth::S, false) => cpu.set_f_bits(rd, fpu::box_f32_bits(cpu.x(rs1) as u32)),
            (FpWidth::D, true) => cpu.set_x(rd, cpu.f_bits(rs1)),
            (FpWidth::D, false) => cpu.set_f_bits(rd, cpu.x(rs1)),
        },
    }

    cpu.set_pc(next_pc);
    cpu.cycle = cpu.cycle.wrapping_add(1);
    cpu.instret = cpu.instret.wrapping_add(1);
    Ok(())
}

fn amo_op(op: AmoOp, width: AmoWidth, old: u64, rhs: u64) -> u64 {
    match width {
        AmoWidth::W => {
            let a = old as u32;
            let b = rhs as u32;
            let r = match op {
                AmoOp::Swap => b,
                AmoOp::Add => a.wrapping_add(b),
                AmoOp::Xor => a ^ b,
                AmoOp::And => a & b,
                AmoOp::Or => a | b,
                AmoOp::Min => (a as i32).min(b as i32) as u32,
                AmoOp::Max => (a as i32).max(b as i32) as u32,
                AmoOp::Minu => a.min(b),
                AmoOp::Maxu => a.max(b),
            };
            r as u64
        }
        AmoWidth::D => match op {
            AmoOp::Swap => rhs,
            AmoOp::Add => old.wrapping_add(rhs),
            AmoOp::Xor => old ^ rhs,
            AmoOp::And => old & rhs,
            AmoOp::Or => old | rhs,
            AmoOp::Min => ((old as i64).min(rhs as i64)) as u64,
            AmoOp::Max => ((old as i64).max(rhs as i64)) as u64,
            AmoOp::Minu => old.min(rhs),
            AmoOp::Maxu => old.max(rhs),
        },
    }
}

/// Rearrange FMA operands for the four encodings: all compute ±(rs1 × rs2) ± rs3.
fn fma_operands<T: core::ops::Neg<Output = T>>(op: FmaOp, a: T, b: T, c: T) -> (T, T, T) {
    match op {
        FmaOp::MAdd => (a, b, c),
        FmaOp::MSub => (a, b, -c),
        FmaOp::NmSub => (-a, b, c),
        FmaOp::NmAdd => (-a, b, -c),
    }
}

#[allow(clippy::too_many_arguments)]
fn exec_fp_op(
    cpu: &mut CpuState,
    raw: u32,
    op: FpAluOp,
    width: FpWidth,
    rd: u8,
    rs1: u8,
    rs2: u8,
    rm: u8,
) -> Result<(), Trap> {
    // Sign-injection and min/max ignore the rounding mode field; everything
    // else must carry a resolvable one.
    let needs_rm = matches!(
        op,
        FpAluOp::Add | FpAluOp::Sub | FpAluOp::Mul | FpAluOp::Div | FpAluOp::Sqrt
    );
    if needs_rm {
        fpu::resolve_rounding(rm, cpu.frm()).ok_or(Trap::IllegalInstruction { raw })?;
    }

    match width {
        FpWidth::S => {
            let a_bits = cpu.f_bits(rs1);
            let b_bits = cpu.f_bits(rs2);
            match op {
                FpAluOp::SgnJ | FpAluOp::SgnJn | FpAluOp::SgnJx => {
                    let a = fpu::unbox_f32(a_bits).to_bits();
                    let b = fpu::unbox_f32(b_bits).to_bits();
                    let r = fpu::sign_inject_f32(
                        a,
                        b,
                        op == FpAluOp::SgnJn,
                        op == FpAluOp::SgnJx,
                    );
                    cpu.set_f_bits(rd, fpu::box_f32_bits(r));
                }
                _ => {
                    let a = fpu::unbox_f32(a_bits);
                    let b = fpu::unbox_f32(b_bits);
                    let (r, flags) = match op {
                        FpAluOp::Add => fpu::f32_ops::add(a, b),
                        FpAluOp::Sub => fpu::f32_ops::sub(a, b),
                        FpAluOp::Mul => fpu::f32_ops::mul(a, b),
                        FpAluOp::Div => fpu::f32_ops::div(a, b),
                        FpAluOp::Sqrt => fpu::f32_ops::sqrt(a),
                        FpAluOp::Min => fpu::f32_ops::min(a, b),
                        FpAluOp::Max => fpu::f32_ops::max(a, b),
                        _ => unreachable!(),
                    };
                    cpu.accrue_fflags(flags);
                    cpu.set_f_bits(rd, fpu::box_f32(r));
                }
            }
        }
        FpWidth::D => {
            let a_bits = cpu.f_bits(rs1);
            let b_bits = cpu.f_bits(rs2);
            match op {
                FpAluOp::SgnJ | FpAluOp::SgnJn | FpAluOp::SgnJx => {
                    let r = fpu::sign_inject_f64(
                        a_bits,
                        b_bits,
                        op == FpAluOp::SgnJn,
                        op == FpAluOp::SgnJx,
                    );
                    cpu.set_f_bits(rd, r);
                }
                _ => {
                    let a = f64::from_bits(a_bits);
                    let b = f64::from_bits(b_bits);
                    let (r, flags) = match op {
                        FpAluOp::Add => fpu::f64_ops::add(a, b),
                        FpAluOp::Sub => fpu::f64_ops::sub(a, b),
                        FpAluOp::Mul => fpu::f64_ops::mul(a, b),
                        FpAluOp::Div => fpu::f64_ops::div(a, b),
                        FpAluOp::Sqrt => fpu::f64_ops::sqrt(a),
                        FpAluOp::Min => fpu::f64_ops::min(a, b),
                        FpAluOp::Max => fpu::f64_ops::max(a, b),
                        _ => unreachable!(),
                    };
                    cpu.accrue_fflags(flags);
                    cpu.set_f_bits(rd, r.to_bits());
                }
            }
        }
    }
    Ok(())
}
