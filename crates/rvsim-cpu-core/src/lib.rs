#![forbid(unsafe_code)]

//! Architectural RISC-V CPU state and the decoded-instruction interpreter.
//!
//! The crate API is centered around [`state::CpuState`] plus the [`CpuBus`]
//! trait: the interpreter ([`interp::step`]) drives a bus implementation for
//! every fetch, load and store, and reports traps as typed [`Trap`] values
//! that the embedding run loop services. No trap handling happens here.

pub mod bus;
pub mod csr;
pub mod disasm;
pub mod fpu;
pub mod interp;
pub mod state;
pub mod trap;

pub use bus::{CpuBus, FlatBus};
pub use interp::{execute, fetch_decode, step, Decoded};
pub use state::{CpuState, IsaExt, Xlen};
pub use trap::Trap;
