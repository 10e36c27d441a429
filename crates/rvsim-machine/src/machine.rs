//! The proxy machine: owns the processor state, drives the interpreter and
//! services traps until the guest exits.

use std::io::{self, Write};
use std::path::PathBuf;

use memory::{Mmu, SegmentMemory};
use rvsim_cpu_core::disasm::{self, DisasmOptions};
use rvsim_cpu_core::interp::Decoded;
use rvsim_cpu_core::{execute, fetch_decode, CpuBus, CpuState, IsaExt, Trap};

use crate::bus::MmuBus;
use crate::hist::Histograms;
use crate::loader::{self, LoadError, Symbol};
use crate::seed;
use crate::stack;
use crate::sys::{SysOutcome, SyscallProxy};

/// Log bitmask controlling the optional tracing outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogMask(u32);

impl LogMask {
    pub const NONE: LogMask = LogMask(0);
    /// Per-instruction disassembly.
    pub const INST: LogMask = LogMask(1 << 0);
    /// Include source-operand values in the instruction trace.
    pub const OPERANDS: LogMask = LogMask(1 << 1);
    /// Trap entry/exit.
    pub const TRAP: LogMask = LogMask(1 << 2);
    /// Memory segment creation/destruction (routed through `tracing`).
    pub const MEMORY: LogMask = LogMask(1 << 3);
    /// Integer register dump after every step.
    pub const INT_REG: LogMask = LogMask(1 << 4);
    /// Dump registers and statistics on exit.
    pub const EXIT_STATS: LogMask = LogMask(1 << 5);
    /// Save registers and statistics into `stats_dir` on exit.
    pub const SAVE_STATS: LogMask = LogMask(1 << 6);
    pub const HIST_PC: LogMask = LogMask(1 << 7);
    pub const HIST_REG: LogMask = LogMask(1 << 8);
    pub const HIST_INST: LogMask = LogMask(1 << 9);
    /// Enter the debugger CLI on ebreak.
    pub const EBREAK_CLI: LogMask = LogMask(1 << 10);
    /// Disable pseudo-instruction folding in the trace.
    pub const NO_PSEUDO: LogMask = LogMask(1 << 11);

    #[inline]
    pub const fn contains(self, other: LogMask) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: LogMask) -> LogMask {
        LogMask(self.0 | other.0)
    }

    #[inline]
    pub fn insert(&mut self, other: LogMask) {
        self.0 |= other.0;
    }
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub ext: IsaExt,
    pub log: LogMask,
    /// Seed for the initial-register RNG; `None` derives one from time and
    /// host entropy.
    pub seed: Option<u64>,
    pub stats_dir: Option<PathBuf>,
    pub symbolicate: bool,
    /// Environment variable names forwarded to the guest.
    pub env_allow: Vec<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ext: IsaExt::IMAFDC,
            log: LogMask::NONE,
            seed: None,
            stats_dir: None,
            symbolicate: false,
            env_allow: vec!["TERM".to_string()],
        }
    }
}

/// Terminal condition of [`Machine::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The guest called exit/exit_group.
    Exited { code: i32 },
    /// An unserviceable trap; `badaddr` is meaningful for memory faults.
    Fault { trap: Trap, pc: u64, badaddr: u64 },
    /// The debugger CLI quit the session.
    DebuggerQuit,
}

pub(crate) enum StepFlow {
    Continue,
    Exit(RunExit),
    Breakpoint(Decoded),
}

pub struct Machine {
    pub(crate) cpu: CpuState,
    pub(crate) bus: MmuBus,
    pub(crate) proxy: SyscallProxy,
    pub(crate) hist: Histograms,
    pub(crate) config: MachineConfig,
    pub(crate) symbols: Vec<Symbol>,
}

impl Machine {
    /// Build a machine from a static RISC-V ELF image: map its segments,
    /// construct the guest stack and seed the registers.
    pub fn new(
        elf_bytes: &[u8],
        args: &[String],
        host_env: &[(String, String)],
        config: MachineConfig,
    ) -> Result<Self, LoadError> {
        let mut mem = SegmentMemory::new();
        let image = loader::load_elf(&mut mem, elf_bytes, config.symbolicate)?;

        let mut cpu = CpuState::new(image.xlen, config.ext);
        cpu.set_pc(image.entry);

        let at_random = seed::seed_registers(&mut cpu, config.seed);
        let env = stack::filter_env(host_env.iter().cloned(), &config.env_allow);
        stack::build_stack(&mut mem, &mut cpu, &image, args, &env, at_random)
            .map_err(|source| LoadError::Map { vaddr: stack::memory_top(image.xlen), source })?;

        let proxy = SyscallProxy::new(image.brk_base);
        Ok(Self {
            cpu,
            bus: MmuBus::new(Mmu::new(mem)),
            proxy,
            hist: Histograms::new(),
            config,
            symbols: image.symbols,
        })
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn mmu(&self) -> &Mmu {
        self.bus.mmu()
    }

    /// Collect guest stdout/stderr instead of forwarding to the host.
    pub fn capture_output(&mut self) {
        self.proxy.capture_output();
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        self.proxy.take_output()
    }

    /// Drive the guest until a terminal condition.
    pub fn run(&mut self) -> RunExit {
        loop {
            match self.step_instruction() {
                StepFlow::Continue => {}
                StepFlow::Exit(exit) => return exit,
                StepFlow::Breakpoint(d) => {
                    if self.config.log.contains(LogMask::EBREAK_CLI) {
                        // Resume after the ebreak before prompting.
                        self.cpu.set_pc(d.pc.wrapping_add(d.len as u64));
                        match self.debugger() {
                            crate::debug::DebugAction::Continue => {}
                            crate::debug::DebugAction::Exit(exit) => return exit,
                            crate::debug::DebugAction::Quit => return RunExit::DebuggerQuit,
                        }
                    } else {
                        return self.fatal(Trap::Breakpoint);
                    }
                }
            }
        }
    }

    /// One fetch-decode-execute cycle, with traps serviced.
    pub(crate) fn step_instruction(&mut self) -> StepFlow {
        self.bus.sync(&self.cpu);
        let d = match fetch_decode(&self.cpu, &mut self.bus) {
            Ok(d) => d,
            Err(trap) => return StepFlow::Exit(self.fatal(trap)),
        };

        if self.config.log.contains(LogMask::INST) {
            self.trace_inst(&d);
        }

        match execute(&mut self.cpu, &mut self.bus, &d) {
            Ok(()) => {}
            Err(trap @ (Trap::EcallFromU | Trap::EcallFromS | Trap::EcallFromM)) => {
                if self.config.log.contains(LogMask::TRAP) {
                    eprintln!("rvsim: {trap} at pc 0x{:x}", d.pc);
                }
                match self.proxy.handle(&mut self.cpu, &mut self.bus) {
                    SysOutcome::Continue => {
                        self.cpu.set_pc(d.pc.wrapping_add(d.len as u64));
                        self.cpu.cycle = self.cpu.cycle.wrapping_add(1);
                        self.cpu.instret = self.cpu.instret.wrapping_add(1);
                    }
                    SysOutcome::Exit(code) => return StepFlow::Exit(self.finish(code)),
                }
            }
            Err(Trap::Breakpoint) => return StepFlow::Breakpoint(d),
            Err(trap) => return StepFlow::Exit(self.fatal(trap)),
        }

        self.observe(&d);
        StepFlow::Continue
    }

    fn observe(&mut self, d: &Decoded) {
        let log = self.config.log;
        if log.contains(LogMask::HIST_PC) {
            self.hist.record_pc(d.pc);
        }
        if log.contains(LogMask::HIST_REG) {
            self.hist.record_regs(d);
        }
        if log.contains(LogMask::HIST_INST) {
            self.hist.record_inst(d);
        }
        if log.contains(LogMask::INT_REG) {
            let _ = self.dump_registers(&mut io::stderr().lock());
        }
    }

    fn trace_inst(&self, d: &Decoded) {
        let resolver = |addr: u64| loader::resolve_symbol(&self.symbols, addr);
        let opts = DisasmOptions {
            pseudo: !self.config.log.contains(LogMask::NO_PSEUDO),
            resolver: self
                .config
                .symbolicate
                .then_some(&resolver as &dyn Fn(u64) -> Option<String>),
        };
        let mut line = format!(
            "{:#018x} ({:#010x}) {}",
            d.pc,
            d.raw,
            disasm::format_inst(d, &opts)
        );
        if self.config.log.contains(LogMask::OPERANDS) {
            let mut first = true;
            for r in d.inst.regs_read().into_iter().flatten() {
                if r == 0 {
                    continue;
                }
                line.push_str(if first { " ; " } else { ", " });
                line.push_str(&format!("{}=0x{:x}", disasm::reg_name(r), self.cpu.x(r)));
                first = false;
            }
        }
        eprintln!("{line}");
    }

    pub fn dump_registers(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "pc  0x{:016x}", self.cpu.pc())?;
        for row in 0..8 {
            let mut line = String::new();
            for col in 0..4 {
                let r = (row * 4 + col) as u8;
                line.push_str(&format!(
                    "{:<4} 0x{:016x}  ",
                    disasm::reg_name(r),
                    self.cpu.x(r)
                ));
            }
            writeln!(w, "{}", line.trim_end())?;
        }
        Ok(())
    }

    fn emit_exit_stats(&mut self) {
        if self.config.log.contains(LogMask::EXIT_STATS) {
            let stderr = io::stderr();
            let mut w = stderr.lock();
            let _ = self.dump_registers(&mut w);
            let s = self.bus.mmu().stats();
            let _ = writeln!(
                w,
                "mmu: itlb {}/{} dtlb {}/{} walks {}",
                s.itlb_hits,
                s.itlb_hits + s.itlb_misses,
                s.dtlb_hits,
                s.dtlb_hits + s.dtlb_misses,
                s.page_walks
            );
            let _ = writeln!(w, "instret {}", self.cpu.instret);
            let _ = self.hist.dump(&mut w);
        }
        if self.config.log.contains(LogMask::SAVE_STATS) {
            if let Some(dir) = self.config.stats_dir.clone() {
                if let Err(err) = self.hist.save(&dir) {
                    tracing::warn!(%err, "failed to save exit stats");
                }
            }
        }
    }

    fn finish(&mut self, code: i32) -> RunExit {
        self.emit_exit_stats();
        RunExit::Exited { code }
    }

    pub(crate) fn fatal(&mut self, trap: Trap) -> RunExit {
        if let Some(va) = trap.tval() {
            self.cpu.badaddr = va;
        }
        eprintln!(
            "rvsim: fatal trap: {trap} (cause {}) pc=0x{:x} badaddr=0x{:x}",
            trap.code(),
            self.cpu.pc(),
            self.cpu.badaddr
        );
        self.emit_exit_stats();
        RunExit::Fault {
            trap,
            pc: self.cpu.pc(),
            badaddr: self.cpu.badaddr,
        }
    }
}
