#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rvsim_cpu_core::IsaExt;
use rvsim_machine::{LogMask, Machine, MachineConfig, RunExit};

#[derive(Debug, Parser)]
#[command(
    name = "rvsim",
    about = "User-mode RISC-V simulator: runs a static ELF and proxies its syscalls"
)]
struct Args {
    /// ISA extensions (i, ima, imac, imafd, imafdc).
    #[arg(short = 'i', long = "isa", default_value = "imafdc", value_name = "S")]
    isa: String,

    /// Log instructions.
    #[arg(short = 'l', long = "log-instructions")]
    log_instructions: bool,

    /// Log instructions and operand values.
    #[arg(short = 'o', long = "log-operands")]
    log_operands: bool,

    /// Symbolicate addresses in the instruction log.
    #[arg(short = 'S', long = "symbolicate")]
    symbolicate: bool,

    /// Log memory map information.
    #[arg(short = 'm', long = "log-memory-map")]
    log_memory_map: bool,

    /// Log integer registers after each step.
    #[arg(short = 'r', long = "log-registers")]
    log_registers: bool,

    /// Log registers and statistics at exit.
    #[arg(short = 'E', long = "log-exit-stats")]
    log_exit_stats: bool,

    /// Save registers and statistics at exit.
    #[arg(short = 'D', long = "save-exit-stats", value_name = "DIR")]
    save_exit_stats: Option<PathBuf>,

    /// Record program counter usage.
    #[arg(short = 'P', long = "pc-usage-histogram")]
    pc_usage_histogram: bool,

    /// Record register usage.
    #[arg(short = 'R', long = "register-usage-histogram")]
    register_usage_histogram: bool,

    /// Record instruction usage.
    #[arg(short = 'I', long = "instruction-usage-histogram")]
    instruction_usage_histogram: bool,

    /// Enter the debugger CLI on ebreak.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Disable pseudo-instruction disassembly.
    #[arg(short = 'x', long = "no-pseudo")]
    no_pseudo: bool,

    /// Random seed for the initial register state.
    #[arg(short = 's', long = "seed", value_name = "N")]
    seed: Option<u64>,

    /// ELF executable to run.
    elf_file: PathBuf,

    /// Arguments passed through to the guest.
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,
}

fn parse_isa(s: &str) -> Result<IsaExt> {
    Ok(match s {
        "i" => IsaExt::NONE,
        "ima" => IsaExt::IMA,
        "imac" => IsaExt::IMAC,
        "imafd" => IsaExt::IMAFD,
        "imafdc" => IsaExt::IMAFDC,
        other => bail!("unknown ISA extension set '{other}'"),
    })
}

fn log_mask(args: &Args) -> LogMask {
    let mut log = LogMask::NONE;
    if args.log_instructions {
        log.insert(LogMask::INST.union(LogMask::TRAP));
    }
    if args.log_operands {
        log.insert(LogMask::INST.union(LogMask::TRAP).union(LogMask::OPERANDS));
    }
    if args.log_memory_map {
        log.insert(LogMask::MEMORY);
    }
    if args.log_registers {
        log.insert(LogMask::INT_REG);
    }
    if args.log_exit_stats {
        log.insert(LogMask::EXIT_STATS);
    }
    if args.save_exit_stats.is_some() {
        log.insert(LogMask::SAVE_STATS);
    }
    if args.pc_usage_histogram {
        log.insert(LogMask::HIST_PC);
    }
    if args.register_usage_histogram {
        log.insert(LogMask::HIST_REG);
    }
    if args.instruction_usage_histogram {
        log.insert(LogMask::HIST_INST);
    }
    if args.debug {
        log.insert(LogMask::EBREAK_CLI);
    }
    if args.no_pseudo {
        log.insert(LogMask::NO_PSEUDO);
    }
    log
}

fn init_tracing(args: &Args) {
    let default = if args.log_memory_map {
        "warn,memory=debug,rvsim_machine=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> Result<i32> {
    init_tracing(&args);

    let config = MachineConfig {
        ext: parse_isa(&args.isa)?,
        log: log_mask(&args),
        seed: args.seed,
        stats_dir: args.save_exit_stats.clone(),
        symbolicate: args.symbolicate,
        env_allow: vec!["TERM".to_string()],
    };

    let elf = std::fs::read(&args.elf_file)
        .with_context(|| format!("failed to read {}", args.elf_file.display()))?;

    let mut guest_argv = vec![args.elf_file.display().to_string()];
    guest_argv.extend(args.guest_args.iter().cloned());
    let host_env: Vec<(String, String)> = std::env::vars().collect();

    let mut machine = Machine::new(&elf, &guest_argv, &host_env, config)
        .with_context(|| format!("failed to load {}", args.elf_file.display()))?;

    Ok(match machine.run() {
        RunExit::Exited { code } => code,
        RunExit::Fault { .. } => 1,
        RunExit::DebuggerQuit => 0,
    })
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Usage errors exit with 9; --help/--version print and succeed.
            if err.use_stderr() {
                let _ = err.print();
                return ExitCode::from(9);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    match run(args) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("rvsim: {err:#}");
            ExitCode::from(1)
        }
    }
}
