//! Minimal interactive debugger, entered on `ebreak` when enabled.

use std::io::{self, BufRead, Write};

use crate::machine::{Machine, RunExit, StepFlow};

pub(crate) enum DebugAction {
    /// Resume free-running execution.
    Continue,
    /// A terminal condition surfaced while single-stepping.
    Exit(RunExit),
    /// The user quit the session.
    Quit,
}

impl Machine {
    /// Line-oriented REPL: continue, step [n], regs, quit.
    pub(crate) fn debugger(&mut self) -> DebugAction {
        eprintln!("rvsim: breakpoint, entering debugger (next pc 0x{:x})", self.cpu.pc());

        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            eprint!("(rvsim) ");
            let _ = io::stderr().flush();
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => return DebugAction::Quit, // EOF
                Ok(_) => {}
                Err(_) => return DebugAction::Quit,
            }

            let mut words = line.split_whitespace();
            match words.next() {
                None => {}
                Some("c") | Some("continue") => return DebugAction::Continue,
                Some("s") | Some("step") => {
                    let n: u64 = words.next().and_then(|w| w.parse().ok()).unwrap_or(1);
                    for _ in 0..n {
                        match self.step_instruction() {
                            StepFlow::Continue => {}
                            StepFlow::Exit(exit) => return DebugAction::Exit(exit),
                            StepFlow::Breakpoint(d) => {
                                // A nested ebreak keeps us in the repl.
                                self.cpu.set_pc(d.pc.wrapping_add(d.len as u64));
                                break;
                            }
                        }
                    }
                    eprintln!("pc 0x{:x}", self.cpu.pc());
                }
                Some("r") | Some("regs") => {
                    let _ = self.dump_registers(&mut io::stderr().lock());
                }
                Some("q") | Some("quit") => return DebugAction::Quit,
                Some(other) => {
                    eprintln!("unknown command '{other}'; commands: c, s [n], r, q");
                }
            }
        }
    }
}
