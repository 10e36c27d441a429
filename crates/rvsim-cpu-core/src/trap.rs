use core::fmt;

use memory::MemoryError;

/// Trap reported back to the run loop by the interpreter.
///
/// Fault variants carry the offending virtual address so the run loop can
/// record it in `badaddr` before acting; nothing else about architectural
/// state has changed when one of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    MisalignedFetch { vaddr: u64 },
    FetchFault { vaddr: u64 },
    IllegalInstruction { raw: u32 },
    Breakpoint,
    MisalignedLoad { vaddr: u64 },
    LoadFault { vaddr: u64 },
    MisalignedStore { vaddr: u64 },
    StoreFault { vaddr: u64 },
    /// Environment call (`ecall`) from U/S/M mode.
    EcallFromU,
    EcallFromS,
    EcallFromM,
}

impl Trap {
    /// RISC-V exception cause code.
    pub fn code(&self) -> u64 {
        match self {
            Trap::MisalignedFetch { .. } => 0,
            Trap::FetchFault { .. } => 1,
            Trap::IllegalInstruction { .. } => 2,
            Trap::Breakpoint => 3,
            Trap::MisalignedLoad { .. } => 4,
            Trap::LoadFault { .. } => 5,
            Trap::MisalignedStore { .. } => 6,
            Trap::StoreFault { .. } => 7,
            Trap::EcallFromU => 8,
            Trap::EcallFromS => 9,
            Trap::EcallFromM => 11,
        }
    }

    /// The faulting address, for the traps that have one.
    pub fn tval(&self) -> Option<u64> {
        match *self {
            Trap::MisalignedFetch { vaddr }
            | Trap::FetchFault { vaddr }
            | Trap::MisalignedLoad { vaddr }
            | Trap::LoadFault { vaddr }
            | Trap::MisalignedStore { vaddr }
            | Trap::StoreFault { vaddr } => Some(vaddr),
            _ => None,
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::MisalignedFetch { vaddr } => write!(f, "misaligned fetch at 0x{vaddr:x}"),
            Trap::FetchFault { vaddr } => write!(f, "fetch fault at 0x{vaddr:x}"),
            Trap::IllegalInstruction { raw } => write!(f, "illegal instruction 0x{raw:08x}"),
            Trap::Breakpoint => write!(f, "breakpoint"),
            Trap::MisalignedLoad { vaddr } => write!(f, "misaligned load at 0x{vaddr:x}"),
            Trap::LoadFault { vaddr } => write!(f, "load fault at 0x{vaddr:x}"),
            Trap::MisalignedStore { vaddr } => write!(f, "misaligned store at 0x{vaddr:x}"),
            Trap::StoreFault { vaddr } => write!(f, "store fault at 0x{vaddr:x}"),
            Trap::EcallFromU => write!(f, "environment call from U-mode"),
            Trap::EcallFromS => write!(f, "environment call from S-mode"),
            Trap::EcallFromM => write!(f, "environment call from M-mode"),
        }
    }
}

impl std::error::Error for Trap {}

impl From<MemoryError> for Trap {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::MisalignedFetch { vaddr } => Trap::MisalignedFetch { vaddr },
            MemoryError::MisalignedLoad { vaddr } => Trap::MisalignedLoad { vaddr },
            MemoryError::MisalignedStore { vaddr } => Trap::MisalignedStore { vaddr },
            MemoryError::FetchFault { vaddr } => Trap::FetchFault { vaddr },
            MemoryError::LoadFault { vaddr } => Trap::LoadFault { vaddr },
            MemoryError::StoreFault { vaddr } => Trap::StoreFault { vaddr },
        }
    }
}
