//! The ABI-proxy machine: guest image loading, stack construction, the
//! system-call proxy and the run loop that drives the interpreter.

pub mod bus;
pub mod debug;
pub mod hist;
pub mod loader;
pub mod machine;
pub mod seed;
pub mod stack;
pub mod sys;

pub use bus::MmuBus;
pub use loader::{LoadError, LoadedImage};
pub use machine::{LogMask, Machine, MachineConfig, RunExit};
