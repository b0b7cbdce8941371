//! Full-system RISC-V virtual machine core
//!
//! Executes unmodified RV64/RV32 IMAFDC guest software (firmware, kernels)
//! with Machine/Supervisor/User privilege and SV32/39/48/57 paging. Cold
//! code runs through a complete interpreter; hot straight-line traces are
//! compiled to host machine code by a tracing JIT with per-architecture
//! backends, a shared bump-allocated code heap and dirty-page based
//! invalidation, so self-modifying guests stay correct.
//!
//! The embedder supplies devices through MMIO handlers and the interrupt
//! controller, loads images with `ram_write`, and runs each [`Hart`] on
//! its own thread:
//!
//! ```no_run
//! use rvmach::{Machine, MachineConfig, spawn_harts};
//!
//! let (machine, harts) = Machine::new(MachineConfig::default()).unwrap();
//! machine.ram_write(0x8000_0000, &firmware_bytes()).unwrap();
//! let threads = spawn_harts(harts);
//! # fn firmware_bytes() -> Vec<u8> { vec![] }
//! # let _ = threads;
//! ```

pub mod cpu;
pub mod jit;
pub mod machine;
pub mod memory;

pub use cpu::{Hart, PrivilegeLevel, RunState, Trap, Xlen};
pub use machine::{
    spawn_harts, AmoOp, HartRequest, InterruptController, Machine, MachineConfig,
};
pub use memory::{BusError, MmioHandler};
