//! stepvm-machine: a deterministic RISC-V 64 machine.
//!
//! This crate provides:
//! - The fixed physical address layout and the PMA range table
//! - The architectural state container and its shadow projection
//! - The CLINT and HTIF devices
//! - The state-access capability surface with its native implementation
//! - An RV64IMA interpreter generic over that surface
//! - Machine construction (boot page, FDT) and the outer run loop
//!
//! The companion crates add the state hash tree (`stepvm-merkle`) and the
//! step logger / replay verifier (`stepvm-replay`).

pub mod access;
pub mod asm;
pub mod boot;
pub mod clint;
pub mod config;
pub mod decode;
pub mod error;
pub mod fdt;
pub mod htif;
pub mod interp;
pub mod layout;
pub mod machine;
pub mod native;
pub mod pma;
pub mod riscv;
pub mod rtc;
pub mod shadow;
pub mod state;

pub use access::{BracketType, MemoryWord, StateAccess};
pub use config::{FlashConfig, MachineConfig};
pub use error::MachineError;
pub use interp::{interpret, RunBreak};
pub use machine::{Machine, RunStatus};
pub use native::NativeAccess;
pub use state::MachineState;
