//! Machine construction and host-facing errors.
//!
//! Target-visible faults (unmapped addresses, permission violations,
//! misaligned accesses) never appear here: they become RISC-V exceptions
//! inside the interpreter and stay in the guest.

use std::path::PathBuf;

use thiserror::Error;

use crate::layout::PMA_MAX;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("no boot image")]
    NoBootImage,

    #[error("boot image too big ({size} bytes vs {ram_size} bytes of RAM)")]
    BootImageTooBig { size: usize, ram_size: u64 },

    #[error("boot data does not fit in low RAM")]
    BootRomOverflow,

    #[error("physical range {start:#x}:{length:#x} is not page-aligned")]
    UnalignedRange { start: u64, length: u64 },

    #[error("physical range {start:#x}:{length:#x} overlaps an existing range")]
    RangeOverlap { start: u64, length: u64 },

    #[error("too many physical ranges (max {PMA_MAX})")]
    TooManyRanges,

    #[error("device range length {length:#x} does not fit in 32 bits")]
    DeviceLengthTooBig { length: u64 },

    #[error("backing file {path} is {file_len} bytes, expected {length}")]
    BackingSizeMismatch {
        path: PathBuf,
        file_len: u64,
        length: u64,
    },

    #[error("could not open backing file {path}: {source}")]
    BackingOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("address {paddr:#x} is not backed by memory")]
    NotMemory { paddr: u64 },
}
