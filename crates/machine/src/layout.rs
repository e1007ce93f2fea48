//! The fixed physical address layout of the board.
//!
//! Every architectural register, device CSR, and memory range has a fixed
//! physical address, making the whole machine a byte array addressable by
//! 64-bit physical addresses. Addresses not covered by any registered range
//! are empty and fault on access.

/// log2 of the page size.
pub const LOG2_PAGE_SIZE: u32 = 12;

/// Page size in bytes. All range starts and lengths are multiples of this.
pub const PAGE_SIZE: u64 = 1 << LOG2_PAGE_SIZE;

/// Maximum number of physical memory ranges.
pub const PMA_MAX: usize = 32;

/// Start of the shadow range (the board state projection).
pub const SHADOW_START: u64 = 0x0;

/// Length of the shadow range.
pub const SHADOW_LENGTH: u64 = 0x1000;

/// Start of the low-RAM range holding the boot trampoline and the FDT.
pub const ROM_START: u64 = 0x1000;

/// Length of the low-RAM range.
pub const ROM_LENGTH: u64 = 64 << 10;

/// Start of the CLINT range.
pub const CLINT_START: u64 = 0x0200_0000;

/// Length of the CLINT range.
pub const CLINT_LENGTH: u64 = 768 << 10;

/// Start of the HTIF range.
pub const HTIF_START: u64 = 0x4000_8000;

/// Length of the HTIF range (one page; live words at the start).
pub const HTIF_LENGTH: u64 = 0x1000;

/// Start of the main RAM range. Its length comes from the configuration.
pub const RAM_START: u64 = 0x8000_0000;
