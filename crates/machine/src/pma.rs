//! Physical memory attribute (PMA) entries and the board range table.
//!
//! Each entry describes one range of the target physical address space:
//! where it starts, how long it is, what the target may do with it, and what
//! backs it on the host (an owned buffer, a file mapping, a device, or
//! nothing). The packed `istart`/`ilength` encoding of an entry is itself
//! architectural state: it is projected into the shadow page and hashed into
//! the state tree, and the replay verifier reconstructs entries from those
//! words alone.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;

use crate::error::MachineError;
use crate::layout::{LOG2_PAGE_SIZE, PAGE_SIZE, PMA_MAX};

const ISTART_M_SHIFT: u32 = 0;
const ISTART_IO_SHIFT: u32 = 1;
const ISTART_E_SHIFT: u32 = 2;
const ISTART_R_SHIFT: u32 = 3;
const ISTART_W_SHIFT: u32 = 4;
const ISTART_X_SHIFT: u32 = 5;
const ISTART_IR_SHIFT: u32 = 6;
const ISTART_IW_SHIFT: u32 = 7;
const ISTART_DID_SHIFT: u32 = 8;
const ISTART_DID_MASK: u64 = 0xf << ISTART_DID_SHIFT;

/// Start addresses are page-aligned, so the flag bits live below bit 12.
pub const ISTART_START_MASK: u64 = !(PAGE_SIZE - 1);

/// Driver discriminant of a range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmaDid {
    Memory = 0,
    Shadow = 1,
    Drive = 2,
    Clint = 3,
    Htif = 4,
}

impl PmaDid {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(Self::Memory),
            1 => Some(Self::Shadow),
            2 => Some(Self::Drive),
            3 => Some(Self::Clint),
            4 => Some(Self::Htif),
            _ => None,
        }
    }
}

/// Exactly one of memory, memory-mapped IO, or empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmaCategory {
    Memory,
    Io,
    Empty,
}

/// Permission and classification flags of a range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmaFlags {
    pub r: bool,
    pub w: bool,
    pub x: bool,
    /// Readable by instruction fetch-adjacent paths.
    pub ir: bool,
    /// Writable by instruction fetch-adjacent paths.
    pub iw: bool,
    pub category: PmaCategory,
    pub did: PmaDid,
}

/// Why a packed `istart` word could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IstartError {
    #[error("not exactly one of M/IO/E set")]
    CategoryConflict,

    #[error("invalid DID {0}")]
    InvalidDid(u64),

    #[error("invalid DID {did} for {category}")]
    DidMismatch { did: u64, category: &'static str },
}

impl PmaFlags {
    /// Pack the flags into the low bits of an `istart` word.
    pub fn pack(&self) -> u64 {
        let (m, io, e) = match self.category {
            PmaCategory::Memory => (1u64, 0u64, 0u64),
            PmaCategory::Io => (0, 1, 0),
            PmaCategory::Empty => (0, 0, 1),
        };
        m << ISTART_M_SHIFT
            | io << ISTART_IO_SHIFT
            | e << ISTART_E_SHIFT
            | (self.r as u64) << ISTART_R_SHIFT
            | (self.w as u64) << ISTART_W_SHIFT
            | (self.x as u64) << ISTART_X_SHIFT
            | (self.ir as u64) << ISTART_IR_SHIFT
            | (self.iw as u64) << ISTART_IW_SHIFT
            | ((self.did as u64) << ISTART_DID_SHIFT) & ISTART_DID_MASK
    }
}

/// Split a packed `istart` word into the range start and its flags,
/// validating the category/DID combination.
pub fn split_istart(istart: u64) -> Result<(u64, PmaFlags), IstartError> {
    let bit = |shift: u32| (istart >> shift) & 1 != 0;
    let m = bit(ISTART_M_SHIFT);
    let io = bit(ISTART_IO_SHIFT);
    let e = bit(ISTART_E_SHIFT);
    if (m as u32) + (io as u32) + (e as u32) != 1 {
        return Err(IstartError::CategoryConflict);
    }
    let did_bits = (istart & ISTART_DID_MASK) >> ISTART_DID_SHIFT;
    let did = PmaDid::from_bits(did_bits).ok_or(IstartError::InvalidDid(did_bits))?;
    let category = if m {
        match did {
            PmaDid::Memory | PmaDid::Drive => PmaCategory::Memory,
            _ => return Err(IstartError::DidMismatch { did: did_bits, category: "M" }),
        }
    } else if io {
        match did {
            PmaDid::Shadow | PmaDid::Clint | PmaDid::Htif => PmaCategory::Io,
            _ => return Err(IstartError::DidMismatch { did: did_bits, category: "IO" }),
        }
    } else {
        PmaCategory::Empty
    };
    let flags = PmaFlags {
        r: bit(ISTART_R_SHIFT),
        w: bit(ISTART_W_SHIFT),
        x: bit(ISTART_X_SHIFT),
        ir: bit(ISTART_IR_SHIFT),
        iw: bit(ISTART_IW_SHIFT),
        category,
        did,
    };
    Ok((istart & ISTART_START_MASK, flags))
}

/// The packed istart word of an unregistered (empty) slot: only the E bit.
pub fn empty_istart() -> u64 {
    PmaView::empty().flags.pack()
}

/// Copyable description of a range, enough for the interpreter to resolve an
/// access: where it is, what it permits, and which driver serves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmaView {
    pub start: u64,
    pub length: u64,
    pub flags: PmaFlags,
}

impl PmaView {
    /// Sentinel for addresses no range covers.
    pub fn empty() -> Self {
        Self {
            start: 0,
            length: 0,
            flags: PmaFlags {
                r: false,
                w: false,
                x: false,
                ir: false,
                iw: false,
                category: PmaCategory::Empty,
                did: PmaDid::Memory,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0 || self.flags.category == PmaCategory::Empty
    }

    pub fn is_memory(&self) -> bool {
        self.flags.category == PmaCategory::Memory
    }

    pub fn is_device(&self) -> bool {
        self.flags.category == PmaCategory::Io
    }

    /// True when `[paddr, paddr + size)` lies inside the range.
    pub fn contains(&self, paddr: u64, size: u64) -> bool {
        self.length >= size && paddr >= self.start && paddr - self.start <= self.length - size
    }
}

/// Host bytes backing a memory range.
pub enum MemoryBacking {
    /// Anonymous zero-initialised buffer.
    Owned(Box<[u8]>),
    /// File mapping (shared or copy-on-write).
    Mapped(MmapMut),
}

impl MemoryBacking {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Owned(b) => b,
            Self::Mapped(m) => m,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Owned(b) => b,
            Self::Mapped(m) => m,
        }
    }
}

/// Double-buffered dirty-page bitmap.
///
/// The interpreter marks pages in the active buffer; the tree updater flips
/// the buffers and consumes the previous generation. The buffer swapped in
/// is always zeroed first.
pub struct DirtyBits {
    words: [Vec<u64>; 2],
    active: usize,
}

impl DirtyBits {
    fn new(num_pages: u64) -> Self {
        let len = ((num_pages + 63) / 64) as usize;
        Self {
            words: [vec![0; len], vec![0; len]],
            active: 0,
        }
    }

    #[inline]
    pub fn mark(&mut self, page: u64) {
        self.words[self.active][(page / 64) as usize] |= 1 << (page % 64);
    }

    /// Flip the buffers and return the previous generation.
    pub fn flip(&mut self) -> &[u64] {
        self.active ^= 1;
        for w in &mut self.words[self.active] {
            *w = 0;
        }
        &self.words[self.active ^ 1]
    }

    /// Pages marked in `generation`, as page indices within the range.
    pub fn pages(generation: &[u64]) -> impl Iterator<Item = u64> + '_ {
        generation.iter().enumerate().flat_map(|(i, &word)| {
            (0..64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| i as u64 * 64 + bit)
        })
    }
}

/// A memory range: its bytes plus the dirty-page bitmap.
pub struct MemoryRange {
    backing: MemoryBacking,
    dirty: DirtyBits,
}

impl MemoryRange {
    pub fn bytes(&self) -> &[u8] {
        self.backing.bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.backing.bytes_mut()
    }

    #[inline]
    pub fn mark_dirty(&mut self, offset: u64) {
        self.dirty.mark(offset >> LOG2_PAGE_SIZE);
    }

    pub fn dirty_mut(&mut self) -> &mut DirtyBits {
        &mut self.dirty
    }
}

/// What stands behind a range.
pub enum PmaBody {
    Memory(MemoryRange),
    Device,
    Empty,
}

/// One entry of the board range table.
pub struct PmaEntry {
    start: u64,
    length: u64,
    flags: PmaFlags,
    body: PmaBody,
}

impl PmaEntry {
    /// Anonymous zero-filled RAM, R+W+X.
    pub fn make_ram(start: u64, length: u64) -> Self {
        let backing = MemoryBacking::Owned(vec![0u8; length as usize].into_boxed_slice());
        Self::make_memory(start, length, PmaDid::Memory, backing)
    }

    /// Flash drive mapped from a backing file. The mapping length must equal
    /// the file size; private mappings are copy-on-write.
    pub fn make_flash(
        start: u64,
        length: u64,
        path: &Path,
        shared: bool,
    ) -> Result<Self, MachineError> {
        let file = OpenOptions::new()
            .read(true)
            .write(shared)
            .open(path)
            .map_err(|source| MachineError::BackingOpen {
                path: path.to_owned(),
                source,
            })?;
        let file_len = file
            .metadata()
            .map_err(|source| MachineError::BackingOpen {
                path: path.to_owned(),
                source,
            })?
            .len();
        if file_len != length {
            return Err(MachineError::BackingSizeMismatch {
                path: path.to_owned(),
                file_len,
                length,
            });
        }
        // Safety: the mapping is private to this machine; the single-writer
        // contract for shared mappings is part of the machine API.
        let map = unsafe {
            if shared {
                MmapMut::map_mut(&file)
            } else {
                MmapOptions::new().map_copy(&file)
            }
        }
        .map_err(|source| MachineError::BackingOpen {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self::make_memory(start, length, PmaDid::Drive, MemoryBacking::Mapped(map)))
    }

    fn make_memory(start: u64, length: u64, did: PmaDid, backing: MemoryBacking) -> Self {
        Self {
            start,
            length,
            flags: PmaFlags {
                r: true,
                w: true,
                x: true,
                ir: true,
                iw: true,
                category: PmaCategory::Memory,
                did,
            },
            body: PmaBody::Memory(MemoryRange {
                backing,
                dirty: DirtyBits::new(length >> LOG2_PAGE_SIZE),
            }),
        }
    }

    /// Memory-mapped device range.
    pub fn make_mmio(start: u64, length: u64, did: PmaDid) -> Self {
        Self {
            start,
            length,
            flags: PmaFlags {
                r: true,
                w: true,
                x: false,
                ir: false,
                iw: false,
                category: PmaCategory::Io,
                did,
            },
            body: PmaBody::Device,
        }
    }

    /// The shadow range: reads and writes from the target fail; only the
    /// peek projection exists.
    pub fn make_shadow(start: u64, length: u64) -> Self {
        Self {
            start,
            length,
            flags: PmaFlags {
                r: false,
                w: false,
                x: false,
                ir: false,
                iw: false,
                category: PmaCategory::Io,
                did: PmaDid::Shadow,
            },
            body: PmaBody::Device,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn flags(&self) -> PmaFlags {
        self.flags
    }

    pub fn body(&self) -> &PmaBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut PmaBody {
        &mut self.body
    }

    pub fn memory(&self) -> Option<&MemoryRange> {
        match &self.body {
            PmaBody::Memory(m) => Some(m),
            _ => None,
        }
    }

    pub fn memory_mut(&mut self) -> Option<&mut MemoryRange> {
        match &mut self.body {
            PmaBody::Memory(m) => Some(m),
            _ => None,
        }
    }

    pub fn view(&self) -> PmaView {
        PmaView {
            start: self.start,
            length: self.length,
            flags: self.flags,
        }
    }

    /// The packed shadow word describing this range.
    pub fn istart(&self) -> u64 {
        self.start | self.flags.pack()
    }

    /// The shadow word holding the range length.
    pub fn ilength(&self) -> u64 {
        self.length
    }

    pub fn contains(&self, paddr: u64, size: u64) -> bool {
        self.view().contains(paddr, size)
    }
}

/// Ordered table of board ranges. Lookup is a linear first-match scan; the
/// ranges are disjoint, so first match is the only match.
pub struct PmaTable {
    entries: Vec<PmaEntry>,
}

impl PmaTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(PMA_MAX),
        }
    }

    /// Register a range, enforcing alignment, capacity, device length, and
    /// disjointness.
    pub fn register(&mut self, entry: PmaEntry) -> Result<usize, MachineError> {
        let (start, length) = (entry.start, entry.length);
        if length == 0 || start & (PAGE_SIZE - 1) != 0 || length & (PAGE_SIZE - 1) != 0 {
            return Err(MachineError::UnalignedRange { start, length });
        }
        if entry.flags.category == PmaCategory::Io && length > u32::MAX as u64 {
            return Err(MachineError::DeviceLengthTooBig { length });
        }
        if self.entries.len() >= PMA_MAX {
            return Err(MachineError::TooManyRanges);
        }
        for existing in &self.entries {
            if start < existing.start + existing.length && existing.start < start + length {
                return Err(MachineError::RangeOverlap { start, length });
            }
        }
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }

    /// First (and only) range covering `[paddr, paddr + size)`.
    pub fn find(&self, paddr: u64, size: u64) -> Option<&PmaEntry> {
        self.entries.iter().find(|e| e.contains(paddr, size))
    }

    pub fn find_mut(&mut self, paddr: u64, size: u64) -> Option<&mut PmaEntry> {
        self.entries.iter_mut().find(|e| e.contains(paddr, size))
    }

    pub fn get(&self, i: usize) -> Option<&PmaEntry> {
        self.entries.get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut PmaEntry> {
        self.entries.get_mut(i)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PmaEntry> {
        self.entries.iter()
    }
}

impl Default for PmaTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn istart_round_trips() {
        let entry = PmaEntry::make_ram(0x8000_0000, 0x10000);
        let (start, flags) = split_istart(entry.istart()).unwrap();
        assert_eq!(start, 0x8000_0000);
        assert_eq!(flags, entry.flags());
    }

    #[test]
    fn istart_rejects_category_conflicts() {
        // M and IO both set.
        assert_eq!(split_istart(0b011), Err(IstartError::CategoryConflict));
        // Nothing set.
        assert_eq!(split_istart(0), Err(IstartError::CategoryConflict));
        // Memory with a device DID.
        assert!(matches!(
            split_istart(0b001 | (3 << 8)),
            Err(IstartError::DidMismatch { .. })
        ));
        // DID out of range.
        assert!(matches!(
            split_istart(0b001 | (9 << 8)),
            Err(IstartError::InvalidDid(9))
        ));
    }

    #[test]
    fn table_rejects_overlap() {
        let mut table = PmaTable::new();
        table.register(PmaEntry::make_ram(0x1000, 0x2000)).unwrap();
        let err = table
            .register(PmaEntry::make_ram(0x2000, 0x1000))
            .unwrap_err();
        assert!(matches!(err, MachineError::RangeOverlap { .. }));
        // Adjacent is fine.
        table.register(PmaEntry::make_ram(0x3000, 0x1000)).unwrap();
    }

    #[test]
    fn table_rejects_misalignment() {
        let mut table = PmaTable::new();
        assert!(matches!(
            table.register(PmaEntry::make_ram(0x100, 0x1000)),
            Err(MachineError::UnalignedRange { .. })
        ));
        assert!(matches!(
            table.register(PmaEntry::make_ram(0x1000, 0x800)),
            Err(MachineError::UnalignedRange { .. })
        ));
    }

    #[test]
    fn find_covers_whole_range() {
        let mut table = PmaTable::new();
        table.register(PmaEntry::make_ram(0x1000, 0x2000)).unwrap();
        assert!(table.find(0x1000, 8).is_some());
        assert!(table.find(0x2ff8, 8).is_some());
        assert!(table.find(0x2ffc, 8).is_none());
        assert!(table.find(0x3000, 1).is_none());
        assert!(table.find(0xfff, 1).is_none());
    }

    #[test]
    fn dirty_bits_double_buffer() {
        let mut dirty = DirtyBits::new(128);
        dirty.mark(0);
        dirty.mark(127);
        let gen: Vec<u64> = dirty.flip().to_vec();
        assert_eq!(DirtyBits::pages(&gen).collect::<Vec<_>>(), vec![0, 127]);
        // New generation starts clean.
        let gen: Vec<u64> = dirty.flip().to_vec();
        assert_eq!(DirtyBits::pages(&gen).count(), 0);
    }
}
