//! Machine construction, the outer run loop, and the state hash-tree sync.

use stepvm_merkle::{MerkleProof, MerkleTree, MerkleTreeError, PAGE_SIZE};

use crate::boot;
use crate::clint;
use crate::config::MachineConfig;
use crate::error::MachineError;
use crate::htif;
use crate::interp::{interpret, RunBreak};
use crate::layout::{
    CLINT_LENGTH, CLINT_START, HTIF_LENGTH, HTIF_START, RAM_START, ROM_LENGTH, ROM_START,
    SHADOW_LENGTH, SHADOW_START,
};
use crate::native::NativeAccess;
use crate::pma::{DirtyBits, PmaBody, PmaDid, PmaEntry};
use crate::riscv::mip;
use crate::rtc;
use crate::shadow;
use crate::state::MachineState;

/// Why `run` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// mcycle reached the requested bound.
    CycleLimit,
    /// The machine halted permanently.
    Halted,
    /// The machine yielded control back to the host.
    Yielded,
}

/// A deterministic RISC-V 64 machine.
pub struct Machine {
    pub state: MachineState,
    /// Whether the hash tree has been fully synced at least once, enabling
    /// dirty-page refreshes afterwards.
    tree_synced: bool,
}

impl Machine {
    /// Build a machine from its configuration: register the board ranges,
    /// install the boot page, and leave the pc at the trampoline.
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        if config.boot_image.is_empty() {
            return Err(MachineError::NoBootImage);
        }
        if config.boot_image.len() as u64 > config.ram_size {
            return Err(MachineError::BootImageTooBig {
                size: config.boot_image.len(),
                ram_size: config.ram_size,
            });
        }

        let mut state = MachineState::new();
        state.htif_ihalt = 1;
        state.htif_iconsole = (1 << htif::CONSOLE_GETCHAR) | (1 << htif::CONSOLE_PUTCHAR);
        state.htif_iyield = config.htif_iyield;

        state
            .pmas
            .register(PmaEntry::make_ram(RAM_START, config.ram_size))?;
        state
            .pmas
            .register(PmaEntry::make_ram(ROM_START, ROM_LENGTH))?;
        state
            .pmas
            .register(PmaEntry::make_shadow(SHADOW_START, SHADOW_LENGTH))?;
        state
            .pmas
            .register(PmaEntry::make_mmio(CLINT_START, CLINT_LENGTH, PmaDid::Clint))?;
        state
            .pmas
            .register(PmaEntry::make_mmio(HTIF_START, HTIF_LENGTH, PmaDid::Htif))?;
        for flash in &config.flash {
            state.pmas.register(PmaEntry::make_flash(
                flash.start,
                flash.length,
                &flash.backing,
                flash.shared,
            )?)?;
        }

        boot::install_boot_image(&mut state, &config)?;

        tracing::info!(
            ram_size = config.ram_size,
            boot_image_len = config.boot_image.len(),
            flash_drives = config.flash.len(),
            "machine initialized"
        );
        Ok(Self {
            state,
            tree_synced: false,
        })
    }

    /// Run until `mcycle` reaches at most `mcycle_end`, the machine halts,
    /// or it yields. Chunks execution on RTC ticks so the timer interrupt
    /// fires within one tick of its deadline, and skips time while idle.
    pub fn run(&mut self, mcycle_end: u64) -> RunStatus {
        loop {
            if self.state.iflags.h {
                tracing::debug!(mcycle = self.state.mcycle, "machine halted");
                return RunStatus::Halted;
            }
            if self.state.iflags.y {
                return RunStatus::Yielded;
            }
            let mcycle = self.state.mcycle;
            if mcycle >= mcycle_end {
                return RunStatus::CycleLimit;
            }

            // Timer: raise MTIP once the deadline passes; while idle with
            // nothing deliverable, jump straight to the next event instead
            // of burning cycles.
            if self.state.mip & mip::MTIP == 0 {
                let timer_cycles = rtc::time_to_cycles(self.state.clint_mtimecmp);
                if timer_cycles <= mcycle {
                    self.state.set_mip(mip::MTIP);
                } else if self.state.iflags.i && self.state.mip & self.state.mie == 0 {
                    self.state.mcycle = timer_cycles.min(mcycle_end);
                    continue;
                }
            } else if self.state.iflags.i && self.state.mip & self.state.mie == 0 {
                // Idle and the pending interrupt is masked: nothing will
                // wake the hart before the bound.
                self.state.mcycle = mcycle_end;
                continue;
            }

            let tick_end = mcycle + rtc::RTC_FREQ_DIV - mcycle % rtc::RTC_FREQ_DIV;
            let chunk_end = tick_end.min(mcycle_end);
            let mut access = NativeAccess::new(&mut self.state);
            match interpret(&mut access, chunk_end) {
                Ok(RunBreak::Halted) => return RunStatus::Halted,
                Ok(_) => {}
                Err(never) => match never {},
            }
        }
    }

    /// Materialise the page starting at `page_start`, whatever kind of
    /// range covers it. `None` for uncovered (pristine) pages.
    pub fn peek_page(&self, page_start: u64) -> Option<Vec<u8>> {
        peek_page(&self.state, page_start)
    }

    /// Slow word read at an aligned physical address, through the same
    /// projection the hash tree sees.
    pub fn read_word(&self, paddr: u64) -> Option<u64> {
        if paddr & 7 != 0 {
            return None;
        }
        let page = self.peek_page(paddr & !(PAGE_SIZE as u64 - 1))?;
        let offset = (paddr & (PAGE_SIZE as u64 - 1)) as usize;
        Some(u64::from_le_bytes(page[offset..offset + 8].try_into().ok()?))
    }

    /// Host-side write into a memory range (for loading test programs and
    /// host-injected data). Marks the touched pages dirty.
    pub fn write_memory(&mut self, paddr: u64, bytes: &[u8]) -> Result<(), MachineError> {
        let entry = self
            .state
            .pmas
            .find_mut(paddr, bytes.len() as u64)
            .ok_or(MachineError::NotMemory { paddr })?;
        let start = entry.start();
        let memory = entry
            .memory_mut()
            .ok_or(MachineError::NotMemory { paddr })?;
        let offset = (paddr - start) as usize;
        memory.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        for page in (offset as u64 >> 12)..=((offset + bytes.len() - 1) as u64 >> 12) {
            memory.mark_dirty(page << 12);
        }
        Ok(())
    }

    /// Bring `tree` up to date with the machine state: a full hash on the
    /// first sync, dirty pages plus device projections afterwards.
    pub fn update_merkle_tree(&mut self, tree: &mut MerkleTree) -> Result<(), MerkleTreeError> {
        let full = !self.tree_synced;
        for i in 0..self.state.pmas.len() {
            let dirty: Option<Vec<u64>> = self
                .state
                .pmas
                .get_mut(i)
                .and_then(|e| e.memory_mut())
                .map(|m| m.dirty_mut().flip().to_vec());
            let Some(entry) = self.state.pmas.get(i) else {
                continue;
            };
            let (start, length) = (entry.start(), entry.length());
            match (entry.memory(), dirty) {
                (Some(memory), Some(dirty)) => {
                    let bytes = memory.bytes();
                    let mut update = |page: u64| {
                        let offset = (page * PAGE_SIZE as u64) as usize;
                        tree.update_page(start + offset as u64, &bytes[offset..offset + PAGE_SIZE])
                    };
                    if full {
                        for page in 0..length / PAGE_SIZE as u64 {
                            update(page)?;
                        }
                    } else {
                        for page in DirtyBits::pages(&dirty) {
                            update(page)?;
                        }
                    }
                }
                _ => {
                    // Device projections are tiny; refresh them every sync.
                    for page_start in device_pages(start, length) {
                        if let Some(page) = peek_page(&self.state, page_start) {
                            tree.update_page(page_start, &page)?;
                        }
                    }
                }
            }
        }
        self.tree_synced = true;
        Ok(())
    }

    /// Proof for the node of size `2^log2_size` at `address`, against the
    /// current content of `tree`.
    pub fn get_proof(
        &self,
        tree: &MerkleTree,
        address: u64,
        log2_size: u32,
    ) -> Result<MerkleProof, MerkleTreeError> {
        let page = self.peek_page(address & !(PAGE_SIZE as u64 - 1));
        tree.get_proof(page.as_deref(), address, log2_size)
    }
}

/// Pages of a device range that can hold nonzero state.
fn device_pages(start: u64, length: u64) -> Vec<u64> {
    if start == CLINT_START {
        vec![CLINT_START + (clint::CLINT_MTIMECMP_REL_ADDR & !(PAGE_SIZE as u64 - 1))]
    } else {
        // Shadow and HTIF keep everything in their first page.
        let _ = length;
        vec![start]
    }
}

/// Materialise the page starting at `page_start` from whatever range covers
/// it: raw bytes for memory, the projection for devices.
pub fn peek_page(s: &MachineState, page_start: u64) -> Option<Vec<u8>> {
    debug_assert_eq!(page_start & (PAGE_SIZE as u64 - 1), 0);
    let entry = s.pmas.find(page_start, PAGE_SIZE as u64)?;
    let rel = page_start - entry.start();
    match entry.body() {
        PmaBody::Memory(m) => {
            Some(m.bytes()[rel as usize..rel as usize + PAGE_SIZE].to_vec())
        }
        PmaBody::Device => match entry.flags().did {
            PmaDid::Shadow => shadow::shadow_peek(s, rel).map(|p| p.to_vec()),
            PmaDid::Clint => clint::clint_peek(s, rel).map(|p| p.to_vec()),
            PmaDid::Htif => htif::htif_peek(s, rel).map(|p| p.to_vec()),
            _ => None,
        },
        PmaBody::Empty => None,
    }
}
